use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::{EntityKind, Stage};

/// Top-level error of pipeline operations that span layers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] crate::collaborator::CollaboratorError),

    #[error("Stage failed: {0}")]
    Stage(#[from] StageFailure),
}

/// Failures raised by a [`ClaimStore`](crate::store::ClaimStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    /// The claim token no longer matches: the claim was released or reclaimed.
    #[error("claim for {stage} on {id} is no longer held")]
    ClaimLost { stage: Stage, id: Uuid },

    #[error("illegal transition on {id}: {from} -> {to}")]
    IllegalTransition { id: Uuid, from: String, to: String },

    #[error("mutation does not belong to stage {stage}")]
    MutationMismatch { stage: Stage },

    /// Refused because a claim on the entity is currently held.
    #[error("{kind} {id} has a claim in flight")]
    Busy { kind: EntityKind, id: Uuid },

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Connectivity problems are worth retrying; everything else is a logic outcome.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StoreError::Database(_) => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// Classifies a stage failure for retry logic decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Infrastructure failure (timeout, rate limit, network error, 5xx, store connectivity).
    Transient,
    /// Logic/data failure (unsupported site, malformed response, missing data).
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// A failed stage execution, reported with the entity and stage it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("{stage} failed for {entity_id} ({kind}): {message}")]
pub struct StageFailure {
    pub entity_id: Uuid,
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    /// Minimum wait before a retry, when the collaborator asked for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl StageFailure {
    pub fn new(stage: Stage, entity_id: Uuid, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            entity_id,
            stage,
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    pub fn from_store(stage: Stage, entity_id: Uuid, err: &StoreError) -> Self {
        Self::new(stage, entity_id, err.failure_kind(), err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_display() {
        let id = Uuid::nil();
        let failure = StageFailure::new(Stage::Submit, id, FailureKind::Permanent, "unsupported site");
        assert_eq!(
            failure.to_string(),
            format!("submit failed for {id} (permanent): unsupported site")
        );
    }

    #[test]
    fn store_errors_classify() {
        let lost = StoreError::ClaimLost {
            stage: Stage::Review,
            id: Uuid::nil(),
        };
        assert_eq!(lost.failure_kind(), FailureKind::Permanent);

        let db = StoreError::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(db.failure_kind(), FailureKind::Transient);
        assert!(StageFailure::from_store(Stage::Review, Uuid::nil(), &db).is_transient());
    }
}
