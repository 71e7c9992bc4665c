//! The claim protocol every stage runs under:
//!
//! 1. acquire the stage's claim with one atomic conditional update;
//! 2. reload the subject and skip if the work is already done;
//! 3. run the stage work while holding the claim;
//! 4. commit the mutation and clear the claim together, or release the claim
//!    and report the failure. A failed commit never repeats step 3.
//!
//! Nothing outside the store is touched before step 3, so a lost race or a
//! redelivered task has no side effects.

use std::fmt;
use std::future::Future;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{FailureKind, StageFailure, StoreError};
use crate::retry::{RetryPolicy, with_backoff};
use crate::state_machine::{Stage, Subject};
use crate::store::{Claim, ClaimStore, Mutation};

/// How a single stage execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The work ran and its mutation was committed.
    Committed,
    /// Another worker holds the claim.
    SkippedContention,
    /// The guard does not hold, or the work was already done.
    SkippedPrecondition,
    /// The work failed and the claim was released.
    Failed(StageFailure),
}

impl StageOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            StageOutcome::SkippedContention | StageOutcome::SkippedPrecondition
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Committed => "committed",
            StageOutcome::SkippedContention => "skipped (claimed elsewhere)",
            StageOutcome::SkippedPrecondition => "skipped (nothing to do)",
            StageOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Failed(failure) => write!(f, "failed: {failure}"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Run `work` under `stage`'s claim on `entity_id`.
///
/// `Ok` carries a committed or skipped outcome. `Err` carries the failure of
/// the work or of the store; by then the claim has been released.
///
/// Once `work` has returned a mutation, a transient commit error is retried
/// under `commit_retry` while the claim is still held. If the commit never
/// goes through, the failure is permanent so that callers do not repeat the
/// work.
pub async fn run_claimed<S, F, Fut>(
    store: &S,
    commit_retry: &RetryPolicy,
    stage: Stage,
    entity_id: Uuid,
    work: F,
) -> Result<StageOutcome, StageFailure>
where
    S: ClaimStore + ?Sized,
    F: FnOnce(Subject) -> Fut,
    Fut: Future<Output = Result<Mutation, StageFailure>>,
{
    let store_failure = |e: StoreError| StageFailure::from_store(stage, entity_id, &e);

    let Some(claim) = store
        .try_claim(stage, entity_id)
        .await
        .map_err(store_failure)?
    else {
        return not_acquired(store, stage, entity_id).await;
    };
    tracing::debug!(%entity_id, %stage, "claim acquired");

    let subject = match store.subject(stage, entity_id).await {
        Ok(subject) => subject,
        Err(e) => {
            release_quietly(store, &claim).await;
            return Err(store_failure(e));
        }
    };
    if stage.already_done(&subject) {
        release_quietly(store, &claim).await;
        tracing::info!(%entity_id, %stage, "already done, claim released");
        return Ok(StageOutcome::SkippedPrecondition);
    }

    let mutation = match work(subject).await {
        Ok(mutation) => mutation,
        Err(failure) => {
            release_quietly(store, &claim).await;
            tracing::warn!(
                %entity_id,
                %stage,
                kind = %failure.kind,
                error = %failure.message,
                "stage work failed, claim released"
            );
            return Err(failure);
        }
    };

    // The work has had its side effects: from here on only the commit is retried.
    let committed = with_backoff(commit_retry, StoreError::is_transient, |_| {
        store.commit(&claim, mutation.clone())
    })
    .await;
    if let Err(e) = committed {
        // A commit whose reply was lost may still have landed.
        let landed = store
            .subject(stage, entity_id)
            .await
            .is_ok_and(|subject| stage.already_done(&subject));
        if landed {
            tracing::info!(%entity_id, %stage, "commit found applied after error");
            return Ok(StageOutcome::Committed);
        }
        release_quietly(store, &claim).await;
        tracing::error!(%entity_id, %stage, error = %e, "stage work done but commit failed");
        return Err(StageFailure::new(
            stage,
            entity_id,
            FailureKind::Permanent,
            format!("stage work done but commit failed: {e}"),
        ));
    }
    tracing::info!(%entity_id, %stage, "committed");
    Ok(StageOutcome::Committed)
}

/// Tell contention apart from a failed guard once `try_claim` came back empty.
async fn not_acquired<S>(store: &S, stage: Stage, entity_id: Uuid) -> Result<StageOutcome, StageFailure>
where
    S: ClaimStore + ?Sized,
{
    match store.subject(stage, entity_id).await {
        Ok(subject) if stage.admits(&subject) => {
            tracing::debug!(%entity_id, %stage, "claim held elsewhere");
            Ok(StageOutcome::SkippedContention)
        }
        Ok(_) | Err(StoreError::NotFound { .. }) => {
            tracing::debug!(%entity_id, %stage, "guard does not hold");
            Ok(StageOutcome::SkippedPrecondition)
        }
        Err(e) => Err(StageFailure::from_store(stage, entity_id, &e)),
    }
}

async fn release_quietly<S>(store: &S, claim: &Claim)
where
    S: ClaimStore + ?Sized,
{
    if let Err(e) = store.release(claim).await {
        tracing::warn!(
            entity_id = %claim.entity_id,
            stage = %claim.stage,
            error = %e,
            "failed to release claim"
        );
    }
}
