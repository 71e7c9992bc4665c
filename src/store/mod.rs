//! Claim Store Adapter: the narrow interface the claim protocol needs from
//! the backing store.
//!
//! Every primitive is a single atomic operation against the store:
//!
//! - [`ClaimStore::try_claim`] sets a stage's claim flag only if it is clear
//!   *and* the stage guard holds, in the same conditional update.
//! - [`ClaimStore::commit`] applies the stage's [`Mutation`] and clears the
//!   flag together.
//! - [`ClaimStore::release`] clears the flag and nothing else.
//!
//! Commit and release are fenced by the claim token, so only the current
//! holder can resolve a claim.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureKind, StageFailure, StoreError};
use crate::state_machine::{
    Application, ApplicationForm, ApplicationStatus, FormField, Job, JobDraft, Review, Stage,
    Subject,
};

/// Proof of a successfully acquired claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub stage: Stage,
    pub entity_id: Uuid,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// What a successful stage writes when it clears its claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Job: PENDING → REVIEWED with the review attached.
    Reviewed(Review),
    /// Job: upsert the application and attach a freshly scraped form.
    ApplicationCreated { url: String, fields: Vec<FormField> },
    /// Job: → EXPIRED.
    Expired,
    /// Form: SCRAPED → PREPARED with answered fields.
    Prepared(Vec<FormField>),
    /// Application: READY → SUBMITTED.
    Submitted { at: DateTime<Utc> },
    /// Clear the claim, change nothing else.
    Unchanged,
}

impl Mutation {
    /// Whether this mutation may resolve a claim for `stage`.
    pub fn fits(&self, stage: Stage) -> bool {
        matches!(
            (self, stage),
            (Mutation::Unchanged, _)
                | (Mutation::Reviewed(_), Stage::Review)
                | (Mutation::ApplicationCreated { .. }, Stage::CreateApp)
                | (Mutation::Expired, Stage::ExpirationCheck)
                | (Mutation::Prepared(_), Stage::Prepare)
                | (Mutation::Submitted { .. }, Stage::Submit)
        )
    }
}

/// Narrows a sweep beyond the stage guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibleFilter {
    pub limit: Option<usize>,
    /// Only entities created before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Jobs only: require a listing url.
    pub require_listing_url: bool,
    /// Jobs only: require the job to be APPROVED, not merely reviewed.
    pub approved_only: bool,
    /// Jobs only: skip jobs whose application form has already been scraped.
    pub without_form: bool,
}

/// An entity a sweep may dispatch, with the url its site adapter is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: Uuid,
    pub url: Option<String>,
}

/// Outcome of inserting discovered jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: Vec<Uuid>,
    pub duplicates: usize,
}

/// A persisted hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl From<&StageFailure> for FailureRecord {
    fn from(failure: &StageFailure) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: failure.entity_id,
            stage: failure.stage,
            kind: failure.kind,
            message: failure.message.clone(),
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Atomically set `stage`'s claim flag on `entity_id` if it is clear and
    /// the stage guard holds. `None` means contention or a failed guard.
    async fn try_claim(&self, stage: Stage, entity_id: Uuid) -> Result<Option<Claim>, StoreError>;

    /// Apply `mutation` and clear the claim in one atomic write.
    async fn commit(&self, claim: &Claim, mutation: Mutation) -> Result<(), StoreError>;

    /// Clear the claim without changing state.
    async fn release(&self, claim: &Claim) -> Result<(), StoreError>;

    /// Load the job chain a stage operates on, keyed by the stage's entity.
    async fn subject(&self, stage: Stage, entity_id: Uuid) -> Result<Subject, StoreError>;

    /// Entities whose guard holds and whose claim flag is clear, oldest first.
    async fn eligible(&self, stage: Stage, filter: &EligibleFilter) -> Result<Vec<Candidate>, StoreError>;

    /// Release claims acquired before `older_than`. Returns how many were freed.
    async fn release_stale(&self, stage: Stage, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Insert new jobs, skipping drafts whose natural key is already stored.
    async fn insert_jobs(&self, drafts: Vec<JobDraft>) -> Result<InsertReport, StoreError>;

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn application(&self, id: Uuid) -> Result<Option<Application>, StoreError>;

    async fn application_for_job(&self, job_id: Uuid) -> Result<Option<Application>, StoreError>;

    async fn form(&self, id: Uuid) -> Result<Option<ApplicationForm>, StoreError>;

    async fn form_for_application(&self, application_id: Uuid) -> Result<Option<ApplicationForm>, StoreError>;

    async fn failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StoreError>;

    /// REVIEWED → APPROVED. `false` if the job was not reviewed.
    async fn approve_job(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Any non-terminal state → DISCARDED. `false` if already terminal.
    async fn discard_job(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Form PREPARED → APPROVED and its application STARTED → READY, together.
    async fn approve_form(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn discard_form(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Record post-submission progress. Forward-only, from SUBMITTED onwards.
    async fn advance_application(&self, id: Uuid, status: ApplicationStatus) -> Result<bool, StoreError>;

    async fn record_failure(&self, failure: &StageFailure) -> Result<(), StoreError>;
}
