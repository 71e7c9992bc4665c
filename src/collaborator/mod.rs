//! Contracts of the external collaborators the pipeline stages call.
//!
//! Every call may be slow and may fail. Failures come back as a
//! [`CollaboratorError`], which knows whether it is worth retrying.

mod http;
mod registry;

pub use http::{HttpCollaborator, RemoteSite};
pub use registry::{SiteRegistry, clean_url, site_domain};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::FailureKind;
use crate::profile::Profile;
use crate::state_machine::{Application, ApplicationForm, FormField, Job, JobDraft, Review};

/// Errors a collaborator call can end in.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// HTTP 429. `retry_after_ms` is the server's hint, if it gave one.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// HTTP 5xx.
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// Any other non-success status.
    #[error("request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unsupported site: {0}")]
    UnsupportedSite(String),

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("submission not confirmed")]
    NotConfirmed,
}

impl CollaboratorError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CollaboratorError::RateLimited { .. }
            | CollaboratorError::Server { .. }
            | CollaboratorError::Network(_)
            | CollaboratorError::Timeout { .. } => FailureKind::Transient,
            CollaboratorError::Rejected { .. }
            | CollaboratorError::MalformedResponse(_)
            | CollaboratorError::UnsupportedSite(_)
            | CollaboratorError::MissingData(_)
            | CollaboratorError::NotConfirmed => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// The wait the remote side asked for before the next attempt.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            CollaboratorError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Supplies freshly discovered job postings.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn discover_jobs(&self, count: usize) -> Result<Vec<JobDraft>, CollaboratorError>;
}

/// Scores a job against the candidate profile.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, job: &Job, profile: &Profile) -> Result<Review, CollaboratorError>;
}

/// Talks to one applicant-tracking site: reads its form and submits it.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    async fn scrape_form(&self, job: &Job) -> Result<Vec<FormField>, CollaboratorError>;

    /// `Ok(false)` means the site did not confirm the submission.
    async fn submit_form(
        &self,
        application: &Application,
        form: &ApplicationForm,
        job: &Job,
    ) -> Result<bool, CollaboratorError>;
}

/// Answers the form questions the profile cannot answer directly.
#[async_trait]
pub trait Answerer: Send + Sync {
    async fn answer_field(
        &self,
        field: &FormField,
        job: &Job,
        application: &Application,
        profile: &Profile,
    ) -> Result<String, CollaboratorError>;
}

/// Checks whether a posting has been taken down.
#[async_trait]
pub trait ExpirationChecker: Send + Sync {
    async fn is_expired(&self, job: &Job) -> Result<bool, CollaboratorError>;
}
