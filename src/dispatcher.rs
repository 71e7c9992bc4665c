//! Runs one `(stage, entity)` task: the stage's business logic under the
//! claim protocol, with a hard timeout on the external step and retries for
//! transient failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::claim::{StageOutcome, run_claimed};
use crate::collaborator::{
    Answerer, CollaboratorError, Evaluator, ExpirationChecker, JobSource, SiteRegistry, clean_url,
};
use crate::error::StageFailure;
use crate::profile::Profile;
use crate::retry::{RetryPolicy, with_backoff_after};
use crate::state_machine::{FormField, Stage, Subject};
use crate::store::{ClaimStore, Mutation};

/// A unit of work: run `stage` on the entity `entity_id`.
///
/// Tasks carry no state of their own, so delivering one twice is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub stage: Stage,
    pub entity_id: Uuid,
}

impl Task {
    pub fn new(stage: Stage, entity_id: Uuid) -> Self {
        Self { stage, entity_id }
    }
}

/// The external services the stages call.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn JobSource>,
    pub evaluator: Arc<dyn Evaluator>,
    pub answerer: Arc<dyn Answerer>,
    pub expiration: Arc<dyn ExpirationChecker>,
    pub sites: SiteRegistry,
}

pub struct Dispatcher<S: ClaimStore + ?Sized> {
    store: Arc<S>,
    collaborators: Collaborators,
    profile: Arc<Profile>,
    retry: RetryPolicy,
    stage_timeout: Duration,
}

impl<S: ClaimStore + ?Sized> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        collaborators: Collaborators,
        profile: Arc<Profile>,
        retry: RetryPolicy,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collaborators,
            profile,
            retry,
            stage_timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `task` to an outcome. Transient failures are retried with backoff;
    /// a failure that survives the retries is logged and recorded.
    pub async fn dispatch(&self, task: Task) -> StageOutcome {
        let result = with_backoff_after(
            &self.retry,
            StageFailure::is_transient,
            |failure: &StageFailure| failure.retry_after_ms,
            |attempt| {
                tracing::debug!(entity_id = %task.entity_id, stage = %task.stage, attempt, "dispatching");
                run_claimed(
                    self.store.as_ref(),
                    &self.retry,
                    task.stage,
                    task.entity_id,
                    move |subject| self.execute(task, subject),
                )
            },
        )
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                tracing::error!(
                    entity_id = %failure.entity_id,
                    stage = %failure.stage,
                    kind = %failure.kind,
                    error = %failure.message,
                    "stage failed"
                );
                if let Err(e) = self.store.record_failure(&failure).await {
                    tracing::warn!(error = %e, "failed to record stage failure");
                }
                StageOutcome::Failed(failure)
            }
        }
    }

    /// The stage work proper, bounded by the stage timeout.
    async fn execute(&self, task: Task, subject: Subject) -> Result<Mutation, StageFailure> {
        let work = async {
            match task.stage {
                Stage::Review => self.review(&subject).await,
                Stage::CreateApp => self.create_app(&subject).await,
                Stage::ExpirationCheck => self.check_expiration(&subject).await,
                Stage::Prepare => self.prepare(&subject).await,
                Stage::Submit => self.submit(&subject).await,
            }
        };
        let error = match tokio::time::timeout(self.stage_timeout, work).await {
            Ok(Ok(mutation)) => return Ok(mutation),
            Ok(Err(e)) => e,
            Err(_) => CollaboratorError::Timeout {
                ms: u64::try_from(self.stage_timeout.as_millis()).unwrap_or(u64::MAX),
            },
        };
        Err(StageFailure::new(
            task.stage,
            task.entity_id,
            error.failure_kind(),
            error.to_string(),
        )
        .with_retry_after(error.retry_after_ms()))
    }

    async fn review(&self, subject: &Subject) -> Result<Mutation, CollaboratorError> {
        let review = self
            .collaborators
            .evaluator
            .evaluate(&subject.job, &self.profile)
            .await?;
        tracing::info!(
            job_id = %subject.job.id,
            classification = %review.classification,
            "job reviewed"
        );
        Ok(Mutation::Reviewed(review))
    }

    async fn create_app(&self, subject: &Subject) -> Result<Mutation, CollaboratorError> {
        let job = &subject.job;
        let url = job
            .application_url()
            .ok_or_else(|| CollaboratorError::MissingData(format!("job {} has no url", job.id)))?;
        let site = self.collaborators.sites.resolve(url)?;
        let fields = site.scrape_form(job).await?;
        tracing::info!(job_id = %job.id, fields = fields.len(), "application form scraped");
        Ok(Mutation::ApplicationCreated {
            url: clean_url(url),
            fields,
        })
    }

    async fn check_expiration(&self, subject: &Subject) -> Result<Mutation, CollaboratorError> {
        if self.collaborators.expiration.is_expired(&subject.job).await? {
            tracing::info!(job_id = %subject.job.id, "job expired");
            Ok(Mutation::Expired)
        } else {
            Ok(Mutation::Unchanged)
        }
    }

    async fn prepare(&self, subject: &Subject) -> Result<Mutation, CollaboratorError> {
        let (Some(application), Some(form)) = (&subject.application, &subject.form) else {
            return Err(CollaboratorError::MissingData(
                "form has no application".into(),
            ));
        };

        let mut answered: Vec<FormField> = Vec::with_capacity(form.fields.len());
        for field in &form.fields {
            let answer = match self.profile.common_answer(&field.question) {
                Some(answer) => answer,
                None => {
                    self.collaborators
                        .answerer
                        .answer_field(field, &subject.job, application, &self.profile)
                        .await?
                }
            };
            answered.push(FormField {
                answer: Some(answer),
                ..field.clone()
            });
        }
        tracing::info!(form_id = %form.id, fields = answered.len(), "form prepared");
        Ok(Mutation::Prepared(answered))
    }

    async fn submit(&self, subject: &Subject) -> Result<Mutation, CollaboratorError> {
        let (Some(application), Some(form)) = (&subject.application, &subject.form) else {
            return Err(CollaboratorError::MissingData(
                "application has no form".into(),
            ));
        };
        let site = self.collaborators.sites.resolve(&application.url)?;
        if !site.submit_form(application, form, &subject.job).await? {
            return Err(CollaboratorError::NotConfirmed);
        }
        tracing::info!(application_id = %application.id, "application submitted");
        Ok(Mutation::Submitted { at: Utc::now() })
    }
}
