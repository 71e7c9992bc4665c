use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Candidate, Claim, ClaimStore, EligibleFilter, FailureRecord, InsertReport, Mutation};
use crate::error::{StageFailure, StoreError};
use crate::state_machine::{
    Application, ApplicationForm, ApplicationStatus, ClaimHold, EntityKind, FormField, FormState,
    Job, JobDraft, JobState, Lifecycle, Stage, Subject,
};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    applications: HashMap<Uuid, Application>,
    forms: HashMap<Uuid, ApplicationForm>,
    failures: Vec<FailureRecord>,
}

/// In-process claim store. Every primitive runs under a single lock
/// acquisition, which makes each one atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job chain as-is, bypassing discovery. Used to import
    /// existing records and to set up fixtures.
    pub async fn insert_subject(&self, subject: Subject) {
        let mut tables = self.tables.lock().await;
        if let Some(app) = subject.application {
            tables.applications.insert(app.id, app);
        }
        if let Some(form) = subject.form {
            tables.forms.insert(form.id, form);
        }
        tables.jobs.insert(subject.job.id, subject.job);
    }
}

fn advance<S: Lifecycle>(id: Uuid, state: &mut S, next: S) -> Result<(), StoreError> {
    if !state.can_advance_to(next) {
        return Err(StoreError::IllegalTransition {
            id,
            from: state.to_string(),
            to: next.to_string(),
        });
    }
    *state = next;
    Ok(())
}

impl Tables {
    fn application_for_job(&self, job_id: Uuid) -> Option<&Application> {
        self.applications.values().find(|a| a.job_id == job_id)
    }

    fn form_for(&self, app: &Application) -> Option<&ApplicationForm> {
        app.form_id.and_then(|id| self.forms.get(&id))
    }

    fn subject(&self, stage: Stage, id: Uuid) -> Result<Subject, StoreError> {
        let kind = stage.entity();
        let not_found = || StoreError::NotFound { kind, id };
        let (job_id, application) = match kind {
            EntityKind::Job => (id, self.application_for_job(id)),
            EntityKind::ApplicationForm => {
                let form = self.forms.get(&id).ok_or_else(not_found)?;
                let app = self
                    .applications
                    .get(&form.application_id)
                    .ok_or_else(|| StoreError::Corrupt(format!("form {id} has no application")))?;
                (app.job_id, Some(app))
            }
            EntityKind::Application => {
                let app = self.applications.get(&id).ok_or_else(not_found)?;
                (app.job_id, Some(app))
            }
        };
        let job = match self.jobs.get(&job_id) {
            Some(job) => job.clone(),
            None if kind == EntityKind::Job => return Err(not_found()),
            None => return Err(StoreError::Corrupt(format!("{kind} {id} has no job"))),
        };
        Ok(Subject {
            job,
            form: application.and_then(|a| self.form_for(a)).cloned(),
            application: application.cloned(),
        })
    }

    fn hold_mut(&mut self, stage: Stage, id: Uuid) -> Result<&mut Option<ClaimHold>, StoreError> {
        let missing = StoreError::NotFound {
            kind: stage.entity(),
            id,
        };
        Ok(match stage {
            Stage::Review => &mut self.jobs.get_mut(&id).ok_or(missing)?.review_claim,
            Stage::CreateApp => &mut self.jobs.get_mut(&id).ok_or(missing)?.create_app_claim,
            Stage::ExpirationCheck => {
                &mut self.jobs.get_mut(&id).ok_or(missing)?.expiration_check_claim
            }
            Stage::Prepare => &mut self.forms.get_mut(&id).ok_or(missing)?.prepare_claim,
            Stage::Submit => {
                &mut self.applications.get_mut(&id).ok_or(missing)?.submission_claim
            }
        })
    }

    /// The claim slot, if `claim` still holds it.
    fn fenced(&mut self, claim: &Claim) -> Result<&mut Option<ClaimHold>, StoreError> {
        let hold = self.hold_mut(claim.stage, claim.entity_id)?;
        if matches!(*hold, Some(h) if h.token == claim.token) {
            Ok(hold)
        } else {
            Err(StoreError::ClaimLost {
                stage: claim.stage,
                id: claim.entity_id,
            })
        }
    }

    fn ids(&self, kind: EntityKind) -> Vec<(Uuid, DateTime<Utc>)> {
        match kind {
            EntityKind::Job => self.jobs.values().map(|j| (j.id, j.created_at)).collect(),
            EntityKind::ApplicationForm => {
                self.forms.values().map(|f| (f.id, f.created_at)).collect()
            }
            EntityKind::Application => self
                .applications
                .values()
                .map(|a| (a.id, a.created_at))
                .collect(),
        }
    }

    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::NotFound {
            kind: EntityKind::Job,
            id,
        })
    }

    fn apply(&mut self, id: Uuid, mutation: Mutation) -> Result<(), StoreError> {
        let now = Utc::now();
        match mutation {
            Mutation::Unchanged => {}
            Mutation::Reviewed(review) => {
                let job = self.job_mut(id)?;
                advance(id, &mut job.state, JobState::Reviewed)?;
                job.review = Some(review);
                job.updated_at = now;
            }
            Mutation::Expired => {
                let job = self.job_mut(id)?;
                advance(id, &mut job.state, JobState::Expired)?;
                job.updated_at = now;
            }
            Mutation::ApplicationCreated { url, fields } => self.attach_form(id, url, fields)?,
            Mutation::Prepared(fields) => {
                let form = self.forms.get_mut(&id).ok_or(StoreError::NotFound {
                    kind: EntityKind::ApplicationForm,
                    id,
                })?;
                advance(id, &mut form.state, FormState::Prepared)?;
                form.fields = fields;
                form.updated_at = now;
            }
            Mutation::Submitted { at } => {
                let app = self.applications.get_mut(&id).ok_or(StoreError::NotFound {
                    kind: EntityKind::Application,
                    id,
                })?;
                advance(id, &mut app.status, ApplicationStatus::Submitted)?;
                app.submitted_at = Some(at);
                app.updated_at = now;
            }
        }
        Ok(())
    }

    /// Upsert the job's application and give it a scraped form.
    fn attach_form(&mut self, job_id: Uuid, url: String, fields: Vec<FormField>) -> Result<(), StoreError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound {
                kind: EntityKind::Job,
                id: job_id,
            });
        }
        let existing = self.application_for_job(job_id).map(|a| (a.id, a.form_id));
        let created_form = existing
            .and_then(|(_, form_id)| form_id)
            .and_then(|form_id| self.forms.get(&form_id));
        if let Some(form) = created_form {
            if form.state != FormState::Created {
                return Err(StoreError::IllegalTransition {
                    id: form.id,
                    from: form.state.to_string(),
                    to: FormState::Scraped.to_string(),
                });
            }
        }

        let now = Utc::now();
        let app_id = match existing {
            Some((app_id, _)) => {
                if let Some(app) = self.applications.get_mut(&app_id) {
                    app.url = url;
                    app.updated_at = now;
                }
                app_id
            }
            None => {
                let app = Application::started(job_id, url);
                let app_id = app.id;
                self.applications.insert(app_id, app);
                app_id
            }
        };

        match existing.and_then(|(_, form_id)| form_id) {
            Some(form_id) if self.forms.contains_key(&form_id) => {
                if let Some(form) = self.forms.get_mut(&form_id) {
                    form.state = FormState::Scraped;
                    form.fields = fields;
                    form.updated_at = now;
                }
            }
            _ => {
                let form = ApplicationForm::scraped(app_id, fields);
                let form_id = form.id;
                self.forms.insert(form_id, form);
                if let Some(app) = self.applications.get_mut(&app_id) {
                    app.form_id = Some(form_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn try_claim(&self, stage: Stage, entity_id: Uuid) -> Result<Option<Claim>, StoreError> {
        let mut tables = self.tables.lock().await;
        let subject = match tables.subject(stage, entity_id) {
            Ok(subject) => subject,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if subject.claim(stage).is_some() || !stage.admits(&subject) {
            return Ok(None);
        }
        let claim = Claim {
            stage,
            entity_id,
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        *tables.hold_mut(stage, entity_id)? = Some(ClaimHold {
            token: claim.token,
            claimed_at: claim.acquired_at,
        });
        Ok(Some(claim))
    }

    async fn commit(&self, claim: &Claim, mutation: Mutation) -> Result<(), StoreError> {
        if !mutation.fits(claim.stage) {
            return Err(StoreError::MutationMismatch { stage: claim.stage });
        }
        let mut tables = self.tables.lock().await;
        tables.fenced(claim)?;
        tables.apply(claim.entity_id, mutation)?;
        *tables.fenced(claim)? = None;
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        *tables.fenced(claim)? = None;
        Ok(())
    }

    async fn subject(&self, stage: Stage, entity_id: Uuid) -> Result<Subject, StoreError> {
        self.tables.lock().await.subject(stage, entity_id)
    }

    async fn eligible(&self, stage: Stage, filter: &EligibleFilter) -> Result<Vec<Candidate>, StoreError> {
        let tables = self.tables.lock().await;
        let on_job = stage.entity() == EntityKind::Job;
        let mut found = Vec::new();
        for (id, created_at) in tables.ids(stage.entity()) {
            let Ok(subject) = tables.subject(stage, id) else {
                continue;
            };
            if subject.claim(stage).is_some() || !stage.admits(&subject) {
                continue;
            }
            if filter.created_before.is_some_and(|before| created_at >= before) {
                continue;
            }
            if on_job && filter.require_listing_url && subject.job.listing_url.is_none() {
                continue;
            }
            if on_job && filter.approved_only && subject.job.state != JobState::Approved {
                continue;
            }
            if on_job && filter.without_form && Stage::CreateApp.already_done(&subject) {
                continue;
            }
            let url = if on_job {
                subject.job.application_url().map(str::to_string)
            } else {
                subject.application.map(|a| a.url)
            };
            found.push((created_at, Candidate { id, url }));
        }
        found.sort_by_key(|(created_at, _)| *created_at);
        let mut candidates: Vec<Candidate> = found.into_iter().map(|(_, c)| c).collect();
        if let Some(limit) = filter.limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    async fn release_stale(&self, stage: Stage, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut freed = 0;
        let ids = tables.ids(stage.entity());
        for (id, _) in ids {
            let hold = tables.hold_mut(stage, id)?;
            if hold.is_some_and(|h| h.claimed_at < older_than) {
                *hold = None;
                freed += 1;
            }
        }
        Ok(freed)
    }

    async fn insert_jobs(&self, drafts: Vec<JobDraft>) -> Result<InsertReport, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut report = InsertReport::default();
        for draft in drafts {
            if tables.jobs.values().any(|j| j.external_id == draft.external_id) {
                report.duplicates += 1;
                continue;
            }
            let job = Job::from_draft(draft);
            report.inserted.push(job.id);
            tables.jobs.insert(job.id, job);
        }
        Ok(report)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn application(&self, id: Uuid) -> Result<Option<Application>, StoreError> {
        Ok(self.tables.lock().await.applications.get(&id).cloned())
    }

    async fn application_for_job(&self, job_id: Uuid) -> Result<Option<Application>, StoreError> {
        Ok(self.tables.lock().await.application_for_job(job_id).cloned())
    }

    async fn form(&self, id: Uuid) -> Result<Option<ApplicationForm>, StoreError> {
        Ok(self.tables.lock().await.forms.get(&id).cloned())
    }

    async fn form_for_application(&self, application_id: Uuid) -> Result<Option<ApplicationForm>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .applications
            .get(&application_id)
            .and_then(|a| tables.form_for(a))
            .cloned())
    }

    async fn failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.failures.iter().rev().take(limit).cloned().collect())
    }

    async fn approve_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let job = tables.job_mut(id)?;
        if job.has_claims() {
            return Err(StoreError::Busy {
                kind: EntityKind::Job,
                id,
            });
        }
        if job.state != JobState::Reviewed {
            return Ok(false);
        }
        job.state = JobState::Approved;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn discard_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let job = tables.job_mut(id)?;
        if job.has_claims() {
            return Err(StoreError::Busy {
                kind: EntityKind::Job,
                id,
            });
        }
        if !job.state.can_advance_to(JobState::Discarded) {
            return Ok(false);
        }
        job.state = JobState::Discarded;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn approve_form(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let form = tables.forms.get(&id).ok_or(StoreError::NotFound {
            kind: EntityKind::ApplicationForm,
            id,
        })?;
        let app = tables
            .applications
            .get(&form.application_id)
            .ok_or_else(|| StoreError::Corrupt(format!("form {id} has no application")))?;
        if form.prepare_claim.is_some() || app.submission_claim.is_some() {
            return Err(StoreError::Busy {
                kind: EntityKind::ApplicationForm,
                id,
            });
        }
        let promotable = matches!(
            app.status,
            ApplicationStatus::Started | ApplicationStatus::Ready
        );
        if form.state != FormState::Prepared || !promotable {
            return Ok(false);
        }

        let app_id = app.id;
        let now = Utc::now();
        if let Some(form) = tables.forms.get_mut(&id) {
            form.state = FormState::Approved;
            form.updated_at = now;
        }
        if let Some(app) = tables.applications.get_mut(&app_id) {
            app.status = ApplicationStatus::Ready;
            app.updated_at = now;
        }
        Ok(true)
    }

    async fn discard_form(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let form = tables.forms.get_mut(&id).ok_or(StoreError::NotFound {
            kind: EntityKind::ApplicationForm,
            id,
        })?;
        if form.prepare_claim.is_some() {
            return Err(StoreError::Busy {
                kind: EntityKind::ApplicationForm,
                id,
            });
        }
        if !form.state.can_advance_to(FormState::Discarded) {
            return Ok(false);
        }
        form.state = FormState::Discarded;
        form.updated_at = Utc::now();
        Ok(true)
    }

    async fn advance_application(&self, id: Uuid, status: ApplicationStatus) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let app = tables.applications.get_mut(&id).ok_or(StoreError::NotFound {
            kind: EntityKind::Application,
            id,
        })?;
        if app.submission_claim.is_some() {
            return Err(StoreError::Busy {
                kind: EntityKind::Application,
                id,
            });
        }
        if !(app.status >= ApplicationStatus::Submitted) || !app.status.can_advance_to(status) {
            return Ok(false);
        }
        app.status = status;
        app.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_failure(&self, failure: &StageFailure) -> Result<(), StoreError> {
        self.tables.lock().await.failures.push(FailureRecord::from(failure));
        Ok(())
    }
}
