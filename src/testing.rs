//! Fixtures and in-process collaborators shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::collaborator::{
    Answerer, CollaboratorError, Evaluator, ExpirationChecker, JobSource, SiteAdapter, SiteRegistry,
};
use crate::dispatcher::Collaborators;
use crate::error::{StageFailure, StoreError};
use crate::profile::Profile;
use crate::retry::RetryPolicy;
use crate::state_machine::{
    Application, ApplicationForm, ApplicationStatus, Classification, FormField, FormState, Job,
    JobDraft, JobState, Review, Stage, Subject,
};
use crate::store::{
    Candidate, Claim, ClaimStore, EligibleFilter, FailureRecord, InsertReport, MemoryStore, Mutation,
};

pub fn draft(external_id: &str) -> JobDraft {
    JobDraft {
        external_id: external_id.to_string(),
        title: "Rust Engineer".into(),
        company: "Acme".into(),
        location: Some("London".into()),
        min_salary: None,
        max_salary: None,
        employment_type: Some("full-time".into()),
        date_posted: None,
        description: Some("Build reliable backend services in Rust.".into()),
        listing_url: Some("https://www.linkedin.com/jobs/view/1".into()),
        direct_url: None,
    }
}

fn review() -> Review {
    Review {
        classification: Classification::Target,
        rationale: "strong overlap with the profile".into(),
    }
}

/// A job in `state`, reviewed when the state implies it.
pub fn job(state: JobState) -> Job {
    let mut job = Job::from_draft(draft(&format!("li-{}", Uuid::new_v4())));
    job.state = state;
    if job.is_reviewed() {
        job.review = Some(review());
    }
    job
}

fn form_fields() -> Vec<FormField> {
    vec![
        FormField::text("Email"),
        FormField::text("LinkedIn profile"),
        FormField::text("Why do you want to work at Acme?"),
    ]
}

/// A job with an application and a linked form in the given states.
pub fn job_with_application(state: JobState, status: ApplicationStatus, form_state: FormState) -> Subject {
    let job = job(state);
    let mut application = Application::started(job.id, "https://jobs.ashbyhq.com/acme/1");
    application.status = status;
    if application.is_submitted() {
        application.submitted_at = Some(Utc::now());
    }

    let mut form = ApplicationForm::scraped(application.id, form_fields());
    form.state = form_state;
    if form.is_prepared() {
        for field in &mut form.fields {
            field.answer = Some(format!("answer: {}", field.question));
        }
    }
    application.form_id = Some(form.id);

    Subject {
        job,
        application: Some(application),
        form: Some(form),
    }
}

pub fn profile() -> Profile {
    Profile {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: "ada@example.com".into(),
        linkedin_url: Some("https://www.linkedin.com/in/ada".into()),
        current_location: Some("London".into()),
        ..Profile::default()
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter: false,
    }
}

fn unavailable() -> CollaboratorError {
    CollaboratorError::Server {
        status: 503,
        message: "unavailable".into(),
    }
}

/// Fails its first `failures` calls with a transient error.
#[derive(Default)]
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl Flaky {
    fn call(&self) -> Result<(), CollaboratorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures { Err(unavailable()) } else { Ok(()) }
    }
}

#[derive(Default)]
pub struct MockSource {
    drafts: Vec<JobDraft>,
    failures: usize,
    pub calls: AtomicUsize,
}

impl MockSource {
    pub fn flaky(drafts: Vec<JobDraft>, failures: usize) -> Self {
        Self {
            drafts,
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobSource for MockSource {
    async fn discover_jobs(&self, count: usize) -> Result<Vec<JobDraft>, CollaboratorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(unavailable());
        }
        Ok(self.drafts.iter().take(count).cloned().collect())
    }
}

#[derive(Default)]
pub struct MockEvaluator {
    delay: Duration,
    flaky: Flaky,
    rate_limit_ms: Option<u64>,
    pub calls: AtomicUsize,
}

impl MockEvaluator {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn flaky(failures: usize) -> Self {
        Self {
            flaky: Flaky {
                failures,
                ..Flaky::default()
            },
            ..Self::default()
        }
    }

    /// Always answers 429 with the given retry-after.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            rate_limit_ms: Some(retry_after_ms),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Evaluator for MockEvaluator {
    async fn evaluate(&self, _job: &Job, _profile: &Profile) -> Result<Review, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if let Some(retry_after_ms) = self.rate_limit_ms {
            return Err(CollaboratorError::RateLimited { retry_after_ms });
        }
        self.flaky.call()?;
        Ok(review())
    }
}

pub struct MockSite {
    confirm: bool,
    delay: Duration,
    pub scrapes: AtomicUsize,
    pub submits: AtomicUsize,
}

impl MockSite {
    fn new(confirm: bool, delay: Duration) -> Self {
        Self {
            confirm,
            delay,
            scrapes: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(true, Duration::ZERO)
    }

    pub fn declining() -> Self {
        Self::new(false, Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Self {
        Self::new(true, delay)
    }
}

#[async_trait]
impl SiteAdapter for MockSite {
    async fn scrape_form(&self, _job: &Job) -> Result<Vec<FormField>, CollaboratorError> {
        self.scrapes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(form_fields())
    }

    async fn submit_form(
        &self,
        _application: &Application,
        _form: &ApplicationForm,
        _job: &Job,
    ) -> Result<bool, CollaboratorError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.confirm)
    }
}

#[derive(Default)]
pub struct MockAnswerer {
    asked: Mutex<Vec<String>>,
}

impl MockAnswerer {
    pub fn questions(&self) -> Vec<String> {
        self.asked.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Answerer for MockAnswerer {
    async fn answer_field(
        &self,
        field: &FormField,
        _job: &Job,
        _application: &Application,
        _profile: &Profile,
    ) -> Result<String, CollaboratorError> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(field.question.clone());
        }
        Ok(format!("answer: {}", field.question))
    }
}

pub struct MockExpiration {
    pub expired: bool,
}

#[async_trait]
impl ExpirationChecker for MockExpiration {
    async fn is_expired(&self, _job: &Job) -> Result<bool, CollaboratorError> {
        Ok(self.expired)
    }
}

/// In-process collaborators that always succeed.
pub fn collaborators() -> Collaborators {
    Collaborators {
        source: Arc::new(MockSource::default()),
        evaluator: Arc::new(MockEvaluator::default()),
        answerer: Arc::new(MockAnswerer::default()),
        expiration: Arc::new(MockExpiration { expired: false }),
        sites: SiteRegistry::new()
            .with("jobs.ashbyhq.com", Arc::new(MockSite::accepting()))
            .with("www.linkedin.com", Arc::new(MockSite::accepting())),
    }
}

/// A [`MemoryStore`] whose first commits fail with a connectivity error.
///
/// With `lands` set, a failing commit is still applied before the error is
/// returned, as when the reply to a successful write is lost.
pub struct FlakyCommit {
    pub inner: MemoryStore,
    failures: AtomicUsize,
    lands: bool,
    pub commits: AtomicUsize,
}

impl FlakyCommit {
    pub fn failing(inner: MemoryStore, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            lands: false,
            commits: AtomicUsize::new(0),
        }
    }

    pub fn lost_reply(inner: MemoryStore) -> Self {
        Self {
            lands: true,
            ..Self::failing(inner, 1)
        }
    }
}

#[async_trait]
impl ClaimStore for FlakyCommit {
    async fn try_claim(&self, stage: Stage, entity_id: Uuid) -> Result<Option<Claim>, StoreError> {
        self.inner.try_claim(stage, entity_id).await
    }

    async fn commit(&self, claim: &Claim, mutation: Mutation) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !fail {
            return self.inner.commit(claim, mutation).await;
        }
        if self.lands {
            self.inner.commit(claim, mutation).await?;
        }
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        self.inner.release(claim).await
    }

    async fn subject(&self, stage: Stage, entity_id: Uuid) -> Result<Subject, StoreError> {
        self.inner.subject(stage, entity_id).await
    }

    async fn eligible(&self, stage: Stage, filter: &EligibleFilter) -> Result<Vec<Candidate>, StoreError> {
        self.inner.eligible(stage, filter).await
    }

    async fn release_stale(&self, stage: Stage, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.release_stale(stage, older_than).await
    }

    async fn insert_jobs(&self, drafts: Vec<JobDraft>) -> Result<InsertReport, StoreError> {
        self.inner.insert_jobs(drafts).await
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.job(id).await
    }

    async fn application(&self, id: Uuid) -> Result<Option<Application>, StoreError> {
        self.inner.application(id).await
    }

    async fn application_for_job(&self, job_id: Uuid) -> Result<Option<Application>, StoreError> {
        self.inner.application_for_job(job_id).await
    }

    async fn form(&self, id: Uuid) -> Result<Option<ApplicationForm>, StoreError> {
        self.inner.form(id).await
    }

    async fn form_for_application(&self, application_id: Uuid) -> Result<Option<ApplicationForm>, StoreError> {
        self.inner.form_for_application(application_id).await
    }

    async fn failures(&self, limit: usize) -> Result<Vec<FailureRecord>, StoreError> {
        self.inner.failures(limit).await
    }

    async fn approve_job(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.approve_job(id).await
    }

    async fn discard_job(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.discard_job(id).await
    }

    async fn approve_form(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.approve_form(id).await
    }

    async fn discard_form(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.discard_form(id).await
    }

    async fn advance_application(&self, id: Uuid, status: ApplicationStatus) -> Result<bool, StoreError> {
        self.inner.advance_application(id, status).await
    }

    async fn record_failure(&self, failure: &StageFailure) -> Result<(), StoreError> {
        self.inner.record_failure(failure).await
    }
}
