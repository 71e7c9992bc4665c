use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Answerer, CollaboratorError, Evaluator, ExpirationChecker, JobSource, SiteAdapter};
use crate::profile::Profile;
use crate::state_machine::{Application, ApplicationForm, FormField, Job, JobDraft, Review};

const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

#[derive(Serialize)]
struct DiscoverRequest {
    count: usize,
}

#[derive(Deserialize)]
struct DiscoverResponse {
    jobs: Vec<JobDraft>,
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    job: &'a Job,
    profile: &'a Profile,
}

#[derive(Serialize)]
struct AnswerRequest<'a> {
    field: &'a FormField,
    job: &'a Job,
    application: &'a Application,
    profile: &'a Profile,
}

#[derive(Deserialize)]
struct AnswerResponse {
    answer: String,
}

#[derive(Serialize)]
struct JobRequest<'a> {
    job: &'a Job,
}

#[derive(Deserialize)]
struct ExpiredResponse {
    expired: bool,
}

#[derive(Deserialize)]
struct ScrapeResponse {
    fields: Vec<FormField>,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    application: &'a Application,
    form: &'a ApplicationForm,
    job: &'a Job,
}

#[derive(Deserialize)]
struct SubmitResponse {
    submitted: bool,
}

/// JSON-over-HTTP client for the collaborator service.
///
/// One instance serves discovery, evaluation, answering and expiration
/// checks; [`HttpCollaborator::site`] hands out per-domain site adapters
/// sharing the same connection pool.
#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    client: Client,
    base_url: String,
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Site adapter for `domain`, served by `/sites/{domain}/…`.
    pub fn site(&self, domain: impl Into<String>) -> RemoteSite {
        RemoteSite {
            http: self.clone(),
            domain: domain.into(),
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(DEFAULT_RETRY_AFTER_MS);
            return Err(CollaboratorError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            let status = status.as_u16();
            return Err(if (500..600).contains(&status) {
                CollaboratorError::Server { status, message }
            } else {
                CollaboratorError::Rejected { status, message }
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| CollaboratorError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl JobSource for HttpCollaborator {
    async fn discover_jobs(&self, count: usize) -> Result<Vec<JobDraft>, CollaboratorError> {
        let response: DiscoverResponse = self.post("/discover", &DiscoverRequest { count }).await?;
        Ok(response.jobs)
    }
}

#[async_trait]
impl Evaluator for HttpCollaborator {
    async fn evaluate(&self, job: &Job, profile: &Profile) -> Result<Review, CollaboratorError> {
        self.post("/evaluate", &EvaluateRequest { job, profile }).await
    }
}

#[async_trait]
impl Answerer for HttpCollaborator {
    async fn answer_field(
        &self,
        field: &FormField,
        job: &Job,
        application: &Application,
        profile: &Profile,
    ) -> Result<String, CollaboratorError> {
        let request = AnswerRequest {
            field,
            job,
            application,
            profile,
        };
        let response: AnswerResponse = self.post("/answer", &request).await?;
        Ok(response.answer)
    }
}

#[async_trait]
impl ExpirationChecker for HttpCollaborator {
    async fn is_expired(&self, job: &Job) -> Result<bool, CollaboratorError> {
        let response: ExpiredResponse = self.post("/expired", &JobRequest { job }).await?;
        Ok(response.expired)
    }
}

/// Site adapter that delegates to the collaborator service.
#[derive(Debug, Clone)]
pub struct RemoteSite {
    http: HttpCollaborator,
    domain: String,
}

#[async_trait]
impl SiteAdapter for RemoteSite {
    async fn scrape_form(&self, job: &Job) -> Result<Vec<FormField>, CollaboratorError> {
        let path = format!("/sites/{}/scrape", self.domain);
        let response: ScrapeResponse = self.http.post(&path, &JobRequest { job }).await?;
        Ok(response.fields)
    }

    async fn submit_form(
        &self,
        application: &Application,
        form: &ApplicationForm,
        job: &Job,
    ) -> Result<bool, CollaboratorError> {
        let path = format!("/sites/{}/submit", self.domain);
        let request = SubmitRequest {
            application,
            form,
            job,
        };
        let response: SubmitResponse = self.http.post(&path, &request).await?;
        Ok(response.submitted)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::state_machine::{ApplicationStatus, Classification, FormState, JobState};
    use crate::testing::{job, job_with_application, profile};

    async fn client(server: &MockServer) -> HttpCollaborator {
        HttpCollaborator::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn evaluate_decodes_review() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/evaluate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "classification": "target",
                "rationale": "strong Rust background"
            })))
            .mount(&server)
            .await;

        let review = client(&server)
            .await
            .evaluate(&job(JobState::Pending), &profile())
            .await
            .unwrap();
        assert_eq!(review.classification, Classification::Target);
        assert_eq!(review.rationale, "strong Rust background");
    }

    #[tokio::test]
    async fn discover_sends_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discover"))
            .and(body_partial_json(json!({ "count": 2 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobs": [
                    { "external_id": "li-1", "title": "Rust Engineer", "company": "Acme" },
                    { "external_id": "li-2", "title": "Platform Engineer", "company": "Initech",
                      "listing_url": "https://www.linkedin.com/jobs/view/2" }
                ]
            })))
            .mount(&server)
            .await;

        let drafts = client(&server).await.discover_jobs(2).await.unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].listing_url.as_deref(), Some("https://www.linkedin.com/jobs/view/2"));
    }

    #[tokio::test]
    async fn site_routes_by_domain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sites/jobs.ashbyhq.com/scrape"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fields": [
                    { "question": "Email" },
                    { "question": "Work mode", "multiple_choice": true, "choices": ["remote", "hybrid"] }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sites/jobs.ashbyhq.com/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "submitted": true })))
            .mount(&server)
            .await;

        let site = client(&server).await.site("jobs.ashbyhq.com");
        let subject = job_with_application(JobState::Approved, ApplicationStatus::Ready, FormState::Approved);
        let fields = site.scrape_form(&subject.job).await.unwrap();
        assert_eq!(fields.len(), 2);
        assert!(fields[1].multiple_choice);

        let submitted = site
            .submit_form(
                subject.application.as_ref().unwrap(),
                subject.form.as_ref().unwrap(),
                &subject.job,
            )
            .await
            .unwrap();
        assert!(submitted);
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/expired"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .is_expired(&job(JobState::Approved))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::RateLimited { retry_after_ms: 3000 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn status_codes_classify() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/evaluate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/expired"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such job"))
            .mount(&server)
            .await;

        let http = client(&server).await;
        let err = http.evaluate(&job(JobState::Pending), &profile()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Server { status: 503, .. }));
        assert!(err.is_transient());

        let err = http.is_expired(&job(JobState::Pending)).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected { status: 404, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn undecodable_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/answer"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let subject = job_with_application(JobState::Approved, ApplicationStatus::Started, FormState::Scraped);
        let err = client(&server)
            .await
            .answer_field(
                &FormField::text("Why Acme?"),
                &subject.job,
                subject.application.as_ref().unwrap(),
                &profile(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::MalformedResponse(_)));
        assert!(!err.is_transient());
    }
}
