use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::ClaimHold;
use super::state::{ApplicationStatus, FormState};

/// One question on an application form and, once prepared, its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub question: String,
    #[serde(default)]
    pub multiple_choice: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default)]
    pub answer: Option<String>,
}

impl FormField {
    pub fn text(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            multiple_choice: false,
            choices: Vec::new(),
            answer: None,
        }
    }
}

/// The scraped questions for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationForm {
    pub id: Uuid,
    pub application_id: Uuid,
    pub state: FormState,
    pub fields: Vec<FormField>,
    pub prepare_claim: Option<ClaimHold>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationForm {
    pub fn scraped(application_id: Uuid, fields: Vec<FormField>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            application_id,
            state: FormState::Scraped,
            fields,
            prepare_claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_prepare(&self) -> bool {
        self.state == FormState::Scraped
    }

    pub fn is_prepared(&self) -> bool {
        self.state >= FormState::Prepared
    }

    /// The answer recorded for `question`, if the question is on the form.
    pub fn find_answer(&self, question: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.question == question)
            .and_then(|f| f.answer.as_deref())
    }

    pub fn questions(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.question.as_str()).collect()
    }
}

/// An application to one job. Outlives its form and may exist before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub job_id: Uuid,
    pub form_id: Option<Uuid>,
    pub url: String,
    pub referred: bool,
    pub status: ApplicationStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submission_claim: Option<ClaimHold>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn started(job_id: Uuid, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            form_id: None,
            url: url.into(),
            referred: false,
            status: ApplicationStatus::Started,
            submitted_at: None,
            submission_claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Submission needs both a ready application and an approved form.
    pub fn can_submit(&self, form_state: Option<FormState>) -> bool {
        self.status == ApplicationStatus::Ready && form_state == Some(FormState::Approved)
    }

    pub fn is_submitted(&self) -> bool {
        self.status >= ApplicationStatus::Submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scraped_form_is_preparable() {
        let form = ApplicationForm::scraped(Uuid::new_v4(), vec![FormField::text("Email")]);
        assert_eq!(form.state, FormState::Scraped);
        assert!(form.can_prepare());
        assert!(!form.is_prepared());
        assert_eq!(form.questions(), vec!["Email"]);
    }

    #[test]
    fn find_answer_matches_exact_question() {
        let mut form = ApplicationForm::scraped(Uuid::new_v4(), vec![FormField::text("Email")]);
        assert_eq!(form.find_answer("Email"), None);
        form.fields[0].answer = Some("ada@example.com".into());
        assert_eq!(form.find_answer("Email"), Some("ada@example.com"));
        assert_eq!(form.find_answer("Phone"), None);
    }

    #[test]
    fn submit_guard_needs_ready_and_approved_form() {
        let mut app = Application::started(Uuid::new_v4(), "https://jobs.ashbyhq.com/acme/1");
        assert!(!app.can_submit(Some(FormState::Approved)));
        app.status = ApplicationStatus::Ready;
        assert!(!app.can_submit(Some(FormState::Prepared)));
        assert!(!app.can_submit(None));
        assert!(app.can_submit(Some(FormState::Approved)));
        app.status = ApplicationStatus::Submitted;
        assert!(app.is_submitted());
        assert!(!app.can_submit(Some(FormState::Approved)));
    }

    #[test]
    fn empty_choices_are_not_serialized() {
        let json = serde_json::to_string(&FormField::text("Name")).unwrap();
        assert!(!json.contains("choices"));
        let parsed: FormField = serde_json::from_str(r#"{"question":"Name"}"#).unwrap();
        assert_eq!(parsed, FormField::text("Name"));
    }
}
