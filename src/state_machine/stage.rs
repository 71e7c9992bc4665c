use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::application::{Application, ApplicationForm};
use super::job::{ClaimHold, Job};
use super::state::{FormState, JobState};

/// The three kinds of entity a claim can be held on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Job,
    ApplicationForm,
    Application,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Job => write!(f, "job"),
            EntityKind::ApplicationForm => write!(f, "application form"),
            EntityKind::Application => write!(f, "application"),
        }
    }
}

/// One step of the pipeline. Each stage owns exactly one claim flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Review,
    CreateApp,
    ExpirationCheck,
    Prepare,
    Submit,
}

impl Stage {
    /// Pipeline order, used by full sweeps.
    pub const ALL: [Stage; 5] = [
        Stage::Review,
        Stage::CreateApp,
        Stage::Prepare,
        Stage::Submit,
        Stage::ExpirationCheck,
    ];

    /// The entity the stage's claim flag lives on.
    pub fn entity(self) -> EntityKind {
        match self {
            Stage::Review | Stage::CreateApp | Stage::ExpirationCheck => EntityKind::Job,
            Stage::Prepare => EntityKind::ApplicationForm,
            Stage::Submit => EntityKind::Application,
        }
    }

    /// Name of the claim flag guarding the stage.
    pub fn flag(self) -> &'static str {
        match self {
            Stage::Review => "review_claim",
            Stage::CreateApp => "create_app_claim",
            Stage::ExpirationCheck => "expiration_check_claim",
            Stage::Prepare => "prepare_claim",
            Stage::Submit => "submission_claim",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Review => "review",
            Stage::CreateApp => "create_app",
            Stage::ExpirationCheck => "expiration_check",
            Stage::Prepare => "prepare",
            Stage::Submit => "submit",
        }
    }

    /// Guard predicate: may the stage's claim be acquired on this subject?
    pub fn admits(self, subject: &Subject) -> bool {
        match self {
            Stage::Review => subject.job.can_review(),
            Stage::CreateApp => subject.job.can_create_app(),
            Stage::ExpirationCheck => subject.job.can_check_expiration(),
            Stage::Prepare => subject.form.as_ref().is_some_and(|f| f.can_prepare()),
            Stage::Submit => subject
                .application
                .as_ref()
                .is_some_and(|a| a.can_submit(subject.form.as_ref().map(|f| f.state))),
        }
    }

    /// Whether the stage's work has already been done for this subject.
    ///
    /// Checked after acquiring the claim so that a redelivered task never
    /// repeats a side-effecting call.
    pub fn already_done(self, subject: &Subject) -> bool {
        match self {
            Stage::Review => subject.job.is_reviewed(),
            Stage::CreateApp => subject
                .form
                .as_ref()
                .is_some_and(|f| f.state != FormState::Created),
            Stage::ExpirationCheck => subject.job.state == JobState::Expired,
            Stage::Prepare => subject.form.as_ref().is_some_and(|f| f.is_prepared()),
            Stage::Submit => subject.application.as_ref().is_some_and(|a| a.is_submitted()),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "review" => Ok(Stage::Review),
            "create_app" => Ok(Stage::CreateApp),
            "expiration_check" => Ok(Stage::ExpirationCheck),
            "prepare" => Ok(Stage::Prepare),
            "submit" => Ok(Stage::Submit),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// The chain of entities a stage reads: the job, plus its application and
/// form when they exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub job: Job,
    pub application: Option<Application>,
    pub form: Option<ApplicationForm>,
}

impl Subject {
    /// The claim currently held for `stage` on this subject, if any.
    pub fn claim(&self, stage: Stage) -> Option<ClaimHold> {
        match stage {
            Stage::Review => self.job.review_claim,
            Stage::CreateApp => self.job.create_app_claim,
            Stage::ExpirationCheck => self.job.expiration_check_claim,
            Stage::Prepare => self.form.as_ref().and_then(|f| f.prepare_claim),
            Stage::Submit => self.application.as_ref().and_then(|a| a.submission_claim),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ApplicationStatus;
    use crate::testing::{job, job_with_application};

    #[test]
    fn stage_metadata() {
        assert_eq!(Stage::Prepare.entity(), EntityKind::ApplicationForm);
        assert_eq!(Stage::Submit.flag(), "submission_claim");
        assert_eq!(Stage::CreateApp.to_string(), "create_app");
        assert_eq!("expiration-check".parse::<Stage>(), Ok(Stage::ExpirationCheck));
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn review_guard_and_postcondition() {
        let mut subject = Subject {
            job: job(JobState::Pending),
            application: None,
            form: None,
        };
        assert!(Stage::Review.admits(&subject));
        assert!(!Stage::Review.already_done(&subject));

        subject.job.state = JobState::Reviewed;
        assert!(!Stage::Review.admits(&subject));
        assert!(Stage::Review.already_done(&subject));
    }

    #[test]
    fn create_app_done_once_form_scraped() {
        let subject = job_with_application(JobState::Approved, ApplicationStatus::Started, FormState::Scraped);
        assert!(Stage::CreateApp.admits(&subject));
        assert!(Stage::CreateApp.already_done(&subject));

        let bare = Subject {
            job: job(JobState::Approved),
            application: None,
            form: None,
        };
        assert!(!Stage::CreateApp.already_done(&bare));
    }

    #[test]
    fn submit_guard_reads_form_state() {
        let ready = job_with_application(JobState::Approved, ApplicationStatus::Ready, FormState::Approved);
        assert!(Stage::Submit.admits(&ready));

        let unapproved = job_with_application(JobState::Approved, ApplicationStatus::Ready, FormState::Prepared);
        assert!(!Stage::Submit.admits(&unapproved));
    }

    #[test]
    fn expiration_guard_excludes_terminal_jobs() {
        for (state, admitted) in [
            (JobState::Pending, true),
            (JobState::Approved, true),
            (JobState::Expired, false),
            (JobState::Discarded, false),
        ] {
            let subject = Subject {
                job: job(state),
                application: None,
                form: None,
            };
            assert_eq!(Stage::ExpirationCheck.admits(&subject), admitted, "{state}");
        }
    }
}
