use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobState, Lifecycle};

/// A held claim: who holds it (token) and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimHold {
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
}

/// How well a job fits the candidate, as judged by the evaluation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Safety,
    Target,
    Reach,
    Dream,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Safety => "safety",
            Classification::Target => "target",
            Classification::Reach => "reach",
            Classification::Dream => "dream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "safety" => Some(Classification::Safety),
            "target" => Some(Classification::Target),
            "reach" => Some(Classification::Reach),
            "dream" => Some(Classification::Dream),
            _ => None,
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the review stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub classification: Classification,
    pub rationale: String,
}

/// A job candidate as supplied by the discovery collaborator.
///
/// `external_id` is the natural key used to deduplicate repeated discoveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub external_id: String,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub min_salary: Option<f64>,
    #[serde(default)]
    pub max_salary: Option<f64>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub date_posted: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub direct_url: Option<String>,
}

/// A discovered job posting moving through review, application and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub min_salary: Option<f64>,
    pub max_salary: Option<f64>,
    pub employment_type: Option<String>,
    pub date_posted: Option<String>,
    pub description: Option<String>,
    pub listing_url: Option<String>,
    pub direct_url: Option<String>,
    pub state: JobState,
    pub review: Option<Review>,
    pub manual: bool,
    pub review_claim: Option<ClaimHold>,
    pub create_app_claim: Option<ClaimHold>,
    pub expiration_check_claim: Option<ClaimHold>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `PENDING` job from a discovery draft.
    pub fn from_draft(draft: JobDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id: draft.external_id,
            title: draft.title,
            company: draft.company,
            location: draft.location,
            min_salary: draft.min_salary,
            max_salary: draft.max_salary,
            employment_type: draft.employment_type,
            date_posted: draft.date_posted,
            description: draft.description,
            listing_url: draft.listing_url,
            direct_url: draft.direct_url,
            state: JobState::Pending,
            review: None,
            manual: false,
            review_claim: None,
            create_app_claim: None,
            expiration_check_claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The url an application should be made through: direct first, listing second.
    pub fn application_url(&self) -> Option<&str> {
        self.direct_url
            .as_deref()
            .or(self.listing_url.as_deref())
    }

    pub fn can_review(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_reviewed(&self) -> bool {
        self.state >= JobState::Reviewed
    }

    pub fn can_create_app(&self) -> bool {
        matches!(self.state, JobState::Reviewed | JobState::Approved)
    }

    pub fn can_check_expiration(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn has_claims(&self) -> bool {
        self.review_claim.is_some()
            || self.create_app_claim.is_some()
            || self.expiration_check_claim.is_some()
    }
}
