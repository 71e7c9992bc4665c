//! The candidate profile injected into every stage that needs it.
//!
//! A [`Profile`] is loaded once from configuration and shared as an
//! immutable `Arc<Profile>`; stages never mutate it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Questions every form asks in some wording, answered straight from the profile.
static COMMON_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(first name|last name|full name|e-?mail|linkedin|github|portfolio|website|phone|located|location|resume|cv|name)\b",
    )
    .expect("common question pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub resume_path: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub github_url: Option<String>,
    #[serde(default)]
    pub current_location: Option<String>,
    #[serde(default)]
    pub desired_location: Option<String>,
    /// Most preferred first, e.g. `["hybrid", "onsite", "remote"]`.
    #[serde(default = "default_work_modes")]
    pub work_mode_ranking: Vec<String>,
}

fn default_work_modes() -> Vec<String> {
    vec!["hybrid".into(), "onsite".into(), "remote".into()]
}

impl Profile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    /// Answer a form question directly from the profile when it is one of the
    /// common ones (name, email, links, location, resume).
    ///
    /// Returns `None` when the question is not common or the profile has no
    /// value for it; the answer collaborator handles those.
    pub fn common_answer(&self, question: &str) -> Option<String> {
        let key = COMMON_QUESTION.find(question)?.as_str().to_lowercase();
        let value = match key.as_str() {
            "first name" => Some(self.first_name.clone()),
            "last name" => Some(self.last_name.clone()),
            "full name" | "name" => Some(self.full_name()),
            "email" | "e-mail" => Some(self.email.clone()),
            "linkedin" => self.linkedin_url.clone(),
            "github" | "portfolio" | "website" => self.github_url.clone(),
            "phone" => self.phone_number.clone(),
            "located" | "location" => self.current_location.clone(),
            "resume" | "cv" => self.resume_path.clone(),
            _ => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }
}
