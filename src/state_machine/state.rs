use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Common behaviour of the three entity state machines.
///
/// Every state has an explicit integer rank along the main path. Side-states
/// (`DISCARDED`) have no rank and are only reachable, never left. States that
/// share a rank are mutually exclusive alternatives and do not compare.
pub trait Lifecycle: Copy + Eq + fmt::Display {
    /// Position along the main path, `None` for side-states.
    fn rank(self) -> Option<u8>;

    /// Whether the state can never be left.
    fn is_terminal(self) -> bool;

    /// Stable lowercase name used for storage.
    fn as_str(self) -> &'static str;

    /// Whether `self -> next` is a legal, forward-only transition.
    fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            // Side-states are reachable from any non-terminal state.
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

fn compare_ranks<S: Lifecycle>(a: S, b: S) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    match (a.rank(), b.rank()) {
        (Some(x), Some(y)) if x != y => Some(x.cmp(&y)),
        _ => None,
    }
}

/// Error returned when a stored state name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

/// Lifecycle of a discovered job posting.
///
/// PENDING → REVIEWED → APPROVED → EXPIRED, with DISCARDED reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Reviewed,
    Approved,
    Expired,
    Discarded,
}

impl Lifecycle for JobState {
    fn rank(self) -> Option<u8> {
        match self {
            JobState::Pending => Some(0),
            JobState::Reviewed => Some(1),
            JobState::Approved => Some(2),
            JobState::Expired => Some(3),
            JobState::Discarded => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, JobState::Expired | JobState::Discarded)
    }

    fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Reviewed => "reviewed",
            JobState::Approved => "approved",
            JobState::Expired => "expired",
            JobState::Discarded => "discarded",
        }
    }
}

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "reviewed" => Ok(JobState::Reviewed),
            "approved" => Ok(JobState::Approved),
            "expired" => Ok(JobState::Expired),
            "discarded" => Ok(JobState::Discarded),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Lifecycle of a scraped application form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormState {
    Created,
    Scraped,
    Prepared,
    Approved,
    Discarded,
}

impl Lifecycle for FormState {
    fn rank(self) -> Option<u8> {
        match self {
            FormState::Created => Some(0),
            FormState::Scraped => Some(1),
            FormState::Prepared => Some(2),
            FormState::Approved => Some(3),
            FormState::Discarded => None,
        }
    }

    fn is_terminal(self) -> bool {
        self == FormState::Discarded
    }

    fn as_str(self) -> &'static str {
        match self {
            FormState::Created => "created",
            FormState::Scraped => "scraped",
            FormState::Prepared => "prepared",
            FormState::Approved => "approved",
            FormState::Discarded => "discarded",
        }
    }
}

impl FromStr for FormState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(FormState::Created),
            "scraped" => Ok(FormState::Scraped),
            "prepared" => Ok(FormState::Prepared),
            "approved" => Ok(FormState::Approved),
            "discarded" => Ok(FormState::Discarded),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Lifecycle of an application, from first scrape to the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Started,
    Ready,
    Submitted,
    Acknowledged,
    Assessment,
    Interview,
    Rejected,
    Offer,
    Accepted,
    Withdrawn,
}

impl Lifecycle for ApplicationStatus {
    fn rank(self) -> Option<u8> {
        Some(match self {
            ApplicationStatus::Started => 0,
            ApplicationStatus::Ready => 1,
            ApplicationStatus::Submitted => 2,
            ApplicationStatus::Acknowledged => 3,
            ApplicationStatus::Assessment | ApplicationStatus::Interview => 4,
            ApplicationStatus::Rejected | ApplicationStatus::Offer => 5,
            ApplicationStatus::Accepted | ApplicationStatus::Withdrawn => 6,
        })
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Accepted | ApplicationStatus::Withdrawn
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            ApplicationStatus::Started => "started",
            ApplicationStatus::Ready => "ready",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::Acknowledged => "acknowledged",
            ApplicationStatus::Assessment => "assessment",
            ApplicationStatus::Interview => "interview",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Offer => "offer",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Withdrawn => "withdrawn",
        }
    }
}

impl FromStr for ApplicationStatus {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ApplicationStatus::Started),
            "ready" => Ok(ApplicationStatus::Ready),
            "submitted" => Ok(ApplicationStatus::Submitted),
            "acknowledged" => Ok(ApplicationStatus::Acknowledged),
            "assessment" => Ok(ApplicationStatus::Assessment),
            "interview" => Ok(ApplicationStatus::Interview),
            "rejected" => Ok(ApplicationStatus::Rejected),
            "offer" => Ok(ApplicationStatus::Offer),
            "accepted" => Ok(ApplicationStatus::Accepted),
            "withdrawn" => Ok(ApplicationStatus::Withdrawn),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

impl PartialOrd for JobState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        compare_ranks(*self, *other)
    }
}

impl PartialOrd for FormState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        compare_ranks(*self, *other)
    }
}

impl PartialOrd for ApplicationStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        compare_ranks(*self, *other)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl fmt::Display for FormState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}
