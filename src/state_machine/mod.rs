mod application;
mod job;
mod stage;
mod state;

pub use application::{Application, ApplicationForm, FormField};
pub use job::{ClaimHold, Classification, Job, JobDraft, Review};
pub use stage::{EntityKind, Stage, Subject};
pub use state::{ApplicationStatus, FormState, JobState, Lifecycle, UnknownState};
