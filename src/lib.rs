//! Claim-based orchestration for an automated job-application pipeline.
//!
//! Jobs, applications and application forms move through forward-only state
//! machines. Each pipeline stage owns one claim flag on its entity; a worker
//! must win the claim before running the stage, and commits its result and
//! clears the flag in one atomic step. Redelivered or concurrent tasks
//! therefore never repeat a side effect.

pub mod claim;
pub mod cli;
pub mod collaborator;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod profile;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;
