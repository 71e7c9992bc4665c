//! Bulk scan-and-dispatch over every entity a stage can currently claim.
//!
//! A sweep never mutates state itself: it lists candidates and hands each one
//! to the dispatcher, which goes through the claim protocol. Concurrent
//! sweeps over the same stage are therefore safe; the losers just skip.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::claim::StageOutcome;
use crate::collaborator::CollaboratorError;
use crate::dispatcher::{Dispatcher, Task};
use crate::error::{PipelineError, StoreError};
use crate::retry::with_backoff_after;
use crate::state_machine::Stage;
use crate::store::{ClaimStore, EligibleFilter, InsertReport};

/// Tally of one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub stage: Stage,
    pub eligible: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    fn new(stage: Stage, eligible: usize) -> Self {
        Self {
            stage,
            eligible,
            committed: 0,
            skipped: 0,
            failed: 0,
        }
    }

    fn record(&mut self, outcome: &StageOutcome) {
        match outcome {
            StageOutcome::Committed => self.committed += 1,
            StageOutcome::SkippedContention | StageOutcome::SkippedPrecondition => {
                self.skipped += 1
            }
            StageOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct Sweeper<S: ClaimStore + ?Sized> {
    dispatcher: Arc<Dispatcher<S>>,
    concurrency: usize,
    expiration_age: chrono::Duration,
}

impl<S: ClaimStore + ?Sized> Sweeper<S> {
    pub fn new(dispatcher: Arc<Dispatcher<S>>, concurrency: usize, expiration_age: chrono::Duration) -> Self {
        Self {
            dispatcher,
            concurrency: concurrency.max(1),
            expiration_age,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    /// Extra narrowing a stage's sweep applies on top of its guard.
    fn filter_for(&self, stage: Stage) -> EligibleFilter {
        match stage {
            Stage::CreateApp => EligibleFilter {
                approved_only: true,
                without_form: true,
                ..EligibleFilter::default()
            },
            Stage::ExpirationCheck => EligibleFilter {
                require_listing_url: true,
                created_before: Some(Utc::now() - self.expiration_age),
                ..EligibleFilter::default()
            },
            _ => EligibleFilter::default(),
        }
    }

    pub async fn sweep(&self, stage: Stage) -> Result<SweepReport, StoreError> {
        self.sweep_with(stage, |_, _| {}).await
    }

    /// Sweep `stage`, calling `on_outcome` as each task finishes.
    pub async fn sweep_with<F>(&self, stage: Stage, mut on_outcome: F) -> Result<SweepReport, StoreError>
    where
        F: FnMut(&Task, &StageOutcome),
    {
        let store = self.dispatcher.store();
        let mut candidates = store.eligible(stage, &self.filter_for(stage)).await?;
        if stage == Stage::CreateApp {
            let sites = &self.dispatcher.collaborators().sites;
            candidates.retain(|c| c.url.as_deref().is_some_and(|url| sites.supports(url)));
        }

        let mut report = SweepReport::new(stage, candidates.len());
        if candidates.is_empty() {
            tracing::debug!(%stage, "nothing to sweep");
            return Ok(report);
        }
        tracing::info!(%stage, eligible = report.eligible, "sweep started");

        let mut outcomes = stream::iter(candidates)
            .map(|candidate| {
                let task = Task::new(stage, candidate.id);
                async move { (task, self.dispatcher.dispatch(task).await) }
            })
            .buffer_unordered(self.concurrency);

        while let Some((task, outcome)) = outcomes.next().await {
            report.record(&outcome);
            on_outcome(&task, &outcome);
        }

        tracing::info!(
            %stage,
            committed = report.committed,
            skipped = report.skipped,
            failed = report.failed,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweep every stage in pipeline order.
    pub async fn sweep_all(&self) -> Result<Vec<SweepReport>, StoreError> {
        let mut reports = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            reports.push(self.sweep(stage).await?);
        }
        Ok(reports)
    }

    /// Pull new postings from the discovery collaborator and store the ones
    /// not seen before.
    pub async fn discover(&self, count: usize) -> Result<InsertReport, PipelineError> {
        let source = &self.dispatcher.collaborators().source;
        let drafts = with_backoff_after(
            self.dispatcher.retry_policy(),
            CollaboratorError::is_transient,
            CollaboratorError::retry_after_ms,
            |_| source.discover_jobs(count),
        )
        .await?;
        let found = drafts.len();
        let report = self.dispatcher.store().insert_jobs(drafts).await?;
        tracing::info!(
            found,
            inserted = report.inserted.len(),
            duplicates = report.duplicates,
            "discovery finished"
        );
        Ok(report)
    }

    /// Release every claim held longer than `ttl`, across all stages.
    pub async fn reclaim_stale(&self, ttl: chrono::Duration) -> Result<u64, StoreError> {
        let older_than = Utc::now() - ttl;
        let mut freed = 0;
        for stage in Stage::ALL {
            let released = self
                .dispatcher
                .store()
                .release_stale(stage, older_than)
                .await?;
            if released > 0 {
                tracing::warn!(%stage, released, "released stale claims");
            }
            freed += released;
        }
        Ok(freed)
    }
}
