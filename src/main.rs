use std::sync::Arc;

use anyhow::{Context, Result};
use autoapply::cli::{Cli, Command};
use autoapply::collaborator::{HttpCollaborator, SiteRegistry};
use autoapply::config::PipelineConfig;
use autoapply::dispatcher::{Collaborators, Dispatcher, Task};
use autoapply::error::PipelineError;
use autoapply::state_machine::Stage;
use autoapply::store::{ClaimStore, PgStore};
use autoapply::sweeper::Sweeper;
use autoapply::ui::{self, SweepProgress};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(verbose: bool) {
    let default = if verbose { "autoapply=debug" } else { "autoapply=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn collaborators(config: &PipelineConfig) -> Result<Collaborators> {
    let http = HttpCollaborator::new(&config.collaborator_url, config.stage_timeout())
        .context("failed to build collaborator client")?;
    let mut sites = SiteRegistry::new();
    for domain in &config.site_domains {
        sites.register(domain.clone(), Arc::new(http.site(domain.clone())));
    }
    let http = Arc::new(http);
    Ok(Collaborators {
        source: http.clone(),
        evaluator: http.clone(),
        answerer: http.clone(),
        expiration: http,
        sites,
    })
}

async fn sweep(sweeper: &Sweeper<PgStore>, stages: &[Stage]) -> Result<()> {
    for &stage in stages {
        let progress = SweepProgress::start(&format!("sweeping {stage}"));
        let report = sweeper
            .sweep_with(stage, |task, outcome| progress.outcome(task, outcome))
            .await;
        match report {
            Ok(report) => progress.finish(&report),
            Err(e) => {
                progress.clear();
                return Err(e).with_context(|| format!("sweep of {stage} failed"));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }

    let pool_size = u32::try_from(config.sweep_concurrency).unwrap_or(u32::MAX).max(2) + 1;
    let store = PgStore::connect(&config.database_url, pool_size)
        .await
        .context("failed to connect to the database")?;
    store.migrate().await?;
    let store = Arc::new(store);

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        collaborators(&config)?,
        Arc::new(config.profile.clone()),
        config.retry_policy(),
        config.stage_timeout(),
    );
    let sweeper = Sweeper::new(
        Arc::new(dispatcher),
        config.sweep_concurrency,
        config.expiration_age(),
    );

    match cli.command {
        Command::Discover { count } => {
            let report = sweeper.discover(count).await?;
            ui::print_discovery(&report);
        }
        Command::Sweep { stage } => match stage {
            Some(stage) => sweep(&sweeper, &[stage]).await?,
            None => sweep(&sweeper, &Stage::ALL).await?,
        },
        Command::Run { stage, id } => {
            let task = Task::new(stage, id);
            let progress = SweepProgress::start(&format!("{stage} {id}"));
            let outcome = sweeper.dispatcher().dispatch(task).await;
            progress.outcome(&task, &outcome);
            progress.clear();
            if let autoapply::claim::StageOutcome::Failed(failure) = outcome {
                return Err(PipelineError::Stage(failure).into());
            }
        }
        Command::Reclaim => {
            let freed = sweeper.reclaim_stale(config.claim_ttl()).await?;
            println!("released {freed} stale claim(s)");
        }
        Command::ApproveJob { id } => {
            ui::print_transition(&format!("approve job {id}"), store.approve_job(id).await?);
        }
        Command::DiscardJob { id } => {
            ui::print_transition(&format!("discard job {id}"), store.discard_job(id).await?);
        }
        Command::ApproveForm { id } => {
            ui::print_transition(&format!("approve form {id}"), store.approve_form(id).await?);
        }
        Command::DiscardForm { id } => {
            ui::print_transition(&format!("discard form {id}"), store.discard_form(id).await?);
        }
        Command::AdvanceApplication { id, status } => {
            let applied = store.advance_application(id, status).await?;
            ui::print_transition(&format!("move application {id} to {status}"), applied);
        }
        Command::Failures { limit } => {
            ui::print_failures(&store.failures(limit).await?);
        }
    }

    Ok(())
}
