//! Interface de terminal do autoapply: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`SweepProgress`] acompanha visualmente
//! uma varredura ou execução de estágio no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::claim::StageOutcome;
use crate::dispatcher::Task;
use crate::store::{FailureRecord, InsertReport};
use crate::sweeper::SweepReport;

/// Indicador visual de progresso para a execução de tarefas no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para commit (verde), falha (vermelho) e skip (amarelo).
pub struct SweepProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl SweepProgress {
    /// Inicia o spinner com a descrição do trabalho.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}");
        if let Ok(style) = style {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Imprime o resultado de uma tarefa acima do spinner.
    pub fn outcome(&self, task: &Task, outcome: &StageOutcome) {
        let line = match outcome {
            StageOutcome::Committed => {
                format!("  {} {} {}", self.green.apply_to("✓"), task.stage, task.entity_id)
            }
            StageOutcome::SkippedContention | StageOutcome::SkippedPrecondition => format!(
                "  {} {} {} {}",
                self.yellow.apply_to("↷"),
                task.stage,
                task.entity_id,
                self.dim.apply_to(outcome.label())
            ),
            StageOutcome::Failed(failure) => format!(
                "  {} {} {}: {}",
                self.red.apply_to("✗"),
                task.stage,
                task.entity_id,
                failure.message
            ),
        };
        self.pb.println(line);
    }

    /// Finaliza o spinner e exibe o resumo da varredura.
    pub fn finish(&self, report: &SweepReport) {
        self.pb.finish_and_clear();
        let style = if report.failed > 0 { &self.red } else { &self.green };
        println!(
            "{} {}: {} eligible, {} committed, {} skipped, {} failed",
            style.apply_to("■"),
            report.stage,
            report.eligible,
            report.committed,
            report.skipped,
            report.failed
        );
    }

    /// Finaliza o spinner sem resumo.
    pub fn clear(&self) {
        self.pb.finish_and_clear();
    }
}

/// Resumo colorido de uma descoberta.
pub fn print_discovery(report: &InsertReport) {
    println!(
        "{} {} new, {} already known",
        Style::new().green().bold().apply_to("✓"),
        report.inserted.len(),
        report.duplicates
    );
}

/// Imprime uma transição manual: aplicada ou recusada pelo guard.
pub fn print_transition(action: &str, applied: bool) {
    if applied {
        println!("{} {action}", Style::new().green().bold().apply_to("✓"));
    } else {
        println!(
            "{} {action}: not applicable in the current state",
            Style::new().yellow().apply_to("↷")
        );
    }
}

/// Lista as falhas registradas, mais recentes primeiro.
pub fn print_failures(failures: &[FailureRecord]) {
    if failures.is_empty() {
        println!("{}", Style::new().dim().apply_to("no recorded failures"));
        return;
    }
    let red = Style::new().red();
    for f in failures {
        println!(
            "{} {} {} [{}] {}",
            f.failed_at.format("%Y-%m-%d %H:%M:%S"),
            red.apply_to(f.stage),
            f.entity_id,
            f.kind,
            f.message
        );
    }
}
