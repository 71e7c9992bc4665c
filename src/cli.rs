//! Interface de linha de comando do autoapply baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (discover, sweep,
//! run, reclaim e as transições manuais) e flags globais
//! (--config, --max-attempts, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::state_machine::{ApplicationStatus, Stage};

/// autoapply: orquestrador do pipeline de candidaturas baseado em claims.
#[derive(Debug, Parser)]
#[command(name = "autoapply", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `autoapply.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número máximo de tentativas por tarefa.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Busca novas vagas e grava as ainda não vistas.
    Discover {
        /// Quantidade de vagas a pedir ao colaborador.
        #[arg(long, default_value_t = 25)]
        count: usize,
    },

    /// Varre um estágio (ou todos, se omitido) e despacha as entidades elegíveis.
    Sweep {
        /// Estágio a varrer: review, create_app, expiration_check, prepare, submit.
        stage: Option<Stage>,
    },

    /// Executa um único estágio sobre uma entidade.
    Run {
        stage: Stage,
        id: Uuid,
    },

    /// Libera claims mais antigos que `claim_ttl_secs`.
    Reclaim,

    /// Aprova um job revisado (REVIEWED → APPROVED).
    ApproveJob { id: Uuid },

    /// Descarta um job.
    DiscardJob { id: Uuid },

    /// Aprova um formulário preparado e deixa a candidatura pronta.
    ApproveForm { id: Uuid },

    /// Descarta um formulário.
    DiscardForm { id: Uuid },

    /// Registra o progresso de uma candidatura já enviada.
    AdvanceApplication {
        id: Uuid,
        /// Novo status, p.ex. `interview` ou `offer`.
        status: ApplicationStatus,
    },

    /// Lista as falhas de estágio mais recentes.
    Failures {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_sweep_subcommand() {
        let cli = Cli::parse_from(["autoapply", "sweep", "create_app"]);
        assert!(matches!(
            cli.command,
            Command::Sweep {
                stage: Some(Stage::CreateApp)
            }
        ));

        let cli = Cli::parse_from(["autoapply", "sweep"]);
        assert!(matches!(cli.command, Command::Sweep { stage: None }));
    }

    #[test]
    fn cli_parses_run_subcommand() {
        let id = Uuid::new_v4();
        let cli = Cli::parse_from(["autoapply", "run", "prepare", &id.to_string()]);
        match cli.command {
            Command::Run { stage, id: parsed } => {
                assert_eq!(stage, Stage::Prepare);
                assert_eq!(parsed, id);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "autoapply",
            "--config",
            "/etc/autoapply.toml",
            "--max-attempts",
            "2",
            "--verbose",
            "reclaim",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.max_attempts, Some(2));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/autoapply.toml")));
    }

    #[test]
    fn cli_parses_advance_application() {
        let id = Uuid::new_v4();
        let cli = Cli::parse_from(["autoapply", "advance-application", &id.to_string(), "interview"]);
        assert!(matches!(
            cli.command,
            Command::AdvanceApplication {
                status: ApplicationStatus::Interview,
                ..
            }
        ));
    }

    #[test]
    fn cli_rejects_unknown_stage() {
        assert!(Cli::try_parse_from(["autoapply", "sweep", "deploy"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
