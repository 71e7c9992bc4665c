//! Configuração do autoapply carregada a partir de `autoapply.toml`.
//!
//! A struct [`PipelineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `DATABASE_URL` e `AUTOAPPLY_COLLABORATOR_URL`
//! têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::profile::Profile;
use crate::retry::RetryPolicy;

/// Arquivo lido quando nenhum caminho é passado via `--config`.
pub const DEFAULT_CONFIG_FILE: &str = "autoapply.toml";

/// Configuração de nível superior carregada de `autoapply.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// URL de conexão do Postgres que guarda entidades e claims.
    pub database_url: String,

    /// URL base do serviço colaborador (descoberta, avaliação, sites).
    pub collaborator_url: String,

    /// Total de tentativas por tarefa, a primeira inclusa.
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    pub base_delay_ms: u64,

    /// Teto de um único atraso de backoff.
    pub max_delay_ms: u64,

    /// Tempo máximo do passo externo de um estágio.
    pub stage_timeout_secs: u64,

    /// Idade a partir da qual um claim é considerado abandonado.
    pub claim_ttl_secs: u64,

    /// Tarefas simultâneas em uma varredura.
    pub sweep_concurrency: usize,

    /// Idade mínima de um job para a checagem de expiração.
    pub expiration_age_days: i64,

    /// Domínios atendidos por adaptadores de site remotos.
    pub site_domains: Vec<String>,

    /// Perfil do candidato, compartilhado por todos os estágios.
    pub profile: Profile,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/autoapply".to_string(),
            collaborator_url: "http://localhost:8080".to_string(),
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            stage_timeout_secs: 480,
            claim_ttl_secs: 900,
            sweep_concurrency: 4,
            expiration_age_days: 7,
            site_domains: vec!["jobs.ashbyhq.com".to_string(), "www.linkedin.com".to_string()],
            profile: Profile::default(),
        }
    }
}

impl PipelineConfig {
    /// Carrega a configuração de `path`, ou de `autoapply.toml` no diretório atual.
    /// Usa valores padrão se o arquivo padrão não existir; um caminho
    /// explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    // Um claim só pode ser liberado como obsoleto depois que o estágio que o
    // segura já teria estourado o timeout.
    fn validate(&self) -> Result<()> {
        if self.claim_ttl_secs <= self.stage_timeout_secs {
            anyhow::bail!(
                "claim_ttl_secs ({}) must be greater than stage_timeout_secs ({})",
                self.claim_ttl_secs,
                self.stage_timeout_secs
            );
        }
        Ok(())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.is_empty()
        {
            self.database_url = url;
        }
        if let Ok(url) = std::env::var("AUTOAPPLY_COLLABORATOR_URL")
            && !url.is_empty()
        {
            self.collaborator_url = url;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: true,
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.claim_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn expiration_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.expiration_age_days)
    }
}
