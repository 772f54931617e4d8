//! Configuração do motor carregada a partir de `ebloc.toml`.
//!
//! A struct [`EngineConfig`] agrupa todos os parâmetros em seções (cadeia,
//! timeouts, retentativas, verificação, cancelamento e armazenamento).
//! Valores ausentes no arquivo usam defaults sensíveis. As variáveis de
//! ambiente `EBLOC_CHAIN_ENDPOINT` e `EBLOC_ACCOUNT` têm precedência sobre
//! o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "ebloc.toml";

/// Configuração de nível superior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Conexão com a cadeia e regras de confirmação.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Endpoint RPC do nó.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Conta usada para assinar as transações do orquestrador.
    #[serde(default = "default_account")]
    pub account: String,
    /// Blocos de confirmação antes de um evento ser considerado final.
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    /// Tempo máximo de espera por confirmação de uma transação.
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
    /// Reenvios permitidos (com substituição) antes de desistir.
    #[serde(default = "default_max_resubmissions")]
    pub max_resubmissions: u32,
    /// Intervalo de polling da assinatura de eventos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocos lidos por página da assinatura.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

/// Limites de tempo da execução.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Silêncio máximo do provedor antes da reatribuição.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Duração máxima de uma tentativa, contada da atribuição.
    #[serde(default = "default_execution_deadline_ms")]
    pub execution_deadline_ms: u64,
    /// Intervalo entre checkpoints do laço de controle.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Limites de retentativa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Atribuições por job antes de marcá-lo como falho.
    #[serde(default = "default_max_assignment_attempts")]
    pub max_assignment_attempts: u32,
    /// Rodadas de matching sem provedor antes de falhar o job.
    #[serde(default = "default_max_matching_attempts")]
    pub max_matching_attempts: u32,
    /// Atraso base do backoff de matching.
    #[serde(default = "default_matching_base_delay_ms")]
    pub matching_base_delay_ms: u64,
    /// Atraso base do backoff quando a cadeia está indisponível.
    #[serde(default = "default_chain_base_delay_ms")]
    pub chain_base_delay_ms: u64,
    /// Teto de qualquer atraso individual.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Política de verificação selecionada.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VerifierPolicy {
    /// Confere o compromisso criptográfico publicado com o resultado.
    #[default]
    Digest,
    /// Recomputação por um serviço verificador designado.
    Recompute { endpoint: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub policy: VerifierPolicy,
    /// Retentativas após um veredito inconclusivo.
    #[serde(default = "default_verification_retries")]
    pub max_retries: u32,
    #[serde(default = "default_verification_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Tempo máximo de cada chamada ao verificador.
    #[serde(default = "default_verification_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationConfig {
    /// Parcela do escrow (em pontos-base) paga ao provedor quando o dono
    /// cancela depois da atribuição.
    #[serde(default = "default_penalty_bps")]
    pub penalty_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentStoreConfig {
    #[default]
    Memory,
    Http { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Log de eventos confirmados (fonte da verdade local).
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,
    /// Cache opcional da projeção.
    #[serde(default)]
    pub projection_cache: Option<PathBuf>,
    #[serde(default)]
    pub content: ContentStoreConfig,
}

fn default_endpoint() -> String {
    "memory://local".to_string()
}

fn default_account() -> String {
    "0xorchestrator".to_string()
}

// Três blocos de profundidade.
fn default_finality_depth() -> u64 {
    3
}

fn default_confirmation_timeout_ms() -> u64 {
    5_000
}

fn default_max_resubmissions() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_page_size() -> u64 {
    64
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_execution_deadline_ms() -> u64 {
    300_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_max_assignment_attempts() -> u32 {
    3
}

fn default_max_matching_attempts() -> u32 {
    5
}

fn default_matching_base_delay_ms() -> u64 {
    1_000
}

fn default_chain_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_verification_retries() -> u32 {
    3
}

fn default_verification_base_delay_ms() -> u64 {
    500
}

fn default_verification_call_timeout_ms() -> u64 {
    10_000
}

// 10% do escrow.
fn default_penalty_bps() -> u32 {
    1_000
}

fn default_event_log() -> PathBuf {
    PathBuf::from("ebloc-events.jsonl")
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            account: default_account(),
            finality_depth: default_finality_depth(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            max_resubmissions: default_max_resubmissions(),
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            execution_deadline_ms: default_execution_deadline_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_assignment_attempts: default_max_assignment_attempts(),
            max_matching_attempts: default_max_matching_attempts(),
            matching_base_delay_ms: default_matching_base_delay_ms(),
            chain_base_delay_ms: default_chain_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            policy: VerifierPolicy::default(),
            max_retries: default_verification_retries(),
            base_delay_ms: default_verification_base_delay_ms(),
            call_timeout_ms: default_verification_call_timeout_ms(),
        }
    }
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            penalty_bps: default_penalty_bps(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log: default_event_log(),
            projection_cache: None,
            content: ContentStoreConfig::default(),
        }
    }
}

impl ChainConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TimeoutConfig {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_timeout_ms as i64)
    }

    pub fn execution_deadline(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.execution_deadline_ms as i64)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl RetryConfig {
    /// Backoff entre rodadas de matching sem provedor elegível.
    pub fn matching_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_matching_attempts,
            base_delay_ms: self.matching_base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    /// Backoff para falhas transitórias da cadeia.
    pub fn chain_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: u32::MAX,
            base_delay_ms: self.chain_base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

impl VerificationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl CancellationConfig {
    /// Multa devida ao provedor sobre `escrow`.
    pub fn penalty_for(&self, escrow: u64) -> u64 {
        let bps = u64::from(self.penalty_bps.min(10_000));
        escrow.saturating_mul(bps) / 10_000
    }
}

impl EngineConfig {
    /// Carrega de `path`, ou de `ebloc.toml` no diretório atual quando
    /// nenhum caminho é dado. Sem arquivo, usa os valores padrão.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(EngineError::Config(format!(
                        "config file {} not found",
                        path.display()
                    )));
                }
                Self::from_toml(&std::fs::read_to_string(path)?)?
            }
            None => {
                let default = Path::new(CONFIG_FILE);
                if default.exists() {
                    Self::from_toml(&std::fs::read_to_string(default)?)?
                } else {
                    Self::default()
                }
            }
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> EngineResult<Self> {
        Ok(toml::from_str::<EngineConfig>(contents)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("EBLOC_CHAIN_ENDPOINT").filter(|v| !v.is_empty()) {
            self.chain.endpoint = endpoint;
        }
        if let Some(account) = lookup("EBLOC_ACCOUNT").filter(|v| !v.is_empty()) {
            self.chain.account = account;
        }
    }

    /// Rejeita combinações que tornariam o laço de controle inválido.
    pub fn validate(&self) -> EngineResult<()> {
        if self.chain.finality_depth == 0 {
            return Err(EngineError::Config("finality_depth must be at least 1".into()));
        }
        if self.retry.max_assignment_attempts == 0 {
            return Err(EngineError::Config(
                "max_assignment_attempts must be at least 1".into(),
            ));
        }
        if self.cancellation.penalty_bps > 10_000 {
            return Err(EngineError::Config(format!(
                "penalty_bps {} exceeds 10000",
                self.cancellation.penalty_bps
            )));
        }
        if let VerifierPolicy::Recompute { endpoint } = &self.verification.policy
            && endpoint.trim().is_empty()
        {
            return Err(EngineError::Config("recompute policy needs an endpoint".into()));
        }
        Ok(())
    }
}
