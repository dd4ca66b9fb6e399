//! Configuration for content-anchor
//!
//! CLI arguments and environment variable handling using clap. Every
//! option can come from the environment (or a `.env` file); flags override.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use clap::{Args, ValueEnum};
use thiserror::Error;

use crate::anchor::{OrchestratorConfig, RetryPolicy};
use crate::ledger::ethereum::{EthereumConfig, EthereumLedger};
use crate::ledger::memory::InMemoryLedger;
use crate::ledger::LedgerClient;
use crate::storage::ipfs::{IpfsConfig, IpfsStore};
use crate::storage::memory::InMemoryStore;
use crate::storage::pinata::{self, PinataConfig, PinataStore};
use crate::storage::ContentStore;

/// Problems found before startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is required when {context}")]
    Missing {
        name: &'static str,
        context: &'static str,
    },

    #[error("Invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Ethereum,
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Pinata,
    Ipfs,
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging options, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Log level for content-anchor (RUST_LOG overrides)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,
}

/// HTTP listener options
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: String,

    /// Largest accepted request body, in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_upload_bytes: usize,
}

/// Ledger connection options
#[derive(Args, Debug, Clone)]
pub struct LedgerArgs {
    /// Ledger implementation
    #[arg(long, env = "LEDGER_BACKEND", value_enum, default_value_t = LedgerBackend::Ethereum)]
    pub ledger_backend: LedgerBackend,

    /// Ethereum JSON-RPC endpoint
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Option<String>,

    /// Hex private key of the signing account
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Address of the anchoring contract
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Chain ID (11155111 = Sepolia)
    #[arg(long, env = "CHAIN_ID", default_value_t = 11_155_111)]
    pub chain_id: u64,

    /// Receipt polling interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,
}

/// Content store options
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Content store implementation
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value_t = StorageBackend::Pinata)]
    pub storage_backend: StorageBackend,

    /// Pinata JWT
    #[arg(long, env = "PINATA_JWT", hide_env_values = true)]
    pub pinata_jwt: Option<String>,

    /// Pinata API endpoint
    #[arg(long, env = "PINATA_API_URL", default_value = pinata::DEFAULT_API_URL)]
    pub pinata_api_url: String,

    /// Kubo HTTP API endpoint
    #[arg(long, env = "IPFS_API_URL", default_value = "http://127.0.0.1:5001")]
    pub ipfs_api_url: String,
}

/// Orchestrator tuning
#[derive(Args, Debug, Clone)]
pub struct AnchorArgs {
    /// Blocks required on top of the inclusion block
    #[arg(long, env = "CONFIRMATIONS", default_value_t = 1)]
    pub confirmations: u64,

    /// Give up waiting for confirmation after this many seconds
    #[arg(long, env = "CONFIRMATION_TIMEOUT_SECS", default_value_t = 120)]
    pub confirmation_timeout_secs: u64,

    /// Attempts per transient failure, including the first
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 500)]
    pub retry_base_delay_ms: u64,

    #[arg(long, env = "RETRY_MAX_DELAY_MS", default_value_t = 8000)]
    pub retry_max_delay_ms: u64,

    /// How long settled operations stay deduplicated
    #[arg(long, env = "INFLIGHT_RETENTION_SECS", default_value_t = 60)]
    pub inflight_retention_secs: u64,
}

/// Everything `serve` needs.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub ledger: LedgerArgs,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub anchor: AnchorArgs,
}

impl ServeArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ledger.validate()?;
        self.storage.validate()?;
        self.anchor.validate()?;
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_UPLOAD_BYTES",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn require<'a>(
    value: &'a Option<String>,
    name: &'static str,
    context: &'static str,
) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing { name, context })
}

impl LedgerArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_backend == LedgerBackend::Memory {
            return Ok(());
        }

        const CONTEXT: &str = "LEDGER_BACKEND=ethereum";
        require(&self.rpc_url, "RPC_URL", CONTEXT)?;
        require(&self.private_key, "PRIVATE_KEY", CONTEXT)?;
        self.parse_contract()?;
        Ok(())
    }

    fn parse_contract(&self) -> Result<Address, ConfigError> {
        let raw = require(
            &self.contract_address,
            "CONTRACT_ADDRESS",
            "LEDGER_BACKEND=ethereum",
        )?;
        Address::from_str(raw).map_err(|e| ConfigError::Invalid {
            name: "CONTRACT_ADDRESS",
            reason: e.to_string(),
        })
    }

    /// Construct the configured ledger client.
    pub fn build(&self) -> Result<Arc<dyn LedgerClient>, ConfigError> {
        match self.ledger_backend {
            LedgerBackend::Memory => Ok(Arc::new(InMemoryLedger::new())),
            LedgerBackend::Ethereum => {
                const CONTEXT: &str = "LEDGER_BACKEND=ethereum";
                let config = EthereumConfig {
                    rpc_url: require(&self.rpc_url, "RPC_URL", CONTEXT)?.to_string(),
                    private_key_hex: require(&self.private_key, "PRIVATE_KEY", CONTEXT)?
                        .to_string(),
                    chain_id: self.chain_id,
                    contract_address: self.parse_contract()?,
                    poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                };
                let ledger = EthereumLedger::new(config).map_err(|e| ConfigError::Invalid {
                    name: "PRIVATE_KEY",
                    reason: e.to_string(),
                })?;
                Ok(Arc::new(ledger))
            }
        }
    }
}

impl StorageArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_backend == StorageBackend::Pinata {
            require(&self.pinata_jwt, "PINATA_JWT", "STORAGE_BACKEND=pinata")?;
        }
        Ok(())
    }

    /// Construct the configured content store.
    pub fn build(&self) -> Result<Arc<dyn ContentStore>, ConfigError> {
        Ok(match self.storage_backend {
            StorageBackend::Pinata => Arc::new(PinataStore::new(PinataConfig {
                api_url: self.pinata_api_url.trim_end_matches('/').to_string(),
                jwt: require(&self.pinata_jwt, "PINATA_JWT", "STORAGE_BACKEND=pinata")?
                    .to_string(),
            })),
            StorageBackend::Ipfs => Arc::new(IpfsStore::new(IpfsConfig {
                api_url: self.ipfs_api_url.trim_end_matches('/').to_string(),
            })),
            StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        })
    }
}

impl AnchorArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "RETRY_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.confirmation_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "CONFIRMATION_TIMEOUT_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            confirmations: self.confirmations,
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            retention: Duration::from_secs(self.inflight_retention_secs),
        }
    }
}
