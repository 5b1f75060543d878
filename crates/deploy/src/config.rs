//! Layered configuration: compiled-in defaults, a `Quay.toml` file and `QUAY_*` env vars.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use backon::ExponentialBuilder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// The default name for the quay configuration file.
pub const QUAY_CONFIG_FILENAME: &str = "Quay.toml";

/// Prefix of the environment variables merged over the file configuration.
pub const ENV_PREFIX: &str = "QUAY_";

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuayConfig {
    /// Named networks that deployments can target.
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Where the signing key comes from.
    pub signer: SignerConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Compiler settings submitted alongside sources for verification.
    pub compiler: CompilerConfig,
    /// Gas limit and price policy.
    pub gas: GasPolicy,
    /// Backoff for transient RPC and explorer failures.
    pub retry: RetryPolicy,
    /// Waiting for a transaction to be included.
    pub receipt_poll: PollPolicy,
    /// Waiting for the explorer to finish verification.
    pub verification_poll: PollPolicy,
}

/// Per-network endpoints as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub explorer: ExplorerConfig,
}

/// Block-explorer verification endpoint of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    /// Literal API key. Takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ExplorerConfig {
    /// Resolve the API key, falling back to an empty key when none is configured.
    pub fn resolve_api_key(&self) -> String {
        if let Some(key) = &self.api_key {
            return key.clone();
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Environment variable holding the hex-encoded private key.
    pub private_key_env: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the compiler artifacts tree.
    pub artifacts: PathBuf,
    /// Directory holding the deployment ledger.
    pub ledger: PathBuf,
}

/// Compiler settings as configured for the project build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Pinned compiler version. When unset, the version recorded in the build info is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub optimizer: bool,
    pub runs: u32,
    pub evm_version: String,
    pub via_ir: bool,
}

/// The single gas policy applied to contract-creation transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPolicy {
    /// Added on top of `eth_estimateGas` when the intent has no explicit gas limit.
    pub safety_margin: u64,
    /// Percentage added to `eth_gasPrice`.
    pub price_bump_percent: u64,
    /// Hard ceiling on the gas price, in gwei.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gas_price_gwei: Option<u64>,
}

impl GasPolicy {
    /// Gas limit for a transaction whose estimate is `estimate`.
    pub fn gas_limit(&self, estimate: u64) -> u64 {
        estimate.saturating_add(self.safety_margin)
    }

    /// Gas price to bid given the node's suggested price.
    pub fn gas_price(&self, suggested: u128) -> u128 {
        let bumped = suggested.saturating_mul(100 + self.price_bump_percent as u128) / 100;
        match self.max_gas_price_gwei {
            Some(cap) => bumped.min(cap as u128 * 1_000_000_000),
            None => bumped,
        }
    }
}

/// Bounded exponential backoff.
///
/// `max_attempts` counts every attempt, including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Backoff builder yielding `max_attempts - 1` delays.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Fixed-interval polling bounded by a deadline and optionally an attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for QuayConfig {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "opSepolia".to_string(),
            NetworkConfig {
                rpc_url: "https://sepolia.optimism.io/".to_string(),
                chain_id: 11155420,
                explorer: ExplorerConfig {
                    api_url: "https://api-sepolia-optimistic.etherscan.io/api".to_string(),
                    browser_url: Some("https://sepolia-optimism.etherscan.io/".to_string()),
                    api_key: None,
                    api_key_env: Some("ETHERSCAN_API_KEY".to_string()),
                },
            },
        );

        Self {
            networks,
            signer: SignerConfig {
                private_key_env: "PRIVATE_KEY".to_string(),
            },
            paths: PathsConfig {
                artifacts: PathBuf::from("artifacts"),
                ledger: PathBuf::from(".quay/ledger"),
            },
            compiler: CompilerConfig {
                version: None,
                optimizer: true,
                runs: 800,
                evm_version: "paris".to_string(),
                via_ir: true,
            },
            gas: GasPolicy {
                safety_margin: 50_000,
                price_bump_percent: 10,
                max_gas_price_gwei: None,
            },
            retry: RetryPolicy {
                max_attempts: 5,
                min_delay_ms: 500,
                max_delay_ms: 10_000,
            },
            receipt_poll: PollPolicy {
                interval_ms: 2_000,
                timeout_secs: 300,
                max_attempts: None,
            },
            verification_poll: PollPolicy {
                interval_ms: 5_000,
                timeout_secs: 300,
                max_attempts: Some(60),
            },
        }
    }
}

impl QuayConfig {
    /// Build the layered figment for `path` without extracting it.
    ///
    /// A directory resolves to `<dir>/Quay.toml`. A missing file is not an error: defaults and
    /// environment still apply.
    pub fn figment(path: &Path) -> Figment {
        let file = if path.is_dir() {
            path.join(QUAY_CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the configuration from defaults, `path` and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        tracing::info!(path = %path.display(), networks = config.networks.len(), "Configuration loaded");
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}
