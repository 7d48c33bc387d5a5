//! Configuration loading for the escrow client.
//!
//! ```toml
//! [endpoint]
//! rpc_url = "${RPC_URL}"
//! chain_id = 31337
//!
//! [contract]
//! contracts_dir = "../contracts"
//!
//! [[parties]]
//! name = "admin"
//! role = "admin"
//! private_key = "${ADMIN_PRIVKEY}"
//!
//! [transactions]
//! inclusion_timeout_secs = 60
//! poll_interval_ms = 500
//!
//! [retry]
//! max_retries = 2
//! ```
//!
//! String values may reference environment variables as `${NAME}`; missing variables
//! expand to the empty string and are then caught by validation.

pub mod descriptor;

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use escrow_types::{Credential, Identity, PartyName, Role};

pub use descriptor::{DescriptorError, read_contract_address, read_contract_interface};

pub const CONFIG_ENV_VAR: &str = "ESCROW_CONFIG";
pub const LOCAL_CONFIG_FILE: &str = "escrow.toml";

const DEFAULT_CONTRACTS_DIR: &str = "contracts";
const DEPLOYMENT_SCRIPT: &str = "EscrowProxy.s.sol";
const IMPLEMENTATION_NAME: &str = "Escrow";
const DEFAULT_INCLUSION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_GAS_MULTIPLIER_PERCENT: u32 = 120;

#[derive(Debug, Deserialize)]
pub struct EscrowConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub contract: ContractConfig,
    #[serde(default)]
    pub parties: Vec<PartyConfig>,
    pub transactions: Option<TransactionsConfig>,
    pub retry: Option<RetrySection>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (set {CONFIG_ENV_VAR} or create ./{LOCAL_CONFIG_FILE})")]
    NotFound,
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub rpc_url: String,
    /// Expected chain id. When set, sessions refuse endpoints reporting another chain.
    pub chain_id: Option<u64>,
    /// Permit plain `http://` to non-loopback hosts.
    #[serde(default)]
    pub allow_insecure_http: bool,
}

/// Where to find the deployed contract and its interface.
///
/// `address` wins over `deployment`. Unset paths fall back to the Foundry layout
/// under `contracts_dir`.
#[derive(Debug, Default, Deserialize)]
pub struct ContractConfig {
    pub address: Option<String>,
    pub deployment: Option<PathBuf>,
    pub interface: Option<PathBuf>,
    pub contracts_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
pub struct PartyConfig {
    pub name: String,
    pub role: Role,
    pub private_key: String,
}

// Manual Debug impl to prevent leaking private keys in logs.
impl std::fmt::Debug for PartyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyConfig")
            .field("name", &self.name)
            .field("role", &self.role)
            .field(
                "private_key",
                &if self.private_key.is_empty() {
                    "None"
                } else {
                    "[REDACTED]"
                },
            )
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionsConfig {
    pub inclusion_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    /// Gas limit as a percentage of the endpoint's estimate. Default: 120.
    pub gas_multiplier_percent: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Replace each `${NAME}` with the environment variable's value.
///
/// Unset variables expand to nothing so validation reports the field that ended
/// up empty. A `${` without a closing brace is kept as written.
pub fn expand_env_vars(value: &str) -> String {
    expand_with(value, |name| env::var(name).ok())
}

fn expand_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(open) = rest.find("${") {
        let Some(len) = rest[open + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = &rest[open + 2..open + 2 + len];
        if !name.is_empty() {
            match lookup(name) {
                Some(resolved) => out.push_str(&resolved),
                None => tracing::warn!(variable = name, "Config references an unset variable"),
            }
        }
        rest = &rest[open + 3 + len..];
    }
    out.push_str(rest);
    out
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

/// Config file candidates in lookup order.
#[must_use]
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(explicit) = env::var(CONFIG_ENV_VAR)
        && !explicit.trim().is_empty()
    {
        candidates.push(PathBuf::from(explicit));
        return candidates;
    }
    candidates.push(PathBuf::from(LOCAL_CONFIG_FILE));
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("escrow").join("config.toml"));
    }
    candidates
}

impl EscrowConfig {
    /// Load from the first existing candidate path.
    pub fn load() -> Result<(PathBuf, Self), ConfigError> {
        let path = config_candidates()
            .into_iter()
            .find(|candidate| candidate.exists())
            .ok_or(ConfigError::NotFound)?;
        let config = Self::load_from(&path)?;
        Ok((path, config))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        let mut config = match Self::from_toml_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        // Relative descriptor paths are resolved against the config file's directory.
        if let Some(base) = path.parent() {
            config.contract.rebase(base);
        }
        Ok(config)
    }

    /// Parse and expand `${VAR}` references. Does not validate.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand();
        Ok(config)
    }

    fn expand(&mut self) {
        self.endpoint.rpc_url = expand_env_vars(&self.endpoint.rpc_url);
        if let Some(address) = self.contract.address.as_mut() {
            *address = expand_env_vars(address);
        }
        for path in [
            &mut self.contract.deployment,
            &mut self.contract.interface,
            &mut self.contract.contracts_dir,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_path(path);
        }
        for party in &mut self.parties {
            party.name = expand_env_vars(&party.name);
            party.private_key = expand_env_vars(&party.private_key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc_url()?;
        if self.parties.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[parties]] entry is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for party in &self.parties {
            let name = party.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid("party name must not be empty".to_string()));
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::Invalid(format!("duplicate party name '{name}'")));
            }
            if party.private_key.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "party '{name}' has an empty private_key (unset environment variable?)"
                )));
            }
        }
        if let Some(address) = &self.contract.address {
            parse_address(address)?;
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> Result<Url, ConfigError> {
        let raw = self.endpoint.rpc_url.trim();
        if raw.is_empty() {
            return Err(ConfigError::Invalid(
                "endpoint.rpc_url must not be empty".to_string(),
            ));
        }
        let url = Url::parse(raw)
            .map_err(|e| ConfigError::Invalid(format!("endpoint.rpc_url '{raw}': {e}")))?;
        match url.scheme() {
            "https" => Ok(url),
            "http" if self.endpoint.allow_insecure_http || escrow_transport::is_loopback(&url) => Ok(url),
            "http" => Err(ConfigError::Invalid(format!(
                "endpoint.rpc_url '{raw}' uses plain http; set allow_insecure_http = true to permit it"
            ))),
            other => Err(ConfigError::Invalid(format!(
                "endpoint.rpc_url scheme '{other}' is not supported"
            ))),
        }
    }

    pub fn identities(&self) -> Result<Vec<Identity>, ConfigError> {
        self.parties
            .iter()
            .map(|party| {
                let name = PartyName::new(party.name.as_str())
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                let credential = Credential::new(party.private_key.as_str())
                    .map_err(|e| ConfigError::Invalid(format!("party '{name}': {e}")))?;
                Ok(Identity::new(name, credential, party.role))
            })
            .collect()
    }

    fn contracts_dir(&self) -> PathBuf {
        self.contract
            .contracts_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTRACTS_DIR))
    }

    /// Deployment descriptor path: explicit, else
    /// `<contracts_dir>/broadcast/EscrowProxy.s.sol/<chain_id>/run-latest.json`.
    pub fn deployment_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.contract.deployment {
            return Ok(path.clone());
        }
        let chain_id = self.endpoint.chain_id.ok_or_else(|| {
            ConfigError::Invalid(
                "contract.deployment is unset and endpoint.chain_id is needed to derive it"
                    .to_string(),
            )
        })?;
        Ok(self
            .contracts_dir()
            .join("broadcast")
            .join(DEPLOYMENT_SCRIPT)
            .join(chain_id.to_string())
            .join("run-latest.json"))
    }

    /// Interface descriptor path: explicit, else `<contracts_dir>/out/Escrow.sol/Escrow.json`.
    #[must_use]
    pub fn interface_path(&self) -> PathBuf {
        self.contract.interface.clone().unwrap_or_else(|| {
            self.contracts_dir()
                .join("out")
                .join(format!("{IMPLEMENTATION_NAME}.sol"))
                .join(format!("{IMPLEMENTATION_NAME}.json"))
        })
    }

    /// Contract address from `contract.address`, else from the deployment descriptor.
    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        if let Some(address) = &self.contract.address {
            return parse_address(address);
        }
        let path = self.deployment_path()?;
        Ok(read_contract_address(&path)?)
    }

    pub fn contract_interface(&self) -> Result<JsonAbi, ConfigError> {
        Ok(read_contract_interface(&self.interface_path())?)
    }

    #[must_use]
    pub fn inclusion_timeout(&self) -> Duration {
        let secs = self
            .transactions
            .as_ref()
            .and_then(|t| t.inclusion_timeout_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_INCLUSION_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        let ms = self
            .transactions
            .as_ref()
            .and_then(|t| t.poll_interval_ms)
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        Duration::from_millis(ms)
    }

    #[must_use]
    pub fn gas_multiplier_percent(&self) -> u32 {
        self.transactions
            .as_ref()
            .and_then(|t| t.gas_multiplier_percent)
            .unwrap_or(DEFAULT_GAS_MULTIPLIER_PERCENT)
            .max(100)
    }
}

impl ContractConfig {
    fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.deployment,
            &mut self.interface,
            &mut self.contracts_dir,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if self.contracts_dir.is_none() && !base.as_os_str().is_empty() {
            self.contracts_dir = Some(base.join(DEFAULT_CONTRACTS_DIR));
        }
    }
}

fn parse_address(raw: &str) -> Result<Address, ConfigError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| ConfigError::Invalid(format!("contract address '{raw}': {e}")))
}
