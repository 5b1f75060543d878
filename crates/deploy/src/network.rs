//! Registry of the networks a deployment can target.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock},
};

use url::Url;

use crate::{DeployError, config::QuayConfig};

static REGISTRY: OnceLock<NetworkRegistry> = OnceLock::new();

/// Everything needed to talk to one network and its explorer.
///
/// Immutable once loaded. The chain id binds the profile to exactly one explorer chain mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: String,
    pub rpc_url: Url,
    pub chain_id: u64,
    pub explorer_api_url: Url,
    pub explorer_browser_url: Option<Url>,
    pub explorer_api_key: String,
}

impl NetworkProfile {
    /// Whether verification can be attempted on this network.
    pub fn has_explorer_credentials(&self) -> bool {
        !self.explorer_api_key.is_empty()
    }
}

impl std::fmt::Debug for NetworkProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProfile")
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url.as_str())
            .field("chain_id", &self.chain_id)
            .field("explorer_api_url", &self.explorer_api_url.as_str())
            .field("explorer_api_key", &"<redacted>")
            .finish()
    }
}

/// Read-only lookup of [`NetworkProfile`]s by name.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    profiles: BTreeMap<String, Arc<NetworkProfile>>,
}

impl NetworkRegistry {
    /// Build the registry from configuration, resolving explorer API keys.
    pub fn from_config(config: &QuayConfig) -> Result<Self, DeployError> {
        let mut profiles = BTreeMap::new();
        let mut explorers_by_chain: HashMap<u64, (String, Url)> = HashMap::new();

        for (name, network) in &config.networks {
            check_network_name(name)?;
            if network.chain_id == 0 {
                return Err(DeployError::Config(format!(
                    "network '{name}' has chain id 0"
                )));
            }

            let rpc_url = parse_url(name, "rpc_url", &network.rpc_url)?;
            let explorer_api_url = parse_url(name, "explorer.api_url", &network.explorer.api_url)?;
            let explorer_browser_url = network
                .explorer
                .browser_url
                .as_deref()
                .map(|url| parse_url(name, "explorer.browser_url", url))
                .transpose()?;

            if let Some((other, other_url)) = explorers_by_chain.get(&network.chain_id) {
                if other_url != &explorer_api_url {
                    return Err(DeployError::Config(format!(
                        "networks '{other}' and '{name}' share chain id {} but use different explorers",
                        network.chain_id
                    )));
                }
            }
            explorers_by_chain.insert(network.chain_id, (name.clone(), explorer_api_url.clone()));

            profiles.insert(
                name.clone(),
                Arc::new(NetworkProfile {
                    name: name.clone(),
                    rpc_url,
                    chain_id: network.chain_id,
                    explorer_api_url,
                    explorer_browser_url,
                    explorer_api_key: network.explorer.resolve_api_key(),
                }),
            );
        }

        Ok(Self { profiles })
    }

    /// Build a registry from already-constructed profiles.
    pub fn from_profiles(profiles: impl IntoIterator<Item = NetworkProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), Arc::new(profile)))
                .collect(),
        }
    }

    /// Look up a network by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<NetworkProfile>, DeployError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| DeployError::UnknownNetwork(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Install the process-wide registry. Can only happen once.
    pub fn install(self) -> Result<&'static Self, DeployError> {
        REGISTRY
            .set(self)
            .map_err(|_| DeployError::Config("network registry already installed".to_string()))?;
        Ok(Self::global().expect("registry was just installed"))
    }

    /// The process-wide registry, if installed.
    pub fn global() -> Option<&'static Self> {
        REGISTRY.get()
    }
}

/// Network names become ledger file names, so they must be plain path components.
pub(crate) fn check_network_name(name: &str) -> Result<(), DeployError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(DeployError::Config(format!("invalid network name '{name}'")))
    }
}

fn parse_url(network: &str, field: &str, value: &str) -> Result<Url, DeployError> {
    Url::parse(value).map_err(|e| {
        DeployError::Config(format!("network '{network}': invalid {field} '{value}': {e}"))
    })
}
