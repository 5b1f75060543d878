//! Deployment intents and their content-addressed idempotency key.

use std::sync::Arc;

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, address, keccak256},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{DeployError, artifact::ContractArtifact, network::NetworkProfile};

/// The deterministic-deployment proxy present at the same address on most EVM chains.
///
/// Calldata is `salt ‖ init_code`; the proxy performs `CREATE2` with that salt.
pub const CREATE2_DEPLOYER: Address = address!("4e59b44847b379578588920cA78FbF26c0B4956C");

/// Deterministic identifier of a deployment intent, hex-encoded SHA-256.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Deref,
    derive_more::From,
)]
#[serde(transparent)]
pub struct IntentKey(String);

impl IntentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IntentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the address of the deployed contract is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "scheme", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AddressScheme {
    /// Plain contract-creation transaction, address from sender and nonce.
    Nonce,
    /// Through [`CREATE2_DEPLOYER`], address from salt and init code.
    Create2 { salt: B256 },
}

/// Fields that identify a deployment. Serialized to JSON and hashed.
#[derive(Serialize)]
struct IntentKeyPreimage<'a> {
    contract_name: &'a str,
    constructor_args: &'a Bytes,
    network: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    salt: Option<B256>,
}

/// One logical "deploy this contract with these arguments on this network".
#[derive(Debug, Clone)]
pub struct DeploymentIntent {
    pub contract_name: String,
    pub constructor_args: Vec<DynSolValue>,
    pub network: Arc<NetworkProfile>,
    /// Explicit gas limit. When unset the estimate plus the policy margin is used.
    pub gas_limit: Option<u64>,
    /// Optional CREATE2 salt for deterministic placement.
    pub salt: Option<B256>,
    /// Creation bytecode, without constructor arguments.
    pub bytecode: Bytes,
    /// ABI-encoded constructor arguments.
    pub encoded_args: Bytes,
}

impl DeploymentIntent {
    /// Build an intent from a compiled artifact and textual constructor arguments.
    pub fn from_artifact(
        artifact: &ContractArtifact,
        args: &[String],
        network: Arc<NetworkProfile>,
    ) -> Result<Self, DeployError> {
        let constructor_args = artifact.parse_constructor_args(args)?;
        let encoded_args = artifact.encode_constructor_args(&constructor_args)?;

        Ok(Self {
            contract_name: artifact.contract_name.clone(),
            constructor_args,
            network,
            gas_limit: None,
            salt: None,
            bytecode: artifact.bytecode.clone(),
            encoded_args,
        })
    }

    pub fn with_gas_limit(mut self, gas_limit: Option<u64>) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_salt(mut self, salt: Option<B256>) -> Self {
        self.salt = salt;
        self
    }

    pub fn address_scheme(&self) -> AddressScheme {
        match self.salt {
            Some(salt) => AddressScheme::Create2 { salt },
            None => AddressScheme::Nonce,
        }
    }

    /// Bytecode followed by the encoded constructor arguments.
    pub fn init_code(&self) -> Bytes {
        let mut code = Vec::with_capacity(self.bytecode.len() + self.encoded_args.len());
        code.extend_from_slice(&self.bytecode);
        code.extend_from_slice(&self.encoded_args);
        code.into()
    }

    /// Compute the idempotency key.
    ///
    /// Covers the contract name, the ABI-encoded arguments, the network name and the CREATE2
    /// salt if any. The bytecode is deliberately not part of the key: recompiling does not make
    /// an already-deployed intent deployable again.
    pub fn key(&self) -> IntentKey {
        let preimage = IntentKeyPreimage {
            contract_name: &self.contract_name,
            constructor_args: &self.encoded_args,
            network: &self.network.name,
            salt: self.salt,
        };
        let json = serde_json::to_vec(&preimage)
            .expect("IntentKeyPreimage serialization should never fail");

        let mut hasher = Sha256::new();
        hasher.update(&json);
        IntentKey(hex::encode(hasher.finalize()))
    }

    /// Recipient and calldata of the deployment transaction.
    pub fn transaction_target(&self) -> (Option<Address>, Bytes) {
        match self.address_scheme() {
            AddressScheme::Nonce => (None, self.init_code()),
            AddressScheme::Create2 { salt } => {
                let init_code = self.init_code();
                let mut data = Vec::with_capacity(32 + init_code.len());
                data.extend_from_slice(salt.as_slice());
                data.extend_from_slice(&init_code);
                (Some(CREATE2_DEPLOYER), data.into())
            }
        }
    }

    /// Address the contract will land at when sent by `sender` with `nonce`.
    pub fn predicted_address(&self, sender: Address, nonce: u64) -> Address {
        match self.address_scheme() {
            AddressScheme::Nonce => sender.create(nonce),
            AddressScheme::Create2 { salt } => {
                CREATE2_DEPLOYER.create2(salt, keccak256(self.init_code()))
            }
        }
    }
}
