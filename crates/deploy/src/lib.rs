//! quay-deploy - Deploy-and-verify library for EVM contracts.
//!
//! This crate deploys compiled contracts to configured networks, remembers every deployment in a
//! durable ledger so reruns never redeploy, and submits the sources to the network's block
//! explorer for verification.

mod error;
pub use error::DeployError;

pub mod config;
pub use config::{
    CompilerConfig, ExplorerConfig, GasPolicy, NetworkConfig, PathsConfig, PollPolicy, QuayConfig,
    RetryPolicy, SignerConfig, QUAY_CONFIG_FILENAME,
};

mod network;
pub use network::{NetworkProfile, NetworkRegistry};

mod poll;
pub use poll::{CancelHandle, CancelSignal};

pub mod rpc;
pub use rpc::{HttpTransport, RpcTransport};

mod signer;
pub use signer::{LocalKeySigner, SignedTransaction, SignerProvider, UnsignedTransaction};

mod artifact;
pub use artifact::{ArtifactStore, CompilerSettings, ContractArtifact, SourceBundle};

mod intent;
pub use intent::{AddressScheme, CREATE2_DEPLOYER, DeploymentIntent, IntentKey};

mod ledger;
pub use ledger::{DeploymentLedger, DeploymentRecord, DeploymentStatus, IntentGuard};

mod executor;
pub use executor::DeploymentExecutor;

pub mod verify;
pub use verify::{
    EtherscanClient, ExplorerClient, VerificationRequest, VerificationStatus,
    VerificationSubmitter,
};

mod orchestrator;
pub use orchestrator::{DeploymentOptions, DeploymentOutcome, Orchestrator};

#[cfg(test)]
pub(crate) mod testing;
