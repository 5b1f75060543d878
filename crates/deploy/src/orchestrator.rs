//! End-to-end flow: resolve, deploy, record, verify.

use std::sync::Arc;

use alloy_core::primitives::{Address, B256};

use crate::{
    DeployError,
    artifact::{ArtifactStore, ContractArtifact},
    config::{CompilerConfig, QuayConfig},
    executor::DeploymentExecutor,
    intent::DeploymentIntent,
    ledger::{DeploymentLedger, DeploymentRecord},
    network::{NetworkProfile, NetworkRegistry},
    poll::CancelSignal,
    rpc::RpcTransport,
    signer::SignerProvider,
    verify::{ExplorerClient, VerificationStatus, VerificationSubmitter},
};

/// Optional knobs of a deployment run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentOptions {
    pub gas_limit: Option<u64>,
    /// CREATE2 salt. Deploys through the deterministic-deployment proxy when set.
    pub salt: Option<B256>,
    pub skip_verify: bool,
}

/// Result of [`Orchestrator::run_deployment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentOutcome {
    pub address: Address,
    pub transaction_hash: Option<B256>,
    pub verified: bool,
    pub verification: Option<VerificationStatus>,
}

impl DeploymentOutcome {
    fn new(record: &DeploymentRecord) -> Self {
        Self {
            address: record.address,
            transaction_hash: record.transaction_hash,
            verified: record.verification.is_some_and(|status| status.is_success()),
            verification: record.verification,
        }
    }
}

/// Wires the registry, artifacts, executor and verifier together.
pub struct Orchestrator {
    registry: NetworkRegistry,
    artifacts: ArtifactStore,
    compiler: CompilerConfig,
    executor: DeploymentExecutor,
    verifier: VerificationSubmitter,
}

impl Orchestrator {
    pub fn new(
        registry: NetworkRegistry,
        artifacts: ArtifactStore,
        compiler: CompilerConfig,
        executor: DeploymentExecutor,
        verifier: VerificationSubmitter,
    ) -> Self {
        Self {
            registry,
            artifacts,
            compiler,
            executor,
            verifier,
        }
    }

    /// Build an orchestrator from loaded configuration and the given backends.
    pub fn from_config(
        config: &QuayConfig,
        registry: NetworkRegistry,
        transport: Arc<dyn RpcTransport>,
        signer: Arc<dyn SignerProvider>,
        explorer: Arc<dyn ExplorerClient>,
        cancel: CancelSignal,
    ) -> Result<Self, DeployError> {
        let ledger = Arc::new(DeploymentLedger::open(&config.paths.ledger)?);
        let executor = DeploymentExecutor::new(
            transport,
            signer,
            ledger,
            config.gas,
            config.retry,
            config.receipt_poll,
        )
        .with_cancel(cancel.clone());
        let verifier =
            VerificationSubmitter::new(explorer, config.retry, config.verification_poll, cancel);

        Ok(Self::new(
            registry,
            ArtifactStore::new(&config.paths.artifacts),
            config.compiler.clone(),
            executor,
            verifier,
        ))
    }

    pub fn ledger(&self) -> &DeploymentLedger {
        self.executor.ledger()
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    /// Deploy `contract_name` with `constructor_args` on `network_name` and verify it.
    pub async fn run_deployment(
        &self,
        contract_name: &str,
        constructor_args: &[String],
        network_name: &str,
    ) -> Result<DeploymentOutcome, DeployError> {
        self.run_deployment_with(
            contract_name,
            constructor_args,
            network_name,
            &DeploymentOptions::default(),
        )
        .await
    }

    /// [`Self::run_deployment`] with explicit options.
    pub async fn run_deployment_with(
        &self,
        contract_name: &str,
        constructor_args: &[String],
        network_name: &str,
        options: &DeploymentOptions,
    ) -> Result<DeploymentOutcome, DeployError> {
        let (artifact, intent) =
            self.intent(contract_name, constructor_args, network_name, options)?;
        let record = self.executor.deploy(&intent).await?;

        if options.skip_verify {
            tracing::info!(address = %record.address, "Skipping verification");
            return Ok(DeploymentOutcome::new(&record));
        }
        self.verify_record(&artifact, &intent, record).await
    }

    /// Verify an already confirmed deployment without touching the chain.
    pub async fn verify_deployment(
        &self,
        contract_name: &str,
        constructor_args: &[String],
        network_name: &str,
        salt: Option<B256>,
    ) -> Result<DeploymentOutcome, DeployError> {
        let options = DeploymentOptions {
            salt,
            ..Default::default()
        };
        let (artifact, intent) =
            self.intent(contract_name, constructor_args, network_name, &options)?;
        let key = intent.key();

        let record = self
            .ledger()
            .get(&intent.network.name, &key)?
            .filter(DeploymentRecord::is_confirmed)
            .ok_or_else(|| DeployError::NotConfirmed {
                intent_key: key.to_string(),
            })?;
        self.verify_record(&artifact, &intent, record).await
    }

    fn intent(
        &self,
        contract_name: &str,
        constructor_args: &[String],
        network_name: &str,
        options: &DeploymentOptions,
    ) -> Result<(ContractArtifact, DeploymentIntent), DeployError> {
        let network = self.registry.resolve(network_name)?;
        let artifact = self.artifacts.load(contract_name)?;
        let intent = DeploymentIntent::from_artifact(&artifact, constructor_args, network)?
            .with_gas_limit(options.gas_limit)
            .with_salt(options.salt);
        Ok((artifact, intent))
    }

    async fn verify_record(
        &self,
        artifact: &ContractArtifact,
        intent: &DeploymentIntent,
        record: DeploymentRecord,
    ) -> Result<DeploymentOutcome, DeployError> {
        let network: &NetworkProfile = &intent.network;

        if record.verification.is_some_and(|status| status.is_success()) {
            tracing::info!(address = %record.address, "Already verified, skipping");
            return Ok(DeploymentOutcome::new(&record));
        }
        if !network.has_explorer_credentials() {
            tracing::warn!(
                network = %network.name,
                address = %record.address,
                "No explorer API key configured, skipping verification"
            );
            return Ok(DeploymentOutcome::new(&record));
        }

        let (bundle, settings) = self.artifacts.source_bundle(artifact, &self.compiler)?;
        let result = self
            .verifier
            .verify(
                &record,
                intent.network.clone(),
                bundle,
                &intent.encoded_args,
                &settings,
            )
            .await;

        let status = match &result {
            Ok(request) => request.status,
            Err(DeployError::VerificationMismatch(_)) => VerificationStatus::Failed,
            Err(_) => VerificationStatus::Pending,
        };
        let record = match self.ledger().record_verification(
            &record.network,
            &record.intent_key,
            status,
        ) {
            Ok(updated) => updated,
            // The verification error is the one worth reporting.
            Err(ledger_err) if result.is_err() => {
                tracing::error!(
                    address = %record.address,
                    status = %status,
                    error = %ledger_err,
                    "Failed to record verification status"
                );
                record
            }
            Err(ledger_err) => return Err(ledger_err),
        };

        result?;
        if let Some(browser) = &network.explorer_browser_url {
            tracing::info!(
                url = %format!("{}address/{}#code", browser, record.address),
                "Verified source available"
            );
        }
        Ok(DeploymentOutcome::new(&record))
    }
}
