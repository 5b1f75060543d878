//! Source verification on Etherscan-compatible block explorers.

use std::sync::Arc;

use alloy_core::primitives::{Address, Bytes};
use async_trait::async_trait;
use backon::Retryable;
use serde::{Deserialize, Serialize};

use crate::{
    DeployError,
    artifact::{CompilerSettings, SourceBundle},
    config::{PollPolicy, RetryPolicy},
    ledger::DeploymentRecord,
    network::NetworkProfile,
    poll::{CancelSignal, PollError, PollStatus, poll_until},
};

/// Lifecycle of a verification request.
///
/// `Verified`, `AlreadyVerified` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    NotSubmitted,
    Pending,
    Verified,
    AlreadyVerified,
    Failed,
}

impl VerificationStatus {
    /// Whether the explorer now shows verified source for the address.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified | Self::AlreadyVerified)
    }
}

/// A verification submitted (or about to be) for one confirmed deployment.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub address: Address,
    pub network: Arc<NetworkProfile>,
    pub source_bundle: SourceBundle,
    /// Hex, without `0x`, as explorers expect.
    pub encoded_constructor_args: String,
    /// Explorer-side submission id.
    pub guid: Option<String>,
    pub status: VerificationStatus,
}

/// What the explorer answered to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted { guid: String },
    AlreadyVerified,
}

/// What the explorer reports for a submission id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResponse {
    Pending,
    Verified,
    AlreadyVerified,
}

/// Remote verification service.
///
/// Implementations return [`DeployError::ExplorerUnavailable`] for transient conditions
/// (rate limits, 5xx, contract not yet indexed) and [`DeployError::VerificationMismatch`] for a
/// definitive rejection.
#[async_trait]
pub trait ExplorerClient: Send + Sync {
    async fn submit(
        &self,
        request: &VerificationRequest,
        settings: &CompilerSettings,
    ) -> Result<SubmitResponse, DeployError>;

    async fn check_status(
        &self,
        network: &NetworkProfile,
        guid: &str,
    ) -> Result<CheckResponse, DeployError>;
}

/// Raw `{status, message, result}` envelope of the Etherscan API.
#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: serde_json::Value,
}

impl EtherscanResponse {
    fn result_text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// [`ExplorerClient`] for the Etherscan family of explorers.
#[derive(Debug, Clone)]
pub struct EtherscanClient {
    client: reqwest::Client,
}

impl EtherscanClient {
    pub fn new() -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: crate::rpc::create_client()?,
        })
    }

    async fn read_response(response: reqwest::Response) -> Result<EtherscanResponse, DeployError> {
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DeployError::ExplorerUnavailable(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| DeployError::ExplorerUnavailable(format!("unreadable response: {e}")))
    }
}

#[async_trait]
impl ExplorerClient for EtherscanClient {
    async fn submit(
        &self,
        request: &VerificationRequest,
        settings: &CompilerSettings,
    ) -> Result<SubmitResponse, DeployError> {
        let network = &request.network;
        let source = serde_json::to_string(&request.source_bundle.standard_json_input)
            .map_err(anyhow::Error::from)?;
        let address = request.address.to_string();
        let chain_id = network.chain_id.to_string();
        let runs = settings.runs.to_string();
        let version = settings.explorer_version();

        let form = [
            ("apikey", network.explorer_api_key.as_str()),
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("chainid", chain_id.as_str()),
            ("contractaddress", address.as_str()),
            ("sourceCode", source.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", request.source_bundle.contract_name.as_str()),
            ("compilerversion", version.as_str()),
            ("optimizationUsed", if settings.optimizer { "1" } else { "0" }),
            ("runs", runs.as_str()),
            ("constructorArguements", request.encoded_constructor_args.as_str()),
        ];

        let response = self
            .client
            .post(network.explorer_api_url.clone())
            .query(&[("chainid", chain_id.as_str())])
            .form(&form)
            .send()
            .await
            .map_err(|e| DeployError::ExplorerUnavailable(e.to_string()))?;

        classify_submit(Self::read_response(response).await?)
    }

    async fn check_status(
        &self,
        network: &NetworkProfile,
        guid: &str,
    ) -> Result<CheckResponse, DeployError> {
        let chain_id = network.chain_id.to_string();
        let response = self
            .client
            .get(network.explorer_api_url.clone())
            .query(&[
                ("apikey", network.explorer_api_key.as_str()),
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("chainid", chain_id.as_str()),
                ("guid", guid),
            ])
            .send()
            .await
            .map_err(|e| DeployError::ExplorerUnavailable(e.to_string()))?;

        classify_check(Self::read_response(response).await?)
    }
}

fn is_transient(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("unable to locate contractcode")
        || lower.contains("try again later")
        || lower.contains("timeout")
}

fn classify_submit(response: EtherscanResponse) -> Result<SubmitResponse, DeployError> {
    let text = response.result_text();
    if text.to_lowercase().contains("already verified") {
        return Ok(SubmitResponse::AlreadyVerified);
    }
    if response.status == "1" {
        return Ok(SubmitResponse::Accepted { guid: text });
    }
    if is_transient(&text) {
        return Err(DeployError::ExplorerUnavailable(text));
    }
    Err(DeployError::VerificationMismatch(format!(
        "{}: {}",
        response.message, text
    )))
}

fn classify_check(response: EtherscanResponse) -> Result<CheckResponse, DeployError> {
    let text = response.result_text();
    let lower = text.to_lowercase();

    if lower.contains("already verified") {
        Ok(CheckResponse::AlreadyVerified)
    } else if lower.starts_with("pass") {
        Ok(CheckResponse::Verified)
    } else if lower.contains("pending") || lower.contains("in queue") {
        Ok(CheckResponse::Pending)
    } else if is_transient(&text) {
        Err(DeployError::ExplorerUnavailable(text))
    } else {
        Err(DeployError::VerificationMismatch(text))
    }
}

/// Drives a verification from submission to a terminal status.
pub struct VerificationSubmitter {
    explorer: Arc<dyn ExplorerClient>,
    retry: RetryPolicy,
    poll: PollPolicy,
    cancel: CancelSignal,
}

impl VerificationSubmitter {
    pub fn new(
        explorer: Arc<dyn ExplorerClient>,
        retry: RetryPolicy,
        poll: PollPolicy,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            explorer,
            retry,
            poll,
            cancel,
        }
    }

    /// Verify the contract of a confirmed deployment.
    ///
    /// Returns the request in a successful terminal state. A definitive rejection surfaces as
    /// [`DeployError::VerificationMismatch`], an exhausted budget as
    /// [`DeployError::VerificationTimeout`].
    pub async fn verify(
        &self,
        record: &DeploymentRecord,
        network: Arc<NetworkProfile>,
        source_bundle: SourceBundle,
        encoded_constructor_args: &Bytes,
        settings: &CompilerSettings,
    ) -> Result<VerificationRequest, DeployError> {
        if !record.is_confirmed() {
            return Err(DeployError::NotConfirmed {
                intent_key: record.intent_key.to_string(),
            });
        }

        let mut request = VerificationRequest {
            address: record.address,
            network,
            source_bundle,
            encoded_constructor_args: hex::encode(encoded_constructor_args),
            guid: None,
            status: VerificationStatus::NotSubmitted,
        };

        tracing::info!(
            address = %request.address,
            network = %request.network.name,
            contract = %request.source_bundle.contract_name,
            "Submitting verification..."
        );

        let pending = &request;
        let submission = (|| async move { self.explorer.submit(pending, settings).await })
            .retry(self.retry.backoff())
            .sleep(tokio::time::sleep)
            .when(DeployError::is_retryable)
            .notify(|err: &DeployError, dur| {
                tracing::warn!(error = %err, retry_in = ?dur, "Verification submission failed, retrying...");
            });
        let submitted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
            submitted = submission => submitted,
        };

        let guid = match submitted {
            Ok(SubmitResponse::AlreadyVerified) => {
                tracing::info!(address = %request.address, "Contract already verified");
                request.status = VerificationStatus::AlreadyVerified;
                return Ok(request);
            }
            Ok(SubmitResponse::Accepted { guid }) => guid,
            Err(e) => return Err(failed(&request, e)),
        };

        tracing::info!(guid = %guid, "Verification submitted, waiting for explorer...");
        request.guid = Some(guid.clone());
        request.status = VerificationStatus::Pending;

        let network = request.network.clone();
        let outcome = poll_until("verification status", &self.poll, &self.cancel, || {
            let network = network.clone();
            let guid = guid.clone();
            async move {
                let status = match self.explorer.check_status(&network, &guid).await? {
                    CheckResponse::Pending => PollStatus::NotYet,
                    CheckResponse::Verified => PollStatus::Ready(VerificationStatus::Verified),
                    CheckResponse::AlreadyVerified => {
                        PollStatus::Ready(VerificationStatus::AlreadyVerified)
                    }
                };
                Ok::<_, DeployError>(status)
            }
        })
        .await;

        match outcome {
            Ok(status) => {
                tracing::info!(address = %request.address, status = %status, "Verification complete");
                request.status = status;
                Ok(request)
            }
            Err(PollError::Fatal(e)) => Err(failed(&request, e)),
            Err(PollError::Exhausted(last)) => {
                if let Some(e) = last {
                    tracing::warn!(error = %e, "Last explorer error before giving up");
                }
                let address = request.address;
                Err(failed(&request, DeployError::VerificationTimeout { address }))
            }
            Err(PollError::Cancelled) => Err(DeployError::Cancelled),
        }
    }
}

fn failed(request: &VerificationRequest, err: DeployError) -> DeployError {
    tracing::error!(address = %request.address, error = %err, "Verification failed");
    err
}
