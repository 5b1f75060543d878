//! Error kinds surfaced by the deployment pipeline.

use alloy_core::primitives::{Address, B256};
use thiserror::Error;

/// Every failure the pipeline can report.
///
/// Only [`DeployError::Transport`] and [`DeployError::ExplorerUnavailable`] are retried locally,
/// see [`DeployError::is_retryable`]. Everything else is propagated to the caller as-is.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transaction rejected by node: {0}")]
    SubmissionRejected(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Execution failed in the VM. Found either on chain (with the receipt's tx and block) or
    /// while estimating gas, before anything was broadcast.
    #[error("contract creation reverted: {reason}")]
    ExecutionReverted {
        tx_hash: Option<B256>,
        block_number: Option<u64>,
        reason: String,
    },

    #[error(
        "ledger conflict on {network}/{intent_key}: confirmed at {existing}, refusing to record {attempted}"
    )]
    LedgerConflict {
        network: String,
        intent_key: String,
        existing: Address,
        attempted: Address,
    },

    #[error("chain id mismatch on {network}: expected {expected}, node reports {actual}")]
    ChainIdMismatch {
        network: String,
        expected: u64,
        actual: u64,
    },

    #[error("no receipt for {tx_hash} within the polling budget")]
    ReceiptTimeout { tx_hash: B256 },

    #[error("deployment {intent_key} is not confirmed")]
    NotConfirmed { intent_key: String },

    #[error("explorer rejected verification: {0}")]
    VerificationMismatch(String),

    #[error("explorer did not finish verification of {address} within the polling budget")]
    VerificationTimeout { address: Address },

    #[error("explorer unavailable: {0}")]
    ExplorerUnavailable(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Whether this failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ExplorerUnavailable(_))
    }
}

impl From<reqwest::Error> for DeployError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_kinds_are_retryable() {
        assert!(DeployError::Transport("connection reset".into()).is_retryable());
        assert!(DeployError::ExplorerUnavailable("rate limited".into()).is_retryable());

        assert!(!DeployError::InsufficientFunds("balance 0".into()).is_retryable());
        assert!(!DeployError::SubmissionRejected("bad rlp".into()).is_retryable());
        assert!(
            !DeployError::ExecutionReverted {
                tx_hash: Some(B256::ZERO),
                block_number: Some(1),
                reason: "status 0".into(),
            }
            .is_retryable()
        );
        assert!(!DeployError::VerificationMismatch("bytecode differs".into()).is_retryable());
        assert!(!DeployError::Cancelled.is_retryable());
    }

    #[test]
    fn test_anyhow_context_is_preserved() {
        let err: DeployError = anyhow::anyhow!("disk full")
            .context("Failed to write ledger")
            .into();
        assert_eq!(format!("{err:#}"), "Failed to write ledger: disk full");
    }
}
