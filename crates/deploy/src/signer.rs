//! Signing identities and transaction submission.
//!
//! Key material stays inside the [`SignerProvider`] implementation; callers only ever see
//! addresses, signed payloads and transaction hashes.

use std::sync::Arc;

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_core::primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;

use crate::{
    DeployError,
    network::NetworkProfile,
    rpc::{RpcError, RpcTransport},
};

/// A transaction ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub chain_id: u64,
}

/// Raw signed transaction and its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

#[async_trait]
pub trait SignerProvider: Send + Sync {
    /// Address transactions are sent from on `network`.
    async fn current_address(&self, network: &NetworkProfile) -> Result<Address, DeployError>;

    async fn sign(
        &self,
        network: &NetworkProfile,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction, DeployError>;

    /// Broadcast an already-signed transaction.
    ///
    /// Fails with [`DeployError::Transport`] when the node is unreachable (retryable),
    /// [`DeployError::InsufficientFunds`] and [`DeployError::SubmissionRejected`] otherwise.
    async fn submit(
        &self,
        network: &NetworkProfile,
        signed: &SignedTransaction,
    ) -> Result<B256, DeployError>;

    async fn sign_and_submit(
        &self,
        network: &NetworkProfile,
        tx: &UnsignedTransaction,
    ) -> Result<B256, DeployError> {
        let signed = self.sign(network, tx).await?;
        self.submit(network, &signed).await
    }
}

/// Signs with a local secp256k1 key and submits through an [`RpcTransport`].
pub struct LocalKeySigner {
    key: PrivateKeySigner,
    transport: Arc<dyn RpcTransport>,
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.key.address())
            .finish_non_exhaustive()
    }
}

impl LocalKeySigner {
    pub fn new(key: PrivateKeySigner, transport: Arc<dyn RpcTransport>) -> Self {
        Self { key, transport }
    }

    /// Parse a hex-encoded private key (with or without `0x`).
    pub fn from_hex(key: &str, transport: Arc<dyn RpcTransport>) -> Result<Self, DeployError> {
        let key: PrivateKeySigner = key
            .trim()
            .parse()
            .map_err(|_| DeployError::Signing("invalid secp256k1 private key".to_string()))?;
        Ok(Self::new(key, transport))
    }

    /// Read the private key from the environment variable `var`.
    pub fn from_env(var: &str, transport: Arc<dyn RpcTransport>) -> Result<Self, DeployError> {
        let key = std::env::var(var).map_err(|_| {
            DeployError::Signing(format!("environment variable {var} is not set"))
        })?;
        Self::from_hex(&key, transport)
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }
}

#[async_trait]
impl SignerProvider for LocalKeySigner {
    async fn current_address(&self, _network: &NetworkProfile) -> Result<Address, DeployError> {
        Ok(self.key.address())
    }

    async fn sign(
        &self,
        network: &NetworkProfile,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction, DeployError> {
        if tx.chain_id != network.chain_id {
            return Err(DeployError::Signing(format!(
                "transaction chain id {} does not match network {} ({})",
                tx.chain_id, network.name, network.chain_id
            )));
        }

        let legacy = TxLegacy {
            chain_id: Some(tx.chain_id),
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: tx.to.map_or(TxKind::Create, TxKind::Call),
            value: tx.value,
            input: tx.data.clone(),
        };
        let signature = self
            .key
            .sign_hash_sync(&legacy.signature_hash())
            .map_err(|e| DeployError::Signing(e.to_string()))?;

        let signed = legacy.into_signed(signature);
        let hash = *signed.hash();
        let raw = Bytes::from(TxEnvelope::from(signed).encoded_2718());

        tracing::debug!(tx_hash = %hash, nonce = tx.nonce, network = %network.name, "Transaction signed");
        Ok(SignedTransaction { raw, hash })
    }

    async fn submit(
        &self,
        network: &NetworkProfile,
        signed: &SignedTransaction,
    ) -> Result<B256, DeployError> {
        match self
            .transport
            .send_raw_transaction(network, &signed.raw)
            .await
        {
            Ok(hash) => Ok(hash),
            Err(err) => match classify_submission_error(err) {
                // The node already has it: our broadcast went through earlier.
                None => Ok(signed.hash),
                Some(err) => Err(err),
            },
        }
    }
}

/// Map a failed `eth_sendRawTransaction` to the error kind the executor acts on.
///
/// Returns `None` when the node reports that it already knows the transaction.
pub fn classify_submission_error(err: RpcError) -> Option<DeployError> {
    let message = match err {
        RpcError::Transport(msg) => return Some(DeployError::Transport(msg)),
        RpcError::Node { message, .. } => message,
    };

    let lower = message.to_lowercase();
    if lower.contains("already known") || lower.contains("known transaction") {
        None
    } else if lower.contains("insufficient funds") {
        Some(DeployError::InsufficientFunds(message))
    } else if lower.contains("nonce too low")
        || lower.contains("replacement transaction underpriced")
        || lower.contains("rate limit")
        || lower.contains("timeout")
    {
        Some(DeployError::Transport(message))
    } else {
        Some(DeployError::SubmissionRejected(message))
    }
}
