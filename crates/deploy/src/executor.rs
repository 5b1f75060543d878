//! Contract-creation transactions, from intent to confirmed ledger record.

use std::{future::Future, sync::Arc};

use alloy_core::primitives::{Address, B256, U256};
use backon::{BackoffBuilder, Retryable};

use crate::{
    DeployError,
    config::{GasPolicy, PollPolicy, RetryPolicy},
    intent::{AddressScheme, DeploymentIntent, IntentKey},
    ledger::{DeploymentLedger, DeploymentRecord, DeploymentStatus},
    network::NetworkProfile,
    poll::{CancelSignal, PollError, PollStatus, poll_until},
    rpc::{CallRequest, RpcError, RpcTransport, TransactionReceipt},
    signer::{SignedTransaction, SignerProvider, UnsignedTransaction},
};

/// Deploys contracts and keeps the ledger in step with the chain.
pub struct DeploymentExecutor {
    transport: Arc<dyn RpcTransport>,
    signer: Arc<dyn SignerProvider>,
    ledger: Arc<DeploymentLedger>,
    gas: GasPolicy,
    retry: RetryPolicy,
    receipt_poll: PollPolicy,
    cancel: CancelSignal,
}

impl DeploymentExecutor {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        signer: Arc<dyn SignerProvider>,
        ledger: Arc<DeploymentLedger>,
        gas: GasPolicy,
        retry: RetryPolicy,
        receipt_poll: PollPolicy,
    ) -> Self {
        Self {
            transport,
            signer,
            ledger,
            gas,
            retry,
            receipt_poll,
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &Arc<DeploymentLedger> {
        &self.ledger
    }

    /// Deploy `intent`, or return its existing confirmed record.
    ///
    /// A confirmed record short-circuits before any RPC call. A record left pending by an
    /// interrupted run, or failed before its transaction was seen on chain, is re-checked against
    /// the chain before anything is broadcast again.
    pub async fn deploy(&self, intent: &DeploymentIntent) -> Result<DeploymentRecord, DeployError> {
        let network = intent.network.as_ref();
        let key = intent.key();
        let _guard = self.ledger.lock_intent(&network.name, &key).await?;

        let existing = self.ledger.get(&network.name, &key)?;
        if let Some(record) = existing.as_ref().filter(|r| r.is_confirmed()) {
            tracing::info!(
                contract = %intent.contract_name,
                network = %network.name,
                address = %record.address,
                "Already deployed, skipping"
            );
            return Ok(record.clone());
        }

        self.check_chain_id(network).await?;

        let previous_attempts = existing.as_ref().map_or(0, |r| r.attempt);
        if let Some(record) = existing.filter(is_unresolved)
            && let Some(record) = self.recover(intent, record).await?
        {
            return Ok(record);
        }

        if let Some(record) = self.adopt_existing_create2(intent, &key, previous_attempts).await? {
            return Ok(record);
        }

        tracing::info!(
            contract = %intent.contract_name,
            network = %network.name,
            intent_key = %key,
            scheme = %intent.address_scheme(),
            "Deploying contract..."
        );

        let (record, signed) = self.broadcast(intent, &key, previous_attempts).await?;
        let receipt = self.await_receipt(network, signed.hash).await?;
        self.finalize(intent, record, receipt)
    }

    async fn check_chain_id(&self, network: &NetworkProfile) -> Result<(), DeployError> {
        let actual = self
            .read("chain id", || async move {
                self.transport.chain_id(network).await.map_err(DeployError::from)
            })
            .await?;
        if actual != network.chain_id {
            return Err(DeployError::ChainIdMismatch {
                network: network.name.clone(),
                expected: network.chain_id,
                actual,
            });
        }
        Ok(())
    }

    /// Run an idempotent chain read, retrying transient failures with backoff.
    async fn read<T, F, Fut>(&self, what: &str, op: F) -> Result<T, DeployError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeployError>>,
    {
        let retried = op
            .retry(self.retry.backoff())
            .sleep(tokio::time::sleep)
            .when(DeployError::is_retryable)
            .notify(|err: &DeployError, dur| {
                tracing::warn!(what, error = %err, retry_in = ?dur, "Chain read failed, retrying...");
            });

        tokio::select! {
            biased;
            result = retried => result,
            _ = self.cancel.cancelled() => Err(DeployError::Cancelled),
        }
    }

    /// Whether the node has seen `hash`. Errors count as "no".
    async fn reached_node(&self, network: &NetworkProfile, hash: B256) -> bool {
        matches!(self.transport.transaction_known(network, hash).await, Ok(true))
    }

    /// Reconcile an unresolved record with the chain.
    ///
    /// Returns `None` when the node has never seen the recorded transaction, in which case it is
    /// safe to submit a new one.
    async fn recover(
        &self,
        intent: &DeploymentIntent,
        record: DeploymentRecord,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        let network = intent.network.as_ref();
        let Some(hash) = record.transaction_hash else {
            return Ok(None);
        };

        tracing::info!(
            tx_hash = %hash,
            network = %network.name,
            status = %record.status,
            "Found unresolved deployment, checking chain state..."
        );

        let receipt = self
            .read("transaction receipt", || async move {
                self.transport
                    .transaction_receipt(network, hash)
                    .await
                    .map_err(DeployError::from)
            })
            .await?;
        if let Some(receipt) = receipt {
            return self.finalize(intent, record, receipt).map(Some);
        }

        let known = self
            .read("transaction lookup", || async move {
                self.transport
                    .transaction_known(network, hash)
                    .await
                    .map_err(DeployError::from)
            })
            .await?;
        if known {
            tracing::info!(tx_hash = %hash, "Transaction still in mempool, waiting for inclusion...");
            let receipt = self.await_receipt(network, hash).await?;
            return self.finalize(intent, record, receipt).map(Some);
        }

        tracing::warn!(tx_hash = %hash, "Recorded transaction unknown to node, submitting again");
        Ok(None)
    }

    /// A CREATE2 address that already holds code cannot be deployed to again. Record it as is.
    async fn adopt_existing_create2(
        &self,
        intent: &DeploymentIntent,
        key: &IntentKey,
        previous_attempts: u32,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        if intent.address_scheme() == AddressScheme::Nonce {
            return Ok(None);
        }

        let network = intent.network.as_ref();
        let sender = self.sender(network).await?;
        let address = intent.predicted_address(sender, 0);
        let code = self
            .read("contract code", || async move {
                self.transport
                    .code_at(network, address)
                    .await
                    .map_err(DeployError::from)
            })
            .await?;
        if code.is_empty() {
            return Ok(None);
        }

        tracing::info!(address = %address, "Deterministic address already has code, recording it");
        let record = self.ledger.put(DeploymentRecord {
            intent_key: key.clone(),
            network: network.name.clone(),
            contract_name: intent.contract_name.clone(),
            address,
            deployer: sender,
            nonce: 0,
            transaction_hash: None,
            block_number: None,
            status: DeploymentStatus::Confirmed,
            attempt: previous_attempts,
            failure: None,
            verification: None,
            updated_at: 0,
        })?;
        Ok(Some(record))
    }

    async fn sender(&self, network: &NetworkProfile) -> Result<Address, DeployError> {
        self.read("signer address", || async move {
            self.signer.current_address(network).await
        })
        .await
    }

    /// Sign, record and submit, retrying transient failures with backoff.
    async fn broadcast(
        &self,
        intent: &DeploymentIntent,
        key: &IntentKey,
        previous_attempts: u32,
    ) -> Result<(DeploymentRecord, SignedTransaction), DeployError> {
        let network = intent.network.as_ref();
        let sender = self.sender(network).await?;
        let mut backoff = self.retry.backoff().build();
        let mut attempt = previous_attempts;
        let mut last: Option<(DeploymentRecord, SignedTransaction)> = None;

        loop {
            // A failed submit may still have reached the node.
            if let Some((record, signed)) = last.take() {
                if self.reached_node(network, signed.hash).await {
                    tracing::info!(tx_hash = %signed.hash, "Earlier submission reached the node");
                    return Ok((record, signed));
                }
                last = Some((record, signed));
            }

            attempt += 1;
            let err = match self.prepare(intent, key, sender, attempt).await {
                Ok((record, signed)) => match self.signer.submit(network, &signed).await {
                    Ok(hash) => {
                        tracing::info!(
                            tx_hash = %hash,
                            nonce = record.nonce,
                            address = %record.address,
                            attempt,
                            "Deployment transaction submitted"
                        );
                        return Ok((record, signed));
                    }
                    Err(err) => {
                        last = Some((record, signed));
                        err
                    }
                },
                Err(err) => err,
            };

            let delay = if err.is_retryable() { backoff.next() } else { None };
            let Some(delay) = delay else {
                if let Some((record, signed)) = last {
                    if self.reached_node(network, signed.hash).await {
                        tracing::info!(tx_hash = %signed.hash, "Last submission reached the node");
                        return Ok((record, signed));
                    }
                    self.mark_failed(record, &err)?;
                }
                tracing::error!(network = %network.name, attempt, error = %err, "Deployment submission failed");
                return Err(err);
            };

            tracing::warn!(attempt, error = %err, retry_in = ?delay, "Submission failed, retrying...");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
            }
        }
    }

    /// Build and sign the creation transaction, then write it as pending.
    async fn prepare(
        &self,
        intent: &DeploymentIntent,
        key: &IntentKey,
        sender: Address,
        attempt: u32,
    ) -> Result<(DeploymentRecord, SignedTransaction), DeployError> {
        let network = intent.network.as_ref();
        let nonce = self.transport.transaction_count(network, sender).await?;
        let (to, data) = intent.transaction_target();

        let gas_limit = match intent.gas_limit {
            Some(limit) => limit,
            None => {
                let call = CallRequest {
                    from: sender,
                    to,
                    data: data.clone(),
                };
                let estimate = self
                    .transport
                    .estimate_gas(network, &call)
                    .await
                    .map_err(classify_estimation_error)?;
                self.gas.gas_limit(estimate)
            }
        };
        let gas_price = self.gas.gas_price(self.transport.gas_price(network).await?);

        let tx = UnsignedTransaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value: U256::ZERO,
            data,
            chain_id: network.chain_id,
        };
        let signed = self.signer.sign(network, &tx).await?;

        let record = self.ledger.put(DeploymentRecord {
            intent_key: key.clone(),
            network: network.name.clone(),
            contract_name: intent.contract_name.clone(),
            address: intent.predicted_address(sender, nonce),
            deployer: sender,
            nonce,
            transaction_hash: Some(signed.hash),
            block_number: None,
            status: DeploymentStatus::Pending,
            attempt,
            failure: None,
            verification: None,
            updated_at: 0,
        })?;

        tracing::debug!(nonce, gas_limit, gas_price, tx_hash = %signed.hash, "Deployment transaction prepared");
        Ok((record, signed))
    }

    async fn await_receipt(
        &self,
        network: &NetworkProfile,
        hash: B256,
    ) -> Result<TransactionReceipt, DeployError> {
        poll_until("transaction receipt", &self.receipt_poll, &self.cancel, || async move {
            Ok::<_, DeployError>(match self.transport.transaction_receipt(network, hash).await? {
                Some(receipt) => PollStatus::Ready(receipt),
                None => PollStatus::NotYet,
            })
        })
        .await
        .map_err(|e| match e {
            PollError::Exhausted(_) => DeployError::ReceiptTimeout { tx_hash: hash },
            PollError::Cancelled => DeployError::Cancelled,
            PollError::Fatal(e) => e,
        })
    }

    fn finalize(
        &self,
        intent: &DeploymentIntent,
        mut record: DeploymentRecord,
        receipt: TransactionReceipt,
    ) -> Result<DeploymentRecord, DeployError> {
        let tx_hash = receipt.transaction_hash;
        let block_number = receipt.block();
        record.transaction_hash = Some(tx_hash);
        record.block_number = Some(block_number);

        if !receipt.succeeded() {
            let err = DeployError::ExecutionReverted {
                tx_hash: Some(tx_hash),
                block_number: Some(block_number),
                reason: format!("tx {tx_hash} failed in block {block_number}"),
            };
            self.mark_failed(record, &err)?;
            tracing::error!(tx_hash = %tx_hash, block_number, "Contract creation reverted");
            return Err(err);
        }

        if intent.address_scheme() == AddressScheme::Nonce
            && let Some(actual) = receipt.contract_address
            && actual != record.address
        {
            let err = DeployError::Other(anyhow::anyhow!(
                "receipt of {tx_hash} reports contract at {actual}, expected {}",
                record.address
            ));
            self.mark_failed(record, &err)?;
            return Err(err);
        }

        record.status = DeploymentStatus::Confirmed;
        record.failure = None;
        let record = self.ledger.put(record)?;

        tracing::info!(
            contract = %record.contract_name,
            network = %record.network,
            address = %record.address,
            tx_hash = %tx_hash,
            block_number,
            "Contract deployed"
        );
        Ok(record)
    }

    fn mark_failed(&self, mut record: DeploymentRecord, err: &DeployError) -> Result<(), DeployError> {
        record.status = DeploymentStatus::Failed;
        record.failure = Some(err.to_string());
        self.ledger.put(record)?;
        Ok(())
    }
}

/// Records whose outcome on chain is not known yet.
///
/// A failed record without a block number may still have a transaction that reached the node.
fn is_unresolved(record: &DeploymentRecord) -> bool {
    match record.status {
        DeploymentStatus::Pending => true,
        DeploymentStatus::Failed => record.block_number.is_none(),
        DeploymentStatus::Confirmed => false,
    }
}

/// A constructor that reverts during `eth_estimateGas` fails the same way it would on chain.
fn classify_estimation_error(err: RpcError) -> DeployError {
    match err {
        RpcError::Node { message, .. } if message.to_lowercase().contains("revert") => {
            DeployError::ExecutionReverted {
                tx_hash: None,
                block_number: None,
                reason: format!("gas estimation: {message}"),
            }
        }
        RpcError::Node { message, .. } => {
            DeployError::SubmissionRejected(format!("gas estimation failed: {message}"))
        }
        err => err.into(),
    }
}
