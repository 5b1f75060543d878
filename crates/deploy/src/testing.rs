//! In-memory chain and explorer used by unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use alloy_consensus::{Transaction, TxEnvelope};
use alloy_core::primitives::{Address, B256, Bytes, U64, address, keccak256};
use alloy_eips::eip2718::Decodable2718;
use async_trait::async_trait;

use crate::{
    DeployError,
    artifact::CompilerSettings,
    network::NetworkProfile,
    rpc::{CallRequest, RpcError, RpcTransport, TransactionReceipt},
    verify::{CheckResponse, ExplorerClient, SubmitResponse, VerificationRequest},
};

/// Address of the Hardhat/Anvil development key 0.
pub(crate) const DEV_ADDRESS: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

pub(crate) fn test_network(chain_id: u64) -> NetworkProfile {
    NetworkProfile {
        name: "test".to_string(),
        rpc_url: "http://127.0.0.1:8545".parse().unwrap(),
        chain_id,
        explorer_api_url: "http://127.0.0.1:4000/api".parse().unwrap(),
        explorer_browser_url: None,
        explorer_api_key: "test-key".to_string(),
    }
}

#[derive(Debug, Default)]
struct ChainState {
    next_nonce: u64,
    block: u64,
    /// Accepted but not yet mined, in arrival order.
    mempool: Vec<(B256, u64, bool)>,
    receipts: HashMap<B256, TransactionReceipt>,
    send_failures: VecDeque<RpcError>,
    /// Accepted sends whose response is lost on the way back.
    lost_send_responses: u32,
    receipt_read_failures: u32,
    known_check_failures: u32,
    chain_id_read_failures: u32,
    revert_estimates: bool,
    code: HashMap<Address, Bytes>,
    hold_receipts: bool,
    revert: bool,
}

/// Single-sender chain that mines every accepted transaction immediately unless told to hold.
#[derive(Debug)]
pub(crate) struct FakeChain {
    chain_id: u64,
    sender: Address,
    state: Mutex<ChainState>,
    send_attempts: AtomicU32,
    broadcasts: AtomicU32,
}

impl FakeChain {
    pub(crate) fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            sender: DEV_ADDRESS,
            state: Mutex::new(ChainState::default()),
            send_attempts: AtomicU32::new(0),
            broadcasts: AtomicU32::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    /// Reject the next `n` broadcasts with `err`.
    pub(crate) fn fail_next_sends(&self, n: usize, err: RpcError) {
        let mut state = self.state();
        state.send_failures.extend(std::iter::repeat_n(err, n));
    }

    /// Accept the next `n` broadcasts but answer them with a transport error.
    pub(crate) fn lose_send_responses(&self, n: u32) {
        self.state().lost_send_responses = n;
    }

    pub(crate) fn fail_known_checks(&self, n: u32) {
        self.state().known_check_failures = n;
    }

    pub(crate) fn fail_chain_id_reads(&self, n: u32) {
        self.state().chain_id_read_failures = n;
    }

    /// Make `eth_estimateGas` report a constructor revert.
    pub(crate) fn revert_estimates(&self, revert: bool) {
        self.state().revert_estimates = revert;
    }

    pub(crate) fn set_code(&self, address: Address, code: Bytes) {
        self.state().code.insert(address, code);
    }

    pub(crate) fn fail_receipt_reads(&self, n: u32) {
        self.state().receipt_read_failures = n;
    }

    /// Make every following transaction revert.
    pub(crate) fn revert_transactions(&self, revert: bool) {
        self.state().revert = revert;
    }

    /// Keep accepted transactions in the mempool instead of mining them.
    pub(crate) fn hold_receipts(&self, hold: bool) {
        self.state().hold_receipts = hold;
    }

    /// Mine everything currently held in the mempool.
    pub(crate) fn mine_pending(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.mempool);
        for (hash, nonce, creates) in pending {
            self.mine(&mut state, hash, nonce, creates);
        }
    }

    /// Forget everything held in the mempool, as if the node evicted it.
    pub(crate) fn drop_pending(&self) {
        let mut state = self.state();
        let dropped = state.mempool.len() as u64;
        state.mempool.clear();
        state.next_nonce -= dropped;
    }

    /// Calls to `eth_sendRawTransaction`, failed ones included.
    pub(crate) fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Transactions accepted into the mempool.
    pub(crate) fn broadcasts(&self) -> u32 {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub(crate) fn knows(&self, hash: B256) -> bool {
        let state = self.state();
        state.receipts.contains_key(&hash) || state.mempool.iter().any(|(h, ..)| *h == hash)
    }

    fn mine(&self, state: &mut ChainState, hash: B256, nonce: u64, creates: bool) {
        state.block += 1;
        let succeeded = !state.revert;
        state.receipts.insert(
            hash,
            TransactionReceipt {
                transaction_hash: hash,
                block_number: U64::from(state.block),
                status: U64::from(succeeded as u8),
                contract_address: (creates && succeeded).then(|| self.sender.create(nonce)),
                gas_used: None,
            },
        );
    }
}

/// Nonce of a signed transaction and whether it creates a contract.
fn decode_nonce_and_kind(raw: &[u8]) -> Result<(u64, bool), RpcError> {
    let envelope = TxEnvelope::decode_2718(&mut &raw[..]).map_err(|e| RpcError::Node {
        code: -32000,
        message: format!("rlp: {e}"),
    })?;
    Ok((envelope.nonce(), envelope.kind().is_create()))
}

#[async_trait]
impl RpcTransport for FakeChain {
    async fn chain_id(&self, _network: &NetworkProfile) -> Result<u64, RpcError> {
        let mut state = self.state();
        if state.chain_id_read_failures > 0 {
            state.chain_id_read_failures -= 1;
            return Err(RpcError::Transport("connection refused".to_string()));
        }
        Ok(self.chain_id)
    }

    async fn transaction_count(
        &self,
        _network: &NetworkProfile,
        _address: Address,
    ) -> Result<u64, RpcError> {
        Ok(self.state().next_nonce)
    }

    async fn gas_price(&self, _network: &NetworkProfile) -> Result<u128, RpcError> {
        Ok(1_000_000_000)
    }

    async fn estimate_gas(
        &self,
        _network: &NetworkProfile,
        _call: &CallRequest,
    ) -> Result<u64, RpcError> {
        if self.state().revert_estimates {
            return Err(RpcError::Node {
                code: 3,
                message: "execution reverted: Ownable: new owner is the zero address".to_string(),
            });
        }
        Ok(1_000_000)
    }

    async fn send_raw_transaction(
        &self,
        _network: &NetworkProfile,
        raw: &Bytes,
    ) -> Result<B256, RpcError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }

        let hash = keccak256(raw);
        if state.receipts.contains_key(&hash) || state.mempool.iter().any(|(h, ..)| *h == hash) {
            return Err(RpcError::Node {
                code: -32000,
                message: "already known".to_string(),
            });
        }

        let (nonce, creates) = decode_nonce_and_kind(raw)?;
        if nonce != state.next_nonce {
            return Err(RpcError::Node {
                code: -32000,
                message: format!("nonce too low: next nonce {}, tx nonce {nonce}", state.next_nonce),
            });
        }

        state.next_nonce += 1;
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        if state.hold_receipts {
            state.mempool.push((hash, nonce, creates));
        } else {
            self.mine(&mut state, hash, nonce, creates);
        }

        if state.lost_send_responses > 0 {
            state.lost_send_responses -= 1;
            return Err(RpcError::Transport("timeout reading response".to_string()));
        }
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        _network: &NetworkProfile,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let mut state = self.state();
        if state.receipt_read_failures > 0 {
            state.receipt_read_failures -= 1;
            return Err(RpcError::Transport("connection reset by peer".to_string()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn transaction_known(
        &self,
        _network: &NetworkProfile,
        hash: B256,
    ) -> Result<bool, RpcError> {
        {
            let mut state = self.state();
            if state.known_check_failures > 0 {
                state.known_check_failures -= 1;
                return Err(RpcError::Transport("connection reset by peer".to_string()));
            }
        }
        Ok(self.knows(hash))
    }

    async fn code_at(&self, _network: &NetworkProfile, address: Address) -> Result<Bytes, RpcError> {
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }
}

/// Scripted explorer. With nothing scripted, submissions are accepted and verify on first check.
#[derive(Debug, Default)]
pub(crate) struct FakeExplorer {
    submit_script: Mutex<VecDeque<Result<SubmitResponse, DeployError>>>,
    status_script: Mutex<VecDeque<Result<CheckResponse, DeployError>>>,
    submitted: Mutex<Vec<VerificationRequest>>,
    status_checks: AtomicU32,
}

impl FakeExplorer {
    pub(crate) fn push_submit(&self, response: Result<SubmitResponse, DeployError>) {
        self.submit_script.lock().unwrap().push_back(response);
    }

    pub(crate) fn push_status(&self, response: Result<CheckResponse, DeployError>) {
        self.status_script.lock().unwrap().push_back(response);
    }

    pub(crate) fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub(crate) fn last_submission(&self) -> Option<VerificationRequest> {
        self.submitted.lock().unwrap().last().cloned()
    }

    pub(crate) fn status_checks(&self) -> u32 {
        self.status_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExplorerClient for FakeExplorer {
    async fn submit(
        &self,
        request: &VerificationRequest,
        _settings: &CompilerSettings,
    ) -> Result<SubmitResponse, DeployError> {
        let count = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(request.clone());
            submitted.len()
        };
        self.submit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SubmitResponse::Accepted {
                guid: format!("guid-{count}"),
            }))
    }

    async fn check_status(
        &self,
        _network: &NetworkProfile,
        _guid: &str,
    ) -> Result<CheckResponse, DeployError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        self.status_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CheckResponse::Verified))
    }
}
