//! JSON-RPC transport for interacting with Ethereum nodes.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U64, U256};
use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{DeployError, network::NetworkProfile};

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a single JSON-RPC call, before it is mapped to a [`DeployError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The request never produced a usable response (connect, timeout, 5xx, bad JSON).
    Transport(String),
    /// The node answered with a JSON-RPC error object.
    Node { code: i64, message: String },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "{msg}"),
            Self::Node { code, message } => write!(f, "RPC error {code}: {message}"),
        }
    }
}

/// Reads are idempotent, so any failure is worth retrying.
impl From<RpcError> for DeployError {
    fn from(err: RpcError) -> Self {
        DeployError::Transport(err.to_string())
    }
}

/// Receipt of an included transaction, reduced to what the executor needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_number: U64,
    /// `0x1` on success, `0x0` when execution reverted.
    pub status: U64,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub gas_used: Option<U256>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == U64::from(1)
    }

    pub fn block(&self) -> u64 {
        self.block_number.to::<u64>()
    }
}

/// Call object used for `eth_estimateGas`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub data: Bytes,
}

/// Node operations needed to deploy a contract, parametrised by network.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn chain_id(&self, network: &NetworkProfile) -> Result<u64, RpcError>;

    /// Transaction count of `address` including pending transactions.
    async fn transaction_count(
        &self,
        network: &NetworkProfile,
        address: Address,
    ) -> Result<u64, RpcError>;

    async fn gas_price(&self, network: &NetworkProfile) -> Result<u128, RpcError>;

    async fn estimate_gas(
        &self,
        network: &NetworkProfile,
        call: &CallRequest,
    ) -> Result<u64, RpcError>;

    async fn send_raw_transaction(
        &self,
        network: &NetworkProfile,
        raw: &Bytes,
    ) -> Result<B256, RpcError>;

    async fn transaction_receipt(
        &self,
        network: &NetworkProfile,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError>;

    /// Whether the node knows the transaction at all (mined or in its mempool).
    async fn transaction_known(&self, network: &NetworkProfile, hash: B256)
    -> Result<bool, RpcError>;

    async fn code_at(&self, network: &NetworkProfile, address: Address) -> Result<Bytes, RpcError>;
}

/// [`RpcTransport`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: create_client()?,
        })
    }
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to send {method} request: {e}")))?;

    let status = response.status();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(RpcError::Transport(format!(
            "{method} returned HTTP {status}"
        )));
    }

    let result: Value = response
        .json()
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to parse {method} response: {e}")))?;

    if let Some(error) = result.get("error") {
        return Err(RpcError::Node {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::Transport(format!("No result in {method} response")))?;

    serde_json::from_value(result_value)
        .map_err(|e| RpcError::Transport(format!("Failed to deserialize {method} result: {e}")))
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn chain_id(&self, network: &NetworkProfile) -> Result<u64, RpcError> {
        let id: U64 =
            json_rpc_call(&self.client, network.rpc_url.as_str(), "eth_chainId", vec![]).await?;
        Ok(id.to())
    }

    async fn transaction_count(
        &self,
        network: &NetworkProfile,
        address: Address,
    ) -> Result<u64, RpcError> {
        let count: U64 = json_rpc_call(
            &self.client,
            network.rpc_url.as_str(),
            "eth_getTransactionCount",
            vec![serde_json::json!(address), serde_json::json!("pending")],
        )
        .await?;
        Ok(count.to())
    }

    async fn gas_price(&self, network: &NetworkProfile) -> Result<u128, RpcError> {
        let price: U256 =
            json_rpc_call(&self.client, network.rpc_url.as_str(), "eth_gasPrice", vec![]).await?;
        Ok(price.to())
    }

    async fn estimate_gas(
        &self,
        network: &NetworkProfile,
        call: &CallRequest,
    ) -> Result<u64, RpcError> {
        let mut request = serde_json::json!({
            "from": call.from,
            "data": call.data,
        });
        if let Some(to) = call.to {
            request["to"] = serde_json::json!(to);
        }
        let gas: U64 = json_rpc_call(
            &self.client,
            network.rpc_url.as_str(),
            "eth_estimateGas",
            vec![request],
        )
        .await?;
        Ok(gas.to())
    }

    async fn send_raw_transaction(
        &self,
        network: &NetworkProfile,
        raw: &Bytes,
    ) -> Result<B256, RpcError> {
        json_rpc_call(
            &self.client,
            network.rpc_url.as_str(),
            "eth_sendRawTransaction",
            vec![serde_json::json!(raw)],
        )
        .await
    }

    async fn transaction_receipt(
        &self,
        network: &NetworkProfile,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        json_rpc_call(
            &self.client,
            network.rpc_url.as_str(),
            "eth_getTransactionReceipt",
            vec![serde_json::json!(hash)],
        )
        .await
    }

    async fn transaction_known(
        &self,
        network: &NetworkProfile,
        hash: B256,
    ) -> Result<bool, RpcError> {
        let tx: Option<Value> = json_rpc_call(
            &self.client,
            network.rpc_url.as_str(),
            "eth_getTransactionByHash",
            vec![serde_json::json!(hash)],
        )
        .await?;
        Ok(tx.is_some())
    }

    async fn code_at(&self, network: &NetworkProfile, address: Address) -> Result<Bytes, RpcError> {
        json_rpc_call(
            &self.client,
            network.rpc_url.as_str(),
            "eth_getCode",
            vec![serde_json::json!(address), serde_json::json!("latest")],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_deserialization() {
        let receipt: TransactionReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b",
            "blockNumber": "0x1b4",
            "status": "0x1",
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "gasUsed": "0x5208",
            "logs": []
        }))
        .unwrap();

        assert!(receipt.succeeded());
        assert_eq!(receipt.block(), 436);
        assert_eq!(
            receipt.contract_address,
            Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap())
        );
    }

    #[test]
    fn test_reverted_receipt() {
        let receipt: TransactionReceipt = serde_json::from_value(serde_json::json!({
            "transactionHash": "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b",
            "blockNumber": "0x10",
            "status": "0x0",
            "contractAddress": null
        }))
        .unwrap();

        assert!(!receipt.succeeded());
        assert_eq!(receipt.contract_address, None);
    }

    #[test]
    fn test_rpc_errors_map_to_retryable_transport() {
        let err: DeployError = RpcError::Node {
            code: -32000,
            message: "header not found".into(),
        }
        .into();
        assert!(err.is_retryable());
    }
}
