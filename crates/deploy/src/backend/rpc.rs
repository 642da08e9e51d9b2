//! Ethereum JSON-RPC backend.
//!
//! Transactions are sent with `eth_sendTransaction` from an account unlocked on the node
//! (signing is out of scope). Proxies are ERC-1967 UUPS proxies: creation deploys the logic
//! contract, then `ERC1967Proxy(logic, initData)`; an upgrade deploys the new logic and calls
//! `upgradeTo(address)` on the proxy.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes, U64, U256},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use super::{
    BackendError, Confirmation, ExecutionBackend, LogicRef, ProxyDeployment, encode_call,
    encode_upgrade,
};
use crate::{ArgValue, MethodSignature, ModuleKind, TxHash};

/// Default timeout for a single RPC request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Artifact name of the proxy contract.
const PROXY_CONTRACT: &str = "ERC1967Proxy";

/// Connection settings of a [`JsonRpcBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSettings {
    pub url: Url,
    /// Unlocked account that sends every transaction.
    pub from: Address,
    /// Expected chain id, checked once before anything is sent.
    pub chain_id: Option<u64>,
    pub gas: Option<u64>,
    pub gas_price: Option<u64>,
    /// Directory holding `<Contract>.json` build artifacts.
    pub artifacts: PathBuf,
    /// Interval between receipt polls.
    pub poll_interval: Duration,
}

/// An [`ExecutionBackend`] talking to a node over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcBackend {
    client: reqwest::Client,
    settings: RpcSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    status: Option<U64>,
    contract_address: Option<Address>,
}

impl JsonRpcBackend {
    /// Connect to the node and verify the chain id if one is configured.
    pub async fn connect(settings: RpcSettings) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Rejected(format!("failed to create HTTP client: {e}")))?;
        let backend = Self { client, settings };

        let chain_id: U64 = backend.request("eth_chainId", vec![]).await?;
        if let Some(expected) = backend.settings.chain_id {
            if chain_id.to::<u64>() != expected {
                return Err(BackendError::Rejected(format!(
                    "endpoint serves chain {chain_id}, expected {expected}"
                )));
            }
        }

        tracing::info!(
            url = %backend.settings.url,
            from = %backend.settings.from,
            chain_id = chain_id.to::<u64>(),
            "Connected to JSON-RPC endpoint"
        );

        match backend.balance().await {
            Ok(balance) => tracing::info!(
                from = %backend.settings.from,
                balance = %balance,
                "Deployer account balance (wei)"
            ),
            Err(e) => tracing::warn!(error = %e, "Could not read the deployer balance"),
        }
        Ok(backend)
    }

    pub fn settings(&self) -> &RpcSettings {
        &self.settings
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, BackendError> {
        json_rpc_call(&self.client, self.settings.url.as_str(), method, params).await
    }

    async fn send_transaction(
        &self,
        to: Option<Address>,
        data: Vec<u8>,
    ) -> Result<TxHash, BackendError> {
        let mut tx = serde_json::json!({
            "from": self.settings.from,
            "data": Bytes::from(data),
        });
        if let Some(to) = to {
            tx["to"] = serde_json::json!(to);
        }
        if let Some(gas) = self.settings.gas {
            tx["gas"] = Value::String(format!("{gas:#x}"));
        }
        if let Some(gas_price) = self.settings.gas_price {
            tx["gasPrice"] = Value::String(format!("{gas_price:#x}"));
        }

        self.request("eth_sendTransaction", vec![tx]).await
    }

    async fn pending_nonce(&self) -> Result<u64, BackendError> {
        let nonce: U64 = self
            .request(
                "eth_getTransactionCount",
                vec![serde_json::json!(self.settings.from), "pending".into()],
            )
            .await
            .map_err(|e| BackendError::Rejected(format!("could not read account nonce: {e}")))?;
        Ok(nonce.to::<u64>())
    }

    /// Balance of the sending account, in wei.
    pub async fn balance(&self) -> Result<U256, BackendError> {
        self.request(
            "eth_getBalance",
            vec![serde_json::json!(self.settings.from), "latest".into()],
        )
        .await
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<RpcReceipt>, BackendError> {
        self.request("eth_getTransactionReceipt", vec![serde_json::json!(tx_hash)])
            .await
    }

    /// Deploy a logic contract and wait for it, returning its address.
    ///
    /// The logic contract is not the module: until the proxy creation or upgrade is sent,
    /// nothing observable has changed, so every failure here is a rejection.
    async fn deploy_logic(&self, logic: &LogicRef) -> Result<Address, BackendError> {
        let bytecode = load_bytecode(&self.settings.artifacts, &logic.contract, &logic.version)?;
        let tx_hash = self
            .send_transaction(None, bytecode)
            .await
            .map_err(|e| BackendError::Rejected(format!("logic deployment of {logic}: {e}")))?;

        loop {
            match self.receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    return match (receipt.status, receipt.contract_address) {
                        (Some(status), Some(address)) if status == U64::from(1) => {
                            tracing::debug!(logic = %logic, address = %address, "Logic contract deployed");
                            Ok(address)
                        }
                        _ => Err(BackendError::Rejected(format!(
                            "logic deployment of {logic} reverted ({tx_hash})"
                        ))),
                    };
                }
                Ok(None) => tokio::time::sleep(self.settings.poll_interval).await,
                Err(e) => {
                    tracing::trace!(error = %e, tx_hash = %tx_hash, "Receipt query failed, retrying...");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }
}

impl ExecutionBackend for JsonRpcBackend {
    async fn create_proxy(
        &self,
        kind: &ModuleKind,
        logic: &LogicRef,
        args: &[ArgValue],
    ) -> Result<ProxyDeployment, BackendError> {
        let proxy_code = load_bytecode(&self.settings.artifacts, PROXY_CONTRACT, "")?;
        let implementation = self.deploy_logic(logic).await?;

        let init_data = encode_call(&logic.initializer, args);
        let mut data = proxy_code;
        data.extend(
            DynSolValue::Tuple(vec![
                DynSolValue::Address(implementation),
                DynSolValue::Bytes(init_data),
            ])
            .abi_encode_params(),
        );

        // The proxy address is fixed by the nonce the creation is sent with.
        let nonce = self.pending_nonce().await?;
        let address = self.settings.from.create(nonce);
        let tx_hash = self.send_transaction(None, data).await?;

        tracing::info!(
            kind = %kind,
            address = %address,
            implementation = %implementation,
            tx_hash = %tx_hash,
            "Proxy creation sent"
        );
        Ok(ProxyDeployment { address, tx_hash })
    }

    async fn upgrade_proxy(&self, address: Address, logic: &LogicRef) -> Result<TxHash, BackendError> {
        let implementation = self.deploy_logic(logic).await?;
        let tx_hash = self
            .send_transaction(Some(address), encode_upgrade(implementation))
            .await?;

        tracing::info!(
            address = %address,
            implementation = %implementation,
            tx_hash = %tx_hash,
            "Proxy upgrade sent"
        );
        Ok(tx_hash)
    }

    async fn call(
        &self,
        address: Address,
        method: &MethodSignature,
        args: &[ArgValue],
    ) -> Result<TxHash, BackendError> {
        self.send_transaction(Some(address), encode_call(method, args))
            .await
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(receipt) = self.receipt(tx_hash).await? {
                return Ok(match receipt.status {
                    Some(status) if status == U64::from(1) => Confirmation::Confirmed,
                    _ => Confirmation::Reverted,
                });
            }

            if tokio::time::Instant::now() + self.settings.poll_interval > deadline {
                return Ok(Confirmation::Unconfirmed);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

/// Make a JSON-RPC call and deserialize the result.
///
/// Failures to reach the endpoint at all are rejections: nothing was sent. Error responses
/// are rejections as well. Anything else (a dropped connection, an unreadable response) is
/// a transport error with an unknown outcome.
pub(crate) async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, BackendError> {
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
        .map_err(|e| {
            if e.is_connect() || e.is_builder() {
                BackendError::Rejected(format!("failed to send {method} request: {e}"))
            } else {
                BackendError::Transport(format!("{method} request failed: {e}"))
            }
        })?;

    let result: Value = response
        .json()
        .await
        .map_err(|e| BackendError::Transport(format!("failed to parse {method} response: {e}")))?;

    if let Some(error) = result.get("error") {
        return Err(BackendError::Rejected(format!(
            "RPC error on {method}: {}",
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        )));
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| BackendError::Transport(format!("no result in {method} response")))?;

    serde_json::from_value(result_value)
        .map_err(|e| BackendError::Transport(format!("failed to deserialize {method} result: {e}")))
}

/// Creation bytecode of `contract`.
///
/// Looks for `<artifacts>/<version>/<contract>.json` first, then `<artifacts>/<contract>.json`.
/// Both hardhat (`"bytecode": "0x…"`) and foundry (`"bytecode": { "object": "0x…" }`)
/// layouts are accepted.
fn load_bytecode(artifacts: &Path, contract: &str, version: &str) -> Result<Vec<u8>, BackendError> {
    let artifact_err = |reason: String| BackendError::Artifact {
        contract: contract.to_string(),
        reason,
    };

    let file = format!("{contract}.json");
    let versioned = artifacts.join(version).join(&file);
    let path = if !version.is_empty() && versioned.is_file() {
        versioned
    } else {
        artifacts.join(&file)
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| artifact_err(format!("cannot read {}: {e}", path.display())))?;
    let json: Value = serde_json::from_str(&content)
        .map_err(|e| artifact_err(format!("{} is not valid JSON: {e}", path.display())))?;

    let code = match json.get("bytecode") {
        Some(Value::String(code)) => code.as_str(),
        Some(Value::Object(obj)) => obj
            .get("object")
            .and_then(Value::as_str)
            .ok_or_else(|| artifact_err("bytecode.object is missing".to_string()))?,
        _ => return Err(artifact_err("no bytecode field".to_string())),
    };

    let code = hex::decode(code.trim_start_matches("0x"))
        .map_err(|e| artifact_err(format!("bytecode is not hex: {e}")))?;
    if code.is_empty() {
        return Err(artifact_err(
            "bytecode is empty (abstract contract or interface?)".to_string(),
        ));
    }
    Ok(code)
}
