//! Execution backends.
//!
//! The orchestrator only knows the four capabilities of [`ExecutionBackend`]: create an
//! upgradeable proxy, point a proxy at new logic, call a method, and wait for a transaction
//! to be confirmed. Everything chain-specific lives behind this trait.

mod rpc;
mod simulated;

use std::{fmt, future::Future, time::Duration};

use alloy_core::{dyn_abi::DynSolValue, primitives::Address};
use serde::{Deserialize, Serialize};

pub use rpc::{JsonRpcBackend, RpcSettings};
pub use simulated::{Fault, SimulatedBackend, SimulatedProxy, SubmittedAction, Submission};

use crate::{ArgValue, MethodSignature, ModuleKind, TxHash};

/// A logic implementation at a given version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicRef {
    /// Contract (artifact) name.
    pub contract: String,
    pub version: String,
    /// Called through the proxy on creation.
    pub initializer: MethodSignature,
}

impl fmt::Display for LogicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.contract, self.version)
    }
}

/// A submitted proxy creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyDeployment {
    pub address: Address,
    pub tx_hash: TxHash,
}

/// Outcome of waiting for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Confirmation {
    Confirmed,
    /// No receipt was observed before the timeout. The outcome is unknown.
    Unconfirmed,
    Reverted,
}

/// Errors raised by a backend before a transaction outcome is known.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request may or may not have reached the chain.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request was refused and nothing was submitted.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("artifact {contract}: {reason}")]
    Artifact { contract: String, reason: String },
}

impl BackendError {
    /// Whether anything may have been submitted.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Capability surface of a chain the orchestrator can drive.
///
/// Submissions return as soon as the transaction is accepted; confirmation is awaited
/// separately so the caller controls the deadline.
pub trait ExecutionBackend: Send + Sync {
    /// Deploy `logic` behind a new proxy initialized with `args`.
    fn create_proxy(
        &self,
        kind: &ModuleKind,
        logic: &LogicRef,
        args: &[ArgValue],
    ) -> impl Future<Output = Result<ProxyDeployment, BackendError>> + Send;

    /// Point the proxy at `address` to a new logic implementation.
    fn upgrade_proxy(
        &self,
        address: Address,
        logic: &LogicRef,
    ) -> impl Future<Output = Result<TxHash, BackendError>> + Send;

    /// Invoke `method` on the module at `address`.
    fn call(
        &self,
        address: Address,
        method: &MethodSignature,
        args: &[ArgValue],
    ) -> impl Future<Output = Result<TxHash, BackendError>> + Send;

    /// Wait at most `timeout` for `tx_hash` to be mined.
    fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> impl Future<Output = Result<Confirmation, BackendError>> + Send;
}

fn sol_value(arg: &ArgValue) -> DynSolValue {
    match arg {
        ArgValue::Address(address) => DynSolValue::Address(*address),
        // Every uint width occupies one word.
        ArgValue::Uint(value) => DynSolValue::Uint(*value, 256),
        ArgValue::Bool(value) => DynSolValue::Bool(*value),
        ArgValue::String(value) => DynSolValue::String(value.clone()),
        ArgValue::AddressArray(addresses) => {
            DynSolValue::Array(addresses.iter().copied().map(DynSolValue::Address).collect())
        }
    }
}

/// ABI-encode the arguments of a call, without selector.
pub fn encode_args(args: &[ArgValue]) -> Vec<u8> {
    DynSolValue::Tuple(args.iter().map(sol_value).collect()).abi_encode_params()
}

/// Calldata for `method(args...)`: 4-byte selector followed by the ABI-encoded arguments.
pub fn encode_call(method: &MethodSignature, args: &[ArgValue]) -> Vec<u8> {
    let mut data = method.selector().to_vec();
    data.extend(encode_args(args));
    data
}

/// Calldata of `upgradeTo(address)` on a UUPS proxy.
pub(crate) fn encode_upgrade(logic: Address) -> Vec<u8> {
    encode_call(
        &MethodSignature::setter("upgradeTo"),
        &[ArgValue::Address(logic)],
    )
}
