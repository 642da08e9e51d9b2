//! stakewire-deploy - Deployment and upgrade orchestration for upgradeable proxy modules.
//!
//! This crate decides what to deploy, in which order, and how to wire and configure the
//! resulting module graph, then drives an execution backend action by action while keeping
//! a durable ledger of every confirmed step, so that any run can be resumed after a failure.

mod error;
pub use error::DeployError;

mod value;
pub use value::{ArgValue, MethodSignature, ScalarType};

mod registry;
pub use registry::{
    ModuleDescriptor, ModuleKind, ParamSource, ParamSpec, Registry, RegistryBuilder,
};

mod fingerprint;
pub use fingerprint::fingerprint;

mod target;
pub use target::{
    ModuleTarget, PostDeployStep, TargetSpec, ValidatedModule, ValidatedStep, ValidatedTarget,
};

mod ledger;
pub use ledger::{
    DeploymentRecord, FileLedgerStore, Ledger, LedgerClaim, LedgerSnapshot, LedgerStore,
    MemoryLedgerStore, PendingAction, PendingOperation, Resolution,
};

pub mod planner;
pub use planner::{Action, ArgSlot, Plan, PlannedArg, plan};

mod backend;
pub use backend::{
    BackendError, Confirmation, ExecutionBackend, Fault, JsonRpcBackend, LogicRef,
    ProxyDeployment, RpcSettings, SimulatedBackend, SimulatedProxy, Submission, SubmittedAction,
    encode_args, encode_call,
};

mod orchestrator;
pub use orchestrator::{
    ActionStatus, ExecutionOptions, ExecutionReport, Orchestrator, ReportEntry, RetryPolicy,
    RunState,
};

mod deployer;
pub use deployer::{Deployer, NetworkConfig, STAKEWIRE_CONF_FILENAME};

pub use alloy_core::primitives::Address;

/// Hash of a submitted transaction.
pub type TxHash = alloy_core::primitives::B256;
