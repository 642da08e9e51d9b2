//! Error taxonomy for planning and executing a deployment.

use std::path::PathBuf;

use crate::{ModuleKind, TxHash};

/// Errors raised while validating, planning, or executing a deployment.
///
/// Structural errors (`UnknownModuleKind`, `CyclicDependency`, `UnresolvedDependency`,
/// `InvalidTarget`, ...) are always raised before any transaction is submitted.
/// Execution errors carry the plan position of the action that halted the run.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("unknown module kind: {0}")]
    UnknownModuleKind(ModuleKind),

    #[error("module kind registered twice: {0}")]
    DuplicateModuleKind(ModuleKind),

    #[error("cyclic module dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<ModuleKind> },

    #[error("{kind} is required by {required_by} but is neither deployed, targeted, nor pinned")]
    UnresolvedDependency {
        kind: ModuleKind,
        required_by: ModuleKind,
    },

    #[error("{kind} has an unconfirmed {operation}; check the chain and reconcile it before planning")]
    PendingReconciliation { kind: ModuleKind, operation: String },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("action #{position}: deployment of {kind} failed: {reason}")]
    DeploymentFailed {
        position: usize,
        kind: ModuleKind,
        reason: String,
    },

    #[error("action #{position}: upgrade of {kind} failed: {reason}")]
    UpgradeFailed {
        position: usize,
        kind: ModuleKind,
        reason: String,
    },

    #[error("action #{position}: {kind} is unconfirmed ({reason}), reconcile manually before re-running")]
    Unconfirmed {
        position: usize,
        kind: ModuleKind,
        tx_hash: Option<TxHash>,
        reason: String,
    },

    #[error("action #{position}: {kind}.{method} failed after {attempts} attempt(s): {reason}")]
    ConfigurationFailed {
        position: usize,
        kind: ModuleKind,
        method: String,
        attempts: usize,
        reason: String,
    },

    #[error("ledger I/O error at {path}: {source}")]
    LedgerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger at {path} is corrupt: {source}")]
    LedgerCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger at {0} is locked by another process")]
    LedgerLocked(PathBuf),

    #[error("ledger conflict for {kind}: {reason}")]
    LedgerConflict { kind: ModuleKind, reason: String },

    #[error("{0} is already claimed by another running plan")]
    KindBusy(ModuleKind),

    #[error("ledger state is poisoned by a panicked writer")]
    LedgerPoisoned,
}

impl DeployError {
    /// Returns true for errors detected before any side effect could happen.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownModuleKind(_)
                | Self::DuplicateModuleKind(_)
                | Self::CyclicDependency { .. }
                | Self::UnresolvedDependency { .. }
                | Self::InvalidTarget(_)
                | Self::InvalidValue { .. }
        )
    }

    /// The plan position of the halting action, for execution errors.
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::DeploymentFailed { position, .. }
            | Self::UpgradeFailed { position, .. }
            | Self::Unconfirmed { position, .. }
            | Self::ConfigurationFailed { position, .. } => Some(*position),
            _ => None,
        }
    }
}

fn format_cycle(cycle: &[ModuleKind]) -> String {
    cycle
        .iter()
        .map(ModuleKind::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
