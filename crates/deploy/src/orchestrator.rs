//! Plan execution.
//!
//! Actions run strictly in plan order, one at a time. Each submission and its confirmation
//! share one per-action deadline. The ledger is written only after a confirmation is
//! positively observed, and it is written before the next action starts. The first action
//! that does not reach `Done` or `Skipped` halts the run. A Deploy or Upgrade that halts
//! unconfirmed leaves a pending marker on its kind instead.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use alloy_core::primitives::Address;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    Action, ArgSlot, ArgValue, BackendError, Confirmation, DeployError, ExecutionBackend, Ledger,
    LogicRef, MethodSignature, ModuleKind, PendingAction, PendingOperation, Plan, PlannedArg,
    ProxyDeployment, TxHash, fingerprint,
};

/// Bounded retry of Wire/Configure actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    #[serde(rename = "min_delay_ms", with = "millis")]
    pub min_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Caller-supplied execution limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Deadline for submitting one action and observing its confirmation.
    #[serde(rename = "action_timeout_secs", with = "secs")]
    pub action_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// Final status of an executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ActionStatus {
    Done,
    Skipped,
    Failed,
    /// The outcome is unknown; the ledger was not updated.
    Unconfirmed,
}

/// Terminal state of a run.
///
/// A run is `Planned` once [`plan`](crate::plan) returns and `Executing` for the duration of
/// [`Orchestrator::execute`]. Neither is observable from outside: a report only exists once
/// the run has completed or halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Completed,
    Halted { position: usize },
}

/// Outcome of one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    /// 1-based position in the plan.
    pub position: usize,
    pub action: Action,
    pub status: ActionStatus,
    pub result_address: Option<Address>,
    pub tx_hash: Option<TxHash>,
    pub attempts: usize,
    pub error: Option<String>,
}

/// Ordered outcome of a run. Actions after a halt are not listed.
#[derive(Debug)]
pub struct ExecutionReport {
    pub state: RunState,
    pub entries: Vec<ReportEntry>,
    /// The error that halted the run.
    pub failure: Option<DeployError>,
}

impl ExecutionReport {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn count(&self, status: ActionStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// The report of a completed run, or the halting error.
    pub fn into_result(self) -> Result<Self, DeployError> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self),
        }
    }
}

/// Why a transaction did not confirm.
#[derive(Debug)]
enum Failure {
    Rejected(String),
    Reverted(TxHash),
    Unconfirmed {
        tx_hash: Option<TxHash>,
        reason: String,
    },
}

impl Failure {
    /// Only outcomes known to have changed nothing may be retried.
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unconfirmed { .. })
    }

    fn tx_hash(&self) -> Option<TxHash> {
        match self {
            Self::Rejected(_) => None,
            Self::Reverted(tx_hash) => Some(*tx_hash),
            Self::Unconfirmed { tx_hash, .. } => *tx_hash,
        }
    }

    fn into_halt(
        self,
        position: usize,
        kind: &ModuleKind,
        failed: impl FnOnce(String) -> DeployError,
    ) -> Halt {
        match self {
            Self::Unconfirmed { tx_hash, reason } => Halt {
                status: ActionStatus::Unconfirmed,
                error: DeployError::Unconfirmed {
                    position,
                    kind: kind.clone(),
                    tx_hash,
                    reason,
                },
            },
            other => Halt::failed(failed(other.to_string())),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => f.write_str(reason),
            Self::Reverted(tx_hash) => write!(f, "transaction {tx_hash} reverted"),
            Self::Unconfirmed { reason, .. } => f.write_str(reason),
        }
    }
}

struct Halt {
    status: ActionStatus,
    error: DeployError,
}

impl Halt {
    fn failed(error: DeployError) -> Self {
        Self {
            status: ActionStatus::Failed,
            error,
        }
    }

    /// The transaction confirmed but its effect could not be recorded.
    fn unrecorded(error: DeployError) -> Self {
        Self {
            status: ActionStatus::Unconfirmed,
            error,
        }
    }
}

/// Executes plans against a backend and records confirmed effects in the ledger.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    ledger: Ledger,
    options: ExecutionOptions,
}

impl Orchestrator {
    pub fn new(ledger: Ledger, options: ExecutionOptions) -> Self {
        Self { ledger, options }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Execute `plan` action by action.
    ///
    /// Every kind the plan writes is claimed for the duration of the run (`KindBusy` if
    /// another run holds one). Execution failures do not make this return `Err`: they halt
    /// the run and are reported in the [`ExecutionReport`].
    pub async fn execute<B: ExecutionBackend>(
        &self,
        plan: &Plan,
        backend: &B,
    ) -> Result<ExecutionReport, DeployError> {
        let _claim = self.ledger.claim(plan.mutated_kinds())?;
        let mut resolved = plan.resolved().clone();
        let mut entries = Vec::with_capacity(plan.len());

        tracing::info!(actions = plan.len(), "Executing deployment plan");

        for (index, action) in plan.actions().iter().enumerate() {
            let position = index + 1;
            let mut entry = ReportEntry {
                position,
                action: action.clone(),
                status: ActionStatus::Done,
                result_address: None,
                tx_hash: None,
                attempts: 0,
                error: None,
            };

            tracing::debug!(position, action = %action, "Action started");
            let outcome = match action {
                Action::Skip { kind, address } => {
                    resolved.insert(kind.clone(), *address);
                    entry.status = ActionStatus::Skipped;
                    entry.result_address = Some(*address);
                    Ok(())
                }
                Action::Deploy { kind, logic, args } => {
                    self.deploy(position, kind, logic, args, &mut resolved, backend, &mut entry)
                        .await
                }
                Action::Upgrade {
                    kind,
                    address,
                    logic,
                    ..
                } => {
                    self.upgrade(position, kind, *address, logic, backend, &mut entry)
                        .await
                }
                Action::Wire {
                    kind,
                    setter,
                    target,
                } => match resolved.get(target) {
                    Some(address) => {
                        let args = vec![ArgValue::Address(*address)];
                        self.apply_setting(position, kind, setter, args, &resolved, backend, &mut entry)
                            .await
                    }
                    None => Err(Halt::failed(DeployError::ConfigurationFailed {
                        position,
                        kind: kind.clone(),
                        method: setter.to_string(),
                        attempts: 0,
                        reason: format!("address of {target} is not resolved"),
                    })),
                },
                Action::Configure { kind, method, args } => {
                    self.apply_setting(
                        position,
                        kind,
                        method,
                        args.clone(),
                        &resolved,
                        backend,
                        &mut entry,
                    )
                    .await
                }
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(
                        position,
                        kind = %action.kind(),
                        action = action.label(),
                        status = %entry.status,
                        "Action finished"
                    );
                    entries.push(entry);
                }
                Err(halt) => {
                    entry.status = halt.status;
                    entry.error = Some(halt.error.to_string());
                    tracing::error!(
                        position,
                        kind = %action.kind(),
                        status = %entry.status,
                        error = %halt.error,
                        "Action halted the run"
                    );
                    entries.push(entry);
                    return Ok(ExecutionReport {
                        state: RunState::Halted { position },
                        entries,
                        failure: Some(halt.error),
                    });
                }
            }
        }

        tracing::info!(actions = entries.len(), "Deployment plan completed");
        Ok(ExecutionReport {
            state: RunState::Completed,
            entries,
            failure: None,
        })
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.options.action_timeout
    }

    /// Await `submit` until `deadline`. An ambiguous failure or a timeout is `Unconfirmed`.
    async fn submit<T, F>(&self, deadline: Instant, submit: F) -> Result<T, Failure>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout_at(deadline, submit).await {
            Ok(Ok(submitted)) => Ok(submitted),
            Ok(Err(e)) if e.is_ambiguous() => Err(Failure::Unconfirmed {
                tx_hash: None,
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(Failure::Rejected(e.to_string())),
            Err(_) => Err(Failure::Unconfirmed {
                tx_hash: None,
                reason: format!(
                    "submission not acknowledged within {:?}",
                    self.options.action_timeout
                ),
            }),
        }
    }

    /// Wait for the receipt of `tx_hash` until `deadline`.
    async fn confirm<B: ExecutionBackend>(
        &self,
        backend: &B,
        deadline: Instant,
        tx_hash: TxHash,
    ) -> Result<(), Failure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let confirmation =
            tokio::time::timeout_at(deadline, backend.wait_for_confirmation(tx_hash, remaining))
                .await;

        match confirmation {
            Ok(Ok(Confirmation::Confirmed)) => Ok(()),
            Ok(Ok(Confirmation::Reverted)) => Err(Failure::Reverted(tx_hash)),
            Ok(Ok(Confirmation::Unconfirmed)) | Err(_) => Err(Failure::Unconfirmed {
                tx_hash: Some(tx_hash),
                reason: format!(
                    "no receipt for {tx_hash} within {:?}",
                    self.options.action_timeout
                ),
            }),
            Ok(Err(e)) => Err(Failure::Unconfirmed {
                tx_hash: Some(tx_hash),
                reason: format!("confirmation of {tx_hash} could not be read: {e}"),
            }),
        }
    }

    /// Submit through `submit` and wait for the confirmation, all before one deadline.
    async fn settle<B, T, F>(
        &self,
        backend: &B,
        submit: F,
        tx_of: fn(&T) -> TxHash,
    ) -> Result<T, Failure>
    where
        B: ExecutionBackend,
        F: Future<Output = Result<T, BackendError>>,
    {
        let deadline = self.deadline();
        let submitted = self.submit(deadline, submit).await?;
        self.confirm(backend, deadline, tx_of(&submitted)).await?;
        Ok(submitted)
    }

    /// Turn a failed Deploy or Upgrade into a halt.
    ///
    /// An unconfirmed one may still land, so it is marked pending on its kind and later
    /// plans refuse the kind until the marker is reconciled.
    #[allow(clippy::too_many_arguments)]
    fn halt_irreversible(
        &self,
        position: usize,
        kind: &ModuleKind,
        action: PendingAction,
        logic: &LogicRef,
        address: Option<Address>,
        failure: Failure,
        failed: impl FnOnce(String) -> DeployError,
    ) -> Halt {
        if let Failure::Unconfirmed { tx_hash, .. } = &failure {
            let pending = PendingOperation {
                action,
                version: logic.version.clone(),
                tx_hash: *tx_hash,
                address,
                submitted_at: Utc::now(),
            };
            if let Err(e) = self.ledger.record_pending(kind, pending) {
                tracing::error!(
                    position,
                    kind = %kind,
                    error = %e,
                    "Could not mark the unconfirmed operation as pending"
                );
            }
        }
        failure.into_halt(position, kind, failed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy<B: ExecutionBackend>(
        &self,
        position: usize,
        kind: &ModuleKind,
        logic: &LogicRef,
        args: &[PlannedArg],
        resolved: &mut BTreeMap<ModuleKind, Address>,
        backend: &B,
        entry: &mut ReportEntry,
    ) -> Result<(), Halt> {
        let failed = |reason: String| DeployError::DeploymentFailed {
            position,
            kind: kind.clone(),
            reason,
        };

        let args = args
            .iter()
            .map(|arg| match &arg.slot {
                ArgSlot::Value(value) => Ok(value.clone()),
                ArgSlot::AddressOf(dep) => resolved
                    .get(dep)
                    .map(|address| ArgValue::Address(*address))
                    .ok_or_else(|| failed(format!("address of {dep} is not resolved"))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(Halt::failed)?;

        entry.attempts = 1;
        let deadline = self.deadline();
        let deployment: ProxyDeployment = self
            .submit(deadline, backend.create_proxy(kind, logic, &args))
            .await
            .map_err(|failure| {
                entry.tx_hash = failure.tx_hash();
                self.halt_irreversible(
                    position,
                    kind,
                    PendingAction::Deploy,
                    logic,
                    None,
                    failure,
                    failed,
                )
            })?;

        // Known from here on, even if the receipt never shows up.
        entry.tx_hash = Some(deployment.tx_hash);
        entry.result_address = Some(deployment.address);
        self.confirm(backend, deadline, deployment.tx_hash)
            .await
            .map_err(|failure| {
                self.halt_irreversible(
                    position,
                    kind,
                    PendingAction::Deploy,
                    logic,
                    Some(deployment.address),
                    failure,
                    failed,
                )
            })?;

        self.ledger
            .record_deployed(kind, deployment.address, &logic.version)
            .map_err(Halt::unrecorded)?;
        resolved.insert(kind.clone(), deployment.address);

        tracing::info!(
            position,
            kind = %kind,
            address = %deployment.address,
            version = %logic.version,
            tx_hash = %deployment.tx_hash,
            "Module deployed"
        );
        Ok(())
    }

    async fn upgrade<B: ExecutionBackend>(
        &self,
        position: usize,
        kind: &ModuleKind,
        address: Address,
        logic: &LogicRef,
        backend: &B,
        entry: &mut ReportEntry,
    ) -> Result<(), Halt> {
        entry.attempts = 1;
        entry.result_address = Some(address);

        let tx_hash = self
            .settle(backend, backend.upgrade_proxy(address, logic), |tx: &TxHash| *tx)
            .await
            .map_err(|failure| {
                entry.tx_hash = failure.tx_hash();
                self.halt_irreversible(
                    position,
                    kind,
                    PendingAction::Upgrade,
                    logic,
                    Some(address),
                    failure,
                    |reason| DeployError::UpgradeFailed {
                        position,
                        kind: kind.clone(),
                        reason,
                    },
                )
            })?;

        entry.tx_hash = Some(tx_hash);
        self.ledger
            .record_upgraded(kind, &logic.version)
            .map_err(Halt::unrecorded)?;

        tracing::info!(
            position,
            kind = %kind,
            address = %address,
            version = %logic.version,
            tx_hash = %tx_hash,
            "Module upgraded"
        );
        Ok(())
    }

    /// Wire or Configure: call a setter, retrying reverted or rejected calls.
    #[allow(clippy::too_many_arguments)]
    async fn apply_setting<B: ExecutionBackend>(
        &self,
        position: usize,
        kind: &ModuleKind,
        method: &MethodSignature,
        args: Vec<ArgValue>,
        resolved: &BTreeMap<ModuleKind, Address>,
        backend: &B,
        entry: &mut ReportEntry,
    ) -> Result<(), Halt> {
        let Some(address) = resolved.get(kind).copied() else {
            return Err(Halt::failed(DeployError::ConfigurationFailed {
                position,
                kind: kind.clone(),
                method: method.to_string(),
                attempts: 0,
                reason: format!("address of {kind} is not resolved"),
            }));
        };
        entry.result_address = Some(address);

        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let call_args = &args;

        let result = (move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            self.settle(backend, backend.call(address, method, call_args), |tx: &TxHash| *tx)
                .await
        })
        .retry(self.options.retry.backoff())
        .sleep(tokio::time::sleep)
        .when(Failure::is_retryable)
        .notify(|failure: &Failure, delay: Duration| {
            tracing::warn!(
                position,
                kind = %kind,
                method = %method,
                error = %failure,
                ?delay,
                "Setting failed, retrying"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        entry.attempts = attempts;

        let tx_hash = result.map_err(|failure| {
            entry.tx_hash = failure.tx_hash();
            failure.into_halt(position, kind, |reason| DeployError::ConfigurationFailed {
                position,
                kind: kind.clone(),
                method: method.to_string(),
                attempts,
                reason,
            })
        })?;

        entry.tx_hash = Some(tx_hash);
        self.ledger
            .record_applied(kind, &method.to_string(), &fingerprint(&args))
            .map_err(Halt::unrecorded)?;

        tracing::info!(
            position,
            kind = %kind,
            method = %method,
            attempts,
            tx_hash = %tx_hash,
            "Setting applied"
        );
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
