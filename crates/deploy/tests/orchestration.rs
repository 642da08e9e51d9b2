//! Integration tests for stakewire-deploy.
//!
//! Every scenario plans against a ledger and executes against the simulated backend, so no
//! node is required. Run with: cargo test --test orchestration

use std::time::Duration;

use alloy_core::primitives::Address;
use anyhow::Result;
use serde_json::json;
use stakewire_deploy::{
    Action, ActionStatus, ArgSlot, ArgValue, BackendError, Confirmation, DeployError, Deployer,
    ExecutionBackend, ExecutionOptions, ExecutionReport, Fault, FileLedgerStore, Ledger, LogicRef,
    MemoryLedgerStore, MethodSignature, ModuleDescriptor, ModuleKind, Orchestrator, PendingAction,
    Plan, ProxyDeployment, Registry, Resolution, RetryPolicy, RunState, ScalarType,
    SimulatedBackend, TargetSpec, TxHash, plan,
};
use tempdir::TempDir;

const OWNER: &str = "0x00000000000000000000000000000000000000aa";
const ASSET: &str = "0x00000000000000000000000000000000000000a1";
const FEE_RATE: &str = "setFeeRate(uint256)";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_options() -> ExecutionOptions {
    ExecutionOptions {
        action_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    }
}

/// Vault and a Treasury that takes the Vault address in its initializer.
fn vault_treasury_registry() -> Registry {
    Registry::builder()
        .module(ModuleDescriptor::new("Vault", "StakeFXVault").scalar("owner", ScalarType::Address))
        .module(ModuleDescriptor::new("Treasury", "FeeTreasury").reference("vault", "Vault"))
        .build()
        .expect("valid registry")
}

fn standard_vault(version: &str) -> TargetSpec {
    TargetSpec::default()
        .module("Vault", version)
        .arg("Vault", "asset", json!(ASSET))
        .arg("Vault", "owner", json!(OWNER))
        .arg("Vault", "governor", json!(OWNER))
}

fn kind(name: &str) -> ModuleKind {
    ModuleKind::from(name)
}

/// Test setup context: one registry, one ledger, one simulated chain.
struct TestContext {
    registry: Registry,
    ledger: Ledger,
    backend: SimulatedBackend,
    options: ExecutionOptions,
}

impl TestContext {
    fn new(registry: Registry) -> Self {
        init_tracing();
        Self {
            registry,
            ledger: Ledger::in_memory(),
            backend: SimulatedBackend::default(),
            options: fast_options(),
        }
    }

    fn plan(&self, target: &TargetSpec) -> Result<Plan> {
        Ok(plan(target, &self.ledger.snapshot()?, &self.registry)?)
    }

    /// Plan and execute one run.
    async fn converge(&self, target: &TargetSpec) -> Result<(Plan, ExecutionReport)> {
        let plan = self.plan(target)?;
        let report = Orchestrator::new(self.ledger.clone(), self.options.clone())
            .execute(&plan, &self.backend)
            .await?;
        Ok((plan, report))
    }

    fn address_of(&self, name: &str) -> Result<Address> {
        self.ledger
            .address_of(&kind(name))?
            .ok_or_else(|| anyhow::anyhow!("{name} is not deployed"))
    }
}

fn labels(plan: &Plan) -> Vec<String> {
    plan.actions()
        .iter()
        .map(|a| format!("{} {}", a.label(), a.kind()))
        .collect()
}

#[tokio::test]
async fn fresh_vault_and_treasury_are_deployed_and_cross_wired() -> Result<()> {
    let ctx = TestContext::new(vault_treasury_registry());
    let target = TargetSpec::default()
        .module("Vault", "1")
        .arg("Vault", "owner", json!(OWNER))
        .module("Treasury", "1")
        .wire("Treasury", "setVault", "Vault")
        .wire("Vault", "setTreasury", "Treasury");

    let (plan, report) = ctx.converge(&target).await?;

    assert_eq!(
        labels(&plan),
        vec![
            "deploy Vault",
            "deploy Treasury",
            "wire Treasury",
            "wire Vault"
        ]
    );
    match &plan.actions()[1] {
        Action::Deploy { args, .. } => assert_eq!(args[0].slot, ArgSlot::AddressOf(kind("Vault"))),
        other => panic!("expected a deploy, got {other}"),
    }

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.count(ActionStatus::Done), 4);

    let vault = ctx.address_of("Vault")?;
    let treasury = ctx.address_of("Treasury")?;
    for name in ["Vault", "Treasury"] {
        let record = ctx.ledger.get(&kind(name))?.expect("ledger entry");
        assert_eq!(record.logic_version, "1");
        assert!(record.last_updated.is_some());
    }

    // The placeholder was resolved to the address Vault received in the same run.
    let treasury_proxy = ctx.backend.proxy(treasury).expect("treasury proxy");
    assert_eq!(treasury_proxy.init_args, vec![ArgValue::Address(vault)]);
    assert_eq!(report.entries[1].result_address, Some(treasury));

    let vault_proxy = ctx.backend.proxy(vault).expect("vault proxy");
    assert_eq!(
        vault_proxy.settings["setTreasury(address)"],
        vec![ArgValue::Address(treasury)]
    );
    assert_eq!(
        ctx.backend.proxy(treasury).expect("treasury proxy").settings["setVault(address)"],
        vec![ArgValue::Address(vault)]
    );
    Ok(())
}

#[tokio::test]
async fn version_bump_upgrades_in_place() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.converge(&standard_vault("1")).await?;
    let x = ctx.address_of("Vault")?;

    let (plan, report) = ctx.converge(&standard_vault("2")).await?;
    assert_eq!(plan.len(), 1);
    assert!(matches!(
        &plan.actions()[0],
        Action::Upgrade { address, .. } if *address == x
    ));
    assert!(report.is_completed());

    let record = ctx.ledger.get(&kind("Vault"))?.expect("ledger entry");
    assert_eq!(record.address, Some(x));
    assert_eq!(record.logic_version, "2");
    assert_eq!(ctx.backend.creations_of(&kind("Vault")), 1);
    assert_eq!(ctx.backend.proxy(x).expect("proxy").logic.version, "2");
    Ok(())
}

#[tokio::test]
async fn configure_retries_reverts_until_confirmed() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.backend.inject(Fault::RevertCall {
        method: "setFeeRate".to_string(),
        times: 2,
    });

    let target = standard_vault("1").configure("Vault", FEE_RATE, vec![json!(30)]);
    let (_, report) = ctx.converge(&target).await?;

    assert!(report.is_completed());
    assert_eq!(report.count(ActionStatus::Failed), 0);
    let configure = &report.entries[1];
    assert!(matches!(configure.action, Action::Configure { .. }));
    assert_eq!(configure.status, ActionStatus::Done);
    assert_eq!(configure.attempts, 3);

    let record = ctx.ledger.get(&kind("Vault"))?.expect("ledger entry");
    assert!(record.applied.contains_key(FEE_RATE));
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_halt_then_resume_at_the_failed_setting() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.backend.inject(Fault::RevertCall {
        method: FEE_RATE.to_string(),
        times: 10,
    });
    let target = standard_vault("1").configure("Vault", FEE_RATE, vec![json!(30)]);

    let (_, report) = ctx.converge(&target).await?;
    assert_eq!(report.state, RunState::Halted { position: 2 });
    assert_eq!(report.entries[1].status, ActionStatus::Failed);
    assert!(matches!(
        report.failure,
        Some(DeployError::ConfigurationFailed { position: 2, attempts: 3, .. })
    ));
    let vault = ctx.address_of("Vault")?;

    ctx.backend.clear_faults();
    let (plan, report) = ctx.converge(&target).await?;
    assert_eq!(labels(&plan), vec!["skip Vault", "configure Vault"]);
    assert!(report.is_completed());
    assert_eq!(ctx.address_of("Vault")?, vault);
    assert_eq!(ctx.backend.creations_of(&kind("Vault")), 1);
    Ok(())
}

#[tokio::test]
async fn rejected_deploy_halts_and_resumes_without_redeploying() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.backend.inject(Fault::RejectCreate {
        kind: kind("Vesting"),
    });
    let target = standard_vault("1")
        .module("Treasury", "1")
        .module("Vesting", "1");

    let (_, report) = ctx.converge(&target).await?;
    assert_eq!(report.state, RunState::Halted { position: 3 });
    assert_eq!(report.entries.len(), 3);
    assert!(matches!(
        report.failure,
        Some(DeployError::DeploymentFailed { position: 3, .. })
    ));
    assert!(ctx.ledger.address_of(&kind("Treasury"))?.is_some());
    assert!(ctx.ledger.address_of(&kind("Vesting"))?.is_none());

    let (plan, report) = ctx.converge(&target).await?;
    assert_eq!(
        labels(&plan),
        vec!["skip Vault", "skip Treasury", "deploy Vesting"]
    );
    assert!(report.is_completed());
    assert_eq!(ctx.backend.creations_of(&kind("Vault")), 1);
    assert_eq!(ctx.backend.creations_of(&kind("Treasury")), 1);
    assert_eq!(ctx.backend.creations_of(&kind("Vesting")), 1);
    Ok(())
}

#[tokio::test]
async fn rejected_upgrade_keeps_the_recorded_version() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.converge(&standard_vault("1")).await?;
    ctx.backend.inject(Fault::RejectUpgrade {
        kind: kind("Vault"),
    });

    let (_, report) = ctx.converge(&standard_vault("2")).await?;
    assert!(matches!(
        report.failure,
        Some(DeployError::UpgradeFailed { position: 1, .. })
    ));
    let record = ctx.ledger.get(&kind("Vault"))?.expect("ledger entry");
    assert_eq!(record.logic_version, "1");
    Ok(())
}

#[tokio::test]
async fn converged_ledger_replans_to_all_skips() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    let target = standard_vault("1")
        .module("Treasury", "1")
        .module("Multicall", "1")
        .wire("Vault", "updateFeeTreasury", "Treasury")
        .configure("Vault", FEE_RATE, vec![json!(30)]);

    let (_, report) = ctx.converge(&target).await?;
    assert!(report.is_completed());
    let submitted = ctx.backend.journal().len();

    let (plan, report) = ctx.converge(&target).await?;
    assert!(plan.is_converged());
    assert_eq!(plan.len(), 3);
    assert_eq!(report.count(ActionStatus::Skipped), 3);
    assert_eq!(ctx.backend.journal().len(), submitted);
    Ok(())
}

#[tokio::test]
async fn cycle_is_rejected_before_any_submission() {
    let deployer = Deployer {
        modules: vec![
            ModuleDescriptor::new("A", "A").reference("b", "B"),
            ModuleDescriptor::new("B", "B").reference("a", "A"),
        ],
        target: TargetSpec::default().module("A", "1"),
        ..Deployer::default()
    };

    let err = deployer.validate().unwrap_err();
    let cause = err
        .chain()
        .find_map(|e| e.downcast_ref::<DeployError>())
        .expect("a deploy error");
    assert!(matches!(cause, DeployError::CyclicDependency { cycle } if cycle.len() == 3));
}

#[tokio::test]
async fn withheld_confirmation_is_unconfirmed_and_not_recorded() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.backend.inject(Fault::WithholdConfirmation {
        kind: kind("Vault"),
    });

    let (_, report) = ctx.converge(&standard_vault("1")).await?;
    assert_eq!(report.state, RunState::Halted { position: 1 });
    assert_eq!(report.entries[0].status, ActionStatus::Unconfirmed);
    assert!(report.entries[0].tx_hash.is_some());
    assert!(matches!(
        report.failure,
        Some(DeployError::Unconfirmed { tx_hash: Some(_), .. })
    ));
    assert!(ctx.ledger.address_of(&kind("Vault"))?.is_none());

    // The address the creation was sent to is reported and kept for reconciliation.
    let submitted = report.entries[0].result_address.expect("submitted address");
    let pending = ctx
        .ledger
        .get(&kind("Vault"))?
        .and_then(|r| r.pending)
        .expect("pending marker");
    assert_eq!(pending.action, PendingAction::Deploy);
    assert_eq!(pending.address, Some(submitted));
    assert_eq!(pending.tx_hash, report.entries[0].tx_hash);
    Ok(())
}

#[tokio::test]
async fn unconfirmed_deploy_is_never_sent_twice() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.backend.inject(Fault::WithholdConfirmation {
        kind: kind("Vault"),
    });
    let target = standard_vault("1").module("Treasury", "1");

    let (_, report) = ctx.converge(&target).await?;
    assert_eq!(report.entries[0].status, ActionStatus::Unconfirmed);
    let submitted = report.entries[0].result_address.expect("submitted address");

    // Re-running before reconciliation is refused at plan time.
    let err = ctx.converge(&target).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::PendingReconciliation { kind, .. }) if kind.as_str() == "Vault"
    ));
    assert_eq!(ctx.backend.creations_of(&kind("Vault")), 1);

    // The chain shows the proxy: record it and resume.
    ctx.ledger
        .reconcile(&kind("Vault"), Resolution::Landed { address: None })?;
    let (plan, report) = ctx.converge(&target).await?;
    assert_eq!(labels(&plan), vec!["skip Vault", "deploy Treasury"]);
    assert!(report.is_completed());
    assert_eq!(ctx.address_of("Vault")?, submitted);
    assert_eq!(ctx.backend.creations_of(&kind("Vault")), 1);
    Ok(())
}

#[tokio::test]
async fn dropped_upgrade_is_planned_again() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.converge(&standard_vault("1")).await?;
    let vault = ctx.address_of("Vault")?;
    ctx.backend.inject(Fault::WithholdConfirmation {
        kind: kind("Vault"),
    });

    let (_, report) = ctx.converge(&standard_vault("2")).await?;
    assert_eq!(report.entries[0].status, ActionStatus::Unconfirmed);
    assert_eq!(report.entries[0].result_address, Some(vault));
    assert!(ctx.plan(&standard_vault("2")).is_err());

    let record = ctx.ledger.reconcile(&kind("Vault"), Resolution::Dropped)?;
    assert_eq!(record.logic_version, "1");
    let plan = ctx.plan(&standard_vault("2"))?;
    assert!(matches!(
        &plan.actions()[0],
        Action::Upgrade { address, from_version, .. } if *address == vault && from_version == "1"
    ));
    Ok(())
}

#[tokio::test]
async fn unconfirmed_setting_is_not_retried() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    ctx.converge(&standard_vault("1")).await?;
    ctx.backend.inject(Fault::WithholdConfirmation {
        kind: kind("Vault"),
    });

    let target = standard_vault("1").configure("Vault", FEE_RATE, vec![json!(30)]);
    let (_, report) = ctx.converge(&target).await?;

    let configure = &report.entries[1];
    assert_eq!(configure.status, ActionStatus::Unconfirmed);
    assert_eq!(configure.attempts, 1);
    let record = ctx.ledger.get(&kind("Vault"))?.expect("ledger entry");
    assert!(record.applied.is_empty());
    Ok(())
}

/// A backend whose node never answers.
struct StallingBackend;

impl ExecutionBackend for StallingBackend {
    async fn create_proxy(
        &self,
        _kind: &ModuleKind,
        _logic: &LogicRef,
        _args: &[ArgValue],
    ) -> Result<ProxyDeployment, BackendError> {
        std::future::pending().await
    }

    async fn upgrade_proxy(&self, _address: Address, _logic: &LogicRef) -> Result<TxHash, BackendError> {
        std::future::pending().await
    }

    async fn call(
        &self,
        _address: Address,
        _method: &MethodSignature,
        _args: &[ArgValue],
    ) -> Result<TxHash, BackendError> {
        std::future::pending().await
    }

    async fn wait_for_confirmation(
        &self,
        _tx_hash: TxHash,
        _timeout: Duration,
    ) -> Result<Confirmation, BackendError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stalled_backend_times_out_as_unconfirmed() -> Result<()> {
    init_tracing();
    let registry = Registry::standard()?;
    let ledger = Ledger::in_memory();
    let options = ExecutionOptions {
        action_timeout: Duration::from_millis(50),
        ..fast_options()
    };

    let plan = plan(&standard_vault("1"), &ledger.snapshot()?, &registry)?;
    let report = Orchestrator::new(ledger.clone(), options)
        .execute(&plan, &StallingBackend)
        .await?;

    assert_eq!(report.entries[0].status, ActionStatus::Unconfirmed);
    assert!(matches!(
        report.failure,
        Some(DeployError::Unconfirmed { tx_hash: None, position: 1, .. })
    ));
    assert!(ledger.address_of(&kind("Vault"))?.is_none());
    Ok(())
}

#[tokio::test]
async fn confirmed_action_with_failed_ledger_write_is_unconfirmed() -> Result<()> {
    init_tracing();
    let registry = Registry::standard()?;
    let store = MemoryLedgerStore::default();
    let ledger = Ledger::open(store.clone())?;
    let backend = SimulatedBackend::default();

    let plan = plan(&standard_vault("1"), &ledger.snapshot()?, &registry)?;
    store.fail_persists(true);
    let report = Orchestrator::new(ledger.clone(), fast_options())
        .execute(&plan, &backend)
        .await?;

    let entry = &report.entries[0];
    assert_eq!(entry.status, ActionStatus::Unconfirmed);
    assert!(entry.result_address.is_some());
    assert!(matches!(report.failure, Some(DeployError::LedgerIo { .. })));
    assert!(ledger.address_of(&kind("Vault"))?.is_none());
    Ok(())
}

#[tokio::test]
async fn ledger_file_survives_a_restart() -> Result<()> {
    init_tracing();
    let dir = TempDir::new("stakewire")?;
    let path = dir.path().join("ledger.json");
    let registry = Registry::standard()?;
    let backend = SimulatedBackend::default().with_fault(Fault::RejectCreate {
        kind: kind("Treasury"),
    });
    let target = standard_vault("1").module("Treasury", "1");

    let vault = {
        let ledger = Ledger::open(FileLedgerStore::open(&path)?)?;
        ledger.ensure_entries(&registry)?;
        let plan = plan(&target, &ledger.snapshot()?, &registry)?;
        let report = Orchestrator::new(ledger.clone(), fast_options())
            .execute(&plan, &backend)
            .await?;
        assert_eq!(report.state, RunState::Halted { position: 2 });
        ledger.address_of(&kind("Vault"))?.expect("vault recorded")
    };

    // A new process: the ledger is read back from disk.
    let ledger = Ledger::open(FileLedgerStore::open(&path)?)?;
    assert_eq!(ledger.snapshot()?.len(), 5);
    let plan = plan(&target, &ledger.snapshot()?, &registry)?;
    assert_eq!(labels(&plan), vec!["skip Vault", "deploy Treasury"]);

    let report = Orchestrator::new(ledger.clone(), fast_options())
        .execute(&plan, &backend)
        .await?;
    assert!(report.is_completed());
    assert_eq!(ledger.address_of(&kind("Vault"))?, Some(vault));

    let persisted: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(persisted["Treasury"]["logicVersion"], "1");
    assert!(persisted["Distributor"]["address"].is_null());
    Ok(())
}

#[tokio::test]
async fn pinned_dependency_is_passed_as_an_address() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    let external = Address::repeat_byte(0xee);
    let target = TargetSpec::default()
        .module("Multicall", "1")
        .pin("Vault", external);

    let (plan, report) = ctx.converge(&target).await?;
    assert_eq!(labels(&plan), vec!["deploy Multicall"]);
    assert!(report.is_completed());

    let multicall = ctx.address_of("Multicall")?;
    let proxy = ctx.backend.proxy(multicall).expect("multicall proxy");
    assert_eq!(proxy.init_args, vec![ArgValue::Address(external)]);
    assert!(ctx.ledger.address_of(&kind("Vault"))?.is_none());
    Ok(())
}

#[tokio::test]
async fn unresolved_dependency_fails_at_plan_time() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    let err = ctx
        .plan(&TargetSpec::default().module("Vesting", "1"))
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::UnresolvedDependency { required_by, .. }) if required_by.as_str() == "Vesting"
    ));
    assert!(ctx.backend.journal().is_empty());
    Ok(())
}

#[tokio::test]
async fn runs_touching_a_claimed_kind_are_refused() -> Result<()> {
    let ctx = TestContext::new(Registry::standard()?);
    let plan = ctx.plan(&standard_vault("1"))?;

    let claim = ctx.ledger.claim([kind("Vault")])?;
    let err = Orchestrator::new(ctx.ledger.clone(), fast_options())
        .execute(&plan, &ctx.backend)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::KindBusy(busy) if busy.as_str() == "Vault"));
    assert!(ctx.backend.journal().is_empty());

    drop(claim);
    let report = Orchestrator::new(ctx.ledger.clone(), fast_options())
        .execute(&plan, &ctx.backend)
        .await?;
    assert!(report.is_completed());
    Ok(())
}

/// The simulated chain, with every receipt taking `delay` to show up.
struct SlowBackend {
    inner: SimulatedBackend,
    delay: Duration,
}

impl ExecutionBackend for SlowBackend {
    async fn create_proxy(
        &self,
        kind: &ModuleKind,
        logic: &LogicRef,
        args: &[ArgValue],
    ) -> Result<ProxyDeployment, BackendError> {
        self.inner.create_proxy(kind, logic, args).await
    }

    async fn upgrade_proxy(&self, address: Address, logic: &LogicRef) -> Result<TxHash, BackendError> {
        self.inner.upgrade_proxy(address, logic).await
    }

    async fn call(
        &self,
        address: Address,
        method: &MethodSignature,
        args: &[ArgValue],
    ) -> Result<TxHash, BackendError> {
        self.inner.call(address, method, args).await
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.wait_for_confirmation(tx_hash, timeout).await
    }
}

#[tokio::test]
async fn disjoint_runs_share_one_ledger_concurrently() -> Result<()> {
    init_tracing();
    let registry = Registry::standard()?;
    let ledger = Ledger::in_memory();
    let backend = SlowBackend {
        inner: SimulatedBackend::default(),
        delay: Duration::from_millis(50),
    };
    let external = Address::repeat_byte(0xee);

    let vault_plan = plan(&standard_vault("1"), &ledger.snapshot()?, &registry)?;
    let multicall_target = TargetSpec::default()
        .module("Multicall", "1")
        .pin("Vault", external);
    let multicall_plan = plan(&multicall_target, &ledger.snapshot()?, &registry)?;

    let orchestrator = Orchestrator::new(ledger.clone(), fast_options());
    let (vault, multicall, overlapping) = tokio::join!(
        orchestrator.execute(&vault_plan, &backend),
        orchestrator.execute(&multicall_plan, &backend),
        orchestrator.execute(&vault_plan, &backend),
    );

    // Both disjoint runs held their claims at the same time and completed.
    assert!(vault?.is_completed());
    assert!(multicall?.is_completed());
    // A run overlapping on Vault was turned away while the first one held it.
    assert!(matches!(overlapping, Err(DeployError::KindBusy(busy)) if busy.as_str() == "Vault"));

    let snapshot = ledger.snapshot()?;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.get(&kind("Vault")).is_some_and(|r| r.is_deployed()));
    assert!(snapshot.get(&kind("Multicall")).is_some_and(|r| r.is_deployed()));
    assert_eq!(backend.inner.creations_of(&kind("Vault")), 1);

    // Claims are released once the runs end.
    assert!(ledger.claim([kind("Vault"), kind("Multicall")]).is_ok());
    Ok(())
}
