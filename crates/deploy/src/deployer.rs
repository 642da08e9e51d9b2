use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use url::Url;

use crate::{
    DeploymentRecord, ExecutionBackend, ExecutionOptions, ExecutionReport, FileLedgerStore,
    JsonRpcBackend, Ledger, LogicRef, MemoryLedgerStore, ModuleDescriptor, ModuleKind,
    Orchestrator, Plan, Registry, Resolution, RpcSettings, SimulatedBackend, TargetSpec, planner,
};

/// The default name for the stakewire configuration file.
pub const STAKEWIRE_CONF_FILENAME: &str = "Stakewire.toml";

/// Default interval between receipt polls.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Connection profile of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Unlocked account that sends every transaction.
    pub from: Address,
    /// Expected chain id. Checked against `eth_chainId` before anything is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Fixed gas limit per transaction. The node estimates it when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    /// Fixed gas price in wei. The node decides when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u64>,
    /// Directory holding `<Contract>.json` build artifacts.
    pub artifacts: PathBuf,
    /// Overrides `execution.action_timeout_secs` on this network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_timeout_secs: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// A complete deployment description.
///
/// This struct contains everything needed to converge a network on a module graph and can be
/// serialized to/from TOML format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployer {
    /// Path to the persisted ledger.
    pub ledger_path: PathBuf,
    /// Name of the selected network profile.
    pub network: String,
    /// Network profiles by name.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Per-action timeout and retry policy.
    #[serde(default)]
    pub execution: ExecutionOptions,
    /// Custom module catalog. The standard catalog is used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleDescriptor>,
    /// The module graph to converge on.
    #[serde(default)]
    pub target: TargetSpec,
}

impl Default for Deployer {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        if let Ok(rpc_url) = Url::parse("http://127.0.0.1:8545") {
            networks.insert(
                "localhost".to_string(),
                NetworkConfig {
                    rpc_url,
                    from: Address::ZERO,
                    chain_id: None,
                    gas: None,
                    gas_price: None,
                    artifacts: PathBuf::from("artifacts"),
                    confirmation_timeout_secs: None,
                    poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
                },
            );
        }

        Self {
            ledger_path: PathBuf::from("deployments/ledger.json"),
            network: "localhost".to_string(),
            networks,
            execution: ExecutionOptions::default(),
            modules: Vec::new(),
            target: TargetSpec::default(),
        }
    }
}

impl Deployer {
    /// A starting configuration targeting the whole standard catalog at version 1.
    ///
    /// Addresses are placeholders and the wiring setters are examples; both must be edited
    /// to match the deployed contracts before applying.
    pub fn template() -> Self {
        let placeholder = serde_json::json!(Address::ZERO);
        let target = TargetSpec::default()
            .module("Vault", "1")
            .arg("Vault", "asset", placeholder.clone())
            .arg("Vault", "owner", placeholder.clone())
            .arg("Vault", "governor", placeholder.clone())
            .module("Treasury", "1")
            .module("Vesting", "1")
            .module("Distributor", "1")
            .arg("Distributor", "rewardToken", placeholder.clone())
            .arg("Distributor", "owner", placeholder.clone())
            .arg("Distributor", "governor", placeholder)
            .module("Multicall", "1")
            .wire("Vault", "updateVestedFX", "Vesting")
            .wire("Vault", "updateFeeTreasury", "Treasury")
            .wire("Vault", "updateDistributor", "Distributor");

        Self {
            target,
            ..Self::default()
        }
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deployer config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, or from `Stakewire.toml` inside a directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file or directory not found: {}",
                path.display()
            ));
        }

        let config_path = if path.is_dir() {
            path.join(STAKEWIRE_CONF_FILENAME)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&config_path)
            .context(format!("Failed to read config from {}", config_path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        tracing::info!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }

    /// The module catalog this deployment uses.
    pub fn registry(&self) -> Result<Registry> {
        let registry = if self.modules.is_empty() {
            Registry::standard()
        } else {
            Registry::builder().modules(self.modules.clone()).build()
        };
        registry.context("Invalid module catalog")
    }

    /// The selected network profile.
    pub fn network_config(&self) -> Result<&NetworkConfig> {
        self.networks.get(&self.network).with_context(|| {
            format!(
                "Unknown network '{}' (configured: {})",
                self.network,
                self.networks.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Execution options, with the network's timeout override applied.
    pub fn execution_options(&self) -> ExecutionOptions {
        let mut options = self.execution.clone();
        if let Some(secs) = self
            .network_config()
            .ok()
            .and_then(|n| n.confirmation_timeout_secs)
        {
            options.action_timeout = Duration::from_secs(secs);
        }
        options
    }

    pub fn rpc_settings(&self) -> Result<RpcSettings> {
        let network = self.network_config()?;
        if network.from == Address::ZERO {
            anyhow::bail!(
                "Network '{}' has no sender: set networks.{}.from",
                self.network,
                self.network
            );
        }
        Ok(RpcSettings {
            url: network.rpc_url.clone(),
            from: network.from,
            chain_id: network.chain_id,
            gas: network.gas,
            gas_price: network.gas_price,
            artifacts: network.artifacts.clone(),
            poll_interval: Duration::from_millis(network.poll_interval_ms),
        })
    }

    /// Validate the catalog and the target without touching the ledger.
    pub fn validate(&self) -> Result<Registry> {
        let registry = self.registry()?;
        self.target
            .validate(&registry)
            .context("Invalid deployment target")?;
        Ok(registry)
    }

    /// Open the ledger file, taking its lock, and seed missing entries.
    pub fn open_ledger(&self, registry: &Registry) -> Result<Ledger> {
        let store = FileLedgerStore::open(&self.ledger_path)
            .context(format!("Failed to open ledger {}", self.ledger_path.display()))?;
        let ledger = Ledger::open(store)
            .context(format!("Failed to load ledger {}", self.ledger_path.display()))?;
        ledger.ensure_entries(registry)?;
        Ok(ledger)
    }

    /// Open the ledger file for reading, without seeding missing entries.
    pub fn read_ledger(&self) -> Result<Ledger> {
        let store = FileLedgerStore::open(&self.ledger_path)
            .context(format!("Failed to open ledger {}", self.ledger_path.display()))?;
        Ledger::open(store).context(format!("Failed to load ledger {}", self.ledger_path.display()))
    }

    /// Compute the plan converging `ledger` on the target.
    pub fn plan(&self, registry: &Registry, ledger: &Ledger) -> Result<Plan> {
        let plan = planner::plan(&self.target, &ledger.snapshot()?, registry)?;
        Ok(plan)
    }

    /// Settle the pending operation of `kind` in the ledger file.
    pub fn reconcile(&self, kind: &ModuleKind, resolution: Resolution) -> Result<DeploymentRecord> {
        self.registry()?.describe(kind)?;
        let ledger = self.read_ledger()?;
        let record = ledger
            .reconcile(kind, resolution)
            .context(format!("Failed to reconcile {kind}"))?;
        Ok(record)
    }

    /// Plan and execute against `backend`.
    pub async fn apply_with<B: ExecutionBackend>(
        &self,
        registry: &Registry,
        ledger: &Ledger,
        backend: &B,
    ) -> Result<(Plan, ExecutionReport)> {
        let plan = self.plan(registry, ledger)?;
        if plan.is_converged() {
            tracing::info!("Ledger already matches the target, nothing to do");
        }

        let orchestrator = Orchestrator::new(ledger.clone(), self.execution_options());
        let report = orchestrator.execute(&plan, backend).await?;
        Ok((plan, report))
    }

    /// Converge the selected network on the target.
    ///
    /// With `dry_run`, the plan runs against a simulated chain seeded from the current ledger,
    /// and the ledger file is left untouched.
    pub async fn deploy(&self, dry_run: bool) -> Result<(Plan, ExecutionReport)> {
        let registry = self.validate()?;

        if dry_run {
            // A dry run never writes the file.
            let snapshot = self.read_ledger()?.snapshot()?;
            let backend = self.simulated_backend(&registry, &snapshot)?;
            let ledger = Ledger::open(MemoryLedgerStore::with_snapshot(snapshot))?;
            ledger.ensure_entries(&registry)?;

            tracing::info!(network = %self.network, "Dry run against a simulated chain");
            return self.apply_with(&registry, &ledger, &backend).await;
        }

        let ledger = self.open_ledger(&registry)?;
        let backend = JsonRpcBackend::connect(self.rpc_settings()?)
            .await
            .context(format!("Failed to connect to network '{}'", self.network))?;

        tracing::info!(
            network = %self.network,
            ledger = %self.ledger_path.display(),
            "Applying deployment"
        );
        self.apply_with(&registry, &ledger, &backend).await
    }

    /// A simulated chain holding a proxy for every deployed ledger entry.
    ///
    /// Transactions come from the simulator's own account, so the addresses a dry run
    /// reports are placeholders that cannot be mistaken for the network sender's.
    fn simulated_backend(
        &self,
        registry: &Registry,
        snapshot: &crate::LedgerSnapshot,
    ) -> Result<SimulatedBackend> {
        let backend = SimulatedBackend::default();

        for (kind, record) in snapshot.iter() {
            let Some(address) = record.address else {
                continue;
            };
            let descriptor = registry.describe(kind)?;
            backend.adopt(
                kind.clone(),
                address,
                LogicRef {
                    contract: descriptor.contract.clone(),
                    version: record.logic_version.clone(),
                    initializer: descriptor.initializer_signature(),
                },
            );
        }
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn template_round_trips_through_toml() {
        let dir = TempDir::new("stakewire").unwrap();
        let path = dir.path().join(STAKEWIRE_CONF_FILENAME);

        let deployer = Deployer::template();
        deployer.save_to_file(&path).unwrap();

        // Loading a directory picks up the default file name.
        let loaded = Deployer::load_from_file(dir.path()).unwrap();
        assert_eq!(loaded, deployer);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn network_profile_round_trips_with_every_field() {
        let dir = TempDir::new("stakewire").unwrap();
        let path = dir.path().join(STAKEWIRE_CONF_FILENAME);

        let fx = NetworkConfig {
            rpc_url: Url::parse("https://fx-json-web3.functionx.io:8545").unwrap(),
            from: Address::repeat_byte(0x11),
            chain_id: Some(530),
            gas: Some(8_000_000),
            gas_price: Some(505_000_000_000),
            artifacts: PathBuf::from("out"),
            confirmation_timeout_secs: Some(300),
            poll_interval_ms: 2000,
        };
        let mut deployer = Deployer::template();
        deployer.networks.insert("fxMainnet".to_string(), fx.clone());
        deployer.network = "fxMainnet".to_string();

        deployer.save_to_file(&path).unwrap();
        let loaded = Deployer::load_from_file(&path).unwrap();
        assert_eq!(loaded.network_config().unwrap(), &fx);

        let settings = loaded.rpc_settings().unwrap();
        assert_eq!(settings.gas_price, Some(505_000_000_000));
        assert_eq!(settings.chain_id, Some(530));
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(loaded.execution_options().action_timeout, Duration::from_secs(300));
    }

    #[test]
    fn handwritten_network_profile_parses() {
        let network: NetworkConfig = toml::from_str(
            r#"
                rpc_url = "https://testnet-fx-json-web3.functionx.io:8545"
                from = "0x1111111111111111111111111111111111111111"
                chain_id = 90001
                gas = 5000000
                gas_price = 600000000000
                artifacts = "artifacts"
            "#,
        )
        .unwrap();
        assert_eq!(network.gas_price, Some(600_000_000_000));
        assert_eq!(network.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn missing_config_is_reported() {
        let err = Deployer::load_from_file(Path::new("/nonexistent/Stakewire.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn unknown_network_is_reported() {
        let deployer = Deployer {
            network: "fxMainnet".to_string(),
            ..Deployer::default()
        };
        let err = deployer.network_config().unwrap_err();
        assert!(err.to_string().contains("localhost"));
    }

    #[test]
    fn sender_is_required_for_rpc() {
        assert!(Deployer::default().rpc_settings().is_err());
    }

    #[test]
    fn network_timeout_overrides_execution_timeout() {
        let mut deployer = Deployer::default();
        if let Some(network) = deployer.networks.get_mut("localhost") {
            network.confirmation_timeout_secs = Some(7);
        }
        assert_eq!(
            deployer.execution_options().action_timeout,
            Duration::from_secs(7)
        );
    }

    #[test]
    fn reconcile_settles_the_ledger_file() {
        let dir = TempDir::new("stakewire").unwrap();
        let deployer = Deployer {
            ledger_path: dir.path().join("ledger.json"),
            ..Deployer::template()
        };
        let vault = ModuleKind::from("Vault");
        let address = Address::repeat_byte(0x0a);

        {
            let ledger = deployer.read_ledger().unwrap();
            ledger
                .record_pending(
                    &vault,
                    crate::PendingOperation {
                        action: crate::PendingAction::Deploy,
                        version: "1".to_string(),
                        tx_hash: None,
                        address: Some(address),
                        submitted_at: chrono::Utc::now(),
                    },
                )
                .unwrap();
        }
        let registry = deployer.validate().unwrap();
        let err = deployer
            .plan(&registry, &deployer.read_ledger().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("unconfirmed deploy"));

        let record = deployer
            .reconcile(&vault, Resolution::Landed { address: None })
            .unwrap();
        assert_eq!(record.address, Some(address));

        let plan = deployer
            .plan(&registry, &deployer.read_ledger().unwrap())
            .unwrap();
        assert!(matches!(&plan.actions()[0], crate::Action::Skip { address: a, .. } if *a == address));

        assert!(
            deployer
                .reconcile(&ModuleKind::from("Oracle"), Resolution::Dropped)
                .is_err()
        );
    }

    #[tokio::test]
    async fn dry_run_never_reports_a_recorded_address_for_a_new_module() {
        let dir = TempDir::new("stakewire").unwrap();
        let deployer = Deployer {
            ledger_path: dir.path().join("ledger.json"),
            ..Deployer::template()
        };
        // Worst case: the recorded Vault sits where the simulator would deploy first.
        let recorded = SimulatedBackend::default().deployer().create(0);
        deployer
            .read_ledger()
            .unwrap()
            .record_deployed(&ModuleKind::from("Vault"), recorded, "1")
            .unwrap();

        let (plan, report) = deployer.deploy(true).await.unwrap();
        assert!(report.is_completed());
        assert!(matches!(&plan.actions()[0], crate::Action::Skip { .. }));

        let deployed: Vec<Address> = report
            .entries
            .iter()
            .filter(|e| e.action.label() == "deploy")
            .filter_map(|e| e.result_address)
            .collect();
        assert_eq!(deployed.len(), 4);
        assert!(!deployed.contains(&recorded));
    }

    #[tokio::test]
    async fn dry_run_leaves_the_ledger_file_untouched() {
        let dir = TempDir::new("stakewire").unwrap();
        let mut deployer = Deployer::template();
        deployer.ledger_path = dir.path().join("ledger.json");

        let (plan, report) = deployer.deploy(true).await.unwrap();
        assert!(report.is_completed());
        assert_eq!(report.entries.len(), plan.len());

        assert!(!deployer.ledger_path.exists());
    }
}
