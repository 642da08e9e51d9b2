//! stakewire is a CLI tool to deploy, upgrade and wire upgradeable staking modules.

mod cli;
mod output;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use cli::{Cli, Command, Outcome};
use stakewire_deploy::{
    Deployer, LedgerSnapshot, ModuleKind, Resolution, STAKEWIRE_CONF_FILENAME,
};

/// Resolve the configuration path: a directory stands for the `Stakewire.toml` inside it.
fn config_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(STAKEWIRE_CONF_FILENAME)
    } else {
        path.to_path_buf()
    }
}

/// Layer defaults, the configuration file and `STAKEWIRE_*` environment variables, then
/// apply the command line overrides.
fn load_deployer(cli: &Cli) -> Result<Deployer> {
    let path = config_path(&cli.config);
    if !path.exists() {
        anyhow::bail!(
            "Configuration file not found: {} (run `stakewire init` to create one)",
            path.display()
        );
    }

    let mut deployer: Deployer = Figment::from(Serialized::defaults(Deployer::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("STAKEWIRE_").split("__"))
        .extract()
        .context(format!("Failed to load configuration from {}", path.display()))?;

    if let Some(network) = &cli.network {
        deployer.network = network.clone();
    }
    if let Some(ledger) = &cli.ledger {
        deployer.ledger_path = ledger.clone();
    }

    tracing::debug!(
        config_path = %path.display(),
        network = %deployer.network,
        ledger = %deployer.ledger_path.display(),
        "Configuration loaded"
    );
    Ok(deployer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match &cli.command {
        Command::Init { force } => {
            let path = config_path(&cli.config);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Deployer::template().save_to_file(&path)?;
            println!(
                "Wrote {}. Replace the placeholder addresses and wiring setters before applying.",
                path.display()
            );
        }
        Command::Validate => {
            let deployer = load_deployer(&cli)?;
            let registry = deployer.validate()?;
            let target = deployer.target.validate(&registry)?;
            output::print_catalog(&registry, &target);
            println!(
                "Target is valid: {} module(s), {} pinned, {} post-deployment step(s).",
                target.modules.len(),
                target.pinned.len(),
                target.steps.len()
            );
        }
        Command::Plan => {
            let deployer = load_deployer(&cli)?;
            let registry = deployer.validate()?;
            let ledger = deployer.read_ledger()?;
            let plan = deployer.plan(&registry, &ledger)?;
            output::print_plan(&plan);
        }
        Command::Apply { dry_run } => {
            let deployer = load_deployer(&cli)?;
            tracing::info!(
                network = %deployer.network,
                dry_run,
                "Converging on the target..."
            );
            let (plan, report) = deployer.deploy(*dry_run).await?;
            if plan.is_converged() {
                println!("The ledger already matches the target.");
            }
            output::print_report(&report);
            if *dry_run {
                println!("Dry run: nothing was sent and the ledger was not modified.");
            }
            report.into_result()?;
        }
        Command::Status => {
            let deployer = load_deployer(&cli)?;
            let ledger = deployer.read_ledger()?;
            output::print_ledger(&ledger.snapshot()?);
        }
        Command::Reconcile {
            kind,
            outcome,
            address,
        } => {
            let resolution = match outcome {
                Outcome::Landed => Resolution::Landed { address: *address },
                Outcome::Dropped if address.is_some() => {
                    anyhow::bail!("--address only applies to a landed operation")
                }
                Outcome::Dropped => Resolution::Dropped,
            };
            let deployer = load_deployer(&cli)?;
            let kind = ModuleKind::from(kind.as_str());
            let record = deployer.reconcile(&kind, resolution)?;
            output::print_ledger(&LedgerSnapshot(BTreeMap::from([(kind, record)])));
        }
    }

    Ok(())
}
