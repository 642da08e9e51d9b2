use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stakewire_deploy::{Address, STAKEWIRE_CONF_FILENAME};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "stakewire")]
#[command(
    author,
    version,
    about = "Deploy, upgrade and wire upgradeable staking modules from a single declarative target"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "STAKEWIRE_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or to a directory containing `Stakewire.toml`.
    #[arg(short, long, alias = "conf", env = "STAKEWIRE_CONFIG", default_value = STAKEWIRE_CONF_FILENAME)]
    pub config: PathBuf,

    /// Network profile to use, overriding the `network` key of the configuration.
    #[arg(short, long, env = "STAKEWIRE_NETWORK")]
    pub network: Option<String>,

    /// Path to the ledger file, overriding the `ledger_path` key of the configuration.
    #[arg(long, env = "STAKEWIRE_LEDGER")]
    pub ledger: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Write a starting configuration covering the standard module catalog.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Check the module catalog and the target without reading the ledger.
    Validate,

    /// Show the actions needed to converge the ledger on the target.
    Plan,

    /// Execute the plan against the selected network.
    Apply {
        /// Execute against a simulated chain seeded from the ledger. Nothing is sent and the
        /// ledger file is left untouched.
        #[arg(long, env = "STAKEWIRE_DRY_RUN")]
        dry_run: bool,
    },

    /// Show the ledger entry of every module kind.
    Status,

    /// Settle a deployment or upgrade that an earlier run left unconfirmed, once the chain
    /// has been checked.
    Reconcile {
        /// Module kind carrying the pending operation.
        kind: String,

        /// What happened to the pending transaction.
        #[arg(value_enum)]
        outcome: Outcome,

        /// Proxy address to record for a landed deployment whose address is unknown.
        #[arg(long)]
        address: Option<Address>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Outcome {
    /// The transaction is on chain.
    Landed,
    /// The transaction never made it on chain.
    Dropped,
}
