use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(version)]
#[command(about = "Execution and risk core for a multi-venue trading agent", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and the per-environment overlay
    #[arg(long, env = "BASTION_CONFIG_DIR", default_value = "config")]
    pub config_dir: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the core: startup reconciliation, then the interval loop until Ctrl-C / SIGTERM
    Run,
    /// Run a single reconciliation pass and print the report
    Reconcile {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

impl Cli {
    /// `run` when no subcommand is given
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}
