use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "filerecon")]
#[command(about = "Reconcile files scattered across local, FTPS and cloud storage", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a full reconciliation across all configured backends
    Sync {
        /// List the resulting logical files once the run completes
        #[arg(long)]
        list: bool,
    },
    /// Sync, then print the reconciled logical files
    Files {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Enumerate every backend and print raw descriptors without clustering
    Entries {
        #[arg(long)]
        json: bool,
    },
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}
