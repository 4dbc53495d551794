use catalog::ResourceId;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "phoenix")]
#[command(author = "Phoenix Hypervisor Maintainers")]
#[command(version)]
#[command(about = "Declarative LXC/VM provisioning for Proxmox", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (default: phoenix.toml in the config directory)
    #[arg(short, long, global = true, value_name = "PATH", env = "PHOENIX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create and converge resources, including everything they depend on
    Create {
        /// Resource ids (CTID / VMID)
        #[arg(required = true)]
        ids: Vec<ResourceId>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Converge independent subgraphs in parallel
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Show the creation order for resources without changing anything
    Plan {
        #[arg(required = true)]
        ids: Vec<ResourceId>,
    },

    /// Show the observed state of declared resources
    Status {
        /// Limit to these ids
        ids: Vec<ResourceId>,
    },

    /// Validate the resource document and certificate manifest
    Validate,

    /// Renew certificates that are close to expiry
    RenewCerts {
        /// Report what is due without issuing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
