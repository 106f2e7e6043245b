//! spmd - Storage pool manager
//!
//! Every invocation is one host acting on the shared repository. Pool
//! commands join the pool from the local reconnect record unless connect
//! parameters are given. `spm run` stays in the foreground serving the
//! SPM mailbox until interrupted.
//!
//! Results go to stdout as one JSON object carrying a `status` member;
//! logs go to stderr.

mod commands;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spmd_common::{Config, DomainClass, DomainId, HostId, PoolId, StorageType, VolumeId};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "spmd")]
#[command(about = "Storage pool manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SPMD_CONFIG", default_value = "/etc/spmd/spmd.toml")]
    config: PathBuf,

    /// Directory holding one sub-directory per domain
    #[arg(long, env = "SPMD_REPOSITORY")]
    repository: Option<PathBuf>,

    /// Directory of per-pool reconnect records
    #[arg(long, env = "SPMD_POOLS_DATA_DIR")]
    pools_data_dir: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, env = "SPMD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Storage domain operations
    Domain {
        #[command(subcommand)]
        action: DomainCommands,
    },
    /// Storage pool operations
    Pool {
        /// Pool UUID
        #[arg(long, env = "SPMD_POOL")]
        pool: PoolId,

        #[command(flatten)]
        join: JoinArgs,

        #[command(subcommand)]
        action: PoolCommands,
    },
    /// SPM role
    Spm {
        #[command(subcommand)]
        action: SpmCommands,
    },
    /// Ask the SPM to extend a volume and wait for the reply
    Extend {
        /// Pool UUID
        #[arg(long, env = "SPMD_POOL")]
        pool: PoolId,

        #[command(flatten)]
        join: JoinArgs,

        /// Domain holding the volume
        #[arg(long)]
        domain: DomainId,

        /// Volume UUID
        #[arg(long)]
        volume: VolumeId,

        /// Requested size in MiB
        #[arg(long)]
        size_mb: u64,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum DomainCommands {
    /// Format a new domain in the repository
    Create {
        /// Domain UUID, generated when omitted
        #[arg(long)]
        id: Option<DomainId>,
        /// Storage type (NFS, FCP, ISCSI, LOCALFS, CIFS or its number)
        #[arg(long = "type", default_value = "LOCALFS")]
        storage_type: StorageType,
        /// Domain class (data, iso, backup)
        #[arg(long, default_value = "data")]
        class: DomainClass,
        /// Description, at most 50 characters
        #[arg(long, default_value = "")]
        description: String,
        /// Format version
        #[arg(long, default_value = "2")]
        version: u32,
    },
    /// Show a domain
    Info {
        /// Domain UUID
        id: DomainId,
    },
    /// List the domains of the repository
    List,
}

/// Parameters to connect with when no reconnect record should be used
#[derive(Args, Debug, Clone, Default)]
struct JoinArgs {
    /// Host id within the pool
    #[arg(long, env = "SPMD_HOST_ID")]
    host_id: Option<HostId>,

    /// SCSI reservation key
    #[arg(long, default_value = "spmd")]
    scsi_key: String,

    /// Expected master domain
    #[arg(long)]
    master: Option<DomainId>,

    /// Expected master version
    #[arg(long)]
    master_version: Option<i64>,
}

#[derive(Args, Debug, Clone)]
struct LeaseArgs {
    #[arg(long, default_value = "ON")]
    lock_policy: String,
    #[arg(long, default_value = "3")]
    lease_retries: u32,
    #[arg(long, default_value = "30")]
    lease_time_sec: u32,
    #[arg(long, default_value = "5")]
    lock_renewal_interval_sec: u32,
    #[arg(long, default_value = "1")]
    io_op_timeout_sec: u32,
}

#[derive(Subcommand, Debug)]
enum PoolCommands {
    /// Create the pool around a master domain
    Create {
        /// Pool description
        #[arg(long)]
        name: String,
        /// Master domain
        #[arg(long = "msd")]
        master: DomainId,
        /// Member domains, the master included
        #[arg(long, value_delimiter = ',', required = true)]
        domains: Vec<DomainId>,
        /// Initial master version
        #[arg(long = "version", default_value = "0")]
        master_version: i64,
        #[command(flatten)]
        lease: LeaseArgs,
    },
    /// Connect and save the reconnect record
    Connect,
    /// Connect from the saved record
    Reconnect,
    /// Disconnect and drop the reconnect record
    Disconnect,
    /// Show the pool
    Info,
    /// Attach a domain
    Attach {
        domain: DomainId,
    },
    /// Detach a domain; detaching the master needs a new one
    Detach {
        domain: DomainId,
        #[arg(long = "new-msd")]
        new_master: Option<DomainId>,
        #[arg(long = "new-version", default_value = "0")]
        new_version: i64,
        /// Only drop the domain from the pool's map
        #[arg(long)]
        force: bool,
    },
    /// Activate an attached domain
    Activate {
        domain: DomainId,
    },
    /// Deactivate a domain; deactivating the master needs a new one
    Deactivate {
        domain: DomainId,
        #[arg(long = "new-msd")]
        new_master: Option<DomainId>,
        #[arg(long = "new-version", default_value = "0")]
        new_version: i64,
    },
    /// Move the master role to another active domain
    Migrate {
        #[arg(long)]
        to: DomainId,
        #[arg(long = "new-version")]
        new_version: i64,
    },
    /// Change the pool description
    SetDescription {
        description: String,
    },
    /// Rebuild the pool metadata on a new master from a domain map
    Reconstruct {
        #[arg(long)]
        name: String,
        #[arg(long = "msd")]
        master: DomainId,
        /// Entries as `<uuid>:<status>`
        #[arg(long, value_delimiter = ',', required = true)]
        domains: Vec<String>,
        #[arg(long = "version")]
        master_version: i64,
        #[command(flatten)]
        lease: LeaseArgs,
    },
}

#[derive(Subcommand, Debug)]
enum SpmCommands {
    /// Become SPM and serve the mailbox until SIGINT or SIGTERM
    Run {
        /// Pool UUID
        #[arg(long, env = "SPMD_POOL")]
        pool: PoolId,
        #[command(flatten)]
        join: JoinArgs,
        /// Previous SPM id as last seen
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        prev_id: i64,
        /// Previous lver as last seen
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        prev_lver: i64,
        /// Highest host id served, 0 for the configured default
        #[arg(long, default_value = "0")]
        max_host_id: u32,
    },
    /// Show the SPM fields of the pool
    Status {
        #[arg(long, env = "SPMD_POOL")]
        pool: PoolId,
        #[command(flatten)]
        join: JoinArgs,
    },
    /// Free the SPM role of a dead host
    Fence {
        #[arg(long, env = "SPMD_POOL")]
        pool: PoolId,
        #[command(flatten)]
        join: JoinArgs,
        #[arg(long, allow_hyphen_values = true)]
        last_owner: i64,
        #[arg(long, allow_hyphen_values = true)]
        last_lver: i64,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(repository) = &cli.repository {
        config.storage.repository.clone_from(repository);
    }
    if let Some(dir) = &cli.pools_data_dir {
        config.storage.pools_data_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if cli.log_json {
        config.logging.json = true;
    }
    Ok(config)
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Monitor threads inherit the mask, so block before any is spawned
    if matches!(cli.command, Commands::Spm { action: SpmCommands::Run { .. } }) {
        commands::block_shutdown_signals()?;
    }
    init_logging(&config);

    let code = commands::run(&config, cli.command);
    std::process::exit(code);
}
