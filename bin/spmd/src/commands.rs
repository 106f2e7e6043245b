//! Command handlers

use crate::{Commands, DomainCommands, JoinArgs, LeaseArgs, PoolCommands, SpmCommands};
use anyhow::Context;
use nix::sys::signal::{SigSet, Signal};
use serde::Serialize;
use serde_json::json;
use spmd_common::{
    Config, DomainId, DomainStatus, Error, LeaseParams, PoolId, Result, Status,
};
use spmd_pool::{Domain, DomainRegistry, StoragePool};
use spmd_storage::{FileVolumeBackend, VolumeBackend};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Serialize)]
struct Response<T: Serialize> {
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
}

/// Print `result` as a JSON response and return the exit code
fn respond<T: Serialize>(result: Result<T>) -> i32 {
    let status = Status::from_result(&result);
    let code = if status.is_ok() { 0 } else { 1 };
    let response = Response {
        status,
        result: result.ok(),
    };
    match serde_json::to_string_pretty(&response) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("failed to encode response: {e}");
            return 2;
        }
    }
    code
}

fn shutdown_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Block SIGINT and SIGTERM so `spm run` can wait for them synchronously
pub fn block_shutdown_signals() -> anyhow::Result<()> {
    shutdown_signals()
        .thread_block()
        .context("failed to block shutdown signals")
}

/// Host-local view of the repository
struct Node {
    config: Config,
    registry: Arc<DomainRegistry>,
    backend: Arc<dyn VolumeBackend>,
}

impl Node {
    fn new(config: &Config) -> Self {
        let storage = &config.storage;
        Self {
            config: config.clone(),
            registry: Arc::new(DomainRegistry::with_directory(
                &storage.repository,
                storage.direct_io,
            )),
            backend: Arc::new(FileVolumeBackend::new(&storage.repository)),
        }
    }

    fn pool(&self, id: PoolId) -> StoragePool {
        StoragePool::new(
            id,
            Arc::clone(&self.registry),
            Arc::clone(&self.backend),
            &self.config,
        )
    }

    /// Pool connected from `join`, or from the reconnect record
    fn join(&self, id: PoolId, join: &JoinArgs) -> Result<StoragePool> {
        let pool = self.pool(id);
        match (join.host_id, join.master, join.master_version) {
            (Some(host_id), Some(master), Some(version)) => {
                pool.connect(host_id, &join.scsi_key, master, version)?;
            }
            (None, None, None) => {
                if !pool.reconnect()? {
                    return Err(Error::PoolNotConnected(id.to_string()));
                }
            }
            _ => {
                return Err(Error::invalid_parameter(
                    "connect",
                    "--host-id, --master and --master-version go together",
                ));
            }
        }
        Ok(pool)
    }
}

impl From<LeaseArgs> for LeaseParams {
    fn from(args: LeaseArgs) -> Self {
        Self {
            policy: args.lock_policy,
            retries: args.lease_retries,
            lease_time_sec: args.lease_time_sec,
            renewal_interval_sec: args.lock_renewal_interval_sec,
            io_op_timeout_sec: args.io_op_timeout_sec,
        }
    }
}

/// Parse `<uuid>:<status>` entries
fn parse_domain_map(entries: &[String]) -> Result<BTreeMap<DomainId, DomainStatus>> {
    entries
        .iter()
        .map(|entry| {
            let (id, status) = entry
                .split_once(':')
                .ok_or_else(|| Error::invalid_parameter("domains", entry))?;
            Ok((id.parse()?, status.parse()?))
        })
        .collect()
}

pub fn run(config: &Config, command: Commands) -> i32 {
    let node = Node::new(config);
    match command {
        Commands::Domain { action } => domain(&node, action),
        Commands::Pool { pool, join, action } => self::pool(&node, pool, &join, action),
        Commands::Spm { action } => spm(&node, action),
        Commands::Extend {
            pool,
            join,
            domain,
            volume,
            size_mb,
            timeout_secs,
        } => respond(node.join(pool, &join).and_then(|pool| {
            let ticket = pool.extend_volume(domain, volume, size_mb, None)?;
            let granted = ticket
                .wait_timeout(Duration::from_secs(timeout_secs))
                .ok_or_else(|| Error::internal("timed out waiting for the SPM reply"))??;
            Ok(json!({ "size_mb": granted }))
        })),
    }
}

fn domain(node: &Node, action: DomainCommands) -> i32 {
    let storage = &node.config.storage;
    match action {
        DomainCommands::Create {
            id,
            storage_type,
            class,
            description,
            version,
        } => respond(
            Domain::create(
                &storage.repository,
                id.unwrap_or_else(DomainId::new),
                storage_type,
                class,
                &description,
                version,
                storage.direct_io,
            )
            .and_then(|domain| domain.get_info()),
        ),
        DomainCommands::Info { id } => {
            respond(node.registry.produce(id).and_then(|domain| domain.get_info()))
        }
        DomainCommands::List => respond(node.registry.uuids()),
    }
}

fn pool(node: &Node, id: PoolId, join: &JoinArgs, action: PoolCommands) -> i32 {
    match action {
        PoolCommands::Create {
            name,
            master,
            domains,
            master_version,
            lease,
        } => {
            let pool = node.pool(id);
            respond(
                pool.create(&name, master, &domains, master_version, &lease.into())
                    .and_then(|()| pool.get_info()),
            )
        }
        PoolCommands::Connect => {
            if join.host_id.is_none() || join.master.is_none() || join.master_version.is_none() {
                return respond::<()>(Err(Error::invalid_parameter(
                    "connect",
                    "--host-id, --master and --master-version are required",
                )));
            }
            respond(node.join(id, join).and_then(|pool| pool.get_info()))
        }
        PoolCommands::Reconnect => {
            let pool = node.pool(id);
            respond(pool.reconnect().and_then(|connected| {
                if connected {
                    pool.get_info().map(Some)
                } else {
                    Ok(None)
                }
            }))
        }
        PoolCommands::Disconnect => respond(node.join(id, join).and_then(|pool| pool.disconnect())),
        PoolCommands::Info => respond(node.join(id, join).and_then(|pool| pool.get_info())),
        PoolCommands::Attach { domain } => {
            respond(node.join(id, join).and_then(|pool| pool.attach_sd(domain)))
        }
        PoolCommands::Detach {
            domain,
            new_master,
            new_version,
            force,
        } => respond(node.join(id, join).and_then(|pool| {
            if force {
                pool.forced_detach_sd(domain)
            } else {
                pool.detach_sd(domain, new_master.unwrap_or(DomainId::BLANK), new_version)
            }
        })),
        PoolCommands::Activate { domain } => {
            respond(node.join(id, join).and_then(|pool| pool.activate_sd(domain)))
        }
        PoolCommands::Deactivate {
            domain,
            new_master,
            new_version,
        } => respond(node.join(id, join).and_then(|pool| {
            pool.deactivate_sd(domain, new_master.unwrap_or(DomainId::BLANK), new_version)
        })),
        PoolCommands::Migrate { to, new_version } => {
            respond(node.join(id, join).and_then(|pool| {
                let from = pool.master_domain()?.id();
                pool.master_migrate(from, to, new_version)?;
                pool.get_info()
            }))
        }
        PoolCommands::SetDescription { description } => respond(
            node.join(id, join)
                .and_then(|pool| pool.set_description(&description)),
        ),
        PoolCommands::Reconstruct {
            name,
            master,
            domains,
            master_version,
            lease,
        } => respond(parse_domain_map(&domains).and_then(|domains| {
            let pool = node.pool(id);
            pool.reconstruct_master(&name, master, &domains, master_version, &lease.into())?;
            pool.get_info()
        })),
    }
}

fn spm(node: &Node, action: SpmCommands) -> i32 {
    match action {
        SpmCommands::Run {
            pool,
            join,
            prev_id,
            prev_lver,
            max_host_id,
        } => {
            let pool = match node.join(pool, &join) {
                Ok(pool) => pool,
                Err(e) => return respond::<()>(Err(e)),
            };
            if let Err(e) = pool.spm_start(prev_id, prev_lver, max_host_id) {
                return respond::<()>(Err(e));
            }
            let code = respond(pool.spm_status());

            match shutdown_signals().wait() {
                Ok(signal) => info!("received {}, stopping SPM of pool {}", signal, pool.id()),
                Err(e) => error!("waiting for shutdown signal failed: {}", e),
            }
            if let Err(e) = pool.spm_stop() {
                error!("SPM stop of pool {} failed: {}", pool.id(), e);
                return 1;
            }
            code
        }
        SpmCommands::Status { pool, join } => {
            respond(node.join(pool, &join).and_then(|pool| pool.spm_status()))
        }
        SpmCommands::Fence {
            pool,
            join,
            last_owner,
            last_lver,
        } => respond(
            node.join(pool, &join)
                .and_then(|pool| pool.fence(last_owner, last_lver)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_map() {
        let a = DomainId::new();
        let b = DomainId::new();
        let map = parse_domain_map(&[format!("{a}:Active"), format!("{b}:attached")]).unwrap();
        assert_eq!(map[&a], DomainStatus::Active);
        assert_eq!(map[&b], DomainStatus::Attached);

        assert!(parse_domain_map(&["nonsense".to_string()]).is_err());
        assert!(parse_domain_map(&[format!("{a}:Gone")]).is_err());
    }

    #[test]
    fn test_join_needs_all_connect_parameters() {
        let repo = tempfile::tempdir().unwrap();
        let pools = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.repository = repo.path().to_path_buf();
        config.storage.pools_data_dir = pools.path().to_path_buf();
        config.storage.direct_io = false;
        let node = Node::new(&config);

        let partial = JoinArgs {
            host_id: Some(1),
            ..JoinArgs::default()
        };
        assert!(matches!(
            node.join(PoolId::new(), &partial),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            node.join(PoolId::new(), &JoinArgs::default()),
            Err(Error::PoolNotConnected(_))
        ));
    }

    #[test]
    fn test_pool_lifecycle_through_node() {
        let repo = tempfile::tempdir().unwrap();
        let pools = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.repository = repo.path().to_path_buf();
        config.storage.pools_data_dir = pools.path().to_path_buf();
        config.storage.direct_io = false;
        let node = Node::new(&config);

        let master = DomainId::new();
        Domain::create(
            repo.path(),
            master,
            spmd_common::StorageType::LocalFs,
            spmd_common::DomainClass::Data,
            "master",
            2,
            false,
        )
        .unwrap();

        let id = PoolId::new();
        node.pool(id)
            .create("pool", master, &[master], 1, &LeaseParams::default())
            .unwrap();
        let join = JoinArgs {
            host_id: Some(2),
            scsi_key: "key".to_string(),
            master: Some(master),
            master_version: Some(1),
        };
        node.join(id, &join).unwrap();

        // A later invocation picks the record up
        let pool = node.join(id, &JoinArgs::default()).unwrap();
        assert_eq!(pool.host_id().unwrap(), 2);
        pool.disconnect().unwrap();
        assert!(matches!(
            node.join(id, &JoinArgs::default()),
            Err(Error::PoolNotConnected(_))
        ));
    }
}
