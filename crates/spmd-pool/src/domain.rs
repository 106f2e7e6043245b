//! Storage domain
//!
//! A domain is one directory of shared storage. It owns a sealed metadata
//! store and a cluster lease. While it is the master of a pool, the same
//! store also carries the pool-wide fields (see [`POOL_SCHEMA`](crate::pool::POOL_SCHEMA)).
//!
//! Class and storage type never change after creation and are cached when
//! the domain is opened. Everything else is read through the store, so a
//! caller that suspects another host changed the metadata only needs
//! [`Domain::invalidate_metadata`].

use serde::Serialize;
use spmd_common::{
    DomainClass, DomainId, DomainRole, DomainStatus, Error, HostId, LeaseParams, PoolId, Result,
    SUPPORTED_DOMAIN_VERSIONS, StorageType, validate_description,
};
use spmd_storage::layout::{BLOCK_METADATA_SIZE, copy_tree};
use spmd_storage::{
    ByteRange, ClusterLease, Codec, DomainLayout, FileLease, FileMetadata, MetadataStore,
    RangeMetadata, RawRange, Schema, SchemaEntry, SchemaView, Value,
};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

pub const KEY_VERSION: &str = "VERSION";
pub const KEY_SDUUID: &str = "SDUUID";
pub const KEY_TYPE: &str = "TYPE";
pub const KEY_ROLE: &str = "ROLE";
pub const KEY_DESCRIPTION: &str = "DESCRIPTION";
pub const KEY_CLASS: &str = "CLASS";
pub const KEY_POOLS: &str = "POOL_UUID";
pub const KEY_LOCK_POLICY: &str = "LOCKPOLICY";
pub const KEY_LOCK_RENEWAL_INTERVAL: &str = "LOCKRENEWALINTERVALSEC";
pub const KEY_LEASE_TIME: &str = "LEASETIMESEC";
pub const KEY_IO_OP_TIMEOUT: &str = "IOOPTIMEOUTSEC";
pub const KEY_LEASE_RETRIES: &str = "LEASERETRIES";

/// Prefix of physical volume records on block domains
pub const PV_PREFIX: &str = "PV";

/// Keys every domain carries
pub static DOMAIN_SCHEMA: Schema = Schema {
    name: "domain",
    entries: &[
        SchemaEntry::exact(KEY_VERSION, Codec::Int),
        SchemaEntry::exact(KEY_SDUUID, Codec::Text),
        SchemaEntry::exact(KEY_TYPE, Codec::StorageType),
        SchemaEntry::exact(KEY_ROLE, Codec::Role).or("Regular"),
        SchemaEntry::exact(KEY_DESCRIPTION, Codec::Text).or(""),
        SchemaEntry::exact(KEY_CLASS, Codec::Class),
        SchemaEntry::exact(KEY_POOLS, Codec::PoolList).or(""),
        SchemaEntry::exact(KEY_LOCK_POLICY, Codec::Text).or("ON"),
        SchemaEntry::exact(KEY_LOCK_RENEWAL_INTERVAL, Codec::Int).or("5"),
        SchemaEntry::exact(KEY_LEASE_TIME, Codec::Int).or("30"),
        SchemaEntry::exact(KEY_IO_OP_TIMEOUT, Codec::Int).or("1"),
        SchemaEntry::exact(KEY_LEASE_RETRIES, Codec::Int).or("3"),
        SchemaEntry::prefix(PV_PREFIX, Codec::Text),
    ],
};

/// Reject a status change absent from the adjacency table
pub fn validate_transition(domain: DomainId, from: DomainStatus, to: DomainStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::IllegalStateTransition {
            domain: domain.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Summary returned by [`Domain::get_info`]
#[derive(Debug, Clone, Serialize)]
pub struct DomainInfo {
    pub uuid: DomainId,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub class: DomainClass,
    pub name: String,
    pub role: DomainRole,
    pub pools: Vec<PoolId>,
    pub version: u32,
    pub lease: LeaseParams,
    pub master_mounted: bool,
}

/// One storage domain
pub struct Domain {
    id: DomainId,
    storage_type: StorageType,
    class: DomainClass,
    layout: DomainLayout,
    metadata: MetadataStore,
    lease: Box<dyn ClusterLease>,
    master_mounted: AtomicBool,
}

impl Domain {
    /// Format a new domain under `repository` and seed its metadata
    pub fn create(
        repository: impl AsRef<Path>,
        id: DomainId,
        storage_type: StorageType,
        class: DomainClass,
        description: &str,
        version: u32,
        direct_io: bool,
    ) -> Result<Self> {
        validate_description(description)?;
        if !SUPPORTED_DOMAIN_VERSIONS.contains(&version) {
            return Err(Error::UnsupportedDomainVersion(version));
        }
        if storage_type == StorageType::Unknown {
            return Err(Error::invalid_parameter("type", storage_type));
        }
        let layout = DomainLayout::new(repository, id);
        if layout.exists() {
            return Err(Error::invalid_parameter(
                "sdUUID",
                format!("{id} already exists"),
            ));
        }

        info!(
            "creating {} domain {} ({}, version {})",
            storage_type, id, class, version
        );
        layout.format(storage_type)?;
        let domain = Self::with_layout(id, storage_type, class, layout, direct_io)?;
        domain.lease.init_lock()?;

        let lease = LeaseParams::default();
        domain.view().update(&[
            (KEY_VERSION, Value::Int(i64::from(version))),
            (KEY_SDUUID, Value::Text(id.to_string())),
            (KEY_TYPE, Value::StorageType(storage_type)),
            (KEY_ROLE, Value::Role(DomainRole::Regular)),
            (KEY_DESCRIPTION, Value::Text(description.to_string())),
            (KEY_CLASS, Value::Class(class)),
            (KEY_POOLS, Value::List(Vec::new())),
            (KEY_LOCK_POLICY, Value::Text(lease.policy)),
            (KEY_LEASE_RETRIES, Value::Int(i64::from(lease.retries))),
            (KEY_LEASE_TIME, Value::Int(i64::from(lease.lease_time_sec))),
            (
                KEY_LOCK_RENEWAL_INTERVAL,
                Value::Int(i64::from(lease.renewal_interval_sec)),
            ),
            (KEY_IO_OP_TIMEOUT, Value::Int(i64::from(lease.io_op_timeout_sec))),
        ])?;
        Ok(domain)
    }

    /// Open an existing domain of `repository`
    pub fn open(repository: impl AsRef<Path>, id: DomainId, direct_io: bool) -> Result<Self> {
        let layout = DomainLayout::new(repository, id);
        if !layout.exists() {
            return Err(Error::DomainNotFound(id.to_string()));
        }
        let storage_type = probe_storage_type(&layout.metadata())?;

        // Class is only known once the store can be read
        let domain = Self::with_layout(id, storage_type, DomainClass::Data, layout, direct_io)?;
        let recorded = domain.view().text(KEY_SDUUID)?;
        if recorded != id.to_string() {
            return Err(Error::MetadataDecode {
                key: KEY_SDUUID.to_string(),
                value: recorded,
            });
        }
        let class = domain.view().class(KEY_CLASS)?;
        Ok(Self { class, ..domain })
    }

    fn with_layout(
        id: DomainId,
        storage_type: StorageType,
        class: DomainClass,
        layout: DomainLayout,
        direct_io: bool,
    ) -> Result<Self> {
        let metadata = if storage_type.is_block() {
            let range: Arc<dyn ByteRange> = Arc::new(RawRange::open(layout.metadata(), direct_io)?);
            MetadataStore::new(RangeMetadata::new(range, 0, BLOCK_METADATA_SIZE))
        } else {
            MetadataStore::new(FileMetadata::new(layout.metadata()))
        };
        let lease = Box::new(FileLease::new(id, layout.leases()));
        Ok(Self {
            id,
            storage_type,
            class,
            layout,
            metadata,
            lease,
            master_mounted: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn id(&self) -> DomainId {
        self.id
    }

    #[must_use]
    pub const fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    #[must_use]
    pub const fn class(&self) -> DomainClass {
        self.class
    }

    #[must_use]
    pub const fn layout(&self) -> &DomainLayout {
        &self.layout
    }

    /// Raw metadata store, shared with the pool schema while master
    #[must_use]
    pub const fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    #[must_use]
    pub fn view(&self) -> SchemaView<'_> {
        DOMAIN_SCHEMA.view(&self.metadata)
    }

    pub fn invalidate_metadata(&self) {
        self.metadata.invalidate();
    }

    #[must_use]
    pub fn is_iso(&self) -> bool {
        self.class == DomainClass::Iso
    }

    #[must_use]
    pub fn is_backup(&self) -> bool {
        self.class == DomainClass::Backup
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.class == DomainClass::Data
    }

    pub fn version(&self) -> Result<u32> {
        read_u32(&self.view(), KEY_VERSION)
    }

    pub fn role(&self) -> Result<DomainRole> {
        self.view().role(KEY_ROLE)
    }

    pub fn is_master(&self) -> Result<bool> {
        Ok(self.role()? == DomainRole::Master)
    }

    pub fn description(&self) -> Result<String> {
        self.view().text(KEY_DESCRIPTION)
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        validate_description(description)?;
        self.view()
            .set(KEY_DESCRIPTION, &Value::Text(description.to_string()))
    }

    /// Pools this domain belongs to. Unparseable entries are skipped.
    pub fn pools(&self) -> Result<Vec<PoolId>> {
        let pools = self
            .view()
            .list(KEY_POOLS)?
            .into_iter()
            .filter_map(|raw| match raw.parse() {
                Ok(pool) => Some(pool),
                Err(_) => {
                    warn!("domain {} lists invalid pool {:?}", self.id, raw);
                    None
                }
            })
            .collect();
        Ok(pools)
    }

    fn set_pools(&self, pools: &[PoolId]) -> Result<()> {
        let pools = pools.iter().map(ToString::to_string).collect();
        self.view().set(KEY_POOLS, &Value::List(pools))
    }

    /// Add `pool` to the membership list.
    ///
    /// Non-ISO domains belong to at most one pool.
    pub fn attach(&self, pool: PoolId) -> Result<()> {
        self.metadata.transaction(|_| {
            let mut pools = self.pools()?;
            if pools.contains(&pool) {
                warn!("domain {} is already attached to pool {}", self.id, pool);
                return Ok(());
            }
            if let Some(other) = pools.first()
                && !self.is_iso()
            {
                return Err(Error::DomainAlreadyAttached {
                    domain: self.id.to_string(),
                    pool: other.to_string(),
                });
            }
            pools.push(pool);
            self.set_pools(&pools)?;
            info!("domain {} attached to pool {}", self.id, pool);
            Ok(())
        })
    }

    /// Remove `pool` from the membership list. The role is left alone.
    pub fn detach(&self, pool: PoolId) -> Result<()> {
        self.metadata.transaction(|_| {
            let mut pools = self.pools()?;
            let before = pools.len();
            pools.retain(|p| *p != pool);
            if pools.len() == before {
                warn!("domain {} is not attached to pool {}", self.id, pool);
                return Ok(());
            }
            self.set_pools(&pools)?;
            info!("domain {} detached from pool {}", self.id, pool);
            Ok(())
        })
    }

    pub fn change_role(&self, role: DomainRole) -> Result<()> {
        debug!("domain {} role -> {}", self.id, role);
        self.view().set(KEY_ROLE, &Value::Role(role))
    }

    /// Raise the format version to `target`
    pub fn upgrade(&self, target: u32) -> Result<()> {
        if !SUPPORTED_DOMAIN_VERSIONS.contains(&target) {
            return Err(Error::UnsupportedDomainVersion(target));
        }
        let current = self.version()?;
        match current.cmp(&target) {
            std::cmp::Ordering::Greater => Err(Error::CurrentVersionTooAdvanced { current, target }),
            std::cmp::Ordering::Equal => {
                debug!("domain {} already at version {}", self.id, target);
                Ok(())
            }
            std::cmp::Ordering::Less => {
                self.view()
                    .set(KEY_VERSION, &Value::Int(i64::from(target)))?;
                info!("domain {} upgraded from version {} to {}", self.id, current, target);
                Ok(())
            }
        }
    }

    pub fn acquire_cluster_lock(&self, host_id: HostId) -> Result<()> {
        self.lease.acquire(host_id)
    }

    pub fn release_cluster_lock(&self) -> Result<()> {
        self.lease.release()
    }

    #[must_use]
    pub fn has_cluster_lock(&self) -> bool {
        self.lease.is_locked()
    }

    #[must_use]
    pub fn lock_holder(&self) -> Option<HostId> {
        self.lease.holder()
    }

    /// Reset the on-disk lease area unless a live holder owns it.
    /// Failures are logged only.
    pub fn init_spm_lease(&self) {
        if let Err(e) = self.lease.init_lock() {
            error!("cannot initialize SPM lease of domain {}: {}", self.id, e);
        }
    }

    pub fn lease_params(&self) -> Result<LeaseParams> {
        let view = self.view();
        Ok(LeaseParams {
            policy: view.text(KEY_LOCK_POLICY)?,
            retries: read_u32(&view, KEY_LEASE_RETRIES)?,
            lease_time_sec: read_u32(&view, KEY_LEASE_TIME)?,
            renewal_interval_sec: read_u32(&view, KEY_LOCK_RENEWAL_INTERVAL)?,
            io_op_timeout_sec: read_u32(&view, KEY_IO_OP_TIMEOUT)?,
        })
    }

    pub fn change_lease_params(&self, params: &LeaseParams) -> Result<()> {
        self.view().update(&[
            (KEY_LOCK_POLICY, Value::Text(params.policy.clone())),
            (KEY_LEASE_RETRIES, Value::Int(i64::from(params.retries))),
            (KEY_LEASE_TIME, Value::Int(i64::from(params.lease_time_sec))),
            (
                KEY_LOCK_RENEWAL_INTERVAL,
                Value::Int(i64::from(params.renewal_interval_sec)),
            ),
            (KEY_IO_OP_TIMEOUT, Value::Int(i64::from(params.io_op_timeout_sec))),
        ])
    }

    pub fn get_info(&self) -> Result<DomainInfo> {
        Ok(DomainInfo {
            uuid: self.id,
            storage_type: self.storage_type,
            class: self.class,
            name: self.description()?,
            role: self.role()?,
            pools: self.pools()?,
            version: self.version()?,
            lease: self.lease_params()?,
            master_mounted: self.is_master_mounted(),
        })
    }

    /// Physical volume records keyed by name without the prefix
    pub fn physical_volumes(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .metadata
            .snapshot()?
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(PV_PREFIX)
                    .map(|name| (name.to_string(), value))
            })
            .collect())
    }

    pub fn set_physical_volume(&self, name: &str, record: &str) -> Result<()> {
        if !self.storage_type.is_block() {
            return Err(Error::invalid_parameter("type", self.storage_type));
        }
        self.view()
            .set(&format!("{PV_PREFIX}{name}"), &Value::Text(record.to_string()))
    }

    #[must_use]
    pub fn master_dir(&self) -> PathBuf {
        self.layout.master()
    }

    /// Make the master area available on this host
    pub fn mount_master(&self) -> Result<()> {
        fs::create_dir_all(self.layout.master())?;
        if !self.master_mounted.swap(true, Ordering::SeqCst) {
            debug!("mounted master area of domain {}", self.id);
        }
        Ok(())
    }

    pub fn unmount_master(&self) {
        if self.master_mounted.swap(false, Ordering::SeqCst) {
            info!("unmounted master area of domain {}", self.id);
        }
    }

    #[must_use]
    pub fn is_master_mounted(&self) -> bool {
        self.master_mounted.load(Ordering::SeqCst)
    }

    pub fn create_master_tree(&self) -> Result<()> {
        self.layout.create_master_tree()
    }

    pub fn clean_master_tree(&self) -> Result<()> {
        self.layout.clean_master_tree()
    }

    pub fn remove_master_tree(&self) -> Result<()> {
        self.layout.remove_master_tree()
    }

    /// Check that the master tree is complete
    pub fn validate_master(&self) -> Result<()> {
        for dir in [self.layout.master(), self.layout.vms(), self.layout.tasks()] {
            if !dir.is_dir() {
                return Err(Error::InvalidMasterTree {
                    domain: self.id.to_string(),
                    reason: format!("{} is missing", dir.display()),
                });
            }
        }
        Ok(())
    }

    /// Copy the content of `source`'s master tree into this domain's
    pub fn copy_master_from(&self, source: &Self) -> Result<()> {
        let copy = |src: PathBuf, dst: PathBuf| {
            copy_tree(&src, &dst).map_err(|e| Error::MasterCopy {
                domain: self.id.to_string(),
                reason: format!("{}: {}", src.display(), e),
            })
        };
        copy(source.layout.vms(), self.layout.vms())?;
        copy(source.layout.tasks(), self.layout.tasks())?;
        info!("copied master tree of domain {} to {}", source.id, self.id);
        Ok(())
    }

    /// Domain-specific work when it becomes active in a pool
    pub fn activate(&self) -> Result<()> {
        if self.is_backup() {
            self.mount_master()?;
            self.create_master_tree()?;
        }
        Ok(())
    }

    pub fn deactivate(&self) {
        if self.is_backup() {
            self.unmount_master();
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("type", &self.storage_type)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

fn read_u32(view: &SchemaView<'_>, key: &str) -> Result<u32> {
    let value = view.int(key)?;
    u32::try_from(value).map_err(|_| Error::MetadataDecode {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Storage type recorded in a metadata area, read without checking the seal
fn probe_storage_type(path: &Path) -> Result<StorageType> {
    let raw = fs::read(path)?;
    let text = String::from_utf8_lossy(&raw);
    text.split('\n')
        .find_map(|line| line.trim_end_matches('\0').strip_prefix("TYPE="))
        .ok_or_else(|| Error::MetadataMissing(KEY_TYPE.to_string()))?
        .parse()
}
