//! Storage pool
//!
//! A pool is a named set of domains with one master. The master's metadata
//! store carries the pool-wide fields under [`POOL_SCHEMA`]; every other
//! member only records the pool in its membership list.
//!
//! # Connection state
//!
//! ```text
//! Uninit ──create──► Initing ──► Init
//!    │                  │ failure
//!    │                  ▼
//!    │               Uninit
//!    │
//!    └──connect──► Connecting ──► Connected ──disconnect──► Disconnecting ──► Disconnected
//!                       │ failure                                │ failure
//!                       ▼                                        ▼
//!                  Disconnected                                Error
//! ```
//!
//! A create or connect issued while the same operation is in its
//! transient state fails with `OperationInProgress` instead of queuing.

use crate::domain::{Domain, validate_transition};
use crate::reconnect::ReconnectInfo;
use crate::recovery::RecoveryStack;
use crate::registry::DomainRegistry;
use crate::spm::SpmRole;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use spmd_common::config::{MailboxConfig, StorageConfig};
use spmd_common::{
    Config, DomainId, DomainRole, DomainStatus, Error, HostId, LeaseParams, PoolId, Result,
    StorageType, VolumeId, validate_description,
};
use spmd_mailbox::{ExtendCallback, ExtendRequest, ExtendTicket, HsmMailbox};
use spmd_storage::{ByteRange, Codec, RawRange, Schema, SchemaEntry, SchemaView, Value, VolumeBackend};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const KEY_DOMAINS: &str = "POOL_DOMAINS";
pub const KEY_POOL_DESCRIPTION: &str = "POOL_DESCRIPTION";
pub const KEY_LVER: &str = "POOL_SPM_LVER";
pub const KEY_SPM_ID: &str = "POOL_SPM_ID";
pub const KEY_MASTER_VERSION: &str = "MASTER_VERSION";

/// Pool-wide keys stored in the master domain
pub static POOL_SCHEMA: Schema = Schema {
    name: "pool",
    entries: &[
        SchemaEntry::exact(KEY_DOMAINS, Codec::DomainMap).or(""),
        SchemaEntry::exact(KEY_POOL_DESCRIPTION, Codec::Text).or(""),
        SchemaEntry::exact(KEY_LVER, Codec::Int).or("-1"),
        SchemaEntry::exact(KEY_SPM_ID, Codec::Int).or("-1"),
        SchemaEntry::exact(KEY_MASTER_VERSION, Codec::Int).or("0"),
    ],
};

/// Host id used while a pool is created, before any host has joined
pub const BOOTSTRAP_HOST_ID: HostId = 1000;

/// Image holding the ISO files of an ISO domain
pub const ISO_IMAGE_UUID: &str = "11111111-1111-1111-1111-111111111111";

/// Pool fields of `domain`'s metadata
pub(crate) fn pool_view(domain: &Domain) -> SchemaView<'_> {
    POOL_SCHEMA.view(domain.metadata())
}

/// Make `domain` a regular member
pub(crate) fn demote(domain: &Domain) -> Result<()> {
    domain.metadata().transaction(|_| {
        domain.change_role(DomainRole::Regular)?;
        pool_view(domain).set(KEY_MASTER_VERSION, &Value::Int(0))
    })
}

/// In-memory connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolState {
    /// Not created by this process
    Uninit,
    /// Create in progress
    Initing,
    /// Created, not connected
    Init,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Disconnect failed
    Error,
}

impl PoolState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninit => "uninitialized",
            Self::Initing => "initializing",
            Self::Init => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary returned by [`StoragePool::get_info`]
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub master_uuid: DomainId,
    pub master_ver: i64,
    pub lver: i64,
    pub spm_id: i64,
    pub domains: BTreeMap<DomainId, DomainStatus>,
    pub isoprefix: String,
    pub pool_status: PoolState,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub host_id: HostId,
    pub scsi_key: String,
}

/// A storage pool as seen by this host
pub struct StoragePool {
    pub(crate) id: PoolId,
    pub(crate) registry: Arc<DomainRegistry>,
    pub(crate) backend: Arc<dyn VolumeBackend>,
    pub(crate) storage: StorageConfig,
    pub(crate) mailbox: MailboxConfig,
    state: Mutex<PoolState>,
    pub(crate) session: RwLock<Option<Session>>,
    pub(crate) master: RwLock<Option<Arc<Domain>>>,
    hsm: Mutex<Option<Arc<HsmMailbox>>>,
    pub(crate) spm: Mutex<SpmRole>,
}

impl StoragePool {
    pub fn new(
        id: PoolId,
        registry: Arc<DomainRegistry>,
        backend: Arc<dyn VolumeBackend>,
        config: &Config,
    ) -> Self {
        Self {
            id,
            registry,
            backend,
            storage: config.storage.clone(),
            mailbox: config.mailbox.clone(),
            state: Mutex::new(PoolState::Uninit),
            session: RwLock::new(None),
            master: RwLock::new(None),
            hsm: Mutex::new(None),
            spm: Mutex::new(SpmRole::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    /// Host id of the current connection
    pub fn host_id(&self) -> Result<HostId> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.host_id)
            .ok_or_else(|| Error::PoolNotConnected(self.id.to_string()))
    }

    pub(crate) fn session(&self) -> Result<Session> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| Error::PoolNotConnected(self.id.to_string()))
    }

    pub fn master_domain(&self) -> Result<Arc<Domain>> {
        self.master
            .read()
            .clone()
            .ok_or_else(|| Error::PoolMasterNotFound(self.id.to_string()))
    }

    pub(crate) fn reconnect_path(&self) -> PathBuf {
        self.storage.pools_data_dir.join(self.id.to_string())
    }

    /// Create the pool with `master` as its master domain.
    ///
    /// Every domain of `domains` ends up attached, the master active. Any
    /// failure detaches what was attached and reports the first error.
    pub fn create(
        &self,
        name: &str,
        master: DomainId,
        domains: &[DomainId],
        master_version: i64,
        lease: &LeaseParams,
    ) -> Result<()> {
        info!(
            "creating pool {} {:?} with master {} and {} domains",
            self.id,
            name,
            master,
            domains.len()
        );
        if !domains.contains(&master) {
            return Err(Error::invalid_parameter("masterDomain", master));
        }
        validate_description(name)?;
        if domains.len() > self.storage.max_domains_in_pool {
            return Err(Error::TooManyDomains {
                pool: self.id.to_string(),
                max: self.storage.max_domains_in_pool,
            });
        }

        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Initing => {
                    return Err(Error::OperationInProgress(format!("create pool {}", self.id)));
                }
                PoolState::Uninit => *state = PoolState::Initing,
                _ => return Err(Error::PoolAlreadyExists(self.id.to_string())),
            }
        }

        let result = self.create_pool(name, master, domains, master_version, lease);
        *self.state.lock() = if result.is_ok() {
            info!("pool {} created", self.id);
            PoolState::Init
        } else {
            PoolState::Uninit
        };
        result
    }

    fn create_pool(
        &self,
        name: &str,
        master: DomainId,
        domains: &[DomainId],
        master_version: i64,
        lease: &LeaseParams,
    ) -> Result<()> {
        if let Err(e) = self.registry.refresh() {
            warn!("domain refresh before creating pool {} failed: {}", self.id, e);
        }

        let mut members = Vec::with_capacity(domains.len());
        for id in domains {
            let domain = self.registry.produce(*id)?;
            domain.invalidate_metadata();
            if !domain.is_iso()
                && let Some(pool) = domain.pools()?.first()
            {
                return Err(Error::DomainAlreadyAttached {
                    domain: id.to_string(),
                    pool: pool.to_string(),
                });
            }
            members.push(domain);
        }

        let msd = self.registry.produce(master)?;
        msd.change_lease_params(lease)?;
        msd.acquire_cluster_lock(BOOTSTRAP_HOST_ID)?;

        let mut recovery = RecoveryStack::new(format!("create pool {}", self.id));
        let result = self.build_pool(name, &msd, &members, master_version, lease, &mut recovery);
        match &result {
            Ok(()) => recovery.commit(),
            Err(e) => {
                error!("creating pool {} failed: {}", self.id, e);
                recovery.unwind();
                *self.master.write() = None;
            }
        }

        if let Err(e) = msd.release_cluster_lock() {
            error!("cannot release lock of domain {}: {}", msd.id(), e);
        }
        result
    }

    fn build_pool(
        &self,
        name: &str,
        msd: &Arc<Domain>,
        members: &[Arc<Domain>],
        master_version: i64,
        lease: &LeaseParams,
        recovery: &mut RecoveryStack,
    ) -> Result<()> {
        let pool = self.id;
        let undo = Arc::clone(msd);
        recovery.push(format!("undo master {}", msd.id()), move || {
            undo_master(&undo, pool)
        });
        let statuses = BTreeMap::from([(msd.id(), DomainStatus::Active)]);
        self.create_master(name, msd, &statuses, master_version, lease)?;
        self.resolve_master(msd.id(), Some(master_version))?;
        self.rebuild()?;

        for domain in members.iter().filter(|d| d.id() != msd.id()) {
            let undo = Arc::clone(domain);
            recovery.push(format!("detach {}", domain.id()), move || undo.detach(pool));
            self.attach_domain(domain, BOOTSTRAP_HOST_ID)?;
        }
        Ok(())
    }

    /// Turn `domain` into this pool's master with the given status map
    pub(crate) fn create_master(
        &self,
        name: &str,
        domain: &Domain,
        statuses: &BTreeMap<DomainId, DomainStatus>,
        master_version: i64,
        lease: &LeaseParams,
    ) -> Result<()> {
        domain.create_master_tree()?;
        domain.metadata().transaction(|_| {
            domain.change_lease_params(lease)?;
            for other in domain.pools()? {
                if other != self.id {
                    warn!("detaching domain {} from stale pool {}", domain.id(), other);
                    domain.detach(other)?;
                }
            }
            domain.attach(self.id)?;
            domain.change_role(DomainRole::Master)?;
            pool_view(domain).update(&[
                (KEY_SPM_ID, Value::Int(-1)),
                (KEY_LVER, Value::Int(-1)),
                (KEY_MASTER_VERSION, Value::Int(master_version)),
                (KEY_POOL_DESCRIPTION, Value::Text(name.to_string())),
                (KEY_DOMAINS, Value::DomainMap(statuses.clone())),
            ])
        })?;
        info!(
            "domain {} is master of pool {} at version {}",
            domain.id(),
            self.id,
            master_version
        );
        Ok(())
    }

    /// Check that `id` is this pool's master, then link it.
    ///
    /// With `version` set the stored master version must match it.
    pub(crate) fn resolve_master(&self, id: DomainId, version: Option<i64>) -> Result<Arc<Domain>> {
        let domain = match self.registry.produce(id) {
            Ok(domain) => domain,
            Err(Error::DomainNotFound(_)) => {
                return Err(Error::PoolMasterNotFound(self.id.to_string()));
            }
            Err(e) => return Err(e),
        };
        domain.invalidate_metadata();

        let wrong = |found: i64| Error::PoolWrongMaster {
            pool: self.id.to_string(),
            master: id.to_string(),
            version: found,
        };
        let found = pool_view(&domain).int(KEY_MASTER_VERSION)?;
        if !domain.is_master()? || !domain.pools()?.contains(&self.id) {
            return Err(wrong(found));
        }
        if version.is_some_and(|v| v != found) {
            return Err(wrong(found));
        }
        *self.master.write() = Some(Arc::clone(&domain));
        Ok(domain)
    }

    /// Demote every active member other than the master
    pub fn rebuild(&self) -> Result<()> {
        let master = self.master_domain()?;
        for id in self.get_domains(true)?.into_keys() {
            if id == master.id() {
                continue;
            }
            match self.registry.produce(id) {
                Ok(domain) => demote(&domain)?,
                Err(e) => warn!("cannot rebuild link to domain {} of pool {}: {}", id, self.id, e),
            }
        }
        debug!("pool {} rebuilt around master {}", self.id, master.id());
        Ok(())
    }

    /// Join the pool as `host_id`
    pub fn connect(
        &self,
        host_id: HostId,
        scsi_key: &str,
        master: DomainId,
        master_version: i64,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Connected => {
                    info!("pool {} is already connected", self.id);
                    return Ok(());
                }
                PoolState::Connecting => {
                    return Err(Error::OperationInProgress(format!("connect pool {}", self.id)));
                }
                // Any other state may connect, including an interrupted
                // create or disconnect and a failed disconnect
                PoolState::Uninit
                | PoolState::Initing
                | PoolState::Init
                | PoolState::Disconnecting
                | PoolState::Disconnected
                | PoolState::Error => *state = PoolState::Connecting,
            }
        }

        info!(
            "host {} connecting to pool {} (master {}, version {})",
            host_id, self.id, master, master_version
        );
        let result = self.connect_pool(host_id, scsi_key, master, master_version);
        let next = match &result {
            Ok(()) => {
                info!("host {} connected to pool {}", host_id, self.id);
                PoolState::Connected
            }
            Err(e) => {
                error!("host {} cannot connect to pool {}: {}", host_id, self.id, e);
                self.stop_hsm_mailbox();
                *self.session.write() = None;
                PoolState::Disconnected
            }
        };
        *self.state.lock() = next;
        result
    }

    fn connect_pool(
        &self,
        host_id: HostId,
        scsi_key: &str,
        master: DomainId,
        master_version: i64,
    ) -> Result<()> {
        self.registry.refresh()?;
        self.resolve_master(master, Some(master_version))?;

        fs::create_dir_all(&self.storage.pools_data_dir)?;
        ReconnectInfo {
            host_id,
            scsi_key: scsi_key.to_string(),
            master,
            master_version,
        }
        .save(&self.reconnect_path())?;

        *self.session.write() = Some(Session {
            host_id,
            scsi_key: scsi_key.to_string(),
        });
        self.rebuild()?;
        self.start_hsm_mailbox()
    }

    /// Start the HSM monitor when the master is block based
    pub(crate) fn start_hsm_mailbox(&self) -> Result<()> {
        let master = self.master_domain()?;
        if !self.mailbox.enabled || !master.storage_type().is_block() {
            debug!("no HSM mailbox for pool {}", self.id);
            self.stop_hsm_mailbox();
            return Ok(());
        }
        let host_id = self.host_id()?;
        let layout = master.layout();
        // Replies arrive in the SPM's outbox, requests go to its inbox
        let inbox: Arc<dyn ByteRange> = Arc::new(RawRange::open(layout.outbox(), self.storage.direct_io)?);
        let outbox: Arc<dyn ByteRange> = Arc::new(RawRange::open(layout.inbox(), self.storage.direct_io)?);
        let mailbox = HsmMailbox::start(host_id, self.id, inbox, outbox, &self.mailbox)?;

        let previous = self.hsm.lock().replace(Arc::new(mailbox));
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    pub(crate) fn stop_hsm_mailbox(&self) {
        let mailbox = self.hsm.lock().take();
        if let Some(mailbox) = mailbox {
            mailbox.stop();
        }
    }

    /// Leave the pool and forget the reconnect record
    pub fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Disconnected => {
                    info!("pool {} is already disconnected", self.id);
                    return Ok(());
                }
                PoolState::Disconnecting => {
                    return Err(Error::OperationInProgress(format!("disconnect pool {}", self.id)));
                }
                _ => *state = PoolState::Disconnecting,
            }
        }

        let result = self.disconnect_pool();
        *self.state.lock() = match &result {
            Ok(()) => PoolState::Disconnected,
            Err(e) => {
                error!("disconnecting pool {} failed: {}", self.id, e);
                PoolState::Error
            }
        };
        result
    }

    fn disconnect_pool(&self) -> Result<()> {
        self.spm_stop()?;
        ReconnectInfo::remove(&self.reconnect_path())?;
        self.stop_hsm_mailbox();
        *self.session.write() = None;
        *self.master.write() = None;
        info!("disconnected from pool {}", self.id);
        Ok(())
    }

    /// Connect with the parameters saved by the last successful connect.
    ///
    /// Returns `false` when there was nothing to reconnect to. A record
    /// that cannot be used is deleted.
    pub fn reconnect(&self) -> Result<bool> {
        let path = self.reconnect_path();
        let record = match ReconnectInfo::load(&path) {
            Ok(Some(record)) => record,
            Ok(None) => {
                ReconnectInfo::remove(&path)?;
                return Ok(false);
            }
            Err(e) => {
                if let Err(rm) = ReconnectInfo::remove(&path) {
                    error!("cannot remove reconnect record {:?}: {}", path, rm);
                }
                return Err(e);
            }
        };

        info!("reconnecting host {} to pool {}", record.host_id, self.id);
        if let Err(e) = self.connect(
            record.host_id,
            &record.scsi_key,
            record.master,
            record.master_version,
        ) {
            if let Err(rm) = ReconnectInfo::remove(&path) {
                error!("cannot remove reconnect record {:?}: {}", path, rm);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Domain status map, optionally restricted to active domains
    pub fn get_domains(&self, active_only: bool) -> Result<BTreeMap<DomainId, DomainStatus>> {
        let master = self.master_domain()?;
        let domains = pool_view(&master).domain_map(KEY_DOMAINS)?;
        if active_only {
            Ok(domains
                .into_iter()
                .filter(|(_, status)| *status == DomainStatus::Active)
                .collect())
        } else {
            Ok(domains)
        }
    }

    /// Set or, with `None`, remove the status of `id`
    pub(crate) fn set_domain_status(&self, id: DomainId, status: Option<DomainStatus>) -> Result<()> {
        let master = self.master_domain()?;
        pool_view(&master).transaction(|view| {
            let mut domains = view.domain_map(KEY_DOMAINS)?;
            match status {
                Some(status) => {
                    domains.insert(id, status);
                }
                None => {
                    domains.remove(&id);
                }
            }
            view.set(KEY_DOMAINS, &Value::DomainMap(domains))
        })?;
        match status {
            Some(status) => info!("domain {} is {} in pool {}", id, status, self.id),
            None => info!("domain {} removed from pool {}", id, self.id),
        }
        Ok(())
    }

    fn not_attached(&self, id: DomainId) -> Error {
        Error::DomainNotAttached {
            domain: id.to_string(),
            pool: self.id.to_string(),
        }
    }

    /// Status of a member, checked against both sides of the membership
    fn attached_status(&self, domain: &Domain) -> Result<DomainStatus> {
        let status = self
            .get_domains(false)?
            .get(&domain.id())
            .copied()
            .ok_or_else(|| self.not_attached(domain.id()))?;
        if !domain.pools()?.contains(&self.id) {
            return Err(self.not_attached(domain.id()));
        }
        Ok(status)
    }

    pub fn attach_sd(&self, id: DomainId) -> Result<()> {
        let host_id = self.host_id()?;
        let domain = self.registry.produce(id)?;
        self.attach_domain(&domain, host_id)
    }

    fn attach_domain(&self, domain: &Domain, host_id: HostId) -> Result<()> {
        let domains = self.get_domains(false)?;
        if domains.contains_key(&domain.id()) {
            info!("domain {} is already attached to pool {}", domain.id(), self.id);
            return Ok(());
        }
        if domains.len() >= self.storage.max_domains_in_pool {
            return Err(Error::TooManyDomains {
                pool: self.id.to_string(),
                max: self.storage.max_domains_in_pool,
            });
        }

        domain.invalidate_metadata();
        domain.acquire_cluster_lock(host_id)?;
        let mut result = domain.attach(self.id);
        if result.is_ok() {
            result = self.set_domain_status(domain.id(), Some(DomainStatus::Attached));
            if result.is_err()
                && let Err(e) = domain.detach(self.id)
            {
                error!("cannot undo attach of domain {}: {}", domain.id(), e);
            }
        }
        if let Err(e) = domain.release_cluster_lock() {
            error!("cannot release lock of domain {}: {}", domain.id(), e);
        }
        result
    }

    /// Detach `id`. Detaching the master relocates it to `new_master`
    /// first; a blank `new_master` retires the last master.
    pub fn detach_sd(&self, id: DomainId, new_master: DomainId, master_version: i64) -> Result<()> {
        let domain = self.registry.produce(id)?;
        domain.invalidate_metadata();
        let status = self.attached_status(&domain)?;
        validate_transition(id, status, DomainStatus::Unattached)?;

        let locked = domain.is_iso();
        if locked {
            domain.acquire_cluster_lock(self.host_id()?)?;
        }
        let result = self.detach_domain(&domain, new_master, master_version);
        if locked && let Err(e) = domain.release_cluster_lock() {
            error!("cannot release lock of domain {}: {}", id, e);
        }
        result
    }

    fn detach_domain(&self, domain: &Domain, new_master: DomainId, master_version: i64) -> Result<()> {
        let master = self.master_domain()?;
        let retiring = domain.id() == master.id() && new_master.is_blank();
        if domain.id() == master.id() {
            self.master_migrate(domain.id(), new_master, master_version)?;
        }

        self.set_domain_status(domain.id(), None)?;
        domain.detach(self.id)?;
        if retiring {
            *self.master.write() = None;
        } else {
            self.rebuild()?;
        }
        info!("domain {} detached from pool {}", domain.id(), self.id);
        Ok(())
    }

    /// Drop `id` from the status map without touching the domain
    pub fn forced_detach_sd(&self, id: DomainId) -> Result<()> {
        warn!("force detaching domain {} from pool {}", id, self.id);
        self.set_domain_status(id, None)?;
        if let Err(e) = self.rebuild() {
            error!("rebuild of pool {} after forced detach failed: {}", self.id, e);
        }
        Ok(())
    }

    pub fn activate_sd(&self, id: DomainId) -> Result<()> {
        let domain = self.registry.produce(id)?;
        domain.invalidate_metadata();
        let status = self.attached_status(&domain)?;
        validate_transition(id, status, DomainStatus::Active)?;
        if status == DomainStatus::Active {
            info!("domain {} is already active in pool {}", id, self.id);
            return Ok(());
        }

        if domain.is_data() {
            domain.upgrade(self.master_domain()?.version()?)?;
        }
        domain.activate()?;
        self.set_domain_status(id, Some(DomainStatus::Active))
    }

    /// Deactivate `id`. Deactivating the master relocates it to
    /// `new_master`, or retires it when `new_master` is blank.
    pub fn deactivate_sd(&self, id: DomainId, new_master: DomainId, master_version: i64) -> Result<()> {
        if id == new_master {
            return Err(Error::invalid_parameter("msdUUID", new_master));
        }
        let master = self.master_domain()?;
        let is_master = id == master.id();
        if !new_master.is_blank() {
            if !is_master {
                return Err(Error::invalid_parameter("msdUUID", new_master));
            }
            self.validate_master_version_higher(master_version)?;
        }

        let status = self
            .get_domains(false)?
            .get(&id)
            .copied()
            .ok_or_else(|| self.not_attached(id))?;
        validate_transition(id, status, DomainStatus::Attached)?;

        let domain = match self.registry.produce(id) {
            Ok(domain) => domain,
            Err(e) if !is_master => {
                warn!("domain {} is unreachable, marking it attached: {}", id, e);
                return self.set_domain_status(id, Some(DomainStatus::Attached));
            }
            Err(e) => return Err(e),
        };
        if is_master {
            self.master_migrate(id, new_master, master_version)?;
        }
        domain.deactivate();
        self.set_domain_status(id, Some(DomainStatus::Attached))
    }

    pub fn is_member(&self, id: DomainId, check_active: bool) -> Result<bool> {
        let domains = self.get_domains(check_active)?;
        Ok(domains.contains_key(&id))
    }

    pub fn is_active(&self, id: DomainId) -> Result<bool> {
        self.is_member(id, true)
    }

    /// First active ISO domain
    pub fn get_iso_domain(&self) -> Result<Option<Arc<Domain>>> {
        for id in self.get_domains(true)?.into_keys() {
            match self.registry.produce(id) {
                Ok(domain) if domain.is_iso() => return Ok(Some(domain)),
                Ok(_) => {}
                Err(e) => warn!("cannot reach domain {} of pool {}: {}", id, self.id, e),
            }
        }
        Ok(None)
    }

    pub fn master_version(&self) -> Result<i64> {
        pool_view(&*self.master_domain()?).int(KEY_MASTER_VERSION)
    }

    fn wrong_master(&self, version: i64) -> Result<Error> {
        Ok(Error::PoolWrongMaster {
            pool: self.id.to_string(),
            master: self.master_domain()?.id().to_string(),
            version,
        })
    }

    pub fn validate_master_version_equal(&self, version: i64) -> Result<()> {
        let current = self.master_version()?;
        if version != current {
            return Err(self.wrong_master(current)?);
        }
        Ok(())
    }

    /// `version` must be newer than the stored one
    pub fn validate_master_version_higher(&self, version: i64) -> Result<()> {
        let current = self.master_version()?;
        if version <= current {
            return Err(self.wrong_master(current)?);
        }
        Ok(())
    }

    pub fn description(&self) -> Result<String> {
        pool_view(&*self.master_domain()?).text(KEY_POOL_DESCRIPTION)
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        validate_description(description)?;
        pool_view(&*self.master_domain()?)
            .set(KEY_POOL_DESCRIPTION, &Value::Text(description.to_string()))
    }

    pub fn get_info(&self) -> Result<PoolInfo> {
        let master = self.master_domain()?;
        master.invalidate_metadata();
        let view = pool_view(&master);
        let isoprefix = self
            .get_iso_domain()?
            .map(|iso| iso.layout().images().join(ISO_IMAGE_UUID).display().to_string())
            .unwrap_or_default();
        Ok(PoolInfo {
            name: view.text(KEY_POOL_DESCRIPTION)?,
            storage_type: master.storage_type(),
            master_uuid: master.id(),
            master_ver: view.int(KEY_MASTER_VERSION)?,
            lver: view.int(KEY_LVER)?,
            spm_id: view.int(KEY_SPM_ID)?,
            domains: view.domain_map(KEY_DOMAINS)?,
            isoprefix,
            pool_status: self.state(),
            version: master.version()?,
        })
    }

    /// Rebuild the pool metadata on `master` from a known status map.
    ///
    /// Used when the previous master is lost; the domains keep their own
    /// membership records.
    pub fn reconstruct_master(
        &self,
        name: &str,
        master: DomainId,
        domains: &BTreeMap<DomainId, DomainStatus>,
        master_version: i64,
        lease: &LeaseParams,
    ) -> Result<()> {
        if !domains.contains_key(&master) {
            return Err(Error::invalid_parameter("masterDomain", master));
        }
        validate_description(name)?;
        if let Err(e) = self.registry.refresh() {
            warn!("domain refresh before reconstructing pool {} failed: {}", self.id, e);
        }

        let domain = self.registry.produce(master)?;
        domain.invalidate_metadata();
        if domain.is_iso() {
            return Err(Error::IsoCannotBeMaster(master.to_string()));
        }
        if domain.is_backup() {
            return Err(Error::BackupCannotBeMaster(master.to_string()));
        }

        warn!(
            "reconstructing master of pool {} on domain {} at version {}",
            self.id, master, master_version
        );
        domain.change_lease_params(lease)?;
        domain.acquire_cluster_lock(BOOTSTRAP_HOST_ID)?;
        let result = self
            .create_master(name, &domain, domains, master_version, lease)
            .and_then(|()| self.resolve_master(master, Some(master_version)))
            .map(|_| ());
        if let Err(e) = domain.release_cluster_lock() {
            error!("cannot release lock of domain {}: {}", master, e);
        }
        result
    }

    /// Ask the SPM to grow `volume` to `size_mb` MiB through the mailbox
    pub fn extend_volume(
        &self,
        domain: DomainId,
        volume: VolumeId,
        size_mb: u64,
        callback: Option<ExtendCallback>,
    ) -> Result<ExtendTicket> {
        let request = ExtendRequest::new(domain, volume, size_mb)?;
        let mailbox = self.hsm.lock().clone().ok_or(Error::MailboxNotRunning)?;
        mailbox.send_extend(request, callback)
    }
}

impl Drop for StoragePool {
    fn drop(&mut self) {
        self.stop_hsm_mailbox();
    }
}

/// Undo [`StoragePool::create_master`] on a failed create
fn undo_master(domain: &Domain, pool: PoolId) -> Result<()> {
    domain.metadata().transaction(|_| {
        domain.detach(pool)?;
        domain.change_role(DomainRole::Regular)?;
        let view = pool_view(domain);
        for key in [
            KEY_DOMAINS,
            KEY_POOL_DESCRIPTION,
            KEY_LVER,
            KEY_SPM_ID,
            KEY_MASTER_VERSION,
        ] {
            view.remove(key)?;
        }
        Ok(())
    })?;
    domain.unmount_master();
    domain.remove_master_tree()
}
