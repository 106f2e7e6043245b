//! Scratch repository and pools for unit tests

use crate::domain::Domain;
use crate::pool::StoragePool;
use crate::registry::DomainRegistry;
use parking_lot::Mutex;
use spmd_common::{
    Config, DomainClass, DomainId, DomainRole, LeaseParams, PoolId, Result, StorageType, VolumeId,
};
use spmd_storage::VolumeBackend;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendCall {
    pub domain: DomainId,
    pub pool: PoolId,
    pub volume: VolumeId,
    pub new_size: u64,
}

/// Backend that grants every extend and remembers it
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<ExtendCall>>,
}

impl RecordingBackend {
    pub fn calls(&self) -> Vec<ExtendCall> {
        self.calls.lock().clone()
    }
}

impl VolumeBackend for RecordingBackend {
    fn extend(
        &self,
        domain: DomainId,
        pool: PoolId,
        _image: Option<&str>,
        volume: VolumeId,
        new_size: u64,
    ) -> Result<()> {
        self.calls.lock().push(ExtendCall {
            domain,
            pool,
            volume,
            new_size,
        });
        Ok(())
    }

    fn volume_size(
        &self,
        domain: DomainId,
        _pool: PoolId,
        _image: Option<&str>,
        volume: VolumeId,
    ) -> Result<u64> {
        Ok(self
            .calls
            .lock()
            .iter()
            .filter(|c| c.domain == domain && c.volume == volume)
            .map(|c| c.new_size)
            .max()
            .unwrap_or(0))
    }
}

pub struct Fixture {
    pub repo: TempDir,
    pub pools_dir: TempDir,
    pub registry: Arc<DomainRegistry>,
    pub backend: Arc<RecordingBackend>,
    max_domains: usize,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_max_domains(10)
    }

    pub fn with_max_domains(max_domains: usize) -> Self {
        let repo = TempDir::new().unwrap();
        let pools_dir = TempDir::new().unwrap();
        let registry = Arc::new(DomainRegistry::with_directory(repo.path(), false));
        Self {
            repo,
            pools_dir,
            registry,
            backend: Arc::new(RecordingBackend::default()),
            max_domains,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.storage.repository = self.repo.path().to_path_buf();
        config.storage.pools_data_dir = self.pools_dir.path().to_path_buf();
        config.storage.direct_io = false;
        config.storage.max_domains_in_pool = self.max_domains;
        config.mailbox.monitor_interval_ms = 10;
        config.mailbox.max_hosts = 8;
        config
    }

    fn create(&self, storage_type: StorageType, class: DomainClass, version: u32) -> DomainId {
        let id = DomainId::new();
        Domain::create(self.repo.path(), id, storage_type, class, "test domain", version, false).unwrap();
        id
    }

    pub fn domain(&self, class: DomainClass) -> DomainId {
        self.create(StorageType::LocalFs, class, 2)
    }

    pub fn domain_with_version(&self, class: DomainClass, version: u32) -> DomainId {
        self.create(StorageType::LocalFs, class, version)
    }

    pub fn block_domain(&self) -> DomainId {
        self.create(StorageType::Iscsi, DomainClass::Data, 2)
    }

    pub fn pool_with_id(&self, id: PoolId) -> StoragePool {
        StoragePool::new(
            id,
            Arc::clone(&self.registry),
            Arc::clone(&self.backend) as Arc<dyn VolumeBackend>,
            &self.config(),
        )
    }

    pub fn pool(&self) -> StoragePool {
        self.pool_with_id(PoolId::new())
    }

    /// Pool created at master version 1 and connected as host 1
    pub fn connected_pool(&self, master: DomainId, others: &[DomainId]) -> StoragePool {
        let pool = self.pool();
        let mut domains = vec![master];
        domains.extend_from_slice(others);
        pool.create("pool", master, &domains, 1, &LeaseParams::default())
            .unwrap();
        pool.connect(1, "key", master, 1).unwrap();
        pool
    }

    /// Number of `ids` whose stored role is master
    pub fn master_count(&self, ids: &[DomainId]) -> usize {
        ids.iter()
            .filter(|id| {
                let domain = self.registry.produce(**id).unwrap();
                domain.invalidate_metadata();
                domain.role().unwrap() == DomainRole::Master
            })
            .count()
    }
}
