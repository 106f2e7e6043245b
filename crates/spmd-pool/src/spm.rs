//! SPM role
//!
//! The host holding the master domain's cluster lock is the pool's SPM.
//! Its generation (`lver`) and identity (`spm_id`) live in the master's
//! pool metadata so that a new candidate can prove it saw the previous
//! owner before taking over.

use crate::pool::{KEY_LVER, KEY_SPM_ID, StoragePool, pool_view};
use serde::Serialize;
use spmd_common::{DomainClass, Error, Result};
use spmd_mailbox::SpmMailbox;
use spmd_storage::{ByteRange, RawRange, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SpmStatus {
    #[default]
    Free,
    Contend,
    Acquired,
}

/// Result of [`StoragePool::spm_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpmInfo {
    pub status: SpmStatus,
    pub lver: i64,
    pub spm_id: i64,
}

#[derive(Default)]
pub(crate) struct SpmRole {
    pub status: SpmStatus,
    pub max_host_id: u32,
    pub mailbox: Option<Arc<SpmMailbox>>,
}

impl StoragePool {
    /// Become the pool's SPM.
    ///
    /// `prev_id` and `prev_lver` are the owner and generation the caller
    /// last observed; they must match the stored ones. A `max_host_id` of
    /// zero uses the configured host count.
    pub fn spm_start(&self, prev_id: i64, prev_lver: i64, max_host_id: u32) -> Result<()> {
        {
            let mut spm = self.spm.lock();
            match spm.status {
                SpmStatus::Acquired => {
                    info!("already SPM of pool {}", self.id);
                    return Ok(());
                }
                SpmStatus::Contend => {
                    return Err(Error::OperationInProgress(format!("spm start {}", self.id)));
                }
                SpmStatus::Free => {}
            }
            let host_id = self.host_id()?;
            let master = self.master_domain()?;
            master.invalidate_metadata();
            let view = pool_view(&master);
            let (id, lver) = (view.int(KEY_SPM_ID)?, view.int(KEY_LVER)?);
            if id != prev_id || lver != prev_lver {
                return Err(Error::SpmParamsMismatch {
                    expected_id: prev_id,
                    expected_lver: prev_lver,
                    id,
                    lver,
                });
            }
            info!(
                "host {} contending for SPM of pool {} (previous {} at {})",
                host_id, self.id, prev_id, prev_lver
            );
            spm.status = SpmStatus::Contend;
            spm.max_host_id = if max_host_id == 0 {
                self.mailbox.max_hosts
            } else {
                max_host_id
            };
        }

        if let Err(e) = self.acquire_spm() {
            error!("cannot become SPM of pool {}: {}", self.id, e);
            self.spm.lock().status = SpmStatus::Free;
            return Err(e);
        }
        if let Err(e) = self.become_spm() {
            error!("SPM start of pool {} failed: {}", self.id, e);
            self.release_spm();
            return Err(e);
        }
        Ok(())
    }

    fn acquire_spm(&self) -> Result<()> {
        let host_id = self.host_id()?;
        self.master_domain()?.acquire_cluster_lock(host_id)
    }

    fn become_spm(&self) -> Result<()> {
        let host_id = self.host_id()?;
        let master = self.master_domain()?;
        let view = pool_view(&master);
        let lver = view.transaction(|view| {
            let lver = view.int(KEY_LVER)? + 1;
            view.update(&[
                (KEY_LVER, Value::Int(lver)),
                (KEY_SPM_ID, Value::Int(i64::from(host_id))),
            ])?;
            Ok(lver)
        })?;

        master.mount_master()?;
        master.create_master_tree()?;
        for id in self.get_domains(true)?.into_keys() {
            match self.registry.produce(id) {
                Ok(domain) if domain.class() == DomainClass::Backup => domain.activate()?,
                Ok(_) => {}
                Err(e) => warn!("cannot reach domain {} of pool {}: {}", id, self.id, e),
            }
        }

        let max_host_id = self.spm.lock().max_host_id;
        let mailbox = self.open_spm_mailbox(max_host_id)?;
        let mut spm = self.spm.lock();
        spm.mailbox = mailbox.map(Arc::new);
        spm.status = SpmStatus::Acquired;
        info!("host {} is SPM of pool {} at lver {}", host_id, self.id, lver);
        Ok(())
    }

    /// Start the SPM monitor over the master's regions, block masters only
    fn open_spm_mailbox(&self, max_host_id: u32) -> Result<Option<SpmMailbox>> {
        let master = self.master_domain()?;
        if !self.mailbox.enabled || !master.storage_type().is_block() {
            return Ok(None);
        }
        let layout = master.layout();
        let inbox: Arc<dyn ByteRange> = Arc::new(RawRange::open(layout.inbox(), self.storage.direct_io)?);
        let outbox: Arc<dyn ByteRange> = Arc::new(RawRange::open(layout.outbox(), self.storage.direct_io)?);
        SpmMailbox::start(
            self.id,
            inbox,
            outbox,
            Arc::clone(&self.backend),
            &self.mailbox,
            max_host_id,
        )
        .map(Some)
    }

    /// Move a running SPM monitor onto the current master
    pub(crate) fn restart_spm_mailbox(&self) -> Result<()> {
        let (max_host_id, previous) = {
            let mut spm = self.spm.lock();
            if spm.status != SpmStatus::Acquired {
                return Ok(());
            }
            (spm.max_host_id, spm.mailbox.take())
        };
        if let Some(previous) = previous {
            previous.stop();
        }
        let mailbox = self.open_spm_mailbox(max_host_id)?;
        self.spm.lock().mailbox = mailbox.map(Arc::new);
        Ok(())
    }

    /// Drop the role; every step is attempted
    fn release_spm(&self) {
        let mailbox = self.spm.lock().mailbox.take();
        if let Some(mailbox) = mailbox {
            mailbox.stop();
        }
        if let Ok(master) = self.master_domain() {
            if let Err(e) = pool_view(&master).set(KEY_SPM_ID, &Value::Int(-1)) {
                error!("cannot clear SPM id of pool {}: {}", self.id, e);
            }
            master.unmount_master();
            if master.has_cluster_lock()
                && let Err(e) = master.release_cluster_lock()
            {
                error!("cannot release SPM lock of pool {}: {}", self.id, e);
            }
        }
        self.spm.lock().status = SpmStatus::Free;
        info!("SPM of pool {} released", self.id);
    }

    pub fn spm_stop(&self) -> Result<()> {
        {
            let spm = self.spm.lock();
            match spm.status {
                SpmStatus::Free => return Ok(()),
                SpmStatus::Contend => {
                    return Err(Error::OperationInProgress(format!("spm start {}", self.id)));
                }
                SpmStatus::Acquired => {}
            }
        }
        self.release_spm();
        Ok(())
    }

    pub fn spm_status(&self) -> Result<SpmInfo> {
        let master = self.master_domain()?;
        master.invalidate_metadata();
        let view = pool_view(&master);
        Ok(SpmInfo {
            status: self.spm.lock().status,
            lver: view.int(KEY_LVER)?,
            spm_id: view.int(KEY_SPM_ID)?,
        })
    }

    /// Declare the previous SPM dead and free the role.
    ///
    /// Only applies when `last_owner` and `last_lver` still describe the
    /// stored owner, so a stale fence cannot evict a newer SPM.
    pub fn fence(&self, last_owner: i64, last_lver: i64) -> Result<SpmInfo> {
        let master = self.master_domain()?;
        master.invalidate_metadata();
        pool_view(&master).transaction(|view| {
            let (id, lver) = (view.int(KEY_SPM_ID)?, view.int(KEY_LVER)?);
            if id != last_owner || lver != last_lver {
                return Err(Error::SpmParamsMismatch {
                    expected_id: last_owner,
                    expected_lver: last_lver,
                    id,
                    lver,
                });
            }
            view.update(&[(KEY_SPM_ID, Value::Int(-1)), (KEY_LVER, Value::Int(-1))])
        })?;
        warn!("fenced SPM {} of pool {} at lver {}", last_owner, self.id, last_lver);

        let local = self.spm.lock().status == SpmStatus::Acquired;
        if local && last_owner == self.host_id().map_or(-1, i64::from) {
            self.release_spm();
        }
        self.spm_status()
    }

    /// Resize the region scanned by the SPM monitor
    pub fn set_spm_max_host_id(&self, max_host_id: u32) -> Result<()> {
        let mut spm = self.spm.lock();
        if spm.status != SpmStatus::Acquired {
            return Err(Error::SpmNotStarted(self.id.to_string()));
        }
        spm.max_host_id = max_host_id;
        if let Some(mailbox) = &spm.mailbox {
            mailbox.set_max_host_id(max_host_id);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_spm(&self) -> bool {
        self.spm.lock().status == SpmStatus::Acquired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use spmd_common::{DomainId, VolumeId};
    use std::time::Duration;

    #[test]
    fn test_start_and_stop() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[]);

        pool.spm_start(-1, -1, 0).unwrap();
        let info = pool.spm_status().unwrap();
        assert_eq!(info.status, SpmStatus::Acquired);
        assert_eq!(info.lver, 0);
        assert_eq!(info.spm_id, 1);
        let master = pool.master_domain().unwrap();
        assert!(master.has_cluster_lock());
        assert!(master.is_master_mounted());

        // Starting again is a no-op
        pool.spm_start(-1, -1, 0).unwrap();
        assert_eq!(pool.spm_status().unwrap().lver, 0);

        pool.spm_stop().unwrap();
        let info = pool.spm_status().unwrap();
        assert_eq!(info.status, SpmStatus::Free);
        assert_eq!(info.spm_id, -1);
        assert_eq!(info.lver, 0);
        assert!(!master.has_cluster_lock());
        pool.spm_stop().unwrap();

        // The next start must present the new generation
        assert!(matches!(
            pool.spm_start(-1, -1, 0),
            Err(Error::SpmParamsMismatch { lver: 0, .. })
        ));
        pool.spm_start(-1, 0, 0).unwrap();
        assert_eq!(pool.spm_status().unwrap().lver, 1);
    }

    #[test]
    fn test_contending_start_fails_fast() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[]);

        pool.spm.lock().status = SpmStatus::Contend;
        assert!(matches!(
            pool.spm_start(-1, -1, 0),
            Err(Error::OperationInProgress(_))
        ));
        assert!(matches!(pool.spm_stop(), Err(Error::OperationInProgress(_))));
        let master = pool.master_domain().unwrap();
        assert!(!master.has_cluster_lock());
        assert_eq!(pool.spm_status().unwrap().lver, -1);

        pool.spm.lock().status = SpmStatus::Free;
        pool.spm_start(-1, -1, 0).unwrap();
        assert_eq!(pool.spm_status().unwrap().status, SpmStatus::Acquired);
    }

    #[test]
    fn test_start_requires_connection() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let pool = fx.pool();
        pool.create("pool", a, &[a], 1, &spmd_common::LeaseParams::default()).unwrap();
        assert!(matches!(pool.spm_start(-1, -1, 0), Err(Error::PoolNotConnected(_))));
        assert_eq!(pool.spm.lock().status, SpmStatus::Free);
    }

    #[test]
    fn test_start_fails_while_lease_is_held() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[]);

        let other = crate::Domain::open(fx.repo.path(), a, false).unwrap();
        other.acquire_cluster_lock(2).unwrap();
        assert!(matches!(
            pool.spm_start(-1, -1, 0),
            Err(Error::AcquireLock { .. })
        ));
        let info = pool.spm_status().unwrap();
        assert_eq!(info.status, SpmStatus::Free);
        assert_eq!(info.lver, -1);
    }

    #[test]
    fn test_fence() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[]);
        pool.spm_start(-1, -1, 0).unwrap();

        assert!(matches!(pool.fence(2, 0), Err(Error::SpmParamsMismatch { .. })));
        assert!(pool.is_spm());

        let info = pool.fence(1, 0).unwrap();
        assert_eq!(info.status, SpmStatus::Free);
        assert_eq!(info.spm_id, -1);
        assert_eq!(info.lver, -1);
        assert!(!pool.master_domain().unwrap().has_cluster_lock());
        pool.spm_start(-1, -1, 0).unwrap();
    }

    #[test]
    fn test_max_host_id() {
        let fx = Fixture::new();
        let a = fx.block_domain();
        let pool = fx.connected_pool(a, &[]);
        assert!(matches!(pool.set_spm_max_host_id(4), Err(Error::SpmNotStarted(_))));

        pool.spm_start(-1, -1, 4).unwrap();
        let mailbox = pool.spm.lock().mailbox.clone().unwrap();
        assert_eq!(mailbox.max_host_id(), 4);
        pool.set_spm_max_host_id(6).unwrap();
        assert_eq!(mailbox.max_host_id(), 6);
        pool.spm_stop().unwrap();
    }

    #[test]
    fn test_file_master_has_no_mailbox() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[]);
        pool.spm_start(-1, -1, 0).unwrap();
        assert!(pool.spm.lock().mailbox.is_none());
    }

    #[test]
    fn test_spm_activates_backup_domains() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let backup = fx.domain(DomainClass::Backup);
        let pool = fx.connected_pool(a, &[backup]);
        pool.activate_sd(backup).unwrap();
        let domain = fx.registry.produce(backup).unwrap();
        domain.deactivate();

        pool.spm_start(-1, -1, 0).unwrap();
        assert!(domain.is_master_mounted());
    }

    #[test]
    fn test_extend_through_block_master() {
        let fx = Fixture::new();
        let a = fx.block_domain();
        let pool = fx.connected_pool(a, &[]);
        pool.spm_start(-1, -1, 0).unwrap();

        let volume = VolumeId::new();
        let data = DomainId::new();
        let ticket = pool.extend_volume(data, volume, 64, None).unwrap();
        let size = ticket
            .wait_timeout(Duration::from_secs(10))
            .expect("reply within timeout")
            .unwrap();
        assert_eq!(size, 64);

        let calls = fx.backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].domain, data);
        assert_eq!(calls[0].pool, pool.id());
        assert_eq!(calls[0].volume, volume);
        assert_eq!(calls[0].new_size, 64 * 1024 * 1024);
        pool.spm_stop().unwrap();
    }
}
