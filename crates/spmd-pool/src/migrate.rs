//! Master relocation
//!
//! The new master is made complete before the old one is touched: tree
//! copied, pool metadata copied, lease taken, role and version written and
//! the reconnect record saved. Until that last step the old master stays
//! the only valid one, so a crash at any point leaves exactly one master
//! reachable.

use crate::domain::Domain;
use crate::pool::{
    KEY_DOMAINS, KEY_LVER, KEY_MASTER_VERSION, KEY_POOL_DESCRIPTION, KEY_SPM_ID, StoragePool,
    demote, pool_view,
};
use crate::reconnect::ReconnectInfo;
use spmd_common::{DomainId, DomainRole, DomainStatus, Error, Result};
use spmd_storage::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

impl StoragePool {
    /// Move the master role from `from` to `to` at `master_version`.
    ///
    /// A blank `to` retires the last master instead.
    pub fn master_migrate(&self, from: DomainId, to: DomainId, master_version: i64) -> Result<()> {
        if to.is_blank() {
            return self.retire_last_master(from);
        }

        let old = self.master_domain()?;
        if old.id() != from {
            return Err(Error::PoolWrongMaster {
                pool: self.id.to_string(),
                master: from.to_string(),
                version: self.master_version()?,
            });
        }
        self.validate_master_version_higher(master_version)?;

        match self.get_domains(false)?.get(&to) {
            None => {
                return Err(Error::DomainNotAttached {
                    domain: to.to_string(),
                    pool: self.id.to_string(),
                });
            }
            Some(DomainStatus::Active) => {}
            Some(_) => return Err(Error::DomainNotActive(to.to_string())),
        }
        let new = self.registry.produce(to)?;
        new.invalidate_metadata();
        if new.is_iso() {
            return Err(Error::IsoCannotBeMaster(to.to_string()));
        }
        if new.is_backup() {
            return Err(Error::BackupCannotBeMaster(to.to_string()));
        }
        let session = self.session()?;

        info!(
            "migrating master of pool {} from {} to {} at version {}",
            self.id, from, to, master_version
        );
        new.upgrade(old.version()?)?;

        if let Err(e) = self.prepare_new_master(&old, &new) {
            abandon(&new);
            return Err(e);
        }
        if let Err(e) = copy_pool_metadata(&old, &new) {
            abandon(&new);
            return Err(e);
        }
        new.init_spm_lease();
        if let Err(e) = new.acquire_cluster_lock(session.host_id) {
            abandon(&new);
            return Err(e);
        }

        let promoted = new
            .metadata()
            .transaction(|_| {
                pool_view(&new).set(KEY_MASTER_VERSION, &Value::Int(master_version))?;
                new.change_role(DomainRole::Master)
            })
            .and_then(|()| {
                ReconnectInfo {
                    host_id: session.host_id,
                    scsi_key: session.scsi_key.clone(),
                    master: to,
                    master_version,
                }
                .save(&self.reconnect_path())
            });
        if let Err(e) = promoted {
            error!("cannot promote domain {} of pool {}: {}", to, self.id, e);
            if let Err(e) = demote(&new) {
                error!("cannot demote domain {}: {}", to, e);
            }
            if let Err(e) = new.release_cluster_lock() {
                error!("cannot release lock of domain {}: {}", to, e);
            }
            abandon(&new);
            return Err(e);
        }

        // The new master is authoritative from here on
        *self.master.write() = Some(Arc::clone(&new));
        self.retire_old_master(&old);

        if !self.is_spm()
            && let Err(e) = new.release_cluster_lock()
        {
            error!("cannot release lock of domain {}: {}", to, e);
        }
        if let Err(e) = self.start_hsm_mailbox() {
            error!("cannot restart HSM mailbox of pool {}: {}", self.id, e);
        }
        if let Err(e) = self.restart_spm_mailbox() {
            error!("cannot restart SPM mailbox of pool {}: {}", self.id, e);
        }
        info!(
            "domain {} is master of pool {} at version {}",
            to, self.id, master_version
        );
        Ok(())
    }

    fn prepare_new_master(&self, old: &Domain, new: &Domain) -> Result<()> {
        new.mount_master()?;
        new.create_master_tree()?;
        new.clean_master_tree()?;
        new.copy_master_from(old)
    }

    /// Best effort; the new master is already valid
    fn retire_old_master(&self, old: &Domain) {
        if let Err(e) = demote(old) {
            error!("cannot demote old master {}: {}", old.id(), e);
        }
        if let Err(e) = self.rebuild() {
            error!("rebuild of pool {} after migration failed: {}", self.id, e);
        }
        if let Err(e) = old.remove_master_tree() {
            warn!("cannot remove master tree of domain {}: {}", old.id(), e);
        }
        old.unmount_master();
        if old.has_cluster_lock()
            && let Err(e) = old.release_cluster_lock()
        {
            error!("cannot release lock of old master {}: {}", old.id(), e);
        }
    }

    /// Unmount the master of a pool that is losing its last data domain
    fn retire_last_master(&self, from: DomainId) -> Result<()> {
        let active = self.get_domains(true)?;
        for id in active.into_keys().filter(|id| *id != from) {
            match self.registry.produce(id) {
                Ok(domain) if domain.is_data() => {
                    return Err(Error::PoolHasPotentialMaster {
                        pool: self.id.to_string(),
                        domain: id.to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("cannot reach domain {} of pool {}: {}", id, self.id, e),
            }
        }
        let master = self.master_domain()?;
        if master.id() != from {
            return Err(Error::PoolWrongMaster {
                pool: self.id.to_string(),
                master: from.to_string(),
                version: self.master_version()?,
            });
        }
        master.unmount_master();
        info!("retired last master {} of pool {}", from, self.id);
        Ok(())
    }
}

/// Copy the pool fields and lease parameters in one transaction
fn copy_pool_metadata(old: &Domain, new: &Domain) -> Result<()> {
    old.invalidate_metadata();
    let source = pool_view(old);
    let domains = source.domain_map(KEY_DOMAINS)?;
    let description = source.text(KEY_POOL_DESCRIPTION)?;
    let lver = source.int(KEY_LVER)?;
    let spm_id = source.int(KEY_SPM_ID)?;
    let lease = old.lease_params()?;

    new.metadata().transaction(|_| {
        new.change_lease_params(&lease)?;
        pool_view(new).update(&[
            (KEY_DOMAINS, Value::DomainMap(domains)),
            (KEY_POOL_DESCRIPTION, Value::Text(description)),
            (KEY_LVER, Value::Int(lver)),
            (KEY_SPM_ID, Value::Int(spm_id)),
        ])
    })
}

/// Undo a partial promotion; the new master's tree is wiped
fn abandon(new: &Domain) {
    if let Err(e) = new.remove_master_tree() {
        error!("cannot remove partial master tree of domain {}: {}", new.id(), e);
    }
    new.unmount_master();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use spmd_common::DomainClass;
    use std::fs;

    #[test]
    fn test_migrate_master() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();
        pool.set_description("moving").unwrap();

        let old = fx.registry.produce(a).unwrap();
        fs::write(old.layout().vms().join("vm-1.ovf"), b"<ovf/>").unwrap();

        pool.master_migrate(a, b, 2).unwrap();
        assert_eq!(pool.master_domain().unwrap().id(), b);
        assert_eq!(pool.master_version().unwrap(), 2);
        assert_eq!(pool.description().unwrap(), "moving");
        assert_eq!(fx.master_count(&[a, b]), 1);

        let new = fx.registry.produce(b).unwrap();
        assert_eq!(new.role().unwrap(), DomainRole::Master);
        assert_eq!(
            fs::read(new.layout().vms().join("vm-1.ovf")).unwrap(),
            b"<ovf/>"
        );
        assert!(!old.layout().master().exists());
        assert!(!new.has_cluster_lock());
        assert_eq!(old.role().unwrap(), DomainRole::Regular);
        assert_eq!(pool_view(&old).int(KEY_MASTER_VERSION).unwrap(), 0);

        let record = ReconnectInfo::load(&pool.reconnect_path()).unwrap().unwrap();
        assert_eq!(record.master, b);
        assert_eq!(record.master_version, 2);

        // Both domains stay in the pool
        let domains = pool.get_domains(false).unwrap();
        assert_eq!(domains[&a], DomainStatus::Active);
        assert_eq!(domains[&b], DomainStatus::Active);
    }

    #[test]
    fn test_migrate_to_inactive_domain() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);

        assert!(matches!(
            pool.master_migrate(a, b, 2),
            Err(Error::DomainNotActive(_))
        ));
        assert_eq!(pool.master_domain().unwrap().id(), a);
        assert_eq!(pool.master_version().unwrap(), 1);
        assert_eq!(fx.master_count(&[a, b]), 1);
    }

    #[test]
    fn test_migrate_rejects_stale_version_and_wrong_source() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();

        assert!(matches!(
            pool.master_migrate(a, b, 1),
            Err(Error::PoolWrongMaster { version: 1, .. })
        ));
        assert!(matches!(
            pool.master_migrate(b, a, 2),
            Err(Error::PoolWrongMaster { .. })
        ));
        assert_eq!(pool.master_domain().unwrap().id(), a);
    }

    #[test]
    fn test_iso_and_backup_cannot_be_master() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let iso = fx.domain(DomainClass::Iso);
        let backup = fx.domain(DomainClass::Backup);
        let pool = fx.connected_pool(a, &[iso, backup]);
        pool.activate_sd(iso).unwrap();
        pool.activate_sd(backup).unwrap();

        assert!(matches!(
            pool.master_migrate(a, iso, 2),
            Err(Error::IsoCannotBeMaster(_))
        ));
        assert!(matches!(
            pool.master_migrate(a, backup, 2),
            Err(Error::BackupCannotBeMaster(_))
        ));
        assert_eq!(pool.master_domain().unwrap().id(), a);
    }

    #[test]
    fn test_failed_copy_keeps_old_master() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();

        // The source tree is broken
        let old = fx.registry.produce(a).unwrap();
        fs::remove_dir_all(old.layout().tasks()).unwrap();

        assert!(matches!(
            pool.master_migrate(a, b, 2),
            Err(Error::MasterCopy { .. })
        ));
        assert_eq!(pool.master_domain().unwrap().id(), a);
        assert_eq!(pool.master_version().unwrap(), 1);
        let new = fx.registry.produce(b).unwrap();
        assert_eq!(new.role().unwrap(), DomainRole::Regular);
        assert!(!new.layout().master().exists());
        assert!(!new.has_cluster_lock());
        assert_eq!(fx.master_count(&[a, b]), 1);
    }

    #[test]
    fn test_failed_lock_keeps_old_master() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();

        let blocker = Domain::open(fx.repo.path(), b, false).unwrap();
        blocker.acquire_cluster_lock(9).unwrap();
        assert!(matches!(
            pool.master_migrate(a, b, 2),
            Err(Error::AcquireLock { .. })
        ));
        assert_eq!(pool.master_domain().unwrap().id(), a);
        assert_eq!(fx.master_count(&[a, b]), 1);
        let record = ReconnectInfo::load(&pool.reconnect_path()).unwrap().unwrap();
        assert_eq!(record.master, a);
    }

    #[test]
    fn test_spm_follows_new_master() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();
        pool.spm_start(-1, -1, 0).unwrap();

        pool.master_migrate(a, b, 2).unwrap();
        let new = fx.registry.produce(b).unwrap();
        let old = fx.registry.produce(a).unwrap();
        assert!(new.has_cluster_lock());
        assert!(!old.has_cluster_lock());
        let info = pool.spm_status().unwrap();
        assert_eq!(info.spm_id, 1);
        assert_eq!(info.lver, 0);
        pool.spm_stop().unwrap();
        assert!(!new.has_cluster_lock());
    }

    #[test]
    fn test_deactivating_master_migrates() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();

        assert!(matches!(
            pool.deactivate_sd(b, a, 2),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            pool.deactivate_sd(a, a, 2),
            Err(Error::InvalidParameter { .. })
        ));

        pool.deactivate_sd(a, b, 2).unwrap();
        assert_eq!(pool.master_domain().unwrap().id(), b);
        assert_eq!(pool.master_version().unwrap(), 2);
        let domains = pool.get_domains(false).unwrap();
        assert_eq!(domains[&a], DomainStatus::Attached);
        assert_eq!(domains[&b], DomainStatus::Active);
        assert_eq!(fx.master_count(&[a, b]), 1);
    }

    #[test]
    fn test_retire_last_master() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b]);
        pool.activate_sd(b).unwrap();

        assert!(matches!(
            pool.master_migrate(a, DomainId::BLANK, 2),
            Err(Error::PoolHasPotentialMaster { .. })
        ));

        pool.deactivate_sd(b, DomainId::BLANK, 0).unwrap();
        pool.master_domain().unwrap().mount_master().unwrap();
        pool.deactivate_sd(a, DomainId::BLANK, 0).unwrap();
        assert!(!pool.master_domain().unwrap().is_master_mounted());
        assert_eq!(pool.master_domain().unwrap().id(), a);
    }

    #[test]
    fn test_master_version_strictly_increases() {
        let fx = Fixture::new();
        let a = fx.domain(DomainClass::Data);
        let b = fx.domain(DomainClass::Data);
        let c = fx.domain(DomainClass::Data);
        let pool = fx.connected_pool(a, &[b, c]);
        pool.activate_sd(b).unwrap();
        pool.activate_sd(c).unwrap();

        let mut version = pool.master_version().unwrap();
        for (from, to) in [(a, b), (b, c), (c, a)] {
            pool.master_migrate(from, to, version + 1).unwrap();
            let next = pool.master_version().unwrap();
            assert!(next > version);
            version = next;
            assert_eq!(fx.master_count(&[a, b, c]), 1);
        }
        assert_eq!(version, 4);
    }

    #[test]
    fn test_migrate_upgrades_new_master() {
        let fx = Fixture::new();
        let a = fx.domain_with_version(DomainClass::Data, 2);
        let b = fx.domain_with_version(DomainClass::Data, 0);
        let pool = fx.connected_pool(a, &[b]);
        assert_eq!(fx.registry.produce(b).unwrap().version().unwrap(), 0);
        pool.activate_sd(b).unwrap();

        pool.master_migrate(a, b, 2).unwrap();
        assert_eq!(fx.registry.produce(b).unwrap().version().unwrap(), 2);
    }
}
