//! Cluster lease
//!
//! The lease is the only cross-host mutual exclusion in the system. It is
//! scoped to one domain and taken on behalf of one host id. Holding it is
//! required before the domain's pool membership or master tree may change.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use spmd_common::{DomainId, Error, HostId, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Size of the owner record at the start of the lease file
const OWNER_RECORD_SIZE: usize = 64;

/// Exclusive, non-reentrant ownership of a domain
pub trait ClusterLease: Send + Sync {
    /// Clear the owner record unless some host holds the lease
    fn init_lock(&self) -> Result<()>;

    /// Take the lease for `host_id`; fails if it is held anywhere
    fn acquire(&self, host_id: HostId) -> Result<()>;

    /// Give the lease back; fails if this process does not hold it
    fn release(&self) -> Result<()>;

    /// Whether this process holds the lease
    fn is_locked(&self) -> bool;

    /// Host id this process holds the lease for
    fn holder(&self) -> Option<HostId>;
}

struct Held {
    lock: Flock<File>,
    host_id: HostId,
}

/// Lease on a domain's `leases` file using `flock(2)`.
///
/// Each acquire opens a fresh file description, so two leases on the same
/// file exclude each other even inside one process. The kernel drops the
/// lock when the holder dies.
pub struct FileLease {
    domain: DomainId,
    path: PathBuf,
    held: Mutex<Option<Held>>,
}

impl FileLease {
    pub fn new(domain: DomainId, path: impl AsRef<Path>) -> Self {
        Self {
            domain,
            path: path.as_ref().to_path_buf(),
            held: Mutex::new(None),
        }
    }

    /// Host id recorded by the current holder, if any
    pub fn owner(&self) -> Result<Option<HostId>> {
        match File::open(&self.path) {
            Ok(file) => read_owner(&file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn acquire_error(&self, reason: impl Into<String>) -> Error {
        Error::AcquireLock {
            domain: self.domain.to_string(),
            reason: reason.into(),
        }
    }
}

fn read_owner(file: &File) -> Result<Option<HostId>> {
    let mut record = [0u8; OWNER_RECORD_SIZE];
    let n = file.read_at(&mut record, 0)?;
    let text = String::from_utf8_lossy(&record[..n]);
    Ok(text
        .trim_end_matches('\0')
        .trim()
        .strip_prefix("host_id=")
        .and_then(|id| id.parse().ok()))
}

fn owner_record(host_id: Option<HostId>) -> [u8; OWNER_RECORD_SIZE] {
    let mut record = [0u8; OWNER_RECORD_SIZE];
    if let Some(id) = host_id {
        let text = format!("host_id={id}\n");
        record[..text.len()].copy_from_slice(text.as_bytes());
    }
    record
}

impl ClusterLease for FileLease {
    fn init_lock(&self) -> Result<()> {
        if let Some(current) = self.held.lock().as_ref() {
            info!(
                "lease of domain {} is held here by host {}, not resetting it",
                self.domain, current.host_id
            );
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        // Only a record nobody holds is reset
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((file, Errno::EWOULDBLOCK)) => {
                let owner = read_owner(&file)?;
                info!(
                    "lease of domain {} is held by host {:?}, not resetting it",
                    self.domain, owner
                );
                return Ok(());
            }
            Err((_, errno)) => return Err(self.acquire_error(errno.to_string())),
        };

        lock.write_all_at(&owner_record(None), 0)?;
        lock.sync_all()?;
        lock.unlock().map_err(|(_, errno)| self.acquire_error(format!("unlock failed: {errno}")))?;
        info!("initialized lease of domain {} at {:?}", self.domain, self.path);
        Ok(())
    }

    fn acquire(&self, host_id: HostId) -> Result<()> {
        let mut held = self.held.lock();
        if let Some(current) = held.as_ref() {
            return Err(Error::DomainAlreadyLocked {
                domain: self.domain.to_string(),
                host_id: current.host_id,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((file, Errno::EWOULDBLOCK)) => {
                let owner = read_owner(&file)?
                    .map_or_else(|| "unknown".to_string(), |id| id.to_string());
                return Err(self.acquire_error(format!("held by host {owner}")));
            }
            Err((_, errno)) => return Err(self.acquire_error(errno.to_string())),
        };

        lock.write_all_at(&owner_record(Some(host_id)), 0)?;
        lock.sync_data()?;
        info!("host {} acquired lease of domain {}", host_id, self.domain);
        *held = Some(Held { lock, host_id });
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut held = self.held.lock();
        let Some(current) = held.take() else {
            return Err(Error::LockNotHeld(self.domain.to_string()));
        };

        if let Err(e) = current.lock.write_all_at(&owner_record(None), 0) {
            warn!("failed to clear lease owner of domain {}: {}", self.domain, e);
        }
        current
            .lock
            .unlock()
            .map_err(|(_, errno)| self.acquire_error(format!("unlock failed: {errno}")))?;
        info!("host {} released lease of domain {}", current.host_id, self.domain);
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.held.lock().is_some()
    }

    fn holder(&self) -> Option<HostId> {
        self.held.lock().as_ref().map(|h| h.host_id)
    }
}
