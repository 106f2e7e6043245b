//! Domain registry
//!
//! One registry per process caches the [`Domain`] objects of every visible
//! domain. Objects are never replaced while cached: a held cluster lease
//! lives inside its `Domain`, so a refresh only adds new domains, drops
//! vanished ones and invalidates the metadata of the rest.
//!
//! Refreshes are single-flight. A caller arriving while a refresh runs
//! waits for that refresh and shares its result.

use crate::domain::Domain;
use parking_lot::{Condvar, Mutex, RwLock};
use spmd_common::{DomainId, Error, Result};
use spmd_storage::DomainLayout;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Enumerates and opens domains
pub trait DomainSource: Send + Sync {
    /// Identifiers of every visible domain, possibly with repeats
    fn list(&self) -> Result<Vec<DomainId>>;

    fn open(&self, id: DomainId) -> Result<Domain>;
}

/// Domains stored as sub-directories of one repository directory
pub struct DirectoryDomainSource {
    repository: PathBuf,
    direct_io: bool,
}

impl DirectoryDomainSource {
    pub fn new(repository: impl AsRef<Path>, direct_io: bool) -> Self {
        Self {
            repository: repository.as_ref().to_path_buf(),
            direct_io,
        }
    }
}

impl DomainSource for DirectoryDomainSource {
    fn list(&self) -> Result<Vec<DomainId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.repository)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<DomainId>().ok()) else {
                debug!("skipping {:?} in {:?}", name, self.repository);
                continue;
            };
            if DomainLayout::new(&self.repository, id).exists() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn open(&self, id: DomainId) -> Result<Domain> {
        Domain::open(&self.repository, id, self.direct_io)
    }
}

struct Cached {
    domain: Arc<Domain>,
    /// Added by hand, kept even when the source no longer lists it
    manual: bool,
}

#[derive(Default)]
struct RefreshState {
    running: bool,
    generation: u64,
    waiters: usize,
    last_error: Option<String>,
}

/// Process-wide cache of domains
pub struct DomainRegistry {
    source: Box<dyn DomainSource>,
    domains: RwLock<HashMap<DomainId, Cached>>,
    dirty: AtomicBool,
    refresh: Mutex<RefreshState>,
    refreshed: Condvar,
}

impl DomainRegistry {
    pub fn new(source: impl DomainSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            domains: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(true),
            refresh: Mutex::new(RefreshState::default()),
            refreshed: Condvar::new(),
        }
    }

    /// Registry over a repository directory
    pub fn with_directory(repository: impl AsRef<Path>, direct_io: bool) -> Self {
        Self::new(DirectoryDomainSource::new(repository, direct_io))
    }

    /// Cached domain `id`, opening it on a miss
    pub fn produce(&self, id: DomainId) -> Result<Arc<Domain>> {
        if self.dirty.load(Ordering::SeqCst) {
            self.refresh()?;
        }
        if let Some(domain) = self.lookup(id) {
            return Ok(domain);
        }

        let domain = match self.source.open(id) {
            Ok(domain) => Arc::new(domain),
            Err(Error::DomainNotFound(_)) => return Err(Error::DomainNotFound(id.to_string())),
            Err(e) => return Err(e),
        };
        let mut domains = self.domains.write();
        let cached = domains.entry(id).or_insert(Cached {
            domain,
            manual: false,
        });
        Ok(Arc::clone(&cached.domain))
    }

    fn lookup(&self, id: DomainId) -> Option<Arc<Domain>> {
        self.domains.read().get(&id).map(|c| Arc::clone(&c.domain))
    }

    /// Mark the cache stale; the next lookup rescans
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Rescan the source, or wait for the rescan already running
    pub fn refresh(&self) -> Result<()> {
        let mut state = self.refresh.lock();
        if state.running {
            let generation = state.generation;
            state.waiters += 1;
            while state.generation == generation {
                self.refreshed.wait(&mut state);
            }
            return state
                .last_error
                .clone()
                .map_or(Ok(()), |e| Err(Error::internal(e)));
        }
        state.running = true;
        drop(state);

        let result = self.rescan();

        let mut state = self.refresh.lock();
        if state.waiters > 0 {
            debug!("{} callers shared one domain refresh", state.waiters + 1);
        }
        state.running = false;
        state.waiters = 0;
        state.generation += 1;
        state.last_error = result.as_ref().err().map(ToString::to_string);
        self.refreshed.notify_all();
        result
    }

    fn rescan(&self) -> Result<()> {
        // Cleared first so an invalidation during the scan is not lost
        self.dirty.store(false, Ordering::SeqCst);
        let listed = match self.source.list() {
            Ok(ids) => ids,
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut found = HashSet::with_capacity(listed.len());
        for id in listed {
            if !found.insert(id) {
                warn!("domain {} found more than once, keeping the first", id);
            }
        }

        let known: HashSet<DomainId> = self.domains.read().keys().copied().collect();
        let mut opened = Vec::new();
        for id in found.iter().filter(|id| !known.contains(id)) {
            match self.source.open(*id) {
                Ok(domain) => opened.push(domain),
                Err(e) => warn!("cannot open domain {}: {}", id, e),
            }
        }

        let mut domains = self.domains.write();
        domains.retain(|id, cached| {
            let keep = cached.manual || found.contains(id);
            if !keep {
                info!("domain {} is no longer visible", id);
            }
            keep
        });
        for domain in opened {
            domains.entry(domain.id()).or_insert(Cached {
                domain: Arc::new(domain),
                manual: false,
            });
        }
        for cached in domains.values() {
            cached.domain.invalidate_metadata();
        }
        debug!("domain registry holds {} domains", domains.len());
        Ok(())
    }

    /// Cache a domain the source may not list
    pub fn add(&self, domain: Arc<Domain>) {
        info!("adding domain {} to the registry", domain.id());
        self.domains.write().insert(
            domain.id(),
            Cached {
                domain,
                manual: true,
            },
        );
    }

    pub fn remove(&self, id: DomainId) -> Option<Arc<Domain>> {
        let removed = self.domains.write().remove(&id).map(|c| c.domain);
        if removed.is_some() {
            info!("removed domain {} from the registry", id);
        }
        removed
    }

    /// Identifiers of all cached domains, sorted
    pub fn uuids(&self) -> Result<Vec<DomainId>> {
        if self.dirty.load(Ordering::SeqCst) {
            self.refresh()?;
        }
        let mut ids: Vec<_> = self.domains.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
