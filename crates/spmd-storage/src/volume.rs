//! Volume backend
//!
//! The SPM mailbox monitor delegates extend requests here. Only growth is
//! supported; a request for less than the current size is a no-op.

use crate::layout::DomainLayout;
use spmd_common::{DomainId, Error, PoolId, Result, VolumeId};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Image directory used when a request does not name one
pub const DEFAULT_IMAGE: &str = "_";

/// Privileged volume operations performed on behalf of hosts
pub trait VolumeBackend: Send + Sync {
    /// Grow `volume` to at least `new_size` bytes
    fn extend(
        &self,
        domain: DomainId,
        pool: PoolId,
        image: Option<&str>,
        volume: VolumeId,
        new_size: u64,
    ) -> Result<()>;

    /// Current size of `volume` in bytes
    fn volume_size(
        &self,
        domain: DomainId,
        pool: PoolId,
        image: Option<&str>,
        volume: VolumeId,
    ) -> Result<u64>;
}

/// Volumes as sparse files under `<repository>/<domain>/images/<image>/<volume>`
pub struct FileVolumeBackend {
    repository: PathBuf,
}

impl FileVolumeBackend {
    pub fn new(repository: impl AsRef<Path>) -> Self {
        Self {
            repository: repository.as_ref().to_path_buf(),
        }
    }

    /// Path of a volume file
    #[must_use]
    pub fn volume_path(&self, domain: DomainId, image: Option<&str>, volume: VolumeId) -> PathBuf {
        DomainLayout::new(&self.repository, domain)
            .images()
            .join(image.unwrap_or(DEFAULT_IMAGE))
            .join(volume.to_string())
    }
}

impl VolumeBackend for FileVolumeBackend {
    fn extend(
        &self,
        domain: DomainId,
        pool: PoolId,
        image: Option<&str>,
        volume: VolumeId,
        new_size: u64,
    ) -> Result<()> {
        let layout = DomainLayout::new(&self.repository, domain);
        if !layout.root().is_dir() {
            return Err(Error::DomainNotFound(domain.to_string()));
        }
        let path = self.volume_path(domain, image, volume);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::backend(format!("cannot open volume {volume}: {e}")))?;
        let current = file.metadata()?.len();
        if new_size <= current {
            debug!(
                "volume {} already {} bytes, requested {} (pool {})",
                volume, current, new_size, pool
            );
            return Ok(());
        }
        file.set_len(new_size)
            .map_err(|e| Error::backend(format!("cannot extend volume {volume}: {e}")))?;
        info!(
            "extended volume {} of domain {} from {} to {} bytes",
            volume, domain, current, new_size
        );
        Ok(())
    }

    fn volume_size(
        &self,
        domain: DomainId,
        _pool: PoolId,
        image: Option<&str>,
        volume: VolumeId,
    ) -> Result<u64> {
        let path = self.volume_path(domain, image, volume);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::backend(format!("volume {volume} not found")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
