//! Domain directory layout
//!
//! ```text
//! <repository>/<sdUUID>/
//! +-- dom_md/
//! |   +-- metadata     key=value lines, or a fixed raw slice on block domains
//! |   +-- leases       cluster lease area
//! |   +-- ids          host id area
//! |   +-- inbox        SPM inbox / HSM outbox   (N_hosts x 4KB)
//! |   +-- outbox       SPM outbox / HSM inbox   (N_hosts x 4KB)
//! +-- images/<image>/<volume>
//! +-- master/          master domain only
//!     +-- vms/
//!     +-- tasks/
//! ```

use crate::raw_io::{ALIGNMENT, RawFile};
use spmd_common::{DomainId, Result, StorageType};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DOMAIN_MD_DIR: &str = "dom_md";
pub const METADATA_FILE: &str = "metadata";
pub const LEASES_FILE: &str = "leases";
pub const IDS_FILE: &str = "ids";
pub const INBOX_FILE: &str = "inbox";
pub const OUTBOX_FILE: &str = "outbox";
pub const IMAGES_DIR: &str = "images";
pub const MASTER_DIR: &str = "master";
pub const VMS_DIR: &str = "vms";
pub const TASKS_DIR: &str = "tasks";

/// Mailbox region size (16MB)
pub const MAILBOX_REGION_SIZE: u64 = 16 * 1024 * 1024;

/// Host id region size (8MB)
pub const IDS_SIZE: u64 = 8 * 1024 * 1024;

/// Lease region size (1MB)
pub const LEASES_SIZE: u64 = 1024 * 1024;

/// Metadata slice of a block domain (64KB)
pub const BLOCK_METADATA_SIZE: usize = 16 * ALIGNMENT;

/// Paths of one domain on shared storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLayout {
    root: PathBuf,
}

impl DomainLayout {
    /// Layout of domain `id` inside `repository`
    pub fn new(repository: impl AsRef<Path>, id: DomainId) -> Self {
        Self {
            root: repository.as_ref().join(id.to_string()),
        }
    }

    /// Layout rooted at an existing domain directory
    pub fn at(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn md_dir(&self) -> PathBuf {
        self.root.join(DOMAIN_MD_DIR)
    }

    #[must_use]
    pub fn metadata(&self) -> PathBuf {
        self.md_dir().join(METADATA_FILE)
    }

    #[must_use]
    pub fn leases(&self) -> PathBuf {
        self.md_dir().join(LEASES_FILE)
    }

    #[must_use]
    pub fn ids(&self) -> PathBuf {
        self.md_dir().join(IDS_FILE)
    }

    #[must_use]
    pub fn inbox(&self) -> PathBuf {
        self.md_dir().join(INBOX_FILE)
    }

    #[must_use]
    pub fn outbox(&self) -> PathBuf {
        self.md_dir().join(OUTBOX_FILE)
    }

    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    #[must_use]
    pub fn master(&self) -> PathBuf {
        self.root.join(MASTER_DIR)
    }

    #[must_use]
    pub fn vms(&self) -> PathBuf {
        self.master().join(VMS_DIR)
    }

    #[must_use]
    pub fn tasks(&self) -> PathBuf {
        self.master().join(TASKS_DIR)
    }

    /// Whether the metadata area exists
    #[must_use]
    pub fn exists(&self) -> bool {
        self.metadata().exists()
    }

    /// Create the directory tree and the fixed-size regions.
    ///
    /// Regions are sparse files. Block domains also get a pre-sized
    /// metadata slice; file domains create theirs on first flush.
    pub fn format(&self, storage_type: StorageType) -> Result<()> {
        fs::create_dir_all(self.md_dir())?;
        fs::create_dir_all(self.images())?;

        RawFile::create(self.leases(), LEASES_SIZE, false)?;
        RawFile::create(self.ids(), IDS_SIZE, false)?;
        RawFile::create(self.inbox(), MAILBOX_REGION_SIZE, false)?;
        RawFile::create(self.outbox(), MAILBOX_REGION_SIZE, false)?;
        if storage_type.is_block() {
            RawFile::create(self.metadata(), BLOCK_METADATA_SIZE as u64, false)?;
        }
        Ok(())
    }

    /// Create `master/{vms,tasks}`
    pub fn create_master_tree(&self) -> Result<()> {
        fs::create_dir_all(self.vms())?;
        fs::create_dir_all(self.tasks())?;
        Ok(())
    }

    /// Empty `master/vms` and `master/tasks`, keeping the directories
    pub fn clean_master_tree(&self) -> Result<()> {
        for dir in [self.vms(), self.tasks()] {
            remove_contents(&dir)?;
        }
        Ok(())
    }

    /// Remove the whole master tree
    pub fn remove_master_tree(&self) -> Result<()> {
        match fs::remove_dir_all(self.master()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_contents(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, creating `dst` as needed
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
