//! Local reconnect record
//!
//! After a successful connect a host writes one small `key=value` file per
//! pool so a restarted daemon can reconnect without being told the
//! parameters again:
//!
//! ```text
//! id=3
//! scsiKey=pool-key
//! sdUUID=<master domain>
//! version=7
//! ```

use spmd_common::{DomainId, HostId, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const KEY_HOST_ID: &str = "id";
const KEY_SCSI_KEY: &str = "scsiKey";
const KEY_MASTER: &str = "sdUUID";
const KEY_VERSION: &str = "version";

/// Parameters of the last successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectInfo {
    pub host_id: HostId,
    pub scsi_key: String,
    pub master: DomainId,
    pub master_version: i64,
}

impl ReconnectInfo {
    /// Write the record, replacing any previous one atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp = temp_path(path);
        {
            let mut file = fs::File::create(&temp)?;
            writeln!(file, "{KEY_HOST_ID}={}", self.host_id)?;
            writeln!(file, "{KEY_SCSI_KEY}={}", self.scsi_key)?;
            writeln!(file, "{KEY_MASTER}={}", self.master)?;
            writeln!(file, "{KEY_VERSION}={}", self.master_version)?;
            file.sync_all()?;
        }
        fs::rename(&temp, path)?;
        debug!("saved reconnect record {:?}", path);
        Ok(())
    }

    /// Read the record. `None` when it is absent or incomplete.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut host_id = None;
        let mut scsi_key = None;
        let mut master = None;
        let mut master_version = None;
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                KEY_HOST_ID => host_id = value.parse::<HostId>().ok(),
                KEY_SCSI_KEY => scsi_key = Some(value.to_string()).filter(|k| !k.is_empty()),
                KEY_MASTER => master = value.parse::<DomainId>().ok(),
                KEY_VERSION => master_version = value.parse::<i64>().ok(),
                other => debug!("ignoring {:?} in {:?}", other, path),
            }
        }

        match (host_id, scsi_key, master, master_version) {
            (Some(host_id), Some(scsi_key), Some(master), Some(master_version)) => Ok(Some(Self {
                host_id,
                scsi_key,
                master,
                master_version,
            })),
            _ => {
                warn!("reconnect record {:?} is incomplete", path);
                Ok(None)
            }
        }
    }

    /// Delete the record; a missing record is not an error
    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info() -> ReconnectInfo {
        ReconnectInfo {
            host_id: 3,
            scsi_key: "key".to_string(),
            master: DomainId::new(),
            master_version: 7,
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        let record = info();
        record.save(&path).unwrap();
        assert_eq!(ReconnectInfo::load(&path).unwrap(), Some(record));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        let record = info();
        record.save(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            format!("id=3\nscsiKey=key\nsdUUID={}\nversion=7\n", record.master)
        );
    }

    #[test]
    fn test_missing_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        assert_eq!(ReconnectInfo::load(&path).unwrap(), None);
        ReconnectInfo::remove(&path).unwrap();
    }

    #[test]
    fn test_incomplete_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        fs::write(&path, "id=3\nscsiKey=\nversion=1\n").unwrap();
        assert_eq!(ReconnectInfo::load(&path).unwrap(), None);

        fs::write(&path, format!("id=x\nscsiKey=k\nsdUUID={}\nversion=1\n", DomainId::new())).unwrap();
        assert_eq!(ReconnectInfo::load(&path).unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool");
        info().save(&path).unwrap();
        ReconnectInfo::remove(&path).unwrap();
        assert!(!path.exists());
    }
}
