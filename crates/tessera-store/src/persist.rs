//! Two-phase persistence of the committed resource tree.
//!
//! `store()` prepares a write without touching the live file. The returned
//! `PersistenceResource` then either commits (atomic rename plus a history
//! copy) or rolls back (drops the prepared temp file).

use crate::resource::ResourceTree;
use crate::{fsync_dir, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const CONFIG_FORMAT_VERSION: u32 = 1;

const CONFIG_FILE: &str = "configuration.json";
const HISTORY_DIR: &str = "history";
const LOCK_FILE: &str = ".lock";

pub trait ConfigurationPersister: Send + Sync {
    /// Prepare `tree` for writing.
    fn store(&self, tree: &ResourceTree) -> Result<Box<dyn PersistenceResource>, StoreError>;

    /// The last committed tree, if any was written.
    fn load(&self) -> Result<Option<ResourceTree>, StoreError>;
}

pub trait PersistenceResource: Send {
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>);
}

/// Persister for kernels that keep their model in memory only.
#[derive(Debug, Default)]
pub struct NullPersister;

struct NullResource;

impl PersistenceResource for NullResource {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

impl ConfigurationPersister for NullPersister {
    fn store(&self, _tree: &ResourceTree) -> Result<Box<dyn PersistenceResource>, StoreError> {
        Ok(Box::new(NullResource))
    }

    fn load(&self) -> Result<Option<ResourceTree>, StoreError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedConfiguration {
    format_version: u32,
    saved_at: chrono::DateTime<chrono::Utc>,
    resources: ResourceTree,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl PersistedConfiguration {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Writes `configuration.json` under a directory it holds an exclusive lock on.
pub struct JsonFilePersister {
    dir: PathBuf,
    lock_file: File,
}

impl JsonFilePersister {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.join(HISTORY_DIR))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_file,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Committed history copies, oldest first.
    pub fn history(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.dir.join(HISTORY_DIR))? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }
}

impl Drop for JsonFilePersister {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

impl ConfigurationPersister for JsonFilePersister {
    fn store(&self, tree: &ResourceTree) -> Result<Box<dyn PersistenceResource>, StoreError> {
        let mut doc = PersistedConfiguration {
            format_version: CONFIG_FORMAT_VERSION,
            saved_at: chrono::Utc::now(),
            resources: tree.clone(),
            checksum: None,
        };
        let checksum = doc.compute_checksum()?;
        doc.checksum = Some(checksum.clone());
        let content = serde_json::to_string_pretty(&doc)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        debug!("prepared configuration write ({} resources)", tree.len());

        let history_name = format!(
            "{}-{}.json",
            doc.saved_at.format("%Y%m%d%H%M%S%3f"),
            &checksum[..8]
        );
        Ok(Box::new(PreparedWrite {
            tmp,
            dir: self.dir.clone(),
            dest: self.config_path(),
            history: self.dir.join(HISTORY_DIR).join(history_name),
        }))
    }

    fn load(&self) -> Result<Option<ResourceTree>, StoreError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let doc: PersistedConfiguration = serde_json::from_str(&content)?;
        if doc.format_version != CONFIG_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: CONFIG_FORMAT_VERSION,
                found: doc.format_version,
            });
        }
        if let Some(ref expected) = doc.checksum {
            let actual = doc.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    path: path.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(Some(doc.resources))
    }
}

struct PreparedWrite {
    tmp: NamedTempFile,
    dir: PathBuf,
    dest: PathBuf,
    history: PathBuf,
}

impl PersistenceResource for PreparedWrite {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PreparedWrite {
            tmp,
            dir,
            dest,
            history,
        } = *self;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        // The live file is already durable; a missing history copy is not fatal.
        if let Err(e) = fs::copy(&dest, &history) {
            warn!("failed to record history copy {}: {e}", history.display());
        }
        debug!("configuration committed to {}", dest.display());
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!("discarding prepared configuration write");
    }
}
