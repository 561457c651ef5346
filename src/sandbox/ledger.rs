//! Durable record of kernel containers.
//!
//! Survives a manager restart so containers left behind by a crashed process
//! can be found and reclaimed.

use super::error::SandboxError;
use super::kernel::{KernelId, Language};
use super::runtime::ContainerRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// One recorded container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Engine id (or name before the engine assigned one)
    pub container_id: String,
    /// Container name
    pub container_name: String,
    /// Kernel language
    pub language: Language,
    /// When the container was recorded
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Container reference for cleanup
    #[must_use]
    pub fn container(&self) -> ContainerRef {
        ContainerRef {
            id: self.container_id.clone(),
            name: self.container_name.clone(),
        }
    }
}

/// JSON file mapping kernel ids to their containers
#[derive(Debug)]
pub struct ContainerLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<KernelId, LedgerEntry>>,
}

impl ContainerLedger {
    /// Open the ledger at `path`, starting empty if the file does not exist
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Ledger` if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SandboxError::Ledger(format!("Corrupt ledger {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(SandboxError::Ledger(format!(
                    "Failed to read ledger {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Record (or update) the container of a kernel
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Ledger` if the file cannot be written.
    pub async fn record(&self, kernel_id: &KernelId, entry: LedgerEntry) -> Result<(), SandboxError> {
        let mut entries = self.entries.lock().await;
        entries.insert(kernel_id.clone(), entry);
        self.persist(&entries).await
    }

    /// Drop the record of a kernel whose container is gone
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Ledger` if the file cannot be written.
    pub async fn forget(&self, kernel_id: &KernelId) -> Result<(), SandboxError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(kernel_id).is_none() {
            return Ok(());
        }
        self.persist(&entries).await
    }

    /// Copy of every record
    pub async fn entries(&self) -> Vec<(KernelId, LedgerEntry)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    // Temp file, fsync, rename, fsync of the directory: a crash leaves the old or the new ledger
    async fn persist(&self, entries: &BTreeMap<KernelId, LedgerEntry>) -> Result<(), SandboxError> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| SandboxError::Ledger(format!("Failed to encode ledger: {e}")))?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| SandboxError::Ledger(format!("Failed to create ledger directory: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        write_synced(&tmp, &json)
            .await
            .map_err(|e| SandboxError::Ledger(format!("Failed to write ledger: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SandboxError::Ledger(format!("Failed to replace ledger: {e}")))?;
        sync_dir(&parent).await;

        debug!(path = %self.path.display(), entries = entries.len(), "Ledger persisted");
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

// Makes the rename durable; not every platform can open a directory
async fn sync_dir(dir: &Path) {
    match tokio::fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                debug!(dir = %dir.display(), error = %e, "Ledger directory fsync failed");
            }
        }
        Err(e) => debug!(dir = %dir.display(), error = %e, "Ledger directory not opened for fsync"),
    }
}
