//! Shared-mount change detection.
//!
//! The host side of the shared directory is snapshotted before and after each
//! call; files that appeared or whose size or mtime changed are reported as
//! artifacts. Concurrent kernels write to the same tree, so a call may also
//! see files written by another kernel during the same window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

/// File fingerprint used for change detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

/// Point-in-time view of the shared directory
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: HashMap<PathBuf, Fingerprint>,
}

impl Snapshot {
    /// Number of files seen
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// No files seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Walks the host side of the shared mount
#[derive(Debug, Clone)]
pub struct ArtifactScanner {
    root: PathBuf,
}

impl ArtifactScanner {
    /// Scanner rooted at the host shared directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Take a snapshot on the blocking pool
    pub async fn snapshot(&self) -> Snapshot {
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || scan(&root)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Shared directory scan aborted");
                Snapshot::default()
            }
        }
    }

    /// Paths, relative to the root and sorted, that are new or changed in `after`
    #[must_use]
    pub fn changed(&self, before: &Snapshot, after: &Snapshot) -> Vec<String> {
        let mut changed: Vec<String> = after
            .files
            .iter()
            .filter(|(path, print)| before.files.get(*path) != Some(*print))
            .map(|(path, _)| path.to_string_lossy().replace('\\', "/"))
            .collect();
        changed.sort();
        changed
    }
}

fn scan(root: &Path) -> Snapshot {
    let mut files = HashMap::new();
    if !root.exists() {
        return Snapshot { files };
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // Files may vanish mid-walk while kernels are writing
            Err(e) => {
                warn!(error = %e, "Skipping unreadable shared path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        files.insert(
            relative.to_path_buf(),
            Fingerprint {
                len: metadata.len(),
                modified: metadata.modified().ok(),
            },
        );
    }

    Snapshot { files }
}
