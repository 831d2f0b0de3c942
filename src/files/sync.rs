use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use walkdir::WalkDir;

use crate::files::{FileEntry, FileError, FilesService, relative_remote_path};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum SourceOfTruth {
    #[strum(serialize = "local")]
    Local,
    #[strum(serialize = "remote")]
    Remote,
}

/// Remote side of a sync, seam for tests. `FilesService` is the production
/// implementation.
pub trait RemoteFiles {
    fn list(&self, prefix: &str) -> Result<Vec<FileEntry>, FileError>;
    fn upload_file(&self, local_file_path: &Path, remote_file_path: &str) -> Result<(), FileError>;
    fn download_file(&self, url: &str, local_file_path: &Path, last_modified: DateTime<Utc>) -> Result<(), FileError>;
    fn delete_file(&self, remote_file_path: &str) -> Result<(), FileError>;
}

impl RemoteFiles for FilesService {
    fn list(&self, prefix: &str) -> Result<Vec<FileEntry>, FileError> {
        FilesService::list(self, prefix)
    }

    fn upload_file(&self, local_file_path: &Path, remote_file_path: &str) -> Result<(), FileError> {
        FilesService::upload_file(self, local_file_path, remote_file_path)
    }

    fn download_file(&self, url: &str, local_file_path: &Path, last_modified: DateTime<Utc>) -> Result<(), FileError> {
        FilesService::download_file(self, url, local_file_path, last_modified)
    }

    fn delete_file(&self, remote_file_path: &str) -> Result<(), FileError> {
        FilesService::delete_file(self, remote_file_path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalFileMeta {
    pub size: u64,
    /// Modification time truncated to whole seconds; the remote side only
    /// keeps second precision.
    pub modified_s: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    Upload { path: String },
    Download { path: String },
    DeleteLocal { path: String },
    DeleteRemote { path: String },
}

/// Walks the local tree into relative forward-slash paths. A missing
/// directory is an empty tree, not an error.
pub fn scan_local_tree(local_dir_path: &Path) -> Result<BTreeMap<String, LocalFileMeta>, FileError> {
    let mut tree = BTreeMap::new();
    if !local_dir_path.exists() {
        return Ok(tree);
    }

    let to_err = |raw_error_message: String| FileError::CannotWalkLocalDir {
        dir: local_dir_path.display().to_string(),
        raw_error_message,
    };

    for entry in WalkDir::new(local_dir_path).follow_links(true) {
        let entry = entry.map_err(|e| to_err(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative_path = entry
            .path()
            .strip_prefix(local_dir_path)
            .unwrap_or(entry.path())
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .join("/");

        let metadata = entry.metadata().map_err(|e| to_err(e.to_string()))?;
        let modified_s = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        tree.insert(
            relative_path,
            LocalFileMeta {
                size: metadata.len(),
                modified_s,
            },
        );
    }

    Ok(tree)
}

/// Reconciles both trees into the list of mutations to apply.
///
/// For paths present on both sides the source wins iff its mtime is
/// strictly greater or the sizes differ; an mtime tie with equal sizes is
/// a skip. Paths only on the source are copied over; paths only on the
/// target are removed iff `delete` is set.
pub fn plan_sync(
    local: &BTreeMap<String, LocalFileMeta>,
    remote: &BTreeMap<String, FileEntry>,
    source_of_truth: SourceOfTruth,
    delete: bool,
) -> Vec<SyncAction> {
    let paths: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut actions = vec![];

    for path in paths {
        match (local.get(path), remote.get(path)) {
            (Some(local_file), Some(remote_file)) => {
                let remote_modified_s = remote_file.last_modified.timestamp();
                let sizes_differ = local_file.size != remote_file.size;
                match source_of_truth {
                    SourceOfTruth::Local if local_file.modified_s > remote_modified_s || sizes_differ => {
                        actions.push(SyncAction::Upload { path: path.clone() })
                    }
                    SourceOfTruth::Remote if remote_modified_s > local_file.modified_s || sizes_differ => {
                        actions.push(SyncAction::Download { path: path.clone() })
                    }
                    _ => debug!("sync: {} is up to date, skipping", path),
                }
            }
            (Some(_), None) => match source_of_truth {
                SourceOfTruth::Local => actions.push(SyncAction::Upload { path: path.clone() }),
                SourceOfTruth::Remote if delete => actions.push(SyncAction::DeleteLocal { path: path.clone() }),
                SourceOfTruth::Remote => debug!("sync: {} only exists locally, keeping it", path),
            },
            (None, Some(_)) => match source_of_truth {
                SourceOfTruth::Remote => actions.push(SyncAction::Download { path: path.clone() }),
                SourceOfTruth::Local if delete => actions.push(SyncAction::DeleteRemote { path: path.clone() }),
                SourceOfTruth::Local => debug!("sync: {} only exists remotely, keeping it", path),
            },
            (None, None) => unreachable!("path comes from the union of both trees"),
        }
    }

    actions
}

fn to_local_path(local_dir_path: &Path, relative_path: &str) -> PathBuf {
    local_dir_path.join(relative_path.split('/').collect::<PathBuf>())
}

fn to_remote_path(prefix: &str, relative_path: &str) -> String {
    if prefix.is_empty() {
        relative_path.to_string()
    } else {
        format!("{prefix}/{relative_path}")
    }
}

/// Synchronises `local_dir_path` with the remote tree below
/// `remote_dir_path`. `dry` logs the planned mutations without performing
/// any I/O; `delete` removes target-side extras.
pub fn sync(
    remote: &impl RemoteFiles,
    local_dir_path: &Path,
    remote_dir_path: &str,
    source_of_truth: SourceOfTruth,
    dry: bool,
    delete: bool,
) -> Result<(), FileError> {
    let prefix = remote_dir_path.trim_matches('/');

    let remote_tree: BTreeMap<String, FileEntry> = remote
        .list(prefix)?
        .into_iter()
        .map(|entry| (relative_remote_path(prefix, &entry), entry))
        .collect();
    let local_tree = scan_local_tree(local_dir_path)?;

    let actions = plan_sync(&local_tree, &remote_tree, source_of_truth, delete);
    info!(
        "syncing {} (source of truth: {}): {} operation(s) planned",
        remote_dir_path,
        source_of_truth,
        actions.len()
    );

    for action in actions {
        match &action {
            SyncAction::Upload { path } => {
                if dry {
                    info!("(dry run) would upload {}", path);
                    continue;
                }
                info!("uploading {}", path);
                remote.upload_file(&to_local_path(local_dir_path, path), &to_remote_path(prefix, path))?;
            }
            SyncAction::Download { path } => {
                if dry {
                    info!("(dry run) would download {}", path);
                    continue;
                }
                info!("downloading {}", path);
                let entry = remote_tree
                    .get(path)
                    .expect("download actions only exist for listed remote files");
                remote.download_file(&entry.url, &to_local_path(local_dir_path, path), entry.last_modified)?;
            }
            SyncAction::DeleteLocal { path } => {
                if dry {
                    info!("(dry run) would delete local file {}", path);
                    continue;
                }
                info!("deleting local file {}", path);
                fs::remove_file(to_local_path(local_dir_path, path)).map_err(|e| FileError::CannotRemoveLocalFile {
                    file: path.clone(),
                    raw_error_message: e.to_string(),
                })?;
            }
            SyncAction::DeleteRemote { path } => {
                if dry {
                    info!("(dry run) would delete remote file {}", path);
                    continue;
                }
                info!("deleting remote file {}", path);
                remote.delete_file(&to_remote_path(prefix, path))?;
            }
        }
    }

    Ok(())
}
