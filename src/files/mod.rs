pub mod sync;

use std::fs::{self, FileTimes};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use retry::OperationResult;
use retry::delay::Exponential;
use serde_derive::Deserialize;

use crate::utilities::get_header_with_basic_token;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Uploads can carry large result artifacts (videos, traces).
pub const UPLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

const RETRY_ATTEMPTS: usize = 5;
const DOWNLOAD_CHUNK_SIZE: usize = 1024;
const LIST_PAGE_LIMIT: &str = "100";

// Internal bookkeeping of the platform, never synced to a runner.
static HIDDEN_FILES_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![Regex::new(r"^workspaces/[^/]+/test-cases/\.askui/.+$").expect("hidden files pattern must compile")]
});

#[derive(thiserror::Error, Debug)]
pub enum FileError {
    #[error("cannot instantiate files client: {raw_error_message}")]
    CannotCreateClient { raw_error_message: String },

    #[error("cannot list remote files with prefix `{prefix}`: {raw_error_message}")]
    CannotListFiles { prefix: String, raw_error_message: String },

    #[error("cannot upload file `{file}`: {raw_error_message}")]
    CannotUploadFile { file: String, raw_error_message: String },

    #[error("cannot download file `{file}`: {raw_error_message}")]
    CannotDownloadFile { file: String, raw_error_message: String },

    #[error("cannot delete remote file `{file}`: {raw_error_message}")]
    CannotDeleteFile { file: String, raw_error_message: String },

    #[error("cannot walk local directory `{dir}`: {raw_error_message}")]
    CannotWalkLocalDir { dir: String, raw_error_message: String },

    #[error("cannot remove local file `{file}`: {raw_error_message}")]
    CannotRemoveLocalFile { file: String, raw_error_message: String },
}

/// One remote file as returned by the paginated listing. Reconciliation
/// works on the relative path plus (mtime, size); content is never hashed.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    pub url: String,
}

#[derive(Deserialize, Debug)]
struct FilesListResponse {
    data: Vec<FileEntry>,
    next_continuation_token: Option<String>,
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

fn retry_delays() -> impl Iterator<Item = Duration> {
    Exponential::from_millis_with_factor(1_000, 2.0).take(RETRY_ATTEMPTS - 1)
}

pub(crate) fn encode_remote_path(remote_path: &str) -> String {
    remote_path.split('/').map(|segment| urlencoding::encode(segment)).join("/")
}

pub(crate) fn is_hidden_file(remote_path: &str) -> bool {
    HIDDEN_FILES_PATTERNS.iter().any(|pattern| pattern.is_match(remote_path))
}

/// Path of `entry` relative to the listed `prefix`. A listing of a single
/// file resolves to the file name so it lands directly in the target dir.
pub(crate) fn relative_remote_path(prefix: &str, entry: &FileEntry) -> String {
    if prefix == entry.path {
        return entry.name.clone();
    }

    match entry.path.strip_prefix(prefix) {
        Some(rest) => rest.trim_start_matches('/').to_string(),
        None => entry.path.trim_start_matches('/').to_string(),
    }
}

pub(crate) fn set_file_mtime(path: &Path, last_modified: DateTime<Utc>) -> std::io::Result<()> {
    let timestamp = last_modified.timestamp().max(0) as u64;
    let mtime = UNIX_EPOCH + Duration::from_secs(timestamp);
    let file = fs::File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_modified(mtime))
}

/// Client of the workspace files API: paginated listing, retried transfers.
pub struct FilesService {
    disabled: bool,
    base_url: String,
    http_client: reqwest::blocking::Client,
    upload_client: reqwest::blocking::Client,
}

impl FilesService {
    /// An empty base url yields a disabled no-op service, so optional
    /// upload targets (e.g. schedule results) can share the code path.
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, FileError> {
        let to_err = |e: reqwest::Error| FileError::CannotCreateClient {
            raw_error_message: e.to_string(),
        };

        let http_client = reqwest::blocking::Client::builder()
            .default_headers(get_header_with_basic_token(access_token))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(to_err)?;
        let upload_client = reqwest::blocking::Client::builder()
            .default_headers(get_header_with_basic_token(access_token))
            .timeout(UPLOAD_REQUEST_TIMEOUT)
            .build()
            .map_err(to_err)?;

        Ok(FilesService {
            disabled: base_url.is_empty(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            upload_client,
        })
    }

    fn list_page(&self, prefix: &str, continuation_token: Option<&str>) -> Result<FilesListResponse, String> {
        let result = retry::retry(retry_delays(), || {
            let mut request = self.http_client.get(&self.base_url).query(&[
                ("prefix", prefix),
                ("limit", LIST_PAGE_LIMIT),
                ("expand", "url"),
            ]);
            if let Some(token) = continuation_token {
                request = request.query(&[("continuation_token", token)]);
            }

            let response = match request.send() {
                Ok(response) => response,
                Err(err) => return OperationResult::Retry(err.to_string()),
            };

            let status = response.status();
            if status == reqwest::StatusCode::OK {
                match response.json::<FilesListResponse>() {
                    Ok(page) => OperationResult::Ok(page),
                    Err(err) => OperationResult::Err(format!("cannot parse listing response: {err}")),
                }
            } else if is_transient_status(status) {
                OperationResult::Retry(format!("transient status {status} while listing"))
            } else {
                let body = response.text().unwrap_or_default();
                OperationResult::Err(format!("status {status} while listing: {body}"))
            }
        });

        result.map_err(|retry::Error { error, .. }| error)
    }

    /// Lists every remote file below `prefix`, following continuation
    /// tokens and dropping hidden platform files.
    pub fn list(&self, prefix: &str) -> Result<Vec<FileEntry>, FileError> {
        if self.disabled {
            return Ok(vec![]);
        }

        let mut entries = vec![];
        let mut continuation_token: Option<String> = None;
        loop {
            let page =
                self.list_page(prefix, continuation_token.as_deref())
                    .map_err(|raw_error_message| FileError::CannotListFiles {
                        prefix: prefix.to_string(),
                        raw_error_message,
                    })?;

            entries.extend(page.data.into_iter().filter(|entry| !is_hidden_file(&entry.path)));

            continuation_token = page.next_continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(entries)
    }

    pub fn upload_file(&self, local_file_path: &Path, remote_file_path: &str) -> Result<(), FileError> {
        if self.disabled {
            return Ok(());
        }

        let url = format!("{}/{}", self.base_url, encode_remote_path(remote_file_path));
        debug!("uploading {} to {}", local_file_path.display(), remote_file_path);

        let result = retry::retry(retry_delays(), || {
            let file = match fs::File::open(local_file_path) {
                Ok(file) => file,
                Err(err) => return OperationResult::Err(err.to_string()),
            };

            match self.upload_client.put(&url).body(file).send() {
                // any non-200 is retried, large uploads fail in creative ways
                Ok(response) if response.status() == reqwest::StatusCode::OK => OperationResult::Ok(()),
                Ok(response) => OperationResult::Retry(format!("status {} while uploading", response.status())),
                Err(err) => OperationResult::Retry(err.to_string()),
            }
        });

        result.map_err(|retry::Error { error, .. }| FileError::CannotUploadFile {
            file: remote_file_path.to_string(),
            raw_error_message: error,
        })
    }

    /// Streams the server-provided `url` to `local_file_path` and stamps the
    /// file with the remote modification time, so a later sync can compare.
    pub fn download_file(&self, url: &str, local_file_path: &Path, last_modified: DateTime<Utc>) -> Result<(), FileError> {
        let to_err = |raw_error_message: String| FileError::CannotDownloadFile {
            file: local_file_path.display().to_string(),
            raw_error_message,
        };

        let parent = local_file_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(|e| to_err(e.to_string()))?;

        let result = retry::retry(retry_delays(), || {
            let mut response = match self.http_client.get(url).send() {
                Ok(response) => response,
                Err(err) => return OperationResult::Retry(err.to_string()),
            };

            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return if is_transient_status(status) {
                    OperationResult::Retry(format!("transient status {status} while downloading"))
                } else {
                    OperationResult::Err(format!("status {status} while downloading"))
                };
            }

            let mut tmp_file = match tempfile::NamedTempFile::new_in(parent) {
                Ok(file) => file,
                Err(err) => return OperationResult::Err(err.to_string()),
            };

            let mut chunk = [0u8; DOWNLOAD_CHUNK_SIZE];
            loop {
                match response.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(err) = tmp_file.write_all(&chunk[..n]) {
                            return OperationResult::Err(err.to_string());
                        }
                    }
                    Err(err) => return OperationResult::Retry(err.to_string()),
                }
            }

            match tmp_file.persist(local_file_path) {
                Ok(_) => OperationResult::Ok(()),
                Err(err) => OperationResult::Err(err.to_string()),
            }
        });

        result.map_err(|retry::Error { error, .. }| to_err(error))?;
        set_file_mtime(local_file_path, last_modified).map_err(|e| to_err(e.to_string()))
    }

    pub fn delete_file(&self, remote_file_path: &str) -> Result<(), FileError> {
        if self.disabled {
            return Ok(());
        }

        let url = format!("{}/{}", self.base_url, encode_remote_path(remote_file_path));
        let result = retry::retry(retry_delays(), || {
            let response = match self.http_client.delete(&url).send() {
                Ok(response) => response,
                Err(err) => return OperationResult::Retry(err.to_string()),
            };

            let status = response.status();
            if status.is_success() {
                OperationResult::Ok(())
            } else if is_transient_status(status) {
                OperationResult::Retry(format!("transient status {status} while deleting"))
            } else {
                let body = response.text().unwrap_or_default();
                OperationResult::Err(format!("status {status} while deleting: {body}"))
            }
        });

        result.map_err(|retry::Error { error, .. }| FileError::CannotDeleteFile {
            file: remote_file_path.to_string(),
            raw_error_message: error,
        })
    }

    /// Downloads everything below `remote_path` into `local_dir_path`, with
    /// the prefix stripped from the local layout.
    pub fn download(&self, local_dir_path: &Path, remote_path: &str) -> Result<(), FileError> {
        if self.disabled {
            return Ok(());
        }

        let prefix = remote_path.trim_start_matches('/');
        for entry in self.list(prefix)? {
            let relative_path = relative_remote_path(prefix, &entry);
            let local_file_path: std::path::PathBuf =
                local_dir_path.join(relative_path.split('/').collect::<std::path::PathBuf>());
            self.download_file(&entry.url, &local_file_path, entry.last_modified)?;
        }

        Ok(())
    }

    /// Uploads a file or a whole directory tree below `remote_dir_path`.
    pub fn upload(&self, local_path: &Path, remote_dir_path: &str) -> Result<(), FileError> {
        if self.disabled {
            return Ok(());
        }

        let remote_dir = remote_dir_path.trim_end_matches('/');
        if !local_path.is_dir() {
            let file_name = local_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            return self.upload_file(local_path, &format!("{remote_dir}/{file_name}"));
        }

        for entry in walkdir::WalkDir::new(local_path)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative_path = entry
                .path()
                .strip_prefix(local_path)
                .unwrap_or(entry.path())
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .join("/");
            let remote_file_path = if remote_dir.is_empty() {
                relative_path
            } else {
                format!("{remote_dir}/{relative_path}")
            };
            self.upload_file(entry.path(), &remote_file_path)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_remote_path_keeps_separators() {
        assert_eq!(
            encode_remote_path("workspaces/w 1/test-cases/smoke.ts"),
            "workspaces/w%201/test-cases/smoke.ts"
        );
    }

    #[test]
    fn test_hidden_files_are_filtered() {
        assert!(is_hidden_file("workspaces/w-1/test-cases/.askui/settings.json"));
        assert!(!is_hidden_file("workspaces/w-1/test-cases/smoke/workflow.ts"));
        assert!(!is_hidden_file("workspaces/w-1/agents/.askui/settings.json"));
    }

    #[test]
    fn test_listing_response_parses_iso_timestamps() {
        let payload = r#"{
            "data": [{
                "name": "workflow.ts",
                "path": "workspaces/w-1/test-cases/smoke/workflow.ts",
                "lastModified": "2024-05-02T10:30:00Z",
                "size": 42,
                "url": "https://files.askui.com/signed/workflow.ts"
            }],
            "next_continuation_token": "token-2"
        }"#;

        let response: FilesListResponse = serde_json::from_str(payload).expect("listing payload must parse");
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].size, 42);
        assert_eq!(response.data[0].last_modified.timestamp(), 1714645800);
        assert_eq!(response.next_continuation_token.as_deref(), Some("token-2"));
    }

    #[test]
    fn test_relative_remote_path() {
        let entry = FileEntry {
            name: "workflow.ts".to_string(),
            path: "workspaces/w-1/test-cases/smoke/workflow.ts".to_string(),
            size: 1,
            last_modified: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            url: "https://files.askui.com/signed".to_string(),
        };

        // prefix of a directory
        assert_eq!(
            relative_remote_path("workspaces/w-1/test-cases", &entry),
            "smoke/workflow.ts"
        );
        // prefix of the file itself
        assert_eq!(
            relative_remote_path("workspaces/w-1/test-cases/smoke/workflow.ts", &entry),
            "workflow.ts"
        );
    }

    #[test]
    fn test_set_file_mtime() {
        let dir = tempfile::TempDir::new().expect("error creating temporary dir");
        let path = dir.path().join("file.txt");
        fs::write(&path, "content").unwrap();

        let last_modified = DateTime::<Utc>::from_timestamp(1714645800, 0).unwrap();
        set_file_mtime(&path, last_modified).expect("mtime must be set");

        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        let seconds = modified.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(seconds, 1714645800);
    }

    #[test]
    fn test_disabled_service_is_a_no_op() {
        let service = FilesService::new("", "t-1").expect("client must build");
        assert!(service.list("workspaces/w-1").unwrap().is_empty());
        assert!(service.upload(Path::new("/nowhere"), "").is_ok());
        assert!(service.download(Path::new("/nowhere"), "workspaces/w-1").is_ok());
        assert!(service.delete_file("workspaces/w-1/file").is_ok());
    }
}
