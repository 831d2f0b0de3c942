use std::path::{Path, PathBuf};

use crate::files::{FileError, FilesService};

pub trait ResultsUpload {
    fn upload(&self, workspace_dir: &Path) -> Result<(), FileError>;
}

pub(crate) fn resolve_dir(workspace_dir: &Path, dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir.join(path)
    }
}

/// Uploads a results directory if the run produced one.
pub struct DirResultsUpload {
    files: FilesService,
    results_dir: String,
}

impl DirResultsUpload {
    pub fn new(files: FilesService, results_dir: String) -> Self {
        DirResultsUpload { files, results_dir }
    }
}

impl ResultsUpload for DirResultsUpload {
    fn upload(&self, workspace_dir: &Path) -> Result<(), FileError> {
        let results_dir = resolve_dir(workspace_dir, &self.results_dir);
        if !results_dir.exists() {
            info!("results directory {} does not exist, nothing to upload", results_dir.display());
            return Ok(());
        }

        self.files.upload(&results_dir, "")
    }
}

/// Fans the upload out to every link; a failing link is logged and does
/// not short-circuit its siblings.
pub struct ChainedResultsUpload {
    services: Vec<Box<dyn ResultsUpload>>,
}

impl ChainedResultsUpload {
    pub fn new(services: Vec<Box<dyn ResultsUpload>>) -> Self {
        ChainedResultsUpload { services }
    }
}

impl ResultsUpload for ChainedResultsUpload {
    fn upload(&self, workspace_dir: &Path) -> Result<(), FileError> {
        for service in &self.services {
            if let Err(err) = service.upload(workspace_dir) {
                error!("cannot upload results: {}", err);
            }
        }

        Ok(())
    }
}
