use std::path::{Path, PathBuf};

use crate::files::{FileError, FilesService};

/// Downloads the configured remote workflow prefixes into the local
/// workflows directory.
pub struct WorkflowsDownloadService {
    files: FilesService,
    remote_workflows_paths: Vec<String>,
}

impl WorkflowsDownloadService {
    pub fn new(files: FilesService, remote_workflows_paths: Vec<String>) -> Self {
        WorkflowsDownloadService {
            files,
            remote_workflows_paths,
        }
    }

    pub fn download(&self, workflows_dir: &Path) -> Result<(), FileError> {
        for remote_workflows_path in &self.remote_workflows_paths {
            let local_dir = local_dir_for(workflows_dir, remote_workflows_path);
            info!("downloading workflows {} into {}", remote_workflows_path, local_dir.display());
            self.files.download(&local_dir, remote_workflows_path)?;
        }

        Ok(())
    }
}

/// Maps a remote prefix of the form
/// `workspaces/{workspace_id}/test-cases/{workflows_path}` to a directory
/// below `workflows_dir`, so prefixes of different workspaces cannot
/// override each other. A trailing `*.ts` component is stripped so a
/// single-file prefix resolves to its containing directory.
pub(crate) fn local_dir_for(workflows_dir: &Path, remote_path: &str) -> PathBuf {
    let mut components: Vec<&str> = remote_path.trim_matches('/').split('/').skip(3).collect();
    if components.last().map(|c| c.ends_with(".ts")).unwrap_or(false) {
        components.pop();
    }

    workflows_dir.join(components.iter().collect::<PathBuf>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_dir_for_directory_prefix() {
        assert_eq!(
            local_dir_for(Path::new("workflows"), "workspaces/w-1/test-cases/smoke/checkout"),
            PathBuf::from("workflows/smoke/checkout")
        );
    }

    #[test]
    fn test_local_dir_for_single_file_prefix_strips_file() {
        assert_eq!(
            local_dir_for(Path::new("workflows"), "/workspaces/w-1/test-cases/smoke/login.ts"),
            PathBuf::from("workflows/smoke")
        );
    }

    #[test]
    fn test_local_dir_for_workspace_root_prefix() {
        assert_eq!(
            local_dir_for(Path::new("workflows"), "workspaces/w-1/test-cases"),
            PathBuf::from("workflows")
        );
    }
}
