use std::path::PathBuf;

use crate::config::AgentsConfig;
use crate::files::sync::{SourceOfTruth, sync};
use crate::files::{FileError, FilesService};

/// Keeps the local agents directory of a workspace in sync with the files
/// API (`askui-runner agent sync <down|up>`).
pub struct AgentsFileService {
    files: FilesService,
    local_storage_base_dir: PathBuf,
    workspace_id: String,
}

impl AgentsFileService {
    pub fn new(config: &AgentsConfig) -> Result<Self, FileError> {
        let files = FilesService::new(&config.sync.base_url, &config.credentials.access_token)?;

        Ok(AgentsFileService {
            files,
            local_storage_base_dir: config.sync.local_storage_base_dir.clone(),
            workspace_id: config.credentials.workspace_id.clone(),
        })
    }

    fn remote_agents_path(&self) -> String {
        format!("workspaces/{}/agents", self.workspace_id)
    }

    // namespaced by workspace so two workspaces cannot override each other
    fn local_agents_dir(&self) -> PathBuf {
        self.local_storage_base_dir
            .join("Workspaces")
            .join(&self.workspace_id)
            .join("Agents")
    }

    pub fn sync(&self, source_of_truth: SourceOfTruth, dry: bool, delete: bool) -> Result<(), FileError> {
        sync(
            &self.files,
            &self.local_agents_dir(),
            &self.remote_agents_path(),
            source_of_truth,
            dry,
            delete,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentFileSyncConfig, WorkspaceCredentials};

    fn config_fixture() -> AgentsConfig {
        AgentsConfig {
            credentials: WorkspaceCredentials {
                workspace_id: "w-1".to_string(),
                access_token: "t-1".to_string(),
            },
            sync: AgentFileSyncConfig {
                base_url: "".to_string(),
                local_storage_base_dir: PathBuf::from("/home/user/.askui"),
            },
        }
    }

    #[test]
    fn test_agents_paths() {
        let service = AgentsFileService::new(&config_fixture()).expect("service must build");
        assert_eq!(service.remote_agents_path(), "workspaces/w-1/agents");
        assert_eq!(
            service.local_agents_dir(),
            PathBuf::from("/home/user/.askui/Workspaces/w-1/Agents")
        );
    }
}
