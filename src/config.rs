use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::{PollingConfig, RunnerJobsFilters};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file `{path}`: {raw_error_message}")]
    CannotReadFile { path: String, raw_error_message: String },

    #[error("unsupported config file extension: `{extension}`")]
    UnsupportedExtension { extension: String },

    #[error("cannot parse config: {raw_error_message}")]
    Parse { raw_error_message: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum EntryPoint {
    #[serde(rename = "QUEUE")]
    #[strum(serialize = "QUEUE")]
    Queue,
    #[serde(rename = "JOB")]
    #[strum(serialize = "JOB")]
    Job,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum RunnerType {
    #[serde(rename = "K8S_JOB")]
    #[strum(serialize = "K8S_JOB")]
    K8sJob,
    #[serde(rename = "SUBPROCESS")]
    #[strum(serialize = "SUBPROCESS")]
    Subprocess,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Host {
    #[serde(rename = "ASKUI")]
    #[strum(serialize = "ASKUI")]
    Askui,
    #[serde(rename = "SELF")]
    #[strum(serialize = "SELF")]
    SelfHosted,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "ERROR")]
    Error,
}

impl LogLevel {
    pub fn tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceCredentials {
    pub workspace_id: String,
    pub access_token: String,
}

/// Feature toggles governing the phases of the job executor pipeline.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureToggles {
    pub setup: bool,
    pub download_workflows: bool,
    pub run_workflows: bool,
    pub upload_results: bool,
    pub teardown: bool,
    pub wait_for_controller: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        FeatureToggles {
            setup: true,
            download_workflows: true,
            run_workflows: true,
            upload_results: true,
            teardown: true,
            wait_for_controller: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            host: "127.0.0.1".to_string(),
            port: 6769,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// ID the queue knows this runner by.
    pub id: String,
    /// Command used to spawn the child worker process.
    pub exec: String,
    /// Only jobs from schedules with matching tags are leased.
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub kind: RunnerType,
    pub host: Host,
    /// Directory of the Node.js project template copied into the per-job workspace.
    pub project_dir: String,
    pub workflows_dir: String,
    pub results_dir: String,
    pub schedule_results_dir: Option<String>,
    pub command: String,
    pub controller: ControllerConfig,
    pub enable: FeatureToggles,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            id: Uuid::new_v4().to_string(),
            exec: "askui-runner".to_string(),
            tags: vec![],
            kind: RunnerType::Subprocess,
            host: Host::SelfHosted,
            project_dir: "project_template".to_string(),
            workflows_dir: "workflows".to_string(),
            results_dir: "results-allure".to_string(),
            schedule_results_dir: None,
            command: "npx jest --config jest.config.ts".to_string(),
            controller: ControllerConfig::default(),
            enable: FeatureToggles::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerResourcesConfig {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl Default for ContainerResourcesConfig {
    fn default() -> Self {
        let resources: BTreeMap<String, String> = [
            ("cpu".to_string(), "500m".to_string()),
            ("memory".to_string(), "1Gi".to_string()),
        ]
        .into_iter()
        .collect();

        ContainerResourcesConfig {
            requests: resources.clone(),
            limits: resources,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default)]
    pub resources: ContainerResourcesConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct K8sToleration {
    pub key: Option<String>,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub effect: Option<String>,
    pub toleration_seconds: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct K8sJobRunnerConfig {
    pub namespace: String,
    /// Size of the memory-backed emptyDir mounted at /dev/shm in both containers.
    pub shared_memory: String,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Vec<K8sToleration>,
    pub runner_container: ContainerConfig,
    pub controller_container: ContainerConfig,
}

impl Default for K8sJobRunnerConfig {
    fn default() -> Self {
        K8sJobRunnerConfig {
            namespace: "dev".to_string(),
            shared_memory: "1Gi".to_string(),
            node_selector: None,
            tolerations: vec![],
            runner_container: ContainerConfig {
                image: "askuigmbh/askui-runner:latest".to_string(),
                resources: ContainerResourcesConfig::default(),
            },
            controller_container: ContainerConfig {
                image: "askuigmbh/askui-ui-controller:v0.11.2-chrome-100.0.4896.60-amd64".to_string(),
                resources: ContainerResourcesConfig::default(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_api_url")]
    pub api_url: String,
    /// Keep polling after an empty lease instead of exiting.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Interval in seconds between two lease attempts when the queue is empty.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    pub credentials: Option<WorkspaceCredentials>,
    #[serde(default)]
    pub k8s_job_runner: K8sJobRunnerConfig,
}

fn default_queue_api_url() -> String {
    "https://app-gateway-api.askui.com/prod/api/v1/workspaces/{workspace_id}/runner-jobs".to_string()
}

fn default_keep_alive() -> bool {
    true
}

fn default_polling_interval() -> u64 {
    30
}

/// Payload of a leased job, forwarded verbatim to the child runtime.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunnerJobData {
    pub credentials: WorkspaceCredentials,
    /// Remote workflow path prefixes to download before the run.
    pub workflows: Vec<String>,
    pub results_api_url: String,
    pub workflows_api_url: String,
    pub inference_api_url: String,
    #[serde(default)]
    pub schedule_results_api_url: Option<String>,
    /// Free-form blob written to data.json in the job workspace.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default = "default_entrypoint")]
    pub entrypoint: EntryPoint,
    #[serde(default)]
    pub runner: RunnerConfig,
    pub queue: Option<QueueConfig>,
    pub job: Option<RunnerJobData>,
    /// Seconds a job may run before it is stopped and reported failed.
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

fn default_entrypoint() -> EntryPoint {
    EntryPoint::Queue
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Config {
    /// Cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.entrypoint {
            EntryPoint::Queue => {
                let queue = self.queue.as_ref().ok_or_else(|| ConfigError::Invalid {
                    reason: "queue configuration must be given when entrypoint is QUEUE".to_string(),
                })?;
                if self.runner.host == Host::SelfHosted && queue.credentials.is_none() {
                    return Err(ConfigError::Invalid {
                        reason: "queue credentials must be given when the runner is SELF hosted".to_string(),
                    });
                }
            }
            EntryPoint::Job => {
                if self.job.is_none() {
                    return Err(ConfigError::Invalid {
                        reason: "job data must be given when entrypoint is JOB".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Substitutes the `{workspace_id}` placeholder of the queue API url
    /// with the configured workspace.
    pub fn resolve_queue_api_url(&mut self) {
        if let Some(queue) = self.queue.as_mut() {
            if let Some(credentials) = &queue.credentials {
                queue.api_url = queue.api_url.replace("{workspace_id}", &credentials.workspace_id);
            }
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        let queue = self.queue.as_ref();
        PollingConfig {
            filters: RunnerJobsFilters {
                tags: self.runner.tags.clone(),
                runner_id: self.runner.id.clone(),
                runner_host: self.runner.host,
                workspace_id: queue
                    .and_then(|q| q.credentials.as_ref())
                    .map(|c| c.workspace_id.clone()),
            },
            job_timeout: self.job_timeout,
            keep_alive: queue.map(|q| q.keep_alive).unwrap_or(false),
            polling_interval: queue.map(|q| q.polling_interval).unwrap_or(default_polling_interval()),
        }
    }

    /// Derives the config handed to a child worker executing a single job.
    pub fn derive_job_config(&self, job_data: RunnerJobData) -> Config {
        Config {
            entrypoint: EntryPoint::Job,
            runner: RunnerConfig {
                kind: RunnerType::Subprocess,
                ..self.runner.clone()
            },
            queue: None,
            job: Some(job_data),
            job_timeout: self.job_timeout,
            log_level: self.log_level,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AgentFileSyncConfig {
    /// Base URL of the files API.
    pub base_url: String,
    /// Local directory agents are synced under.
    pub local_storage_base_dir: PathBuf,
}

impl Default for AgentFileSyncConfig {
    fn default() -> Self {
        AgentFileSyncConfig {
            base_url: "https://workspaces.askui.com/api/v1/files/".to_string(),
            local_storage_base_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".askui"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AgentsConfig {
    pub credentials: WorkspaceCredentials,
    #[serde(default)]
    pub sync: AgentFileSyncConfig,
}

/// Reads a config from either an inline JSON string (detected by a leading
/// `{`) or a `.json`/`.yaml`/`.yml` file path.
pub fn read_config_value(config_json_or_file_path: &str) -> Result<serde_json::Value, ConfigError> {
    if config_json_or_file_path.trim_start().starts_with('{') {
        return serde_json::from_str(config_json_or_file_path).map_err(|e| ConfigError::Parse {
            raw_error_message: e.to_string(),
        });
    }

    let path = Path::new(config_json_or_file_path);
    let content = fs::read_to_string(path).map_err(|e| ConfigError::CannotReadFile {
        path: config_json_or_file_path.to_string(),
        raw_error_message: e.to_string(),
    })?;

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match extension {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            raw_error_message: e.to_string(),
        }),
        "json" => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            raw_error_message: e.to_string(),
        }),
        _ => Err(ConfigError::UnsupportedExtension {
            extension: extension.to_string(),
        }),
    }
}

pub fn read_config(config_json_or_file_path: &str) -> Result<Config, ConfigError> {
    let value = read_config_value(config_json_or_file_path)?;
    let mut config: Config = serde_json::from_value(value).map_err(|e| ConfigError::Parse {
        raw_error_message: e.to_string(),
    })?;
    config.validate()?;
    config.resolve_queue_api_url();
    Ok(config)
}

pub fn read_agents_config(config_json_or_file_path: &str) -> Result<AgentsConfig, ConfigError> {
    let value = read_config_value(config_json_or_file_path)?;
    serde_json::from_value(value).map_err(|e| ConfigError::Parse {
        raw_error_message: e.to_string(),
    })
}

#[cfg(test)]
impl Config {
    /// Minimal QUEUE-mode config for runner and supervisor tests.
    pub(crate) fn queue_fixture() -> Config {
        let mut config: Config = serde_json::from_str(
            r#"{
                "entrypoint": "QUEUE",
                "runner": {"id": "runner-1", "type": "SUBPROCESS"},
                "queue": {
                    "api_url": "https://queue.askui.com/workspaces/{workspace_id}/runner-jobs",
                    "credentials": {"workspace_id": "w-1", "access_token": "t-1"}
                }
            }"#,
        )
        .expect("fixture config must parse");
        config.resolve_queue_api_url();
        config
    }
}
