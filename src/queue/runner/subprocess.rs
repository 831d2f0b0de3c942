use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::{Child, Command};
use std::time::Duration;

use tempfile::TempPath;

use crate::cmd::command::terminate_gracefully;
use crate::config::Config;
use crate::queue::RunnerJob;
use crate::queue::runner::{Runner, RunnerError};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Runs a job as a child worker process, handing it the derived per-job
/// config through a temp file (`<exec> --config <path>`).
pub struct SubprocessRunner {
    runner_exec: String,
    base_config: Config,
    process: Option<Child>,
    // keeps the config file alive (and removed on drop) for the child's lifetime
    config_file: Option<TempPath>,
}

impl SubprocessRunner {
    pub fn new(runner_exec: String, base_config: Config) -> Self {
        SubprocessRunner {
            runner_exec,
            base_config,
            process: None,
            config_file: None,
        }
    }

    /// Writes the derived job config to a temp file only readable by the
    /// current user, as it carries the workspace credentials.
    fn create_config_file(&self, job: &RunnerJob) -> Result<TempPath, RunnerError> {
        let to_err = |raw_error_message: String| RunnerError::CannotWriteConfig { raw_error_message };

        let job_config = self.base_config.derive_job_config(job.data.clone());
        let mut config_file = tempfile::Builder::new()
            .prefix("askui-runner-job-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| to_err(e.to_string()))?;

        let mut permissions = config_file
            .as_file()
            .metadata()
            .map_err(|e| to_err(e.to_string()))?
            .permissions();
        permissions.set_mode(0o600);
        config_file
            .as_file()
            .set_permissions(permissions)
            .map_err(|e| to_err(e.to_string()))?;

        let content = serde_json::to_vec(&job_config).map_err(|e| to_err(e.to_string()))?;
        config_file.write_all(&content).map_err(|e| to_err(e.to_string()))?;

        Ok(config_file.into_temp_path())
    }

    fn exit_code(&mut self) -> Option<i32> {
        let process = self.process.as_mut()?;
        match process.try_wait() {
            Ok(Some(status)) => status.code(),
            Ok(None) => None,
            Err(err) => {
                error!("cannot poll runner process: {}", err);
                None
            }
        }
    }
}

impl Runner for SubprocessRunner {
    fn start(&mut self, job: &RunnerJob) -> Result<(), RunnerError> {
        let config_file = self.create_config_file(job)?;

        let mut parts = self.runner_exec.split_whitespace();
        let binary = parts.next().ok_or_else(|| RunnerError::CannotSpawn {
            exec: self.runner_exec.clone(),
            raw_error_message: "runner exec is empty".to_string(),
        })?;

        let mut command = Command::new(binary);
        command.args(parts).arg("--config").arg(config_file.as_os_str());

        info!("starting job {} as subprocess: {:?}", job.id, command);
        let process = command.spawn().map_err(|e| RunnerError::CannotSpawn {
            exec: self.runner_exec.clone(),
            raw_error_message: e.to_string(),
        })?;

        self.process = Some(process);
        self.config_file = Some(config_file);
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        if self.process.is_none() {
            return false;
        }
        matches!(self.process.as_mut().unwrap().try_wait(), Ok(None))
    }

    fn has_passed(&mut self) -> bool {
        self.exit_code() == Some(0)
    }

    fn has_failed(&mut self) -> bool {
        matches!(self.exit_code(), Some(code) if code > 0)
    }

    fn stop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            if let Ok(None) = process.try_wait() {
                terminate_gracefully(process, STOP_GRACE_PERIOD);
            }
        }
    }
}
