use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cmd::command::{CommandError, CommandKiller, RunnerCommand};
use crate::config::{Config, RunnerJobData};
use crate::files::{FileError, FilesService};
use crate::fs::{copy_dir_contents, create_and_open};
use crate::results::{ChainedResultsUpload, DirResultsUpload, ResultsUpload};
use crate::template::{TemplateError, render_template_files};
use crate::workflows::WorkflowsDownloadService;

const CONTROLLER_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const CONTROLLER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("no job data given, cannot execute a job")]
    MissingJobData,

    #[error("cannot prepare job workspace: {raw_error_message}")]
    Workspace { raw_error_message: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Files(#[from] FileError),

    #[error("cannot run workflows command `{command}`: {raw_error_message}")]
    Command { command: String, raw_error_message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunWorkflowsResult {
    Passed,
    Failed,
}

impl RunWorkflowsResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunWorkflowsResult::Passed => 0,
            RunWorkflowsResult::Failed => 1,
        }
    }
}

/// Child-side phase pipeline for one job:
/// setup -> download workflows -> run -> upload results -> teardown,
/// each phase governed by its feature toggle.
pub struct JobExecutor {
    config: Config,
    job: RunnerJobData,
    workflows: WorkflowsDownloadService,
    results: ChainedResultsUpload,
}

impl JobExecutor {
    pub fn from_config(config: Config) -> Result<Self, ExecutorError> {
        let job = config.job.clone().ok_or(ExecutorError::MissingJobData)?;
        let access_token = &job.credentials.access_token;

        let workflows = WorkflowsDownloadService::new(
            FilesService::new(&job.workflows_api_url, access_token)?,
            job.workflows.clone(),
        );

        let mut upload_links: Vec<Box<dyn ResultsUpload>> = vec![Box::new(DirResultsUpload::new(
            FilesService::new(&job.results_api_url, access_token)?,
            config.runner.results_dir.clone(),
        ))];
        if let Some(schedule_results_api_url) = &job.schedule_results_api_url {
            let schedule_results_dir = config
                .runner
                .schedule_results_dir
                .clone()
                .unwrap_or_else(|| config.runner.results_dir.clone());
            upload_links.push(Box::new(DirResultsUpload::new(
                FilesService::new(schedule_results_api_url, access_token)?,
                schedule_results_dir,
            )));
        }

        Ok(JobExecutor {
            job,
            workflows,
            results: ChainedResultsUpload::new(upload_links),
            config,
        })
    }

    pub fn run(&self) -> Result<RunWorkflowsResult, ExecutorError> {
        let workspace = tempfile::Builder::new()
            .prefix("askui-runner-")
            .tempdir()
            .map_err(|e| ExecutorError::Workspace {
                raw_error_message: e.to_string(),
            })?;

        info!("executing job in workspace {}", workspace.path().display());
        let enable = self.config.runner.enable;

        // teardown happens on scope exit, also when a phase bails out early;
        // without the teardown toggle the workspace survives for inspection
        let workspace = scopeguard::guard(workspace, move |workspace| {
            if enable.teardown {
                info!("tearing down job workspace {}", workspace.path().display());
            } else {
                let kept = workspace.keep();
                info!("keeping job workspace at {}", kept.display());
            }
        });

        let mut result = RunWorkflowsResult::Passed;
        if enable.setup {
            self.setup(workspace.path())?;
        }
        if enable.download_workflows {
            self.download_workflows(workspace.path())?;
        }
        if enable.run_workflows {
            result = self.run_workflows(workspace.path())?;
        }
        if enable.upload_results {
            self.upload_results(workspace.path());
        }

        Ok(result)
    }

    /// The project template ships next to the binary unless configured with
    /// an absolute path.
    fn project_dir(&self) -> PathBuf {
        let project_dir = Path::new(&self.config.runner.project_dir);
        if project_dir.is_absolute() {
            return project_dir.to_path_buf();
        }

        let entrypoint_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        entrypoint_dir.join(project_dir)
    }

    fn setup(&self, workspace_dir: &Path) -> Result<(), ExecutorError> {
        let project_dir = self.project_dir();
        info!("copying project template {} into workspace", project_dir.display());
        copy_dir_contents(&project_dir, workspace_dir, true).map_err(|e| ExecutorError::Workspace {
            raw_error_message: e.to_string(),
        })?;

        let context = tera::Context::from_serialize(&self.config).map_err(|e| {
            TemplateError::Render {
                template: "config context".to_string(),
                raw_error_message: e.to_string(),
            }
        })?;
        render_template_files(&project_dir, workspace_dir, &context)?;

        let data_file = create_and_open(&workspace_dir.join("data.json")).map_err(|e| ExecutorError::Workspace {
            raw_error_message: e.to_string(),
        })?;
        serde_json::to_writer_pretty(data_file, &self.job.data).map_err(|e| ExecutorError::Workspace {
            raw_error_message: e.to_string(),
        })?;

        Ok(())
    }

    fn workflows_dir(&self, workspace_dir: &Path) -> PathBuf {
        crate::results::resolve_dir(workspace_dir, &self.config.runner.workflows_dir)
    }

    fn download_workflows(&self, workspace_dir: &Path) -> Result<(), ExecutorError> {
        self.workflows.download(&self.workflows_dir(workspace_dir))?;
        Ok(())
    }

    fn run_workflows(&self, workspace_dir: &Path) -> Result<RunWorkflowsResult, ExecutorError> {
        if self.config.runner.enable.wait_for_controller {
            wait_for_controller(&self.config.runner.controller.host, self.config.runner.controller.port);
        }

        let command_line = &self.config.runner.command;
        let mut parts = command_line.split_whitespace();
        let binary = parts.next().ok_or_else(|| ExecutorError::Command {
            command: command_line.clone(),
            raw_error_message: "command is empty".to_string(),
        })?;
        let args: Vec<&str> = parts.collect();

        let mut command = RunnerCommand::new(binary, &args, &[]);
        command.set_current_dir(workspace_dir);

        let ret = command.exec_with_abort(
            &mut |line| info!("{}", line),
            &mut |line| warn!("{}", line),
            &CommandKiller::from_timeout(Duration::from_secs(self.config.job_timeout)),
        );

        match ret {
            Ok(()) => Ok(RunWorkflowsResult::Passed),
            Err(CommandError::ExitStatusError(status)) => {
                warn!("workflows command terminated with {}", status);
                Ok(RunWorkflowsResult::Failed)
            }
            Err(CommandError::TimeoutError(msg)) => {
                warn!("workflows command timed out: {}", msg);
                Ok(RunWorkflowsResult::Failed)
            }
            Err(CommandError::ExecutionError(err)) => Err(ExecutorError::Command {
                command: command_line.clone(),
                raw_error_message: err.to_string(),
            }),
        }
    }

    fn upload_results(&self, workspace_dir: &Path) {
        // the chain logs per-link failures and never short-circuits
        let _ = self.results.upload(workspace_dir);
    }
}

/// Blocks until the UI controller accepts TCP connections, so workflows do
/// not error out against a controller that is still starting.
fn wait_for_controller(host: &str, port: u16) {
    loop {
        let addr = match (host, port).to_socket_addrs().ok().and_then(|mut addrs| addrs.next()) {
            Some(addr) => addr,
            None => {
                warn!("cannot resolve controller address {}:{}", host, port);
                std::thread::sleep(CONTROLLER_RETRY_INTERVAL);
                continue;
            }
        };

        match TcpStream::connect_timeout(&addr, CONTROLLER_CONNECT_TIMEOUT) {
            Ok(_) => {
                info!("controller at {}:{} is up", host, port);
                return;
            }
            Err(err) => {
                info!("waiting for controller at {}:{} ({})", host, port, err);
                std::thread::sleep(CONTROLLER_RETRY_INTERVAL);
            }
        }
    }
}
