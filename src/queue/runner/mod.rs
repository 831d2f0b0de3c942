pub mod k8s_job;
pub mod subprocess;

use crate::queue::RunnerJob;

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("cannot write job config file: {raw_error_message}")]
    CannotWriteConfig { raw_error_message: String },

    #[error("cannot spawn runner `{exec}`: {raw_error_message}")]
    CannotSpawn { exec: String, raw_error_message: String },

    #[error("cannot reach the kubernetes api: {raw_error_message}")]
    KubeApi { raw_error_message: String },
}

/// How a leased job is executed: as an isolated subprocess or as a managed
/// container workload. The probes are queries and must stay safe to call
/// repeatedly between `start` and `stop`.
pub trait Runner {
    fn start(&mut self, job: &RunnerJob) -> Result<(), RunnerError>;
    fn is_running(&mut self) -> bool;
    fn has_passed(&mut self) -> bool;
    fn has_failed(&mut self) -> bool;
    fn stop(&mut self);
}
