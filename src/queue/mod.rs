pub mod client;
pub mod polling;
pub mod runner;

use serde_derive::{Deserialize, Serialize};

use crate::config::{Host, RunnerJobData};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum RunnerJobStatus {
    #[serde(rename = "PENDING")]
    #[strum(serialize = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    #[strum(serialize = "RUNNING")]
    Running,
    #[serde(rename = "PASSED")]
    #[strum(serialize = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    #[strum(serialize = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    #[strum(serialize = "CANCELED")]
    Canceled,
    #[serde(rename = "MAX_RETRIES_EXCEEDED")]
    #[strum(serialize = "MAX_RETRIES_EXCEEDED")]
    MaxRetriesExceeded,
}

/// A job leased from the remote work queue. `id`, `ack` and `runner_id` are
/// immutable once leased; `status` transitions exactly once from Running to
/// a terminal state; `visible` only moves forward via successful pings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunnerJob {
    pub id: String,
    /// Opaque lease token, required to ping and complete.
    pub ack: String,
    pub status: RunnerJobStatus,
    /// UTC epoch seconds at which the lease expires server side.
    pub visible: i64,
    pub runner_id: String,
    pub tries: u32,
    pub data: RunnerJobData,
}

impl RunnerJob {
    pub fn should_ping(&self, now: i64, ping_threshold: i64) -> bool {
        self.visible - now < ping_threshold
    }

    pub fn fail(&mut self) {
        self.status = RunnerJobStatus::Failed;
    }

    pub fn cancel(&mut self) {
        self.status = RunnerJobStatus::Canceled;
    }

    pub fn pass(&mut self) {
        self.status = RunnerJobStatus::Passed;
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct PingResult {
    /// New lease expiry, UTC epoch seconds.
    pub visible: i64,
    /// Server-side request to abort the job.
    pub cancel_job: bool,
}

/// Filters sent on every lease call.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RunnerJobsFilters {
    pub tags: Vec<String>,
    pub runner_id: String,
    pub runner_host: Host,
    pub workspace_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollingConfig {
    pub filters: RunnerJobsFilters,
    pub job_timeout: u64,
    pub keep_alive: bool,
    pub polling_interval: u64,
}

/// Wall-clock seam so the supervisor can be driven by tests.
pub trait Clock {
    /// UTC epoch seconds.
    fn now(&mut self) -> i64;
    fn sleep(&mut self, seconds: u64);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn sleep(&mut self, seconds: u64) {
        std::thread::sleep(std::time::Duration::from_secs(seconds));
    }
}

pub trait System {
    fn exit(&mut self);
}

pub struct ProcessSystem;

impl System for ProcessSystem {
    fn exit(&mut self) {
        info!("queue drained, exiting");
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceCredentials;

    pub(crate) fn job_fixture(visible: i64) -> RunnerJob {
        RunnerJob {
            id: "job-1".to_string(),
            ack: "ack-1".to_string(),
            status: RunnerJobStatus::Running,
            visible,
            runner_id: "runner-1".to_string(),
            tries: 1,
            data: RunnerJobData {
                credentials: WorkspaceCredentials {
                    workspace_id: "w-1".to_string(),
                    access_token: "t-1".to_string(),
                },
                workflows: vec![],
                results_api_url: "https://results.askui.com".to_string(),
                workflows_api_url: "https://workflows.askui.com".to_string(),
                inference_api_url: "https://inference.askui.com".to_string(),
                schedule_results_api_url: None,
                data: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn test_should_ping_is_a_strict_comparison() {
        let job = job_fixture(70);
        // 70 - 10 = 60 is not < 60 yet
        assert!(!job.should_ping(10, 60));
        // 70 - 20 = 50 < 60
        assert!(job.should_ping(20, 60));
    }

    #[test]
    fn test_status_transitions() {
        let mut job = job_fixture(100);
        job.pass();
        assert_eq!(job.status, RunnerJobStatus::Passed);

        let mut job = job_fixture(100);
        job.fail();
        assert_eq!(job.status, RunnerJobStatus::Failed);

        let mut job = job_fixture(100);
        job.cancel();
        assert_eq!(job.status, RunnerJobStatus::Canceled);
    }

    #[test]
    fn test_job_deserializes_from_lease_payload() {
        let payload = r#"{
            "id": "j-42",
            "ack": "lease-token",
            "status": "RUNNING",
            "visible": 1700000300,
            "runner_id": "r-1",
            "tries": 2,
            "data": {
                "credentials": {"workspace_id": "w-1", "access_token": "t-1"},
                "workflows": ["workspaces/w-1/test-cases/smoke"],
                "results_api_url": "https://results.askui.com",
                "workflows_api_url": "https://workflows.askui.com",
                "inference_api_url": "https://inference.askui.com",
                "data": {"browser": "chrome"}
            }
        }"#;

        let job: RunnerJob = serde_json::from_str(payload).expect("lease payload must parse");
        assert_eq!(job.id, "j-42");
        assert_eq!(job.status, RunnerJobStatus::Running);
        assert_eq!(job.tries, 2);
        assert_eq!(job.data.data.get("browser").and_then(|v| v.as_str()), Some("chrome"));
    }
}
