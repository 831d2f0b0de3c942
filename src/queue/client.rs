use std::time::Duration;

use crate::queue::{PingResult, RunnerJob, RunnerJobsFilters};
use crate::utilities::get_header_with_basic_token;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("cannot instantiate queue client: {raw_error_message}")]
    CannotCreateClient { raw_error_message: String },

    #[error("ping of job `{job_id}` failed: {raw_error_message}")]
    Ping { job_id: String, raw_error_message: String },
}

/// The remote work queue: lease, ping, complete.
///
/// `lease` and the terminal calls swallow transport errors so the worker
/// stays available for the next lease; `ping` propagates them, which makes
/// the supervisor abandon the lease without a terminal status.
pub trait RunnerJobsQueue {
    fn lease(&mut self, filters: &RunnerJobsFilters) -> Option<RunnerJob>;
    fn ping(&mut self, job: &RunnerJob) -> Result<PingResult, QueueError>;
    fn fail(&mut self, job: &mut RunnerJob);
    fn cancel(&mut self, job: &mut RunnerJob);
    fn pass(&mut self, job: &mut RunnerJob);
}

pub struct HttpRunnerJobsQueue {
    url: String,
    http_client: reqwest::blocking::Client,
}

impl HttpRunnerJobsQueue {
    pub fn new(url: &str, access_token: &str) -> Result<Self, QueueError> {
        let http_client = reqwest::blocking::Client::builder()
            .default_headers(get_header_with_basic_token(access_token))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QueueError::CannotCreateClient {
                raw_error_message: e.to_string(),
            })?;

        Ok(HttpRunnerJobsQueue {
            url: url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn complete(&self, job: &RunnerJob) {
        let ret = self
            .http_client
            .post(format!("{}/complete", self.url))
            .query(&[("ack", job.ack.as_str())])
            .json(&serde_json::json!({ "status": job.status }))
            .send()
            .and_then(|res| res.error_for_status());

        // never propagate: the worker must remain available for the next lease
        if let Err(err) = ret {
            error!("cannot complete job {} with status {}: {}", job.id, job.status, err);
        }
    }
}

pub(crate) fn filters_to_query(filters: &RunnerJobsFilters) -> Vec<(&'static str, String)> {
    let mut query: Vec<(&'static str, String)> = filters.tags.iter().map(|t| ("tags", t.clone())).collect();
    query.push(("runner_id", filters.runner_id.clone()));
    query.push(("runner_host", filters.runner_host.to_string()));
    if let Some(workspace_id) = &filters.workspace_id {
        query.push(("workspace_id", workspace_id.clone()));
    }
    query
}

impl RunnerJobsQueue for HttpRunnerJobsQueue {
    fn lease(&mut self, filters: &RunnerJobsFilters) -> Option<RunnerJob> {
        let response = self
            .http_client
            .post(format!("{}/lease", self.url))
            .query(&filters_to_query(filters))
            .send()
            .and_then(|res| res.error_for_status());

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!("cannot lease job: {}", err);
                return None;
            }
        };

        // an empty or null body means the queue has no job for us
        match response.text() {
            Ok(body) if body.trim().is_empty() => None,
            Ok(body) => match serde_json::from_str::<Option<RunnerJob>>(&body) {
                Ok(job) => job,
                Err(err) => {
                    error!("cannot parse lease response: {}", err);
                    None
                }
            },
            Err(err) => {
                error!("cannot read lease response: {}", err);
                None
            }
        }
    }

    fn ping(&mut self, job: &RunnerJob) -> Result<PingResult, QueueError> {
        let to_ping_err = |raw_error_message: String| QueueError::Ping {
            job_id: job.id.clone(),
            raw_error_message,
        };

        let response = self
            .http_client
            .post(format!("{}/ping", self.url))
            .query(&[("ack", job.ack.as_str())])
            .send()
            .and_then(|res| res.error_for_status())
            .map_err(|e| to_ping_err(e.to_string()))?;

        response
            .json::<PingResult>()
            .map_err(|e| to_ping_err(format!("cannot parse ping response: {e}")))
    }

    fn fail(&mut self, job: &mut RunnerJob) {
        job.fail();
        self.complete(job);
    }

    fn cancel(&mut self, job: &mut RunnerJob) {
        job.cancel();
        self.complete(job);
    }

    fn pass(&mut self, job: &mut RunnerJob) {
        job.pass();
        self.complete(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Host;
    use crate::queue::PingResult;

    #[test]
    fn test_filters_to_query_repeats_tags() {
        let filters = RunnerJobsFilters {
            tags: vec!["desktop".to_string(), "chrome".to_string()],
            runner_id: "r-1".to_string(),
            runner_host: Host::SelfHosted,
            workspace_id: Some("w-1".to_string()),
        };

        let query = filters_to_query(&filters);
        assert_eq!(
            query,
            vec![
                ("tags", "desktop".to_string()),
                ("tags", "chrome".to_string()),
                ("runner_id", "r-1".to_string()),
                ("runner_host", "SELF".to_string()),
                ("workspace_id", "w-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_filters_to_query_without_workspace() {
        let filters = RunnerJobsFilters {
            tags: vec![],
            runner_id: "r-1".to_string(),
            runner_host: Host::Askui,
            workspace_id: None,
        };

        let query = filters_to_query(&filters);
        assert_eq!(
            query,
            vec![("runner_id", "r-1".to_string()), ("runner_host", "ASKUI".to_string())]
        );
    }

    #[test]
    fn test_ping_result_parses() {
        let result: PingResult =
            serde_json::from_str(r#"{"visible": 1700000300, "cancel_job": false}"#).expect("ping payload must parse");
        assert_eq!(result.visible, 1700000300);
        assert!(!result.cancel_job);
    }
}
