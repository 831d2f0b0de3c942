use crate::queue::client::RunnerJobsQueue;
use crate::queue::runner::Runner;
use crate::queue::{Clock, PollingConfig, RunnerJob, System};

/// A ping is sent once the lease is this close to expiring.
pub const PING_THRESHOLD_IN_SEC: i64 = 60;
/// Cadence of the monitor loop. Must stay strictly below the ping
/// threshold, which must stay strictly below the lease duration.
pub const RUNNER_POLL_INTERVAL_IN_SEC: u64 = 10;

const _: () = assert!((RUNNER_POLL_INTERVAL_IN_SEC as i64) < PING_THRESHOLD_IN_SEC);

/// How a single monitored run ended. The monitor loop never reports back to
/// the queue itself; the outer poll loop dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    /// The runner terminated on its own; `passed` is the probe taken right
    /// before the runner was stopped.
    Completed { passed: bool },
    /// The local job timeout fired.
    TimedOut,
    /// The server asked for cancellation through a ping response.
    Canceled,
    /// A ping failed; the lease is considered lost and no terminal status
    /// must be reported, the server re-leases after visibility expiry.
    LeaseLost,
    /// The runner could not be started at all.
    StartFailed,
}

/// The top-level worker loop: lease a job, supervise its execution, keep
/// the lease alive, report the terminal status. One job in flight at most.
pub struct RunnerJobsQueuePolling {
    config: PollingConfig,
    queue: Box<dyn RunnerJobsQueue>,
    runner: Box<dyn Runner>,
    clock: Box<dyn Clock>,
    system: Box<dyn System>,
    leased_at: i64,
}

impl RunnerJobsQueuePolling {
    pub fn new(
        config: PollingConfig,
        queue: Box<dyn RunnerJobsQueue>,
        runner: Box<dyn Runner>,
        clock: Box<dyn Clock>,
        system: Box<dyn System>,
    ) -> Self {
        RunnerJobsQueuePolling {
            config,
            queue,
            runner,
            clock,
            system,
            leased_at: 0,
        }
    }

    pub fn poll(&mut self) {
        loop {
            info!("polling for jobs...");
            let Some(mut job) = self.queue.lease(&self.config.filters) else {
                if !self.config.keep_alive {
                    self.system.exit();
                    return;
                }
                self.clock.sleep(self.config.polling_interval);
                continue;
            };

            self.leased_at = self.clock.now();
            let outcome = self.run(&mut job);
            self.report(&mut job, outcome);
        }
    }

    fn run(&mut self, job: &mut RunnerJob) -> RunOutcome {
        info!("starting job {}...", job.id);
        if let Err(err) = self.runner.start(job) {
            error!("cannot start job {}: {}", job.id, err);
            self.runner.stop();
            return RunOutcome::StartFailed;
        }

        while self.runner.is_running() {
            info!("running job {}...", job.id);
            if job.should_ping(self.clock.now(), PING_THRESHOLD_IN_SEC) {
                match self.queue.ping(job) {
                    Ok(ping_result) if ping_result.cancel_job => {
                        self.runner.stop();
                        return RunOutcome::Canceled;
                    }
                    Ok(ping_result) => job.visible = ping_result.visible,
                    Err(err) => {
                        warn!("{}", err);
                        self.runner.stop();
                        return RunOutcome::LeaseLost;
                    }
                }
            }

            self.clock.sleep(RUNNER_POLL_INTERVAL_IN_SEC);

            if self.has_job_timed_out() {
                info!("job {} timed out", job.id);
                self.runner.stop();
                return RunOutcome::TimedOut;
            }
        }

        // take the probe before stop, stopping discards the workload
        let passed = self.runner.has_passed();
        self.runner.stop();
        RunOutcome::Completed { passed }
    }

    fn report(&mut self, job: &mut RunnerJob, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Completed { passed: true } => {
                info!("job {} passed", job.id);
                self.queue.pass(job);
            }
            RunOutcome::Completed { passed: false } | RunOutcome::TimedOut | RunOutcome::StartFailed => {
                info!("job {} failed", job.id);
                self.queue.fail(job);
            }
            RunOutcome::Canceled => {
                info!("job {} canceled", job.id);
                self.queue.cancel(job);
            }
            RunOutcome::LeaseLost => {
                warn!("lease of job {} with ack {} is lost, not reporting any terminal status", job.id, job.ack);
            }
        }
    }

    fn job_timeout_timestamp(&self) -> i64 {
        self.leased_at + self.config.job_timeout as i64
    }

    fn has_job_timed_out(&mut self) -> bool {
        self.job_timeout_timestamp() - self.clock.now() <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Host;
    use crate::queue::client::QueueError;
    use crate::queue::runner::RunnerError;
    use crate::queue::tests::job_fixture;
    use crate::queue::{PingResult, RunnerJobsFilters};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<String>>>;

    fn log(calls: &CallLog, call: &str) {
        calls.lock().unwrap().push(call.to_string());
    }

    struct FakeQueue {
        calls: CallLog,
        leases: VecDeque<Option<RunnerJob>>,
        ping_results: VecDeque<Result<PingResult, QueueError>>,
    }

    impl RunnerJobsQueue for FakeQueue {
        fn lease(&mut self, _filters: &RunnerJobsFilters) -> Option<RunnerJob> {
            log(&self.calls, "queue.lease");
            self.leases.pop_front().flatten()
        }

        fn ping(&mut self, _job: &RunnerJob) -> Result<PingResult, QueueError> {
            log(&self.calls, "queue.ping");
            self.ping_results.pop_front().unwrap_or(Ok(PingResult {
                visible: i64::MAX,
                cancel_job: false,
            }))
        }

        fn fail(&mut self, job: &mut RunnerJob) {
            job.fail();
            log(&self.calls, "queue.fail");
        }

        fn cancel(&mut self, job: &mut RunnerJob) {
            job.cancel();
            log(&self.calls, "queue.cancel");
        }

        fn pass(&mut self, job: &mut RunnerJob) {
            job.pass();
            log(&self.calls, "queue.pass");
        }
    }

    struct FakeRunner {
        calls: CallLog,
        running_ticks: u32,
        passed: bool,
        start_error: bool,
    }

    impl Runner for FakeRunner {
        fn start(&mut self, _job: &RunnerJob) -> Result<(), RunnerError> {
            log(&self.calls, "runner.start");
            if self.start_error {
                return Err(RunnerError::CannotSpawn {
                    exec: "fake".to_string(),
                    raw_error_message: "spawn failed".to_string(),
                });
            }
            Ok(())
        }

        fn is_running(&mut self) -> bool {
            if self.running_ticks == 0 {
                return false;
            }
            self.running_ticks -= 1;
            true
        }

        fn has_passed(&mut self) -> bool {
            self.passed
        }

        fn has_failed(&mut self) -> bool {
            !self.passed
        }

        fn stop(&mut self) {
            log(&self.calls, "runner.stop");
        }
    }

    /// Starts at t=0; every sleep advances the clock by the requested amount.
    struct FakeClock {
        now: i64,
    }

    impl Clock for FakeClock {
        fn now(&mut self) -> i64 {
            self.now
        }

        fn sleep(&mut self, seconds: u64) {
            self.now += seconds as i64;
        }
    }

    struct FakeSystem {
        calls: CallLog,
    }

    impl System for FakeSystem {
        fn exit(&mut self) {
            log(&self.calls, "system.exit");
        }
    }

    struct Harness {
        calls: CallLog,
        polling: RunnerJobsQueuePolling,
    }

    fn harness(
        job: Option<RunnerJob>,
        job_timeout: u64,
        running_ticks: u32,
        passed: bool,
        ping_results: Vec<Result<PingResult, QueueError>>,
    ) -> Harness {
        let calls: CallLog = Arc::new(Mutex::new(vec![]));
        let mut leases = VecDeque::new();
        leases.push_back(job);
        // a second empty lease ends the loop through keep_alive=false

        let config = PollingConfig {
            filters: RunnerJobsFilters {
                tags: vec![],
                runner_id: "runner-1".to_string(),
                runner_host: Host::SelfHosted,
                workspace_id: Some("w-1".to_string()),
            },
            job_timeout,
            keep_alive: false,
            polling_interval: 30,
        };

        let polling = RunnerJobsQueuePolling::new(
            config,
            Box::new(FakeQueue {
                calls: calls.clone(),
                leases,
                ping_results: ping_results.into(),
            }),
            Box::new(FakeRunner {
                calls: calls.clone(),
                running_ticks,
                passed,
                start_error: false,
            }),
            Box::new(FakeClock { now: 0 }),
            Box::new(FakeSystem { calls: calls.clone() }),
        );

        Harness { calls, polling }
    }

    fn calls_of(harness: &Harness) -> Vec<String> {
        harness.calls.lock().unwrap().clone()
    }

    #[test]
    fn test_happy_path_subprocess_like_run() {
        // visible=now+300, timeout=3600, runner exits after one tick:
        // first monitor tick sees 300-0=300 >= 60, so no ping at all
        let mut h = harness(Some(job_fixture(300)), 3600, 1, true, vec![]);
        h.polling.poll();

        assert_eq!(
            calls_of(&h),
            vec![
                "queue.lease".to_string(),
                "runner.start".to_string(),
                "runner.stop".to_string(),
                "queue.pass".to_string(),
                "queue.lease".to_string(),
                "system.exit".to_string(),
            ]
        );
    }

    #[test]
    fn test_long_job_triggers_ping_only_below_threshold() {
        // visible=70: at t=10 70-10=60 is not < 60; at t=20 50 < 60 -> ping.
        // ping extends visibility far enough that no second ping happens.
        let mut h = harness(
            Some(job_fixture(70)),
            3600,
            4,
            true,
            vec![Ok(PingResult {
                visible: 300,
                cancel_job: false,
            })],
        );
        h.polling.poll();

        let calls = calls_of(&h);
        let pings = calls.iter().filter(|c| *c == "queue.ping").count();
        assert_eq!(pings, 1);
        assert_eq!(calls.last().unwrap(), "system.exit");
        assert!(calls.contains(&"queue.pass".to_string()));
    }

    #[test]
    fn test_server_cancellation_stops_then_cancels() {
        let mut h = harness(
            Some(job_fixture(10)), // triggers a ping on the first iteration
            3600,
            5,
            true,
            vec![Ok(PingResult {
                visible: 300,
                cancel_job: true,
            })],
        );
        h.polling.poll();

        let calls = calls_of(&h);
        let stop_idx = calls.iter().position(|c| c == "runner.stop").unwrap();
        let cancel_idx = calls.iter().position(|c| c == "queue.cancel").unwrap();
        assert!(stop_idx < cancel_idx);
        assert!(!calls.contains(&"queue.pass".to_string()));
        assert!(!calls.contains(&"queue.fail".to_string()));
    }

    #[test]
    fn test_local_timeout_stops_then_fails() {
        // job_timeout=15: first tick sleeps to t=10 (no timeout), second to
        // t=20 -> 20-0 >= 15 fires on that monitor tick
        let mut h = harness(Some(job_fixture(1000)), 15, 10, true, vec![]);
        h.polling.poll();

        let calls = calls_of(&h);
        let stop_idx = calls.iter().position(|c| c == "runner.stop").unwrap();
        let fail_idx = calls.iter().position(|c| c == "queue.fail").unwrap();
        assert!(stop_idx < fail_idx);
        assert!(!calls.contains(&"queue.pass".to_string()));
    }

    #[test]
    fn test_ping_failure_abandons_lease_without_terminal_status() {
        let mut h = harness(
            Some(job_fixture(10)),
            3600,
            5,
            true,
            vec![Err(QueueError::Ping {
                job_id: "job-1".to_string(),
                raw_error_message: "connection reset".to_string(),
            })],
        );
        h.polling.poll();

        let calls = calls_of(&h);
        assert!(calls.contains(&"runner.stop".to_string()));
        assert!(!calls.contains(&"queue.pass".to_string()));
        assert!(!calls.contains(&"queue.fail".to_string()));
        assert!(!calls.contains(&"queue.cancel".to_string()));
        // the worker went back to polling afterwards
        assert_eq!(calls.last().unwrap(), "system.exit");
    }

    #[test]
    fn test_failed_run_reports_fail_once() {
        let mut h = harness(Some(job_fixture(300)), 3600, 1, false, vec![]);
        h.polling.poll();

        let calls = calls_of(&h);
        let terminal_calls = calls
            .iter()
            .filter(|c| ["queue.pass", "queue.fail", "queue.cancel"].contains(&c.as_str()))
            .count();
        assert_eq!(terminal_calls, 1);
        assert!(calls.contains(&"queue.fail".to_string()));
        let stop_idx = calls.iter().position(|c| c == "runner.stop").unwrap();
        let fail_idx = calls.iter().position(|c| c == "queue.fail").unwrap();
        assert!(stop_idx < fail_idx);
    }

    #[test]
    fn test_start_failure_reports_fail() {
        let calls: CallLog = Arc::new(Mutex::new(vec![]));
        let mut leases = VecDeque::new();
        leases.push_back(Some(job_fixture(300)));

        let mut polling = RunnerJobsQueuePolling::new(
            PollingConfig {
                filters: RunnerJobsFilters {
                    tags: vec![],
                    runner_id: "runner-1".to_string(),
                    runner_host: Host::SelfHosted,
                    workspace_id: None,
                },
                job_timeout: 3600,
                keep_alive: false,
                polling_interval: 30,
            },
            Box::new(FakeQueue {
                calls: calls.clone(),
                leases,
                ping_results: VecDeque::new(),
            }),
            Box::new(FakeRunner {
                calls: calls.clone(),
                running_ticks: 0,
                passed: false,
                start_error: true,
            }),
            Box::new(FakeClock { now: 0 }),
            Box::new(FakeSystem { calls: calls.clone() }),
        );
        polling.poll();

        let calls = calls.lock().unwrap().clone();
        assert!(calls.contains(&"queue.fail".to_string()));
        let stop_idx = calls.iter().position(|c| c == "runner.stop").unwrap();
        let fail_idx = calls.iter().position(|c| c == "queue.fail").unwrap();
        assert!(stop_idx < fail_idx);
    }

    #[test]
    fn test_empty_queue_exits_when_not_kept_alive() {
        let mut h = harness(None, 3600, 0, false, vec![]);
        h.polling.poll();

        assert_eq!(calls_of(&h), vec!["queue.lease".to_string(), "system.exit".to_string()]);
    }
}
