use std::io::{BufRead, BufReader};
use std::io::{Error, ErrorKind};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::cmd::command::CommandError::{ExecutionError, ExitStatusError, TimeoutError};

use timeout_readwrite::TimeoutReader;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Error while executing command")]
    ExecutionError(#[from] Error),

    #[error("Command terminated with a non success exit status code: {0}")]
    ExitStatusError(ExitStatus),

    #[error("Command killed due to timeout: {0}")]
    TimeoutError(String),
}

const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(120);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub enum CommandKiller {
    None,
    Timeout(Instant, Duration),
}

impl CommandKiller {
    pub fn never() -> CommandKiller {
        CommandKiller::None
    }

    pub fn from_timeout(timeout: Duration) -> CommandKiller {
        CommandKiller::Timeout(Instant::now(), timeout)
    }

    pub fn should_abort(&self) -> Option<Duration> {
        match self {
            CommandKiller::None => None,
            CommandKiller::Timeout(since, timeout) => {
                if &since.elapsed() >= timeout {
                    Some(*timeout)
                } else {
                    None
                }
            }
        }
    }
}

/// Sends SIGTERM and leaves the process `grace_period` to shut down on its
/// own before force-killing it. Also used by the subprocess job runner.
pub fn terminate_gracefully(cmd_handle: &mut Child, grace_period: Duration) {
    info!("Terminating command: {:?}", cmd_handle);

    unsafe {
        let pid = cmd_handle.id() as i32;
        let _ = libc::kill(pid, libc::SIGTERM);
    }

    let killed_since = Instant::now();
    while let Ok(None) = cmd_handle.try_wait() {
        if killed_since.elapsed() > grace_period {
            info!("Command still running after grace period, hard killing it");
            let _ = cmd_handle.kill();
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    let _ = cmd_handle.wait();
}

pub struct RunnerCommand {
    command: Command,
    kill_grace_period: Duration,
}

impl RunnerCommand {
    pub fn new<P: AsRef<Path>>(binary: P, args: &[&str], envs: &[(&str, &str)]) -> RunnerCommand {
        let mut command = Command::new(binary.as_ref().as_os_str());
        command.args(args);

        envs.iter().for_each(|(k, v)| {
            command.env(k, v);
        });

        RunnerCommand {
            command,
            kill_grace_period: Duration::from_secs(30),
        }
    }

    pub fn set_kill_grace_period(&mut self, grace_period: Duration) {
        self.kill_grace_period = grace_period;
    }

    pub fn set_current_dir<P: AsRef<Path>>(&mut self, working_dir: P) {
        self.command.current_dir(working_dir);
    }

    pub fn exec(&mut self) -> Result<(), CommandError> {
        self.exec_with_abort(
            &mut |line| info!("{}", line),
            &mut |line| warn!("{}", line),
            &CommandKiller::never(),
        )
    }

    pub fn exec_with_abort<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
        abort_notifier: &CommandKiller,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        info!("command: {:?}", self.command);
        let mut cmd_handle = self
            .command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecutionError)?;

        let missing_pipe = |stream: &str| ExecutionError(Error::new(ErrorKind::BrokenPipe, format!("Cannot get {stream} for command")));

        // Reads give up after a short while so the abort deadline keeps
        // being checked between lines; stdout paces the loop, stderr is
        // only ever skimmed without blocking.
        let stdout = cmd_handle.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let mut stdout_lines = BufReader::new(TimeoutReader::new(stdout, Duration::from_secs(1))).lines();
        let stderr = cmd_handle.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let mut stderr_lines = BufReader::new(TimeoutReader::new(stderr, Duration::from_secs(0))).lines();

        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut last_idle_log = Instant::now();
        while !(stdout_done && stderr_done) && abort_notifier.should_abort().is_none() {
            let mut forwarded = 0;
            if !stdout_done {
                stdout_done = pump_lines(&mut stdout_lines, stdout_output, abort_notifier, &mut forwarded);
            }
            if !stderr_done {
                stderr_done = pump_lines(&mut stderr_lines, stderr_output, abort_notifier, &mut forwarded);
            }

            if forwarded > 0 {
                last_idle_log = Instant::now();
            } else if last_idle_log.elapsed() > IDLE_LOG_INTERVAL {
                stderr_output("Command still running without output, waiting for the next line...".to_string());
                last_idle_log = Instant::now();
            }
        }

        // Both pipes are drained (or the deadline is due): wait for the
        // exit status, killing the process when the deadline wins.
        let exit_status = loop {
            if let Some(timeout) = abort_notifier.should_abort() {
                let msg = format!(
                    "Killing command {:?} after exceeding its {}s timeout",
                    self.command,
                    timeout.as_secs()
                );
                warn!("{}", msg);
                terminate_gracefully(&mut cmd_handle, self.kill_grace_period);

                // surface whatever the process managed to say before dying
                let mut forwarded = 0;
                pump_lines(&mut stdout_lines, stdout_output, &CommandKiller::never(), &mut forwarded);
                pump_lines(&mut stderr_lines, stderr_output, &CommandKiller::never(), &mut forwarded);

                return Err(TimeoutError(msg));
            }

            match cmd_handle.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(err) => return Err(ExecutionError(err)),
            }
        };

        if !exit_status.success() {
            debug!("command: {:?} terminated with exit status {:?}", self.command, exit_status);
            return Err(ExitStatusError(exit_status));
        }

        Ok(())
    }
}

/// Forwards every line currently available on `lines` to `on_line`.
/// Returns true once the stream reached its end (or broke), false when it
/// merely ran dry for now or the abort deadline is due.
fn pump_lines(
    lines: &mut dyn Iterator<Item = Result<String, Error>>,
    on_line: &mut dyn FnMut(String),
    abort_notifier: &CommandKiller,
    forwarded: &mut usize,
) -> bool {
    loop {
        if abort_notifier.should_abort().is_some() {
            return false;
        }

        match lines.next() {
            None => return true,
            Some(Ok(line)) => {
                *forwarded += 1;
                on_line(line);
            }
            Some(Err(ref err)) if err.kind() == ErrorKind::TimedOut => return false,
            Some(Err(err)) => {
                error!("cannot read command output: {}", err);
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cmd::command::{CommandError, CommandKiller, RunnerCommand};
    use std::time::Duration;

    #[test]
    fn test_error() {
        let mut cmd = RunnerCommand::new("false", &[], &[]);
        assert!(cmd.exec().is_err());
        assert!(matches!(cmd.exec(), Err(CommandError::ExitStatusError(_))));
    }

    #[test]
    fn test_command_with_timeout() {
        let mut cmd = RunnerCommand::new("sleep", &["120"], &[]);
        cmd.set_kill_grace_period(Duration::from_secs(2));
        let ret = cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &CommandKiller::from_timeout(Duration::from_secs(2)));

        assert!(matches!(ret, Err(CommandError::TimeoutError(_))));

        let mut cmd = RunnerCommand::new("sleep", &["1"], &[]);
        let ret = cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &CommandKiller::from_timeout(Duration::from_secs(5)));
        assert!(ret.is_ok());
    }

    #[test]
    fn test_command_output() {
        let mut stdout = Vec::new();
        let mut cmd = RunnerCommand::new("sh", &["-c", "echo workflows done"], &[]);
        let ret = cmd.exec_with_abort(&mut |line| stdout.push(line), &mut |_| {}, &CommandKiller::never());

        assert!(ret.is_ok());
        assert_eq!(stdout, vec!["workflows done".to_string()]);
    }

    #[test]
    fn test_command_with_working_dir() {
        let dir = tempfile::TempDir::new().expect("error creating temporary dir");
        let mut stdout = Vec::new();
        let mut cmd = RunnerCommand::new("pwd", &[], &[]);
        cmd.set_current_dir(dir.path());
        let ret = cmd.exec_with_abort(&mut |line| stdout.push(line), &mut |_| {}, &CommandKiller::never());

        assert!(ret.is_ok());
        let canonical = dir.path().canonicalize().expect("error resolving temporary dir");
        assert_eq!(stdout, vec![canonical.to_string_lossy().to_string()]);
    }
}
