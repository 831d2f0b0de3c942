use std::process::exit;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use askui_runner::agents::AgentsFileService;
use askui_runner::config::{self, Config, EntryPoint, LogLevel, RunnerType};
use askui_runner::executor::JobExecutor;
use askui_runner::files::sync::SourceOfTruth;
use askui_runner::queue::client::HttpRunnerJobsQueue;
use askui_runner::queue::polling::RunnerJobsQueuePolling;
use askui_runner::queue::runner::k8s_job::K8sJobRunner;
use askui_runner::queue::runner::subprocess::SubprocessRunner;
use askui_runner::queue::runner::Runner;
use askui_runner::queue::{ProcessSystem, SystemClock};

#[derive(Parser)]
#[command(name = "askui-runner", version, about = "Runs AskUI workflow jobs, either leased from the queue or standalone")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in the mode selected by the config entrypoint (QUEUE or JOB)
    Start {
        /// Path to a config file (.json, .yaml, .yml) or inline JSON
        #[arg(short, long, value_name = "PATH_OR_JSON")]
        config: String,
    },
    /// Work with the local agents directory
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Sync agent files between local and remote storage
    Sync {
        /// Path to a config file (.json, .yaml, .yml) or inline JSON
        #[arg(short, long, value_name = "PATH_OR_JSON")]
        config: String,
        direction: SyncDirection,
        /// Only log the operations that would be performed
        #[arg(long)]
        dry: bool,
        /// Delete files that are not in the source of truth
        #[arg(long)]
        delete: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum SyncDirection {
    /// The remote side is the source of truth
    Down,
    /// The local side is the source of truth
    Up,
}

fn init_logging(log_level: LogLevel) {
    tracing_subscriber::fmt()
        .with_max_level(log_level.tracing_level())
        .init();
}

fn run_queue_worker(config: Config) -> anyhow::Result<()> {
    let queue_config = config
        .queue
        .clone()
        .context("queue configuration is required for the QUEUE entrypoint")?;
    let credentials = queue_config
        .credentials
        .clone()
        .context("queue credentials are required to reach the queue API")?;

    let queue = HttpRunnerJobsQueue::new(&queue_config.api_url, &credentials.access_token)?;
    let runner: Box<dyn Runner> = match config.runner.kind {
        RunnerType::Subprocess => Box::new(SubprocessRunner::new(config.runner.exec.clone(), config.clone())),
        RunnerType::K8sJob => Box::new(K8sJobRunner::new(queue_config.k8s_job_runner.clone(), config.clone())?),
    };

    let mut polling = RunnerJobsQueuePolling::new(
        config.polling_config(),
        Box::new(queue),
        runner,
        Box::new(SystemClock),
        Box::new(ProcessSystem),
    );
    polling.poll();
    Ok(())
}

fn start(config_arg: &str) -> anyhow::Result<i32> {
    let config = config::read_config(config_arg)?;
    init_logging(config.log_level);

    match config.entrypoint {
        EntryPoint::Queue => {
            run_queue_worker(config)?;
            Ok(0)
        }
        EntryPoint::Job => {
            let executor = JobExecutor::from_config(config)?;
            let result = executor.run()?;
            Ok(result.exit_code())
        }
    }
}

fn agent_sync(config_arg: &str, direction: SyncDirection, dry: bool, delete: bool) -> anyhow::Result<i32> {
    let config = config::read_agents_config(config_arg)?;
    init_logging(LogLevel::Info);

    let source_of_truth = match direction {
        SyncDirection::Down => SourceOfTruth::Remote,
        SyncDirection::Up => SourceOfTruth::Local,
    };

    let service = AgentsFileService::new(&config)?;
    service.sync(source_of_truth, dry, delete)?;
    Ok(0)
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Start { config } => start(&config),
        Command::Agent {
            command: AgentCommand::Sync {
                config,
                direction,
                dry,
                delete,
            },
        } => agent_sync(&config, direction, dry, delete),
    }
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(exit_code) => exit(exit_code),
        Err(err) => {
            // logging may not be initialised yet when config loading fails
            error!("{:#}", err);
            eprintln!("error: {err:#}");
            exit(1);
        }
    }
}
