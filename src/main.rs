use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dray::agent::ExecutionAgent;
use dray::config::TaskEnvironment;
use dray::registry::TaskRegistry;
use dray::report::{ChannelStatusSink, ControllerEvent};
use dray::shutdown::install_shutdown_handler;
use dray::task::{ResultReport, TaskOutcome, TaskState, TaskUnit, TaskValue};
use dray::worker::runner;

#[derive(Parser, Debug)]
#[command(name = "dray")]
#[command(version)]
#[command(about = "Per-node task execution agent for distributed data processing")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a batch of tasks through the local agent and print the results
    Run(RunArgs),

    /// Internal: worker process entry point, spawned by the agent
    #[command(hide = true)]
    Worker(WorkerArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of worker processes
    #[arg(long, default_value = "4")]
    parallel: usize,

    /// Working directory for spill files (defaults to the system temp dir)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Remote sink for captured worker stdout, host:port
    #[arg(long)]
    stdout_sink: Option<String>,

    /// Remote sink for captured worker stderr, host:port
    #[arg(long)]
    stderr_sink: Option<String>,

    /// Task to launch, as "function=json-args" (repeatable)
    /// Example: --task 'sum=[1,2,3]' --task 'generate=2097152'
    #[arg(long = "task", value_name = "FUNCTION=ARGS")]
    tasks: Vec<String>,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Path of the pool's Unix socket
    #[arg(long)]
    socket: PathBuf,
}

// =============================================================================
// Run Implementation (host-loop adapter over the agent interface)
// =============================================================================

fn parse_task(input: &str) -> Result<TaskUnit, Box<dyn std::error::Error>> {
    let (function, args) = match input.split_once('=') {
        Some((function, args)) => {
            let json: serde_json::Value = serde_json::from_str(args)
                .map_err(|e| format!("task '{input}': arguments are not valid JSON: {e}"))?;
            (function, TaskValue::from_json(&json))
        }
        None => (input, TaskValue::Null),
    };
    if function.is_empty() {
        return Err(format!("task '{input}': empty function name").into());
    }
    Ok(TaskUnit::new(function, args))
}

fn print_terminal(task_id: Uuid, state: TaskState, payload: Option<&[u8]>) {
    match state {
        TaskState::Finished => {
            let Some(bytes) = payload else {
                println!("task {task_id}: finished");
                return;
            };
            match ResultReport::from_bytes(bytes) {
                Ok(report) => {
                    if let TaskOutcome::Success(result) = &report.outcome {
                        match result.decode_value() {
                            Ok(value) => println!("task {task_id}: finished: {}", value.to_json()),
                            Err(e) => println!("task {task_id}: finished (result unreadable: {e})"),
                        }
                    }
                    if let Some(accumulators) = &report.accumulators {
                        for (id, value) in accumulators {
                            println!("task {task_id}:   accumulator {id} = {value}");
                        }
                    }
                }
                Err(e) => println!("task {task_id}: finished (report unreadable: {e})"),
            }
        }
        TaskState::Failed => {
            let detail = payload
                .map(|bytes| match ResultReport::from_bytes(bytes) {
                    Ok(ResultReport {
                        outcome: TaskOutcome::Failure { trace },
                        ..
                    }) => trace,
                    _ => String::from_utf8_lossy(bytes).into_owned(),
                })
                .unwrap_or_default();
            eprintln!("task {task_id}: failed\n{detail}");
        }
        TaskState::Lost => {
            let detail = payload
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            eprintln!("task {task_id}: lost: {detail}");
        }
        TaskState::Running => {}
    }
}

async fn run_batch(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let units = args
        .tasks
        .iter()
        .map(|input| parse_task(input))
        .collect::<Result<Vec<_>, _>>()?;
    if units.is_empty() {
        return Err("nothing to do: pass at least one --task".into());
    }

    let workdir = args.workdir.unwrap_or_else(std::env::temp_dir);
    let env = TaskEnvironment::new("dray-run", workdir)
        .with_parallelism(args.parallel)
        .with_sinks(args.stdout_sink, args.stderr_sink)
        .with_tags("out> ", "err> ");

    let (sink, mut events) = ChannelStatusSink::new();
    let mut agent = ExecutionAgent::new(Arc::new(sink));
    agent.init(&env.encode()?).await?;

    let shutdown = install_shutdown_handler();
    let mut outstanding = 0usize;
    for unit in units {
        let descriptor = unit.encode()?;
        agent.launch_task(unit.id, &descriptor).await?;
        outstanding += 1;
    }

    let mut failures = 0usize;
    while outstanding > 0 {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ControllerEvent::Status(msg) => {
                        tracing::info!(task_id = %msg.task_id, state = %msg.state, "status");
                        if msg.state != TaskState::Running {
                            if msg.state != TaskState::Finished {
                                failures += 1;
                            }
                            print_terminal(msg.task_id, msg.state, msg.payload.as_deref());
                            outstanding -= 1;
                        }
                    }
                    ControllerEvent::Message(text) => {
                        tracing::warn!(warning = %text, "agent warning");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::warn!(outstanding, "interrupted, abandoning outstanding tasks");
                break;
            }
        }
    }

    agent.shutdown().await;
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_batch(run_args).await,
        Commands::Worker(worker_args) => {
            // no subscriber here: worker stderr is captured and forwarded
            let registry = TaskRegistry::standard();
            runner::run(&worker_args.socket, &registry).await?;
            Ok(())
        }
    }
}
