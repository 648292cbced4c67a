//! The execution agent: lifecycle state machine wiring task intake to the
//! worker pool, pool completions to status reporting, and worker output to
//! the stream forwarders.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::TaskEnvironment;
use crate::error::{AgentError, Result};
use crate::forward::{ConsoleSink, LogSink, StreamForwarder, StreamWriter, TcpSink};
use crate::report::{StatusReporter, StatusSink};
use crate::task::{ResultReport, TaskState, TaskUnit};
use crate::worker::pool::{PoolConfig, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Ready,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Uninitialized => write!(f, "uninitialized"),
            AgentState::Ready => write!(f, "ready"),
            AgentState::ShuttingDown => write!(f, "shutting-down"),
            AgentState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-node execution agent.
///
/// Owns the worker pool, both stream forwarders and the completion drain;
/// exposes the operations the controller invokes. Methods are called
/// sequentially from one control path; task execution and output
/// forwarding proceed concurrently and never block it.
pub struct ExecutionAgent {
    state: AgentState,
    reporter: StatusReporter,
    worker_program: PathBuf,
    env: Option<TaskEnvironment>,
    pool: Option<WorkerPool>,
    out_writer: Option<StreamWriter>,
    err_writer: Option<StreamWriter>,
    out_forwarder: Option<StreamForwarder>,
    err_forwarder: Option<StreamForwarder>,
    drain: Option<JoinHandle<()>>,
    dispatched: Arc<Mutex<HashMap<Uuid, u32>>>,
    sink_override: Option<(Box<dyn LogSink>, Box<dyn LogSink>)>,
}

impl ExecutionAgent {
    pub fn new(status_sink: Arc<dyn StatusSink>) -> Self {
        Self {
            state: AgentState::Uninitialized,
            reporter: StatusReporter::new(status_sink),
            worker_program: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("dray")),
            env: None,
            pool: None,
            out_writer: None,
            err_writer: None,
            out_forwarder: None,
            err_forwarder: None,
            drain: None,
            dispatched: Arc::new(Mutex::new(HashMap::new())),
            sink_override: None,
        }
    }

    /// Use a specific binary for the worker processes instead of the
    /// agent's own executable.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    /// Replace the log sinks the forwarders would otherwise build from the
    /// environment's sink addresses. For embedders and tests.
    pub fn with_log_sinks(mut self, stdout: Box<dyn LogSink>, stderr: Box<dyn LogSink>) -> Self {
        self.sink_override = Some((stdout, stderr));
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The environment received at `init`, if any.
    pub fn environment(&self) -> Option<&TaskEnvironment> {
        self.env.as_ref()
    }

    /// Establish the execution environment and bring the agent to `Ready`:
    /// working directory, both stream forwarders, the worker pool, and the
    /// completion drain. A working directory that cannot be entered is a
    /// warning sent to the controller; every other failure is fatal.
    pub async fn init(&mut self, blob: &[u8]) -> Result<()> {
        if self.state != AgentState::Uninitialized {
            return Err(AgentError::InvalidState(self.state.to_string()));
        }
        let env = TaskEnvironment::decode(blob)?;
        tracing::info!(
            script = %env.script_name,
            working_dir = %env.working_dir.display(),
            parallelism = env.parallelism,
            "initializing agent"
        );

        self.enter_working_dir(&env);

        let (out_sink, err_sink) = match self.sink_override.take() {
            Some(sinks) => sinks,
            None => (
                connect_sink(env.stdout_sink.as_deref(), false).await?,
                connect_sink(env.stderr_sink.as_deref(), true).await?,
            ),
        };
        let (out_writer, out_forwarder) = StreamForwarder::start(env.stdout_tag.clone(), out_sink);
        let (err_writer, err_forwarder) = StreamForwarder::start(env.stderr_tag.clone(), err_sink);

        let (pool, completions) = WorkerPool::start(PoolConfig {
            parallelism: env.parallelism,
            worker_program: self.worker_program.clone(),
            working_dir: env.working_dir.clone(),
            search_paths: env.search_paths.clone(),
            worker_args: env.worker_args.clone(),
            stdout: out_writer.clone(),
            stderr: err_writer.clone(),
        })
        .await?;

        self.drain = Some(tokio::spawn(drain_completions(
            completions,
            self.reporter.clone(),
            self.dispatched.clone(),
        )));
        self.out_writer = Some(out_writer);
        self.err_writer = Some(err_writer);
        self.out_forwarder = Some(out_forwarder);
        self.err_forwarder = Some(err_forwarder);
        self.pool = Some(pool);
        self.env = Some(env);
        self.state = AgentState::Ready;
        Ok(())
    }

    fn enter_working_dir(&self, env: &TaskEnvironment) {
        if !env.working_dir.is_dir() {
            if let Err(e) = std::fs::create_dir_all(&env.working_dir) {
                self.reporter.framework_message(format!(
                    "cannot create working directory {}: {e}",
                    env.working_dir.display()
                ));
                return;
            }
        }
        if let Err(e) = std::env::set_current_dir(&env.working_dir) {
            self.reporter.framework_message(format!(
                "cannot switch to working directory {}: {e}",
                env.working_dir.display()
            ));
        }
    }

    /// Accept one task for execution. Reports `Running` immediately, then
    /// hands the unit to the pool; the terminal status follows
    /// asynchronously from the completion drain. A descriptor that does not
    /// decode is reported `Lost` with the diagnostic detail and the agent
    /// keeps serving.
    pub async fn launch_task(&mut self, task_id: Uuid, descriptor: &[u8]) -> Result<()> {
        if self.state != AgentState::Ready {
            return Err(AgentError::InvalidState(self.state.to_string()));
        }
        let unit = match TaskUnit::decode(descriptor) {
            Ok(unit) => unit,
            Err(e) => {
                let trace = format!("task {task_id}: descriptor decode failed: {e}");
                tracing::warn!(task_id = %task_id, error = %e, "task descriptor rejected");
                self.reporter
                    .report(task_id, TaskState::Lost, Some(trace.into_bytes()));
                return Ok(());
            }
        };
        if unit.id != task_id {
            tracing::warn!(task_id = %task_id, unit_id = %unit.id, "descriptor id differs from dispatch id");
        }

        self.dispatched.lock().await.insert(task_id, unit.attempt);
        self.reporter.report(task_id, TaskState::Running, None);
        if let Some(pool) = &self.pool {
            pool.submit(unit);
        }
        Ok(())
    }

    /// Best effort: accepted and logged, but in-flight units are not
    /// preemptively cancelled.
    pub async fn kill_task(&self, task_id: Uuid) {
        let known = self.dispatched.lock().await.contains_key(&task_id);
        tracing::info!(task_id = %task_id, known, "kill requested; in-flight cancellation not supported");
    }

    /// Stop everything: close the capture write ends, terminate the workers
    /// without waiting for outstanding completions, drain and join both
    /// forwarders, stop the completion drain. Idempotent.
    pub async fn shutdown(&mut self) {
        match self.state {
            AgentState::ShuttingDown | AgentState::Terminated => return,
            AgentState::Uninitialized => {
                self.state = AgentState::Terminated;
                return;
            }
            AgentState::Ready => {}
        }
        self.state = AgentState::ShuttingDown;
        tracing::info!("agent shutting down");

        // our copies of the write ends go first; the pool's pumps hold the
        // rest and drop them as the dying workers' pipes hit EOF
        self.out_writer.take();
        self.err_writer.take();
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown().await;
        }
        if let Some(forwarder) = self.out_forwarder.take() {
            forwarder.join().await;
        }
        if let Some(forwarder) = self.err_forwarder.take() {
            forwarder.join().await;
        }
        // all completion senders are gone by now; the drain ends on its own
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }

        let outstanding = self.dispatched.lock().await.len();
        if outstanding > 0 {
            tracing::warn!(outstanding, "discarded in-flight tasks at shutdown");
        }
        self.state = AgentState::Terminated;
    }

    /// Controller-reported error: logged, not actionable.
    pub fn error(&self, code: i32, message: &str) {
        tracing::error!(code, detail = message, "controller reported error");
    }
}

async fn connect_sink(addr: Option<&str>, stderr: bool) -> Result<Box<dyn LogSink>> {
    match addr {
        Some(addr) => Ok(Box::new(TcpSink::connect(addr).await?)),
        None if stderr => Ok(Box::new(ConsoleSink::stderr())),
        None => Ok(Box::new(ConsoleSink::stdout())),
    }
}

/// Single consumer of the pool's completion channel: every report becomes
/// exactly one terminal status message.
async fn drain_completions(
    mut completions: mpsc::UnboundedReceiver<ResultReport>,
    reporter: StatusReporter,
    dispatched: Arc<Mutex<HashMap<Uuid, u32>>>,
) {
    while let Some(report) = completions.recv().await {
        dispatched.lock().await.remove(&report.task_id);
        let state = report.state();
        match report.to_bytes() {
            Ok(bytes) => reporter.report(report.task_id, state, Some(bytes)),
            Err(e) => {
                tracing::error!(task_id = %report.task_id, error = %e, "result report not encodable");
                let trace = format!("task {}: result report not encodable: {e}", report.task_id);
                reporter
                    .report(report.task_id, TaskState::Failed, Some(trace.into_bytes()));
            }
        }
    }
}
