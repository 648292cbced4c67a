use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::forward::{pump, StreamWriter};
use crate::task::{ResultReport, TaskUnit};
use crate::worker::ipc::{read_frame, write_frame, WorkerBootstrap, WorkerRequest};

/// How long a freshly spawned worker gets to connect back before the pool
/// declares startup failed.
const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes. Fixed for the pool's lifetime.
    pub parallelism: usize,
    /// Binary to spawn for each worker; it must expose the `worker`
    /// subcommand. Normally the agent's own executable.
    pub worker_program: PathBuf,
    /// Spill directory handed to every worker.
    pub working_dir: PathBuf,
    /// Directories prepended to the workers' search path.
    pub search_paths: Vec<PathBuf>,
    /// Opaque bootstrap arguments for the workers.
    pub worker_args: Vec<String>,
    /// Capture write end for worker stdout.
    pub stdout: StreamWriter,
    /// Capture write end for worker stderr.
    pub stderr: StreamWriter,
}

/// Fixed-size pool of worker processes.
///
/// Units are queued on an unbounded channel and picked up by per-worker
/// driver loops; each executed unit yields exactly one [`ResultReport`] on
/// the completion channel, in completion order. Submission never blocks and
/// never rejects. `shutdown` terminates the workers without waiting for
/// in-flight units.
pub struct WorkerPool {
    queue_tx: mpsc::UnboundedSender<TaskUnit>,
    children: Vec<Child>,
    drivers: Vec<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
    socket_path: PathBuf,
    down: bool,
}

impl WorkerPool {
    /// Spawn the workers, wait for each to connect, bootstrap them, and
    /// start the driver loops. Returns the pool and its completion channel.
    pub async fn start(
        config: PoolConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ResultReport>)> {
        let parallelism = config.parallelism.max(1);
        let socket_path =
            std::env::temp_dir().join(format!("dray-{}.sock", Uuid::new_v4().simple()));
        let listener = UnixListener::bind(&socket_path)?;

        let mut children = Vec::with_capacity(parallelism);
        let mut pumps = Vec::with_capacity(parallelism * 2);
        for _ in 0..parallelism {
            let mut child = Command::new(&config.worker_program)
                .arg("worker")
                .arg("--socket")
                .arg(&socket_path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            if let Some(out) = child.stdout.take() {
                pumps.push(pump(out, config.stdout.clone()));
            }
            if let Some(err) = child.stderr.take() {
                pumps.push(pump(err, config.stderr.clone()));
            }
            children.push(child);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(queue_rx));
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let mut drivers = Vec::with_capacity(parallelism);
        for slot in 0..parallelism {
            let (mut stream, _) =
                tokio::time::timeout(WORKER_CONNECT_TIMEOUT, listener.accept())
                    .await
                    .map_err(|_| {
                        AgentError::Environment(format!(
                            "worker {slot} did not connect within {WORKER_CONNECT_TIMEOUT:?}"
                        ))
                    })??;
            let bootstrap = WorkerBootstrap {
                slot,
                working_dir: config.working_dir.clone(),
                search_paths: config.search_paths.clone(),
                args: config.worker_args.clone(),
            };
            write_frame(&mut stream, &bootstrap).await?;
            drivers.push(tokio::spawn(driver_loop(
                slot,
                stream,
                queue.clone(),
                done_tx.clone(),
            )));
        }
        tracing::info!(parallelism, socket = %socket_path.display(), "worker pool started");

        Ok((
            Self {
                queue_tx,
                children,
                drivers,
                pumps,
                socket_path,
                down: false,
            },
            done_rx,
        ))
    }

    /// Enqueue a unit. Queues until a worker is free; no rejection.
    pub fn submit(&self, unit: TaskUnit) {
        let task_id = unit.id;
        if self.queue_tx.send(unit).is_err() {
            tracing::error!(task_id = %task_id, "task queue closed, unit dropped");
        }
    }

    /// Forcibly terminate every worker without waiting for in-flight
    /// completions, then drain the output pipes. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.down {
            return;
        }
        self.down = true;
        for child in &mut self.children {
            let _ = child.kill().await;
        }
        for driver in self.drivers.drain(..) {
            driver.abort();
        }
        // pipes hit EOF once the workers are gone; draining the pumps drops
        // their capture write ends so the forwarders can finish
        for handle in self.pumps.drain(..) {
            let _ = handle.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("worker pool terminated");
    }
}

/// One driver per worker: feed it units from the shared queue, relay each
/// report to the completion channel. A worker lost mid-task retires the
/// slot; other workers are unaffected.
async fn driver_loop(
    slot: usize,
    mut stream: UnixStream,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<TaskUnit>>>,
    done_tx: mpsc::UnboundedSender<ResultReport>,
) {
    loop {
        let unit = { queue.lock().await.recv().await };
        let Some(unit) = unit else {
            break; // pool dropped
        };
        let task_id = unit.id;
        tracing::debug!(slot, task_id = %task_id, function = %unit.invocation.function, "unit dispatched");

        if let Err(e) = write_frame(&mut stream, &WorkerRequest::Run(unit)).await {
            tracing::error!(slot, task_id = %task_id, error = %e, "worker request failed, retiring slot");
            break;
        }
        match read_frame::<_, ResultReport>(&mut stream).await {
            Ok(report) => {
                tracing::debug!(slot, task_id = %report.task_id, state = %report.state(), "unit complete");
                if done_tx.send(report).is_err() {
                    break; // completion consumer gone
                }
            }
            Err(e) => {
                tracing::error!(slot, task_id = %task_id, error = %e, "worker lost mid-task, retiring slot");
                break;
            }
        }
    }
}
