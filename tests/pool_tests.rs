use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dray::forward::{LogSink, StreamForwarder, StreamWriter};
use dray::task::{ResultReport, TaskOutcome, TaskState, TaskUnit, TaskValue};
use dray::worker::{PoolConfig, WorkerPool};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(60);

fn worker_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dray"))
}

#[derive(Clone, Default)]
struct RecordingSink {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSink {
    fn text(&self) -> String {
        let chunks = self.chunks.lock().unwrap();
        chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.chunks.lock().unwrap().push(chunk.to_vec());
        Ok(())
    }
}

struct TestPool {
    pool: WorkerPool,
    completions: mpsc::UnboundedReceiver<ResultReport>,
    stdout: RecordingSink,
    out_writer: StreamWriter,
    out_forwarder: StreamForwarder,
    err_writer: StreamWriter,
    err_forwarder: StreamForwarder,
    _workdir: tempfile::TempDir,
}

impl TestPool {
    async fn start(parallelism: usize) -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let stdout = RecordingSink::default();
        let (out_writer, out_forwarder) =
            StreamForwarder::start("out> ", Box::new(stdout.clone()));
        let (err_writer, err_forwarder) =
            StreamForwarder::start("err> ", Box::new(RecordingSink::default()));

        let (pool, completions) = WorkerPool::start(PoolConfig {
            parallelism,
            worker_program: worker_program(),
            working_dir: workdir.path().to_path_buf(),
            search_paths: Vec::new(),
            worker_args: Vec::new(),
            stdout: out_writer.clone(),
            stderr: err_writer.clone(),
        })
        .await
        .expect("pool starts");

        Self {
            pool,
            completions,
            stdout,
            out_writer,
            out_forwarder,
            err_writer,
            err_forwarder,
            _workdir: workdir,
        }
    }

    async fn next_completion(&mut self) -> ResultReport {
        timeout(RECV_TIMEOUT, self.completions.recv())
            .await
            .expect("completion within timeout")
            .expect("completion channel open")
    }

    /// Kill the workers and drain both forwarders so recorded output is
    /// complete before assertions.
    async fn teardown(mut self) -> RecordingSink {
        self.pool.shutdown().await;
        drop(self.out_writer);
        drop(self.err_writer);
        self.out_forwarder.join().await;
        self.err_forwarder.join().await;
        self.stdout.clone()
    }
}

#[tokio::test]
async fn unit_runs_and_completes_with_inline_native_result() {
    let mut harness = TestPool::start(1).await;

    let unit = TaskUnit::new("echo", TaskValue::Int(42));
    let task_id = unit.id;
    harness.pool.submit(unit);

    let report = harness.next_completion().await;
    assert_eq!(report.task_id, task_id);
    assert_eq!(report.state(), TaskState::Finished);
    let TaskOutcome::Success(payload) = &report.outcome else {
        panic!("expected success, got {:?}", report.outcome);
    };
    assert_eq!(payload.flag, 0);
    assert_eq!(payload.decode_value().unwrap(), TaskValue::Int(42));
    assert!(report.accumulators.is_some());

    harness.teardown().await;
}

#[tokio::test]
async fn failing_unit_reports_a_trace() {
    let mut harness = TestPool::start(1).await;

    let unit = TaskUnit::new("fail", TaskValue::Text("deliberate".into()));
    let task_id = unit.id;
    harness.pool.submit(unit);

    let report = harness.next_completion().await;
    assert_eq!(report.task_id, task_id);
    assert_eq!(report.state(), TaskState::Failed);
    let TaskOutcome::Failure { trace } = &report.outcome else {
        panic!("expected failure");
    };
    assert!(trace.contains("deliberate"));
    assert!(trace.contains(&task_id.to_string()));
    assert!(report.accumulators.is_none());

    harness.teardown().await;
}

#[tokio::test]
async fn queued_units_all_complete_across_workers() {
    let mut harness = TestPool::start(2).await;

    let mut expected = HashSet::new();
    for i in 0..8i64 {
        let unit = TaskUnit::new(
            "sum",
            TaskValue::List(vec![TaskValue::Int(i), TaskValue::Int(i)]),
        );
        expected.insert(unit.id);
        harness.pool.submit(unit);
    }

    let mut seen = HashSet::new();
    for _ in 0..8 {
        let report = harness.next_completion().await;
        assert_eq!(report.state(), TaskState::Finished);
        seen.insert(report.task_id);
    }
    assert_eq!(seen, expected);

    harness.teardown().await;
}

#[tokio::test]
async fn one_failure_does_not_disturb_other_units() {
    let mut harness = TestPool::start(2).await;

    let good = TaskUnit::new("echo", TaskValue::Text("ok".into()));
    let bad = TaskUnit::new("fail", TaskValue::Text("bad".into()));
    let good_id = good.id;
    let bad_id = bad.id;
    harness.pool.submit(bad);
    harness.pool.submit(good);

    let mut states = std::collections::HashMap::new();
    for _ in 0..2 {
        let report = harness.next_completion().await;
        states.insert(report.task_id, report.state());
    }
    assert_eq!(states.get(&good_id), Some(&TaskState::Finished));
    assert_eq!(states.get(&bad_id), Some(&TaskState::Failed));

    harness.teardown().await;
}

#[tokio::test]
async fn worker_stdout_is_pumped_to_the_sink() {
    let mut harness = TestPool::start(1).await;

    let unit = TaskUnit::new("print", TaskValue::Text("from-pool-worker".into()));
    harness.pool.submit(unit);
    let report = harness.next_completion().await;
    assert_eq!(report.state(), TaskState::Finished);

    let stdout = harness.teardown().await;
    assert!(
        stdout.text().contains("out> from-pool-worker\n"),
        "captured output was: {:?}",
        stdout.text()
    );
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let harness = TestPool::start(1).await;
    let mut pool = harness.pool;
    pool.shutdown().await;
    pool.shutdown().await; // second call must not fault
}
