//! Worker-process side of the pool.
//!
//! A worker is a child process of the agent. It connects back over the
//! pool's Unix socket, applies its bootstrap, then serves `Run` frames one
//! at a time until the pool hangs up. Faults inside a task body, including
//! panics, become `Failure` outcomes; they never take the worker down.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tokio::net::UnixStream;

use crate::accumulator::AccumulatorContext;
use crate::encode::encode_result;
use crate::registry::TaskRegistry;
use crate::task::{ResultReport, TaskOutcome, TaskUnit, TaskValue};
use crate::worker::ipc::{read_frame, write_frame, WorkerBootstrap, WorkerRequest};

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Capture panic location and backtrace at the raise site, so a task fault
/// reports a full diagnostic trace instead of a bare message.
fn install_panic_capture() {
    panic::set_hook(Box::new(|info| {
        let trace = format!("{info}\n{}", Backtrace::force_capture());
        PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
    }));
}

/// Worker-process entry point: serve task requests until the pool hangs up.
pub async fn run(socket: &Path, registry: &TaskRegistry) -> io::Result<()> {
    let mut stream = UnixStream::connect(socket).await?;
    let bootstrap: WorkerBootstrap = read_frame(&mut stream).await?;
    apply_bootstrap(&bootstrap);
    install_panic_capture();

    let mut ctx = AccumulatorContext::new();
    loop {
        let request: WorkerRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // pool hung up
            Err(e) => return Err(e),
        };
        let WorkerRequest::Run(unit) = request;
        let report = execute_unit(registry, unit, &mut ctx, &bootstrap.working_dir);
        write_frame(&mut stream, &report).await?;
    }
    Ok(())
}

fn apply_bootstrap(bootstrap: &WorkerBootstrap) {
    if !bootstrap.search_paths.is_empty() {
        let mut paths = bootstrap.search_paths.clone();
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        if let Ok(joined) = std::env::join_paths(paths) {
            std::env::set_var("PATH", joined);
        }
    }
    tracing::debug!(slot = bootstrap.slot, args = ?bootstrap.args, "worker bootstrapped");
}

/// Run one unit in full isolation: reset the slot's accumulators, run the
/// body, encode the result, and build the report. Never panics outward.
pub fn execute_unit(
    registry: &TaskRegistry,
    unit: TaskUnit,
    ctx: &mut AccumulatorContext,
    workdir: &Path,
) -> ResultReport {
    ctx.clear();
    let task_id = unit.id;
    let outcome = match run_body(registry, &unit, ctx) {
        Ok(value) => match encode_result(task_id, &value, workdir) {
            Ok(payload) => TaskOutcome::Success(payload),
            Err(e) => TaskOutcome::Failure {
                trace: format!(
                    "task {task_id} attempt {} ({}): result encoding failed: {e}",
                    unit.attempt, unit.invocation.function
                ),
            },
        },
        Err(trace) => TaskOutcome::Failure { trace },
    };
    let accumulators = match outcome {
        TaskOutcome::Success(_) => Some(ctx.snapshot()),
        TaskOutcome::Failure { .. } => None,
    };
    ResultReport {
        task_id,
        outcome,
        accumulators,
    }
}

fn run_body(
    registry: &TaskRegistry,
    unit: &TaskUnit,
    ctx: &mut AccumulatorContext,
) -> std::result::Result<TaskValue, String> {
    let function = &unit.invocation.function;
    let Some(body) = registry.resolve(function) else {
        return Err(format!(
            "task {} attempt {}: unknown task function: {function}",
            unit.id, unit.attempt
        ));
    };

    PANIC_TRACE.with(|slot| slot.borrow_mut().take());
    match panic::catch_unwind(AssertUnwindSafe(|| body(&unit.invocation.args, ctx))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(format!(
            "task {} attempt {} ({function}): {fault}",
            unit.id, unit.attempt
        )),
        Err(payload) => {
            let detail = PANIC_TRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| "<no backtrace captured>".to_string());
            Err(format!(
                "task {} attempt {} ({function}): panicked: {}\n{detail}",
                unit.id,
                unit.attempt,
                panic_message(payload.as_ref())
            ))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::{ResultData, TaskValue};

    fn unit(function: &str, args: TaskValue) -> TaskUnit {
        TaskUnit::new(function, args)
    }

    #[test]
    fn success_resets_and_snapshots_accumulators() {
        let registry = TaskRegistry::standard();
        let mut ctx = AccumulatorContext::new();
        ctx.add("stale", 99);
        let dir = tempfile::tempdir().unwrap();

        let report = execute_unit(
            &registry,
            unit("sum", TaskValue::List(vec![TaskValue::Int(2), TaskValue::Int(3)])),
            &mut ctx,
            dir.path(),
        );

        let TaskOutcome::Success(payload) = &report.outcome else {
            panic!("expected success, got {:?}", report.outcome);
        };
        assert_eq!(payload.decode_value().unwrap(), TaskValue::Int(5));
        let accumulators = report.accumulators.expect("accumulators on success");
        assert_eq!(accumulators.get("sum.elements"), Some(&2));
        // the stale value from the previous task is gone
        assert_eq!(accumulators.get("stale"), None);
    }

    #[test]
    fn fault_becomes_failure_with_context() {
        let registry = TaskRegistry::standard();
        let mut ctx = AccumulatorContext::new();
        let dir = tempfile::tempdir().unwrap();

        let u = unit("fail", TaskValue::Text("injected".into()));
        let task_id = u.id;
        let report = execute_unit(&registry, u, &mut ctx, dir.path());

        assert_eq!(report.task_id, task_id);
        let TaskOutcome::Failure { trace } = &report.outcome else {
            panic!("expected failure");
        };
        assert!(trace.contains(&task_id.to_string()));
        assert!(trace.contains("injected"));
        assert!(report.accumulators.is_none());
    }

    #[test]
    fn panic_becomes_failure_not_a_crash() {
        let mut registry = TaskRegistry::empty();
        registry.register("explode", |_args, _ctx| -> Result<TaskValue, TaskError> {
            panic!("kaboom")
        });
        let mut ctx = AccumulatorContext::new();
        let dir = tempfile::tempdir().unwrap();

        let report = execute_unit(&registry, unit("explode", TaskValue::Null), &mut ctx, dir.path());

        let TaskOutcome::Failure { trace } = &report.outcome else {
            panic!("expected failure");
        };
        assert!(trace.contains("kaboom"));
        assert!(!trace.is_empty());
    }

    #[test]
    fn unknown_function_is_a_failure() {
        let registry = TaskRegistry::standard();
        let mut ctx = AccumulatorContext::new();
        let dir = tempfile::tempdir().unwrap();

        let report = execute_unit(&registry, unit("no_such_fn", TaskValue::Null), &mut ctx, dir.path());

        let TaskOutcome::Failure { trace } = &report.outcome else {
            panic!("expected failure");
        };
        assert!(trace.contains("unknown task function"));
    }

    #[test]
    fn oversized_result_spills_from_the_worker() {
        let registry = TaskRegistry::standard();
        let mut ctx = AccumulatorContext::new();
        let dir = tempfile::tempdir().unwrap();

        let u = unit("generate", TaskValue::Int(2 * 1024 * 1024));
        let task_id = u.id;
        let report = execute_unit(&registry, u, &mut ctx, dir.path());

        let TaskOutcome::Success(payload) = &report.outcome else {
            panic!("expected success");
        };
        assert!(payload.is_spilled());
        match &payload.data {
            ResultData::Spilled(path) => {
                assert_eq!(path, &dir.path().join(format!("{task_id}.result")));
                assert!(path.exists());
            }
            other => panic!("expected spilled, got {other:?}"),
        }
    }
}
