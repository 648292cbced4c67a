use std::collections::HashMap;

use crate::accumulator::AccumulatorContext;
use crate::error::TaskError;
use crate::task::TaskValue;

/// A registered task body.
pub type TaskFn =
    Box<dyn Fn(&TaskValue, &mut AccumulatorContext) -> Result<TaskValue, TaskError> + Send + Sync>;

/// Named-function registry resolving task invocations.
///
/// Task descriptors carry a function name plus arguments rather than
/// serialized code; only functions registered here can execute, which keeps
/// the worker boundary free of arbitrary-code deserialization. Embedders
/// extend the set with [`TaskRegistry::register`].
pub struct TaskRegistry {
    functions: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// The framework's built-in operations: `echo`, `print`, `sum`,
    /// `generate` and `fail`. These double as the controller's smoke-test
    /// probes.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", |args, _ctx| Ok(args.clone()));
        registry.register("print", |args, _ctx| {
            let TaskValue::Text(line) = args else {
                return Err(TaskError::BadArguments("print expects text".into()));
            };
            println!("{line}");
            Ok(TaskValue::Null)
        });
        registry.register("sum", sum);
        registry.register("generate", generate);
        registry.register("fail", |args, _ctx| {
            let reason = match args {
                TaskValue::Text(msg) => msg.clone(),
                _ => "fault requested".to_string(),
            };
            Err(TaskError::Aborted(reason))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(&TaskValue, &mut AccumulatorContext) -> Result<TaskValue, TaskError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.into(), Box::new(body));
    }

    pub fn resolve(&self, name: &str) -> Option<&TaskFn> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Numeric reduction over a list; counts reduced elements in the
/// `sum.elements` accumulator. Returns `Int` unless any element is a float.
fn sum(args: &TaskValue, ctx: &mut AccumulatorContext) -> Result<TaskValue, TaskError> {
    let TaskValue::List(items) = args else {
        return Err(TaskError::BadArguments("sum expects a list".into()));
    };
    let mut total = 0.0f64;
    let mut integral = true;
    for item in items {
        match item {
            TaskValue::Int(i) => total += *i as f64,
            TaskValue::Float(f) => {
                total += *f;
                integral = false;
            }
            other => {
                return Err(TaskError::BadArguments(format!(
                    "sum expects numbers, got {other:?}"
                )))
            }
        }
        ctx.add("sum.elements", 1);
    }
    if integral {
        Ok(TaskValue::Int(total as i64))
    } else {
        Ok(TaskValue::Float(total))
    }
}

/// Synthesize a text payload of the requested byte length; the exerciser for
/// the result-overflow path. Counts produced bytes in `generate.bytes`.
fn generate(args: &TaskValue, ctx: &mut AccumulatorContext) -> Result<TaskValue, TaskError> {
    let TaskValue::Int(len) = args else {
        return Err(TaskError::BadArguments("generate expects a byte count".into()));
    };
    if *len < 0 {
        return Err(TaskError::BadArguments(format!(
            "generate expects a non-negative byte count, got {len}"
        )));
    }
    ctx.add("generate.bytes", *len);
    Ok(TaskValue::Text("x".repeat(*len as usize)))
}
