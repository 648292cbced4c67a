use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accumulator::AccumulatorSnapshot;
use crate::error::{AgentError, Result};

/// The value domain task bodies compute over.
///
/// Self-contained so it round-trips through both result encoding schemes;
/// conversions to and from JSON exist for the CLI and for embedders that
/// speak JSON at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<TaskValue>),
    Map(BTreeMap<String, TaskValue>),
}

impl TaskValue {
    pub fn from_json(value: &serde_json::Value) -> TaskValue {
        match value {
            serde_json::Value::Null => TaskValue::Null,
            serde_json::Value::Bool(b) => TaskValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TaskValue::Int(i)
                } else {
                    TaskValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => TaskValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                TaskValue::List(items.iter().map(TaskValue::from_json).collect())
            }
            serde_json::Value::Object(map) => TaskValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), TaskValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TaskValue::Null => serde_json::Value::Null,
            TaskValue::Bool(b) => serde_json::Value::Bool(*b),
            TaskValue::Int(i) => serde_json::Value::Number((*i).into()),
            TaskValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            TaskValue::Text(s) => serde_json::Value::String(s.clone()),
            TaskValue::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::Number((*byte).into())).collect(),
            ),
            TaskValue::List(items) => {
                serde_json::Value::Array(items.iter().map(TaskValue::to_json).collect())
            }
            TaskValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// What a task asks a worker to do: a registered function plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub function: String,
    pub args: TaskValue,
}

/// One unit of work as dispatched by the controller.
///
/// Immutable once received; owned by exactly one worker slot until its
/// outcome is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUnit {
    pub id: Uuid,
    pub attempt: u32,
    pub invocation: TaskInvocation,
}

impl TaskUnit {
    pub fn new(function: impl Into<String>, args: TaskValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: 0,
            invocation: TaskInvocation {
                function: function.into(),
                args,
            },
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(AgentError::Decode)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AgentError::Internal(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Finished,
    Failed,
    Lost,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Lost => write!(f, "lost"),
        }
    }
}

/// Result payload flag bit: generic serialization scheme was used
/// (otherwise the fast native scheme).
pub const FLAG_GENERIC: u8 = 0b01;
/// Result payload flag bit: the payload was spilled to shared storage and
/// `data` carries the path instead of inline bytes.
pub const FLAG_SPILLED: u8 = 0b10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultData {
    Inline(Vec<u8>),
    Spilled(PathBuf),
}

/// An encoded task result, inline or spilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub flag: u8,
    pub data: ResultData,
}

impl ResultPayload {
    /// An inline payload. `scheme` is 0 for native, [`FLAG_GENERIC`] otherwise.
    pub fn inline(scheme: u8, bytes: Vec<u8>) -> Self {
        Self {
            flag: scheme & FLAG_GENERIC,
            data: ResultData::Inline(bytes),
        }
    }

    /// A spilled payload referencing a file on shared storage.
    pub fn spilled(scheme: u8, path: PathBuf) -> Self {
        Self {
            flag: (scheme & FLAG_GENERIC) | FLAG_SPILLED,
            data: ResultData::Spilled(path),
        }
    }

    pub fn is_spilled(&self) -> bool {
        self.flag & FLAG_SPILLED != 0
    }

    pub fn is_generic(&self) -> bool {
        self.flag & FLAG_GENERIC != 0
    }

    /// Decode the payload back into a value, reading the spill file if
    /// necessary. This is the consumer (controller) side of the encoding.
    pub fn decode_value(&self) -> Result<TaskValue> {
        let bytes = match &self.data {
            ResultData::Inline(bytes) => bytes.clone(),
            ResultData::Spilled(path) => std::fs::read(path)?,
        };
        if self.is_generic() {
            serde_json::from_slice(&bytes).map_err(|e| AgentError::Internal(e.to_string()))
        } else {
            bincode::deserialize(&bytes).map_err(AgentError::Decode)
        }
    }
}

/// Terminal fate of one task unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success(ResultPayload),
    Failure { trace: String },
}

/// Wire shape of a terminal result, sent as the payload of the terminal
/// status message. Accumulators are reported only on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub task_id: Uuid,
    pub outcome: TaskOutcome,
    pub accumulators: Option<AccumulatorSnapshot>,
}

impl ResultReport {
    pub fn state(&self) -> TaskState {
        match self.outcome {
            TaskOutcome::Success(_) => TaskState::Finished,
            TaskOutcome::Failure { .. } => TaskState::Failed,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AgentError::Internal(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(AgentError::Decode)
    }
}

/// One lifecycle update for one task, as delivered to the controller.
///
/// Sent at most twice per task: once `Running` on acceptance, once with the
/// terminal state.
#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub task_id: Uuid,
    pub state: TaskState,
    pub payload: Option<Vec<u8>>,
    pub at: DateTime<Utc>,
}
