use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("malformed descriptor: {0}")]
    Decode(bincode::Error),

    #[error("result not encodable (native: {native}; generic: {generic})")]
    Unencodable {
        native: bincode::Error,
        generic: serde_json::Error,
    },

    #[error("execution environment: {0}")]
    Environment(String),

    #[error("operation not valid while agent is {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// A fault raised by a task body. Task faults are data reported back to the
/// controller, not agent control-flow errors.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("unknown task function: {0}")]
    UnknownFunction(String),

    #[error("bad task arguments: {0}")]
    BadArguments(String),

    #[error("task aborted: {0}")]
    Aborted(String),
}
