//! Worker pool and worker-process internals.
//!
//! Task bodies never run inside the agent process. The pool spawns a fixed
//! set of long-lived worker processes and talks to each over a private Unix
//! socket; worker stdout/stderr are pipes pumped into the stream
//! forwarders.
//!
//! # Components
//!
//! - [`pool::WorkerPool`]: process lifecycle, shared task queue, one driver
//!   loop per worker, completion channel
//! - [`runner`]: the worker-process side (bootstrap, task loop)
//! - [`ipc`]: length-prefixed frames exchanged between the two
//!
//! # Execution Flow
//!
//! 1. Pool spawns `parallelism` workers and accepts one connection each
//! 2. A submitted unit is picked up by the first free driver loop
//! 3. The driver writes a `Run` frame and awaits the `ResultReport`
//! 4. The report is emitted on the completion channel, in completion order

pub mod ipc;
pub mod pool;
pub mod runner;

pub use pool::{PoolConfig, WorkerPool};
