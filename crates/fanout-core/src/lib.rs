//! fanout-core: Concurrent execution engine
//!
//! Runs commands, scripts, tasks and file transfers against many targets
//! with bounded parallelism. Every target yields exactly one
//! [`TargetResult`]; failures stay with their target.

pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod factory;
pub mod pipeline;
pub mod pool;
pub mod result;

pub use action::{Action, ActionKind, ActionOptions, InputMethod, TaskFile, TaskSpec};
pub use config::ExecutorConfig;
pub use error::{CoreError, RunFailure};
pub use event::{Event, EventSink, NoopSink};
pub use executor::Executor;
pub use factory::{ConnectionFactory, DefaultConnectionFactory};
pub use pool::ConnectionPool;
pub use result::{ResultError, ResultSet, TargetResult};
