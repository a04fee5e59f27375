//! Core error types for fanout-core

use thiserror::Error;

use crate::result::ResultSet;

/// Contract violations, raised before any target is touched
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The action needs at least one target
    #[error("no targets given")]
    EmptyTargets,

    /// The action payload is incomplete or inconsistent
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// A batch in which at least one target failed, raised when errors are not
/// caught
#[derive(Error, Debug)]
#[error("{} of {} target(s) failed", .result_set.error_set().count(), .result_set.count())]
pub struct RunFailure {
    /// Every result of the batch, successes included
    pub result_set: ResultSet,
}
