//! Error types for the scheduler core.
//!
//! Configuration errors are fatal at construction. Capacity and timeout
//! errors are recoverable and returned to the caller. Task errors stay with
//! the task that produced them and travel on the completion channel.

use std::time::Duration;

use thiserror::Error;

/// Invalid initialization parameters. The engine refuses to start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("at least one stream is required")]
    NoStreams,

    #[error("duplicate stream name '{name}'")]
    DuplicateStream { name: String },

    #[error("stream '{stream}': phase offset {offset} must be below 12")]
    PhaseOffset { stream: String, offset: u8 },

    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("failed to read config {path}: {message}")]
    Load { path: String, message: String },

    #[error("malformed config: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn out_of_range(field: &'static str, value: f64, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value,
            expected,
        }
    }
}

/// The executor already holds `max` unfinished tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("executor at capacity: {pending} pending tasks (max {max})")]
pub struct CapacityError {
    pub pending: usize,
    pub max: usize,
}

/// A bounded wait ran out before everything it was waiting on finished.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{what} timed out after {waited:?} with {outstanding} outstanding")]
pub struct TimeoutError {
    pub what: &'static str,
    pub waited: Duration,
    pub outstanding: usize,
}

/// Failure of a single task. Never propagated to sibling tasks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("stream {stream} state is leased by another task")]
    StreamBusy { stream: usize },

    #[error("task cancelled before it started")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EchoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("run was cancelled")]
    Cancelled,

    #[error("unknown task id {0}")]
    UnknownTask(u64),

    #[error("unknown stream id {0}")]
    UnknownStream(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("i/o on {path}: {message}")]
    Io { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, EchoError>;
