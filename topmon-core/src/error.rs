use thiserror::Error;

/// Failure classes produced while resolving a monitor sample or applying
/// a configuration patch. None of these abort the scheduler or the stream
/// worker; they are reported per-monitor and the next tick tries again.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("command \"{command}\" not found")]
    CommandNotFound { command: String },

    #[error("command failed (code {code:?}): {stderr}")]
    ExecutionFailed { code: Option<i32>, stderr: String },

    #[error("command timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("not a value: {output:?}")]
    NotANumber { output: String },

    #[error("sensor \"{key}\" unavailable")]
    SensorUnavailable { key: String },

    #[error("transform {expr:?} failed: {reason}")]
    TransformFailed { expr: String, reason: String },

    #[error("invalid pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("invalid monitor spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("rejected patch for \"{id}\": {reason}")]
    BadPatch { id: String, reason: String },
}
