use thiserror::Error;

use crate::job::JobState;

pub type Result<T> = std::result::Result<T, UmdError>;

/// Status returned by every driver entry point.
#[derive(Debug, Error)]
pub enum UmdError {
    // format errors
    #[error("invalid graph: {reason}")]
    InvalidGraph { reason: String },

    #[error("subgraph {subgraph}: invalid dependency ({reason})")]
    InvalidDependency { subgraph: u32, reason: String },

    #[error("invalid segmmu config: {reason}")]
    InvalidSegMmu { reason: String },

    #[error("invalid {kind} tensor id {id}")]
    InvalidTensorId { kind: &'static str, id: u32 },

    #[error("dynamic shape: {outputs} outputs but {shapes} output shape tensors")]
    UnmatchedOutShape { outputs: usize, shapes: usize },

    #[error("dynamic shape: output {index} has zero size")]
    ZeroTensorSize { index: usize },

    #[error("dynamic shape: input {index} shape not configured")]
    ShapeNotConfigured { index: usize },

    // resource errors
    #[error("out of device memory: {size:#x} bytes for '{name}'")]
    OutOfMemory { name: String, size: u64 },

    #[error("buffer allocation failed: {reason}")]
    BufferAllocFailed { reason: String },

    #[error("no grid id available")]
    AllocGridId,

    #[error("no contiguous range of {count} group ids available")]
    AllocGroupId { count: u32 },

    #[error("free of unknown buffer @ {pa:#x}")]
    InvalidFree { pa: u64 },

    #[error("access {pa:#x}+{size:#x} outside any allocation")]
    BadAccess { pa: u64, size: u64 },

    // state errors
    #[error("operation '{op}' invalid in state {state:?}")]
    BadState { op: &'static str, state: JobState },

    #[error("partition {partition} out of range (have {count})")]
    InvalidPartition { partition: u32, count: u32 },

    #[error("{kind} tensor {index}: {actual} bytes given, {expected} expected")]
    TensorSize { kind: &'static str, index: usize, expected: u32, actual: usize },

    #[error("input and output share reuse section {section}")]
    SharedIoConflict { section: u32 },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // transport errors
    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("poll timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("job {job_id} finished with exception")]
    JobException { job_id: u64 },
}

impl UmdError {
    pub fn invalid_graph(reason: impl Into<String>) -> Self {
        Self::InvalidGraph { reason: reason.into() }
    }

    pub fn invalid_segmmu(reason: impl Into<String>) -> Self {
        Self::InvalidSegMmu { reason: reason.into() }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    /// Format errors are fatal to the job and are never retried.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidGraph { .. }
                | Self::InvalidDependency { .. }
                | Self::InvalidSegMmu { .. }
                | Self::InvalidTensorId { .. }
                | Self::UnmatchedOutShape { .. }
                | Self::ZeroTensorSize { .. }
                | Self::ShapeNotConfigured { .. }
        )
    }

    pub fn is_resource_error(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::BufferAllocFailed { .. })
    }
}
