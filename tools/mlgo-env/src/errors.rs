use thiserror::Error;

#[derive(Debug, Error)]
pub enum MlgoError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("truncated buffer for tensor `{tensor}`: expected {expected} bytes, got {actual}")]
    TruncatedBuffer {
        tensor: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("illegal transition: {0}")]
    Transition(String),
    #[error("task error: {0}")]
    Task(String),
    #[error("trace digest mismatch: {0}")]
    DigestMismatch(String),
}

impl MlgoError {
    /// Errors that mean the byte stream itself is unusable.
    pub fn is_stream_corruption(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::TruncatedBuffer { .. })
    }
}
