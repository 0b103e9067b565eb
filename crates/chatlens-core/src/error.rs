use thiserror::Error;

/// Synchronous rejection of an operation. A rejected call never changes state
/// and never reaches the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} already in flight")]
    Busy(&'static str),
}

impl CoreError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }
}
