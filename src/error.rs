//! Error taxonomy for the multicall subsystem
//!
//! Three kinds matter to the scheduler:
//! - `Retryable`: transient RPC trouble or a read from a lagging node, retried with backoff
//! - `Cancelled`: the work was superseded, never reported to consumers
//! - `Fatal`: the call itself is bad, recorded as an error state for the affected keys

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MulticallError {
    /// Transient failure, worth another attempt
    #[error("retryable: {0}")]
    Retryable(String),

    /// Superseded by a newer block or explicit teardown
    #[error("cancelled")]
    Cancelled,

    /// Non-retryable contract/ABI failure
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid call key: {0}")]
    InvalidCallKey(String),

    #[error("config error: {0}")]
    Config(String),

    /// The scheduler event loop has stopped
    #[error("scheduler is closed")]
    SchedulerClosed,
}

impl MulticallError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MulticallError::Retryable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MulticallError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, MulticallError>;
