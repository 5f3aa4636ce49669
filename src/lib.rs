//! multicall-sync
//!
//! Block-aware batching of contract reads over Multicall.

pub mod block;
pub mod config;
pub mod error;
pub mod multicall;
pub mod retry;

pub use error::{MulticallError, Result};
