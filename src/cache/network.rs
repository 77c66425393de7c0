//! The network seam the executors fetch through.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::request::{FetchRequest, FetchResponse};

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("network request failed: {message}")]
    Transport { message: String },
    #[error("network request timed out after {0:?}")]
    Timeout(Duration),
}

impl NetworkError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Something that can perform a request against the real network.
///
/// A response with any status is a success here; only transport-level
/// failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError>;
}
