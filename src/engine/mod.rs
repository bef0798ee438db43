//! Engine module - instance pool, load balancing, and the generation client

pub mod client;
pub mod instance;
pub mod load_balancer;
pub mod stream;

pub use client::GenerationClient;
pub use instance::{EngineAuth, EngineInstance};
pub use load_balancer::{LoadBalanceStrategy, LoadBalancer};

use async_trait::async_trait;

/// One unit of media produced by a generation, held fully in memory.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// A status update pushed to the caller while a job runs.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: String,
    pub media: Option<MediaFile>,
}

impl JobUpdate {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            media: None,
        }
    }

    pub fn with_media(status: impl Into<String>, media: MediaFile) -> Self {
        Self {
            status: status.into(),
            media: Some(media),
        }
    }
}

/// Receiver for job status updates. The command/UI layer implements this to
/// edit its in-flight message; tests implement it to record the sequence.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send(&self, update: JobUpdate);
}
