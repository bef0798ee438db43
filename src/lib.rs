//! Forge Gateway
//!
//! Client core for routing image-generation jobs across a pool of remote
//! generation-engine instances: connection lifecycle, load-balanced
//! selection, retry under transient failure, and live progress decoding
//! over each instance's persistent event stream.

pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod queue;

pub use engine::{
    GenerationClient, JobUpdate, LoadBalanceStrategy, MediaFile, ProgressSink,
};
pub use error::{GatewayError, Result};
pub use hooks::{HookEvent, HookKind, HookManager, HookVerdict};
pub use queue::GenerationQueue;
