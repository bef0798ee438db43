//! Queue module - single-worker FIFO serialization of generation jobs

pub mod generation_queue;

pub use generation_queue::GenerationQueue;
