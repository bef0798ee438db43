//! Single-worker FIFO serializer for generation jobs
//!
//! The remote engines run jobs on their own; this queue serializes the
//! calling process's submission/monitoring loop so one job at a time is
//! being driven locally. One failed job never stops the drain.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, info};

type Job = BoxFuture<'static, anyhow::Result<()>>;

struct QueueState {
    jobs: VecDeque<Job>,
    /// True while a drain task is alive. Guarded by the same mutex as the
    /// FIFO so the empty-check/idle transition cannot race an enqueue.
    processing: bool,
}

/// FIFO of deferred generation jobs with a single drain worker.
#[derive(Clone)]
pub struct GenerationQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Default for GenerationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                jobs: VecDeque::new(),
                processing: false,
            })),
        }
    }

    /// Append a job and start the drain loop if it is not already running.
    /// Never blocks the caller.
    pub fn add_to_queue<F>(&self, job: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let start_drain = {
            let mut state = self.state.lock();
            state.jobs.push_back(Box::pin(job));
            info!(queue_size = state.jobs.len(), "Added generation to queue");
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };

        if start_drain {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
    }

    async fn drain(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                match state.jobs.pop_front() {
                    Some(job) => {
                        debug!(remaining = state.jobs.len(), "Processing generation from queue");
                        job
                    }
                    None => {
                        state.processing = false;
                        return;
                    }
                }
            };

            if let Err(e) = job.await {
                error!(error = %e, "Error processing generation");
            }
        }
    }

    /// Number of jobs waiting behind the one being processed.
    pub fn get_queue_position(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Whether the drain loop is currently live.
    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }
}
