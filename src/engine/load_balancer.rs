//! Load balancer implementation with multiple strategies

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::instance::EngineInstance;
use crate::engine::ProgressSink;
use crate::error::{GatewayError, Result};
use crate::hooks::{HookEvent, HookManager};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceStrategy {
    /// Cyclic distribution over currently available instances
    RoundRobin,
    /// Weighted random draw
    Random,
    /// Instance minimizing active_generations / weight
    LeastBusy,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        Self::LeastBusy
    }
}

/// Selects an instance from the pool and reconnects idle/dead instances on
/// demand.
pub struct LoadBalancer {
    instances: Vec<Arc<EngineInstance>>,
    strategy: LoadBalanceStrategy,
    hooks: Arc<HookManager>,
    /// Persistent round-robin cursor. Deliberately never reset when the set
    /// of available instances changes size, so consecutive selections may
    /// skip after a membership change.
    cursor: AtomicUsize,
    sweep_task: RwLock<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    pub fn new(
        instances: Vec<Arc<EngineInstance>>,
        strategy: LoadBalanceStrategy,
        hooks: Arc<HookManager>,
    ) -> Self {
        Self {
            instances,
            strategy,
            hooks,
            cursor: AtomicUsize::new(0),
            sweep_task: RwLock::new(None),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    pub fn instances(&self) -> &[Arc<EngineInstance>] {
        &self.instances
    }

    /// Select an instance and mark it used.
    pub async fn get_instance(
        &self,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Arc<EngineInstance>> {
        let instance = self.select_instance(sink).await?;
        instance.mark_used();
        Ok(instance)
    }

    async fn select_instance(
        &self,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Arc<EngineInstance>> {
        let mut available: Vec<Arc<EngineInstance>> = self
            .instances
            .iter()
            .filter(|i| i.is_connected() && !i.is_timed_out())
            .cloned()
            .collect();

        if available.is_empty() {
            // Reconnect anything disconnected that has no in-flight work.
            for instance in &self.instances {
                if instance.is_connected() || instance.has_active_prompts() {
                    continue;
                }
                info!(instance = %instance.base_url(), "Attempting to reconnect instance");
                self.hooks
                    .execute_hook(HookEvent::InstanceReconnect {
                        address: instance.base_url().to_string(),
                        sink: sink.clone(),
                    })
                    .await?;
                if let Err(e) = instance.initialize().await {
                    warn!(instance = %instance.base_url(), error = %e, "Reconnect failed");
                }
            }

            available = self
                .instances
                .iter()
                .filter(|i| i.is_connected())
                .cloned()
                .collect();
            if available.is_empty() {
                return Err(GatewayError::NoAvailableInstances);
            }
        }

        let selected = match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(&available),
            LoadBalanceStrategy::Random => self.select_random(&available),
            LoadBalanceStrategy::LeastBusy => self.select_least_busy(&available),
        };

        debug!(
            instance = %selected.base_url(),
            strategy = ?self.strategy,
            "Selected instance for request"
        );

        Ok(selected)
    }

    fn select_round_robin(&self, available: &[Arc<EngineInstance>]) -> Arc<EngineInstance> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        available[index % available.len()].clone()
    }

    fn select_random(&self, available: &[Arc<EngineInstance>]) -> Arc<EngineInstance> {
        let weights: Vec<u32> = available.iter().map(|i| i.weight()).collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => available[dist.sample(&mut rand::thread_rng())].clone(),
            // All-zero weights are rejected at config validation; fall back
            // to a uniform draw rather than failing the request.
            Err(_) => available[rand::thread_rng().gen_range(0..available.len())].clone(),
        }
    }

    fn select_least_busy(&self, available: &[Arc<EngineInstance>]) -> Arc<EngineInstance> {
        available
            .iter()
            .min_by(|a, b| {
                // Weight is validated >= 1, so the ratio never divides by zero.
                let ra = a.active_generations() as f64 / a.weight() as f64;
                let rb = b.active_generations() as f64 / b.weight() as f64;
                ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(&available[0])
            .clone()
    }

    /// Start the background sweep that cleans up connected, timed-out
    /// instances with no active prompts. Runs until [`stop_sweep`] aborts it.
    ///
    /// [`stop_sweep`]: LoadBalancer::stop_sweep
    pub async fn start_sweep(&self, interval: Duration) {
        let instances = self.instances.clone();
        let hooks = self.hooks.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for instance in &instances {
                    if !instance.is_connected()
                        || !instance.is_timed_out()
                        || instance.has_active_prompts()
                    {
                        continue;
                    }
                    info!(instance = %instance.base_url(), "Cleaning up idle instance");
                    if let Err(e) = hooks
                        .execute_hook(HookEvent::InstanceTimeout {
                            address: instance.base_url().to_string(),
                        })
                        .await
                    {
                        warn!(error = %e, "Timeout hook failed");
                    }
                    instance.cleanup().await;
                }
            }
        });

        *self.sweep_task.write().await = Some(handle);
        info!(interval_secs = interval.as_secs(), "Started idle-instance sweep");
    }

    /// Cancel the sweep and wait for it to wind down.
    pub async fn stop_sweep(&self) {
        if let Some(handle) = self.sweep_task.write().await.take() {
            handle.abort();
            let _ = handle.await;
            info!("Stopped idle-instance sweep");
        }
    }
}
