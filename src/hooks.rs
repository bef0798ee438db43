//! Typed lifecycle hooks for cross-cutting observers
//!
//! External collaborators (security checks, logging, backoff injection)
//! subscribe to named lifecycle events of the generation client. Callbacks
//! run sequentially in registration order so later callbacks can rely on
//! earlier side effects. Veto semantics are expressed through the returned
//! [`HookVerdict`], not through errors; a callback error aborts the dispatch
//! and propagates to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::engine::ProgressSink;
use crate::error::Result;

/// The set of lifecycle events the client emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// About to initialize a pool instance.
    InstanceCreating,
    /// A pool instance finished initializing.
    InstanceCreated,
    /// About to reconnect a disconnected instance on demand.
    InstanceReconnect,
    /// An idle instance is being cleaned up by the sweep.
    InstanceTimeout,
}

/// Payload delivered to hook callbacks.
#[derive(Clone)]
pub enum HookEvent {
    InstanceCreating {
        address: String,
    },
    InstanceCreated {
        address: String,
    },
    InstanceReconnect {
        address: String,
        /// Sink the reconnect initiator was given, if any, so observers can
        /// surface "reconnecting..." style notices to the end caller.
        sink: Option<Arc<dyn ProgressSink>>,
    },
    InstanceTimeout {
        address: String,
    },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::InstanceCreating { .. } => HookKind::InstanceCreating,
            HookEvent::InstanceCreated { .. } => HookKind::InstanceCreated,
            HookEvent::InstanceReconnect { .. } => HookKind::InstanceReconnect,
            HookEvent::InstanceTimeout { .. } => HookKind::InstanceTimeout,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            HookEvent::InstanceCreating { address }
            | HookEvent::InstanceCreated { address }
            | HookEvent::InstanceReconnect { address, .. }
            | HookEvent::InstanceTimeout { address } => address,
        }
    }
}

/// Decision returned by a hook callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Allow,
    Deny(String),
}

/// Async hook callback.
pub type HookFn = Arc<dyn Fn(HookEvent) -> BoxFuture<'static, Result<HookVerdict>> + Send + Sync>;

/// Registry of hook callbacks keyed by event kind.
#[derive(Default)]
pub struct HookManager {
    hooks: RwLock<HashMap<HookKind, Vec<HookFn>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an event kind. Duplicates are allowed and all
    /// fire, in registration order.
    pub fn register_hook(&self, kind: HookKind, callback: HookFn) {
        self.hooks.write().entry(kind).or_default().push(callback);
    }

    /// Invoke every callback registered for the event's kind, sequentially,
    /// collecting verdicts. A kind with no registrations yields an empty
    /// list. The first callback error aborts and propagates.
    pub async fn execute_hook(&self, event: HookEvent) -> Result<Vec<HookVerdict>> {
        let callbacks: Vec<HookFn> = self
            .hooks
            .read()
            .get(&event.kind())
            .map(|v| v.to_vec())
            .unwrap_or_default();

        let mut verdicts = Vec::with_capacity(callbacks.len());
        for callback in callbacks {
            verdicts.push(callback(event.clone()).await?);
        }
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook(counter: Arc<AtomicUsize>, order: Arc<parking_lot::Mutex<Vec<usize>>>, id: usize) -> HookFn {
        Arc::new(move |_event| {
            let counter = counter.clone();
            let order = order.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push(id);
                Ok(HookVerdict::Allow)
            })
        })
    }

    #[tokio::test]
    async fn test_unknown_kind_yields_empty() {
        let hooks = HookManager::new();
        let verdicts = hooks
            .execute_hook(HookEvent::InstanceTimeout {
                address: "http://localhost:8188".to_string(),
            })
            .await
            .unwrap();
        assert!(verdicts.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_fire_in_registration_order() {
        let hooks = HookManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        hooks.register_hook(
            HookKind::InstanceCreated,
            counting_hook(counter.clone(), order.clone(), 1),
        );
        hooks.register_hook(
            HookKind::InstanceCreated,
            counting_hook(counter.clone(), order.clone(), 2),
        );
        hooks.register_hook(
            HookKind::InstanceCreated,
            counting_hook(counter.clone(), order.clone(), 1),
        );

        let verdicts = hooks
            .execute_hook(HookEvent::InstanceCreated {
                address: "http://localhost:8188".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(verdicts.len(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock(), vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn test_callback_error_propagates() {
        let hooks = HookManager::new();
        hooks.register_hook(
            HookKind::InstanceReconnect,
            Arc::new(|_event| {
                Box::pin(async { Err(GatewayError::Hook("observer failed".to_string())) })
            }),
        );

        let result = hooks
            .execute_hook(HookEvent::InstanceReconnect {
                address: "http://localhost:8188".to_string(),
                sink: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Hook(_))));
    }

    #[tokio::test]
    async fn test_deny_verdict_is_collected_not_raised() {
        let hooks = HookManager::new();
        hooks.register_hook(
            HookKind::InstanceCreating,
            Arc::new(|_event| {
                Box::pin(async { Ok(HookVerdict::Deny("not allowed here".to_string())) })
            }),
        );

        let verdicts = hooks
            .execute_hook(HookEvent::InstanceCreating {
                address: "http://localhost:8188".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(verdicts, vec![HookVerdict::Deny("not allowed here".to_string())]);
    }
}
