//! Liveness and readiness reporting for orchestration probes

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::Serialize;

use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
}

/// Reads only atomics, so a check costs the same regardless of how many sessions exist.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    started: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
}

impl HealthCheck {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
            registry,
        }
    }

    /// Called by the entry point once the listener is bound.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn check(&self) -> HealthStatus {
        let live = self.started.load(Ordering::Acquire);
        HealthStatus {
            live,
            ready: live && self.registry.is_accepting(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}
