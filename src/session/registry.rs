//! Process-wide index of live sessions
//!
//! The index lock is held only while inserting, looking up or removing entries. Anything
//! that touches a session's queue or state goes through the session's own lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Session, TransportKind};
use crate::{errors::AppError, user_context::UserContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub retention: usize,
    pub idle_timeout: Duration,
}

#[derive(Debug)]
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    count: AtomicUsize,
    accepting: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            sweeper: Mutex::new(None),
        }
    }

    pub fn create(
        &self,
        user: UserContext,
        transport: TransportKind,
    ) -> Result<Arc<Session>, AppError> {
        let session = {
            let mut sessions = self.write_index();
            if !self.accepting.load(Ordering::Acquire) || sessions.len() >= self.config.max_sessions
            {
                return Err(AppError::CapacityExceeded {
                    limit: self.config.max_sessions,
                });
            }

            let session = Arc::new(Session::new(user, transport, self.config.retention));
            sessions.insert(session.id().to_string(), Arc::clone(&session));
            self.count.store(sessions.len(), Ordering::Release);
            session
        };

        info!(
            session_id = %session.id(),
            user_id = %session.user().user_id(),
            transport = ?transport,
            "session created"
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, AppError> {
        self.read_index()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(session_id))
    }

    pub fn touch(&self, session_id: &str) -> Result<(), AppError> {
        self.get(session_id)?.touch();
        Ok(())
    }

    pub fn enqueue(&self, session_id: &str, payload: Value) -> Result<u64, AppError> {
        self.get(session_id)?.enqueue(payload)
    }

    /// Starts a graceful close. Sessions without an attached writer have nothing to flush
    /// onto and are evicted right away.
    pub fn drain(&self, session_id: &str) -> Result<(), AppError> {
        let session = self.get(session_id)?;
        let has_writer = session.begin_drain()?;
        info!(session_id = %session_id, has_writer, "session draining");
        if !has_writer {
            self.evict(session_id)?;
        }
        Ok(())
    }

    pub fn evict(&self, session_id: &str) -> Result<(), AppError> {
        let session = {
            let mut sessions = self.write_index();
            let removed = sessions.remove(session_id);
            self.count.store(sessions.len(), Ordering::Release);
            removed
        }
        .ok_or_else(|| AppError::not_found(session_id))?;

        session.close();
        info!(
            session_id = %session_id,
            lifetime_secs = (Utc::now() - session.created_at()).num_seconds(),
            "session closed"
        );
        Ok(())
    }

    /// Evicts the session if it is still idle once the index is locked. Returns whether it
    /// was evicted.
    pub fn evict_if_idle(&self, session_id: &str) -> bool {
        let session = {
            let mut sessions = self.write_index();
            let idle = sessions
                .get(session_id)
                .is_some_and(|session| session.close_if_idle(self.config.idle_timeout));
            if !idle {
                return false;
            }
            let removed = sessions.remove(session_id);
            self.count.store(sessions.len(), Ordering::Release);
            removed
        };

        if let Some(session) = session {
            info!(
                session_id = %session_id,
                lifetime_secs = (Utc::now() - session.created_at()).num_seconds(),
                "idle session closed"
            );
        }
        true
    }

    /// Evicts every session idle for longer than the configured timeout.
    pub fn sweep_idle(&self) -> usize {
        let candidates: Vec<Arc<Session>> = self
            .read_index()
            .values()
            .filter(|session| session.is_idle(self.config.idle_timeout))
            .cloned()
            .collect();

        let mut evicted = 0;
        for session in candidates {
            if self.evict_if_idle(session.id()) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.len(), "idle sessions evicted");
        }
        evicted
    }

    /// Spawns the background idle sweeper. Only one sweeper runs per registry.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("session sweeper already running");
            return;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_idle();
            }
        }));
        info!(interval_secs = interval.as_secs(), "session sweeper started");
    }

    /// Stops accepting sessions, stops the sweeper and closes every live session.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.write_index();
            self.count.store(0, Ordering::Release);
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            session.close();
        }
        info!(closed = drained.len(), "session registry shut down");
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a new handshake would currently be admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && self.len() < self.config.max_sessions
    }

    fn read_index(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
