//! Session records shared by both wire transports
//!
//! A [`Session`] holds everything that must survive a reconnect: the user context, the
//! outbound retention window and the lifecycle state. The live connection is never stored
//! here; transports attach writers to a session and detach them when the connection ends.

pub mod queue;
pub mod registry;

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Notify, time::Instant};
use uuid::Uuid;

use crate::{errors::AppError, user_context::UserContext};
use queue::{Message, OutboundQueue, ResumeError};

pub use registry::{RegistryConfig, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Sse,
    StreamableHttp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// What an attached writer should do next.
#[derive(Debug)]
pub enum WriterStep {
    Deliver(Vec<Message>),
    Idle,
    /// Draining and nothing left to flush.
    Drained,
    /// A newer writer attached to this session.
    Superseded,
    Closed,
    Gone(ResumeError),
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    queue: OutboundQueue,
    last_activity: Instant,
    delivered_through: u64,
    writer_epoch: u64,
    writer_attached: bool,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    user: UserContext,
    transport: TransportKind,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    changed: Notify,
    inbound: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(user: UserContext, transport: TransportKind, retention: usize) -> Self {
        Self {
            id: generate_session_id(),
            user,
            transport,
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                queue: OutboundQueue::new(retention),
                last_activity: Instant::now(),
                delivered_through: 0,
                writer_epoch: 0,
                writer_attached: false,
            }),
            changed: Notify::new(),
            inbound: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner().queue.last_sequence()
    }

    /// Number of messages currently held in the retention window.
    pub fn retained(&self) -> usize {
        self.inner().queue.retained()
    }

    pub fn has_writer(&self) -> bool {
        self.inner().writer_attached
    }

    pub fn touch(&self) {
        self.inner().last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: std::time::Duration) -> bool {
        Instant::now().saturating_duration_since(self.inner().last_activity) > timeout
    }

    /// Appends a message to the outbound queue and wakes the writer.
    pub fn enqueue(&self, payload: Value) -> Result<u64, AppError> {
        let sequence = {
            let mut inner = self.inner();
            if inner.state == SessionState::Closed {
                return Err(AppError::not_found(&self.id));
            }
            inner.last_activity = Instant::now();
            inner.queue.push(payload)
        };
        self.changed.notify_waiters();
        Ok(sequence)
    }

    /// Cursor a new writer should start from. Without a resumption token the writer continues
    /// after the last message a previous writer handed to the wire.
    pub fn resume_cursor(&self, last_received: Option<u64>) -> Result<u64, AppError> {
        let inner = self.inner();
        if inner.state == SessionState::Closed {
            return Err(AppError::gone(format!("session {} is closed", self.id)));
        }
        let cursor = last_received.unwrap_or(inner.delivered_through);
        Ok(inner.queue.check_resume(cursor)?)
    }

    /// Claims the writer slot. Any previously attached writer observes the new epoch on its
    /// next wakeup and stops.
    pub fn attach_writer(&self) -> Result<u64, AppError> {
        let epoch = {
            let mut inner = self.inner();
            if inner.state == SessionState::Closed {
                return Err(AppError::gone(format!("session {} is closed", self.id)));
            }
            inner.writer_epoch += 1;
            inner.writer_attached = true;
            inner.last_activity = Instant::now();
            if inner.state == SessionState::Connecting {
                inner.state = SessionState::Open;
            }
            inner.writer_epoch
        };
        self.changed.notify_waiters();
        Ok(epoch)
    }

    /// Releases the writer slot if `epoch` still owns it. Returns whether it did.
    pub fn detach_writer(&self, epoch: u64) -> bool {
        let mut inner = self.inner();
        if inner.writer_epoch != epoch || !inner.writer_attached {
            return false;
        }
        inner.writer_attached = false;
        if inner.state == SessionState::Open {
            inner.state = SessionState::Connecting;
        }
        true
    }

    pub fn next_batch(&self, epoch: u64, cursor: u64) -> WriterStep {
        let inner = self.inner();
        if inner.state == SessionState::Closed {
            return WriterStep::Closed;
        }
        if inner.writer_epoch != epoch {
            return WriterStep::Superseded;
        }
        match inner.queue.after(cursor) {
            Err(err) => WriterStep::Gone(err),
            Ok(messages) if !messages.is_empty() => WriterStep::Deliver(messages),
            Ok(_) if inner.state == SessionState::Draining => WriterStep::Drained,
            Ok(_) => WriterStep::Idle,
        }
    }

    /// Whether `epoch` is still the attached writer of an unclosed session.
    pub fn owns_writer(&self, epoch: u64) -> bool {
        let inner = self.inner();
        inner.writer_attached
            && inner.writer_epoch == epoch
            && inner.state != SessionState::Closed
    }

    /// Records `sequence` as handed to the wire by writer `epoch`. A superseded writer
    /// records nothing and gets `false` back.
    pub fn mark_delivered(&self, epoch: u64, sequence: u64) -> bool {
        let mut inner = self.inner();
        if !inner.writer_attached || inner.writer_epoch != epoch {
            return false;
        }
        inner.delivered_through = inner.delivered_through.max(sequence);
        inner.last_activity = Instant::now();
        true
    }

    pub fn ensure_accepting_inbound(&self) -> Result<(), AppError> {
        match self.state() {
            SessionState::Connecting | SessionState::Open => Ok(()),
            SessionState::Draining => Err(AppError::Draining {
                session_id: self.id.clone(),
            }),
            SessionState::Closed => Err(AppError::not_found(&self.id)),
        }
    }

    /// Starts a graceful close. Returns whether a writer is attached to flush the queue.
    pub fn begin_drain(&self) -> Result<bool, AppError> {
        let has_writer = {
            let mut inner = self.inner();
            match inner.state {
                SessionState::Closed => return Err(AppError::not_found(&self.id)),
                SessionState::Draining => {}
                SessionState::Connecting | SessionState::Open => {
                    inner.state = SessionState::Draining;
                }
            }
            inner.writer_attached
        };
        self.changed.notify_waiters();
        Ok(has_writer)
    }

    pub(crate) fn close(&self) {
        close_inner(&mut self.inner());
        self.changed.notify_waiters();
    }

    /// Closes the session only if it has been idle for longer than `timeout`. The check and
    /// the close happen under one lock, so activity recorded in between keeps it alive.
    pub(crate) fn close_if_idle(&self, timeout: std::time::Duration) -> bool {
        {
            let mut inner = self.inner();
            if inner.state == SessionState::Closed
                || Instant::now().saturating_duration_since(inner.last_activity) <= timeout
            {
                return false;
            }
            close_inner(&mut inner);
        }
        self.changed.notify_waiters();
        true
    }

    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Serializes inbound dispatch so a session has at most one active reader.
    pub async fn lock_inbound(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inbound.lock().await
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn close_inner(inner: &mut SessionInner) {
    inner.state = SessionState::Closed;
    inner.writer_attached = false;
    inner.queue.clear();
}

fn generate_session_id() -> String {
    format!("mcp_{}", Uuid::new_v4().simple())
}
