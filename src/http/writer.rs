//! The single outbound writer loop both transports frame onto the wire

use std::{sync::Arc, time::Duration};

use async_stream::stream;
use futures::Stream;
use tracing::{debug, warn};

use crate::{
    errors::AppError,
    session::{queue::Message, Session, SessionRegistry, WriterStep},
};

/// Transport-neutral unit the writer hands to a framing adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Heartbeat,
}

/// Releases the writer slot when the connection's stream is dropped, which is how a
/// vanished client shows up.
struct WriterGuard {
    session: Arc<Session>,
    epoch: u64,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if self.session.detach_writer(self.epoch) {
            let failure = AppError::WriteFailure {
                session_id: self.session.id().to_string(),
            };
            debug!(error = %failure, "writer detached, session awaiting resumption");
        }
    }
}

/// Streams the session's queued messages starting after `cursor`.
///
/// The writer attaches on first poll, waits on the session's change notification or the
/// heartbeat timer, and ends when the session closes, finishes draining, loses its
/// retention window, or another connection takes over. A message counts as delivered
/// only once the consumer comes back for the next frame.
pub fn outbound_frames(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    cursor: u64,
    heartbeat: Duration,
) -> impl Stream<Item = Frame> + Send + 'static {
    stream! {
        let epoch = match session.attach_writer() {
            Ok(epoch) => epoch,
            Err(err) => {
                warn!(session_id = %session.id(), error = %err, "writer could not attach");
                return;
            }
        };
        let _guard = WriterGuard {
            session: Arc::clone(&session),
            epoch,
        };
        debug!(session_id = %session.id(), epoch, cursor, "writer attached");

        let mut cursor = cursor;
        loop {
            let notified = session.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match session.next_batch(epoch, cursor) {
                WriterStep::Deliver(messages) => {
                    for message in messages {
                        let sequence = message.sequence;
                        if !session.owns_writer(epoch) {
                            debug!(session_id = %session.id(), epoch, "writer superseded mid-batch");
                            return;
                        }
                        yield Frame::Message(message);
                        if !session.mark_delivered(epoch, sequence) {
                            debug!(session_id = %session.id(), epoch, sequence, "writer superseded before delivery was recorded");
                            return;
                        }
                        cursor = sequence;
                    }
                    continue;
                }
                WriterStep::Idle => {}
                WriterStep::Drained => {
                    if let Err(err) = registry.evict(session.id()) {
                        debug!(session_id = %session.id(), error = %err, "drained session already evicted");
                    }
                    break;
                }
                WriterStep::Superseded => {
                    debug!(session_id = %session.id(), epoch, "writer superseded by a newer connection");
                    break;
                }
                WriterStep::Closed => break,
                WriterStep::Gone(err) => {
                    warn!(session_id = %session.id(), error = %err, "undelivered messages left the retention window");
                    break;
                }
            }

            let heartbeat_due = tokio::select! {
                _ = &mut notified => false,
                _ = tokio::time::sleep(heartbeat) => true,
            };
            if heartbeat_due {
                session.touch();
                yield Frame::Heartbeat;
            }
        }
    }
}
