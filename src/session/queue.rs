//! Bounded, sequence-numbered retention window for outbound messages

use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;

use crate::errors::AppError;

/// One framed outbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sequence: u64,
    pub payload: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResumeError {
    #[error("sequence {requested} is older than the retention window (first retained: {first_retained})")]
    Evicted { requested: u64, first_retained: u64 },
    #[error("sequence {requested} was never issued (last issued: {last_issued})")]
    NeverIssued { requested: u64, last_issued: u64 },
}

impl From<ResumeError> for AppError {
    fn from(err: ResumeError) -> Self {
        AppError::gone(err.to_string())
    }
}

/// Sequences start at 1, so a cursor of 0 means "nothing received yet".
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    entries: VecDeque<Message>,
    last_sequence: u64,
    evicted_through: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            last_sequence: 0,
            evicted_through: 0,
        }
    }

    /// Appends a payload, evicting the oldest entry once the window is full.
    pub fn push(&mut self, payload: Value) -> u64 {
        self.last_sequence += 1;
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.evicted_through = evicted.sequence;
            }
        }
        self.entries.push_back(Message {
            sequence: self.last_sequence,
            payload,
        });
        self.last_sequence
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn retained(&self) -> usize {
        self.entries.len()
    }

    /// Validates that everything after `last_received` is still retained.
    pub fn check_resume(&self, last_received: u64) -> Result<u64, ResumeError> {
        if last_received > self.last_sequence {
            return Err(ResumeError::NeverIssued {
                requested: last_received,
                last_issued: self.last_sequence,
            });
        }
        if last_received < self.evicted_through {
            return Err(ResumeError::Evicted {
                requested: last_received,
                first_retained: self.evicted_through + 1,
            });
        }
        Ok(last_received)
    }

    /// Messages with a sequence above `cursor`, oldest first.
    pub fn after(&self, cursor: u64) -> Result<Vec<Message>, ResumeError> {
        self.check_resume(cursor)?;
        Ok(self
            .entries
            .iter()
            .filter(|message| message.sequence > cursor)
            .cloned()
            .collect())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
