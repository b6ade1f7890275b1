//! Connection-update batches.
//!
//! `GetConnectionsUpdate` is answered by zero or more `ConnectionUpdateV4/V6`
//! frames followed by one `ConnectionUpdateEnd`. Other frames (log lines, new
//! connections) may be interleaved with the run. [`UpdateBatchAssembler`]
//! collects the run into one [`UpdateBatch`] and passes everything else
//! through untouched.
//!
//! A request is "active" while [`BatchRequests`] holds a non-zero count. The
//! sender registers a request before writing the command and cancels it if
//! the write fails; the assembler consumes one registration per sentinel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::protocol::{ConnectionUpdateV4, ConnectionUpdateV6, Info};

/// Shared count of `GetConnectionsUpdate` requests still awaiting their
/// sentinel.
///
/// Cloning shares the counter.
#[derive(Debug, Clone, Default)]
pub struct BatchRequests {
    pending: Arc<AtomicUsize>,
}

impl BatchRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request. Call before the command is written.
    pub fn register(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Roll back a registration whose command was never delivered.
    pub fn cancel(&self) {
        self.release();
    }

    /// Number of requests still awaiting `ConnectionUpdateEnd`.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending() > 0
    }

    /// Decrement if non-zero. Returns whether a request was closed.
    fn release(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One record inside an [`UpdateBatch`], in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEntry {
    V4(ConnectionUpdateV4),
    V6(ConnectionUpdateV6),
}

/// All updates answering one `GetConnectionsUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    pub entries: Vec<BatchEntry>,
}

impl UpdateBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn v4(&self) -> impl Iterator<Item = &ConnectionUpdateV4> {
        self.entries.iter().filter_map(|entry| match entry {
            BatchEntry::V4(update) => Some(update),
            BatchEntry::V6(_) => None,
        })
    }

    pub fn v6(&self) -> impl Iterator<Item = &ConnectionUpdateV6> {
        self.entries.iter().filter_map(|entry| match entry {
            BatchEntry::V6(update) => Some(update),
            BatchEntry::V4(_) => None,
        })
    }
}

/// Outcome of feeding one info to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStep {
    /// Not part of the batch protocol; deliver as is.
    Passthrough(Info),
    /// Update stored in the open batch.
    Buffered,
    /// Sentinel received; the batch is complete.
    Complete(UpdateBatch),
    /// Update or sentinel with no request outstanding. The info is kept.
    Violation { reason: &'static str, info: Info },
}

/// Groups update runs into batches.
#[derive(Debug)]
pub struct UpdateBatchAssembler {
    requests: BatchRequests,
    current: UpdateBatch,
}

impl UpdateBatchAssembler {
    pub fn new(requests: BatchRequests) -> Self {
        Self {
            requests,
            current: UpdateBatch::default(),
        }
    }

    /// Handle shared with the command side.
    pub fn requests(&self) -> &BatchRequests {
        &self.requests
    }

    /// Updates buffered for the open batch.
    pub fn buffered(&self) -> usize {
        self.current.len()
    }

    /// Take the updates of a batch that never saw its end marker.
    ///
    /// Called when the stream stops; returns `None` if nothing is buffered.
    pub fn finish(&mut self) -> Option<UpdateBatch> {
        if self.current.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }

    pub fn accept(&mut self, info: Info) -> BatchStep {
        match info {
            Info::ConnectionUpdateV4(_) | Info::ConnectionUpdateV6(_)
                if !self.requests.is_active() =>
            {
                BatchStep::Violation {
                    reason: "connection update outside a batch",
                    info,
                }
            }
            Info::ConnectionUpdateV4(update) => {
                self.current.entries.push(BatchEntry::V4(update));
                BatchStep::Buffered
            }
            Info::ConnectionUpdateV6(update) => {
                self.current.entries.push(BatchEntry::V6(update));
                BatchStep::Buffered
            }
            Info::ConnectionUpdateEnd => {
                if self.requests.release() {
                    BatchStep::Complete(std::mem::take(&mut self.current))
                } else {
                    BatchStep::Violation {
                        reason: "update end without a pending request",
                        info,
                    }
                }
            }
            other => BatchStep::Passthrough(other),
        }
    }
}
