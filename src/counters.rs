//! Cross-task shared state: the committed/first offset cells and the
//! observability counter blocks.
//!
//! Every log instance is owned by a single task; these atomics are the only
//! state that crosses task boundaries. The committed-offset cell is written by
//! the process that computes quorum acknowledgement and read by offset
//! readers; the first-offset cell is written by retention and read by the
//! writer at rollover.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "no offset committed yet".
const NONE: u64 = u64::MAX;

/// The two per-log shared offset cells.
#[derive(Debug)]
pub struct SharedOffsets {
    committed: AtomicU64,
    first: AtomicU64,
}

impl Default for SharedOffsets {
    fn default() -> Self {
        Self {
            committed: AtomicU64::new(NONE),
            first: AtomicU64::new(0),
        }
    }
}

impl SharedOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest offset declared durable, if any.
    pub fn committed_offset(&self) -> Option<u64> {
        match self.committed.load(Ordering::Acquire) {
            NONE => None,
            v => Some(v),
        }
    }

    /// Raise the committed offset. Stores are monotonic; a lower value than
    /// the current one is ignored.
    pub fn set_committed_offset(&self, offset: u64) {
        let _ = self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur == NONE || offset > cur).then_some(offset)
            });
    }

    /// The smallest offset still present in the log.
    pub fn first_offset(&self) -> u64 {
        self.first.load(Ordering::Acquire)
    }

    /// Raise the first offset after retention. Monotonic, like
    /// [`set_committed_offset`](Self::set_committed_offset).
    pub fn set_first_offset(&self, offset: u64) {
        self.first.fetch_max(offset, Ordering::AcqRel);
    }
}

/// Per-log counter block.
#[derive(Debug, Default)]
pub struct LogCounters {
    offset: AtomicU64,
    first_offset: AtomicU64,
    chunks: AtomicU64,
}

impl LogCounters {
    /// The next offset the writer will assign.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn first_offset(&self) -> u64 {
        self.first_offset.load(Ordering::Acquire)
    }

    /// Chunks appended over the life of this writer.
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Acquire)
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    pub(crate) fn set_first_offset(&self, offset: u64) {
        self.first_offset.store(offset, Ordering::Release);
    }

    pub(crate) fn incr_chunks(&self) {
        self.chunks.fetch_add(1, Ordering::AcqRel);
    }
}

/// Per-replica-reader counter block.
#[derive(Debug, Default)]
pub struct ReplicaCounters {
    chunks_sent: AtomicU64,
    offset: AtomicU64,
    offset_listeners: AtomicU64,
}

impl ReplicaCounters {
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Acquire)
    }

    /// The follower's read position, i.e. the next offset it will stream.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn offset_listeners(&self) -> u64 {
        self.offset_listeners.load(Ordering::Acquire)
    }

    pub(crate) fn incr_chunks_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    pub(crate) fn incr_offset_listeners(&self) {
        self.offset_listeners.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_offset_is_monotonic() {
        let shared = SharedOffsets::new();
        assert_eq!(shared.committed_offset(), None);

        shared.set_committed_offset(5);
        assert_eq!(shared.committed_offset(), Some(5));

        shared.set_committed_offset(3);
        assert_eq!(shared.committed_offset(), Some(5));

        shared.set_committed_offset(0xffff_fffe);
        assert_eq!(shared.committed_offset(), Some(0xffff_fffe));
    }

    #[test]
    fn first_offset_never_decreases() {
        let shared = SharedOffsets::new();
        shared.set_first_offset(10);
        shared.set_first_offset(4);
        assert_eq!(shared.first_offset(), 10);
    }
}
