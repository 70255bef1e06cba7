//! The replica-follower side of replication.
//!
//! A follower owns one data reader on the leader's log and a stream socket
//! connected back to the replica's listener. The leader pokes the follower
//! whenever new data lands; the follower drains everything available with the
//! zero-copy send path and reports its new position so the leader knows when
//! to poke again. Chunks travel verbatim, with no extra framing: the remote
//! acceptor finds chunk boundaries by parsing headers out of the byte stream.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::debug;

use crate::counters::ReplicaCounters;
use crate::read::LogReader;
use crate::OsilResult;

/// One follower: a data reader plus the socket it feeds.
pub struct Replica<S> {
    reader: LogReader,
    socket: S,
    counters: Arc<ReplicaCounters>,
}

impl<S: Write + AsRawFd> Replica<S> {
    /// Wrap a data reader (from [`LogReader::data`]) and a connected socket.
    pub fn new(reader: LogReader, socket: S) -> Self {
        let counters = Arc::new(ReplicaCounters::default());
        counters.set_offset(reader.next_offset());
        Self {
            reader,
            socket,
            counters,
        }
    }

    /// Handle a "more data" poke from the leader: stream chunks until end of
    /// stream, then return the offset to re-register with.
    pub fn on_more_data(&mut self) -> OsilResult<u64> {
        while let Some(sent) = self.reader.send_file(&mut self.socket, |_| {})? {
            self.counters.incr_chunks_sent();
            self.counters.set_offset(self.reader.next_offset());
            debug!(
                "replica sent {sent} bytes, now at offset {}",
                self.reader.next_offset()
            );
        }
        // end of stream; the caller re-registers us as an offset listener
        self.counters.incr_offset_listeners();
        Ok(self.reader.next_offset())
    }

    pub fn counters(&self) -> Arc<ReplicaCounters> {
        Arc::clone(&self.counters)
    }

    pub fn reader(&self) -> &LogReader {
        &self.reader
    }

    /// Tear down, handing the socket back to the owner; the reader's files
    /// close with it.
    pub fn close(self) -> S {
        self.socket
    }
}
