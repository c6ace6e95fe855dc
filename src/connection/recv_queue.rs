use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::BytesMut;

/// A raw datagram as delivered by the UDP demultiplexer
#[derive(Debug)]
pub struct Datagram {
    /// Source address the datagram arrived from
    pub remote: SocketAddr,
    /// Undecrypted datagram contents, possibly several coalesced packets
    pub contents: BytesMut,
}

/// Lock-protected FIFO of raw datagrams awaiting decryption
///
/// `enqueue` may be called from the demultiplexer thread; everything else runs on the
/// connection's event-loop thread. This is the only lock taken on the hot receive path, and
/// it is never held while any other lock is acquired.
#[derive(Debug, Default)]
pub struct RecvQueue {
    inner: Mutex<VecDeque<Datagram>>,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread-safe handoff from the demultiplexer
    pub fn enqueue(&self, datagram: Datagram) {
        self.inner.lock().unwrap().push_back(datagram);
    }

    pub(crate) fn pop(&self) -> Option<Datagram> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Return the remainder of a coalesced datagram for the next dequeue
    pub(crate) fn requeue_front(&self, datagram: Datagram) {
        self.inner.lock().unwrap().push_front(datagram);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued, e.g. after RETRY invalidates in-flight packets
    pub(crate) fn reset(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Outcome of a single dequeue-and-decrypt attempt
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DequeueResult {
    /// The queue is empty
    NoPacket,
    /// Keys for this packet's level are not yet available
    NotReady,
    /// Packet protection removal failed
    Failed,
    /// The packet was skipped without affecting connection state
    Ignored,
    /// The packet carries an unsupported version
    Unsupported,
    /// A packet was decrypted and is ready for processing
    Success,
}
