//! Minimal stream multiplexing: per-stream buffers, stream-level flow control, and the
//! frame producer/consumer surface the connection core drives.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::coding::{self, BufExt, BufMutExt};
use crate::frame::{self, FrameStruct, StreamMeta};
use crate::transport_error::Error as TransportError;
use crate::transport_parameters::TransportParameters;
use crate::Side;

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            self.initiator(),
            dir,
            self.index()
        )
    }
}

impl coding::Codec for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0)
    }
}

/// Reassembles out-of-order chunks into an in-order byte stream
///
/// Data at offsets already delivered is silently discarded, which is what makes stale
/// retransmissions and post-handshake leftovers harmless.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    offset: u64,
    buffered: BTreeMap<u64, Bytes>,
    ready: VecDeque<Bytes>,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of contiguous bytes delivered so far
    pub(crate) fn bytes_assembled(&self) -> u64 {
        self.offset
    }

    pub(crate) fn insert(&mut self, mut offset: u64, mut data: Bytes) {
        if offset + data.len() as u64 <= self.offset {
            return;
        }
        if offset < self.offset {
            data.advance((self.offset - offset) as usize);
            offset = self.offset;
        }
        let keep_existing = self
            .buffered
            .get(&offset)
            .map_or(false, |existing| existing.len() >= data.len());
        if !keep_existing {
            self.buffered.insert(offset, data);
        }
        // Drain whatever is now contiguous
        while let Some((&off, _)) = self.buffered.iter().next() {
            if off > self.offset {
                break;
            }
            let mut chunk = self.buffered.remove(&off).unwrap();
            if off < self.offset {
                let overlap = (self.offset - off) as usize;
                if overlap >= chunk.len() {
                    continue;
                }
                chunk.advance(overlap);
            }
            self.offset += chunk.len() as u64;
            self.ready.push_back(chunk);
        }
    }

    pub(crate) fn read(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }
}

#[derive(Debug, Default)]
struct Send {
    /// Offset at which newly written data will be queued
    write_offset: u64,
    /// Largest offset handed to the packetizer, for total-offset accounting
    max_sent: u64,
    /// Chunks queued for (re)transmission
    pending: VecDeque<(u64, Bytes)>,
    /// Chunks in flight, keyed by their starting offset
    unacked: BTreeMap<u64, Bytes>,
    /// Final size, once the application finished the stream
    fin_offset: Option<u64>,
    fin_pending: bool,
    /// Peer-imposed stream-level limit
    max_data: u64,
}

#[derive(Debug, Default)]
struct Recv {
    assembler: Assembler,
    /// Largest offset seen, for connection-level accounting
    largest: u64,
    /// Bytes handed to the application
    bytes_read: u64,
    /// Stream-level limit we advertised
    max_data: u64,
    /// Advertised limit at the time of the last MAX_STREAM_DATA we sent
    announced: u64,
    window: u64,
}

/// A STREAM-layer frame ready for packetization
#[derive(Debug)]
pub(crate) enum StreamFrameOut {
    Stream { meta: StreamMeta, data: Bytes },
    MaxStreamData { id: StreamId, offset: u64 },
    StreamBlocked { id: StreamId, offset: u64 },
}

/// Owns per-stream state and produces/consumes stream-layer frames
///
/// The connection core treats this as an opaque frame producer gated by connection-level
/// flow-control credit; stream-level limits are enforced internally.
pub(crate) struct StreamManager {
    side: Side,
    send: FxHashMap<StreamId, Send>,
    recv: FxHashMap<StreamId, Recv>,
    next_index: [u64; 2],
    /// Streams with newly readable data, drained by the connection into events
    readable: VecDeque<StreamId>,
    /// Streams that need a MAX_STREAM_DATA frame
    pending_window_updates: VecDeque<StreamId>,
    /// Streams blocked on stream-level credit, pending a STREAM_BLOCKED frame
    pending_blocked: VecDeque<StreamId>,
    send_window: u64,
    recv_window: u64,
    total_offset_sent: u64,
    total_offset_received: u64,
}

impl StreamManager {
    pub(crate) fn new(side: Side) -> Self {
        Self {
            side,
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            next_index: [0, 0],
            readable: VecDeque::new(),
            pending_window_updates: VecDeque::new(),
            pending_blocked: VecDeque::new(),
            send_window: 0,
            recv_window: 0,
            total_offset_sent: 0,
            total_offset_received: 0,
        }
    }

    /// Apply negotiated stream-level windows from both sides' transport parameters
    pub(crate) fn init_flow_control_params(
        &mut self,
        local_tp: &TransportParameters,
        remote_tp: Option<&TransportParameters>,
    ) {
        self.recv_window = local_tp.initial_max_stream_data_bidi_remote.into_inner();
        if let Some(remote) = remote_tp {
            self.send_window = remote.initial_max_stream_data_bidi_local.into_inner();
        }
        for send in self.send.values_mut() {
            send.max_data = send.max_data.max(self.send_window);
        }
        for recv in self.recv.values_mut() {
            recv.window = self.recv_window;
            recv.max_data = recv.max_data.max(self.recv_window);
        }
    }

    pub(crate) fn open(&mut self, dir: Dir) -> StreamId {
        let index = self.next_index[dir as usize];
        self.next_index[dir as usize] += 1;
        let id = StreamId::new(self.side, dir, index);
        self.send.insert(
            id,
            Send {
                max_data: self.send_window,
                ..Send::default()
            },
        );
        id
    }

    pub(crate) fn write(&mut self, id: StreamId, data: Bytes) {
        let window = self.send_window;
        let send = self.send.entry(id).or_insert_with(|| Send {
            max_data: window,
            ..Send::default()
        });
        let offset = send.write_offset;
        send.write_offset += data.len() as u64;
        send.pending.push_back((offset, data));
    }

    pub(crate) fn finish(&mut self, id: StreamId) {
        if let Some(send) = self.send.get_mut(&id) {
            send.fin_offset = Some(send.write_offset);
            send.fin_pending = true;
        }
    }

    pub(crate) fn read(&mut self, id: StreamId) -> Option<Bytes> {
        let recv = self.recv.get_mut(&id)?;
        let chunk = recv.assembler.read()?;
        recv.bytes_read += chunk.len() as u64;
        // Replenish the stream-level window once half of it has been consumed
        if recv.window != 0 && recv.bytes_read + recv.window >= recv.announced + recv.window / 2 {
            recv.max_data = recv.bytes_read + recv.window;
            self.pending_window_updates.push_back(id);
        }
        Some(chunk)
    }

    pub(crate) fn poll_readable(&mut self) -> Option<StreamId> {
        self.readable.pop_front()
    }

    /// Total new-data bytes handed to the packetizer across all streams
    pub(crate) fn total_offset_sent(&self) -> u64 {
        self.total_offset_sent
    }

    /// Sum of the largest received offsets across all streams
    pub(crate) fn total_offset_received(&self) -> u64 {
        self.total_offset_received
    }

    /// Bytes delivered to applications in order across all streams
    pub(crate) fn total_reordered_bytes(&self) -> u64 {
        self.recv
            .values()
            .map(|r| r.assembler.bytes_assembled())
            .sum()
    }

    /// Handle an incoming STREAM frame; returns whether stream bytes were consumed
    pub(crate) fn on_stream(&mut self, frame: frame::Stream) -> Result<bool, TransportError> {
        let window = self.recv_window;
        let recv = self.recv.entry(frame.id).or_insert_with(|| Recv {
            max_data: window,
            announced: window,
            window,
            ..Recv::default()
        });
        let end = frame.offset + frame.data.len() as u64;
        if recv.max_data != 0 && end > recv.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "stream-level flow control limit exceeded",
            ));
        }
        if end > recv.largest {
            self.total_offset_received += end - recv.largest;
            recv.largest = end;
        }
        let before = recv.assembler.bytes_assembled();
        recv.assembler.insert(frame.offset, frame.data);
        if recv.assembler.bytes_assembled() > before {
            self.readable.push_back(frame.id);
        }
        Ok(true)
    }

    pub(crate) fn on_max_stream_data(&mut self, id: StreamId, offset: u64) {
        let window = self.send_window;
        let send = self.send.entry(id).or_insert_with(|| Send {
            max_data: window,
            ..Send::default()
        });
        if offset > send.max_data {
            send.max_data = offset;
        }
    }

    /// Whether any stream-layer frame could be produced right now
    pub(crate) fn will_generate_frame(&self) -> bool {
        !self.pending_window_updates.is_empty()
            || !self.pending_blocked.is_empty()
            || self.send.values().any(|s| {
                s.fin_pending
                    || s.pending
                        .front()
                        .map_or(false, |(off, _)| s.max_data == 0 || *off < s.max_data)
            })
    }

    /// Whether any stream has data queued, regardless of stream-level credit
    pub(crate) fn has_pending_data(&self) -> bool {
        self.send
            .values()
            .any(|s| !s.pending.is_empty() || s.fin_pending)
    }

    /// Produce the next stream-layer frame within `conn_credit` connection-level bytes and
    /// `max_size` encoded bytes
    pub(crate) fn poll_transmit(
        &mut self,
        conn_credit: u64,
        max_size: usize,
    ) -> Option<StreamFrameOut> {
        if max_size < frame::Stream::SIZE_BOUND {
            return None;
        }

        if let Some(id) = self.pending_window_updates.pop_front() {
            if let Some(recv) = self.recv.get(&id) {
                let offset = recv.max_data;
                return Some(StreamFrameOut::MaxStreamData { id, offset });
            }
        }
        if let Some(id) = self.pending_blocked.pop_front() {
            if let Some(send) = self.send.get(&id) {
                return Some(StreamFrameOut::StreamBlocked {
                    id,
                    offset: send.max_data,
                });
            }
        }

        let budget = max_size - frame::Stream::SIZE_BOUND;
        for (&id, send) in self.send.iter_mut() {
            let (offset, mut data) = match send.pending.pop_front() {
                Some(x) => x,
                None => {
                    if send.fin_pending {
                        send.fin_pending = false;
                        let offset = send.fin_offset.unwrap_or(send.write_offset);
                        return Some(StreamFrameOut::Stream {
                            meta: StreamMeta {
                                id,
                                offsets: offset..offset,
                                fin: true,
                            },
                            data: Bytes::new(),
                        });
                    }
                    continue;
                }
            };

            // Stream-level credit
            if send.max_data != 0 && offset >= send.max_data {
                send.pending.push_front((offset, data));
                self.pending_blocked.push_back(id);
                continue;
            }
            let mut limit = budget.min(data.len());
            if send.max_data != 0 {
                limit = limit.min((send.max_data - offset) as usize);
            }
            // New data is also bounded by connection-level credit; retransmissions are not
            if offset + limit as u64 > send.max_sent {
                let new_bytes = offset + limit as u64 - send.max_sent;
                let allowed = new_bytes.min(conn_credit);
                limit -= (new_bytes - allowed) as usize;
            }
            if limit == 0 {
                send.pending.push_front((offset, data));
                continue;
            }
            if limit < data.len() {
                let rest = data.split_off(limit);
                send.pending.push_front((offset + limit as u64, rest));
            }
            let end = offset + data.len() as u64;
            if end > send.max_sent {
                self.total_offset_sent += end - send.max_sent;
                send.max_sent = end;
            }
            let fin = send.fin_offset == Some(end) && send.pending.is_empty();
            if fin {
                send.fin_pending = false;
            }
            send.unacked.insert(offset, data.clone());
            trace!(%id, offset, len = data.len(), fin, "STREAM");
            return Some(StreamFrameOut::Stream {
                meta: StreamMeta {
                    id,
                    offsets: offset..end,
                    fin,
                },
                data,
            });
        }
        None
    }

    /// Drop retained data covered by a newly acknowledged frame
    pub(crate) fn ack(&mut self, meta: &StreamMeta) {
        if let Some(send) = self.send.get_mut(&meta.id) {
            send.unacked.remove(&meta.offsets.start);
        }
    }

    /// Re-queue data from a frame declared lost
    pub(crate) fn retransmit(&mut self, meta: StreamMeta) {
        if let Some(send) = self.send.get_mut(&meta.id) {
            if let Some(data) = send.unacked.remove(&meta.offsets.start) {
                send.pending.push_front((meta.offsets.start, data));
            }
            if meta.fin {
                send.fin_pending = true;
            }
        }
    }

    /// Discard all transmission state, keeping application data queued for a fresh start
    pub(crate) fn reset(&mut self) {
        for send in self.send.values_mut() {
            let mut chunks: Vec<(u64, Bytes)> = send.unacked.iter().map(|(o, d)| (*o, d.clone())).collect();
            chunks.sort_by_key(|(o, _)| *o);
            for (offset, data) in chunks.into_iter().rev() {
                send.pending.push_front((offset, data));
            }
            send.unacked.clear();
            send.max_sent = 0;
        }
        self.total_offset_sent = 0;
    }
}
