use std::cmp;
use std::collections::VecDeque;
use std::mem;

use crate::crypto::Keys;
use crate::frame;
use crate::packet::SpaceId;
use crate::range_set::RangeSet;
use crate::recovery::LossDetector;
use crate::streams::Assembler;

use super::cid_state::IssuedCid;

/// Per-packet-number-space state: packet numbers, ack bookkeeping, keys, and the
/// retransmission buffer
pub(crate) struct PacketSpace {
    pub(crate) crypto: Option<Keys>,
    pub(crate) dedup: Dedup,
    /// Highest received packet number
    pub(crate) rx_packet: u64,

    /// Data queued for (re)transmission
    pub(crate) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(crate) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent
    pub(crate) next_packet_number: u64,

    /// Incoming cryptographic handshake stream
    pub(crate) crypto_stream: Assembler,
    /// Current offset of the outgoing cryptographic handshake stream
    pub(crate) crypto_offset: u64,

    /// Loss detector for this space
    pub(crate) loss: LossDetector,
}

impl PacketSpace {
    pub(crate) fn new(id: SpaceId) -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,
            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),
            next_packet_number: 0,
            crypto_stream: Assembler::new(),
            crypto_offset: 0,
            loss: LossDetector::new(id),
        }
    }

    pub(crate) fn get_tx_number(&mut self) -> u64 {
        debug_assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    /// Discard transport state while preserving packet numbers, as required after
    /// version negotiation and RETRY
    pub(crate) fn reset_transport_state(&mut self) {
        self.loss.reset();
        self.pending = Retransmits::default();
        self.crypto_stream = Assembler::new();
        self.crypto_offset = 0;
    }
}

/// Retransmittable data queue: everything the retransmission buffer re-emits when the loss
/// detector declares a packet lost
#[derive(Debug, Default)]
pub(crate) struct Retransmits {
    pub(crate) max_data: bool,
    pub(crate) crypto: VecDeque<frame::Crypto>,
    pub(crate) new_cids: Vec<IssuedCid>,
    pub(crate) retire_cids: Vec<u64>,
}

impl Retransmits {
    pub(crate) fn is_empty(&self) -> bool {
        !self.max_data
            && self.crypto.is_empty()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
    }
}

impl std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        // Queue crypto retransmits ahead of new data to reduce head-of-line blocking
        self.max_data |= rhs.max_data;
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
        self.new_cids.extend(rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
    }
}

/// RFC4303-style sliding window packet number deduplicator
///
/// A contiguous bitfield where each bit corresponds to a packet number and the rightmost bit
/// is always set. A set bit represents a packet that has been successfully authenticated.
/// Bits left of the window are assumed set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub(crate) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated
    next: u64,
}

type Window = u128;

/// Number of packets tracked by `Dedup`
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    pub(crate) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number; returns whether it might be a duplicate
    pub(crate) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}

/// Tracks which received packets still need acknowledgement; the ack frame creator
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    permit_ack_only: bool,
    ranges: RangeSet,
}

impl PendingAcks {
    /// Whether an ACK frame is due even without other frames to carry it
    pub(crate) fn can_send(&self) -> bool {
        self.permit_ack_only && !self.ranges.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record the packet number of a newly received packet and whether it elicits an ack
    pub(crate) fn update(&mut self, packet: u64, should_send_ack: bool) {
        self.ranges.insert_one(packet);
        self.permit_ack_only |= should_send_ack;

        // Bound state so a peer cannot force unbounded ack ranges
        const MAX_ACK_BLOCKS: usize = 64;
        if self.ranges.len() > MAX_ACK_BLOCKS {
            self.ranges.pop_min();
        }
    }

    /// Suppress further standalone ACKs until new ack-eliciting packets arrive
    pub(crate) fn acks_sent(&mut self) {
        self.permit_ack_only = false;
    }

    /// Forget ranges the peer has seen us acknowledge
    pub(crate) fn subtract(&mut self, acks: &RangeSet) {
        self.ranges.subtract(acks);
        if self.ranges.is_empty() {
            self.permit_ack_only = false;
        }
    }

    pub(crate) fn ranges(&self) -> &RangeSet {
        &self.ranges
    }
}
