//! Time-driven recovery: RTT estimation, the per-space sent-packet ledger, ack processing,
//! and loss declaration feeding the retransmission buffer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::congestion::Controller;
use crate::connection::spaces::Retransmits;
use crate::frame;
use crate::frame::StreamMetaVec;
use crate::packet::SpaceId;
use crate::range_set::RangeSet;
use crate::transport_error::Error as TransportError;

/// Maximum reordering in packet number space before FACK-style loss detection considers a
/// packet lost
const PACKET_THRESHOLD: u64 = 3;
/// Minimum timer granularity
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Floor on the retransmission timeout
const MIN_RTO: Duration = Duration::from_millis(200);
/// Exponent applied to ACK Delay fields when no transport parameter overrides it
const ACK_DELAY_EXPONENT: u64 = 3;

/// RTT estimation for a network path
#[derive(Copy, Clone)]
pub(crate) struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation
    pub(crate) fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + std::cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        self.min = self.min.min(self.latest);
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

/// A transmitted packet subject to acknowledgement or loss
#[derive(Debug)]
pub(crate) struct SentPacket {
    /// The time the packet was sent
    pub(crate) time_sent: Instant,
    /// Bytes sent in the packet, including QUIC framing but not UDP or IP overhead
    pub(crate) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet
    pub(crate) ack_eliciting: bool,
    /// Ack ranges carried by this packet, pruned from the pending set once acknowledged
    pub(crate) acks: RangeSet,
    /// Data to re-queue if the packet is declared lost
    pub(crate) retransmits: Retransmits,
    /// Metadata for stream frames carried by the packet
    pub(crate) stream_frames: StreamMetaVec,
}

/// Result of processing one ACK frame
#[derive(Default)]
pub(crate) struct AckOutcome {
    pub(crate) newly_acked: Vec<SentPacket>,
    pub(crate) lost: Vec<SentPacket>,
}

/// Per-space loss detector
///
/// Owns the sent-packet ledger for one packet number space. Fed packet-sent and ack events by
/// the connection; read for the current RTO period and in-flight budget.
pub(crate) struct LossDetector {
    space: SpaceId,
    sent_packets: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    largest_sent: Option<u64>,
    bytes_in_flight: u64,
    /// Consecutive timeout-driven loss rounds without an intervening ack
    pto_count: u32,
}

impl LossDetector {
    pub(crate) fn new(space: SpaceId) -> Self {
        Self {
            space,
            sent_packets: BTreeMap::new(),
            largest_acked: None,
            largest_sent: None,
            bytes_in_flight: 0,
            pto_count: 0,
        }
    }

    /// Record a transmitted packet; packet numbers must be strictly increasing
    pub(crate) fn on_packet_sent(&mut self, pn: u64, packet: SentPacket) {
        debug_assert!(
            self.largest_sent.map_or(true, |prev| pn > prev),
            "packet numbers must be strictly increasing within a space"
        );
        self.largest_sent = Some(pn);
        if packet.ack_eliciting {
            self.bytes_in_flight += u64::from(packet.size);
        }
        self.sent_packets.insert(pn, packet);
    }

    pub(crate) fn largest_acked_packet_number(&self) -> Option<u64> {
        self.largest_acked
    }

    pub(crate) fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// The interval after which unacknowledged packets are presumed lost
    pub(crate) fn current_rto_period(&self, rtt: &RttEstimator) -> Duration {
        rtt.pto_base().max(MIN_RTO) * 2u32.saturating_pow(self.pto_count.min(10))
    }

    /// Process an ACK frame, returning acked packets and any packets newly declared lost
    pub(crate) fn on_ack_received(
        &mut self,
        now: Instant,
        next_pn: u64,
        ack: &frame::Ack,
        rtt: &mut RttEstimator,
        congestion: &mut dyn Controller,
    ) -> Result<AckOutcome, TransportError> {
        if ack.largest >= next_pn {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "acknowledgement of unsent packet",
            ));
        }

        let mut outcome = AckOutcome::default();
        let new_largest = self
            .largest_acked
            .map_or(true, |prev| ack.largest > prev)
            .then_some(ack.largest);
        for range in ack.iter() {
            let acked: Vec<u64> = self
                .sent_packets
                .range(range)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in acked {
                let packet = self.sent_packets.remove(&pn).unwrap();
                if packet.ack_eliciting {
                    self.bytes_in_flight -= u64::from(packet.size);
                }
                if pn == ack.largest {
                    let sample = now.saturating_duration_since(packet.time_sent);
                    let delay = Duration::from_micros(ack.delay << ACK_DELAY_EXPONENT);
                    rtt.update(delay, sample);
                }
                congestion.on_ack(now, packet.time_sent, u64::from(packet.size), false);
                outcome.newly_acked.push(packet);
            }
        }
        if new_largest.is_some() && !outcome.newly_acked.is_empty() {
            self.largest_acked = new_largest.or(self.largest_acked);
            self.pto_count = 0;
        } else if let Some(largest) = new_largest {
            self.largest_acked = Some(largest);
        }

        outcome.lost = self.detect_lost_by_reordering(now, rtt);
        if let Some(first) = outcome.lost.iter().find(|p| p.ack_eliciting) {
            congestion.on_congestion_event(now, first.time_sent, false);
        }
        if !outcome.newly_acked.is_empty() || !outcome.lost.is_empty() {
            trace!(
                space = ?self.space,
                acked = outcome.newly_acked.len(),
                lost = outcome.lost.len(),
                "processed ACK"
            );
        }
        Ok(outcome)
    }

    /// Packet- and time-threshold loss detection, run when an ack advances the horizon
    fn detect_lost_by_reordering(&mut self, now: Instant, rtt: &RttEstimator) -> Vec<SentPacket> {
        let largest_acked = match self.largest_acked {
            Some(x) => x,
            None => return Vec::new(),
        };
        let loss_delay = rtt.get() + rtt.get() / 8;
        let mut lost_pns = Vec::new();
        for (&pn, packet) in self.sent_packets.range(..largest_acked) {
            if pn + PACKET_THRESHOLD <= largest_acked
                || now.saturating_duration_since(packet.time_sent) > loss_delay
            {
                lost_pns.push(pn);
            }
        }
        lost_pns
            .into_iter()
            .map(|pn| {
                let packet = self.sent_packets.remove(&pn).unwrap();
                if packet.ack_eliciting {
                    self.bytes_in_flight -= u64::from(packet.size);
                }
                trace!(space = ?self.space, pn, "packet lost");
                packet
            })
            .collect()
    }

    /// Time-driven loss pass, run periodically from the write path
    ///
    /// Packets older than the current RTO period are presumed lost and returned for
    /// retransmission; each non-empty round backs the RTO off further.
    pub(crate) fn detect_lost_by_timeout(
        &mut self,
        now: Instant,
        rtt: &RttEstimator,
    ) -> Vec<SentPacket> {
        let rto = self.current_rto_period(rtt);
        let lost_pns: Vec<u64> = self
            .sent_packets
            .iter()
            .filter(|(_, p)| p.ack_eliciting && now.saturating_duration_since(p.time_sent) > rto)
            .map(|(&pn, _)| pn)
            .collect();
        if lost_pns.is_empty() {
            return Vec::new();
        }
        self.pto_count += 1;
        lost_pns
            .into_iter()
            .map(|pn| {
                let packet = self.sent_packets.remove(&pn).unwrap();
                self.bytes_in_flight -= u64::from(packet.size);
                trace!(space = ?self.space, pn, "retransmission timeout");
                packet
            })
            .collect()
    }

    /// Discard all transport state except packet numbers
    pub(crate) fn reset(&mut self) {
        self.sent_packets.clear();
        self.largest_acked = None;
        self.bytes_in_flight = 0;
        self.pto_count = 0;
    }

    /// Release the ledger on connection teardown
    pub(crate) fn shutdown(&mut self) {
        self.sent_packets.clear();
        self.bytes_in_flight = 0;
    }
}
