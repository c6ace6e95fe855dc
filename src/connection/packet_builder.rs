/// Worst-case header + AEAD expansion for any packet this endpoint emits
pub(crate) const MAX_PACKET_OVERHEAD: usize = 62;
/// Worst-case STREAM frame framing ahead of its data
pub(crate) const MAX_STREAM_FRAME_OVERHEAD: usize = 24;

/// Accumulates frames for a single packet at one encryption level
///
/// Tracks the remaining frame-area budget and the properties the sealed packet will carry.
pub(crate) struct PacketBuilder {
    pub(crate) payload: Vec<u8>,
    max_frame_size: usize,
    pub(crate) frame_count: usize,
    pub(crate) probing: bool,
}

impl PacketBuilder {
    /// Begin a packet within `max_packet_size` total bytes; `None` when the budget cannot
    /// fit anything beyond packet overhead
    pub(crate) fn new(max_packet_size: usize, pmtu: usize) -> Option<Self> {
        if max_packet_size <= MAX_PACKET_OVERHEAD {
            return None;
        }
        let max_frame_size = (max_packet_size - MAX_PACKET_OVERHEAD)
            .min(pmtu.saturating_sub(MAX_STREAM_FRAME_OVERHEAD + MAX_PACKET_OVERHEAD));
        if max_frame_size == 0 {
            return None;
        }
        Some(Self {
            payload: Vec::with_capacity(max_frame_size),
            max_frame_size,
            frame_count: 0,
            probing: false,
        })
    }

    /// Frame-area bytes still available
    pub(crate) fn remaining(&self) -> usize {
        self.max_frame_size.saturating_sub(self.payload.len())
    }

    /// Record that a frame was appended to `payload`
    pub(crate) fn frame_written(&mut self, probing: bool) {
        self.frame_count += 1;
        self.probing |= probing;
        debug_assert!(self.payload.len() <= self.max_frame_size);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Extend the payload with PADDING up to `min` bytes, bounded by the frame budget
    pub(crate) fn pad_to(&mut self, min: usize) {
        let target = min.min(self.max_frame_size);
        if self.payload.len() < target {
            self.payload.resize(target, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_guard() {
        assert!(PacketBuilder::new(MAX_PACKET_OVERHEAD, 1232).is_none());
        assert!(PacketBuilder::new(62, 1232).is_none());
        assert!(PacketBuilder::new(63, 1232).is_some());
    }

    #[test]
    fn budget_capped_by_pmtu() {
        let b = PacketBuilder::new(10_000, 1232).unwrap();
        assert_eq!(
            b.remaining(),
            1232 - MAX_STREAM_FRAME_OVERHEAD - MAX_PACKET_OVERHEAD
        );
    }

    #[test]
    fn padding_respects_budget() {
        let mut b = PacketBuilder::new(100, 1232).unwrap();
        b.pad_to(4);
        assert_eq!(b.payload.len(), 4);
        b.pad_to(1_000_000);
        assert_eq!(b.payload.len(), 100 - MAX_PACKET_OVERHEAD);
    }
}
