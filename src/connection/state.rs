use crate::frame::Close;

/// Hard cap on closing-frame transmissions while in the closing state
const CLOSING_MAX_SEND_PACKETS: u8 = 8;
/// Receive-window ceiling for the closing-state response backoff
const CLOSING_MAX_RECV_WINDOW: u32 = 1 << CLOSING_MAX_SEND_PACKETS;

/// The connection lifecycle as an explicit tagged state
///
/// Transitions only move forward; events arriving in a state whose table does not list them
/// are rejected by the dispatcher, never silently ignored.
pub(crate) enum State {
    /// Created but not yet bound to its event loop
    PreHandshake,
    /// Exchanging handshake flights
    Handshake,
    /// Application data flows
    Established,
    /// We initiated closure and answer peer packets with the closing frame, backing off
    Closing(Closing),
    /// The peer initiated closure (or we idled out); we emit nothing further
    Draining,
    /// Terminal; awaiting teardown
    Closed,
}

impl State {
    pub(crate) fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }

    pub(crate) fn is_handshake(&self) -> bool {
        matches!(self, Self::PreHandshake | Self::Handshake)
    }

    /// Whether the connection has begun shutting down
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, Self::Closing(_) | Self::Draining | Self::Closed)
    }

    pub(crate) fn is_drained(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::PreHandshake => "pre_handshake",
            Self::Handshake => "handshake",
            Self::Established => "established",
            Self::Closing(_) => "closing",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Closing-state bookkeeping: the frozen closing frame and the response backoff window
///
/// A response MAY re-use the identical serialized packet. The window doubles after each
/// response so a chatty peer sees exponentially fewer of them.
pub(crate) struct Closing {
    pub(crate) reason: Close,
    /// The sealed packet carrying our closing frame, built once on first send
    pub(crate) final_packet: Option<Vec<u8>>,
    recv_count: u32,
    recv_window: u32,
    sent_count: u8,
}

impl Closing {
    pub(crate) fn new(reason: Close) -> Self {
        Self {
            reason,
            final_packet: None,
            recv_count: 0,
            recv_window: 1,
            sent_count: 0,
        }
    }

    /// Count one received packet; returns whether a response send is now due
    pub(crate) fn on_packet_received(&mut self) -> bool {
        self.recv_count += 1;
        if self.recv_window < CLOSING_MAX_RECV_WINDOW && self.recv_count >= self.recv_window {
            self.recv_count = 0;
            self.recv_window <<= 1;
            return true;
        }
        false
    }

    /// Record a transmission; returns false once the hard cap is reached
    pub(crate) fn record_sent(&mut self) -> bool {
        if self.sent_count >= CLOSING_MAX_SEND_PACKETS {
            return false;
        }
        self.sent_count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ApplicationClose, Close};
    use bytes::Bytes;

    fn closing() -> Closing {
        Closing::new(Close::Application(ApplicationClose {
            error_code: 0,
            reason: Bytes::new(),
        }))
    }

    #[test]
    fn response_window_doubles() {
        let mut c = closing();
        // Window 1: first packet triggers a response and the window doubles to 2
        assert!(c.on_packet_received());
        assert!(!c.on_packet_received());
        assert!(c.on_packet_received());
        // Window is now 4
        for _ in 0..3 {
            assert!(!c.on_packet_received());
        }
        assert!(c.on_packet_received());
    }

    #[test]
    fn window_caps_out() {
        let mut c = closing();
        let mut responses = 0;
        for _ in 0..100_000 {
            if c.on_packet_received() {
                responses += 1;
            }
        }
        // 1 + 2 + 4 + ... + 128 = 255 packets trigger the first 8 responses; afterwards the
        // window is pinned at 2^8 and no further doubling occurs
        assert_eq!(responses, CLOSING_MAX_SEND_PACKETS as u32);
    }

    #[test]
    fn send_cap() {
        let mut c = closing();
        for _ in 0..CLOSING_MAX_SEND_PACKETS {
            assert!(c.record_sent());
        }
        assert!(!c.record_sent());
    }
}
