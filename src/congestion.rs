//! Congestion control: the controller contract and a NewReno implementation

use std::sync::Arc;
use std::time::Instant;

/// Common interface for different congestion controllers
pub trait Controller: Send {
    /// Packet deliveries were confirmed
    ///
    /// `app_limited` indicates whether the connection was blocked on outgoing
    /// application data at the time the packet was sent, rather than on the window.
    fn on_ack(&mut self, now: Instant, sent: Instant, bytes: u64, app_limited: bool);

    /// Packets were deemed lost or marked congested
    fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool);

    /// Number of bytes that may be in flight
    fn window(&self) -> u64;

    /// Discard all learned state, returning to the initial window
    fn reset(&mut self);

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;
}

/// Constructs controllers on demand
pub trait ControllerFactory: Send + Sync {
    /// Construct a fresh `Controller`
    fn build(&self, now: Instant) -> Box<dyn Controller>;
}

/// A simple, standard congestion controller
#[derive(Debug, Clone)]
pub struct NewReno {
    config: Arc<NewRenoConfig>,
    /// Maximum number of bytes in flight that may be sent.
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below ssthresh, the mode is
    /// slow start and the window grows by the number of bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery. When a packet sent
    /// after this time is acknowledged, QUIC exits recovery.
    recovery_start_time: Instant,
}

impl NewReno {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<NewRenoConfig>, now: Instant) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start_time: now,
            config,
        }
    }
}

impl Controller for NewReno {
    fn on_ack(&mut self, _now: Instant, sent: Instant, bytes: u64, app_limited: bool) {
        if app_limited || sent <= self.recovery_start_time {
            return;
        }
        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
        } else {
            // Congestion avoidance
            self.window += self.config.max_datagram_size * bytes / self.window;
        }
    }

    fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool) {
        if sent <= self.recovery_start_time {
            return;
        }

        self.recovery_start_time = now;
        self.window = (self.window as f32 * self.config.loss_reduction_factor) as u64;
        self.window = self.window.max(self.config.minimum_window);
        self.ssthresh = self.window;

        if is_persistent_congestion {
            self.window = self.config.minimum_window;
        }
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn reset(&mut self) {
        self.window = self.config.initial_window;
        self.ssthresh = u64::MAX;
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }
}

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    max_datagram_size: u64,
    initial_window: u64,
    minimum_window: u64,
    loss_reduction_factor: f32,
}

impl NewRenoConfig {
    /// The sender's maximum UDP payload size. Does not include UDP or IP overhead.
    ///
    /// Used for calculating initial and minimum congestion windows.
    pub fn max_datagram_size(&mut self, value: u64) -> &mut Self {
        self.max_datagram_size = value;
        self
    }

    /// Default limit on the amount of outstanding data in bytes.
    ///
    /// Recommended value: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }

    /// Default minimum congestion window.
    ///
    /// Recommended value: `2 * max_datagram_size`.
    pub fn minimum_window(&mut self, value: u64) -> &mut Self {
        self.minimum_window = value;
        self
    }

    /// Reduction in congestion window when a new loss event is detected.
    pub fn loss_reduction_factor(&mut self, value: f32) -> &mut Self {
        self.loss_reduction_factor = value;
        self
    }
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        const MAX_DATAGRAM_SIZE: u64 = 1232;
        Self {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            initial_window: 14720.max(2 * MAX_DATAGRAM_SIZE).min(10 * MAX_DATAGRAM_SIZE),
            minimum_window: 2 * MAX_DATAGRAM_SIZE,
            loss_reduction_factor: 0.5,
        }
    }
}

impl ControllerFactory for Arc<NewRenoConfig> {
    fn build(&self, now: Instant) -> Box<dyn Controller> {
        Box::new(NewReno::new(self.clone(), now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let now = Instant::now();
        let mut cc = NewReno::new(Arc::new(NewRenoConfig::default()), now);
        let before = cc.window();
        cc.on_ack(
            now + std::time::Duration::from_millis(50),
            now + std::time::Duration::from_millis(1),
            1200,
            false,
        );
        assert_eq!(cc.window(), before + 1200);
    }

    #[test]
    fn congestion_event_halves_window() {
        let now = Instant::now();
        let mut cc = NewReno::new(Arc::new(NewRenoConfig::default()), now);
        let before = cc.window();
        cc.on_congestion_event(
            now + std::time::Duration::from_millis(50),
            now + std::time::Duration::from_millis(1),
            false,
        );
        assert!(cc.window() <= before / 2 + 1);
        let after = cc.window();
        // Events for packets sent before recovery started are ignored
        cc.on_congestion_event(
            now + std::time::Duration::from_millis(60),
            now + std::time::Duration::from_millis(2),
            false,
        );
        assert_eq!(cc.window(), after);
    }

    #[test]
    fn reset_restores_initial_window() {
        let now = Instant::now();
        let mut cc = NewReno::new(Arc::new(NewRenoConfig::default()), now);
        let initial = cc.window();
        cc.on_congestion_event(
            now + std::time::Duration::from_millis(50),
            now + std::time::Duration::from_millis(1),
            true,
        );
        assert!(cc.window() < initial);
        cc.reset();
        assert_eq!(cc.window(), initial);
    }
}
