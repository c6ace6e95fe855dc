use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, trace};

use crate::congestion::{Controller, ControllerFactory};

/// Description of the network path a connection is currently using
///
/// The five-tuple is `(local, remote, UDP)`; the remote half is updated on accepted
/// migration.
pub(crate) struct PathData {
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
    /// Congestion controller state
    pub(crate) congestion: Box<dyn Controller>,
    /// Total size of all UDP datagrams sent on this path
    pub(crate) total_sent: u64,
    /// Total size of all UDP datagrams received on this path
    pub(crate) total_recvd: u64,
}

impl PathData {
    pub(crate) fn new<F: ControllerFactory>(
        local: SocketAddr,
        remote: SocketAddr,
        factory: &F,
        now: Instant,
    ) -> Self {
        Self {
            local,
            remote,
            congestion: factory.build(now),
            total_sent: 0,
            total_recvd: 0,
        }
    }

    /// Bytes the congestion controller currently permits in flight beyond `in_flight`
    pub(crate) fn open_window(&self, in_flight: u64) -> u64 {
        self.congestion.window().saturating_sub(in_flight)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ValidationState {
    Idle,
    Validating { data: u64 },
    Validated,
}

/// PATH_CHALLENGE / PATH_RESPONSE state for the current path
#[derive(Debug)]
pub(crate) struct PathValidator {
    state: ValidationState,
    /// Challenge waiting to be packetized
    pending_challenge: Option<u64>,
    /// Responses owed for challenges the peer sent
    pending_responses: VecDeque<u64>,
}

impl PathValidator {
    pub(crate) fn new() -> Self {
        Self {
            state: ValidationState::Idle,
            pending_challenge: None,
            pending_responses: VecDeque::new(),
        }
    }

    /// Begin validating the current path
    pub(crate) fn validate<R: Rng>(&mut self, rng: &mut R) {
        let data = rng.gen();
        self.state = ValidationState::Validating { data };
        self.pending_challenge = Some(data);
        debug!(data, "path validation started");
    }

    pub(crate) fn is_validating(&self) -> bool {
        matches!(self.state, ValidationState::Validating { .. })
    }

    pub(crate) fn is_validated(&self) -> bool {
        self.state == ValidationState::Validated
    }

    /// Queue a response to an incoming PATH_CHALLENGE
    pub(crate) fn on_challenge(&mut self, data: u64) {
        const MAX_PENDING_RESPONSES: usize = 16;
        if self.pending_responses.len() < MAX_PENDING_RESPONSES {
            self.pending_responses.push_back(data);
        } else {
            trace!("ignoring excessive PATH_CHALLENGE");
        }
    }

    /// Whether `data` completes the outstanding validation
    pub(crate) fn on_response(&mut self, data: u64) -> bool {
        match self.state {
            ValidationState::Validating { data: expected } if expected == data => {
                self.state = ValidationState::Validated;
                debug!("path validated");
                true
            }
            _ => {
                trace!(data, "stale PATH_RESPONSE");
                false
            }
        }
    }

    /// Whether a PATH_CHALLENGE or PATH_RESPONSE is waiting to be sent
    pub(crate) fn will_generate_frame(&self) -> bool {
        self.pending_challenge.is_some() || !self.pending_responses.is_empty()
    }

    /// The next outgoing challenge or response; challenges take priority
    pub(crate) fn next_frame(&mut self) -> Option<PathFrame> {
        if let Some(data) = self.pending_challenge.take() {
            return Some(PathFrame::Challenge(data));
        }
        self.pending_responses.pop_front().map(PathFrame::Response)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PathFrame {
    Challenge(u64),
    Response(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn challenge_response_cycle() {
        let mut rng = StdRng::from_seed([7; 32]);
        let mut validator = PathValidator::new();
        assert!(!validator.is_validating());

        validator.validate(&mut rng);
        assert!(validator.is_validating());
        let data = match validator.next_frame().unwrap() {
            PathFrame::Challenge(data) => data,
            x => panic!("unexpected {x:?}"),
        };
        assert!(!validator.on_response(data ^ 1));
        assert!(validator.is_validating());
        assert!(validator.on_response(data));
        assert!(validator.is_validated());
    }

    #[test]
    fn responses_queued_in_order() {
        let mut validator = PathValidator::new();
        validator.on_challenge(1);
        validator.on_challenge(2);
        assert_eq!(validator.next_frame(), Some(PathFrame::Response(1)));
        assert_eq!(validator.next_frame(), Some(PathFrame::Response(2)));
        assert_eq!(validator.next_frame(), None);
    }
}
