use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;

use crate::congestion::NewRenoConfig;
use crate::{MAX_CID_SIZE, MIN_CID_SIZE};

/// Parameters governing a single connection's core state machine
///
/// Supplied by the host at accept/connect time. TLS contexts live with the handshake
/// engine the host constructs, not here.
pub struct ConnectionConfig {
    /// Inactivity timeout applied to accepted (inbound) connections
    pub no_activity_timeout_in: Duration,
    /// Inactivity timeout applied to initiated (outbound) connections
    pub no_activity_timeout_out: Duration,
    /// Secret input to stateless-reset token derivation, shared by all connections of a server
    pub server_id: Vec<u8>,
    /// Whether a server demands an address-validation round trip before committing state
    pub stateless_retry: bool,
    /// Whether a client deliberately offers an unsupported version first
    pub vn_exercise_enabled: bool,
    /// Whether a client exercises connection migration once established
    pub cm_exercise_enabled: bool,
    /// Length of locally generated connection IDs; 0 or within [4, 18]
    pub local_cid_len: usize,
    /// Upper bound on outgoing UDP payload size (the path MTU assumed for this connection)
    pub max_packet_size: u16,
    /// Number of alternate connection IDs offered to the peer for migration
    pub alt_cid_count: u8,
    /// Congestion controller tuning
    pub congestion: Arc<NewRenoConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let mut server_id = vec![0; 16];
        rand::thread_rng().fill_bytes(&mut server_id);
        Self {
            no_activity_timeout_in: Duration::from_secs(30),
            no_activity_timeout_out: Duration::from_secs(30),
            server_id,
            stateless_retry: false,
            vn_exercise_enabled: false,
            cm_exercise_enabled: false,
            local_cid_len: 8,
            max_packet_size: 1452,
            alt_cid_count: 2,
            congestion: Arc::new(NewRenoConfig::default()),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.local_cid_len != 0 && self.local_cid_len < MIN_CID_SIZE)
            || self.local_cid_len > MAX_CID_SIZE
        {
            return Err(ConfigError::IllegalValue(
                "local_cid_len must be 0 or in [4, 18]",
            ));
        }
        if self.max_packet_size < 128 {
            return Err(ConfigError::IllegalValue("max_packet_size must be >= 128"));
        }
        if self.server_id.is_empty() {
            return Err(ConfigError::IllegalValue("server_id must be non-empty"));
        }
        Ok(())
    }
}

/// Errors in the configuration of a connection
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        ConnectionConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_cid_len() {
        let cfg = ConnectionConfig {
            local_cid_len: 3,
            ..ConnectionConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ConnectionConfig {
            local_cid_len: 19,
            ..ConnectionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
