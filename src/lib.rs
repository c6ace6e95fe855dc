//! Per-connection QUIC protocol core
//!
//! One [`Connection`] owns a single QUIC connection's lifetime: cryptographic handshake,
//! established data transfer, connection migration, and closure. The crate performs no I/O
//! of its own; a host event loop feeds it received datagrams and timer expirations and
//! drains outgoing datagrams and application events.
//!
//! The wire format targets QUIC draft-24.

use std::fmt;
use std::ops;

mod coding;
mod range_set;
mod varint;
pub use varint::{VarInt, VarIntBoundsExceeded};

pub mod congestion;
mod recovery;

mod config;
pub use config::{ConfigError, ConnectionConfig};

pub mod crypto;

mod frame;
pub use frame::{ApplicationClose, ConnectionClose, FrameType};

mod packet;
pub use packet::{EncryptionLevel, SpaceId};

mod shared;
pub use shared::{CidTable, ConnectionHandle, ConnectionId, ResetToken, Transmit};

mod streams;
pub use streams::{Dir, StreamId};

mod transport_error;
pub use transport_error::{Code as TransportErrorCode, Error as TransportError};

mod transport_parameters;
pub use transport_parameters::TransportParameters;

mod connection;
pub use connection::{
    ConnEvent, Connection, ConnectionError, ConnectionStats, Datagram, Event, RecvQueue,
};

#[cfg(test)]
mod tests;

/// The QUIC protocol version implemented (draft-24)
pub const VERSION: u32 = 0xff00_0018;

/// TLS ALPN value assumed for the application when negotiation does not settle one
pub const ALPN_QUIC_HTTP: &str = "hq-24";

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

//
// Useful internal constants
//

const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 18;
const MIN_CID_SIZE: usize = 4;
const MIN_INITIAL_SIZE: usize = 1200;
