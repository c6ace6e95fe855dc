//! Packet protection keys and the handshake-engine contract
//!
//! The TLS engine itself is an external collaborator hidden behind [`Session`]; this module
//! owns what the connection core needs regardless of the TLS implementation: initial key
//! derivation, AEAD payload protection, header protection, and reset-token derivation.

use bytes::Bytes;

use crate::packet::EncryptionLevel;
use crate::transport_error::Error as TransportError;
use crate::transport_parameters::TransportParameters;

mod ring;
pub use self::ring::{initial_keys, reset_token_for, CryptoError, HeaderKey, PacketKey};

/// A complete set of keys for a single encryption level
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<HeaderKey>,
    /// Packet payload protection keys
    pub packet: KeyPair<PacketKey>,
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Protects packets we send
    pub local: T,
    /// Removes protection from packets the peer sent
    pub remote: T,
}

/// The cryptographic handshake engine driving a connection
///
/// Consumes and produces handshake bytes at each encryption level, yields negotiated keys as
/// levels become available, and exposes the negotiated transport parameters once the peer's
/// first flight has been processed.
pub trait Session: Send {
    /// Begin the handshake; a client writes its first flight, a server waits for one
    fn start(&mut self) -> Result<(), TransportError>;

    /// Consume reassembled handshake bytes received at `level`
    fn read_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<(), TransportError>;

    /// Produce up to `max_len` outbound handshake bytes for `level`, if any are pending
    fn write_crypto(&mut self, level: EncryptionLevel, max_len: usize) -> Option<Bytes>;

    /// Keys for the next encryption level that has become available, if any
    fn next_keys(&mut self) -> Option<(EncryptionLevel, Keys)>;

    /// Whether the handshake has completed
    fn is_completed(&self) -> bool;

    /// Whether a protocol version has been agreed on
    fn is_version_negotiated(&self) -> bool;

    /// React to a VERSION_NEGOTIATION packet listing the peer's supported versions
    fn negotiate_version(&mut self, offered: &[u32]) -> Result<u32, TransportError>;

    /// Whether the peer's transport parameters have been received
    fn has_remote_transport_parameters(&self) -> bool;

    /// The peer's transport parameters, once received
    fn remote_transport_parameters(&self) -> Option<TransportParameters>;

    /// Our own transport parameters
    fn local_transport_parameters(&self) -> TransportParameters;

    /// The level the engine is currently operating at
    fn current_encryption_level(&self) -> EncryptionLevel;

    /// Negotiated cipher suite name, once known
    fn negotiated_cipher_suite(&self) -> Option<&'static str>;

    /// Negotiated application protocol (ALPN), once known
    fn negotiated_application_name(&self) -> Option<String>;

    /// Discard all handshake progress, returning to the initial state
    fn reset(&mut self);
}
