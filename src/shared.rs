use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::{fmt, ops};

use rand::RngCore;
use rustc_hash::FxHashMap;

use crate::{MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(
            bytes.is_empty() || (bytes.len() >= MIN_CID_SIZE && bytes.len() <= MAX_CID_SIZE)
        );
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    /// Whether this is the zero-length connection ID
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// Issued per connection ID so a peer that has lost state can kill the connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Opaque token identifying a connection within the demultiplexer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle(pub usize);

/// Demultiplexer table mapping connection IDs to connection handles
///
/// Shared across all connections of an endpoint. Holds copyable handles only, never owning
/// references; each connection inserts its IDs at init and erases them exactly once before
/// teardown.
#[derive(Debug, Clone, Default)]
pub struct CidTable {
    map: Arc<Mutex<FxHashMap<ConnectionId, ConnectionHandle>>>,
}

impl CidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cid: ConnectionId, handle: ConnectionHandle) {
        self.map.lock().unwrap().insert(cid, handle);
    }

    /// Remove a binding, but only if it still routes to `handle`
    pub fn erase(&self, cid: &ConnectionId, handle: ConnectionHandle) {
        let mut map = self.map.lock().unwrap();
        if map.get(cid) == Some(&handle) {
            map.remove(cid);
        }
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<ConnectionHandle> {
        self.map.lock().unwrap().get(cid).copied()
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.lookup(cid).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An outgoing UDP datagram, sealed and ready for the wire
#[derive(Debug)]
pub struct Transmit {
    /// The socket this datagram should be sent to
    pub destination: SocketAddr,
    /// Contents of the datagram
    pub contents: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_table_erase_checks_handle() {
        let table = CidTable::new();
        let cid = ConnectionId::new(&[1, 2, 3, 4]);
        table.insert(cid, ConnectionHandle(1));
        table.erase(&cid, ConnectionHandle(2));
        assert!(table.contains(&cid));
        table.erase(&cid, ConnectionHandle(1));
        assert!(!table.contains(&cid));
    }

    #[test]
    fn cid_display() {
        let cid = ConnectionId::new(&[0xab, 0xcd, 0x01, 0x02]);
        assert_eq!(cid.to_string(), "abcd0102");
    }
}
