use rand::RngCore;
use tracing::{debug, trace};

use crate::shared::{CidTable, ConnectionHandle, ConnectionId, ResetToken};

/// A locally issued alternate connection ID, offered to the peer via NEW_CONNECTION_ID
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct IssuedCid {
    pub(crate) sequence: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

/// Issues and retires alternate local connection IDs and keeps them bound in the demux table
///
/// Installed once the connection is established and migration is permitted; a packet arriving
/// with one of these IDs as its DCID is a migration attempt.
pub(crate) struct AltCidState {
    cid_len: usize,
    next_seq: u64,
    issued: Vec<IssuedCid>,
}

impl AltCidState {
    pub(crate) fn new(cid_len: usize) -> Self {
        Self {
            cid_len,
            // Sequence 0 is the handshake CID
            next_seq: 1,
            issued: Vec::new(),
        }
    }

    /// Mint `count` fresh IDs, bind them in the demux table, and return the frames to queue
    pub(crate) fn issue<R: RngCore>(
        &mut self,
        count: u8,
        rng: &mut R,
        reset_token: ResetToken,
        table: &CidTable,
        handle: ConnectionHandle,
    ) -> Vec<IssuedCid> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = ConnectionId::random(rng, self.cid_len);
            let cid = IssuedCid {
                sequence: self.next_seq,
                id,
                reset_token,
            };
            self.next_seq += 1;
            table.insert(id, handle);
            self.issued.push(cid);
            trace!(seq = cid.sequence, %id, "issued alternate CID");
            out.push(cid);
        }
        out
    }

    /// Adopt `dcid` as the new active local CID, keeping the existing reset token binding
    ///
    /// Refuses IDs this manager never issued.
    pub(crate) fn migrate_to(&mut self, dcid: ConnectionId, _reset_token: ResetToken) -> bool {
        match self.issued.iter().position(|c| c.id == dcid) {
            Some(i) => {
                self.issued.remove(i);
                debug!(cid = %dcid, "adopted alternate CID");
                true
            }
            None => false,
        }
    }

    /// Drop the binding for a sequence number the peer retired
    pub(crate) fn retire(
        &mut self,
        sequence: u64,
        table: &CidTable,
        handle: ConnectionHandle,
    ) {
        if let Some(i) = self.issued.iter().position(|c| c.sequence == sequence) {
            let cid = self.issued.remove(i);
            table.erase(&cid.id, handle);
            trace!(seq = sequence, "retired alternate CID");
        }
    }

    /// Remove every outstanding alternate binding from the demux table
    pub(crate) fn invalidate_alt_connections(&mut self, table: &CidTable, handle: ConnectionHandle) {
        for cid in self.issued.drain(..) {
            table.erase(&cid.id, handle);
        }
    }

    #[cfg(test)]
    pub(crate) fn issued_count(&self) -> usize {
        self.issued.len()
    }
}
