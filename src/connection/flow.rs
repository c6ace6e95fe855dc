use tracing::trace;

/// The connection-level byte budget was overrun
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct LimitExceeded;

/// Connection-level flow control for data the peer sends us
///
/// `limit` advances as reordered bytes are consumed; exceeding it is a peer protocol error.
#[derive(Debug, Default)]
pub(crate) struct LocalFlow {
    offset: u64,
    limit: u64,
    /// The limit in force when we last emitted MAX_DATA
    announced: u64,
}

impl LocalFlow {
    pub(crate) fn set_limit(&mut self, limit: u64) {
        self.limit = self.limit.max(limit);
        self.announced = self.limit;
    }

    /// Record the peer's total sent offset; errors if it overran our advertised limit
    pub(crate) fn update(&mut self, total_offset: u64) -> Result<(), LimitExceeded> {
        if total_offset > self.offset {
            self.offset = total_offset;
        }
        if self.offset > self.limit {
            return Err(LimitExceeded);
        }
        Ok(())
    }

    /// Raise the limit; limits never move backwards
    pub(crate) fn forward_limit(&mut self, limit: u64) {
        if limit > self.limit {
            trace!(old = self.limit, new = limit, "local flow limit advanced");
            self.limit = limit;
        }
    }

    /// Whether enough new credit has accrued to advertise MAX_DATA
    pub(crate) fn will_generate_frame(&self) -> bool {
        self.limit > self.announced
    }

    pub(crate) fn on_max_data_sent(&mut self) {
        self.announced = self.limit;
    }

    pub(crate) fn current_offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn current_limit(&self) -> u64 {
        self.limit
    }
}

/// Connection-level flow control for data we send to the peer
///
/// `limit` advances only on received MAX_DATA.
#[derive(Debug, Default)]
pub(crate) struct RemoteFlow {
    offset: u64,
    limit: u64,
}

impl RemoteFlow {
    pub(crate) fn set_limit(&mut self, limit: u64) {
        self.limit = self.limit.max(limit);
    }

    /// Record our total sent offset; the packetizer never hands out more than `credit`, so
    /// failure here is a local invariant violation
    pub(crate) fn update(&mut self, total_offset: u64) -> Result<(), LimitExceeded> {
        if total_offset > self.offset {
            self.offset = total_offset;
        }
        if self.offset > self.limit {
            return Err(LimitExceeded);
        }
        Ok(())
    }

    pub(crate) fn forward_limit(&mut self, limit: u64) {
        if limit > self.limit {
            trace!(old = self.limit, new = limit, "remote flow limit advanced");
            self.limit = limit;
        }
    }

    /// Bytes we may still send at the connection level
    pub(crate) fn credit(&self) -> u64 {
        self.limit - self.offset
    }

    pub(crate) fn current_offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn current_limit(&self) -> u64 {
        self.limit
    }
}
