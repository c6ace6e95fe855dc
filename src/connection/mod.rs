use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::coding::{BufMutExt, Codec};
use crate::config::{ConfigError, ConnectionConfig};
use crate::crypto::{self, Keys, Session};
use crate::frame::{self, Close, Frame, FrameType};
use crate::packet::{
    EncryptionLevel, Header, PacketDecodeError, PacketKind, PacketNumber, PartialDecode, SpaceId,
};
use crate::recovery::RttEstimator;
use crate::recovery::SentPacket;
use crate::shared::{CidTable, ConnectionHandle, ConnectionId, ResetToken, Transmit};
use crate::streams::{Dir, StreamFrameOut, StreamId, StreamManager};
use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};
use crate::{Side, ALPN_QUIC_HTTP, MIN_INITIAL_SIZE, VERSION};

mod cid_state;
use cid_state::AltCidState;

mod flow;
use flow::{LocalFlow, RemoteFlow};

mod packet_builder;
use packet_builder::{PacketBuilder, MAX_PACKET_OVERHEAD};

mod paths;
use paths::{PathData, PathFrame, PathValidator};

mod recv_queue;
pub use recv_queue::{Datagram, RecvQueue};
use recv_queue::DequeueResult;

pub(crate) mod spaces;
use spaces::PacketSpace;

mod state;
use state::{Closing, State};

mod timer;
use timer::{Timer, TimerTable};

/// Interval at which the self-rearming write-ready timer fires while the connection is active
const WRITE_READY_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound on packets emitted per write-ready event
const PACKET_PER_EVENT: usize = 32;
/// Interrupt consecutive STREAM frames to give ACK a chance in the next packet
const MAX_CONSECUTIVE_STREAMS: u64 = 8;
/// Server-side anti-amplification budget before the source address is verified
const MAX_PACKETS_WITHOUT_SRC_ADDR_VALIDATION: u32 = 3;
/// RTT assumed before the first sample
const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Events consumed by the connection's per-state dispatcher
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnEvent {
    /// Datagrams are queued in the receive queue
    PacketReadReady,
    /// Run the packetizer
    PacketWriteReady,
    /// Path validation has run out of time
    PathValidationTimeout,
    /// The closing or draining period ended
    ClosingTimeout,
    /// Final teardown
    Shutdown,
    /// Idle-timeout signal, valid only while handshaking or established
    Immediate,
}

/// Application-facing events
#[derive(Debug)]
pub enum Event {
    /// The handshake completed; the connection is established
    ///
    /// Delivered as the server-side ACCEPT or the client-side OPEN.
    Connected {
        /// Negotiated application protocol, or the default when ALPN did not settle one
        application: String,
    },
    /// The connection was lost
    ConnectionLost {
        /// Why the connection ended
        reason: ConnectionError,
    },
    /// A stream has data ready to read
    StreamReadable {
        /// The affected stream
        id: StreamId,
    },
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's transport closed the connection
    #[error("closed by peer: {0}")]
    ConnectionClosed(frame::ConnectionClose),
    /// The peer's application closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(frame::ApplicationClose),
    /// The connection was idle longer than the negotiated inactivity timeout
    #[error("timed out")]
    TimedOut,
    /// We closed the connection locally
    #[error("closed")]
    LocallyClosed,
}

/// Counters describing a connection's lifetime
#[derive(Debug, Default, Copy, Clone)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A decrypted inbound packet moving through the receive pipeline
struct RxPacket {
    kind: PacketKind,
    header: Header,
    payload: BytesMut,
    pn: Option<u64>,
    remote: SocketAddr,
}

/// Protocol state and logic for a single QUIC connection
///
/// Thread-affine: all state transitions run on the owning event loop, which feeds events via
/// [`handle_event`](Self::handle_event) and [`handle_timeout`](Self::handle_timeout) and
/// drains [`poll_transmit`](Self::poll_transmit) and [`poll`](Self::poll). The only
/// cross-thread surface is the receive queue handle.
///
/// Subsidiary components are owned exclusively by this struct; teardown drops them in
/// reverse field order.
pub struct Connection {
    config: Arc<ConnectionConfig>,
    side: Side,
    handle: ConnectionHandle,
    cid_table: CidTable,
    rng: StdRng,
    session: Box<dyn Session>,

    /// The peer's destination CID for packets sent to us
    local_cid: ConnectionId,
    /// Our destination CID for packets sent to the peer; zero-length until learned
    peer_cid: ConnectionId,
    /// DCID of the first Initial; input to initial key derivation and RETRY recovery
    original_cid: ConnectionId,
    reset_token: ResetToken,
    /// Unused CIDs the peer issued via NEW_CONNECTION_ID, in arrival order
    remote_alt_cids: VecDeque<ConnectionId>,
    /// Token received in a RETRY, echoed in subsequent Initials
    retry_token: Bytes,
    cids_removed: bool,

    state: State,

    /// Packet number spaces: Initial, Handshake, Application
    spaces: [PacketSpace; 3],
    /// 0-RTT keys, present only while they may still be needed
    zero_rtt_crypto: Option<Keys>,
    rtt: RttEstimator,
    path: PathData,
    path_validator: PathValidator,
    /// Present once established with migration permitted
    alt_cids: Option<AltCidState>,
    migration_initiated: bool,

    streams: StreamManager,
    local_flow: LocalFlow,
    remote_flow: RemoteFlow,
    flow_control_buffer_size: u64,

    recv_queue: Arc<RecvQueue>,
    timers: TimerTable,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,

    app_started: bool,
    src_addr_verified: bool,
    /// Server-sent INITIAL and HANDSHAKE packets, compared against the amplification budget
    handshake_packets_sent: u32,
    /// Running count of STREAM frames stored, for the consecutive-stream break
    stream_frames_sent: u64,
    retry_sent: bool,
    last_received_packet_kind: Option<PacketKind>,
    teardown_complete: bool,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection and bind its CIDs in the demux table
    ///
    /// On the server, `peer_cid` is the client's SCID and `original_cid` the DCID of the
    /// first Initial. On the client, `peer_cid` is empty and `original_cid` is the random
    /// DCID the first Initial will carry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConnectionConfig>,
        side: Side,
        handle: ConnectionHandle,
        cid_table: CidTable,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        peer_cid: ConnectionId,
        original_cid: ConnectionId,
        mut session: Box<dyn Session>,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut seed = [0; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let mut rng = StdRng::from_seed(seed);

        let local_cid = ConnectionId::random(&mut rng, config.local_cid_len);
        cid_table.insert(local_cid, handle);
        cid_table.insert(original_cid, handle);
        let reset_token = crypto::reset_token_for(&config.server_id, &local_cid);

        let mut spaces = [
            PacketSpace::new(SpaceId::Initial),
            PacketSpace::new(SpaceId::Handshake),
            PacketSpace::new(SpaceId::Data),
        ];
        spaces[0].crypto = Some(crypto::initial_keys(&original_cid, side));

        let mut timers = TimerTable::default();
        if side.is_client() {
            session.start().map_err(|e| {
                warn!(error = %e, "handshake engine failed to start");
                ConfigError::IllegalValue("handshake engine rejected start")
            })?;
            timers.set(Timer::WriteReady, now);
        }

        debug!(%local_cid, %original_cid, %side, "connection created");

        Ok(Self {
            side,
            handle,
            cid_table,
            session,
            local_cid,
            peer_cid,
            original_cid,
            reset_token,
            remote_alt_cids: VecDeque::new(),
            retry_token: Bytes::new(),
            cids_removed: false,
            state: State::PreHandshake,
            spaces,
            zero_rtt_crypto: None,
            rtt: RttEstimator::new(INITIAL_RTT),
            path: PathData::new(local_addr, remote_addr, &config.congestion, now),
            path_validator: PathValidator::new(),
            alt_cids: None,
            migration_initiated: false,
            streams: StreamManager::new(side),
            local_flow: LocalFlow::default(),
            remote_flow: RemoteFlow::default(),
            flow_control_buffer_size: 0,
            recv_queue: Arc::new(RecvQueue::new()),
            timers,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            app_started: false,
            src_addr_verified: side.is_client(),
            handshake_packets_sent: 0,
            stream_frames_sent: 0,
            retry_sent: false,
            last_received_packet_kind: None,
            teardown_complete: false,
            stats: ConnectionStats::default(),
            rng,
            config,
        })
    }

    /// Thread-safe handle for the demultiplexer to deliver datagrams through
    pub fn receive_queue(&self) -> Arc<RecvQueue> {
        self.recv_queue.clone()
    }

    /// Dispatch an event to the current state's handler
    pub fn handle_event(&mut self, now: Instant, event: ConnEvent) {
        match self.state {
            State::PreHandshake => {
                // Bind the inactivity timeout, activate, and re-dispatch in the new state
                self.state = State::Handshake;
                debug!(cids = %self.cids(), "entering handshake state");
                self.net_activity(now);
                self.handle_event(now, event);
            }
            State::Handshake => {
                let result = match event {
                    ConnEvent::PacketReadReady => self.state_handshake_read(now),
                    ConnEvent::PacketWriteReady => {
                        let r = self.common_send_packet(now);
                        self.schedule_write(now, true);
                        r
                    }
                    ConnEvent::PathValidationTimeout => {
                        self.handle_path_validation_timeout(now);
                        Ok(())
                    }
                    ConnEvent::Immediate => {
                        self.handle_idle_timeout(now);
                        Ok(())
                    }
                    _ => {
                        warn!(?event, state = self.state.name(), "unexpected event");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    self.handle_error(now, e);
                }
            }
            State::Established => {
                let result = match event {
                    ConnEvent::PacketReadReady => self.state_established_read(now),
                    ConnEvent::PacketWriteReady => {
                        let r = self.common_send_packet(now);
                        self.schedule_write(now, true);
                        r
                    }
                    ConnEvent::PathValidationTimeout => {
                        self.handle_path_validation_timeout(now);
                        Ok(())
                    }
                    ConnEvent::Immediate => {
                        self.handle_idle_timeout(now);
                        Ok(())
                    }
                    _ => {
                        warn!(?event, state = self.state.name(), "unexpected event");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    self.handle_error(now, e);
                }
            }
            State::Closing(_) => match event {
                ConnEvent::PacketReadReady => self.state_closing_read(now),
                ConnEvent::PacketWriteReady => self.state_closing_send(now),
                ConnEvent::PathValidationTimeout => self.handle_path_validation_timeout(now),
                ConnEvent::ClosingTimeout => self.switch_to_closed(now),
                _ => warn!(?event, state = self.state.name(), "unexpected event"),
            },
            State::Draining => match event {
                ConnEvent::PacketReadReady => self.state_draining_read(now),
                // An endpoint in the draining state MUST NOT send any packets
                ConnEvent::PacketWriteReady => {}
                ConnEvent::PathValidationTimeout => self.handle_path_validation_timeout(now),
                ConnEvent::ClosingTimeout => self.switch_to_closed(now),
                _ => warn!(?event, state = self.state.name(), "unexpected event"),
            },
            State::Closed => match event {
                ConnEvent::Shutdown => self.teardown(),
                ConnEvent::PacketWriteReady => {}
                _ => warn!(?event, state = self.state.name(), "unexpected event"),
            },
        }
    }

    /// Fire every timer that expired at or before `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            trace!(?timer, "timeout");
            let event = match timer {
                Timer::WriteReady => ConnEvent::PacketWriteReady,
                Timer::Idle => ConnEvent::Immediate,
                Timer::Closing => ConnEvent::ClosingTimeout,
                Timer::PathValidation => ConnEvent::PathValidationTimeout,
                Timer::Shutdown => ConnEvent::Shutdown,
            };
            self.handle_event(now, event);
        }
    }

    /// The next instant at which `handle_timeout` should run
    pub fn next_timeout(&mut self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// The next sealed datagram to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// The next application-facing event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Close the connection with an application error
    ///
    /// Idempotent once closing, draining, or closed.
    pub fn close(&mut self, now: Instant, error_code: u16, reason: Bytes) {
        if self.state.is_closed() {
            return;
        }
        self.switch_to_closing(
            now,
            Close::Application(frame::ApplicationClose { error_code, reason }),
            ConnectionError::LocallyClosed,
        );
    }

    /// Remove this connection's IDs from the demux table; safe to call repeatedly
    pub fn remove_connection_ids(&mut self) {
        if self.cids_removed {
            return;
        }
        self.cids_removed = true;
        self.cid_table.erase(&self.original_cid, self.handle);
        self.cid_table.erase(&self.local_cid, self.handle);
        if let Some(alt) = &mut self.alt_cids {
            alt.invalidate_alt_connections(&self.cid_table, self.handle);
        }
    }

    /// Open a new outgoing stream
    pub fn open_stream(&mut self, dir: Dir) -> StreamId {
        self.streams.open(dir)
    }

    /// Queue application data on a stream
    pub fn write_stream(&mut self, now: Instant, id: StreamId, data: Bytes) {
        if self.state.is_closed() {
            return;
        }
        self.streams.write(id, data);
        self.schedule_write(now, false);
    }

    /// Signal the end of a stream
    pub fn finish_stream(&mut self, now: Instant, id: StreamId) {
        self.streams.finish(id);
        self.schedule_write(now, false);
    }

    /// Read the next chunk of in-order data from a stream
    pub fn read_stream(&mut self, id: StreamId) -> Option<Bytes> {
        self.streams.read(id)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_handshaking(&self) -> bool {
        self.state.is_handshake()
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.state.is_drained() && self.teardown_complete
    }

    /// Combined destination and source connection ID label for debug logs
    ///
    /// e.g. `aaaaaaaa-bbbbbbbb`
    pub fn cids(&self) -> String {
        format!("{}-{}", self.peer_cid, self.local_cid)
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.local_cid
    }

    pub fn peer_cid(&self) -> ConnectionId {
        self.peer_cid
    }

    pub fn original_cid(&self) -> ConnectionId {
        self.original_cid
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.path.remote
    }

    pub fn local_address(&self) -> SocketAddr {
        self.path.local
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        stats.bytes_sent = self.path.total_sent;
        stats.bytes_received = self.path.total_recvd;
        stats
    }

    //
    // Receive pipeline
    //

    fn state_handshake_read(&mut self, now: Instant) -> Result<(), TransportError> {
        self.net_activity(now);
        loop {
            let (rx, result) = self.dequeue_recv_packet(now);
            match result {
                DequeueResult::Failed => {
                    return Err(TransportError::INTERNAL_ERROR("packet decryption failed"));
                }
                DequeueResult::NoPacket | DequeueResult::NotReady => return Ok(()),
                DequeueResult::Ignored => continue,
                DequeueResult::Unsupported | DequeueResult::Success => {
                    if let Some(rx) = rx {
                        self.process_handshake_packet(now, rx)?;
                    }
                    if self.session.is_completed()
                        && (self.side.is_server()
                            || self.session.has_remote_transport_parameters())
                    {
                        self.switch_to_established(now);
                        return self.state_established_read(now);
                    }
                    if result == DequeueResult::Unsupported {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn process_handshake_packet(
        &mut self,
        now: Instant,
        rx: RxPacket,
    ) -> Result<(), TransportError> {
        match rx.kind {
            PacketKind::VersionNegotiate => self.process_version_negotiation(now, rx),
            PacketKind::Initial => self.process_initial(now, rx),
            PacketKind::Retry => self.process_retry(now, rx),
            PacketKind::Handshake => {
                // Receipt of a valid Handshake-level packet proves the source address
                if self.side.is_server() && !self.src_addr_verified {
                    self.src_addr_verified = true;
                }
                self.recv_and_ack(now, rx)
            }
            PacketKind::ZeroRtt => {
                let local_tp = self.session.local_transport_parameters();
                let remote_tp = self.session.remote_transport_parameters();
                self.streams
                    .init_flow_control_params(&local_tp, remote_tp.as_ref());
                self.start_application();
                self.recv_and_ack(now, rx)
            }
            PacketKind::OneRtt => Err(TransportError::INTERNAL_ERROR(
                "protected packet before handshake completion",
            )),
        }
    }

    fn process_version_negotiation(
        &mut self,
        now: Instant,
        rx: RxPacket,
    ) -> Result<(), TransportError> {
        if *rx.header.dst_cid() != self.local_cid {
            debug!("ignoring VERSION_NEGOTIATION for foreign CID");
            return Ok(());
        }
        if self.session.is_version_negotiated() {
            debug!("ignoring VERSION_NEGOTIATION, already negotiated");
            return Ok(());
        }

        let mut versions = Vec::new();
        let mut payload = rx.payload;
        while payload.remaining() >= 4 {
            versions.push(payload.get_u32());
        }
        self.session.negotiate_version(&versions)?;

        // Discard all transport state except packet numbers
        for space in &mut self.spaces {
            space.reset_transport_state();
        }
        self.path.congestion.reset();
        self.streams.reset();

        // Start the handshake over
        self.session.reset();
        self.session.start()?;
        self.schedule_write(now, false);
        Ok(())
    }

    fn process_initial(&mut self, now: Instant, rx: RxPacket) -> Result<(), TransportError> {
        if self.side.is_server() {
            if let Header::Initial { ref token, .. } = rx.header {
                if !token.is_empty() {
                    self.src_addr_verified = true;
                } else if self.config.stateless_retry && !self.retry_sent {
                    self.send_retry(now);
                    return Ok(());
                }
            }
            self.recv_and_ack(now, rx)?;
            if self.session.is_version_negotiated()
                && !self.session.has_remote_transport_parameters()
            {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "initial flight carried no transport parameters",
                ));
            }
            Ok(())
        } else {
            self.recv_and_ack(now, rx)
        }
    }

    fn process_retry(&mut self, now: Instant, rx: RxPacket) -> Result<(), TransportError> {
        if self.side.is_server() {
            return Err(TransportError::PROTOCOL_VIOLATION("RETRY sent to a server"));
        }
        // Discard all transport state
        self.session.reset();
        for space in &mut self.spaces {
            space.reset_transport_state();
        }
        self.path.congestion.reset();
        self.streams.reset();

        // The token must accompany every subsequent Initial
        self.retry_token = rx.payload.freeze();

        // Packet numbers of queued packets echo the pre-retry exchange
        self.recv_queue.reset();

        // Generate a fresh original CID and re-derive initial keys from it
        let old = self.original_cid;
        self.cid_table.erase(&old, self.handle);
        self.original_cid = ConnectionId::random(&mut self.rng, old.len().max(8));
        self.cid_table.insert(self.original_cid, self.handle);
        debug!(old = %old, new = %self.original_cid, "original cid regenerated after RETRY");
        self.spaces[0].crypto = Some(crypto::initial_keys(&self.original_cid, self.side));

        self.session.start()?;
        self.schedule_write(now, false);
        Ok(())
    }

    fn state_established_read(&mut self, now: Instant) -> Result<(), TransportError> {
        self.net_activity(now);
        loop {
            let (rx, result) = self.dequeue_recv_packet(now);
            match result {
                DequeueResult::Failed => {
                    return Err(TransportError::INTERNAL_ERROR("packet decryption failed"));
                }
                DequeueResult::NoPacket | DequeueResult::NotReady => return Ok(()),
                DequeueResult::Ignored | DequeueResult::Unsupported => continue,
                DequeueResult::Success => {
                    let rx = match rx {
                        Some(rx) => rx,
                        None => continue,
                    };
                    match rx.kind {
                        PacketKind::OneRtt => {
                            self.established_migrate_connection(now, &rx);
                            if self.side.is_client() {
                                self.established_initiate_connection_migration(now);
                            }
                            self.recv_and_ack(now, rx)?;
                        }
                        PacketKind::Initial | PacketKind::Handshake | PacketKind::ZeroRtt => {
                            // Ack these late arrivals; stale stream offsets discard the data
                            self.recv_and_ack(now, rx)?;
                        }
                        kind => {
                            debug!(?kind, "unknown packet type in established state");
                            return Err(TransportError::INTERNAL_ERROR(
                                "unexpected packet type while established",
                            ));
                        }
                    }
                    if self.state.is_closed() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn state_closing_read(&mut self, now: Instant) {
        while !self.recv_queue.is_empty() {
            let (rx, result) = self.dequeue_recv_packet(now);
            if matches!(result, DequeueResult::NoPacket | DequeueResult::NotReady) {
                return;
            }
            if result == DequeueResult::Success {
                if let Some(rx) = rx {
                    // Version negotiation is meaningless during shutdown
                    if rx.kind != PacketKind::VersionNegotiate {
                        let _ = self.recv_and_ack(now, rx);
                    }
                }
            }
            let response_due = match &mut self.state {
                State::Closing(closing) => closing.on_packet_received(),
                // recv_and_ack may have moved us to draining
                _ => return,
            };
            if response_due {
                self.schedule_write(now, true);
                break;
            }
        }
    }

    fn state_draining_read(&mut self, now: Instant) {
        loop {
            let (rx, result) = self.dequeue_recv_packet(now);
            match result {
                DequeueResult::Success => {
                    if let Some(rx) = rx {
                        // Bookkeeping only; a draining endpoint never emits packets
                        let _ = self.recv_and_ack(now, rx);
                    }
                }
                DequeueResult::Ignored => continue,
                _ => return,
            }
        }
    }

    /// Pop one datagram and run it through decode and decryption
    fn dequeue_recv_packet(&mut self, now: Instant) -> (Option<RxPacket>, DequeueResult) {
        let datagram = match self.recv_queue.pop() {
            Some(x) => x,
            None => return (None, DequeueResult::NoPacket),
        };
        let remote = datagram.remote;
        let len = datagram.contents.len();

        let (decode, rest) = match PartialDecode::new(datagram.contents, self.config.local_cid_len)
        {
            Ok(x) => x,
            Err(PacketDecodeError::UnsupportedVersion {
                source_cid,
                destination,
            }) => {
                if self.side.is_server() {
                    self.send_version_negotiation(source_cid, destination);
                }
                return (None, DequeueResult::Unsupported);
            }
            Err(PacketDecodeError::InvalidHeader(reason)) => {
                trace!(reason, "dropping undecodable datagram");
                return (None, DequeueResult::Ignored);
            }
        };
        if let Some(rest) = rest {
            self.recv_queue.requeue_front(Datagram {
                remote,
                contents: rest,
            });
        }

        let kind = decode.kind();
        let packet = match kind {
            PacketKind::VersionNegotiate | PacketKind::Retry => match decode.finish(None) {
                Ok(p) => p,
                Err(_) => return (None, DequeueResult::Ignored),
            },
            _ => {
                let space = kind.space().unwrap();
                let keys_missing = match kind {
                    PacketKind::ZeroRtt => self.zero_rtt_crypto.is_none(),
                    _ => self.spaces[space as usize].crypto.is_none(),
                };
                if keys_missing {
                    // Keep the packet for when keys arrive
                    let contents = BytesMut::from(decode.data());
                    self.recv_queue.requeue_front(Datagram { remote, contents });
                    return (None, DequeueResult::NotReady);
                }
                let header_key = match kind {
                    PacketKind::ZeroRtt => &self.zero_rtt_crypto.as_ref().unwrap().header.remote,
                    _ => &self.spaces[space as usize].crypto.as_ref().unwrap().header.remote,
                };
                match decode.finish(Some(header_key)) {
                    Ok(p) => p,
                    Err(e) => {
                        trace!(error = %e, "failed to remove header protection");
                        return (None, DequeueResult::Failed);
                    }
                }
            }
        };

        let mut payload = packet.payload;
        let header = packet.header;
        let pn = match header.number() {
            Some(number) => {
                let space = header.space();
                let expanded = number.expand(self.spaces[space as usize].rx_packet + 1);
                let packet_key = match kind {
                    PacketKind::ZeroRtt => &self.zero_rtt_crypto.as_ref().unwrap().packet.remote,
                    _ => &self.spaces[space as usize].crypto.as_ref().unwrap().packet.remote,
                };
                if packet_key
                    .decrypt(expanded, &packet.header_data, &mut payload)
                    .is_err()
                {
                    trace!(pn = expanded, "payload decryption failed");
                    return (None, DequeueResult::Failed);
                }
                if self.spaces[space as usize].dedup.insert(expanded) {
                    trace!(pn = expanded, "duplicate packet");
                    return (None, DequeueResult::Ignored);
                }
                let space = &mut self.spaces[space as usize];
                space.rx_packet = space.rx_packet.max(expanded);
                Some(expanded)
            }
            None => None,
        };

        // A client adopts the first non-zero source CID the peer chooses for itself
        if self.side.is_client() {
            if let Some(src_cid) = header.src_cid() {
                if !src_cid.is_empty() && src_cid != self.peer_cid {
                    debug!(old = %self.peer_cid, new = %src_cid, "peer cid updated");
                    self.peer_cid = src_cid;
                }
            }
        }

        self.last_received_packet_kind = Some(kind);
        self.stats.packets_received += 1;
        self.path.total_recvd = self.path.total_recvd.saturating_add(len as u64);
        if let Some(pn) = pn {
            trace!(?kind, pn, len, "RX packet");
        } else {
            trace!(?kind, len, "RX packet");
        }

        (
            Some(RxPacket {
                kind,
                header,
                payload,
                pn,
                remote,
            }),
            DequeueResult::Success,
        )
    }

    /// Dispatch a packet's frames and feed the ack creator
    fn recv_and_ack(&mut self, now: Instant, rx: RxPacket) -> Result<(), TransportError> {
        let level = match rx.kind {
            PacketKind::Initial => EncryptionLevel::Initial,
            PacketKind::Handshake => EncryptionLevel::Handshake,
            PacketKind::ZeroRtt => EncryptionLevel::ZeroRtt,
            PacketKind::OneRtt => EncryptionLevel::OneRtt,
            // RETRY carries a token, not frames, and never elicits an ack
            PacketKind::Retry | PacketKind::VersionNegotiate => return Ok(()),
        };
        let space_id = level.space();

        let mut should_send_ack = false;
        let mut is_flow_controlled = false;
        for result in frame::Iter::new(rx.payload.freeze())? {
            let frame = result.map_err(TransportError::from)?;
            trace!(ty = %frame.ty(), "RX frame");
            should_send_ack |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => self.process_ack(now, space_id, &ack)?,
                Frame::Crypto(c) => self.process_crypto(now, level, c)?,
                Frame::Stream(s) => {
                    is_flow_controlled |= self.streams.on_stream(s)?;
                }
                Frame::MaxData(limit) => {
                    self.remote_flow.forward_limit(limit.into_inner());
                    self.schedule_write(now, false);
                }
                Frame::MaxStreamData { id, offset } => {
                    self.streams.on_max_stream_data(id, offset);
                    self.schedule_write(now, false);
                }
                // BLOCKED variants are diagnostics from the peer
                Frame::Blocked { offset } => trace!(offset, "peer reports BLOCKED"),
                Frame::StreamBlocked { id, offset } => {
                    trace!(%id, offset, "peer reports STREAM_BLOCKED");
                }
                Frame::NewConnectionId(ncid) => {
                    if ncid.id.is_empty() {
                        let mut err =
                            TransportError::PROTOCOL_VIOLATION("received zero-length cid");
                        err.frame = Some(FrameType::NEW_CONNECTION_ID);
                        return Err(err);
                    }
                    self.remote_alt_cids.push_back(ncid.id);
                }
                Frame::RetireConnectionId { sequence } => {
                    if let Some(alt) = &mut self.alt_cids {
                        alt.retire(sequence, &self.cid_table, self.handle);
                    }
                }
                Frame::PathChallenge(data) => {
                    self.path_validator.on_challenge(data);
                    self.schedule_write(now, false);
                }
                Frame::PathResponse(data) => {
                    if self.path_validator.on_response(data) {
                        self.timers.stop(Timer::PathValidation);
                    }
                }
                Frame::Close(close) => {
                    if matches!(self.state, State::Draining | State::Closed) {
                        continue;
                    }
                    // Receiving a closing frame confirms the peer is closing too
                    let reason = match close {
                        Close::Connection(c) => ConnectionError::ConnectionClosed(c),
                        Close::Application(a) => ConnectionError::ApplicationClosed(a),
                    };
                    self.switch_to_draining(now, reason);
                }
            }
        }

        if is_flow_controlled {
            if self
                .local_flow
                .update(self.streams.total_offset_received())
                .is_err()
            {
                return Err(TransportError::FLOW_CONTROL_ERROR(
                    "connection-level flow control limit exceeded",
                ));
            }
            self.local_flow
                .forward_limit(self.streams.total_reordered_bytes() + self.flow_control_buffer_size);
            trace!(
                offset = self.local_flow.current_offset(),
                limit = self.local_flow.current_limit(),
                "local flow"
            );
        }

        if let Some(pn) = rx.pn {
            self.spaces[space_id as usize]
                .pending_acks
                .update(pn, should_send_ack);
        }

        while let Some(id) = self.streams.poll_readable() {
            self.events.push_back(Event::StreamReadable { id });
        }
        Ok(())
    }

    fn process_crypto(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        c: frame::Crypto,
    ) -> Result<(), TransportError> {
        let space = level.space() as usize;
        self.spaces[space].crypto_stream.insert(c.offset, c.data);
        while let Some(chunk) = self.spaces[space].crypto_stream.read() {
            self.session.read_crypto(level, &chunk)?;
        }
        while let Some((lvl, keys)) = self.session.next_keys() {
            debug!(level = ?lvl, "new keys available");
            match lvl {
                EncryptionLevel::Initial => self.spaces[0].crypto = Some(keys),
                EncryptionLevel::Handshake => self.spaces[1].crypto = Some(keys),
                EncryptionLevel::OneRtt => self.spaces[2].crypto = Some(keys),
                EncryptionLevel::ZeroRtt => self.zero_rtt_crypto = Some(keys),
            }
        }
        self.schedule_write(now, false);
        Ok(())
    }

    fn process_ack(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ack: &frame::Ack,
    ) -> Result<(), TransportError> {
        let idx = space_id as usize;
        let next_pn = self.spaces[idx].next_packet_number;
        let outcome = self.spaces[idx].loss.on_ack_received(
            now,
            next_pn,
            ack,
            &mut self.rtt,
            self.path.congestion.as_mut(),
        )?;
        for acked in &outcome.newly_acked {
            self.spaces[idx].pending_acks.subtract(&acked.acks);
            for meta in &acked.stream_frames {
                self.streams.ack(meta);
            }
        }
        let lost_any = !outcome.lost.is_empty();
        for lost in outcome.lost {
            self.stats.packets_lost += 1;
            self.spaces[idx].pending |= lost.retransmits;
            for meta in lost.stream_frames {
                self.streams.retransmit(meta);
            }
        }
        if lost_any {
            self.schedule_write(now, false);
        }
        Ok(())
    }

    //
    // Send pipeline
    //

    fn common_send_packet(&mut self, now: Instant) -> Result<(), TransportError> {
        // Re-emit anything the loss detector has given up on
        self.replay_timed_out_packets(now);

        let mut packet_count = 0;
        let mut amplification_blocked = false;
        while packet_count < PACKET_PER_EVENT && !amplification_blocked {
            let in_flight: u64 = self.spaces.iter().map(|s| s.loss.bytes_in_flight()).sum();
            let window = self.path.open_window(in_flight);
            if window == 0 {
                break;
            }
            let udp_payload_len = (window as usize).min(self.config.max_packet_size as usize);
            let mut datagram = Vec::with_capacity(udp_payload_len);

            for level in EncryptionLevel::SEND_ORDER {
                if self.side.is_server()
                    && !self.src_addr_verified
                    && self.handshake_packets_sent >= MAX_PACKETS_WITHOUT_SRC_ADDR_VALIDATION
                {
                    amplification_blocked = true;
                    break;
                }
                let budget = udp_payload_len - datagram.len();
                if self.packetize_frames(now, level, budget, &mut datagram) {
                    packet_count += 1;
                }
            }

            if datagram.is_empty() {
                break;
            }
            self.path.total_sent = self.path.total_sent.saturating_add(datagram.len() as u64);
            self.transmits.push_back(Transmit {
                destination: self.path.remote,
                contents: datagram,
            });
        }

        if packet_count > 0 {
            self.net_activity(now);
        }
        Ok(())
    }

    fn replay_timed_out_packets(&mut self, now: Instant) {
        for idx in 0..3 {
            let lost = self.spaces[idx].loss.detect_lost_by_timeout(now, &self.rtt);
            for packet in lost {
                self.stats.packets_lost += 1;
                self.spaces[idx].pending |= packet.retransmits;
                for meta in packet.stream_frames {
                    self.streams.retransmit(meta);
                }
            }
        }
    }

    /// Assemble, seal, and append one packet of `level` into `datagram`
    ///
    /// Frame producers are queried in strict priority order, each until it declines or the
    /// budget is exhausted.
    fn packetize_frames(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        budget: usize,
        datagram: &mut Vec<u8>,
    ) -> bool {
        // We never initiate 0-RTT protected sends
        if level == EncryptionLevel::ZeroRtt {
            return false;
        }
        let space_idx = level.space() as usize;
        if self.spaces[space_idx].crypto.is_none() {
            return false;
        }
        let mut builder = match PacketBuilder::new(budget, self.config.max_packet_size as usize) {
            Some(b) => b,
            None => return false,
        };

        let mut sent = SentPacket {
            time_sent: now,
            size: 0,
            ack_eliciting: false,
            acks: Default::default(),
            retransmits: Default::default(),
            stream_frames: Default::default(),
        };

        // CRYPTO: retransmissions first, then fresh handshake bytes
        while builder.remaining() > frame::Crypto::SIZE_BOUND {
            let max_data = builder.remaining() - frame::Crypto::SIZE_BOUND;
            if let Some(mut c) = self.spaces[space_idx].pending.crypto.pop_front() {
                if c.data.len() > max_data {
                    let rest = c.data.split_off(max_data);
                    self.spaces[space_idx].pending.crypto.push_front(frame::Crypto {
                        offset: c.offset + max_data as u64,
                        data: rest,
                    });
                }
                c.encode(&mut builder.payload);
                builder.frame_written(false);
                sent.retransmits.crypto.push_back(c);
                continue;
            }
            match self.session.write_crypto(level, max_data) {
                Some(data) if !data.is_empty() => {
                    let offset = self.spaces[space_idx].crypto_offset;
                    self.spaces[space_idx].crypto_offset += data.len() as u64;
                    let c = frame::Crypto { offset, data };
                    c.encode(&mut builder.payload);
                    builder.frame_written(false);
                    sent.retransmits.crypto.push_back(c);
                }
                _ => break,
            }
        }

        // PATH_CHALLENGE, PATH_RESPONSE
        if level == EncryptionLevel::OneRtt {
            while self.path_validator.will_generate_frame() && builder.remaining() >= 9 {
                match self.path_validator.next_frame() {
                    Some(PathFrame::Challenge(data)) => {
                        builder.payload.write(FrameType::PATH_CHALLENGE);
                        builder.payload.write(data);
                        builder.frame_written(true);
                    }
                    Some(PathFrame::Response(data)) => {
                        builder.payload.write(FrameType::PATH_RESPONSE);
                        builder.payload.write(data);
                        builder.frame_written(true);
                    }
                    None => break,
                }
            }

            // NEW_CONNECTION_ID / RETIRE_CONNECTION_ID
            while builder.remaining() >= frame::NewConnectionId::SIZE_BOUND {
                let issued = match self.spaces[space_idx].pending.new_cids.pop() {
                    Some(x) => x,
                    None => break,
                };
                frame::NewConnectionId {
                    sequence: issued.sequence,
                    id: issued.id,
                    reset_token: issued.reset_token,
                }
                .encode(&mut builder.payload);
                builder.frame_written(true);
                sent.retransmits.new_cids.push(issued);
            }
            while builder.remaining() >= 9 {
                let seq = match self.spaces[space_idx].pending.retire_cids.pop() {
                    Some(x) => x,
                    None => break,
                };
                builder.payload.write(FrameType::RETIRE_CONNECTION_ID);
                builder.payload.write_var(seq);
                builder.frame_written(false);
                sent.retransmits.retire_cids.push(seq);
            }
        }

        if level == EncryptionLevel::OneRtt {
            // MAX_DATA, only when there is new credit to advertise (or a lost advertisement)
            let max_data_due =
                self.spaces[space_idx].pending.max_data || self.local_flow.will_generate_frame();
            if max_data_due && builder.remaining() >= 9 {
                self.spaces[space_idx].pending.max_data = false;
                builder.payload.write(FrameType::MAX_DATA);
                builder.payload.write_var(self.local_flow.current_limit());
                builder.frame_written(false);
                self.local_flow.on_max_data_sent();
                sent.retransmits.max_data = true;
            }

            // BLOCKED, only when credit is exhausted and data is waiting
            if self.remote_flow.credit() == 0
                && self.streams.has_pending_data()
                && builder.remaining() >= 9
            {
                builder.payload.write(FrameType::BLOCKED);
                builder.payload.write_var(self.remote_flow.current_limit());
                builder.frame_written(false);
            }

            // STREAM, MAX_STREAM_DATA, STREAM_BLOCKED, gated on path validation
            if !self.path_validator.is_validating() && self.streams.will_generate_frame() {
                while let Some(out) = self
                    .streams
                    .poll_transmit(self.remote_flow.credit(), builder.remaining())
                {
                    match out {
                        StreamFrameOut::Stream { meta, data } => {
                            meta.encode(true, &mut builder.payload);
                            builder.payload.extend_from_slice(&data);
                            builder.frame_written(false);
                            let total = self.streams.total_offset_sent();
                            let updated = self.remote_flow.update(total);
                            trace!(
                                offset = self.remote_flow.current_offset(),
                                limit = self.remote_flow.current_limit(),
                                "remote flow"
                            );
                            debug_assert!(updated.is_ok(), "stream manager overran its credit");
                            sent.stream_frames.push(meta);
                            self.stream_frames_sent += 1;
                            if self.stream_frames_sent % MAX_CONSECUTIVE_STREAMS == 0 {
                                break;
                            }
                        }
                        StreamFrameOut::MaxStreamData { id, offset } => {
                            builder.payload.write(FrameType::MAX_STREAM_DATA);
                            id.encode(&mut builder.payload);
                            builder.payload.write_var(offset);
                            builder.frame_written(false);
                        }
                        StreamFrameOut::StreamBlocked { id, offset } => {
                            builder.payload.write(FrameType::STREAM_BLOCKED);
                            id.encode(&mut builder.payload);
                            builder.payload.write_var(offset);
                            builder.frame_written(false);
                        }
                    }
                }
            }
        }

        // ACK: piggybacked whenever other frames go out, standalone only when due
        let frames_before_ack = builder.frame_count;
        {
            let acks = &self.spaces[space_idx].pending_acks;
            let emit = if frames_before_ack == 0 {
                acks.can_send()
            } else {
                !acks.is_empty()
            };
            // Worst case per block: a gap and a length, two 8-byte varints each
            let size_bound = 19 + 18 * acks.ranges().len();
            if emit && builder.remaining() >= size_bound {
                let ranges = self.spaces[space_idx].pending_acks.ranges().clone();
                frame::Ack::encode(0, &ranges, &mut builder.payload);
                builder.frame_written(false);
                sent.acks = ranges;
                self.spaces[space_idx].pending_acks.acks_sent();
            }
        }
        let ack_only = frames_before_ack == 0 && builder.frame_count == 1;

        if builder.is_empty() {
            return false;
        }

        // Pad the first flight; a client's Initial must produce a full-size datagram
        if level == EncryptionLevel::Initial && self.side.is_client() {
            builder.pad_to(self.minimum_packet_size());
        }
        if level == EncryptionLevel::OneRtt && self.side.is_server() {
            builder.pad_to(self.minimum_packet_size());
        }
        // Header protection samples 4 bytes past the packet number
        builder.pad_to(4);

        // Build the header and seal
        let pn = self.spaces[space_idx].get_tx_number();
        let largest_acked = self.spaces[space_idx]
            .loss
            .largest_acked_packet_number()
            .unwrap_or(0);
        let number = PacketNumber::new(pn, largest_acked);
        // Initial keys are derived from the original CID, so a client's Initials carry it as
        // their DCID; everything else addresses the peer's current CID
        let dst_cid = if level == EncryptionLevel::Initial && self.side.is_client() {
            self.original_cid
        } else {
            self.peer_cid
        };
        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                dst_cid,
                src_cid: self.local_cid,
                token: self.retry_token.clone(),
                number,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: crate::packet::LongType::Handshake,
                dst_cid,
                src_cid: self.local_cid,
                number,
            },
            EncryptionLevel::OneRtt => Header::Short {
                key_phase: false,
                dst_cid,
                number,
            },
            EncryptionLevel::ZeroRtt => unreachable!(),
        };

        let mut packet_buf = Vec::with_capacity(builder.payload.len() + MAX_PACKET_OVERHEAD);
        let partial = header.encode(&mut packet_buf);
        packet_buf.extend_from_slice(&builder.payload);
        {
            let keys = self.spaces[space_idx].crypto.as_ref().unwrap();
            partial.finish(
                &mut packet_buf,
                &keys.header.local,
                Some((pn, &keys.packet.local)),
            );
        }

        sent.size = packet_buf.len() as u16;
        sent.ack_eliciting = !ack_only;
        trace!(
            ?level,
            pn,
            len = packet_buf.len(),
            ack_eliciting = sent.ack_eliciting,
            probing = builder.probing,
            "TX packet"
        );
        self.spaces[space_idx].loss.on_packet_sent(pn, sent);
        if self.side.is_server()
            && matches!(level, EncryptionLevel::Initial | EncryptionLevel::Handshake)
        {
            self.handshake_packets_sent += 1;
        }
        self.stats.packets_sent += 1;

        datagram.extend_from_slice(&packet_buf);
        true
    }

    /// Smallest packet payload this endpoint will emit at the moment
    ///
    /// Clients must produce full-size Initials; servers randomize short-packet sizes a
    /// little as a traffic-analysis countermeasure.
    fn minimum_packet_size(&mut self) -> usize {
        match self.side {
            Side::Client => MIN_INITIAL_SIZE,
            Side::Server => 32 + (self.rng.gen::<u32>() & 0x3f) as usize,
        }
    }

    /// Build the frozen closing packet once, at the current encryption level
    fn packetize_closing_frame(&mut self) {
        let reason = match &self.state {
            State::Closing(closing) if closing.final_packet.is_none() => closing.reason.clone(),
            _ => return,
        };
        let mut level = self.session.current_encryption_level();
        if level == EncryptionLevel::ZeroRtt {
            level = EncryptionLevel::Initial;
        }
        let space_idx = level.space() as usize;
        if self.spaces[space_idx].crypto.is_none() {
            return;
        }
        let mut builder = match PacketBuilder::new(
            self.config.max_packet_size as usize,
            self.config.max_packet_size as usize,
        ) {
            Some(b) => b,
            None => return,
        };
        let max_len = builder.remaining();
        reason.encode(&mut builder.payload, max_len);
        builder.frame_written(false);
        builder.pad_to(4);

        let pn = self.spaces[space_idx].get_tx_number();
        let largest_acked = self.spaces[space_idx]
            .loss
            .largest_acked_packet_number()
            .unwrap_or(0);
        let number = PacketNumber::new(pn, largest_acked);
        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                dst_cid: self.peer_cid,
                src_cid: self.local_cid,
                token: self.retry_token.clone(),
                number,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: crate::packet::LongType::Handshake,
                dst_cid: self.peer_cid,
                src_cid: self.local_cid,
                number,
            },
            _ => Header::Short {
                key_phase: false,
                dst_cid: self.peer_cid,
                number,
            },
        };
        let mut packet_buf = Vec::new();
        let partial = header.encode(&mut packet_buf);
        packet_buf.extend_from_slice(&builder.payload);
        let keys = self.spaces[space_idx].crypto.as_ref().unwrap();
        partial.finish(
            &mut packet_buf,
            &keys.header.local,
            Some((pn, &keys.packet.local)),
        );

        if let State::Closing(closing) = &mut self.state {
            closing.final_packet = Some(packet_buf);
        }
    }

    /// Emit (or re-emit) the closing packet, subject to the transmission cap
    fn state_closing_send(&mut self, _now: Instant) {
        self.packetize_closing_frame();
        let destination = self.path.remote;
        if let State::Closing(closing) = &mut self.state {
            let packet = closing.final_packet.clone();
            if let Some(contents) = packet {
                if closing.record_sent() {
                    self.path.total_sent =
                        self.path.total_sent.saturating_add(contents.len() as u64);
                    self.stats.packets_sent += 1;
                    self.transmits.push_back(Transmit {
                        destination,
                        contents,
                    });
                }
            }
        }
    }

    fn send_version_negotiation(&mut self, source: ConnectionId, destination: ConnectionId) {
        debug!("responding with VERSION_NEGOTIATION");
        let header = Header::VersionNegotiate {
            random: self.rng.gen::<u8>() & !0x80,
            dst_cid: source,
            src_cid: destination,
        };
        let mut buf = Vec::new();
        let _ = header.encode(&mut buf);
        buf.extend_from_slice(&VERSION.to_be_bytes());
        self.transmits.push_back(Transmit {
            destination: self.path.remote,
            contents: buf,
        });
    }

    /// Demand address validation before committing further state
    fn send_retry(&mut self, _now: Instant) {
        debug!("responding with RETRY");
        self.retry_sent = true;
        let mut token = vec![0u8; 16];
        self.rng.fill_bytes(&mut token);
        let header = Header::Retry {
            dst_cid: self.peer_cid,
            src_cid: self.local_cid,
            orig_dst_cid: self.original_cid,
        };
        let mut buf = Vec::new();
        let _ = header.encode(&mut buf);
        buf.extend_from_slice(&token);
        self.transmits.push_back(Transmit {
            destination: self.path.remote,
            contents: buf,
        });
    }

    //
    // Handshake completion and application start
    //

    /// Initialize flow control from the negotiated parameters and start the application,
    /// iff the handshake has actually finished
    fn complete_handshake_if_possible(&mut self) -> bool {
        if !self.state.is_handshake() {
            return false;
        }
        if !self.session.is_completed() {
            return false;
        }
        if self.side.is_client() && !self.session.has_remote_transport_parameters() {
            return false;
        }

        let local_tp = self.session.local_transport_parameters();
        let remote_tp = self.session.remote_transport_parameters();
        self.streams
            .init_flow_control_params(&local_tp, remote_tp.as_ref());
        self.flow_control_buffer_size = local_tp.initial_max_data.into_inner();
        self.local_flow.set_limit(local_tp.initial_max_data.into_inner());
        if let Some(remote_tp) = &remote_tp {
            self.remote_flow
                .set_limit(remote_tp.initial_max_data.into_inner());
        }

        self.start_application();
        true
    }

    fn start_application(&mut self) {
        if self.app_started {
            return;
        }
        self.app_started = true;
        // ALPN may legitimately settle on nothing; hand the application the default tag
        let application = self
            .session
            .negotiated_application_name()
            .unwrap_or_else(|| ALPN_QUIC_HTTP.to_string());
        debug!(cids = %self.cids(), application = %application, "application started");
        self.events.push_back(Event::Connected { application });
    }

    //
    // Migration
    //

    /// React to a 1-RTT packet whose DCID is one of our alternates
    fn established_migrate_connection(&mut self, now: Instant, rx: &RxPacket) {
        let dcid = *rx.header.dst_cid();
        if dcid == self.local_cid {
            return;
        }

        if self.side.is_server() && self.remote_alt_cids.is_empty() {
            debug!("ignoring migration attempt before NEW_CONNECTION_ID");
            return;
        }
        let alt = match &mut self.alt_cids {
            Some(alt) => alt,
            None => {
                debug!("ignoring migration attempt, no alternate CIDs installed");
                return;
            }
        };
        if !alt.migrate_to(dcid, self.reset_token) {
            debug!(cid = %dcid, "connection migration failed");
            return;
        }

        debug!(old = %self.local_cid, new = %dcid, "connection migrated");
        // The peer has committed to the new CID; the old binding is dead weight
        self.cid_table.erase(&self.local_cid, self.handle);
        self.local_cid = dcid;

        if self.side.is_server() {
            self.path.remote = rx.remote;
            if let Some(new_peer) = self.remote_alt_cids.pop_front() {
                debug!(old = %self.peer_cid, new = %new_peer, "peer cid rotated");
                self.peer_cid = new_peer;
            }
            debug!(cids = %self.cids(), "active cids rotated");
            self.validate_new_path(now);
        }
    }

    /// Deliberate client-side migration exercise
    fn established_initiate_connection_migration(&mut self, now: Instant) {
        if !self.config.cm_exercise_enabled || self.migration_initiated {
            return;
        }
        let migration_disabled = self
            .session
            .remote_transport_parameters()
            .map_or(false, |tp| tp.disable_migration);
        if migration_disabled || self.remote_alt_cids.is_empty() {
            return;
        }

        debug!("initiating connection migration");
        self.migration_initiated = true;
        if let Some(new_peer) = self.remote_alt_cids.pop_front() {
            self.peer_cid = new_peer;
        }
        self.validate_new_path(now);
    }

    fn validate_new_path(&mut self, now: Instant) {
        self.path_validator.validate(&mut self.rng);
        let rto = self.current_rto();
        self.timers.set(Timer::PathValidation, now + 3 * rto);
        self.schedule_write(now, false);
    }

    //
    // State transitions
    //

    fn switch_to_established(&mut self, now: Instant) {
        if !self.complete_handshake_if_possible() {
            debug_assert!(false, "handshake must be complete");
            return;
        }
        debug!(
            cids = %self.cids(),
            cipher = ?self.session.negotiated_cipher_suite(),
            "entering established state"
        );
        self.state = State::Established;

        let migration_disabled = self
            .session
            .remote_transport_parameters()
            .map_or(false, |tp| tp.disable_migration);
        let install = match self.side {
            Side::Server => true,
            Side::Client => self.config.cm_exercise_enabled && !migration_disabled,
        };
        if install {
            let mut alt = AltCidState::new(self.config.local_cid_len);
            let issued = alt.issue(
                self.config.alt_cid_count,
                &mut self.rng,
                self.reset_token,
                &self.cid_table,
                self.handle,
            );
            self.spaces[SpaceId::Data as usize]
                .pending
                .new_cids
                .extend(issued);
            self.alt_cids = Some(alt);
            self.schedule_write(now, false);
        }
    }

    fn switch_to_closing(&mut self, now: Instant, reason: Close, error: ConnectionError) {
        if self.complete_handshake_if_possible() {
            debug!("handshake completed on the way into closing");
        }
        debug!(cids = %self.cids(), state = self.state.name(), %error, "entering closing state");
        let rto = self.current_rto();

        self.state = State::Closing(Closing::new(reason));
        self.events.push_back(Event::ConnectionLost { reason: error });
        // Flush the closing frame immediately, then stop the activity machinery
        self.schedule_write(now, false);
        self.timers.stop(Timer::Idle);
        self.timers.set(Timer::Closing, now + 3 * rto);
    }

    fn switch_to_draining(&mut self, now: Instant, error: ConnectionError) {
        if self.complete_handshake_if_possible() {
            debug!("handshake completed on the way into draining");
        }
        debug!(cids = %self.cids(), state = self.state.name(), %error, "entering draining state");
        let rto = self.current_rto();

        self.state = State::Draining;
        self.events.push_back(Event::ConnectionLost { reason: error });
        self.timers.stop(Timer::Idle);
        self.timers.stop(Timer::WriteReady);
        self.timers.set(Timer::Closing, now + 3 * rto);
    }

    fn switch_to_closed(&mut self, now: Instant) {
        debug!(cids = %self.cids(), "entering closed state");
        self.timers.stop(Timer::Closing);
        self.timers.stop(Timer::PathValidation);
        self.timers.stop(Timer::WriteReady);
        self.state = State::Closed;
        self.timers.set(Timer::Shutdown, now);
    }

    fn teardown(&mut self) {
        debug!(
            cids = %self.cids(),
            last_rx = ?self.last_received_packet_kind,
            "final teardown"
        );
        self.timers.reset();
        for space in &mut self.spaces {
            space.loss.shutdown();
        }
        self.remove_connection_ids();
        self.teardown_complete = true;
    }

    //
    // Error routing and timeouts
    //

    fn handle_error(&mut self, now: Instant, error: TransportError) {
        warn!(%error, "connection error");
        if self.state.is_closed() {
            return;
        }
        let reason = Close::Connection(frame::ConnectionClose::from(error.clone()));
        self.switch_to_closing(now, reason, ConnectionError::TransportError(error));
    }

    fn handle_idle_timeout(&mut self, now: Instant) {
        let error = TransportError::new(TransportErrorCode::NO_ERROR, "Idle Timeout");
        debug!(%error, "idle timeout");
        self.switch_to_draining(now, ConnectionError::TimedOut);
    }

    fn handle_path_validation_timeout(&mut self, now: Instant) {
        if !self.path_validator.is_validated() {
            debug!("path validation failed");
            self.switch_to_closed(now);
        }
    }

    //
    // Plumbing
    //

    fn current_rto(&self) -> Duration {
        let space = self.session.current_encryption_level().space();
        self.spaces[space as usize].loss.current_rto_period(&self.rtt)
    }

    /// Arm the write-ready timer unless one is already pending
    fn schedule_write(&mut self, now: Instant, delay: bool) {
        if matches!(self.state, State::Draining | State::Closed) {
            return;
        }
        if self.timers.get(Timer::WriteReady).is_none() {
            let at = if delay { now + WRITE_READY_INTERVAL } else { now };
            self.timers.set(Timer::WriteReady, at);
        }
    }

    /// Push the inactivity horizon out; packets moved in at least one direction
    fn net_activity(&mut self, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        let timeout = match self.side {
            Side::Server => self.config.no_activity_timeout_in,
            Side::Client => self.config.no_activity_timeout_out,
        };
        if !timeout.is_zero() {
            self.timers.set(Timer::Idle, now + timeout);
        }
    }
}
