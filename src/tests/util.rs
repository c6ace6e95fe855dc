use std::collections::VecDeque;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::info_span;

use crate::connection::Datagram;
use crate::crypto::{initial_keys, Keys, Session};
use crate::shared::ConnectionId;
use crate::transport_parameters::TransportParameters;
use crate::{
    CidTable, ConnEvent, Connection, ConnectionConfig, ConnectionHandle, EncryptionLevel, Event,
    Side, TransportError, TransportErrorCode, VarInt, VERSION,
};

pub(super) const SECRET: [u8; 8] = [0x51, 0x75, 0x69, 0x63, 0x54, 0x65, 0x73, 0x74];
pub(super) const HANDSHAKE_LABEL: u8 = 1;
pub(super) const ONE_RTT_LABEL: u8 = 2;

pub(super) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Keys both sides of a test pair can derive, standing in for the TLS key schedule
pub(super) fn level_keys(secret: &[u8; 8], label: u8, side: Side) -> Keys {
    let mut cid = [0u8; 9];
    cid[..8].copy_from_slice(secret);
    cid[8] = label;
    initial_keys(&ConnectionId::new(&cid), side)
}

pub(super) fn default_tp() -> TransportParameters {
    TransportParameters {
        initial_max_data: VarInt::from_u32(1 << 20),
        initial_max_stream_data_bidi_local: VarInt::from_u32(1 << 16),
        initial_max_stream_data_bidi_remote: VarInt::from_u32(1 << 16),
        initial_max_stream_data_uni: VarInt::from_u32(1 << 16),
        idle_timeout: VarInt::from_u32(30_000),
        ..TransportParameters::default()
    }
}

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const SERVER_FINISHED: u8 = 3;
const CLIENT_FINISHED: u8 = 4;

fn push_msg(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

/// A deterministic scripted handshake engine
///
/// Speaks a four-message toy protocol (hello and finished in each direction) carrying real
/// transport-parameter blocks, and derives per-level keys from a secret both test endpoints
/// share. Enough to drive every state the connection core distinguishes.
pub(super) struct TestSession {
    side: Side,
    secret: [u8; 8],
    local_tp: TransportParameters,
    remote_tp: Option<TransportParameters>,
    out: [Vec<u8>; 4],
    inbox: [Vec<u8>; 4],
    keys_out: VecDeque<(EncryptionLevel, Keys)>,
    completed: bool,
    version_negotiated: bool,
    pub(super) negotiated_versions: Arc<Mutex<Vec<u32>>>,
    /// The application protocol this endpoint "negotiates"; `None` models failed ALPN
    pub(super) alpn: Option<String>,
    level: EncryptionLevel,
}

impl TestSession {
    pub(super) fn new(
        side: Side,
        secret: [u8; 8],
        local_tp: TransportParameters,
        version_negotiated: bool,
    ) -> Self {
        Self {
            side,
            secret,
            local_tp,
            remote_tp: None,
            out: Default::default(),
            inbox: Default::default(),
            keys_out: VecDeque::new(),
            completed: false,
            version_negotiated,
            negotiated_versions: Arc::new(Mutex::new(Vec::new())),
            alpn: Some("hq-24".to_string()),
            level: EncryptionLevel::Initial,
        }
    }

    fn tp_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.local_tp.write(&mut body);
        body
    }

    fn handle_message(&mut self, tag: u8, body: &[u8]) -> Result<(), TransportError> {
        match (self.side, tag) {
            (Side::Server, CLIENT_HELLO) => {
                self.remote_tp =
                    Some(TransportParameters::read(&mut io::Cursor::new(body))?);
                let tp = self.tp_body();
                push_msg(&mut self.out[EncryptionLevel::Initial as usize], SERVER_HELLO, &tp);
                push_msg(
                    &mut self.out[EncryptionLevel::Handshake as usize],
                    SERVER_FINISHED,
                    &[],
                );
                self.keys_out.push_back((
                    EncryptionLevel::Handshake,
                    level_keys(&self.secret, HANDSHAKE_LABEL, Side::Server),
                ));
                self.keys_out.push_back((
                    EncryptionLevel::OneRtt,
                    level_keys(&self.secret, ONE_RTT_LABEL, Side::Server),
                ));
                self.level = EncryptionLevel::Handshake;
                Ok(())
            }
            (Side::Client, SERVER_HELLO) => {
                self.remote_tp =
                    Some(TransportParameters::read(&mut io::Cursor::new(body))?);
                self.keys_out.push_back((
                    EncryptionLevel::Handshake,
                    level_keys(&self.secret, HANDSHAKE_LABEL, Side::Client),
                ));
                self.keys_out.push_back((
                    EncryptionLevel::OneRtt,
                    level_keys(&self.secret, ONE_RTT_LABEL, Side::Client),
                ));
                self.level = EncryptionLevel::Handshake;
                Ok(())
            }
            (Side::Client, SERVER_FINISHED) => {
                push_msg(
                    &mut self.out[EncryptionLevel::Handshake as usize],
                    CLIENT_FINISHED,
                    &[],
                );
                self.completed = true;
                self.level = EncryptionLevel::OneRtt;
                Ok(())
            }
            (Side::Server, CLIENT_FINISHED) => {
                self.completed = true;
                self.level = EncryptionLevel::OneRtt;
                Ok(())
            }
            _ => Err(TransportError::PROTOCOL_VIOLATION(
                "unexpected handshake message",
            )),
        }
    }
}

impl Session for TestSession {
    fn start(&mut self) -> Result<(), TransportError> {
        if self.side.is_client() {
            let tp = self.tp_body();
            push_msg(&mut self.out[EncryptionLevel::Initial as usize], CLIENT_HELLO, &tp);
        }
        Ok(())
    }

    fn read_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<(), TransportError> {
        self.inbox[level as usize].extend_from_slice(data);
        loop {
            let (tag, body) = {
                let inbox = &mut self.inbox[level as usize];
                if inbox.len() < 3 {
                    return Ok(());
                }
                let len = u16::from_be_bytes([inbox[1], inbox[2]]) as usize;
                if inbox.len() < 3 + len {
                    return Ok(());
                }
                let tag = inbox[0];
                let body: Vec<u8> = inbox[3..3 + len].to_vec();
                inbox.drain(..3 + len);
                (tag, body)
            };
            self.handle_message(tag, &body)?;
        }
    }

    fn write_crypto(&mut self, level: EncryptionLevel, max_len: usize) -> Option<Bytes> {
        let out = &mut self.out[level as usize];
        if out.is_empty() || max_len == 0 {
            return None;
        }
        let take = out.len().min(max_len);
        let chunk = Bytes::copy_from_slice(&out[..take]);
        out.drain(..take);
        Some(chunk)
    }

    fn next_keys(&mut self) -> Option<(EncryptionLevel, Keys)> {
        self.keys_out.pop_front()
    }

    fn is_completed(&self) -> bool {
        self.completed
    }

    fn is_version_negotiated(&self) -> bool {
        self.version_negotiated
    }

    fn negotiate_version(&mut self, offered: &[u32]) -> Result<u32, TransportError> {
        self.negotiated_versions.lock().unwrap().extend(offered);
        if !offered.contains(&VERSION) {
            return Err(TransportError::new(
                TransportErrorCode::VERSION_NEGOTIATION_ERROR,
                "no common version",
            ));
        }
        self.version_negotiated = true;
        Ok(VERSION)
    }

    fn has_remote_transport_parameters(&self) -> bool {
        self.remote_tp.is_some()
    }

    fn remote_transport_parameters(&self) -> Option<TransportParameters> {
        self.remote_tp.clone()
    }

    fn local_transport_parameters(&self) -> TransportParameters {
        self.local_tp.clone()
    }

    fn current_encryption_level(&self) -> EncryptionLevel {
        self.level
    }

    fn negotiated_cipher_suite(&self) -> Option<&'static str> {
        self.completed.then_some("TLS_AES_128_GCM_SHA256")
    }

    fn negotiated_application_name(&self) -> Option<String> {
        if !self.completed {
            return None;
        }
        self.alpn.clone()
    }

    fn reset(&mut self) {
        self.out = Default::default();
        self.inbox = Default::default();
        self.keys_out.clear();
        self.completed = false;
        self.remote_tp = None;
        self.level = EncryptionLevel::Initial;
    }
}

pub(super) struct TestEndpoint {
    pub(super) conn: Connection,
    pub(super) table: CidTable,
    pub(super) addr: SocketAddr,
    /// Datagrams emitted, whether or not they were delivered
    pub(super) sent: u64,
    /// Copy of every datagram emitted, for wire-level assertions
    pub(super) outbound_log: Vec<Vec<u8>>,
}

impl TestEndpoint {
    fn new(conn: Connection, table: CidTable, addr: SocketAddr) -> Self {
        Self {
            conn,
            table,
            addr,
            sent: 0,
            outbound_log: Vec::new(),
        }
    }

    pub(super) fn deliver(&mut self, now: Instant, remote: SocketAddr, contents: Vec<u8>) {
        self.conn.receive_queue().enqueue(Datagram {
            remote,
            contents: BytesMut::from(&contents[..]),
        });
        self.conn.handle_event(now, ConnEvent::PacketReadReady);
    }

    pub(super) fn take_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.conn.poll() {
            events.push(event);
        }
        events
    }
}

/// A client and server connection joined by a lossless, zero-latency in-memory link
pub(super) struct Pair {
    pub(super) server: TestEndpoint,
    pub(super) client: TestEndpoint,
    pub(super) time: Instant,
    pub(super) drop_client_to_server: bool,
    pub(super) drop_server_to_client: bool,
    pub(super) client_negotiated: Arc<Mutex<Vec<u32>>>,
}

impl Pair {
    pub(super) fn new(
        client_cfg: ConnectionConfig,
        server_cfg: ConnectionConfig,
        client_version_negotiated: bool,
    ) -> Self {
        let client_session = TestSession::new(
            Side::Client,
            SECRET,
            default_tp(),
            client_version_negotiated,
        );
        Self::with_client_session(client_session, client_cfg, server_cfg)
    }

    /// Assemble a pair around a client session the test prepared itself
    pub(super) fn with_client_session(
        client_session: TestSession,
        client_cfg: ConnectionConfig,
        server_cfg: ConnectionConfig,
    ) -> Self {
        init_tracing();
        let now = Instant::now();
        let client_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 1111);
        let server_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);

        let client_negotiated = client_session.negotiated_versions.clone();

        let client_table = CidTable::new();
        let mut rng = rand::thread_rng();
        let original_cid = ConnectionId::random(&mut rng, 8);
        let client = Connection::new(
            Arc::new(client_cfg),
            Side::Client,
            ConnectionHandle(0),
            client_table.clone(),
            client_addr,
            server_addr,
            ConnectionId::new(&[]),
            original_cid,
            Box::new(client_session),
            now,
        )
        .unwrap();

        let server_table = CidTable::new();
        let server_session = TestSession::new(Side::Server, SECRET, default_tp(), true);
        let server = Connection::new(
            Arc::new(server_cfg),
            Side::Server,
            ConnectionHandle(1),
            server_table.clone(),
            server_addr,
            client_addr,
            client.local_cid(),
            client.original_cid(),
            Box::new(server_session),
            now,
        )
        .unwrap();

        Self {
            server: TestEndpoint::new(server, server_table, server_addr),
            client: TestEndpoint::new(client, client_table, client_addr),
            time: now,
            drop_client_to_server: false,
            drop_server_to_client: false,
            client_negotiated,
        }
    }

    pub(super) fn default_pair() -> Self {
        Self::new(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            true,
        )
    }

    /// Replace the server connection, as a demultiplexer would after RETRY re-keys the client
    pub(super) fn respawn_server(&mut self, cfg: ConnectionConfig) {
        let table = CidTable::new();
        let session = TestSession::new(Side::Server, SECRET, default_tp(), true);
        let conn = Connection::new(
            Arc::new(cfg),
            Side::Server,
            ConnectionHandle(2),
            table.clone(),
            self.server.addr,
            self.client.addr,
            self.client.conn.local_cid(),
            self.client.conn.original_cid(),
            Box::new(session),
            self.time,
        )
        .unwrap();
        self.server = TestEndpoint::new(conn, table, self.server.addr);
    }

    /// Exchange datagrams at the current time until neither side produces more
    pub(super) fn flush(&mut self) -> bool {
        let mut moved = false;
        loop {
            let mut any = false;
            {
                let span = info_span!("client");
                let _guard = span.enter();
                self.client.conn.handle_timeout(self.time);
            }
            {
                let span = info_span!("server");
                let _guard = span.enter();
                self.server.conn.handle_timeout(self.time);
            }

            let client_addr = self.client.addr;
            while let Some(t) = self.client.conn.poll_transmit() {
                any = true;
                self.client.sent += 1;
                self.client.outbound_log.push(t.contents.clone());
                if !self.drop_client_to_server {
                    let span = info_span!("server");
                    let _guard = span.enter();
                    self.server.deliver(self.time, client_addr, t.contents);
                }
            }
            let server_addr = self.server.addr;
            while let Some(t) = self.server.conn.poll_transmit() {
                any = true;
                self.server.sent += 1;
                self.server.outbound_log.push(t.contents.clone());
                if !self.drop_server_to_client {
                    let span = info_span!("client");
                    let _guard = span.enter();
                    self.client.deliver(self.time, server_addr, t.contents);
                }
            }
            if !any {
                break;
            }
            moved = true;
        }
        moved
    }

    /// Flush, then advance the clock to the nearest timer; false when fully idle
    pub(super) fn step(&mut self) -> bool {
        if self.flush() {
            return true;
        }
        let next = [
            self.client.conn.next_timeout(),
            self.server.conn.next_timeout(),
        ]
        .into_iter()
        .flatten()
        .min();
        match next {
            Some(t) => {
                self.time = self.time.max(t);
                true
            }
            None => false,
        }
    }

    pub(super) fn drive_until(
        &mut self,
        max_steps: usize,
        mut done: impl FnMut(&mut Self) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            if !self.step() {
                break;
            }
        }
        done(self)
    }

    /// Run the handshake to completion on both sides
    pub(super) fn connect(&mut self) {
        let connected = self.drive_until(1000, |pair| {
            !pair.client.conn.is_handshaking() && !pair.server.conn.is_handshaking()
        });
        assert!(connected, "handshake did not complete");
    }
}
