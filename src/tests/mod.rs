use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};

use crate::crypto::Keys;
use crate::frame;
use crate::packet::{Header, PacketKind, PacketNumber, PartialDecode};
use crate::*;

mod util;
use util::*;

/// Decode the first packet of a client datagram under the given original CID's initial keys
fn decode_client_initial(contents: &[u8], odcid: ConnectionId) -> (u64, usize, usize) {
    let keys = crate::crypto::initial_keys(&odcid, Side::Server);
    let (decode, _rest) = PartialDecode::new(BytesMut::from(contents), 0).unwrap();
    let packet = decode.finish(Some(&keys.header.remote)).unwrap();
    let (pn, token_len) = match &packet.header {
        Header::Initial { number, token, .. } => (number.expand(0), token.len()),
        x => panic!("not an initial packet: {x:?}"),
    };
    let mut payload = packet.payload;
    keys.packet
        .remote
        .decrypt(pn, &packet.header_data, &mut payload)
        .unwrap();
    (pn, token_len, payload.len())
}

/// Build a sealed 1-RTT packet carrying `payload`, as the holder of `keys` would
fn seal_short(keys: &Keys, dst_cid: ConnectionId, pn: u64, payload: &[u8]) -> Vec<u8> {
    let header = Header::Short {
        key_phase: false,
        dst_cid,
        number: PacketNumber::new(pn, 0),
    };
    let mut buf = Vec::new();
    let partial = header.encode(&mut buf);
    buf.extend_from_slice(payload);
    partial.finish(&mut buf, &keys.header.local, Some((pn, &keys.packet.local)));
    buf
}

/// Collect the connection IDs a peer advertised via NEW_CONNECTION_ID in these datagrams
fn extract_new_cids(datagrams: &[Vec<u8>], direction: Side) -> Vec<ConnectionId> {
    let keys = level_keys(&SECRET, ONE_RTT_LABEL, direction);
    let mut out = Vec::new();
    for dgram in datagrams {
        let mut next = Some(BytesMut::from(&dgram[..]));
        while let Some(data) = next.take() {
            let (decode, rest) = match PartialDecode::new(data, 8) {
                Ok(x) => x,
                Err(_) => break,
            };
            next = rest;
            if decode.kind() != PacketKind::OneRtt {
                continue;
            }
            let packet = match decode.finish(Some(&keys.header.remote)) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let pn = match packet.header.number() {
                Some(n) => n.expand(0),
                None => continue,
            };
            let mut payload = packet.payload;
            if keys
                .packet
                .remote
                .decrypt(pn, &packet.header_data, &mut payload)
                .is_err()
            {
                continue;
            }
            if let Ok(iter) = frame::Iter::new(payload.freeze()) {
                for frame in iter.flatten() {
                    if let frame::Frame::NewConnectionId(ncid) = frame {
                        out.push(ncid.id);
                    }
                }
            }
        }
    }
    out
}

#[test]
fn handshake_completes_single_flight() {
    let mut pair = Pair::default_pair();
    pair.connect();

    let client_events = pair.client.take_events();
    assert!(client_events
        .iter()
        .any(|e| matches!(e, Event::Connected { application } if application == "hq-24")));
    let server_events = pair.server.take_events();
    assert!(server_events
        .iter()
        .any(|e| matches!(e, Event::Connected { .. })));
}

#[test]
fn missing_alpn_falls_back_to_default_protocol() {
    let mut session = TestSession::new(Side::Client, SECRET, default_tp(), true);
    session.alpn = None;
    let mut pair = Pair::with_client_session(
        session,
        ConnectionConfig::default(),
        ConnectionConfig::default(),
    );
    pair.connect();

    let events = pair.client.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Connected { application } if application == ALPN_QUIC_HTTP)));
}

#[test]
fn first_client_initial_is_full_size() {
    let mut pair = Pair::default_pair();
    pair.drop_client_to_server = true;
    assert!(pair.drive_until(10, |p| p.client.sent > 0));

    let datagram = pair.client.outbound_log[0].clone();
    let (pn, token_len, payload_len) = decode_client_initial(&datagram, pair.client.conn.original_cid());
    assert_eq!(pn, 0);
    assert_eq!(token_len, 0);
    assert!(
        payload_len >= 1200,
        "initial payload must be padded to at least 1200 bytes, got {payload_len}"
    );
}

#[test]
fn stream_data_round_trip() {
    let mut pair = Pair::default_pair();
    pair.connect();

    let now = pair.time;
    let id = pair.client.conn.open_stream(Dir::Bi);
    pair.client
        .conn
        .write_stream(now, id, Bytes::from_static(b"hello quic"));

    let mut got = Vec::new();
    let done = pair.drive_until(200, |p| {
        while let Some(chunk) = p.server.conn.read_stream(id) {
            got.extend_from_slice(&chunk);
        }
        got.len() >= 10
    });
    assert!(done);
    assert_eq!(&got[..], b"hello quic");
    assert!(pair
        .server
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::StreamReadable { id: sid } if *sid == id)));
}

#[test]
fn version_negotiation_resets_and_restarts() {
    let mut pair = Pair::new(
        ConnectionConfig::default(),
        ConnectionConfig::default(),
        false,
    );
    pair.drop_client_to_server = true;
    assert!(pair.drive_until(10, |p| p.client.sent > 0));
    let sent_before = pair.client.sent;

    // A VERSION_NEGOTIATION naming a version we support
    let header = Header::VersionNegotiate {
        random: 0x2a,
        dst_cid: pair.client.conn.local_cid(),
        src_cid: ConnectionId::new(&[9; 8]),
    };
    let mut buf = Vec::new();
    let _ = header.encode(&mut buf);
    buf.extend_from_slice(&VERSION.to_be_bytes());
    let (time, server_addr) = (pair.time, pair.server.addr);
    pair.client.deliver(time, server_addr, buf);

    assert!(
        pair.client_negotiated.lock().unwrap().contains(&VERSION),
        "handshake engine should have been asked to negotiate"
    );

    // A fresh first flight goes out; packet numbers continue rather than restart
    assert!(pair.drive_until(10, |p| p.client.sent > sent_before));
    let datagram = pair.client.outbound_log.last().unwrap().clone();
    let (pn, _, payload_len) = decode_client_initial(&datagram, pair.client.conn.original_cid());
    assert!(pn >= 1, "packet numbers must survive the transport reset");
    assert!(payload_len >= 1200);
}

#[test]
fn version_negotiation_foreign_cid_ignored() {
    let mut pair = Pair::new(
        ConnectionConfig::default(),
        ConnectionConfig::default(),
        false,
    );
    pair.drop_client_to_server = true;
    assert!(pair.drive_until(10, |p| p.client.sent > 0));

    let header = Header::VersionNegotiate {
        random: 0x15,
        dst_cid: ConnectionId::new(&[7; 8]),
        src_cid: ConnectionId::new(&[9; 8]),
    };
    let mut buf = Vec::new();
    let _ = header.encode(&mut buf);
    buf.extend_from_slice(&VERSION.to_be_bytes());
    let (time, server_addr) = (pair.time, pair.server.addr);
    pair.client.deliver(time, server_addr, buf);

    assert!(pair.client_negotiated.lock().unwrap().is_empty());
    assert!(!pair.client.conn.is_closed());
}

#[test]
fn retry_rerandomizes_original_cid_and_rekeys() {
    let server_cfg = ConnectionConfig {
        stateless_retry: true,
        ..ConnectionConfig::default()
    };
    let mut pair = Pair::new(ConnectionConfig::default(), server_cfg, true);
    let old_ocid = pair.client.conn.original_cid();

    // Hand the first Initial to the server manually so the client's post-retry flight can be
    // isolated from the stale server connection
    pair.drop_client_to_server = true;
    assert!(pair.drive_until(10, |p| p.client.sent >= 1));
    let first_initial = pair.client.outbound_log[0].clone();
    let (time, client_addr) = (pair.time, pair.client.addr);
    pair.server.deliver(time, client_addr, first_initial);
    pair.flush();

    let new_ocid = pair.client.conn.original_cid();
    assert_ne!(old_ocid, new_ocid, "RETRY must rerandomize the original CID");
    assert!(pair.client.table.contains(&new_ocid));
    assert!(!pair.client.table.contains(&old_ocid));

    // The fresh Initial is keyed from the new original CID and echoes the retry token
    assert!(pair.drive_until(10, |p| p.client.sent >= 2));
    let fresh = pair.client.outbound_log.last().unwrap().clone();
    let (_, token_len, payload_len) = decode_client_initial(&fresh, new_ocid);
    assert_eq!(token_len, 16);
    assert!(payload_len >= 1200);

    // The demultiplexer would route the re-keyed Initial to a fresh connection
    pair.respawn_server(ConnectionConfig {
        stateless_retry: true,
        ..ConnectionConfig::default()
    });
    pair.drop_client_to_server = false;
    pair.connect();
}

#[test]
fn idle_timeout_drains_then_closes() {
    let client_cfg = ConnectionConfig {
        no_activity_timeout_out: Duration::from_millis(500),
        ..ConnectionConfig::default()
    };
    let mut pair = Pair::new(client_cfg, ConnectionConfig::default(), true);
    pair.connect();
    let _ = pair.client.take_events();

    assert!(pair.drive_until(5000, |p| p.client.conn.is_closed()));
    let sent_at_drain = pair.client.sent;
    assert!(pair
        .client
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost { reason: ConnectionError::TimedOut })));

    assert!(pair.drive_until(5000, |p| p.client.conn.is_drained()));
    assert_eq!(
        pair.client.sent, sent_at_drain,
        "a draining endpoint must not transmit"
    );
}

#[test]
fn peer_initiated_close_drains() {
    let mut pair = Pair::default_pair();
    pair.connect();
    let _ = pair.client.take_events();
    let _ = pair.server.take_events();

    let t = pair.time;
    pair.server
        .conn
        .close(t, 0x000A, Bytes::from_static(b"go away"));
    assert!(pair.drive_until(100, |p| p.client.conn.is_closed()));

    let events = pair.client.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost { reason: ConnectionError::ApplicationClosed(a) } if a.error_code == 0x000A
    )));

    let client_sent = pair.client.sent;
    assert!(pair.drive_until(5000, |p| p.client.conn.is_drained()));
    assert_eq!(
        pair.client.sent, client_sent,
        "no CLOSE is re-emitted from the draining state"
    );
}

#[test]
fn server_side_migration_with_path_validation() {
    let client_cfg = ConnectionConfig {
        cm_exercise_enabled: true,
        ..ConnectionConfig::default()
    };
    let mut pair = Pair::new(client_cfg, ConnectionConfig::default(), true);
    pair.connect();
    let deadline = pair.time + Duration::from_millis(500);
    pair.drive_until(1000, |p| p.time >= deadline);

    let issued = extract_new_cids(&pair.server.outbound_log, Side::Client);
    assert!(issued.len() >= 2, "server should have issued alternate CIDs");
    let current = pair.server.conn.local_cid();
    let target = *issued
        .iter()
        .find(|c| **c != current)
        .expect("an unconsumed alternate CID");

    // The peer moves and sends from its new address with an alternate DCID
    let new_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 2222);
    pair.client.addr = new_addr;
    let client_keys = level_keys(&SECRET, ONE_RTT_LABEL, Side::Client);
    let pkt = seal_short(&client_keys, target, 30_000, &[0x01, 0, 0, 0]);
    let t = pair.time;
    pair.server.deliver(t, new_addr, pkt);

    assert_eq!(pair.server.conn.local_cid(), target);
    assert_eq!(pair.server.conn.remote_address(), new_addr);

    // The PATH_CHALLENGE round trip completes within 3×RTO, so the server stays up
    let deadline = pair.time + Duration::from_secs(2);
    pair.drive_until(5000, |p| p.time >= deadline);
    assert!(!pair.server.conn.is_closed());
    assert!(!pair.client.conn.is_closed());
}

#[test]
fn path_validation_timeout_closes_directly() {
    let client_cfg = ConnectionConfig {
        cm_exercise_enabled: true,
        ..ConnectionConfig::default()
    };
    let mut pair = Pair::new(client_cfg, ConnectionConfig::default(), true);
    pair.connect();
    let deadline = pair.time + Duration::from_millis(500);
    pair.drive_until(1000, |p| p.time >= deadline);

    let issued = extract_new_cids(&pair.server.outbound_log, Side::Client);
    let current = pair.server.conn.local_cid();
    let target = *issued
        .iter()
        .find(|c| **c != current)
        .expect("an unconsumed alternate CID");

    // The peer's new path swallows everything the server sends, so its PATH_CHALLENGE can
    // never be answered
    pair.drop_server_to_client = true;
    let new_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4444);
    pair.client.addr = new_addr;
    let client_keys = level_keys(&SECRET, ONE_RTT_LABEL, Side::Client);
    let pkt = seal_short(&client_keys, target, 50_000, &[0x01, 0, 0, 0]);
    let t = pair.time;
    let sent_before = pair.server.sent;
    pair.server.deliver(t, new_addr, pkt);
    assert_eq!(pair.server.conn.local_cid(), target);

    // Let the PATH_CHALLENGE go out on the next write tick
    assert!(pair.drive_until(10, |p| p.server.sent > sent_before));
    let sent_after_challenge = pair.server.sent;

    // 3×RTO passes without a PATH_RESPONSE; the server goes straight to closed
    assert!(pair.drive_until(5000, |p| p.server.conn.is_closed()));
    assert!(pair.drive_until(100, |p| p.server.conn.is_drained()));
    // No closing frame goes out on this path; the peer already has our packets
    assert_eq!(pair.server.sent, sent_after_challenge);
}

#[test]
fn migration_without_peer_cids_is_ignored() {
    // The client never issues NEW_CONNECTION_ID, so the server must ignore migration
    let mut pair = Pair::default_pair();
    pair.connect();
    let deadline = pair.time + Duration::from_millis(200);
    pair.drive_until(500, |p| p.time >= deadline);

    let issued = extract_new_cids(&pair.server.outbound_log, Side::Client);
    assert!(!issued.is_empty());
    let target = issued[0];
    let old = pair.server.conn.local_cid();

    let client_keys = level_keys(&SECRET, ONE_RTT_LABEL, Side::Client);
    let pkt = seal_short(&client_keys, target, 40_000, &[0x01, 0, 0, 0]);
    let new_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 3333);
    let t = pair.time;
    pair.server.deliver(t, new_addr, pkt);

    assert_eq!(pair.server.conn.local_cid(), old);
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn closing_response_backoff_caps_transmissions() {
    let mut pair = Pair::default_pair();
    pair.connect();

    let t = pair.time;
    let sent_before_close = pair.client.sent;
    pair.client.conn.close(t, 0, Bytes::new());
    // The closing frame goes out on the next write tick
    assert!(
        pair.drive_until(10, |p| p.client.sent > sent_before_close),
        "the closing frame must be flushed"
    );
    let base_sent = pair.client.sent;

    // Bombard the closing endpoint in bursts sized to the doubling receive windows; after
    // each burst one delayed response fires, until the hard transmission cap bites
    let server_keys = level_keys(&SECRET, ONE_RTT_LABEL, Side::Server);
    let mut pn = 10_000u64;
    for burst in [1u64, 2, 4, 8, 16, 32, 64, 128] {
        for _ in 0..burst {
            let local_cid = pair.client.conn.local_cid();
            let pkt = seal_short(&server_keys, local_cid, pn, &[0x01, 0, 0, 0]);
            pn += 1;
            let (t, saddr) = (pair.time, pair.server.addr);
            pair.client.deliver(t, saddr, pkt);
        }
        pair.step();
        pair.step();
    }
    let responses = pair.client.sent - base_sent;
    assert_eq!(
        responses, 7,
        "the doubling schedule admits seven responses before the cap of eight transmissions"
    );
    assert!(pair.client.conn.is_closed());
}

#[test]
fn anti_amplification_limits_unvalidated_server() {
    let mut pair = Pair::default_pair();
    // The server's flights never arrive, so the client can never validate its address
    pair.drop_server_to_client = true;
    assert!(pair.drive_until(500, |p| p.server.sent >= 2));

    let deadline = pair.time + Duration::from_secs(3);
    pair.drive_until(5000, |p| p.time >= deadline);
    assert_eq!(
        pair.server.sent, 2,
        "an unvalidated server stops after three handshake packets"
    );
}

#[test]
fn close_is_idempotent() {
    let mut pair = Pair::default_pair();
    pair.connect();
    let _ = pair.client.take_events();

    let t = pair.time;
    pair.client.conn.close(t, 1, Bytes::new());
    pair.client.conn.close(t, 2, Bytes::new());
    pair.flush();
    pair.client.conn.close(pair.time, 3, Bytes::new());

    let events = pair.client.take_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::ConnectionLost { .. }))
            .count(),
        1
    );
}

#[test]
fn zero_length_new_connection_id_is_protocol_violation() {
    let mut pair = Pair::default_pair();
    pair.connect();
    let _ = pair.client.take_events();

    let mut payload = Vec::new();
    frame::NewConnectionId {
        sequence: 77,
        id: ConnectionId::new(&[]),
        reset_token: [0xcc; 16].into(),
    }
    .encode(&mut payload);
    payload.resize(payload.len().max(4), 0);

    let server_keys = level_keys(&SECRET, ONE_RTT_LABEL, Side::Server);
    let local_cid = pair.client.conn.local_cid();
    let pkt = seal_short(&server_keys, local_cid, 20_000, &payload);
    let (t, saddr) = (pair.time, pair.server.addr);
    pair.client.deliver(t, saddr, pkt);

    assert!(pair.client.conn.is_closed());
    let events = pair.client.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost { reason: ConnectionError::TransportError(te) }
            if te.code == TransportErrorCode::PROTOCOL_VIOLATION
    )));
}

#[test]
fn cid_table_bindings_follow_lifecycle() {
    let mut pair = Pair::default_pair();
    let local_cid = pair.client.conn.local_cid();
    let original_cid = pair.client.conn.original_cid();
    assert!(pair.client.table.contains(&local_cid));
    assert!(pair.client.table.contains(&original_cid));

    pair.connect();
    let t = pair.time;
    pair.client.conn.close(t, 0, Bytes::new());
    assert!(pair.drive_until(5000, |p| p.client.conn.is_drained()));

    assert!(!pair.client.table.contains(&local_cid));
    assert!(!pair.client.table.contains(&original_cid));
    assert!(pair.client.table.is_empty());
}

#[test]
fn late_handshake_packets_are_tolerated_when_established() {
    let mut pair = Pair::default_pair();
    pair.connect();

    // A stale Initial arriving after establishment is acked and otherwise ignored
    let odcid = pair.client.conn.original_cid();
    let keys = crate::crypto::initial_keys(&odcid, Side::Client);
    let header = Header::Initial {
        dst_cid: pair.server.conn.local_cid(),
        src_cid: pair.client.conn.local_cid(),
        token: Bytes::new(),
        number: PacketNumber::new(50, 0),
    };
    let mut buf = Vec::new();
    let partial = header.encode(&mut buf);
    let mut payload = Vec::new();
    frame::Crypto {
        offset: 0,
        data: Bytes::from_static(b"\x01\x00\x00"),
    }
    .encode(&mut payload);
    payload.resize(payload.len().max(4), 0);
    buf.extend_from_slice(&payload);
    partial.finish(&mut buf, &keys.header.local, Some((50, &keys.packet.local)));

    let (t, caddr) = (pair.time, pair.client.addr);
    pair.server.deliver(t, caddr, buf);
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn connection_stats_track_traffic() {
    let mut pair = Pair::default_pair();
    pair.connect();
    let stats = pair.client.conn.stats();
    assert!(stats.packets_sent > 0);
    assert!(stats.packets_received > 0);
    assert_matches!(pair.client.conn.stats().packets_lost, 0);
}
