//! Connection-level scenario tests driving the full receive/send pipeline
//! with a scripted TLS engine and client-built packets.

use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::connection::handshake::ConnectionState;
use crate::crypto::suite::CipherSuite;
use crate::frames::{parse_frame, Frame};
use crate::packet::header::{Header, PacketType};
use crate::packet::space::SpaceId;
use crate::test_util::*;
use crate::tls::{EncryptionLevel, TlsEvent};
use crate::transport::parameters::TransportParameters;
use crate::types::INITIAL_PACKET_MINLEN;

fn feed(conn: &mut crate::Connection, datagram: &[u8]) {
    let header = Header::parse(datagram, 8).unwrap();
    let len = header.packet_len(datagram.len());
    conn.accept_packet(header, BytesMut::from(&datagram[..len]), Instant::now());
}

fn frames_of(payload: &[u8]) -> Vec<Frame> {
    let payload = bytes::Bytes::copy_from_slice(payload);
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (frame, consumed) = parse_frame(&payload, offset).unwrap();
        offset += consumed;
        frames.push(frame);
    }
    frames
}

#[test]
fn test_client_initial_delivers_client_hello() {
    let (mut conn, script) = server_conn();
    let client_hello = vec![0x01u8; 245];
    let datagram = client_initial_with_payload(
        &odcid(),
        &client_scid(),
        0,
        &crypto_payload(0, &client_hello),
        Some(1200),
    );

    feed(&mut conn, &datagram);
    conn.drive(Instant::now());

    // The CRYPTO payload reached the TLS engine in order.
    let state = script.lock().unwrap();
    assert_eq!(state.received.len(), 1);
    assert_eq!(state.received[0].0, EncryptionLevel::Initial);
    assert_eq!(state.received[0].1, client_hello);
    drop(state);

    // Packet-number bookkeeping and ACK scheduling for the Initial space.
    let space = conn.space(SpaceId::Initial);
    assert_eq!(space.largest_rx_pn, Some(0));
    assert_eq!(space.ack_ranges.largest(), Some(0));
    assert_eq!(
        conn.level(EncryptionLevel::Initial).rx_crypto_offset,
        client_hello.len() as u64
    );

    // The outgoing DCID follows the client's SCID.
    assert_eq!(conn.dcid, client_scid());
}

#[test]
fn test_ack_only_server_initial_is_padded() {
    let (mut conn, _script) = server_conn();
    let datagram = client_initial_with_payload(
        &odcid(),
        &client_scid(),
        0,
        &crypto_payload(0, b"hello tls"),
        Some(1200),
    );
    feed(&mut conn, &datagram);
    conn.drive(Instant::now());

    // One ack-eliciting packet arms the ACK; the server's Initial reply is
    // expanded to the Initial minimum.
    let (reply, dst) = conn.poll_transmit().expect("an ACK packet is due");
    assert_eq!(dst, peer_addr());
    assert_eq!(reply.len(), INITIAL_PACKET_MINLEN);

    let opened = open_server_packet(&reply, &client_initial_rx_keys(), 8);
    assert_eq!(opened.ty, PacketType::Initial);
    assert_eq!(opened.pn, 0);
    let frames = frames_of(&opened.payload);
    match &frames[0] {
        Frame::Ack(ack) => {
            assert_eq!(ack.largest_ack, 0);
            assert_eq!(ack.first_ack_range, 0);
        }
        other => panic!("expected leading ACK, got {:?}", other),
    }
    assert!(frames.iter().any(|f| matches!(f, Frame::Padding { .. })));
}

#[test]
fn test_in_order_crypto_across_two_packets() {
    let (mut conn, script) = server_conn();
    let part_a = vec![0xaau8; 200];
    let part_b = vec![0xbbu8; 150];

    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &crypto_payload(0, &part_a), None),
    );
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 1, &crypto_payload(200, &part_b), None),
    );
    conn.drive(Instant::now());

    let state = script.lock().unwrap();
    assert_eq!(state.received.len(), 2);
    assert_eq!(state.received[0].1, part_a);
    assert_eq!(state.received[1].1, part_b);
    drop(state);

    assert_eq!(conn.level(EncryptionLevel::Initial).rx_crypto_offset, 350);
    assert!(conn.level(EncryptionLevel::Initial).rx_packets.is_empty());
}

#[test]
fn test_out_of_order_crypto_is_held_then_drained() {
    let (mut conn, script) = server_conn();
    let part_a = vec![0xaau8; 200];
    let part_b = vec![0xbbu8; 150];

    // Arrival order reversed relative to stream offsets.
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 1, &crypto_payload(200, &part_b), None),
    );
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &crypto_payload(0, &part_a), None),
    );
    conn.drive(Instant::now());

    let state = script.lock().unwrap();
    assert_eq!(state.received.len(), 2);
    assert_eq!(state.received[0].1, part_a);
    assert_eq!(state.received[1].1, part_b);
    drop(state);
    assert_eq!(conn.level(EncryptionLevel::Initial).rx_crypto_offset, 350);
}

#[test]
fn test_out_of_order_crypto_against_packet_number_order() {
    // The lower packet number carries the higher stream offset, so the
    // by-PN sweep alone cannot deliver in order; the held packet drains on
    // the rescan after the cursor advances.
    let (mut conn, script) = server_conn();
    let part_a = vec![0xaau8; 200];
    let part_b = vec![0xbbu8; 150];

    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &crypto_payload(200, &part_b), None),
    );
    conn.drive(Instant::now());

    // Held: nothing delivered yet, packet stays buffered.
    assert!(script.lock().unwrap().received.is_empty());
    assert_eq!(conn.level(EncryptionLevel::Initial).rx_packets.len(), 1);

    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 1, &crypto_payload(0, &part_a), None),
    );
    conn.drive(Instant::now());

    let state = script.lock().unwrap();
    assert_eq!(state.received.len(), 2);
    assert_eq!(state.received[0].1, part_a);
    assert_eq!(state.received[1].1, part_b);
    drop(state);
    assert_eq!(conn.level(EncryptionLevel::Initial).rx_crypto_offset, 350);
    assert!(conn.level(EncryptionLevel::Initial).rx_packets.is_empty());
}

#[test]
fn test_ack_driven_retransmit() {
    let (mut conn, script) = server_conn();

    // Three Initial packets, one 100-byte CRYPTO frame each.
    for chunk in 0u8..3 {
        script
            .lock()
            .unwrap()
            .events
            .push_back(TlsEvent::HandshakeData(
                EncryptionLevel::Initial,
                vec![chunk; 100],
            ));
        conn.drive(Instant::now());
        while conn.poll_transmit().is_some() {}
    }
    assert_eq!(conn.crypto_in_flight, 300);
    assert_eq!(conn.space(SpaceId::Initial).tx_next_pn, 3);
    assert_eq!(conn.in_flight_frame_bytes(), 300);

    // ACK for packets 2 and 0; packet 1 sits in the gap.
    let ack = ack_payload(2, 0, &[(0, 0)]);
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &ack, Some(1200)),
    );
    conn.drive(Instant::now());

    // The lost frame was re-cut into a fresh packet in the same pass.
    assert!(!conn.retransmit);
    assert_eq!(conn.crypto_in_flight, 100);
    assert_eq!(conn.in_flight_frame_bytes(), 100);
    let level = conn.level(EncryptionLevel::Initial);
    assert!(level.tx_retransmit.is_empty());
    assert_eq!(level.tx_in_flight.len(), 1);
    let rec = level.tx_in_flight[&3];
    assert_eq!(rec.offset, 100);
    assert_eq!(rec.len, 100);
    assert_eq!(conn.space(SpaceId::Initial).largest_acked_pn, Some(2));

    // And the wire carries CRYPTO(offset=100, len=100) under packet 3.
    let (datagram, _) = conn.poll_transmit().expect("retransmit packet");
    let opened = open_server_packet(&datagram, &client_initial_rx_keys(), 8);
    assert_eq!(opened.pn, 3);
    let crypto = frames_of(&opened.payload)
        .into_iter()
        .find_map(|f| match f {
            Frame::Crypto(c) => Some(c),
            _ => None,
        })
        .expect("retransmitted CRYPTO frame");
    assert_eq!(crypto.offset, 100);
    assert_eq!(crypto.data.len(), 100);
    assert_eq!(&crypto.data[..], &[1u8; 100][..]);
}

#[test]
fn test_malformed_ack_is_fatal() {
    let (mut conn, _script) = server_conn();
    // largest_ack beyond anything we sent.
    let ack = ack_payload(42, 0, &[]);
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &ack, Some(1200)),
    );
    conn.drive(Instant::now());

    assert!(conn.is_draining());
    // A CONNECTION_CLOSE with FRAME_ENCODING_ERROR goes out once.
    let (datagram, _) = conn.poll_transmit().expect("close packet");
    let opened = open_server_packet(&datagram, &client_initial_rx_keys(), 8);
    let close = frames_of(&opened.payload)
        .into_iter()
        .find_map(|f| match f {
            Frame::ConnectionClose(c) => Some(c),
            _ => None,
        })
        .expect("CONNECTION_CLOSE frame");
    assert_eq!(close.error_code, 0x07);
}

#[test]
fn test_tampered_packet_dropped_silently() {
    let (mut conn, script) = server_conn();
    let mut datagram = client_initial_with_payload(
        &odcid(),
        &client_scid(),
        0,
        &crypto_payload(0, b"client hello"),
        Some(1200),
    );
    // Flip a payload byte far past the header-protection sample.
    let index = datagram.len() - 4;
    datagram[index] ^= 0xff;

    feed(&mut conn, &datagram);
    conn.drive(Instant::now());

    assert!(script.lock().unwrap().received.is_empty());
    assert_eq!(conn.space(SpaceId::Initial).largest_rx_pn, None);
    assert!(conn.space(SpaceId::Initial).ack_ranges.is_empty());
    assert!(!conn.is_draining());
}

#[test]
fn test_handshake_packets_parked_until_keys() {
    let (mut conn, script) = server_conn();
    let suite = CipherSuite::Aes128GcmSha256;
    let secret = vec![0x17u8; 32];
    let keys = level_keys_from_secret(suite, &secret);

    // A Handshake packet before any Handshake secrets: parked.
    let datagram = build_long_packet(
        PacketType::Handshake,
        conn.scid(),
        &client_scid(),
        0,
        &crypto_payload(0, b"finished"),
        None,
        &keys,
    );
    feed(&mut conn, &datagram);
    conn.drive(Instant::now());

    assert_eq!(conn.level(EncryptionLevel::Handshake).rx_pending_hp.len(), 1);
    assert!(script.lock().unwrap().received.is_empty());
    assert_eq!(conn.state(), ConnectionState::ServerHandshake);

    // Once the engine installs the matching read secret the parked packet
    // is unprotected, decrypted and its CRYPTO data delivered.
    script.lock().unwrap().events.push_back(TlsEvent::ReadSecret(
        EncryptionLevel::Handshake,
        suite.tls_id(),
        secret,
    ));
    conn.drive(Instant::now());

    assert!(conn.level(EncryptionLevel::Handshake).rx_pending_hp.is_empty());
    let state = script.lock().unwrap();
    assert_eq!(state.received.len(), 1);
    assert_eq!(state.received[0].0, EncryptionLevel::Handshake);
    assert_eq!(state.received[0].1, b"finished");
}

#[test]
fn test_handshake_completion_emits_done_and_new_cids() {
    let (mut conn, script) = server_conn();
    let suite = CipherSuite::Aes128GcmSha256;
    let tx_secret = vec![0x21u8; 32];
    let rx_secret = vec![0x22u8; 32];

    let peer_params = TransportParameters {
        active_connection_id_limit: 3,
        max_idle_timeout: 10_000,
        ..Default::default()
    };

    {
        let mut state = script.lock().unwrap();
        state.peer_params = Some(peer_params.encode().unwrap().to_vec());
        state.events.push_back(TlsEvent::WriteSecret(
            EncryptionLevel::OneRtt,
            suite.tls_id(),
            tx_secret.clone(),
        ));
        state.events.push_back(TlsEvent::ReadSecret(
            EncryptionLevel::OneRtt,
            suite.tls_id(),
            rx_secret,
        ));
        state.complete = true;
    }
    conn.drive(Instant::now());

    assert_eq!(conn.state(), ConnectionState::Confirmed);
    assert_eq!(
        conn.peer_params().unwrap().active_connection_id_limit,
        3
    );
    // Peer idle timeout tightened ours.
    assert_eq!(conn.idle_timeout, Duration::from_millis(10_000));
    // Primary CID plus limit-1 issued ones.
    assert_eq!(conn.local_cids().count(), 3);

    let (datagram, _) = conn.poll_transmit().expect("post-handshake packet");
    // Short headers carry the client's CID, so parse with its length.
    let opened = open_server_packet(
        &datagram,
        &level_keys_from_secret(suite, &tx_secret),
        client_scid().len(),
    );
    assert_eq!(opened.ty, PacketType::Short);
    let frames = frames_of(&opened.payload);
    assert!(matches!(frames[0], Frame::HandshakeDone));
    let ncids: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::NewConnectionId(n) => Some(n),
            _ => None,
        })
        .collect();
    assert_eq!(ncids.len(), 2);
    assert_eq!(ncids[0].seq, 1);
    assert_eq!(ncids[1].seq, 2);
    for ncid in ncids {
        assert_eq!(ncid.cid.len(), 8);
    }
}

#[test]
fn test_one_rtt_ping_acked_after_confirmation() {
    let (mut conn, script) = server_conn();
    let suite = CipherSuite::Aes128GcmSha256;
    let tx_secret = vec![0x21u8; 32];
    let rx_secret = vec![0x22u8; 32];
    {
        let mut state = script.lock().unwrap();
        state.peer_params = Some(TransportParameters::default().encode().unwrap().to_vec());
        state.events.push_back(TlsEvent::WriteSecret(
            EncryptionLevel::OneRtt,
            suite.tls_id(),
            tx_secret.clone(),
        ));
        state.events.push_back(TlsEvent::ReadSecret(
            EncryptionLevel::OneRtt,
            suite.tls_id(),
            rx_secret.clone(),
        ));
        state.complete = true;
    }
    conn.drive(Instant::now());
    assert_eq!(conn.state(), ConnectionState::Confirmed);
    while conn.poll_transmit().is_some() {}

    // A 1-RTT PING from the client (its TX keys = our RX secret).
    let client_keys = level_keys_from_secret(suite, &rx_secret);
    let scid = conn.scid().clone();
    let ping = build_short_packet(&scid, 0, &[0x01], &client_keys);
    feed(&mut conn, &ping);
    conn.drive(Instant::now());

    let (datagram, _) = conn.poll_transmit().expect("1-RTT ACK packet");
    let opened = open_server_packet(
        &datagram,
        &level_keys_from_secret(suite, &tx_secret),
        client_scid().len(),
    );
    assert_eq!(opened.ty, PacketType::Short);
    let ack = frames_of(&opened.payload)
        .into_iter()
        .find_map(|f| match f {
            Frame::Ack(a) => Some(a),
            _ => None,
        })
        .expect("ACK frame");
    assert_eq!(ack.largest_ack, 0);
}

#[test]
fn test_forbidden_client_transport_parameter_closes() {
    let (mut conn, script) = server_conn();
    let suite = CipherSuite::Aes128GcmSha256;

    let bad_params = TransportParameters {
        stateless_reset_token: Some([0u8; 16]),
        ..Default::default()
    };
    {
        let mut state = script.lock().unwrap();
        state.peer_params = Some(bad_params.encode().unwrap().to_vec());
        state.events.push_back(TlsEvent::ReadSecret(
            EncryptionLevel::OneRtt,
            suite.tls_id(),
            vec![0x33u8; 32],
        ));
    }
    conn.drive(Instant::now());

    assert!(conn.is_draining());
    let (datagram, _) = conn.poll_transmit().expect("close packet");
    let opened = open_server_packet(&datagram, &client_initial_rx_keys(), 8);
    let close = frames_of(&opened.payload)
        .into_iter()
        .find_map(|f| match f {
            Frame::ConnectionClose(c) => Some(c),
            _ => None,
        })
        .expect("CONNECTION_CLOSE frame");
    assert_eq!(close.error_code, 0x08);
}

#[test]
fn test_tls_alert_maps_into_crypto_error_space() {
    let (mut conn, script) = server_conn();
    script
        .lock()
        .unwrap()
        .events
        .push_back(TlsEvent::Alert(EncryptionLevel::Initial, 0x28));
    conn.drive(Instant::now());

    assert!(conn.is_draining());
    let (datagram, _) = conn.poll_transmit().expect("close packet");
    let opened = open_server_packet(&datagram, &client_initial_rx_keys(), 8);
    let close = frames_of(&opened.payload)
        .into_iter()
        .find_map(|f| match f {
            Frame::ConnectionClose(c) => Some(c),
            _ => None,
        })
        .unwrap();
    assert_eq!(close.error_code, 0x100 + 0x28);
}

#[test]
fn test_draining_connection_discards_packets() {
    let (mut conn, script) = server_conn();
    script
        .lock()
        .unwrap()
        .events
        .push_back(TlsEvent::Alert(EncryptionLevel::Initial, 0x28));
    conn.drive(Instant::now());
    assert!(conn.is_draining());
    let received_before = script.lock().unwrap().received.len();

    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 5, &crypto_payload(0, b"x"), None),
    );
    conn.drive(Instant::now());
    assert_eq!(script.lock().unwrap().received.len(), received_before);
}

#[test]
fn test_rx_packet_budget_enforced() {
    let (mut conn, _script) = server_conn();
    // Park protected Handshake packets (no keys yet) past the budget.
    let keys = level_keys_from_secret(CipherSuite::Aes128GcmSha256, &[0x44u8; 32]);
    for pn in 0..70u64 {
        let datagram = build_long_packet(
            PacketType::Handshake,
            conn.scid(),
            &client_scid(),
            pn,
            &crypto_payload(0, b"pending"),
            None,
            &keys,
        );
        feed(&mut conn, &datagram);
    }
    assert_eq!(
        conn.level(EncryptionLevel::Handshake).rx_pending_hp.len(),
        crate::types::CONN_MAX_PACKET
    );
}

#[test]
fn test_idle_timeout_closes_silently() {
    let (mut conn, _script) = server_conn();
    let later = Instant::now() + Duration::from_secs(60);
    assert!(conn.idle_expired(later));
    conn.handle_timeout(later);
    assert!(conn.is_closed());
    assert!(conn.poll_transmit().is_none());
}

#[test]
fn test_in_flight_cap_stalls_send() {
    let (mut conn, script) = server_conn();
    // More handshake data than the in-flight budget allows.
    script
        .lock()
        .unwrap()
        .events
        .push_back(TlsEvent::HandshakeData(
            EncryptionLevel::Initial,
            vec![0x55u8; 6000],
        ));
    conn.drive(Instant::now());

    assert!(conn.crypto_in_flight <= crate::types::CRYPTO_IN_FLIGHT_MAX);
    assert_eq!(conn.in_flight_frame_bytes(), conn.crypto_in_flight);
    // Part of the stream is withheld until ACKs free the window.
    assert!(!conn.level(EncryptionLevel::Initial).tx_crypto.consumed());

    // Acknowledge everything sent so far; the remainder flows.
    while conn.poll_transmit().is_some() {}
    let sent = conn.space(SpaceId::Initial).tx_next_pn;
    assert!(sent > 0);
    let ack = ack_payload(sent - 1, sent - 1, &[]);
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &ack, Some(1200)),
    );
    conn.drive(Instant::now());
    assert!(conn.level(EncryptionLevel::Initial).tx_crypto.consumed());
}

#[test]
fn test_event_stream_and_pn_uniqueness_across_retransmit() {
    use crate::events::{ConnEvent, EventSink};
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<ConnEvent>>>);
    impl EventSink for RecordingSink {
        fn on_event(&mut self, event: &ConnEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    let (mut conn, script) = server_conn();
    let events = Arc::new(Mutex::new(Vec::new()));
    conn.set_event_sink(Box::new(RecordingSink(events.clone())));

    for chunk in 0u8..3 {
        script
            .lock()
            .unwrap()
            .events
            .push_back(TlsEvent::HandshakeData(
                EncryptionLevel::Initial,
                vec![chunk; 100],
            ));
        conn.drive(Instant::now());
        while conn.poll_transmit().is_some() {}
    }

    let ack = ack_payload(2, 0, &[(0, 0)]);
    feed(
        &mut conn,
        &client_initial_with_payload(&odcid(), &client_scid(), 0, &ack, Some(1200)),
    );
    conn.drive(Instant::now());

    let events = events.lock().unwrap();

    // The loss was reported before the re-cut.
    assert!(events.iter().any(|e| matches!(
        e,
        ConnEvent::CryptoRetransmitQueued { offset: 100, len: 100, .. }
    )));

    // Every sent Initial packet got a fresh, strictly increasing number,
    // the retransmission included.
    let sent_pns: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ConnEvent::PacketSent {
                level: EncryptionLevel::Initial,
                pn,
                ..
            } => Some(*pn),
            _ => None,
        })
        .collect();
    assert_eq!(sent_pns, vec![0, 1, 2, 3]);
}

#[test]
fn test_zero_rtt_packets_are_dropped() {
    let (mut conn, _script) = server_conn();
    let keys = level_keys_from_secret(CipherSuite::Aes128GcmSha256, &[0x66u8; 32]);
    let datagram = build_long_packet(
        PacketType::ZeroRtt,
        conn.scid(),
        &client_scid(),
        0,
        b"\x01",
        None,
        &keys,
    );
    feed(&mut conn, &datagram);
    conn.drive(Instant::now());
    assert_eq!(conn.level(EncryptionLevel::ZeroRtt).buffered_rx(), 0);
}
