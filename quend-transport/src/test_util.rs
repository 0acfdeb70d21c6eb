//! Shared test support: a scripted TLS engine and client-side packet
//! construction mirroring what a real QUIC client would put on the wire.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};

use crate::codec::put_varint;
use crate::connection::Connection;
use crate::crypto::key_schedule::{derive_initial_keys, derive_level_keys, LevelKeys};
use crate::crypto::suite::CipherSuite;
use crate::error::Result;
use crate::frames::put_crypto_frame;
use crate::packet::header::{
    put_long_header, Header, PacketType, LONG_HEADER_BIT, PNL_BITMASK,
};
use crate::packet::number::{decode_packet_number, parse_truncated_pn, put_truncated_pn};
use crate::tls::{EncryptionLevel, HandshakeStatus, TlsEngine, TlsEvent};
use crate::transport::parameters::TransportParameters;
use crate::types::{ConnectionId, Side, TAG_LEN};

/// Shared state of a [`ScriptedTlsEngine`]; tests hold the other handle.
#[derive(Default)]
pub struct ScriptState {
    /// Events the engine will surface, in order.
    pub events: VecDeque<TlsEvent>,
    /// CRYPTO data delivered to the engine, in delivery order.
    pub received: Vec<(EncryptionLevel, Vec<u8>)>,
    /// When set, `drive_handshake` reports completion.
    pub complete: bool,
    /// Blob returned as the peer's transport parameters.
    pub peer_params: Option<Vec<u8>>,
    /// Blob the connection installed as its local parameters.
    pub local_params: Vec<u8>,
}

/// TLS engine driven entirely by a test script.
pub struct ScriptedTlsEngine {
    shared: Arc<Mutex<ScriptState>>,
}

/// Build a scripted engine plus the test-side handle to its state.
pub fn scripted_engine() -> (Box<dyn TlsEngine>, Arc<Mutex<ScriptState>>) {
    let shared = Arc::new(Mutex::new(ScriptState::default()));
    (
        Box::new(ScriptedTlsEngine {
            shared: shared.clone(),
        }),
        shared,
    )
}

impl TlsEngine for ScriptedTlsEngine {
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()> {
        self.shared.lock().unwrap().local_params = params.to_vec();
        Ok(())
    }

    fn peer_transport_params(&self) -> Option<Vec<u8>> {
        self.shared.lock().unwrap().peer_params.clone()
    }

    fn provide_data(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<()> {
        self.shared
            .lock()
            .unwrap()
            .received
            .push((level, data.to_vec()));
        Ok(())
    }

    fn drive_handshake(&mut self) -> Result<HandshakeStatus> {
        if self.shared.lock().unwrap().complete {
            Ok(HandshakeStatus::Complete)
        } else {
            Ok(HandshakeStatus::InProgress)
        }
    }

    fn process_post_handshake(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_event(&mut self) -> Option<TlsEvent> {
        self.shared.lock().unwrap().events.pop_front()
    }
}

pub fn peer_addr() -> SocketAddr {
    "192.0.2.7:4433".parse().unwrap()
}

pub fn odcid() -> ConnectionId {
    ConnectionId::from_slice(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]).unwrap()
}

pub fn client_scid() -> ConnectionId {
    ConnectionId::from_slice(&[0xc1, 0x1e, 0x47]).unwrap()
}

/// A server connection wired to a scripted engine, plus the script handle.
pub fn server_conn() -> (Connection, Arc<Mutex<ScriptState>>) {
    let (engine, script) = scripted_engine();
    let conn = Connection::new_server(
        crate::types::Version::V1,
        odcid(),
        client_scid(),
        peer_addr(),
        8,
        TransportParameters::default(),
        engine,
        Duration::from_secs(30),
        Instant::now(),
    )
    .unwrap();
    (conn, script)
}

fn seal_and_protect_test(buf: &mut BytesMut, pn_off: usize, pn_len: usize, pn: u64, keys: &LevelKeys) {
    let payload_off = pn_off + pn_len;
    let nonce = keys.nonce(pn);
    let total_len = buf.len();
    let (head, payload) = buf.split_at_mut(payload_off);
    keys.aead
        .seal_in_place(&nonce, head, payload, total_len - payload_off - TAG_LEN)
        .unwrap();

    let mask = {
        let sample = &buf[pn_off + 4..pn_off + 20];
        keys.hp.mask(sample).unwrap()
    };
    let first_mask = if buf[0] & LONG_HEADER_BIT != 0 { 0x0f } else { 0x1f };
    buf[0] ^= mask[0] & first_mask;
    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[1 + i];
    }
}

/// Build a protected client Initial datagram carrying the given frames
/// (already-encoded payload plaintext), padded with PADDING to
/// `datagram_len` when requested.
pub fn client_initial_with_payload(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    pn: u64,
    payload: &[u8],
    datagram_len: Option<usize>,
) -> Vec<u8> {
    // The Initial keys derive from the client's first DCID, whichever
    // packet we are building.
    let (_, client_tx) = derive_initial_keys(odcid().as_bytes(), Side::Client).unwrap();
    build_long_packet(PacketType::Initial, dcid, scid, pn, payload, datagram_len, &client_tx)
}

/// Build a protected long-header packet with explicit keys.
pub fn build_long_packet(
    ty: PacketType,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    pn: u64,
    payload: &[u8],
    datagram_len: Option<usize>,
    keys: &LevelKeys,
) -> Vec<u8> {
    let pn_len = 4usize;
    let mut buf = BytesMut::new();
    put_long_header(&mut buf, ty, crate::types::Version::V1, dcid, scid, pn_len);

    let header_len = buf.len() + 2; // through the length field
    let mut padding = 0;
    if let Some(target) = datagram_len {
        let unpadded = header_len + pn_len + payload.len() + TAG_LEN;
        padding = target.saturating_sub(unpadded);
    }

    let length_value = pn_len + payload.len() + padding + TAG_LEN;
    buf.put_u16(0x4000 | length_value as u16);
    let pn_off = buf.len();
    put_truncated_pn(&mut buf, pn, pn_len);
    buf.put_slice(payload);
    buf.put_bytes(0x00, padding);
    buf.resize(buf.len() + TAG_LEN, 0);

    seal_and_protect_test(&mut buf, pn_off, pn_len, pn, keys);
    buf.to_vec()
}

/// Build a protected 1-RTT short-header packet with explicit keys,
/// padding tiny payloads so the header-protection sample exists.
pub fn build_short_packet(
    dcid: &ConnectionId,
    pn: u64,
    payload: &[u8],
    keys: &LevelKeys,
) -> Vec<u8> {
    let pn_len = 4usize;
    let mut buf = BytesMut::new();
    buf.put_u8(0x40 | (pn_len as u8 - 1));
    buf.put_slice(dcid.as_bytes());
    let pn_off = buf.len();
    put_truncated_pn(&mut buf, pn, pn_len);
    buf.put_slice(payload);
    let wire_len = buf.len() - pn_off + TAG_LEN;
    if wire_len < 20 {
        buf.put_bytes(0x00, 20 - wire_len);
    }
    buf.resize(buf.len() + TAG_LEN, 0);

    seal_and_protect_test(&mut buf, pn_off, pn_len, pn, keys);
    buf.to_vec()
}

/// Encode a CRYPTO frame payload.
pub fn crypto_payload(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_crypto_frame(&mut buf, offset, data);
    buf.to_vec()
}

/// Encode an ACK frame payload from raw wire fields.
pub fn ack_payload(largest: u64, first_range: u64, ranges: &[(u64, u64)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_varint(&mut buf, 0x02);
    put_varint(&mut buf, largest);
    put_varint(&mut buf, 0); // ack delay
    put_varint(&mut buf, ranges.len() as u64);
    put_varint(&mut buf, first_range);
    for &(gap, length) in ranges {
        put_varint(&mut buf, gap);
        put_varint(&mut buf, length);
    }
    buf.to_vec()
}

/// A server packet opened from the client's perspective.
pub struct OpenedPacket {
    pub ty: PacketType,
    pub pn: u64,
    pub payload: Vec<u8>,
    pub total_len: usize,
}

/// Remove header protection and decrypt one server packet at the start of
/// `datagram` using the client-side RX keys for its level.
pub fn open_server_packet(
    datagram: &[u8],
    keys: &LevelKeys,
    server_cid_len: usize,
) -> OpenedPacket {
    let header = Header::parse(datagram, server_cid_len).unwrap();
    let total_len = header.packet_len(datagram.len());
    let mut buf = BytesMut::from(&datagram[..total_len]);

    let pn_off = header.pn_offset;
    let mask = {
        let sample = &buf[pn_off + 4..pn_off + 20];
        keys.hp.mask(sample).unwrap()
    };
    let first_mask = if buf[0] & LONG_HEADER_BIT != 0 { 0x0f } else { 0x1f };
    buf[0] ^= mask[0] & first_mask;
    let pn_len = (buf[0] & PNL_BITMASK) as usize + 1;
    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[1 + i];
    }
    let truncated = parse_truncated_pn(&buf[pn_off..], pn_len).unwrap();
    let pn = decode_packet_number(None, truncated, pn_len as u32 * 8);

    let aad_len = pn_off + pn_len;
    let nonce = keys.nonce(pn);
    let (aad, payload) = buf.split_at_mut(aad_len);
    let plaintext_len = keys
        .aead
        .open_in_place(&nonce, aad, payload, total_len - aad_len)
        .expect("server packet must authenticate");

    OpenedPacket {
        ty: header.ty,
        pn,
        payload: payload[..plaintext_len].to_vec(),
        total_len,
    }
}

/// Client-side RX keys for the server's Initial packets.
pub fn client_initial_rx_keys() -> LevelKeys {
    let (rx, _) = derive_initial_keys(odcid().as_bytes(), Side::Client).unwrap();
    rx
}

/// Client-side TX keys for Initial packets.
pub fn client_initial_tx_keys() -> LevelKeys {
    let (_, tx) = derive_initial_keys(odcid().as_bytes(), Side::Client).unwrap();
    tx
}

/// Derive matching key pairs for a non-Initial level from a fixed secret,
/// as both sides of a scripted handshake would.
pub fn level_keys_from_secret(suite: CipherSuite, secret: &[u8]) -> LevelKeys {
    derive_level_keys(suite, secret).unwrap()
}
