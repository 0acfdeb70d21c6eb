//! Transport parameter encoding, decoding and validation
//! (RFC 9000 Section 18).
//!
//! Parameters ride the TLS `quic_transport_parameters` extension as a
//! sequence of `(id, length, value)` triples. Varint-valued parameters equal
//! to their defaults are elided from the encoding; the resulting blob stays
//! within [`MAX_ENCLEN`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{decode_varint, put_varint};
use crate::error::{Error, Result, TransportError};
use crate::types::{ConnectionId, Side, STATELESS_RESET_TOKEN_LEN};

/// Maximum length of an encoded transport-parameters blob.
pub const MAX_ENCLEN: usize = 128;

const TP_ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
const TP_MAX_IDLE_TIMEOUT: u64 = 0x01;
const TP_STATELESS_RESET_TOKEN: u64 = 0x02;
const TP_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const TP_INITIAL_MAX_DATA: u64 = 0x04;
const TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const TP_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const TP_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const TP_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const TP_ACK_DELAY_EXPONENT: u64 = 0x0a;
const TP_MAX_ACK_DELAY: u64 = 0x0b;
const TP_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const TP_PREFERRED_ADDRESS: u64 = 0x0d;
const TP_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const TP_INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;

/// Negotiated transport parameters for one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParameters {
    /// Server-only echo of the client's first DCID.
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds; 0 disables the peer-advertised idle timeout.
    pub max_idle_timeout: u64,
    /// Server-only.
    pub stateless_reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// At most 20.
    pub ack_delay_exponent: u64,
    /// Milliseconds, below 2^14.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    /// Server-only; carried opaquely, this core never emits one.
    pub preferred_address: Option<Bytes>,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
        }
    }
}

fn put_param(buf: &mut BytesMut, id: u64, value: &[u8]) {
    put_varint(buf, id);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

fn put_varint_param(buf: &mut BytesMut, id: u64, value: u64) {
    // Defaults are elided.
    match id {
        TP_MAX_IDLE_TIMEOUT if value == 0 => return,
        TP_MAX_UDP_PAYLOAD_SIZE if value == 65527 => return,
        TP_INITIAL_MAX_DATA..=TP_INITIAL_MAX_STREAMS_UNI if value == 0 => return,
        TP_ACK_DELAY_EXPONENT if value == 3 => return,
        TP_MAX_ACK_DELAY if value == 25 => return,
        TP_ACTIVE_CONNECTION_ID_LIMIT if value == 2 => return,
        _ => {}
    }
    let mut tmp = BytesMut::with_capacity(8);
    put_varint(&mut tmp, value);
    put_param(buf, id, &tmp);
}

fn parse_varint_value(value: &[u8]) -> Result<u64> {
    let (v, consumed) =
        decode_varint(value).map_err(|_| Error::Transport(TransportError::TransportParameterError))?;
    if consumed != value.len() {
        return Err(Error::Transport(TransportError::TransportParameterError));
    }
    Ok(v)
}

impl TransportParameters {
    /// Encode into the extension blob. Fails if the result would exceed
    /// [`MAX_ENCLEN`].
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(MAX_ENCLEN);

        if let Some(cid) = &self.original_destination_connection_id {
            put_param(&mut buf, TP_ORIGINAL_DESTINATION_CONNECTION_ID, cid.as_bytes());
        }
        put_varint_param(&mut buf, TP_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        if let Some(token) = &self.stateless_reset_token {
            put_param(&mut buf, TP_STATELESS_RESET_TOKEN, token);
        }
        put_varint_param(&mut buf, TP_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        put_varint_param(&mut buf, TP_INITIAL_MAX_DATA, self.initial_max_data);
        put_varint_param(
            &mut buf,
            TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_varint_param(
            &mut buf,
            TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_varint_param(&mut buf, TP_INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni);
        put_varint_param(&mut buf, TP_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_varint_param(&mut buf, TP_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_varint_param(&mut buf, TP_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_varint_param(&mut buf, TP_MAX_ACK_DELAY, self.max_ack_delay);
        if self.disable_active_migration {
            put_param(&mut buf, TP_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        put_varint_param(&mut buf, TP_ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit);
        if let Some(cid) = &self.initial_source_connection_id {
            put_param(&mut buf, TP_INITIAL_SOURCE_CONNECTION_ID, cid.as_bytes());
        }

        if buf.len() > MAX_ENCLEN {
            return Err(Error::Transport(TransportError::InternalError));
        }
        Ok(buf.freeze())
    }

    /// Decode a peer blob. `from` is the side that sent the parameters;
    /// server-only parameters received from a client terminate the
    /// connection with TRANSPORT_PARAMETER_ERROR.
    pub fn decode(blob: &[u8], from: Side) -> Result<Self> {
        let mut params = Self::default();
        let mut offset = 0;

        while offset < blob.len() {
            let (id, consumed) = decode_varint(&blob[offset..])
                .map_err(|_| Error::Transport(TransportError::TransportParameterError))?;
            offset += consumed;
            let (len, consumed) = decode_varint(&blob[offset..])
                .map_err(|_| Error::Transport(TransportError::TransportParameterError))?;
            offset += consumed;

            let len = len as usize;
            if blob.len() < offset + len {
                return Err(Error::Transport(TransportError::TransportParameterError));
            }
            let value = &blob[offset..offset + len];
            offset += len;

            if from == Side::Client
                && matches!(
                    id,
                    TP_ORIGINAL_DESTINATION_CONNECTION_ID
                        | TP_STATELESS_RESET_TOKEN
                        | TP_PREFERRED_ADDRESS
                )
            {
                return Err(Error::Transport(TransportError::TransportParameterError));
            }

            match id {
                TP_ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(
                        ConnectionId::from_slice(value)
                            .ok_or(Error::Transport(TransportError::TransportParameterError))?,
                    );
                }
                TP_MAX_IDLE_TIMEOUT => params.max_idle_timeout = parse_varint_value(value)?,
                TP_STATELESS_RESET_TOKEN => {
                    if value.len() != STATELESS_RESET_TOKEN_LEN {
                        return Err(Error::Transport(TransportError::TransportParameterError));
                    }
                    let mut token = [0u8; STATELESS_RESET_TOKEN_LEN];
                    token.copy_from_slice(value);
                    params.stateless_reset_token = Some(token);
                }
                TP_MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = parse_varint_value(value)?,
                TP_INITIAL_MAX_DATA => params.initial_max_data = parse_varint_value(value)?,
                TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = parse_varint_value(value)?
                }
                TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = parse_varint_value(value)?
                }
                TP_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = parse_varint_value(value)?
                }
                TP_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = parse_varint_value(value)?
                }
                TP_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = parse_varint_value(value)?
                }
                TP_ACK_DELAY_EXPONENT => params.ack_delay_exponent = parse_varint_value(value)?,
                TP_MAX_ACK_DELAY => params.max_ack_delay = parse_varint_value(value)?,
                TP_DISABLE_ACTIVE_MIGRATION => params.disable_active_migration = true,
                TP_PREFERRED_ADDRESS => {
                    params.preferred_address = Some(Bytes::copy_from_slice(value))
                }
                TP_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = parse_varint_value(value)?
                }
                TP_INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(
                        ConnectionId::from_slice(value)
                            .ok_or(Error::Transport(TransportError::TransportParameterError))?,
                    );
                }
                _ => {
                    // Unknown parameters are ignored.
                }
            }
        }

        params.validate()?;
        Ok(params)
    }

    /// Validate value bounds per RFC 9000 Section 18.2.
    pub fn validate(&self) -> Result<()> {
        if self.ack_delay_exponent > 20 {
            return Err(Error::Transport(TransportError::TransportParameterError));
        }
        if self.max_ack_delay >= 1 << 14 {
            return Err(Error::Transport(TransportError::TransportParameterError));
        }
        if self.active_connection_id_limit < 2 {
            return Err(Error::Transport(TransportError::TransportParameterError));
        }
        if self.max_udp_payload_size < 1200 {
            return Err(Error::Transport(TransportError::TransportParameterError));
        }
        Ok(())
    }
}
