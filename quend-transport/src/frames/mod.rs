//! QUIC frame types, parsing and serialization (RFC 9000 Section 12.4, 19).

pub mod parse;
pub mod types;

pub use parse::{
    parse_frame, put_ack_frame, put_connection_close, put_crypto_frame, put_handshake_done,
    put_new_connection_id, put_padding,
};
pub use types::{
    AckFrame, ConnectionCloseFrame, CryptoFrame, Frame, NewConnectionIdFrame, StreamFrame,
    WireAckRange,
};
