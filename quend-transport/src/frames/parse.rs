//! Frame parsing and serialization.
//!
//! Parsing runs over decrypted packet payloads; any malformed frame after a
//! successful AEAD open is a connection-fatal PROTOCOL_VIOLATION, so the
//! codec's short-buffer failures are promoted here.

use bytes::{BufMut, Bytes, BytesMut};
use tinyvec::TinyVec;

use crate::codec::{decode_varint, put_varint, varint_size};
use crate::error::{Error, Result, TransportError};
use crate::frames::types::*;
use crate::packet::ranges::AckRangeSet;
use crate::types::{ConnectionId, STATELESS_RESET_TOKEN_LEN};

fn take_varint(buf: &[u8], offset: &mut usize) -> Result<u64> {
    let (value, consumed) =
        decode_varint(&buf[*offset..]).map_err(|_| Error::Transport(TransportError::ProtocolViolation))?;
    *offset += consumed;
    Ok(value)
}

fn take_bytes(payload: &Bytes, offset: &mut usize, len: usize) -> Result<Bytes> {
    if payload.len() < *offset + len {
        return Err(Error::Transport(TransportError::ProtocolViolation));
    }
    let data = payload.slice(*offset..*offset + len);
    *offset += len;
    Ok(data)
}

/// Parse one frame starting at `start` within `payload`.
///
/// Returns the frame and the number of bytes consumed. Frame data aliases
/// `payload` without copying.
pub fn parse_frame(payload: &Bytes, start: usize) -> Result<(Frame, usize)> {
    let buf = &payload[..];
    let mut offset = start;
    let frame_type = take_varint(buf, &mut offset)?;

    let frame = match frame_type {
        FRAME_TYPE_PADDING => {
            // Coalesce the run of PADDING bytes.
            while offset < buf.len() && buf[offset] == 0x00 {
                offset += 1;
            }
            Frame::Padding { len: offset - start }
        }

        FRAME_TYPE_PING => Frame::Ping,

        FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
            let largest_ack = take_varint(buf, &mut offset)?;
            let ack_delay = take_varint(buf, &mut offset)?;
            let range_count = take_varint(buf, &mut offset)?;
            let first_ack_range = take_varint(buf, &mut offset)?;

            let mut ranges: TinyVec<[WireAckRange; 8]> = TinyVec::default();
            for _ in 0..range_count {
                let gap = take_varint(buf, &mut offset)?;
                let length = take_varint(buf, &mut offset)?;
                ranges.push(WireAckRange { gap, length });
            }

            if frame_type == FRAME_TYPE_ACK_ECN {
                // ECN counts are parsed and discarded.
                for _ in 0..3 {
                    take_varint(buf, &mut offset)?;
                }
            }

            Frame::Ack(AckFrame {
                largest_ack,
                ack_delay,
                first_ack_range,
                ranges,
            })
        }

        FRAME_TYPE_CRYPTO => {
            let crypto_offset = take_varint(buf, &mut offset)?;
            let len = take_varint(buf, &mut offset)? as usize;
            let data = take_bytes(payload, &mut offset, len)?;
            Frame::Crypto(CryptoFrame {
                offset: crypto_offset,
                data,
            })
        }

        FRAME_TYPE_STREAM_BASE..=0x0f => {
            let stream_id = take_varint(buf, &mut offset)?;
            let data_offset = if frame_type & STREAM_BIT_OFF != 0 {
                take_varint(buf, &mut offset)?
            } else {
                0
            };
            let len = if frame_type & STREAM_BIT_LEN != 0 {
                take_varint(buf, &mut offset)? as usize
            } else {
                buf.len() - offset
            };
            let data = take_bytes(payload, &mut offset, len)?;
            Frame::Stream(StreamFrame {
                stream_id,
                offset: data_offset,
                fin: frame_type & STREAM_BIT_FIN != 0,
                data,
            })
        }

        FRAME_TYPE_NEW_CONNECTION_ID => {
            let seq = take_varint(buf, &mut offset)?;
            let retire_prior_to = take_varint(buf, &mut offset)?;
            if offset >= buf.len() {
                return Err(Error::Transport(TransportError::ProtocolViolation));
            }
            let cid_len = buf[offset] as usize;
            offset += 1;
            if cid_len == 0 || cid_len > crate::types::MAX_CID_LENGTH {
                return Err(Error::Transport(TransportError::ProtocolViolation));
            }
            let cid_bytes = take_bytes(payload, &mut offset, cid_len)?;
            let cid = ConnectionId::new(cid_bytes).expect("length checked");
            let token_bytes = take_bytes(payload, &mut offset, STATELESS_RESET_TOKEN_LEN)?;
            let mut reset_token = [0u8; STATELESS_RESET_TOKEN_LEN];
            reset_token.copy_from_slice(&token_bytes);
            Frame::NewConnectionId(NewConnectionIdFrame {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            })
        }

        FRAME_TYPE_CONNECTION_CLOSE => {
            let error_code = take_varint(buf, &mut offset)?;
            let trigger_frame_type = take_varint(buf, &mut offset)?;
            let reason_len = take_varint(buf, &mut offset)? as usize;
            let reason = take_bytes(payload, &mut offset, reason_len)?;
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type: trigger_frame_type,
                reason,
            })
        }

        FRAME_TYPE_CONNECTION_CLOSE_APP => {
            let error_code = take_varint(buf, &mut offset)?;
            let reason_len = take_varint(buf, &mut offset)? as usize;
            let reason = take_bytes(payload, &mut offset, reason_len)?;
            Frame::ApplicationClose { error_code, reason }
        }

        FRAME_TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,

        _ => return Err(Error::Transport(TransportError::ProtocolViolation)),
    };

    Ok((frame, offset - start))
}

// ---- Serialization ----

/// Encode an ACK frame from the received-packet ranges. `ranges` must be
/// non-empty; the newest range supplies `largest_ack` and the first range,
/// the rest become `(gap, range)` pairs.
pub fn put_ack_frame(buf: &mut BytesMut, ranges: &AckRangeSet, ack_delay: u64) {
    debug_assert!(!ranges.is_empty());
    let mut iter = ranges.iter();
    let newest = iter.next().expect("non-empty range set");

    put_varint(buf, FRAME_TYPE_ACK);
    put_varint(buf, newest.last);
    put_varint(buf, ack_delay);
    put_varint(buf, ranges.len() as u64 - 1);
    put_varint(buf, newest.last - newest.first);

    let mut smallest = newest.first;
    for range in iter {
        // Inverse of the parser: next_largest = smallest - gap - 2.
        put_varint(buf, smallest - range.last - 2);
        put_varint(buf, range.last - range.first);
        smallest = range.first;
    }
}

/// Wire size of the ACK frame [`put_ack_frame`] would emit.
pub fn ack_frame_size(ranges: &AckRangeSet, ack_delay: u64) -> usize {
    let mut iter = ranges.iter();
    let newest = match iter.next() {
        Some(r) => r,
        None => return 0,
    };
    let mut size = varint_size(FRAME_TYPE_ACK)
        + varint_size(newest.last)
        + varint_size(ack_delay)
        + varint_size(ranges.len() as u64 - 1)
        + varint_size(newest.last - newest.first);
    let mut smallest = newest.first;
    for range in iter {
        size += varint_size(smallest - range.last - 2) + varint_size(range.last - range.first);
        smallest = range.first;
    }
    size
}

/// Encode a CRYPTO frame header plus payload.
pub fn put_crypto_frame(buf: &mut BytesMut, offset: u64, data: &[u8]) {
    put_varint(buf, FRAME_TYPE_CRYPTO);
    put_varint(buf, offset);
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Append `len` PADDING bytes.
pub fn put_padding(buf: &mut BytesMut, len: usize) {
    buf.put_bytes(0x00, len);
}

/// Encode a HANDSHAKE_DONE frame.
pub fn put_handshake_done(buf: &mut BytesMut) {
    put_varint(buf, FRAME_TYPE_HANDSHAKE_DONE);
}

/// Encode a NEW_CONNECTION_ID frame.
pub fn put_new_connection_id(buf: &mut BytesMut, frame: &NewConnectionIdFrame) {
    put_varint(buf, FRAME_TYPE_NEW_CONNECTION_ID);
    put_varint(buf, frame.seq);
    put_varint(buf, frame.retire_prior_to);
    buf.put_u8(frame.cid.len() as u8);
    buf.put_slice(frame.cid.as_bytes());
    buf.put_slice(&frame.reset_token);
}

/// Encode a transport CONNECTION_CLOSE frame (type 0x1c).
pub fn put_connection_close(buf: &mut BytesMut, error_code: u64, frame_type: u64, reason: &[u8]) {
    put_varint(buf, FRAME_TYPE_CONNECTION_CLOSE);
    put_varint(buf, error_code);
    put_varint(buf, frame_type);
    put_varint(buf, reason.len() as u64);
    buf.put_slice(reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(payload: Bytes) -> Vec<Frame> {
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
    fn test_parse_padding_run() {
        let payload = Bytes::from_static(&[0, 0, 0, 0, 0x01]);
        let frames = parse_all(payload);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Padding { len: 4 }));
        assert!(matches!(frames[1], Frame::Ping));
    }

    #[test]
    fn test_parse_crypto_frame() {
        let mut buf = BytesMut::new();
        put_crypto_frame(&mut buf, 200, b"client hello bytes");
        let payload = buf.freeze();
        let (frame, consumed) = parse_frame(&payload, 0).unwrap();
        assert_eq!(consumed, payload.len());
        match frame {
            Frame::Crypto(c) => {
                assert_eq!(c.offset, 200);
                assert_eq!(&c.data[..], b"client hello bytes");
            }
            other => panic!("expected CRYPTO, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_crypto_truncated_data() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, FRAME_TYPE_CRYPTO);
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 50); // claims 50 bytes, none present
        let err = parse_frame(&buf.freeze(), 0).unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ProtocolViolation));
    }

    #[test]
    fn test_parse_unknown_frame_type() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 0x42);
        let err = parse_frame(&buf.freeze(), 0).unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ProtocolViolation));
    }

    #[test]
    fn test_ack_frame_roundtrip_single_range() {
        let mut ranges = AckRangeSet::new();
        ranges.insert(3);
        ranges.insert(4);
        ranges.insert(5);

        let mut buf = BytesMut::new();
        put_ack_frame(&mut buf, &ranges, 0);
        assert_eq!(buf.len(), ack_frame_size(&ranges, 0));

        let (frame, _) = parse_frame(&buf.freeze(), 0).unwrap();
        match frame {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest_ack, 5);
                assert_eq!(ack.first_ack_range, 2);
                assert!(ack.ranges.is_empty());
            }
            other => panic!("expected ACK, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_frame_roundtrip_with_gaps() {
        // Received 0, 2 and 7..=9: three wire ranges.
        let mut ranges = AckRangeSet::new();
        for pn in [0u64, 2, 7, 8, 9] {
            ranges.insert(pn);
        }

        let mut buf = BytesMut::new();
        put_ack_frame(&mut buf, &ranges, 0);
        assert_eq!(buf.len(), ack_frame_size(&ranges, 0));

        let (frame, _) = parse_frame(&buf.freeze(), 0).unwrap();
        let ack = match frame {
            Frame::Ack(ack) => ack,
            other => panic!("expected ACK, got {:?}", other),
        };
        assert_eq!(ack.largest_ack, 9);
        assert_eq!(ack.first_ack_range, 2);
        assert_eq!(ack.ranges.len(), 2);
        // smallest=7: gap to 2 is 7-2-2=3, range len 0.
        assert_eq!(ack.ranges[0], WireAckRange { gap: 3, length: 0 });
        // smallest=2: gap to 0 is 2-0-2=0, range len 0.
        assert_eq!(ack.ranges[1], WireAckRange { gap: 0, length: 0 });
    }

    #[test]
    fn test_parse_stream_frame_with_offset_and_len() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, FRAME_TYPE_STREAM_BASE | STREAM_BIT_OFF | STREAM_BIT_LEN | STREAM_BIT_FIN);
        put_varint(&mut buf, 4); // stream id
        put_varint(&mut buf, 100); // offset
        put_varint(&mut buf, 3); // len
        buf.put_slice(b"abc");
        let (frame, consumed) = parse_frame(&buf.freeze(), 0).unwrap();
        match frame {
            Frame::Stream(s) => {
                assert_eq!(s.stream_id, 4);
                assert_eq!(s.offset, 100);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"abc");
            }
            other => panic!("expected STREAM, got {:?}", other),
        }
        // type + id + 2-byte offset varint + len + 3 data bytes
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_stream_frame_without_len_takes_rest() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, FRAME_TYPE_STREAM_BASE);
        put_varint(&mut buf, 0);
        buf.put_slice(b"tail data");
        let (frame, consumed) = parse_frame(&buf.freeze(), 0).unwrap();
        match frame {
            Frame::Stream(s) => assert_eq!(&s.data[..], b"tail data"),
            other => panic!("expected STREAM, got {:?}", other),
        }
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_new_connection_id_roundtrip() {
        let frame = NewConnectionIdFrame {
            seq: 1,
            retire_prior_to: 0,
            cid: ConnectionId::from_slice(&[9u8; 8]).unwrap(),
            reset_token: [0xabu8; 16],
        };
        let mut buf = BytesMut::new();
        put_new_connection_id(&mut buf, &frame);
        let (parsed, consumed) = parse_frame(&buf.freeze(), 0).unwrap();
        match parsed {
            Frame::NewConnectionId(f) => {
                assert_eq!(f.seq, 1);
                assert_eq!(f.retire_prior_to, 0);
                assert_eq!(f.cid, frame.cid);
                assert_eq!(f.reset_token, frame.reset_token);
            }
            other => panic!("expected NEW_CONNECTION_ID, got {:?}", other),
        }
        assert_eq!(consumed, 1 + 1 + 1 + 1 + 8 + 16);
    }

    #[test]
    fn test_connection_close_roundtrip() {
        let mut buf = BytesMut::new();
        put_connection_close(&mut buf, 0x0a, 0x06, b"bad crypto offset");
        let (frame, _) = parse_frame(&buf.freeze(), 0).unwrap();
        match frame {
            Frame::ConnectionClose(c) => {
                assert_eq!(c.error_code, 0x0a);
                assert_eq!(c.frame_type, 0x06);
                assert_eq!(&c.reason[..], b"bad crypto offset");
            }
            other => panic!("expected CONNECTION_CLOSE, got {:?}", other),
        }
    }

    #[test]
    fn test_handshake_done_roundtrip() {
        let mut buf = BytesMut::new();
        put_handshake_done(&mut buf);
        let (frame, consumed) = parse_frame(&buf.freeze(), 0).unwrap();
        assert!(matches!(frame, Frame::HandshakeDone));
        assert_eq!(consumed, 1);
    }
}
