//! Packet headers, packet numbers and packet-number spaces
//! (RFC 9000 Section 12, 17).

pub mod header;
pub mod number;
pub mod ranges;
pub mod space;

pub use header::{Header, PacketType, FIXED_BIT, LONG_HEADER_BIT, PN_MAXLEN};
pub use number::{decode_packet_number, packet_number_len, parse_truncated_pn};
pub use ranges::{AckRange, AckRangeSet};
pub use space::{PktSpace, SpaceId};
