//! The fixed 16-byte packet header.
//!
//! Every UDP datagram on the overlay begins with the same header:
//!
//! ```text
//! offset  0        1        2..4      4..8                8..16
//!         ver|typ  subtype  reserved  remote_index (BE)   counter (BE)
//! ```
//!
//! The version and type share the first byte (version in the high nibble).
//! For `Message` and `Test` packets the counter is the AEAD message
//! counter and the whole header doubles as the AEAD associated data.
//! Handshake packets reuse the counter field for their stage, offset into
//! a separate numbering domain so that a handshake counter can never be
//! mistaken for a data counter.

use caret::caret_int;

use crate::err::ProtocolError;
use crate::wire::{Reader, Writer};

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 16;

/// The wire version this implementation speaks.
pub const WIRE_VERSION: u8 = 1;

/// Domain separator added to the header counter of handshake packets.
///
/// The value has the 33rd bit set, so handshake "counters" live wholly
/// outside the range a data-plane counter can reach before re-keying.
/// This constant is load-bearing for interoperability; see the
/// compatibility vector in the tests.
pub const HANDSHAKE_COUNTER_DOMAIN: u64 = 1 << 32;

caret_int! {
    /// Recognized values for the packet type nibble.
    pub struct PacketType(u8) {
        /// An encrypted data frame for the inside interface.
        MESSAGE = 0,
        /// Lighthouse query/response/update traffic.
        LIGHTHOUSE = 1,
        /// An encrypted liveness probe.
        TEST = 2,
        /// Authenticated notice that the sender tore down the tunnel.
        CLOSE_TUNNEL = 3,
        /// A handshake stage, numbered in the subtype.
        HANDSHAKE = 4,
        /// "I do not know your index" -- provokes a re-handshake.
        RECV_ERROR = 5,
        /// An opaque tunnel frame relayed on behalf of another node.
        RELAY = 6,
        /// Relay establishment control traffic.
        RELAY_CONTROL = 7,
    }
}

caret_int! {
    /// Subtype values for `TEST` packets.
    pub struct TestSubtype(u8) {
        /// Probe request; the peer should echo.
        REQUEST = 0,
        /// Probe reply.
        REPLY = 1,
    }
}

/// A parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct Header {
    /// Packet type.
    pub typ: PacketType,
    /// Type-specific subtype (handshake stage, test direction, ...).
    pub subtype: u8,
    /// The receiver's tunnel index, as assigned by the receiver.
    pub remote_index: u32,
    /// Message counter, or stage number in the handshake domain.
    pub counter: u64,
}

impl Header {
    /// Construct a header for an outgoing packet.
    pub fn new(typ: PacketType, subtype: u8, remote_index: u32, counter: u64) -> Self {
        Header {
            typ,
            subtype,
            remote_index,
            counter,
        }
    }

    /// Construct the header for a handshake stage.
    pub fn for_handshake_stage(stage: u8, remote_index: u32) -> Self {
        Header {
            typ: PacketType::HANDSHAKE,
            subtype: stage,
            remote_index,
            counter: HANDSHAKE_COUNTER_DOMAIN + u64::from(stage),
        }
    }

    /// Encode to the 16-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut v = Vec::with_capacity(HEADER_LEN);
        v.write_u8((WIRE_VERSION << 4) | (u8::from(self.typ) & 0x0F));
        v.write_u8(self.subtype);
        v.write_u16(0);
        v.write_u32(self.remote_index);
        v.write_u64(self.counter);
        let mut out = [0_u8; HEADER_LEN];
        out.copy_from_slice(&v);
        out
    }

    /// Decode the header at the front of `packet`.
    ///
    /// Does not touch the payload; the caller slices `packet[HEADER_LEN..]`
    /// itself, and keeps `packet[..HEADER_LEN]` around as AEAD associated
    /// data.
    pub fn decode(packet: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::from_slice(packet);
        let first = r.take_u8()?;
        let version = first >> 4;
        if version != WIRE_VERSION {
            return Err(ProtocolError::UnknownVersion(version));
        }
        let typ = PacketType::from(first & 0x0F);
        let subtype = r.take_u8()?;
        let _reserved = r.take_u16()?;
        let remote_index = r.take_u32()?;
        let counter = r.take_u64()?;
        Ok(Header {
            typ,
            subtype,
            remote_index,
            counter,
        })
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use hex_literal::hex;

    #[test]
    fn roundtrip() {
        let h = Header::new(PacketType::MESSAGE, 0, 0xDEAD_BEEF, 42);
        let bytes = h.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        let back = Header::decode(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn message_header_vector() {
        let h = Header::new(PacketType::MESSAGE, 0, 0x0102_0304, 7);
        assert_eq!(
            h.encode(),
            hex!("10 00 0000 01020304 0000000000000007")
        );
    }

    #[test]
    fn handshake_counter_compatibility_vector() {
        // Stage 1 carries 0x0000000100000001 in the counter field: the
        // handshake domain bit plus the stage.  Getting this wrong breaks
        // interop with every deployed node, so it is pinned bit-for-bit.
        let h = Header::for_handshake_stage(1, 0);
        assert_eq!(
            h.encode(),
            hex!("14 01 0000 00000000 0000000100000001")
        );
        let h2 = Header::for_handshake_stage(2, 0x0000_00AA);
        assert_eq!(
            h2.encode(),
            hex!("14 02 0000 000000aa 0000000100000002")
        );
    }

    #[test]
    fn rejects_other_versions() {
        let mut bytes = Header::new(PacketType::MESSAGE, 0, 1, 1).encode();
        bytes[0] = (2 << 4) | (bytes[0] & 0x0F);
        assert_eq!(
            Header::decode(&bytes),
            Err(ProtocolError::UnknownVersion(2))
        );
    }

    #[test]
    fn short_packet() {
        assert_eq!(
            Header::decode(&[0x10, 0x00]),
            Err(ProtocolError::ShortPacket)
        );
    }
}
