//! Control messages for relay establishment.
//!
//! A node that cannot reach a peer directly asks a mutually-reachable
//! relay to carry its tunnel frames.  Establishment is a request/response
//! exchange carried inside the existing requester-to-relay tunnel (type
//! `RELAY_CONTROL`); the relayed frames themselves travel as `RELAY`
//! packets whose payload is the inner encrypted frame, verbatim.

use std::net::Ipv4Addr;

use prost::Message;

use crate::err::ProtocolError;

/// What a relay control message is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
#[allow(clippy::exhaustive_enums)]
pub enum RelayControlKind {
    /// "Please relay between me and the target."
    Request = 0,
    /// "Agreed; here is my index for it."
    Response = 1,
}

/// A relay establishment message.
#[derive(Clone, PartialEq, Message)]
#[allow(clippy::exhaustive_structs)]
pub struct RelayControl {
    /// Request or response.
    #[prost(enumeration = "RelayControlKind", tag = "1")]
    pub kind: i32,
    /// The requester's relay index (assigned by the node that wants the
    /// relay).
    #[prost(uint32, tag = "2")]
    pub initiator_relay_index: u32,
    /// The relay's index for this pairing; zero until the response.
    #[prost(uint32, tag = "3")]
    pub responder_relay_index: u32,
    /// Overlay address of the node requesting relaying.
    #[prost(uint32, tag = "4")]
    pub initiator_addr: u32,
    /// Overlay address of the far end the frames are destined for.
    #[prost(uint32, tag = "5")]
    pub target_addr: u32,
}

impl RelayControl {
    /// Build a request from `initiator` to reach `target`.
    pub fn request(initiator_relay_index: u32, initiator: Ipv4Addr, target: Ipv4Addr) -> Self {
        RelayControl {
            kind: RelayControlKind::Request as i32,
            initiator_relay_index,
            responder_relay_index: 0,
            initiator_addr: u32::from(initiator),
            target_addr: u32::from(target),
        }
    }

    /// Build the affirmative response to `request`.
    pub fn response(request: &RelayControl, responder_relay_index: u32) -> Self {
        RelayControl {
            kind: RelayControlKind::Response as i32,
            initiator_relay_index: request.initiator_relay_index,
            responder_relay_index,
            initiator_addr: request.initiator_addr,
            target_addr: request.target_addr,
        }
    }

    /// The message kind, if recognized.
    pub fn control_kind(&self) -> Result<RelayControlKind, ProtocolError> {
        RelayControlKind::try_from(self.kind)
            .map_err(|_| ProtocolError::UnknownType(self.kind as u8))
    }

    /// The target overlay address.
    pub fn target(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.target_addr)
    }

    /// The initiator overlay address.
    pub fn initiator(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.initiator_addr)
    }

    /// Decode from a decrypted `RELAY_CONTROL` payload.
    pub fn decode_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        RelayControl::decode(bytes).map_err(|_| ProtocolError::ShortPacket)
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

    #[test]
    fn request_response_roundtrip() {
        let req = RelayControl::request(42, "10.0.0.1".parse().unwrap(), "10.0.0.3".parse().unwrap());
        let bytes = req.encode_to_vec();
        let back = RelayControl::decode_payload(&bytes).unwrap();
        assert_eq!(back.control_kind().unwrap(), RelayControlKind::Request);
        assert_eq!(back.initiator(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(back.target(), "10.0.0.3".parse::<Ipv4Addr>().unwrap());

        let resp = RelayControl::response(&back, 77);
        assert_eq!(resp.control_kind().unwrap(), RelayControlKind::Response);
        assert_eq!(resp.initiator_relay_index, 42);
        assert_eq!(resp.responder_relay_index, 77);
        assert_eq!(resp.target_addr, back.target_addr);
    }
}
