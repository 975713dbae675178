//! Parsing cleartext IPv4 frames to the 5-tuple the filter operates on.

use std::net::Ipv4Addr;

use crate::err::ParseError;

/// TCP FIN flag bit.
pub const TCP_FIN: u8 = 0x01;
/// TCP RST flag bit.
pub const TCP_RST: u8 = 0x04;

/// IP protocol of a packet, as the filter distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
    /// Anything else, by protocol number.
    Other(u8),
}

impl Protocol {
    /// Map an IP protocol number.
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }
}

/// A parsed packet, oriented around this node: `local` is our side,
/// `remote` is the peer's, whichever direction the packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct PacketMeta {
    /// IP protocol.
    pub proto: Protocol,
    /// This node's address in the flow.
    pub local_ip: Ipv4Addr,
    /// The peer's address in the flow.
    pub remote_ip: Ipv4Addr,
    /// This node's port; zero for portless protocols and fragments.
    pub local_port: u16,
    /// The peer's port; zero for portless protocols and fragments.
    pub remote_port: u16,
    /// True for a non-first IP fragment, whose ports are unknowable.
    pub fragment: bool,
    /// TCP flag byte, zero elsewhere.
    pub tcp_flags: u8,
}

impl PacketMeta {
    /// Parse the IPv4 frame `frame`.  `incoming` orients local/remote:
    /// an incoming packet's destination is local.
    pub fn parse(frame: &[u8], incoming: bool) -> Result<Self, ParseError> {
        if frame.len() < 20 {
            return Err(ParseError::Truncated);
        }
        let version = frame[0] >> 4;
        if version != 4 {
            return Err(ParseError::BadVersion(version));
        }
        let ihl = usize::from(frame[0] & 0x0F) * 4;
        if ihl < 20 {
            return Err(ParseError::BadHeaderLength);
        }
        if frame.len() < ihl {
            return Err(ParseError::Truncated);
        }
        let proto = Protocol::from_number(frame[9]);
        let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
        let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

        let frag_offset = (u16::from(frame[6] & 0x1F) << 8) | u16::from(frame[7]);
        let fragment = frag_offset != 0;

        let (mut src_port, mut dst_port, mut tcp_flags) = (0_u16, 0_u16, 0_u8);
        if !fragment {
            match proto {
                Protocol::Tcp | Protocol::Udp => {
                    if frame.len() < ihl + 4 {
                        return Err(ParseError::Truncated);
                    }
                    src_port = (u16::from(frame[ihl]) << 8) | u16::from(frame[ihl + 1]);
                    dst_port = (u16::from(frame[ihl + 2]) << 8) | u16::from(frame[ihl + 3]);
                    if proto == Protocol::Tcp {
                        if frame.len() < ihl + 14 {
                            return Err(ParseError::Truncated);
                        }
                        tcp_flags = frame[ihl + 13];
                    }
                }
                _ => {}
            }
        }

        let (local_ip, remote_ip, local_port, remote_port) = if incoming {
            (dst, src, dst_port, src_port)
        } else {
            (src, dst, src_port, dst_port)
        };
        Ok(PacketMeta {
            proto,
            local_ip,
            remote_ip,
            local_port,
            remote_port,
            fragment,
            tcp_flags,
        })
    }

    /// True if the TCP flag byte carries FIN or RST.
    pub fn tcp_closing(&self) -> bool {
        self.proto == Protocol::Tcp && self.tcp_flags & (TCP_FIN | TCP_RST) != 0
    }
}

/// Build a minimal IPv4 frame, for tests and loopback probes.
///
/// `payload` is appended verbatim after a 20-byte header (no options); for
/// TCP/UDP the payload's first four bytes are the ports.
pub fn build_ipv4(proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]); // id, flags/offset
    frame.push(64); // ttl
    frame.push(proto);
    frame.extend_from_slice(&[0, 0]); // checksum left zero
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(payload);
    frame
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
    fn parses_udp_both_directions() {
        let src = "10.0.0.1".parse().unwrap();
        let dst = "10.0.0.2".parse().unwrap();
        let mut payload = vec![];
        payload.extend_from_slice(&4000_u16.to_be_bytes());
        payload.extend_from_slice(&53_u16.to_be_bytes());
        let frame = build_ipv4(17, src, dst, &payload);

        let out = PacketMeta::parse(&frame, false).unwrap();
        assert_eq!(out.proto, Protocol::Udp);
        assert_eq!(out.local_ip, src);
        assert_eq!(out.remote_ip, dst);
        assert_eq!(out.local_port, 4000);
        assert_eq!(out.remote_port, 53);

        let inc = PacketMeta::parse(&frame, true).unwrap();
        assert_eq!(inc.local_ip, dst);
        assert_eq!(inc.remote_ip, src);
        assert_eq!(inc.local_port, 53);
        assert_eq!(inc.remote_port, 4000);
    }

    #[test]
    fn parses_tcp_flags() {
        let src = "10.0.0.1".parse().unwrap();
        let dst = "10.0.0.2".parse().unwrap();
        // 20-byte TCP header with FIN set.
        let mut tcp = vec![0_u8; 20];
        tcp[0..2].copy_from_slice(&9000_u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443_u16.to_be_bytes());
        tcp[13] = TCP_FIN;
        let frame = build_ipv4(6, src, dst, &tcp);
        let p = PacketMeta::parse(&frame, false).unwrap();
        assert_eq!(p.proto, Protocol::Tcp);
        assert!(p.tcp_closing());
    }

    #[test]
    fn icmp_has_no_ports() {
        let frame = build_ipv4(
            1,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            &[8, 0, 0, 0],
        );
        let p = PacketMeta::parse(&frame, false).unwrap();
        assert_eq!(p.proto, Protocol::Icmp);
        assert_eq!(p.local_port, 0);
        assert_eq!(p.remote_port, 0);
    }

    #[test]
    fn fragment_skips_ports() {
        let mut frame = build_ipv4(
            17,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            &[0xAA; 8],
        );
        frame[7] = 0x10; // nonzero fragment offset
        let p = PacketMeta::parse(&frame, false).unwrap();
        assert!(p.fragment);
        assert_eq!(p.local_port, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(PacketMeta::parse(&[1, 2, 3], false), Err(ParseError::Truncated));
        let mut v6 = vec![0_u8; 40];
        v6[0] = 0x60;
        assert_eq!(
            PacketMeta::parse(&v6, false),
            Err(ParseError::BadVersion(6))
        );
    }
}
