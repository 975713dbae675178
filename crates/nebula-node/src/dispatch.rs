//! Packet dispatch: classifying inbound UDP packets and pushing inside
//! frames out through tunnels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use nebula_firewall::packet::PacketMeta;
use nebula_proto::header::TestSubtype;
use nebula_proto::relay::RelayControl;
use nebula_proto::{CryptoError, Header, PacketType, ProtocolError, HEADER_LEN};

use crate::hostmap::HostInfo;
use crate::Node;

impl Node {
    /// Process one datagram received from the outside (UDP) side.
    pub fn handle_outside_packet(&self, src: SocketAddr, data: &[u8], now: Instant) {
        self.handle_outside_inner(src, data, now, false);
    }

    /// Inner entry point; `from_relay` marks packets unwrapped from a
    /// relay, whose source address must not be mistaken for the peer's.
    pub(crate) fn handle_outside_inner(
        &self,
        src: SocketAddr,
        data: &[u8],
        now: Instant,
        from_relay: bool,
    ) {
        if self.is_closed() {
            return;
        }
        let header = match Header::decode(data) {
            Ok(h) => h,
            Err(ProtocolError::ShortPacket) => {
                self.stats().count_short_packet();
                return;
            }
            Err(_) => {
                self.stats().count_unknown_type();
                return;
            }
        };
        let (ad, payload) = data.split_at(HEADER_LEN);

        match header.typ {
            PacketType::HANDSHAKE => match header.subtype {
                1 => self
                    .handshakes()
                    .handle_stage1(self, src, payload, now, from_relay),
                2 => self
                    .handshakes()
                    .handle_stage2(self, src, &header, payload, now, from_relay),
                _ => self.stats().count_unknown_type(),
            },
            PacketType::MESSAGE
            | PacketType::TEST
            | PacketType::CLOSE_TUNNEL
            | PacketType::RELAY_CONTROL => {
                self.handle_tunnel_packet(src, &header, ad, payload, now, from_relay);
            }
            PacketType::RECV_ERROR => self.handle_recv_error(src, &header, now),
            PacketType::RELAY => {
                if let Some(inner) = self.relays().handle_frame(self, &header, payload) {
                    self.handle_outside_inner(src, &inner, now, true);
                }
            }
            PacketType::LIGHTHOUSE => self.lighthouse().handle_packet(src, payload),
            _ => self.stats().count_unknown_type(),
        }
    }

    /// A packet addressed to an established tunnel: decrypt, then act on
    /// its type.
    fn handle_tunnel_packet(
        &self,
        src: SocketAddr,
        header: &Header,
        ad: &[u8],
        payload: &[u8],
        now: Instant,
        from_relay: bool,
    ) {
        // The sender addresses us by the index we assigned to the tunnel.
        let host = match self.hostmap().by_local_index(header.remote_index) {
            Some(host) if host.is_established() => host,
            _ => {
                self.stats().count_unknown_index();
                self.send_recv_error(src, header.remote_index);
                return;
            }
        };
        let Some(tunnel) = host.tunnel() else {
            return;
        };
        let plain = match tunnel.open(header.counter, ad, payload) {
            Ok(p) => p,
            Err(CryptoError::ReplayOrTooOld) => {
                self.stats().count_replay_drop();
                return;
            }
            Err(_) => {
                self.stats().count_auth_fail();
                return;
            }
        };
        host.record_in();
        if !from_relay {
            host.set_remote_addr(src, now);
        }

        match header.typ {
            PacketType::MESSAGE => self.deliver_inside(&host, &plain, now),
            PacketType::TEST => {
                if header.subtype == u8::from(TestSubtype::REQUEST) {
                    self.send_probe(&host, TestSubtype::REPLY);
                }
                // A reply needs no action beyond the liveness accounting
                // above.
            }
            PacketType::CLOSE_TUNNEL => {
                debug!(peer = %host.overlay_ip(), "peer closed the tunnel");
                self.evict_tunnel(host.local_index(), now);
            }
            PacketType::RELAY_CONTROL => match RelayControl::decode_payload(&plain) {
                Ok(msg) => self.relays().handle_control(self, &host, &msg, now),
                Err(_) => self.stats().count_short_packet(),
            },
            _ => unreachable!("caller matched tunnel packet types"),
        }
    }

    /// Run the inbound firewall and hand the frame to the inside pipe.
    fn deliver_inside(&self, host: &Arc<HostInfo>, frame: &[u8], _now: Instant) {
        let meta = match PacketMeta::parse(frame, true) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %host.overlay_ip(), error = %e, "undecodable inner frame");
                self.stats().count_short_packet();
                return;
            }
        };
        let Some(cert) = host.cert() else { return };
        let pool = self.ca_pool();
        if self
            .firewall()
            .check(&meta, true, cert, &pool, Instant::now())
            .is_err()
        {
            self.stats().count_firewall_drop(true);
            return;
        }
        self.write_inside(frame);
    }

    /// The peer told us it does not know the index we are sending to:
    /// tear the tunnel down and start over.
    fn handle_recv_error(&self, src: SocketAddr, header: &Header, now: Instant) {
        let Some(host) = self.hostmap().by_remote_index(header.remote_index) else {
            return;
        };
        // Only believe the endpoint we were actually talking to.
        if host.remote_addr().is_some_and(|a| a != src) {
            debug!(%src, "ignoring recv_error from unexpected address");
            return;
        }
        let ip = host.overlay_ip();
        debug!(peer = %ip, "peer lost our tunnel; re-handshaking");
        self.evict_tunnel(host.local_index(), now);
        self.handshakes().trigger(ip);
    }

    /// Process one cleartext frame read from the inside (TUN) side.
    pub fn handle_inside_frame(&self, frame: &[u8], now: Instant) {
        if self.is_closed() {
            return;
        }
        let meta = match PacketMeta::parse(frame, false) {
            Ok(m) => m,
            Err(_) => {
                self.stats().count_short_packet();
                return;
            }
        };
        // Traffic to our own overlay address loops straight back, echo
        // requests included; the firewall never sees it.
        if meta.remote_ip == self.overlay_ip() {
            self.write_inside(frame);
            return;
        }

        if let Some(host) = self.hostmap().lookup_main(meta.remote_ip) {
            if host.is_established() {
                self.send_frame_to_established(&host, frame, now);
                return;
            }
        }

        // No tunnel yet: stage the frame and get a handshake moving.
        let pending = self.hostmap().add_pending(meta.remote_ip, now);
        if !pending.queue_frame(frame) {
            self.stats().count_outbox_drop(1);
        }
        self.handshakes().trigger(meta.remote_ip);

        // If we cannot see the peer directly, line up a relay path too.
        if self.relays().use_relays()
            && pending.remote_addr().is_none()
            && pending.candidates().is_empty()
            && pending.via_relay().is_none()
        {
            for relay_ip in self.relays().configured_relays().to_vec() {
                if self.hostmap().lookup_main(relay_ip).is_some() {
                    if let Err(e) = self.request_relay(relay_ip, meta.remote_ip) {
                        debug!(relay = %relay_ip, error = %e, "relay request failed");
                    }
                }
            }
        }
    }

    /// Firewall, seal, and transmit one inside frame on an established
    /// tunnel.
    pub(crate) fn send_frame_to_established(
        &self,
        host: &Arc<HostInfo>,
        frame: &[u8],
        _now: Instant,
    ) {
        let meta = match PacketMeta::parse(frame, false) {
            Ok(m) => m,
            Err(_) => {
                self.stats().count_short_packet();
                return;
            }
        };
        let Some(cert) = host.cert() else { return };
        let pool = self.ca_pool();
        if self
            .firewall()
            .check(&meta, false, cert, &pool, Instant::now())
            .is_err()
        {
            self.stats().count_firewall_drop(false);
            return;
        }
        match self.seal_and_send(host, PacketType::MESSAGE, 0, frame) {
            Ok(()) => {}
            Err(crate::Error::Crypto(CryptoError::CounterExhausted)) => {
                // The tunnel must re-key; evict and re-handshake.
                let ip = host.overlay_ip();
                self.evict_tunnel(host.local_index(), Instant::now());
                self.handshakes().trigger(ip);
            }
            Err(e) => {
                debug!(peer = %host.overlay_ip(), error = %e, "frame not sent");
            }
        }
    }
}
