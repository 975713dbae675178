//! End-to-end scenarios: pairs and triples of engines wired back to back
//! with in-memory pipes, packets shuttled by hand.

#![allow(clippy::unwrap_used)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use nebula_cert::{CaPool, Certificate, CertificateDetails};
use nebula_crypto::pk::{DhKeypair, SigningKeypair};
use nebula_crypto::Curve;
use nebula_firewall::packet::build_ipv4;
use nebula_node::config::NodeConfig;
use nebula_node::{InsidePipe, Node, NoopLighthouse, OutsidePipe, RuleConfig};

/// Collects datagrams a node tries to transmit.
#[derive(Clone, Default)]
struct Mailbox(Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>);

impl OutsidePipe for Mailbox {
    fn send_to(&self, addr: SocketAddr, packet: &[u8]) {
        self.0.lock().unwrap().push((addr, packet.to_vec()));
    }
}

/// Collects frames a node writes to its inside interface.
#[derive(Clone, Default)]
struct InsideSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl InsidePipe for InsideSink {
    fn write_frame(&self, frame: &[u8]) {
        self.0.lock().unwrap().push(frame.to_vec());
    }
}

/// One engine plus its attachments.
struct TestNode {
    node: Node,
    addr: SocketAddr,
    ip: Ipv4Addr,
    out: Mailbox,
    inside: InsideSink,
}

/// A CA valid for an hour around `now` (or already expired, if
/// `expired`).
fn make_ca(now: SystemTime, expired: bool) -> (SigningKeypair, Certificate) {
    let mut rng = rand::thread_rng();
    let key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
    let not_after = if expired {
        now - Duration::from_secs(1)
    } else {
        now + Duration::from_secs(3600)
    };
    let details = CertificateDetails::builder("scenario ca")
        .ip("10.0.0.0/16".parse().unwrap())
        .valid(now - Duration::from_secs(60), not_after)
        .build();
    let cert = Certificate::self_sign(details, &key);
    (key, cert)
}

/// A node identity signed by `ca`.
fn make_identity(
    name: &str,
    ip: &str,
    ca: &Certificate,
    ca_key: &SigningKeypair,
    now: SystemTime,
) -> (Certificate, DhKeypair) {
    let mut rng = rand::thread_rng();
    let dh = DhKeypair::generate(Curve::Curve25519, &mut rng);
    let details = CertificateDetails::builder(name)
        .ip(format!("{ip}/24").parse().unwrap())
        .valid(now - Duration::from_secs(1), now + Duration::from_secs(1800))
        .public_key(dh.curve(), &dh.public_bytes())
        .build();
    (Certificate::sign_with_ca(details, ca, ca_key), dh)
}

/// A configuration whose firewall admits everything, both ways.
fn open_config() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.firewall.inbound.push(RuleConfig::default());
    cfg.firewall.outbound.push(RuleConfig::default());
    cfg
}

/// Assemble an engine.
fn spawn(
    cert: Certificate,
    dh: DhKeypair,
    ca: &Certificate,
    addr: &str,
    cfg: NodeConfig,
) -> TestNode {
    let ip = cert.details().primary_ip().unwrap();
    let mut pool = CaPool::new();
    pool.add_ca(ca.clone()).unwrap();
    let out = Mailbox::default();
    let inside = InsideSink::default();
    let node = Node::new(
        &cfg,
        cert,
        dh,
        pool,
        Box::new(out.clone()),
        Box::new(inside.clone()),
        Box::new(NoopLighthouse),
    )
    .unwrap();
    TestNode {
        node,
        addr: addr.parse().unwrap(),
        ip,
        out,
        inside,
    }
}

/// Shuttle queued datagrams between nodes until quiescent, recording
/// every delivery.
fn pump(nodes: &[&TestNode], now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
    let mut history = Vec::new();
    loop {
        let mut moved = false;
        for n in nodes {
            let outgoing: Vec<(SocketAddr, Vec<u8>)> = n.out.0.lock().unwrap().drain(..).collect();
            for (to, packet) in outgoing {
                moved = true;
                history.push((to, packet.clone()));
                if let Some(dest) = nodes.iter().find(|m| m.addr == to) {
                    dest.node.handle_outside_packet(n.addr, &packet, now);
                }
            }
        }
        if !moved {
            break;
        }
    }
    history
}

/// Bring up a direct tunnel between two spawned nodes.
fn establish(a: &TestNode, b: &TestNode, now: Instant) {
    a.node.add_candidate(b.ip, b.addr, now);
    a.node.trigger_handshake(b.ip);
    a.node.timer_tick(now + Duration::from_millis(150));
    pump(&[a, b], now);
    assert!(a.node.hostmap().lookup_main(b.ip).is_some(), "tunnel up on initiator");
    assert!(b.node.hostmap().lookup_main(a.ip).is_some(), "tunnel up on responder");
}

/// An ICMP echo request frame between overlay addresses.
fn echo_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    build_ipv4(1, src, dst, &[8, 0, 0, 0, 0, 1, 0, 1, 0xDE, 0xAD])
}

#[test]
fn two_nodes_direct_handshake_and_echo() {
    let wall = SystemTime::now();
    let now = Instant::now();
    let (ca_key, ca) = make_ca(wall, false);
    let (cert_a, dh_a) = make_identity("node-a", "10.0.0.1", &ca, &ca_key, wall);
    let (cert_b, dh_b) = make_identity("node-b", "10.0.0.2", &ca, &ca_key, wall);
    let a = spawn(cert_a, dh_a, &ca, "192.0.2.1:4242", open_config());
    let b = spawn(cert_b, dh_b, &ca, "192.0.2.2:4242", open_config());

    // First outbound frame triggers the handshake and rides the outbox.
    a.node.add_candidate(b.ip, b.addr, now);
    let frame = echo_frame(a.ip, b.ip);
    a.node.handle_inside_frame(&frame, now);
    a.node.timer_tick(now + Duration::from_millis(150));
    pump(&[&a, &b], now);

    assert!(a.node.hostmap().lookup_main(b.ip).is_some());
    assert!(b.node.hostmap().lookup_main(a.ip).is_some());
    let delivered = b.inside.0.lock().unwrap();
    assert_eq!(delivered.as_slice(), &[frame], "echo bytes arrive verbatim");
}

#[test]
fn replayed_packet_is_counted_and_not_delivered() {
    let wall = SystemTime::now();
    let now = Instant::now();
    let (ca_key, ca) = make_ca(wall, false);
    let (cert_a, dh_a) = make_identity("node-a", "10.0.0.1", &ca, &ca_key, wall);
    let (cert_b, dh_b) = make_identity("node-b", "10.0.0.2", &ca, &ca_key, wall);
    let a = spawn(cert_a, dh_a, &ca, "192.0.2.1:4242", open_config());
    let b = spawn(cert_b, dh_b, &ca, "192.0.2.2:4242", open_config());

    a.node.add_candidate(b.ip, b.addr, now);
    let frame = echo_frame(a.ip, b.ip);
    a.node.handle_inside_frame(&frame, now);
    a.node.timer_tick(now + Duration::from_millis(150));
    let history = pump(&[&a, &b], now);

    // Find the data packet B accepted (type nibble 0 = message).
    let message = history
        .iter()
        .find(|(to, pkt)| *to == b.addr && pkt.len() > 16 && pkt[0] & 0x0F == 0)
        .map(|(_, pkt)| pkt.clone())
        .expect("a message packet reached B");

    let delivered_before = b.inside.0.lock().unwrap().len();
    assert_eq!(b.node.stats().replay_drop(), 0);
    b.node.handle_outside_packet(a.addr, &message, now);
    assert_eq!(b.node.stats().replay_drop(), 1, "replay is counted");
    assert_eq!(
        b.inside.0.lock().unwrap().len(),
        delivered_before,
        "replay is not delivered"
    );
}

#[test]
fn expired_root_blocks_the_handshake() {
    let wall = SystemTime::now();
    let now = Instant::now();
    let (ca_key, ca) = make_ca(wall, true);
    let (cert_a, dh_a) = make_identity("node-a", "10.0.0.1", &ca, &ca_key, wall);
    let (cert_b, dh_b) = make_identity("node-b", "10.0.0.2", &ca, &ca_key, wall);
    let a = spawn(cert_a.clone(), dh_a, &ca, "192.0.2.1:4242", open_config());
    let b = spawn(cert_b, dh_b, &ca, "192.0.2.2:4242", open_config());

    // The verification error is precise...
    let err = b.node.ca_pool().verify(&cert_a, wall).unwrap_err();
    assert_eq!(err.to_string(), "root certificate is expired");

    // ...and the handshake goes nowhere.
    a.node.add_candidate(b.ip, b.addr, now);
    a.node.trigger_handshake(b.ip);
    a.node.timer_tick(now + Duration::from_millis(150));
    pump(&[&a, &b], now);
    assert!(a.node.hostmap().lookup_main(b.ip).is_none());
    assert!(b.node.hostmap().lookup_main(a.ip).is_none());
    assert!(b.node.stats().handshake_reject() >= 1);
}

#[test]
fn blocklisted_peer_is_refused() {
    let wall = SystemTime::now();
    let now = Instant::now();
    let (ca_key, ca) = make_ca(wall, false);
    let (cert_a, dh_a) = make_identity("node-a", "10.0.0.1", &ca, &ca_key, wall);
    let (cert_b, dh_b) = make_identity("node-b", "10.0.0.2", &ca, &ca_key, wall);

    let mut cfg_a = open_config();
    cfg_a.pki.blocklist = vec![cert_b.fingerprint().to_hex()];
    let a = spawn(cert_a, dh_a, &ca, "192.0.2.1:4242", cfg_a);
    let b = spawn(cert_b.clone(), dh_b, &ca, "192.0.2.2:4242", open_config());

    let err = a.node.ca_pool().verify(&cert_b, wall).unwrap_err();
    assert_eq!(err.to_string(), "certificate is in the block list");

    a.node.add_candidate(b.ip, b.addr, now);
    a.node.trigger_handshake(b.ip);
    a.node.timer_tick(now + Duration::from_millis(150));
    pump(&[&a, &b], now);
    assert!(
        a.node.hostmap().lookup_main(b.ip).is_none(),
        "no tunnel to a blocklisted peer"
    );
    assert!(a.node.stats().handshake_reject() >= 1);
}

#[test]
fn relay_carries_frames_without_seeing_them() {
    let wall = SystemTime::now();
    let now = Instant::now();
    let (ca_key, ca) = make_ca(wall, false);
    let (cert_a, dh_a) = make_identity("node-a", "10.0.0.1", &ca, &ca_key, wall);
    let (cert_b, dh_b) = make_identity("node-b", "10.0.0.2", &ca, &ca_key, wall);
    let (cert_c, dh_c) = make_identity("node-c", "10.0.0.3", &ca, &ca_key, wall);

    let mut cfg_a = open_config();
    cfg_a.relay.use_relays = true;
    cfg_a.relay.relays = vec!["10.0.0.2".parse().unwrap()];
    let mut cfg_b = open_config();
    cfg_b.relay.am_relay = true;

    let a = spawn(cert_a, dh_a, &ca, "192.0.2.1:4242", cfg_a);
    let b = spawn(cert_b, dh_b, &ca, "192.0.2.2:4242", cfg_b);
    let c = spawn(cert_c, dh_c, &ca, "192.0.2.3:4242", open_config());

    // A and C each reach the relay, never each other.
    establish(&a, &b, now);
    establish(&c, &b, now);

    // A sends one frame toward C; the relay path assembles itself.
    let frame = build_ipv4(17, a.ip, c.ip, &[0x13, 0x88, 0x13, 0x88, 0, 8, 0, 0]);
    a.node.handle_inside_frame(&frame, now);
    pump(&[&a, &b, &c], now);
    a.node.timer_tick(now + Duration::from_millis(300));
    pump(&[&a, &b, &c], now);

    assert!(
        a.node.hostmap().lookup_main(c.ip).is_some(),
        "relayed tunnel established end to end"
    );
    let delivered = c.inside.0.lock().unwrap();
    assert_eq!(delivered.as_slice(), &[frame], "C decrypts exactly what A sent");
    assert!(b.node.stats().relayed() >= 2, "B forwarded in both directions");
    // The relay never inspects the inner flow: its firewall tracked
    // nothing and its inside interface saw nothing.
    assert_eq!(b.node.firewall().flow_count(), 0);
    assert!(b.inside.0.lock().unwrap().is_empty());
}
