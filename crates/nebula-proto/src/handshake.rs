//! The two-message authenticated key exchange that establishes a tunnel.
//!
//! The exchange follows the Noise IX pattern: both sides transmit their
//! static Diffie-Hellman keys inside the handshake, so neither needs to
//! know the other's key beforehand.  Each message carries a protobuf
//! payload with the sender's certificate, its chosen tunnel index, and a
//! timestamp.  The responder's static key, certificate, and index are
//! encrypted under the first derived key; the initiator's certificate is
//! bound into the transcript and authenticated by the second message.
//!
//! Identity binding: a certificate's public key must equal the static key
//! its sender used in the exchange.  [`InitiatorState::finish`] and
//! [`Responder::finish`] enforce this for the transcript half; validating
//! the certificate against the CA pool is the caller's job.

use prost::Message;
use rand_core::CryptoRngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use nebula_crypto::kdf::{hash2, hkdf2};
use nebula_crypto::pk::DhKeypair;
use nebula_crypto::{AeadCipher, CipherKind, Curve};

use crate::err::HandshakeError;
use crate::tunnel::TunnelKeys;

/// Protocol label mixed into the initial chaining key.
///
/// The cipher name is appended so the two network ciphers produce disjoint
/// key schedules.
const PROTOCOL_LABEL: &[u8] = b"nebula-ix-sha256-1:";

/// Length of an AEAD tag inside handshake messages.
const TAG_LEN: usize = 16;

/// The protobuf payload each handshake message carries.
#[derive(Clone, PartialEq, Message)]
#[allow(clippy::exhaustive_structs)]
pub struct HandshakePayload {
    /// The sender's certificate blob.
    #[prost(bytes = "vec", tag = "1")]
    pub certificate: Vec<u8>,
    /// The tunnel index the sender allocated for this tunnel.
    #[prost(uint32, tag = "2")]
    pub index: u32,
    /// Sender's wall clock in milliseconds since the epoch; purely
    /// diagnostic.
    #[prost(uint64, tag = "3")]
    pub timestamp_ms: u64,
}

/// The evolving symmetric state of a handshake in progress.
struct SymmetricState {
    /// Which AEAD the handshake (and the resulting tunnel) uses.
    cipher: CipherKind,
    /// Chaining key.
    ck: Zeroizing<[u8; 32]>,
    /// Transcript hash.
    h: [u8; 32],
    /// Message key, once a DH output has been mixed in.
    k: Option<Zeroizing<[u8; 32]>>,
    /// Nonce for the next encryption under `k`.
    n: u64,
}

impl SymmetricState {
    /// Initialize for `cipher` on `curve`.
    fn new(cipher: CipherKind, curve: Curve) -> Self {
        let name = match (cipher, curve) {
            (CipherKind::AesGcm, Curve::Curve25519) => b"25519_AESGCM".as_slice(),
            (CipherKind::ChaChaPoly, Curve::Curve25519) => b"25519_CHACHAPOLY".as_slice(),
            (CipherKind::AesGcm, Curve::P256) => b"P256_AESGCM".as_slice(),
            (CipherKind::ChaChaPoly, Curve::P256) => b"P256_CHACHAPOLY".as_slice(),
        };
        let h = hash2(PROTOCOL_LABEL, name);
        SymmetricState {
            cipher,
            ck: Zeroizing::new(h),
            h,
            k: None,
            n: 0,
        }
    }

    /// Absorb public data into the transcript.
    fn mix_hash(&mut self, data: &[u8]) {
        self.h = hash2(&self.h, data);
    }

    /// Absorb a DH output, deriving a fresh message key.
    fn mix_key(&mut self, ikm: &[u8]) {
        let (ck, k) = hkdf2(&self.ck, ikm);
        self.ck = ck;
        self.k = Some(k);
        self.n = 0;
    }

    /// Encrypt-if-keyed: with a key, seal under the transcript hash as
    /// associated data; without one, pass plaintext through.  Either way
    /// the result is absorbed into the transcript.
    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let out = match &self.k {
            Some(k) => {
                let cipher = AeadCipher::new(self.cipher, k);
                let sealed = cipher.seal(self.n, &self.h, plaintext);
                self.n += 1;
                sealed
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        out
    }

    /// Inverse of [`encrypt_and_hash`](Self::encrypt_and_hash).
    fn decrypt_and_hash(&mut self, received: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let out = match &self.k {
            Some(k) => {
                let cipher = AeadCipher::new(self.cipher, k);
                let opened = cipher
                    .open(self.n, &self.h, received)
                    .map_err(|_| HandshakeError::AuthFail)?;
                self.n += 1;
                opened
            }
            None => received.to_vec(),
        };
        self.mix_hash(received);
        Ok(out)
    }

    /// Finish: derive the two directional tunnel keys.
    fn split(&self) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        hkdf2(&self.ck, &[])
    }
}

/// Initiator state held while waiting for the responder's reply.
pub struct InitiatorState {
    /// Symmetric state after sending message one.
    symmetric: SymmetricState,
    /// Our ephemeral keypair.
    ephemeral: DhKeypair,
    /// Our static public key, for the identity binding check.
    static_public: Vec<u8>,
}

/// Everything [`Responder::finish`] produces besides the reply bytes.
#[non_exhaustive]
pub struct HandshakeComplete {
    /// The peer's decoded payload (certificate blob, index, timestamp).
    pub payload: HandshakePayload,
    /// The static key the peer actually used, to be checked against its
    /// certificate.
    pub peer_static: Vec<u8>,
    /// The derived directional keys.
    pub keys: TunnelKeys,
}

/// Begin a handshake as initiator.  Returns the state to hold and the
/// bytes of message one.
pub fn initiate<R: CryptoRngCore>(
    cipher: CipherKind,
    local_static: &DhKeypair,
    payload: &HandshakePayload,
    rng: &mut R,
) -> (InitiatorState, Vec<u8>) {
    let curve = local_static.curve();
    let mut ss = SymmetricState::new(cipher, curve);
    let ephemeral = DhKeypair::generate(curve, rng);

    let mut msg = Vec::new();
    // -> e
    let e_pub = ephemeral.public_bytes();
    ss.mix_hash(&e_pub);
    msg.extend_from_slice(&e_pub);
    // -> s  (no key yet: transmitted in the clear, bound to the transcript)
    let s_pub = local_static.public_bytes();
    msg.extend_from_slice(&ss.encrypt_and_hash(&s_pub));
    // -> payload
    msg.extend_from_slice(&ss.encrypt_and_hash(&payload.encode_to_vec()));

    (
        InitiatorState {
            symmetric: ss,
            ephemeral,
            static_public: s_pub,
        },
        msg,
    )
}

impl InitiatorState {
    /// Consume the responder's reply, producing the peer's payload and the
    /// tunnel keys.  `local_static` must be the same keypair passed to
    /// [`initiate`].
    pub fn finish(
        mut self,
        local_static: &DhKeypair,
        reply: &[u8],
    ) -> Result<HandshakeComplete, HandshakeError> {
        let curve = local_static.curve();
        let keylen = curve.public_key_len();
        if local_static.public_bytes()[..]
            .ct_eq(&self.static_public[..])
            .unwrap_u8()
            == 0
        {
            return Err(HandshakeError::Malformed);
        }
        if reply.len() < keylen + keylen + TAG_LEN + TAG_LEN {
            return Err(HandshakeError::Malformed);
        }
        let ss = &mut self.symmetric;

        // <- e
        let (re, rest) = reply.split_at(keylen);
        ss.mix_hash(re);
        // <- ee
        ss.mix_key(&self.ephemeral.dh(re)?[..]);
        // <- se  (responder mixed its ephemeral with our static)
        ss.mix_key(&local_static.dh(re)?[..]);
        // <- s
        let (sealed_s, sealed_payload) = rest.split_at(keylen + TAG_LEN);
        let peer_static = ss.decrypt_and_hash(sealed_s)?;
        // <- es
        ss.mix_key(&self.ephemeral.dh(&peer_static)?[..]);
        // <- payload
        let payload_bytes = ss.decrypt_and_hash(sealed_payload)?;
        let payload = HandshakePayload::decode(&payload_bytes[..])?;

        let (k_initiator, k_responder) = ss.split();
        Ok(HandshakeComplete {
            payload,
            peer_static,
            keys: TunnelKeys {
                send: k_initiator,
                recv: k_responder,
            },
        })
    }
}

/// Responder state between consuming message one and emitting the reply.
pub struct Responder {
    /// Symmetric state after consuming message one.
    symmetric: SymmetricState,
    /// The initiator's ephemeral public key.
    peer_ephemeral: Vec<u8>,
    /// The initiator's static public key.
    peer_static: Vec<u8>,
    /// The initiator's decoded payload.
    peer_payload: HandshakePayload,
}

/// Consume an initiator's message one.
pub fn respond(
    cipher: CipherKind,
    curve: Curve,
    msg1: &[u8],
) -> Result<Responder, HandshakeError> {
    let keylen = curve.public_key_len();
    if msg1.len() < keylen * 2 {
        return Err(HandshakeError::Malformed);
    }
    let mut ss = SymmetricState::new(cipher, curve);

    let (re, rest) = msg1.split_at(keylen);
    ss.mix_hash(re);
    let (rs, payload_bytes) = rest.split_at(keylen);
    let peer_static = ss.decrypt_and_hash(rs)?;
    let payload_plain = ss.decrypt_and_hash(payload_bytes)?;
    let peer_payload = HandshakePayload::decode(&payload_plain[..])?;

    Ok(Responder {
        symmetric: ss,
        peer_ephemeral: re.to_vec(),
        peer_static,
        peer_payload,
    })
}

impl Responder {
    /// The initiator's payload, available before replying so the caller
    /// can validate the certificate and pick an index first.
    pub fn peer_payload(&self) -> &HandshakePayload {
        &self.peer_payload
    }

    /// The static key the initiator used.
    pub fn peer_static(&self) -> &[u8] {
        &self.peer_static
    }

    /// Emit the reply and derive the tunnel keys.
    pub fn finish<R: CryptoRngCore>(
        mut self,
        local_static: &DhKeypair,
        payload: &HandshakePayload,
        rng: &mut R,
    ) -> Result<(Vec<u8>, HandshakeComplete), HandshakeError> {
        let curve = local_static.curve();
        let ephemeral = DhKeypair::generate(curve, rng);
        let ss = &mut self.symmetric;

        let mut msg = Vec::new();
        // <- e
        let e_pub = ephemeral.public_bytes();
        ss.mix_hash(&e_pub);
        msg.extend_from_slice(&e_pub);
        // <- ee
        ss.mix_key(&ephemeral.dh(&self.peer_ephemeral)?[..]);
        // <- se
        ss.mix_key(&ephemeral.dh(&self.peer_static)?[..]);
        // <- s
        msg.extend_from_slice(&ss.encrypt_and_hash(&local_static.public_bytes()));
        // <- es
        ss.mix_key(&local_static.dh(&self.peer_ephemeral)?[..]);
        // <- payload
        msg.extend_from_slice(&ss.encrypt_and_hash(&payload.encode_to_vec()));

        let (k_initiator, k_responder) = ss.split();
        Ok((
            msg,
            HandshakeComplete {
                payload: self.peer_payload,
                peer_static: self.peer_static,
                keys: TunnelKeys {
                    send: k_responder,
                    recv: k_initiator,
                },
            },
        ))
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
    use crate::tunnel::CryptoTunnel;

    /// Run the whole exchange and hand back both outcomes.
    fn exchange(
        cipher: CipherKind,
        curve: Curve,
    ) -> (HandshakeComplete, HandshakeComplete, DhKeypair, DhKeypair) {
        let mut rng = rand::thread_rng();
        let a_static = DhKeypair::generate(curve, &mut rng);
        let b_static = DhKeypair::generate(curve, &mut rng);

        let a_payload = HandshakePayload {
            certificate: b"cert A".to_vec(),
            index: 111,
            timestamp_ms: 1,
        };
        let b_payload = HandshakePayload {
            certificate: b"cert B".to_vec(),
            index: 222,
            timestamp_ms: 2,
        };

        let (state, msg1) = initiate(cipher, &a_static, &a_payload, &mut rng);
        let responder = respond(cipher, curve, &msg1).unwrap();
        assert_eq!(responder.peer_payload().index, 111);
        assert_eq!(responder.peer_static(), &a_static.public_bytes()[..]);

        let (msg2, b_done) = responder.finish(&b_static, &b_payload, &mut rng).unwrap();
        let a_done = state.finish(&a_static, &msg2).unwrap();
        (a_done, b_done, a_static, b_static)
    }

    #[test]
    fn completes_on_all_suites() {
        for cipher in [CipherKind::AesGcm, CipherKind::ChaChaPoly] {
            for curve in [Curve::Curve25519, Curve::P256] {
                let (a, b, a_static, b_static) = exchange(cipher, curve);
                assert_eq!(*a.keys.send, *b.keys.recv);
                assert_eq!(*a.keys.recv, *b.keys.send);
                assert_eq!(a.payload.index, 222);
                assert_eq!(a.payload.certificate, b"cert B");
                assert_eq!(a.peer_static, b_static.public_bytes());
                assert_eq!(b.peer_static, a_static.public_bytes());
            }
        }
    }

    #[test]
    fn derived_keys_drive_a_tunnel() {
        let (a, b, _, _) = exchange(CipherKind::AesGcm, Curve::Curve25519);
        let ta = CryptoTunnel::new(CipherKind::AesGcm, &a.keys);
        let tb = CryptoTunnel::new(CipherKind::AesGcm, &b.keys);
        let header = [1_u8; 16];
        let c = ta.next_counter().unwrap();
        let sealed = ta.seal(c, &header, b"first frame");
        assert_eq!(tb.open(c, &header, &sealed).unwrap(), b"first frame");
    }

    #[test]
    fn tampered_reply_fails() {
        let mut rng = rand::thread_rng();
        let curve = Curve::Curve25519;
        let a_static = DhKeypair::generate(curve, &mut rng);
        let b_static = DhKeypair::generate(curve, &mut rng);
        let payload = HandshakePayload::default();

        let (state, msg1) = initiate(CipherKind::AesGcm, &a_static, &payload, &mut rng);
        let responder = respond(CipherKind::AesGcm, curve, &msg1).unwrap();
        let (mut msg2, _b_done) = responder
            .finish(&b_static, &payload, &mut rng)
            .unwrap();
        let last = msg2.len() - 1;
        msg2[last] ^= 1;
        assert!(matches!(
            state.finish(&a_static, &msg2),
            Err(HandshakeError::AuthFail)
        ));
    }

    #[test]
    fn truncated_messages_fail_cleanly() {
        let mut rng = rand::thread_rng();
        let curve = Curve::Curve25519;
        let a_static = DhKeypair::generate(curve, &mut rng);
        let payload = HandshakePayload::default();
        let (_state, msg1) = initiate(CipherKind::AesGcm, &a_static, &payload, &mut rng);
        assert!(respond(CipherKind::AesGcm, curve, &msg1[..10]).is_err());
    }

    #[test]
    fn cipher_mismatch_fails() {
        let mut rng = rand::thread_rng();
        let curve = Curve::Curve25519;
        let a_static = DhKeypair::generate(curve, &mut rng);
        let b_static = DhKeypair::generate(curve, &mut rng);
        let payload = HandshakePayload::default();

        let (_state, msg1) = initiate(CipherKind::AesGcm, &a_static, &payload, &mut rng);
        // A responder on the other cipher derives a different transcript,
        // so its reply can never authenticate -- but message one itself
        // parses (it is unencrypted), which is why the payload cannot be
        // trusted until the exchange completes.
        let responder = respond(CipherKind::ChaChaPoly, curve, &msg1).unwrap();
        let (msg2, _) = responder.finish(&b_static, &payload, &mut rng).unwrap();
        let (state, _msg1) = initiate(CipherKind::AesGcm, &a_static, &payload, &mut rng);
        assert!(state.finish(&a_static, &msg2).is_err());
    }
}
