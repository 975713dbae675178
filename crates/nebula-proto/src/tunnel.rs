//! Per-tunnel AEAD state: one key per direction, a send counter, and the
//! receive replay window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use zeroize::Zeroizing;

use nebula_crypto::{AeadCipher, CipherKind};

use crate::err::CryptoError;
use crate::replay::{ReplayWindow, Verdict};

/// The send counter at which a tunnel refuses to encrypt further.
///
/// Leaves the entire upper half of the counter space unused, so data
/// counters can never collide with the handshake numbering domain and a
/// nonce can never repeat.  Policy re-keys tunnels long before this.
const COUNTER_LIMIT: u64 = (1 << 32) - 1;

/// The pair of directional keys a completed handshake yields.
#[allow(clippy::exhaustive_structs)]
pub struct TunnelKeys {
    /// Key for traffic we send.
    pub send: Zeroizing<[u8; 32]>,
    /// Key for traffic we receive.
    pub recv: Zeroizing<[u8; 32]>,
}

/// AEAD state for one established tunnel.
///
/// Sealing allocates counters from an atomic; opening takes the replay
/// window's lock.  Neither holds any lock across the cipher itself beyond
/// that, and the type is shared freely between worker threads.
pub struct CryptoTunnel {
    /// Which cipher the network runs.
    cipher: CipherKind,
    /// Key for the outbound direction.
    send_key: AeadCipher,
    /// Last counter handed out; senders start at one.
    send_counter: AtomicU64,
    /// Key for the inbound direction.
    recv_key: AeadCipher,
    /// Replay window for the inbound direction.
    replay: Mutex<ReplayWindow>,
}

impl CryptoTunnel {
    /// Build tunnel state from a completed handshake's keys.
    pub fn new(cipher: CipherKind, keys: &TunnelKeys) -> Self {
        CryptoTunnel {
            cipher,
            send_key: AeadCipher::new(cipher, &keys.send),
            send_counter: AtomicU64::new(0),
            recv_key: AeadCipher::new(cipher, &keys.recv),
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    /// Return the cipher this tunnel runs.
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// Allocate the next send counter.
    pub fn next_counter(&self) -> Result<u64, CryptoError> {
        let c = self.send_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if c >= COUNTER_LIMIT {
            return Err(CryptoError::CounterExhausted);
        }
        Ok(c)
    }

    /// Return the current send counter, for re-key policy decisions.
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// Seal `plaintext` under an already-allocated `counter`, binding
    /// `header` (the packet's 16 wire bytes) as associated data.
    pub fn seal(&self, counter: u64, header: &[u8], plaintext: &[u8]) -> Vec<u8> {
        self.send_key.seal(counter, header, plaintext)
    }

    /// Open a received payload: replay pre-check, authenticate and
    /// decrypt, then commit the counter to the window.
    ///
    /// The window is only advanced after authentication succeeds, so a
    /// forged counter cannot poison it.
    pub fn open(&self, counter: u64, header: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut window = self.replay.lock().expect("replay window poisoned");
        if window.would_accept(counter) == Verdict::DuplicateOrTooOld {
            return Err(CryptoError::ReplayOrTooOld);
        }
        let plaintext = self.recv_key.open(counter, header, sealed)?;
        match window.check_and_update(counter) {
            Verdict::Accept => Ok(plaintext),
            // Lost a race with another worker delivering the same counter.
            Verdict::DuplicateOrTooOld => Err(CryptoError::ReplayOrTooOld),
        }
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
    use zeroize::Zeroizing;

    /// A mirrored pair of tunnels sharing keys.
    fn pair(cipher: CipherKind) -> (CryptoTunnel, CryptoTunnel) {
        let k1 = Zeroizing::new([0x11_u8; 32]);
        let k2 = Zeroizing::new([0x22_u8; 32]);
        let a = CryptoTunnel::new(
            cipher,
            &TunnelKeys {
                send: k1.clone(),
                recv: k2.clone(),
            },
        );
        let b = CryptoTunnel::new(
            cipher,
            &TunnelKeys {
                send: k2,
                recv: k1,
            },
        );
        (a, b)
    }

    #[test]
    fn seal_open_roundtrip_both_ciphers() {
        for cipher in [CipherKind::AesGcm, CipherKind::ChaChaPoly] {
            let (a, b) = pair(cipher);
            let header = [0x10_u8; 16];
            let counter = a.next_counter().unwrap();
            assert_eq!(counter, 1);
            let sealed = a.seal(counter, &header, b"ping");
            let opened = b.open(counter, &header, &sealed).unwrap();
            assert_eq!(opened, b"ping");
        }
    }

    #[test]
    fn replayed_packet_is_rejected() {
        let (a, b) = pair(CipherKind::AesGcm);
        let header = [0_u8; 16];
        let c = a.next_counter().unwrap();
        let sealed = a.seal(c, &header, b"once");
        b.open(c, &header, &sealed).unwrap();
        assert_eq!(
            b.open(c, &header, &sealed),
            Err(CryptoError::ReplayOrTooOld)
        );
    }

    #[test]
    fn forged_counter_does_not_burn_window() {
        let (a, b) = pair(CipherKind::AesGcm);
        let header = [0_u8; 16];
        let c = a.next_counter().unwrap();
        let sealed = a.seal(c, &header, b"real");
        // A garbage packet claiming the same counter fails auth...
        assert_eq!(
            b.open(c, &header, b"garbage that is long enough...."),
            Err(CryptoError::AuthFail)
        );
        // ...and the real packet still goes through.
        assert_eq!(b.open(c, &header, &sealed).unwrap(), b"real");
    }

    #[test]
    fn tampered_header_fails_auth() {
        let (a, b) = pair(CipherKind::ChaChaPoly);
        let header = [7_u8; 16];
        let c = a.next_counter().unwrap();
        let sealed = a.seal(c, &header, b"frame");
        let mut other = header;
        other[4] ^= 1;
        assert_eq!(b.open(c, &other, &sealed), Err(CryptoError::AuthFail));
    }

    #[test]
    fn counter_exhaustion() {
        let (a, _b) = pair(CipherKind::AesGcm);
        a.send_counter.store(COUNTER_LIMIT - 2, Ordering::Relaxed);
        assert!(a.next_counter().is_ok());
        assert_eq!(a.next_counter(), Err(CryptoError::CounterExhausted));
    }
}
