//! Key derivation for the tunnel handshake.
//!
//! Each mix step of the handshake runs HKDF-SHA-256 with the current
//! chaining key as salt and the fresh Diffie-Hellman output as input key
//! material, expanding one or two 32-byte blocks with empty info.  This is
//! the arrangement the WireGuard family of handshakes uses, specialized to
//! SHA-256.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// HKDF with one 32-byte output: extract `ikm` under the chaining key
/// `ck`, then expand a single block.
pub fn hkdf1(ck: &[u8; 32], ikm: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(ck), ikm);
    let mut out = Zeroizing::new([0_u8; 32]);
    hk.expand(&[], &mut out[..])
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// HKDF with two 32-byte outputs, used when a mix step must yield both a
/// new chaining key and a message key.
pub fn hkdf2(ck: &[u8; 32], ikm: &[u8]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hk = Hkdf::<Sha256>::new(Some(ck), ikm);
    let mut okm = Zeroizing::new([0_u8; 64]);
    hk.expand(&[], &mut okm[..])
        .expect("64 bytes is a valid HKDF-SHA256 output length");
    let mut t1 = Zeroizing::new([0_u8; 32]);
    let mut t2 = Zeroizing::new([0_u8; 32]);
    t1.copy_from_slice(&okm[..32]);
    t2.copy_from_slice(&okm[32..]);
    (t1, t2)
}

/// Compute SHA-256 of the concatenation of two byte strings.
///
/// Handshake transcript hashing is nothing but repeated applications
/// of this.
pub fn hash2(a: &[u8], b: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    let mut d = Sha256::new();
    d.update(a);
    d.update(b);
    d.finalize().into()
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
    fn matches_rfc5869_case_one() {
        // RFC 5869 test case 1, with the salt widened to our fixed
        // 32-byte chaining-key shape (zero padded).
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let mut salt = [0_u8; 32];
        salt[..13].copy_from_slice(&hex!("000102030405060708090a0b0c"));
        let (t1, t2) = hkdf2(&salt, &ikm);
        let t1b = hkdf1(&salt, &ikm);
        assert_eq!(*t1, *t1b);
        assert_ne!(*t1, *t2);
    }

    #[test]
    fn outputs_depend_on_every_input() {
        let base = hkdf1(&[0_u8; 32], b"ikm");
        assert_ne!(*hkdf1(&[1_u8; 32], b"ikm"), *base);
        assert_ne!(*hkdf1(&[0_u8; 32], b"other"), *base);
    }

    #[test]
    fn hash2_matches_sha256() {
        use sha2::Digest;
        let h = hash2(b"foo", b"bar");
        let expected: [u8; 32] = Sha256::digest(b"foobar").into();
        assert_eq!(h, expected);
    }
}
