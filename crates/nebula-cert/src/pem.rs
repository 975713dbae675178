//! PEM framing for certificates.
//!
//! Certificates travel in ordinary PEM armor with the banner
//! `NEBULA CERTIFICATE`.  A bundle may hold several blocks; blocks with
//! the `NEBULA CERTIFICATE V2` banner are skipped with a warning, so a
//! node can read a mixed bundle produced by newer tooling.

use base64ct::{Base64, Encoding};
use tracing::warn;

use crate::{Certificate, CertificateError, PemError};

/// Banner for a certificate block.
pub const CERT_BANNER: &str = "NEBULA CERTIFICATE";
/// Banner for a newer certificate format we tolerate but do not read.
pub const CERT_V2_BANNER: &str = "NEBULA CERTIFICATE V2";

/// Width at which the base64 body is wrapped.
const WRAP_COLUMNS: usize = 64;

/// Frame `data` as a single PEM block under `banner`.
pub(crate) fn encode_block(banner: &str, data: &[u8]) -> String {
    let b64 = Base64::encode_string(data);
    let mut out = String::with_capacity(b64.len() + banner.len() * 2 + 64);
    out.push_str("-----BEGIN ");
    out.push_str(banner);
    out.push_str("-----\n");
    for chunk in b64.as_bytes().chunks(WRAP_COLUMNS) {
        // Chunks of an ASCII string are ASCII.
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(banner);
    out.push_str("-----\n");
    out
}

/// Parse the first PEM block in `input`.
///
/// Returns the banner, the decoded body, and the remainder of the input
/// after the block.
pub(crate) fn decode_block(input: &str) -> Result<(String, Vec<u8>, &str), PemError> {
    let begin = input.find("-----BEGIN ").ok_or(PemError::MissingBanner)?;
    let after_begin = &input[begin + "-----BEGIN ".len()..];
    let banner_end = after_begin.find("-----").ok_or(PemError::MissingBanner)?;
    let banner = &after_begin[..banner_end];
    let body_start = &after_begin[banner_end + "-----".len()..];

    let end_marker = format!("-----END {banner}-----");
    let end = body_start.find(&end_marker).ok_or(PemError::MismatchedBanner)?;
    let body: String = body_start[..end]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let data = Base64::decode_vec(&body).map_err(|_| PemError::Base64)?;
    let rest = &body_start[end + end_marker.len()..];
    Ok((banner.to_owned(), data, rest))
}

/// Encode one certificate as PEM.
pub fn encode_certificate(cert: &Certificate) -> String {
    encode_block(CERT_BANNER, &cert.encode())
}

/// Decode the first certificate in a PEM bundle.
pub fn decode_certificate(input: &str) -> Result<Certificate, CertificateError> {
    decode_certificates(input)?
        .into_iter()
        .next()
        .ok_or(CertificateError::Decode("no certificate block".to_owned()))
}

/// Decode every certificate in a PEM bundle.
///
/// `NEBULA CERTIFICATE V2` blocks are skipped with a warning; any other
/// banner is an error.
pub fn decode_certificates(mut input: &str) -> Result<Vec<Certificate>, CertificateError> {
    let mut certs = Vec::new();
    while input.contains("-----BEGIN ") {
        let (banner, data, rest) = decode_block(input)
            .map_err(|e| CertificateError::Decode(e.to_string()))?;
        input = rest;
        match banner.as_str() {
            CERT_BANNER => certs.push(Certificate::decode(&data)?),
            CERT_V2_BANNER => {
                warn!("skipping a v2 certificate block; this build reads v1 only");
            }
            other => {
                return Err(CertificateError::Decode(format!(
                    "unexpected PEM banner {other:?} in certificate bundle"
                )));
            }
        }
    }
    Ok(certs)
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
    use crate::test::test_ca;
    use std::time::SystemTime;

    #[test]
    fn pem_roundtrip() {
        let (_key, ca) = test_ca(SystemTime::now());
        let pem = encode_certificate(&ca);
        assert!(pem.starts_with("-----BEGIN NEBULA CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END NEBULA CERTIFICATE-----\n"));
        let back = decode_certificate(&pem).unwrap();
        assert_eq!(back.fingerprint(), ca.fingerprint());
    }

    #[test]
    fn bundle_of_two() {
        let (_k1, a) = test_ca(SystemTime::now());
        let (_k2, b) = test_ca(SystemTime::now());
        let bundle = format!("{}{}", encode_certificate(&a), encode_certificate(&b));
        let certs = decode_certificates(&bundle).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].fingerprint(), a.fingerprint());
        assert_eq!(certs[1].fingerprint(), b.fingerprint());
    }

    #[test]
    fn v2_blocks_are_skipped() {
        let (_key, ca) = test_ca(SystemTime::now());
        let bundle = format!(
            "{}{}",
            encode_block(CERT_V2_BANNER, b"opaque future bytes"),
            encode_certificate(&ca)
        );
        let certs = decode_certificates(&bundle).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].fingerprint(), ca.fingerprint());
    }

    #[test]
    fn foreign_banner_is_an_error() {
        let bundle = encode_block("RSA PRIVATE KEY", b"not ours");
        assert!(decode_certificates(&bundle).is_err());
    }

    #[test]
    fn truncated_block_is_an_error() {
        let (_key, ca) = test_ca(SystemTime::now());
        let pem = encode_certificate(&ca);
        let cut = &pem[..pem.len() / 2];
        assert!(decode_certificate(cut).is_err());
    }
}
