#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod err;
pub mod key;
pub mod pem;
mod pool;
mod proto;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use ipnet::Ipv4Net;
use prost::Message;
use sha2::{Digest, Sha256};

use nebula_crypto::pk::SigningKeypair;
use nebula_crypto::Curve;

pub use err::{CertificateError, PemError};
pub use pool::CaPool;

/// A Result defined to use CertificateError.
type CertResult<T> = std::result::Result<T, CertificateError>;

/// SHA-256 digest of a certificate's encoded detail block.
///
/// Fingerprints identify certificates in the blocklist, name issuing CAs,
/// and break ties between racing handshakes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::exhaustive_structs)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Return the fingerprint as lowercase hex, the form used in
    /// configuration files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a fingerprint from its hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Fingerprint(arr))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The signed detail block of a certificate: everything the signature
/// covers.
#[derive(Debug, Clone)]
pub struct CertificateDetails {
    /// Node or CA name.
    name: String,
    /// Overlay networks assigned to the subject.  The first entry's address
    /// is the node's primary overlay address.
    ips: Vec<Ipv4Net>,
    /// Unsafe-route subnets the subject may announce.
    subnets: Vec<Ipv4Net>,
    /// Group memberships, as matched by firewall rules.
    groups: Vec<String>,
    /// Start of the validity window.
    not_before: SystemTime,
    /// End of the validity window.
    not_after: SystemTime,
    /// The subject's public key, encoded per curve.
    public_key: Vec<u8>,
    /// True for CA certificates.
    is_ca: bool,
    /// Fingerprint of the signing CA; `None` on a self-signed CA cert.
    issuer: Option<Fingerprint>,
    /// Curve suite of `public_key`.
    curve: Curve,
}

impl CertificateDetails {
    /// Start building a detail block for a certificate named `name`.
    pub fn builder(name: &str) -> DetailsBuilder {
        DetailsBuilder {
            details: CertificateDetails {
                name: name.to_owned(),
                ips: Vec::new(),
                subnets: Vec::new(),
                groups: Vec::new(),
                not_before: SystemTime::UNIX_EPOCH,
                not_after: SystemTime::UNIX_EPOCH,
                public_key: Vec::new(),
                is_ca: false,
                issuer: None,
                curve: Curve::Curve25519,
            },
        }
    }

    /// Return the certificate's name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Return the overlay networks assigned to the subject.
    pub fn ips(&self) -> &[Ipv4Net] {
        &self.ips
    }
    /// Return the node's primary overlay address, if it has one.
    ///
    /// CA certificates commonly have none.
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.ips.first().map(|n| n.addr())
    }
    /// Return the permitted subnets.
    pub fn subnets(&self) -> &[Ipv4Net] {
        &self.subnets
    }
    /// Return the group memberships.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }
    /// Return the start of the validity window.
    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }
    /// Return the end of the validity window.
    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }
    /// Return the subject public key bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
    /// Return true if this is a CA certificate.
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }
    /// Return the issuer fingerprint, if the certificate names one.
    pub fn issuer(&self) -> Option<&Fingerprint> {
        self.issuer.as_ref()
    }
    /// Return the curve suite of the subject key.
    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Encode this detail block to its protobuf form.
    fn encode(&self) -> Vec<u8> {
        /// Flatten nets into the (address, mask) pair encoding.
        fn nets_to_pairs(nets: &[Ipv4Net]) -> Vec<u32> {
            let mut out = Vec::with_capacity(nets.len() * 2);
            for n in nets {
                out.push(u32::from(n.addr()));
                out.push(u32::from(n.netmask()));
            }
            out
        }
        let raw = proto::RawCertificateDetails {
            name: self.name.clone(),
            ips: nets_to_pairs(&self.ips),
            subnets: nets_to_pairs(&self.subnets),
            groups: self.groups.clone(),
            not_before: unix_seconds(self.not_before),
            not_after: unix_seconds(self.not_after),
            public_key: self.public_key.clone(),
            is_ca: self.is_ca,
            issuer: self.issuer.map(|f| f.0.to_vec()).unwrap_or_default(),
            curve: match self.curve {
                Curve::Curve25519 => proto::RawCurve::Curve25519 as i32,
                Curve::P256 => proto::RawCurve::P256 as i32,
            },
        };
        raw.encode_to_vec()
    }

    /// Decode a detail block from its protobuf form.
    fn decode(bytes: &[u8]) -> CertResult<Self> {
        /// Rebuild nets from the (address, mask) pair encoding.
        fn pairs_to_nets(pairs: &[u32]) -> CertResult<Vec<Ipv4Net>> {
            if pairs.len() % 2 != 0 {
                return Err(CertificateError::Decode(
                    "odd-length ip pair list".to_owned(),
                ));
            }
            pairs
                .chunks_exact(2)
                .map(|pair| {
                    let addr = Ipv4Addr::from(pair[0]);
                    let prefix = mask_to_prefix(pair[1])?;
                    Ipv4Net::new(addr, prefix)
                        .map_err(|_| CertificateError::Decode("bad prefix length".to_owned()))
                })
                .collect()
        }
        let raw = proto::RawCertificateDetails::decode(bytes)?;
        let curve = match proto::RawCurve::try_from(raw.curve) {
            Ok(proto::RawCurve::Curve25519) => Curve::Curve25519,
            Ok(proto::RawCurve::P256) => Curve::P256,
            Err(_) => return Err(CertificateError::UnsupportedVersion),
        };
        let issuer = if raw.issuer.is_empty() {
            None
        } else {
            let arr: [u8; 32] = raw
                .issuer
                .try_into()
                .map_err(|_| CertificateError::Decode("bad issuer fingerprint".to_owned()))?;
            Some(Fingerprint(arr))
        };
        Ok(CertificateDetails {
            name: raw.name,
            ips: pairs_to_nets(&raw.ips)?,
            subnets: pairs_to_nets(&raw.subnets)?,
            groups: raw.groups,
            not_before: from_unix_seconds(raw.not_before),
            not_after: from_unix_seconds(raw.not_after),
            public_key: raw.public_key,
            is_ca: raw.is_ca,
            issuer,
            curve,
        })
    }
}

/// Builder for a [`CertificateDetails`].
#[derive(Debug, Clone)]
pub struct DetailsBuilder {
    /// The detail block being accumulated.
    details: CertificateDetails,
}

impl DetailsBuilder {
    /// Assign an overlay network to the subject.  The first call sets the
    /// node's primary overlay address.
    pub fn ip(mut self, net: Ipv4Net) -> Self {
        self.details.ips.push(net);
        self
    }
    /// Permit a subnet.
    pub fn subnet(mut self, net: Ipv4Net) -> Self {
        self.details.subnets.push(net);
        self
    }
    /// Add a group membership.
    pub fn group(mut self, group: &str) -> Self {
        self.details.groups.push(group.to_owned());
        self
    }
    /// Set the validity window.
    pub fn valid(mut self, not_before: SystemTime, not_after: SystemTime) -> Self {
        self.details.not_before = not_before;
        self.details.not_after = not_after;
        self
    }
    /// Set the subject public key and its curve.
    pub fn public_key(mut self, curve: Curve, key: &[u8]) -> Self {
        self.details.curve = curve;
        self.details.public_key = key.to_vec();
        self
    }
    /// Mark the certificate as a CA certificate.
    pub fn ca(mut self) -> Self {
        self.details.is_ca = true;
        self
    }
    /// Finish building.
    pub fn build(self) -> CertificateDetails {
        self.details
    }
}

/// A certificate: a signed detail block, retaining the exact bytes that
/// were signed.
///
/// Decoding performs structural validation only.  Verifying a peer
/// certificate against a CA pool (signature, timeliness, constraint
/// subsets, blocklist) is [`CaPool::verify`]'s job; a certificate that has
/// merely been decoded must not be trusted.
#[derive(Debug, Clone)]
pub struct Certificate {
    /// The parsed detail block.
    details: CertificateDetails,
    /// The detail block's encoded form, byte-for-byte as signed.
    raw_details: Vec<u8>,
    /// Signature over `raw_details`.
    signature: Vec<u8>,
}

impl Certificate {
    /// Decode a certificate blob.
    pub fn decode(blob: &[u8]) -> CertResult<Self> {
        let raw = proto::RawCertificate::decode(blob)?;
        let details = CertificateDetails::decode(&raw.details)?;
        if details.public_key.len() != details.curve.public_key_len() {
            return Err(CertificateError::Decode(
                "public key length does not fit curve".to_owned(),
            ));
        }
        Ok(Certificate {
            details,
            raw_details: raw.details,
            signature: raw.signature,
        })
    }

    /// Encode this certificate to its blob form.
    pub fn encode(&self) -> Vec<u8> {
        proto::RawCertificate {
            details: self.raw_details.clone(),
            signature: self.signature.clone(),
        }
        .encode_to_vec()
    }

    /// Sign `details` with `key`, producing a certificate.
    ///
    /// The caller is responsible for having set the issuer fingerprint on
    /// `details` (or left it empty, for a self-signed CA).
    pub fn sign(details: CertificateDetails, key: &SigningKeypair) -> Self {
        let raw_details = details.encode();
        let signature = key.sign(&raw_details);
        Certificate {
            details,
            raw_details,
            signature,
        }
    }

    /// Sign a detail block as a new self-signed CA: the subject key is set
    /// from `key` and no issuer is recorded.
    pub fn self_sign(mut details: CertificateDetails, key: &SigningKeypair) -> Self {
        details.curve = key.curve();
        details.public_key = key.public_bytes();
        details.issuer = None;
        details.is_ca = true;
        Certificate::sign(details, key)
    }

    /// Sign a detail block with a CA, stamping the issuer fingerprint.
    pub fn sign_with_ca(
        mut details: CertificateDetails,
        ca: &Certificate,
        ca_key: &SigningKeypair,
    ) -> Self {
        details.issuer = Some(ca.fingerprint());
        Certificate::sign(details, ca_key)
    }

    /// Return the parsed detail block.
    pub fn details(&self) -> &CertificateDetails {
        &self.details
    }

    /// Return the signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Return the SHA-256 fingerprint of the encoded detail block.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest: [u8; 32] = Sha256::digest(&self.raw_details).into();
        Fingerprint(digest)
    }

    /// Check the signature against a signer's encoded public key.
    pub fn check_signature(&self, signer_public: &[u8]) -> CertResult<()> {
        let ok = nebula_crypto::pk::verify_signature(
            self.details.curve,
            signer_public,
            &self.raw_details,
            &self.signature,
        )?;
        if ok {
            Ok(())
        } else {
            Err(CertificateError::InvalidSignature)
        }
    }

    /// Check that `when` falls inside the validity window.
    pub fn check_timely(&self, when: SystemTime) -> CertResult<()> {
        if when < self.details.not_before {
            Err(CertificateError::NotYetValid)
        } else if when > self.details.not_after {
            Err(CertificateError::Expired)
        } else {
            Ok(())
        }
    }

    /// Return true if the certificate is expired at `when`.
    pub fn is_expired_at(&self, when: SystemTime) -> bool {
        when > self.details.not_after
    }

    /// Return true if the certificate expires within `window` after `now`.
    ///
    /// Used to warn ahead of expiry.
    pub fn expires_within(&self, now: SystemTime, window: Duration) -> bool {
        match self.details.not_after.duration_since(now) {
            Ok(remaining) => remaining <= window,
            Err(_) => true,
        }
    }
}

/// Convert a SystemTime to whole seconds since the epoch.
fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Convert whole seconds since the epoch to a SystemTime.
fn from_unix_seconds(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

/// Convert a contiguous netmask to a prefix length.
fn mask_to_prefix(mask: u32) -> CertResult<u8> {
    let prefix = mask.leading_ones();
    if mask.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(CertificateError::Decode(
            "non-contiguous netmask".to_owned(),
        ));
    }
    Ok(prefix as u8)
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

    /// Make a keypair and self-signed CA valid for an hour around `now`.
    pub(crate) fn test_ca(now: SystemTime) -> (SigningKeypair, Certificate) {
        let mut rng = rand::thread_rng();
        let key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let details = CertificateDetails::builder("test ca")
            .ip("10.0.0.0/16".parse().unwrap())
            .valid(now - Duration::from_secs(1), now + Duration::from_secs(3600))
            .build();
        let cert = Certificate::self_sign(details, &key);
        (key, cert)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let now = SystemTime::now();
        let (_key, ca) = test_ca(now);
        let blob = ca.encode();
        let back = Certificate::decode(&blob).unwrap();
        assert_eq!(back.details().name(), "test ca");
        assert_eq!(back.fingerprint(), ca.fingerprint());
        assert_eq!(back.signature(), ca.signature());
        assert!(back.details().is_ca());
        assert_eq!(back.details().issuer(), None);
    }

    #[test]
    fn signature_survives_roundtrip() {
        let now = SystemTime::now();
        let (key, ca) = test_ca(now);
        let back = Certificate::decode(&ca.encode()).unwrap();
        back.check_signature(&key.public_bytes()).unwrap();
    }

    #[test]
    fn timeliness() {
        let now = SystemTime::now();
        let (_key, ca) = test_ca(now);
        ca.check_timely(now).unwrap();
        assert!(matches!(
            ca.check_timely(now + Duration::from_secs(7200)),
            Err(CertificateError::Expired)
        ));
        assert!(matches!(
            ca.check_timely(now - Duration::from_secs(7200)),
            Err(CertificateError::NotYetValid)
        ));
        assert!(ca.expires_within(now, Duration::from_secs(86400)));
        assert!(!ca.expires_within(now, Duration::from_secs(60)));
    }

    #[test]
    fn fingerprint_covers_details_only() {
        // Re-signing the same details must not change the fingerprint.
        let now = SystemTime::now();
        let mut rng = rand::thread_rng();
        let key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let details = CertificateDetails::builder("node")
            .ip("10.0.0.1/24".parse().unwrap())
            .valid(now, now + Duration::from_secs(60))
            .public_key(key.curve(), &key.public_bytes())
            .build();
        let a = Certificate::sign(details.clone(), &key);
        let b = Certificate::sign(details, &key);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn mask_decoding() {
        assert_eq!(mask_to_prefix(0xFFFF_FF00).unwrap(), 24);
        assert_eq!(mask_to_prefix(0).unwrap(), 0);
        assert_eq!(mask_to_prefix(u32::MAX).unwrap(), 32);
        assert!(mask_to_prefix(0xFF00_FF00).is_err());
    }

    #[test]
    fn primary_ip_is_first() {
        let details = CertificateDetails::builder("n")
            .ip("10.1.2.3/24".parse().unwrap())
            .ip("192.168.0.9/24".parse().unwrap())
            .build();
        assert_eq!(details.primary_ip(), Some("10.1.2.3".parse().unwrap()));
    }
}
