//! The CA pool: trusted authorities plus the certificate blocklist.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use ipnet::Ipv4Net;

use crate::{CertResult, Certificate, CertificateError, Fingerprint};

/// The set of certificate authorities trusted for a node's network,
/// together with the fingerprints of individually banned certificates.
///
/// A pool is immutable once built; configuration reload replaces the whole
/// pool atomically.
#[derive(Debug, Clone, Default)]
pub struct CaPool {
    /// Trusted CA certificates, keyed by fingerprint.
    cas: HashMap<Fingerprint, Certificate>,
    /// Fingerprints of certificates that must be rejected regardless of
    /// their chain.
    blocklist: HashSet<Fingerprint>,
}

impl CaPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        CaPool::default()
    }

    /// Add a trusted CA certificate.
    ///
    /// The certificate must be a CA and must carry a valid self-signature;
    /// expired CAs may be added (they are needed to verify still-live leaf
    /// certificates' history and produce precise errors), but verification
    /// against them fails.
    pub fn add_ca(&mut self, cert: Certificate) -> CertResult<()> {
        if !cert.details().is_ca() {
            return Err(CertificateError::NotCA);
        }
        if cert.details().issuer().is_some() {
            return Err(CertificateError::NotSelfSigned);
        }
        cert.check_signature(cert.details().public_key())
            .map_err(|_| CertificateError::NotSelfSigned)?;
        self.cas.insert(cert.fingerprint(), cert);
        Ok(())
    }

    /// Add a fingerprint to the blocklist.
    pub fn block(&mut self, fingerprint: Fingerprint) {
        self.blocklist.insert(fingerprint);
    }

    /// Return true if `cert` is individually blocklisted.
    pub fn is_blocklisted(&self, cert: &Certificate) -> bool {
        self.blocklist.contains(&cert.fingerprint())
    }

    /// Look up a CA by fingerprint.
    pub fn ca(&self, fingerprint: &Fingerprint) -> Option<&Certificate> {
        self.cas.get(fingerprint)
    }

    /// Return an iterator over the trusted CAs.
    pub fn cas(&self) -> impl Iterator<Item = &Certificate> {
        self.cas.values()
    }

    /// Fully verify a peer certificate at time `now`:
    /// blocklist, issuer lookup, CA and leaf timeliness, signature, and
    /// the constraint subsets (ips, subnets, groups each within the CA's).
    pub fn verify(&self, cert: &Certificate, now: SystemTime) -> CertResult<()> {
        if self.is_blocklisted(cert) {
            return Err(CertificateError::Blocklisted);
        }
        let issuer = cert.details().issuer().ok_or(CertificateError::UnknownIssuer)?;
        let ca = self.ca(issuer).ok_or(CertificateError::UnknownIssuer)?;

        match ca.check_timely(now) {
            Err(CertificateError::Expired) => return Err(CertificateError::RootExpired),
            Err(CertificateError::NotYetValid) => return Err(CertificateError::RootNotYetValid),
            other => other?,
        }
        cert.check_timely(now)?;
        cert.check_signature(ca.details().public_key())?;
        check_constraints(cert, ca)
    }
}

/// Check that a leaf certificate's assignments stay within its CA's.
///
/// An empty list on the CA leaves that dimension unconstrained.
fn check_constraints(cert: &Certificate, ca: &Certificate) -> CertResult<()> {
    let ca_nets: Vec<Ipv4Net> = ca
        .details()
        .ips()
        .iter()
        .chain(ca.details().subnets().iter())
        .copied()
        .collect();
    if !ca_nets.is_empty() {
        for ip in cert.details().ips() {
            if !ca_nets.iter().any(|net| contains_net(net, ip)) {
                return Err(CertificateError::FieldOutsideCA {
                    field: "an ip assignment",
                    entry: ip.to_string(),
                });
            }
        }
        for subnet in cert.details().subnets() {
            if !ca_nets.iter().any(|net| contains_net(net, subnet)) {
                return Err(CertificateError::FieldOutsideCA {
                    field: "a subnet assignment",
                    entry: subnet.to_string(),
                });
            }
        }
    }
    if !ca.details().groups().is_empty() {
        for group in cert.details().groups() {
            if !ca.details().groups().contains(group) {
                return Err(CertificateError::FieldOutsideCA {
                    field: "a group assignment",
                    entry: group.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Return true if `outer` wholly contains `inner`.
fn contains_net(outer: &Ipv4Net, inner: &Ipv4Net) -> bool {
    outer.prefix_len() <= inner.prefix_len() && outer.contains(&inner.network())
        && outer.contains(&inner.broadcast())
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
    use crate::{CertificateDetails, Fingerprint};
    use nebula_crypto::pk::SigningKeypair;
    use nebula_crypto::Curve;
    use std::time::Duration;

    /// A CA plus a leaf signed by it, with the given leaf network.
    fn ca_and_leaf(
        now: SystemTime,
        ca_net: &str,
        leaf_net: &str,
    ) -> (CaPool, Certificate) {
        let mut rng = rand::thread_rng();
        let ca_key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let ca_details = CertificateDetails::builder("ca")
            .ip(ca_net.parse().unwrap())
            .valid(now - Duration::from_secs(1), now + Duration::from_secs(3600))
            .build();
        let ca = Certificate::self_sign(ca_details, &ca_key);

        let leaf_key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let leaf_details = CertificateDetails::builder("leaf")
            .ip(leaf_net.parse().unwrap())
            .valid(now, now + Duration::from_secs(1800))
            .public_key(leaf_key.curve(), &leaf_key.public_bytes())
            .build();
        let leaf = Certificate::sign_with_ca(leaf_details, &ca, &ca_key);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        (pool, leaf)
    }

    #[test]
    fn verify_good_leaf() {
        let now = SystemTime::now();
        let (pool, leaf) = ca_and_leaf(now, "10.0.0.0/16", "10.0.3.1/24");
        pool.verify(&leaf, now).unwrap();
    }

    #[test]
    fn ip_outside_ca_names_the_cidr() {
        let now = SystemTime::now();
        let (pool, leaf) = ca_and_leaf(now, "10.0.0.0/16", "10.1.0.1/24");
        let err = pool.verify(&leaf, now).unwrap_err();
        assert!(err.to_string().contains("10.1.0.1/24"), "{err}");
    }

    #[test]
    fn expired_root_is_reported_as_such() {
        let now = SystemTime::now();
        let (pool, leaf) = ca_and_leaf(now, "10.0.0.0/16", "10.0.3.1/24");
        let err = pool
            .verify(&leaf, now + Duration::from_secs(7200))
            .unwrap_err();
        assert_eq!(err.to_string(), "root certificate is expired");
    }

    #[test]
    fn blocklist_bars_a_leaf() {
        let now = SystemTime::now();
        let (mut pool, leaf) = ca_and_leaf(now, "10.0.0.0/16", "10.0.3.1/24");
        pool.block(leaf.fingerprint());
        let err = pool.verify(&leaf, now).unwrap_err();
        assert_eq!(err.to_string(), "certificate is in the block list");
    }

    #[test]
    fn unknown_issuer_is_rejected() {
        let now = SystemTime::now();
        let (_pool, leaf) = ca_and_leaf(now, "10.0.0.0/16", "10.0.3.1/24");
        let empty = CaPool::new();
        assert!(matches!(
            empty.verify(&leaf, now),
            Err(CertificateError::UnknownIssuer)
        ));
    }

    #[test]
    fn non_ca_cannot_join_pool() {
        let now = SystemTime::now();
        let (pool, leaf) = ca_and_leaf(now, "10.0.0.0/16", "10.0.3.1/24");
        drop(pool);
        let mut fresh = CaPool::new();
        assert!(matches!(
            fresh.add_ca(leaf),
            Err(CertificateError::NotCA)
        ));
    }

    #[test]
    fn group_constraint_enforced() {
        let now = SystemTime::now();
        let mut rng = rand::thread_rng();
        let ca_key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let ca = Certificate::self_sign(
            CertificateDetails::builder("ca")
                .group("ops")
                .valid(now, now + Duration::from_secs(3600))
                .build(),
            &ca_key,
        );
        let leaf_key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let leaf = Certificate::sign_with_ca(
            CertificateDetails::builder("leaf")
                .group("dev")
                .valid(now, now + Duration::from_secs(60))
                .public_key(leaf_key.curve(), &leaf_key.public_bytes())
                .build(),
            &ca,
            &ca_key,
        );
        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        let err = pool.verify(&leaf, now).unwrap_err();
        assert!(err.to_string().contains("dev"), "{err}");
    }

    #[test]
    fn blocklist_parses_hex() {
        let fp = Fingerprint([0xAB; 32]);
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
        assert!(Fingerprint::from_hex("xyz").is_none());
    }
}
