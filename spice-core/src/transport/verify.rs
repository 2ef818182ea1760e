//! Host certificate verification policy.
//!
//! rustls validates the chain against the configured roots; the result
//! of that check (`chain_ok`) is then combined with the leaf checks
//! enabled in [`VerifyOps`]:
//!
//! - chain invalid: only an exact public-key match can still authorize.
//! - chain valid: authorize if any enabled check succeeds, tried as
//!   public key, then hostname, then subject.

use std::net::IpAddr;
use std::sync::Arc;

use bitflags::bitflags;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;

use crate::error::SpiceError;

bitflags! {
    /// Leaf checks a host verification policy may enable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VerifyOps: u32 {
        const PUBKEY   = 1 << 0;
        const HOSTNAME = 1 << 1;
        const SUBJECT  = 1 << 2;
    }
}

// ── Policy ───────────────────────────────────────────────────────

/// What the leaf certificate must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAuthOptions {
    pub verify: VerifyOps,
    /// DER SubjectPublicKeyInfo expected for [`VerifyOps::PUBKEY`].
    pub host_pubkey: Vec<u8>,
    /// `(field, value)` pairs expected for [`VerifyOps::SUBJECT`].
    pub host_subject: Vec<(String, String)>,
    /// PEM bundle of trusted roots. No roots means no chain is trusted.
    pub ca_file: Option<std::path::PathBuf>,
}

impl HostAuthOptions {
    /// Parse and store a subject string such as `C=IL,O=Example,CN=host`.
    pub fn set_cert_subject(&mut self, subject: &str) -> Result<(), SpiceError> {
        self.host_subject = parse_subject(subject)?;
        Ok(())
    }
}

/// The parts of a leaf certificate the policy looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafInfo {
    pub spki: Vec<u8>,
    pub dns_names: Vec<String>,
    pub ip_addrs: Vec<IpAddr>,
    pub common_names: Vec<String>,
    pub subject: Vec<(String, String)>,
}

impl LeafInfo {
    pub fn parse(der: &[u8]) -> Result<Self, SpiceError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| SpiceError::TlsVerifyFailed(format!("unparsable certificate: {e}")))?;

        let mut info = LeafInfo {
            spki: cert.public_key().raw.to_vec(),
            ..Default::default()
        };

        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => info.dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            info.ip_addrs.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        for attr in cert.subject().iter_attributes() {
            let Ok(value) = attr.as_str() else { continue };
            let oid = attr.attr_type().to_id_string();
            let field = field_for_oid(&oid).map(str::to_string).unwrap_or(oid);
            if field == "CN" {
                info.common_names.push(value.to_string());
            }
            info.subject.push((field, value.to_string()));
        }
        Ok(info)
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Why a certificate was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The chain did not verify and no public-key pin rescued it.
    UntrustedChain,
    /// The chain verified but no enabled leaf check matched.
    NoMatch,
}

/// Decide whether a server certificate is acceptable for `host`.
pub fn authorize(
    options: &HostAuthOptions,
    host: &str,
    chain_ok: bool,
    leaf: &LeafInfo,
) -> Result<(), Rejection> {
    let ops = options.verify;
    let pubkey_ok = ops.contains(VerifyOps::PUBKEY)
        && !options.host_pubkey.is_empty()
        && options.host_pubkey == leaf.spki;

    if !chain_ok {
        return if pubkey_ok { Ok(()) } else { Err(Rejection::UntrustedChain) };
    }
    if ops.is_empty() || pubkey_ok {
        return Ok(());
    }
    if ops.contains(VerifyOps::HOSTNAME) && leaf_matches_host(leaf, host) {
        return Ok(());
    }
    if ops.contains(VerifyOps::SUBJECT)
        && !options.host_subject.is_empty()
        && subject_matches(&options.host_subject, &leaf.subject)
    {
        return Ok(());
    }
    Err(Rejection::NoMatch)
}

/// Hostname check against alt names, falling back to the common name
/// only when the certificate carries no dNSName entry.
pub fn leaf_matches_host(leaf: &LeafInfo, host: &str) -> bool {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return leaf.ip_addrs.contains(&ip);
    }
    if !leaf.dns_names.is_empty() {
        return leaf.dns_names.iter().any(|p| hostname_matches(p, host));
    }
    leaf.common_names.iter().any(|p| hostname_matches(p, host))
}

/// RFC 2818 style match. A `*` in the leftmost label matches within
/// exactly one label; comparison is case-insensitive.
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    let mut p_labels = pattern.split('.');
    let mut h_labels = host.split('.');
    let (Some(p_first), Some(h_first)) = (p_labels.next(), h_labels.next()) else {
        return false;
    };
    let p_rest: Vec<&str> = p_labels.collect();
    let h_rest: Vec<&str> = h_labels.collect();
    if p_rest != h_rest {
        return false;
    }

    match p_first.split_once('*') {
        None => p_first == h_first,
        Some((prefix, suffix)) => {
            // A bare "*.tld" would match far too much.
            if p_rest.len() < 2 || suffix.contains('*') {
                return false;
            }
            h_first.len() >= prefix.len() + suffix.len()
                && h_first.starts_with(prefix)
                && h_first.ends_with(suffix)
        }
    }
}

/// Order-independent multiset comparison of `(field, value)` pairs.
pub fn subject_matches(expected: &[(String, String)], actual: &[(String, String)]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    let mut remaining: Vec<&(String, String)> = actual.iter().collect();
    for want in expected {
        match remaining.iter().position(|have| *have == want) {
            Some(i) => {
                remaining.swap_remove(i);
            }
            None => return false,
        }
    }
    true
}

const SUBJECT_FIELDS: &[(&str, &str)] = &[
    ("C", "2.5.4.6"),
    ("ST", "2.5.4.8"),
    ("L", "2.5.4.7"),
    ("O", "2.5.4.10"),
    ("OU", "2.5.4.11"),
    ("CN", "2.5.4.3"),
    ("emailAddress", "1.2.840.113549.1.9.1"),
    ("DC", "0.9.2342.19200300.100.1.25"),
];

fn field_for_oid(oid: &str) -> Option<&'static str> {
    SUBJECT_FIELDS.iter().find(|(_, o)| *o == oid).map(|(f, _)| *f)
}

fn canonical_field(name: &str) -> Option<&'static str> {
    SUBJECT_FIELDS
        .iter()
        .find(|(f, _)| f.eq_ignore_ascii_case(name))
        .map(|(f, _)| *f)
}

/// Parse `C=IL,O=Example\, Inc,CN=host` into `(field, value)` pairs.
/// `\,` escapes a comma inside a value.
pub fn parse_subject(subject: &str) -> Result<Vec<(String, String)>, SpiceError> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut chars = subject.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(',') => current.push(','),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ',' => entries.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        entries.push(current);
    }

    entries
        .into_iter()
        .map(|entry| {
            let (field, value) = entry
                .split_once('=')
                .ok_or_else(|| SpiceError::Encoding(format!("subject entry without '=': {entry}")))?;
            let field = field.trim();
            let field = canonical_field(field)
                .ok_or_else(|| SpiceError::Encoding(format!("unknown subject field {field}")))?;
            let value = value.trim();
            if value.is_empty() {
                return Err(SpiceError::Encoding(format!("empty value for {field}")));
            }
            Ok((field.to_string(), value.to_string()))
        })
        .collect()
}

// ── rustls verifier ──────────────────────────────────────────────

/// `ServerCertVerifier` applying [`authorize`] on top of chain
/// validation.
#[derive(Debug)]
pub struct HostVerifier {
    roots: Arc<RootCertStore>,
    options: HostAuthOptions,
    host: String,
    provider: Arc<CryptoProvider>,
}

impl HostVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        options: HostAuthOptions,
        host: impl Into<String>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            roots,
            options,
            host: host.into(),
            provider,
        }
    }

    fn chain_ok(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> bool {
        if self.roots.is_empty() {
            return false;
        }
        let Ok(parsed) = rustls::server::ParsedCertificate::try_from(end_entity) else {
            return false;
        };
        match rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        ) {
            Ok(()) => true,
            Err(e) => {
                debug!(host = %self.host, "certificate chain rejected: {e}");
                false
            }
        }
    }
}

impl ServerCertVerifier for HostVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain_ok = self.chain_ok(end_entity, intermediates, now);
        let leaf = LeafInfo::parse(end_entity.as_ref()).map_err(|e| {
            warn!(host = %self.host, "{e}");
            rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
        })?;

        match authorize(&self.options, &self.host, chain_ok, &leaf) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(Rejection::UntrustedChain) => {
                warn!(host = %self.host, "untrusted certificate chain");
                Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
            }
            Err(Rejection::NoMatch) => {
                warn!(host = %self.host, ops = ?self.options.verify, "certificate does not match host");
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(v: &[(&str, &str)]) -> Vec<(String, String)> {
        v.iter().map(|(f, x)| (f.to_string(), x.to_string())).collect()
    }

    #[test]
    fn wildcard_matches_one_label() {
        assert!(hostname_matches("*.example.com", "foo.example.com"));
        assert!(!hostname_matches("*.example.com", "foo.bar.example.com"));
        assert!(hostname_matches("example.com", "example.com"));
    }

    #[test]
    fn hostname_is_case_insensitive() {
        assert!(hostname_matches("Host.Example.COM", "host.example.com"));
        assert!(hostname_matches("*.example.com", "FOO.example.com."));
    }

    #[test]
    fn wildcard_edge_cases() {
        assert!(!hostname_matches("*.com", "example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(hostname_matches("f*.example.com", "foo.example.com"));
        assert!(!hostname_matches("f*.example.com", "bar.example.com"));
    }

    #[test]
    fn cn_only_used_without_dns_alt_names() {
        let mut leaf = LeafInfo {
            common_names: vec!["cn.example.com".into()],
            ..Default::default()
        };
        assert!(leaf_matches_host(&leaf, "cn.example.com"));
        leaf.dns_names.push("san.example.com".into());
        assert!(!leaf_matches_host(&leaf, "cn.example.com"));
        assert!(leaf_matches_host(&leaf, "san.example.com"));
    }

    #[test]
    fn ip_hosts_match_ip_alt_names() {
        let leaf = LeafInfo {
            ip_addrs: vec!["10.0.0.1".parse().unwrap()],
            dns_names: vec!["10.0.0.2".into()],
            ..Default::default()
        };
        assert!(leaf_matches_host(&leaf, "10.0.0.1"));
        assert!(!leaf_matches_host(&leaf, "10.0.0.2"));
    }

    #[test]
    fn subject_parsing_handles_escapes() {
        let parsed = parse_subject("C=IL, o=Example\\, Inc,CN=host").unwrap();
        assert_eq!(
            parsed,
            pairs(&[("C", "IL"), ("O", "Example, Inc"), ("CN", "host")])
        );
        assert!(parse_subject("XX=1").is_err());
        assert!(parse_subject("CN").is_err());
    }

    #[test]
    fn subject_match_is_an_order_independent_multiset() {
        let want = pairs(&[("O", "A"), ("OU", "x"), ("OU", "x")]);
        let have = pairs(&[("OU", "x"), ("O", "A"), ("OU", "x")]);
        assert!(subject_matches(&want, &have));

        let have = pairs(&[("OU", "x"), ("O", "A"), ("OU", "y")]);
        assert!(!subject_matches(&want, &have));
        assert!(!subject_matches(&want, &have[..2]));
    }

    #[test]
    fn untrusted_chain_needs_pubkey_pin() {
        let leaf = LeafInfo {
            spki: vec![1, 2, 3],
            dns_names: vec!["host".into()],
            ..Default::default()
        };
        let mut opts = HostAuthOptions {
            verify: VerifyOps::HOSTNAME,
            ..Default::default()
        };
        assert_eq!(authorize(&opts, "host", false, &leaf), Err(Rejection::UntrustedChain));

        opts.verify |= VerifyOps::PUBKEY;
        opts.host_pubkey = vec![1, 2, 3];
        assert_eq!(authorize(&opts, "host", false, &leaf), Ok(()));
    }

    #[test]
    fn trusted_chain_accepts_any_enabled_check() {
        let leaf = LeafInfo {
            spki: vec![9],
            dns_names: vec!["other".into()],
            subject: pairs(&[("CN", "other")]),
            ..Default::default()
        };
        let mut opts = HostAuthOptions {
            verify: VerifyOps::HOSTNAME | VerifyOps::SUBJECT,
            host_subject: pairs(&[("CN", "other")]),
            ..Default::default()
        };
        assert_eq!(authorize(&opts, "host", true, &leaf), Ok(()));

        opts.host_subject = pairs(&[("CN", "host")]);
        assert_eq!(authorize(&opts, "host", true, &leaf), Err(Rejection::NoMatch));

        opts.verify = VerifyOps::empty();
        assert_eq!(authorize(&opts, "host", true, &leaf), Ok(()));
    }
}
