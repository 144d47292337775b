//! X.509 certificates as seen by the validator: structured names, validity
//! window, and issuer signature checks.

use std::fmt;

use chrono::{DateTime, Utc};
use der::{Decode, Encode};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Public};
use openssl::sign::Verifier;
use openssl::x509::{X509NameRef, X509};
use serde::Serialize;
use thiserror::Error;

use crate::asn1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("openssl error")]
    OpenSSLError(#[from] openssl::error::ErrorStack),
    #[error("DER decoding error: {0}")]
    Der(#[from] der::Error),
    #[error("certificate is neither PEM nor DER")]
    UnknownEncoding,
}

/// Subject or issuer attributes the reports care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
}

/// A distinguished name, kept both as raw DER and as decoded attributes.
#[derive(Debug, Clone)]
pub struct DistinguishedName {
    der: Vec<u8>,
    info: NameInfo,
    rendered: String,
}

impl DistinguishedName {
    fn new(name: &X509NameRef, der: Vec<u8>) -> Self {
        let info = NameInfo {
            common_name: first_entry(name, Nid::COMMONNAME),
            organization: first_entry(name, Nid::ORGANIZATIONNAME),
            organizational_unit: first_entry(name, Nid::ORGANIZATIONALUNITNAME),
            country: first_entry(name, Nid::COUNTRYNAME),
            state: first_entry(name, Nid::STATEORPROVINCENAME),
            locality: first_entry(name, Nid::LOCALITYNAME),
            serial_number: first_entry(name, Nid::SERIALNUMBER),
            email: first_entry(name, Nid::PKCS9_EMAILADDRESS),
            surname: first_entry(name, Nid::SURNAME),
            given_name: first_entry(name, Nid::GIVENNAME),
        };

        let rendered = name
            .entries()
            .filter_map(|entry| {
                let key = entry.object().nid().short_name().unwrap_or("?");
                let value = entry.data().as_utf8().ok()?;
                Some(format!("{key}={value}"))
            })
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            der,
            info,
            rendered,
        }
    }

    pub fn info(&self) -> &NameInfo {
        &self.info
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn common_name(&self) -> Option<&str> {
        self.info.common_name.as_deref()
    }

    /// CN if present, otherwise O, otherwise the whole name.
    pub fn display_name(&self) -> String {
        self.info
            .common_name
            .clone()
            .or_else(|| self.info.organization.clone())
            .unwrap_or_else(|| self.rendered.clone())
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// The first entry with the given NID, as UTF-8.
fn first_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    let entry = name.entries_by_nid(nid).next()?;
    Some(entry.data().as_utf8().ok()?.to_string())
}

/// How two names were found to be equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatch {
    Der,
    CommonName,
    Attributes,
}

/// Three level comparison: identical DER, identical CN, or compatible
/// {CN, O, C} attributes where only a conflicting O or C rules a match out.
pub fn names_match(a: &DistinguishedName, b: &DistinguishedName) -> Option<NameMatch> {
    if a.der == b.der {
        return Some(NameMatch::Der);
    }

    let (Some(cn_a), Some(cn_b)) = (a.common_name(), b.common_name()) else {
        return None;
    };
    if cn_a == cn_b {
        return Some(NameMatch::CommonName);
    }

    // Same attributes modulo case and surrounding blanks.
    let loose_eq = |x: &str, y: &str| x.trim().to_lowercase() == y.trim().to_lowercase();
    if !loose_eq(cn_a, cn_b) {
        return None;
    }
    for (x, y) in [
        (&a.info.organization, &b.info.organization),
        (&a.info.country, &b.info.country),
    ] {
        if let (Some(x), Some(y)) = (x, y) {
            if !loose_eq(x, y) {
                return None;
            }
        }
    }
    Some(NameMatch::Attributes)
}

#[derive(Error, Debug)]
pub enum SignatureCheckError {
    #[error("unsupported issuer key type {0}")]
    UnsupportedKey(String),
    #[error("signature does not verify with the issuer key")]
    Mismatch,
    #[error("malformed certificate: {0}")]
    Malformed(String),
    #[error("openssl error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
}

#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    x509: X509,
    parsed: x509_cert::Certificate,
    subject: DistinguishedName,
    issuer: DistinguishedName,
    serial_hex: String,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject.rendered)
            .field("issuer", &self.issuer.rendered)
            .field("serial", &self.serial_hex)
            .finish()
    }
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let parsed = x509_cert::Certificate::from_der(der)?;
        let x509 = X509::from_der(der)?;
        let subject = DistinguishedName::new(
            x509.subject_name(),
            parsed.tbs_certificate.subject.to_der()?,
        );
        let issuer = DistinguishedName::new(
            x509.issuer_name(),
            parsed.tbs_certificate.issuer.to_der()?,
        );
        let serial_hex = x509.serial_number().to_bn()?.to_hex_str()?.to_string();

        Ok(Self {
            der: der.to_vec(),
            x509,
            parsed,
            subject,
            issuer,
            serial_hex,
        })
    }

    pub fn from_x509(x509: &X509) -> Result<Self, Error> {
        Self::from_der(&x509.to_der()?)
    }

    /// Accepts either a PEM block or raw DER.
    pub fn from_pem_or_der(bytes: &[u8]) -> Result<Self, Error> {
        if let Ok(x509) = X509::from_pem(bytes) {
            return Self::from_x509(&x509);
        }
        if bytes.first() == Some(&asn1::TAG_SEQUENCE) {
            return Self::from_der(bytes);
        }
        Err(Error::UnknownEncoding)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    /// Upper case hexadecimal serial number.
    pub fn serial_hex(&self) -> &str {
        &self.serial_hex
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        to_datetime(&self.parsed.tbs_certificate.validity.not_before)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        to_datetime(&self.parsed.tbs_certificate.validity.not_after)
    }

    pub fn is_self_signed(&self) -> bool {
        names_match(&self.subject, &self.issuer).is_some()
    }

    pub fn public_key(&self) -> Result<PKey<Public>, openssl::error::ErrorStack> {
        self.x509.public_key()
    }

    /// Same certificate, regardless of where it was loaded from.
    pub fn same_as(&self, other: &Certificate) -> bool {
        self.der == other.der
    }

    /// Checks that `issuer`'s key produced this certificate's signature.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<(), SignatureCheckError> {
        let key = issuer.public_key()?;
        let key_id = key.id();
        if key_id != Id::RSA && key_id != Id::EC {
            return Err(SignatureCheckError::UnsupportedKey(format!("{key_id:?}")));
        }

        let oid = self.parsed.signature_algorithm.oid.to_string();
        let digest = digest_for_signature_algorithm(&oid)?;
        let tbs = asn1::tbs_certificate(&self.der)
            .ok_or_else(|| SignatureCheckError::Malformed("no tbsCertificate".into()))?;
        let signature = self
            .parsed
            .signature
            .as_bytes()
            .ok_or_else(|| SignatureCheckError::Malformed("unaligned signature".into()))?;

        let mut verifier = Verifier::new(digest, &key)?;
        verifier.update(tbs)?;
        // OpenSSL reports a malformed signature as an error instead of `false`.
        match verifier.verify(signature) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(SignatureCheckError::Mismatch),
        }
    }
}

fn to_datetime(time: &x509_cert::time::Time) -> DateTime<Utc> {
    let secs = time.to_unix_duration().as_secs() as i64;
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Digest named by an RSA PKCS #1 v1.5 or ECDSA signature algorithm OID.
/// Unknown algorithms fall back to SHA-256.
fn digest_for_signature_algorithm(oid: &str) -> Result<MessageDigest, SignatureCheckError> {
    Ok(match oid {
        "1.2.840.113549.1.1.5" | "1.2.840.10045.4.1" => MessageDigest::sha1(),
        "1.2.840.113549.1.1.14" | "1.2.840.10045.4.3.1" => MessageDigest::sha224(),
        "1.2.840.113549.1.1.11" | "1.2.840.10045.4.3.2" => MessageDigest::sha256(),
        "1.2.840.113549.1.1.12" | "1.2.840.10045.4.3.3" => MessageDigest::sha384(),
        "1.2.840.113549.1.1.13" | "1.2.840.10045.4.3.4" => MessageDigest::sha512(),
        "1.2.840.113549.1.1.10" => {
            return Err(SignatureCheckError::UnsupportedKey("RSASSA-PSS".into()))
        }
        _ => MessageDigest::sha256(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CertSpec, TestPki};

    #[test]
    fn subject_fields_and_serial() {
        let pki = TestPki::new("CA-Test");
        let leaf = pki.issue(CertSpec::leaf("Alice Example").serial(0x1A2B));
        let cert = Certificate::from_x509(&leaf.cert).unwrap();

        assert_eq!(cert.subject().common_name(), Some("Alice Example"));
        assert_eq!(cert.subject().info().organization.as_deref(), Some("Example Org"));
        assert_eq!(cert.subject().info().country.as_deref(), Some("EC"));
        assert_eq!(cert.issuer().common_name(), Some("CA-Test"));
        assert_eq!(cert.serial_hex(), "1A2B");
        assert!(!cert.is_self_signed());
        assert!(cert.not_before() < cert.not_after());
    }

    #[test]
    fn signature_verification() {
        let pki = TestPki::new("CA-Test");
        let other = TestPki::new("CA-Other");
        let leaf = pki.issue(CertSpec::leaf("Bob"));
        let leaf = Certificate::from_x509(&leaf.cert).unwrap();
        let ca = Certificate::from_x509(&pki.ca_cert).unwrap();
        let other_ca = Certificate::from_x509(&other.ca_cert).unwrap();

        assert!(leaf.verify_signed_by(&ca).is_ok());
        assert!(matches!(
            leaf.verify_signed_by(&other_ca),
            Err(SignatureCheckError::Mismatch)
        ));
        assert!(ca.is_self_signed());
        assert!(ca.verify_signed_by(&ca).is_ok());
    }

    #[test]
    fn ec_issuer() {
        let pki = TestPki::new_ec("CA-EC");
        let leaf = pki.issue(CertSpec::leaf("Carol"));
        let leaf = Certificate::from_x509(&leaf.cert).unwrap();
        let ca = Certificate::from_x509(&pki.ca_cert).unwrap();
        assert!(leaf.verify_signed_by(&ca).is_ok());
    }

    #[test]
    fn name_levels() {
        let a = TestPki::new("CA-Names");
        let b = TestPki::with_org("CA-Names", "Another Org");
        let c = TestPki::new("ca-names ");
        let a = Certificate::from_x509(&a.ca_cert).unwrap();
        let b = Certificate::from_x509(&b.ca_cert).unwrap();
        let c = Certificate::from_x509(&c.ca_cert).unwrap();

        assert_eq!(names_match(a.subject(), a.subject()), Some(NameMatch::Der));
        assert_eq!(
            names_match(a.subject(), b.subject()),
            Some(NameMatch::CommonName)
        );
        assert_eq!(
            names_match(a.subject(), c.subject()),
            Some(NameMatch::Attributes)
        );

        let d = TestPki::with_org("ca-names", "Another Org");
        let d = Certificate::from_x509(&d.ca_cert).unwrap();
        assert_eq!(names_match(a.subject(), d.subject()), None);
    }

    #[test]
    fn pem_and_der_input() {
        let pki = TestPki::new("CA-Encoding");
        let pem = pki.ca_cert.to_pem().unwrap();
        let der = pki.ca_cert.to_der().unwrap();
        let from_pem = Certificate::from_pem_or_der(&pem).unwrap();
        let from_der = Certificate::from_pem_or_der(&der).unwrap();
        assert!(from_pem.same_as(&from_der));
        assert!(matches!(
            Certificate::from_pem_or_der(b"not a certificate"),
            Err(Error::UnknownEncoding)
        ));
    }
}
