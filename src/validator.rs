//! Signature validation for PDF documents and PKCS #12 credentials.
//!
//! The validator never fails on a bad signature: structural, temporal and
//! chain problems all end up as diagnostics on the returned report.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::certificate::Certificate;
use crate::chain::validate_chain;
use crate::cms::{self, SignDateSource};
use crate::credential::Credential;
use crate::error::CredentialError;
use crate::extract::{self, FoundSignature};
use crate::openssl::verify_detached;
use crate::pdf_fields::{self, RangeError};
use crate::report::{
    CertificateSummary, CredentialReport, Diagnostic, DiagnosticCode, PdfReport, Placement,
    SignerReport,
};
use crate::trust_store::{TrustStore, TrustStoreHandle};

/// Certificates closer than this to their expiry get a warning.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

struct Temporal {
    expired: bool,
    not_yet_valid: bool,
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
}

fn temporal_check(cert: &Certificate, now: DateTime<Utc>) -> Temporal {
    let mut temporal = Temporal {
        expired: now > cert.not_after(),
        not_yet_valid: now < cert.not_before(),
        errors: Vec::new(),
        warnings: Vec::new(),
    };
    if temporal.expired {
        temporal.errors.push(Diagnostic::new(
            DiagnosticCode::Expired,
            format!("certificate expired on {}", cert.not_after().format("%Y-%m-%d")),
        ));
    }
    if temporal.not_yet_valid {
        temporal.errors.push(Diagnostic::new(
            DiagnosticCode::NotYetValid,
            format!(
                "certificate is not valid before {}",
                cert.not_before().format("%Y-%m-%d")
            ),
        ));
    }
    let days_left = (cert.not_after() - now).num_days();
    if !temporal.expired && days_left <= EXPIRY_WARNING_DAYS {
        temporal.warnings.push(Diagnostic::new(
            DiagnosticCode::ExpiringSoon,
            format!("certificate expires in {days_left} day(s)"),
        ));
    }
    temporal
}

#[derive(Clone, Default)]
pub struct Validator {
    trust: TrustStoreHandle,
}

impl Validator {
    pub fn new(trust: TrustStoreHandle) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &TrustStoreHandle {
        &self.trust
    }

    /// Reports every unique signature of the document.
    pub fn validate_pdf(&self, pdf: &[u8]) -> PdfReport {
        let store = self.trust.snapshot();
        let extraction = extract::extract(pdf);

        let placements = if extraction.signatures.is_empty() {
            HashMap::new()
        } else {
            pdf_fields::placements(pdf).unwrap_or_else(|e| {
                log::debug!("AcroForm not usable for placements: {e}");
                HashMap::new()
            })
        };

        let signatures = extraction
            .signatures
            .iter()
            .enumerate()
            .map(|(index, found)| {
                signer_report(index, found, pdf, &store, placements.get(&found.sha256))
            })
            .collect::<Vec<_>>();

        log::info!(
            "{} signature dictionaries, {} unique, {} valid",
            extraction.total_found,
            signatures.len(),
            signatures.iter().filter(|s| s.valid).count()
        );
        PdfReport::new(extraction.total_found, signatures)
    }

    /// Opens a PKCS #12 file and reports on its certificate. A wrong password
    /// or an unreadable file is an error; everything else is a diagnostic.
    pub fn validate_p12(
        &self,
        p12: &[u8],
        password: &str,
    ) -> Result<CredentialReport, CredentialError> {
        let credential = Credential::from_pkcs12(p12, password)?;
        let certificate = credential.certificate()?;
        let chain = credential.chain()?;
        let store = self.trust.snapshot();

        let now = Utc::now();
        let temporal = temporal_check(&certificate, now);
        let chain_validation = validate_chain(&certificate, &chain, &store);

        let temporal_ok = !temporal.expired && !temporal.not_yet_valid;
        let valid = if chain_validation.verified {
            temporal_ok && chain_validation.valid
        } else {
            temporal_ok
        };

        let mut errors = chain_validation.errors.clone();
        errors.extend(temporal.errors);
        let mut warnings = chain_validation.warnings.clone();
        warnings.extend(temporal.warnings);

        let mut details = vec![
            format!("key type: {:?}", credential.private_key.id()),
            format!("additional certificates: {}", chain.len()),
        ];
        match &chain_validation.trusted_ca {
            Some(ca) => details.push(format!("trusted by: {}", ca.name)),
            None if chain_validation.verified => {
                details.push("not trusted by any configured CA".to_string())
            }
            None => details.push("trust store is empty".to_string()),
        }

        Ok(CredentialReport {
            password_correct: true,
            certificate: CertificateSummary {
                subject: certificate.subject().info().clone(),
                issuer: certificate.issuer().info().clone(),
                subject_name: certificate.subject().display_name(),
                issuer_name: certificate.issuer().display_name(),
                serial_number: certificate.serial_hex().to_string(),
                not_before: certificate.not_before(),
                not_after: certificate.not_after(),
                days_until_expiry: (certificate.not_after() - now).num_days(),
            },
            additional_certificates: chain.len(),
            expired: temporal.expired,
            not_yet_valid: temporal.not_yet_valid,
            valid,
            chain_validation,
            errors,
            warnings,
            details,
        })
    }
}

fn signer_report(
    index: usize,
    found: &FoundSignature,
    pdf: &[u8],
    store: &TrustStore,
    placement: Option<&Placement>,
) -> SignerReport {
    let parsed = match cms::parse(&found.cms) {
        Ok(parsed) => parsed,
        Err(e) => {
            let code = match e {
                cms::Error::NotSignedData => DiagnosticCode::NotSignedData,
                _ => DiagnosticCode::Malformed,
            };
            let mut report =
                SignerReport::unparseable(index, found.sha256.clone(), Diagnostic::new(code, e.to_string()));
            report.reason = found.reason.clone();
            report.location = found.location.clone();
            report.placement = placement.cloned();
            return report;
        }
    };

    let signer = &parsed.signer;
    let now = Utc::now();
    let temporal = temporal_check(signer, now);
    let chain_validation = validate_chain(signer, &parsed.additional_certificates, store);

    let mut errors = chain_validation.errors.clone();
    errors.extend(temporal.errors);
    let mut warnings = chain_validation.warnings.clone();
    warnings.extend(temporal.warnings);

    let (sign_date, sign_date_source) = match parsed.signing_time {
        Some(time) => (Some(time), parsed.sign_date_source),
        None => match found.signing_date {
            Some(date) => (Some(date), Some(SignDateSource::PdfDictionary)),
            None => (None, None),
        },
    };

    let (document_intact, covers_whole_document) = match found.byte_range {
        Some(byte_range) => match integrity(pdf, byte_range, found) {
            Ok(covers) => (Some(true), Some(covers)),
            Err(message) => {
                errors.push(Diagnostic::new(DiagnosticCode::IntegrityFail, message));
                (Some(false), Some(false))
            }
        },
        None => (None, None),
    };

    let temporal_ok = !temporal.expired && !temporal.not_yet_valid;
    let mut valid = if chain_validation.verified {
        temporal_ok && chain_validation.valid
    } else {
        temporal_ok
    };
    if document_intact == Some(false) {
        valid = false;
    }

    SignerReport {
        index,
        signer: signer.subject().info().clone(),
        issuer: signer.issuer().info().clone(),
        signer_name: signer.subject().display_name(),
        issuer_name: signer.issuer().display_name(),
        serial_number: signer.serial_hex().to_string(),
        valid_from: Some(signer.not_before()),
        valid_until: Some(signer.not_after()),
        sign_date,
        sign_date_source,
        timestamp_authority: parsed.timestamp_authority,
        reason: found.reason.clone(),
        location: found.location.clone(),
        placement: placement.cloned(),
        document_intact,
        covers_whole_document,
        expired: temporal.expired,
        not_yet_valid: temporal.not_yet_valid,
        valid,
        chain_validation,
        errors,
        warnings,
        cms_sha256: found.sha256.clone(),
    }
}

/// Checks the signature over its byte range. On success, tells whether the
/// range reaches the end of the file.
fn integrity(pdf: &[u8], byte_range: [i64; 4], found: &FoundSignature) -> Result<bool, String> {
    let ranges = pdf_fields::signed_ranges(byte_range, pdf.len()).map_err(|e| e.to_string())?;
    verify_detached(
        &found.cms,
        [&pdf[ranges[0].clone()], &pdf[ranges[1].clone()]],
    )
    .map_err(|e| format!("signature does not match the signed bytes: {e}"))?;

    match pdf_fields::check_coverage(pdf, &ranges, &found.contents) {
        Ok(()) => Ok(ranges[1].end == pdf.len()),
        Err(RangeError::WrongRangeEnd) => Ok(false),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature_image::ImageComposer;
    use crate::signing::{PdfSigner, Position, SigningRequest};
    use crate::test_support::{blank_pdf, make_p12, signature_png, CertSpec, Issued, TestPki};
    use crate::trust_store::CertificateAuthority;

    fn validator_trusting(pkis: &[(&str, &TestPki)]) -> Validator {
        let entries = pkis
            .iter()
            .map(|(name, pki)| {
                CertificateAuthority::new(*name, &pki.ca_cert.to_pem().unwrap(), true).unwrap()
            })
            .collect();
        Validator::new(TrustStoreHandle::new(TrustStore::new(entries)))
    }

    fn sign(pdf: &[u8], issued: &Issued, position: Position, all_pages: bool) -> Vec<u8> {
        let credential = Credential::from_pkcs12(&make_p12(issued, &[], "pw"), "pw").unwrap();
        let image = ImageComposer::default()
            .compose(&signature_png(150, 60), "Aprobado por:", false)
            .unwrap();
        let request = SigningRequest {
            document_id: 11,
            image: &image,
            position,
            sign_all_pages: all_pages,
            role_label: "Aprobado por:",
            email: Some("signer@example.com"),
            city: Some("Cuenca"),
        };
        PdfSigner::default().sign(pdf, &credential, &request).unwrap()
    }

    #[test]
    fn trusted_signature_round_trip() {
        let pki = TestPki::new("CA-Trusted");
        let issued = pki.issue(CertSpec::leaf("Alice Example").serial(4242));
        let signed = sign(&blank_pdf(1), &issued, Position::Left, false);

        let report = validator_trusting(&[("Trusted", &pki)]).validate_pdf(&signed);
        assert!(report.has_signatures);
        assert_eq!(report.unique_signatures, 1);

        let sig = &report.signatures[0];
        assert_eq!(sig.signer.common_name.as_deref(), Some("Alice Example"));
        assert_eq!(sig.serial_number, "1092");
        assert!(sig.valid, "{:?}", sig.errors);
        assert_eq!(sig.chain_validation.trusted_ca.as_ref().unwrap().name, "Trusted");
        assert_eq!(sig.document_intact, Some(true));
        assert_eq!(sig.covers_whole_document, Some(true));
        assert_eq!(sig.sign_date_source, Some(SignDateSource::SigningTime));
        assert_eq!(sig.reason.as_deref(), Some("Firma Digital - Aprobado por:"));
        assert_eq!(sig.location.as_deref(), Some("Cuenca"));
        let placement = sig.placement.as_ref().unwrap();
        assert_eq!(placement.page_index, 0);
        assert_eq!(placement.rect[0], 13.0);
    }

    #[test]
    fn unknown_issuer() {
        let foo = TestPki::new("CA-Foo");
        let configured = TestPki::new("CA-Configured");
        let signed = sign(&blank_pdf(1), &foo.issue(CertSpec::leaf("Eve")), Position::Right, false);

        let report = validator_trusting(&[("Configured", &configured)]).validate_pdf(&signed);
        let sig = &report.signatures[0];
        assert!(!sig.valid);
        assert!(sig.chain_validation.verified);
        assert_eq!(sig.chain_validation.missing_ca_hint.as_deref(), Some("CA-Foo"));
        let error = sig
            .errors
            .iter()
            .find(|e| e.code == DiagnosticCode::UnknownIssuer)
            .unwrap();
        assert!(error.message.contains("trust store"));
        // The bytes are untouched even though the signer is unknown.
        assert_eq!(sig.document_intact, Some(true));
    }

    #[test]
    fn issuer_name_encoding_drift() {
        let composed = "Autoridad de Certificaci\u{f3}n";
        let decomposed = "Autoridad de Certificacio\u{301}n";
        let pki = TestPki::new(composed);
        let issued = pki.issue(CertSpec::leaf("Hugo").issuer_cn(decomposed));
        let signed = sign(&blank_pdf(1), &issued, Position::CenterRight, false);

        let report = validator_trusting(&[("Autoridad", &pki)]).validate_pdf(&signed);
        let sig = &report.signatures[0];
        assert!(sig.valid, "{:?}", sig.errors);
        assert_eq!(sig.chain_validation.trusted_ca.as_ref().unwrap().name, "Autoridad");
        assert!(sig
            .warnings
            .iter()
            .any(|w| w.code == DiagnosticCode::NameMismatch));
    }

    #[test]
    fn expired_certificate_is_invalid_even_if_trusted() {
        let pki = TestPki::new("CA-Old");
        let signed = sign(&blank_pdf(1), &pki.issue(CertSpec::leaf("Olga").expired()), Position::Left, false);

        let sig = &validator_trusting(&[("Old", &pki)]).validate_pdf(&signed).signatures[0];
        assert!(sig.chain_validation.valid);
        assert!(sig.expired);
        assert!(!sig.valid);
        assert!(sig.errors.iter().any(|e| e.code == DiagnosticCode::Expired));
    }

    #[test]
    fn modified_document_fails_integrity() {
        let pki = TestPki::new("CA-Integrity");
        let mut signed = sign(&blank_pdf(1), &pki.issue(CertSpec::leaf("Ian")), Position::Left, false);
        let at = signed
            .windows(8)
            .position(|w| w == b"(Page 1)")
            .unwrap();
        signed[at + 6] = b'9';

        let sig = &validator_trusting(&[("Integrity", &pki)]).validate_pdf(&signed).signatures[0];
        assert_eq!(sig.document_intact, Some(false));
        assert!(!sig.valid);
        assert!(sig.errors.iter().any(|e| e.code == DiagnosticCode::IntegrityFail));
    }

    /// Overwrites the signature's `/ByteRange` array in place.
    fn with_byte_range(signed: &[u8], values: &str) -> Vec<u8> {
        let mut out = signed.to_vec();
        let key = out.windows(10).position(|w| w == b"/ByteRange").unwrap();
        let open = key + out[key..].iter().position(|&b| b == b'[').unwrap();
        let end = open + out[open..].windows(9).position(|w| w == b"/Contents").unwrap();
        let replacement = format!("[{values}]");
        assert!(replacement.len() <= end - open);
        out[open..end].fill(b' ');
        out[open..open + replacement.len()].copy_from_slice(replacement.as_bytes());
        out
    }

    #[test]
    fn malformed_byte_ranges_are_diagnostics() {
        let pki = TestPki::new("CA-Ranges");
        let signed = sign(&blank_pdf(1), &pki.issue(CertSpec::leaf("Rita")), Position::Left, false);
        let validator = validator_trusting(&[("Ranges", &pki)]);

        let cases = [
            "0 -5 20 5".to_string(),
            "0 500 20 5".to_string(),
            format!("0 10 20 {}", signed.len()),
            format!("0 10 {} 10", i64::MAX - 5),
        ];
        for values in &cases {
            let report = validator.validate_pdf(&with_byte_range(&signed, values));
            assert_eq!(report.signatures.len(), 1, "{values}");
            let sig = &report.signatures[0];
            assert_eq!(sig.document_intact, Some(false), "{values}");
            assert!(!sig.valid, "{values}");
            assert!(
                sig.errors.iter().any(|e| e.code == DiagnosticCode::IntegrityFail),
                "{values}: {:?}",
                sig.errors
            );
        }
    }

    #[test]
    fn every_page_and_every_signer() {
        let pki = TestPki::new("CA-Multi");
        let first = sign(&blank_pdf(2), &pki.issue(CertSpec::leaf("Alice")), Position::Left, true);
        let second = sign(&first, &pki.issue(CertSpec::leaf("Bob")), Position::Right, false);

        let report = validator_trusting(&[("Multi", &pki)]).validate_pdf(&second);
        assert_eq!(report.unique_signatures, 3);
        assert!(report.signatures.iter().all(|s| s.valid && s.document_intact == Some(true)));

        let alice = report.groups.iter().find(|g| g.signer_name == "Alice").unwrap();
        assert_eq!(alice.count, 2);
        // Only the last signature reaches the end of the file.
        let covering: Vec<_> = report
            .signatures
            .iter()
            .filter(|s| s.covers_whole_document == Some(true))
            .map(|s| s.signer_name.as_str())
            .collect();
        assert_eq!(covering, ["Bob"]);
        let positions: Vec<_> = report
            .signatures
            .iter()
            .filter_map(|s| s.placement.as_ref())
            .filter_map(|p| Position::from_left_edge(612.0, p.rect[0]))
            .collect();
        assert!(positions.contains(&Position::Left) && positions.contains(&Position::Right));
    }

    #[test]
    fn unsigned_and_empty_store() {
        let validator = Validator::default();
        let report = validator.validate_pdf(&blank_pdf(1));
        assert!(!report.has_signatures);
        assert_eq!(report.total_found, 0);

        let pki = TestPki::new("CA-Any");
        let signed = sign(&blank_pdf(1), &pki.issue(CertSpec::leaf("Zoe")), Position::Left, false);
        let sig = &validator.validate_pdf(&signed).signatures[0];
        assert!(!sig.chain_validation.verified);
        assert!(sig.valid);
        assert!(sig.warnings.iter().any(|w| w.code == DiagnosticCode::NoTrustStore));
    }

    #[test]
    fn p12_report() {
        let root = TestPki::new("CA-P12Root");
        let sub = root.intermediate("CA-P12Sub");
        let issued = sub.issue(CertSpec::leaf("Paula").expiring_in_days(10));
        let p12 = make_p12(&issued, &[&sub.ca_cert], "secret");
        let validator = validator_trusting(&[("Root", &root)]);

        let report = validator.validate_p12(&p12, "secret").unwrap();
        assert!(report.password_correct);
        assert!(report.valid);
        assert_eq!(report.additional_certificates, 1);
        assert_eq!(report.certificate.subject_name, "Paula");
        assert!(report.certificate.days_until_expiry <= 10);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.code == DiagnosticCode::ExpiringSoon));

        assert!(matches!(
            validator.validate_p12(&p12, "wrong"),
            Err(CredentialError::BadPassword)
        ));
    }
}
