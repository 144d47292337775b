//! Report types produced by the validator. None of them is persisted; they
//! serialise to JSON for the CLI and API callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::certificate::NameInfo;
use crate::cms::SignDateSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    NotSignedData,
    Malformed,
    NoTrustStore,
    UnknownIssuer,
    NameMismatch,
    SigVerifyFail,
    UnsupportedKey,
    Expired,
    NotYetValid,
    ExpiringSoon,
    IntegrityFail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub message: String,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    EndEntity,
    Intermediate,
    TrustedCa,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainLink {
    #[serde(rename = "type")]
    pub kind: LinkKind,
    pub subject: String,
    pub issuer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustedCa {
    pub name: String,
    pub subject_cn: Option<String>,
    pub organization: Option<String>,
}

/// Result of building a chain from an end-entity certificate to a configured CA.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainValidation {
    /// A chain check was attempted (there were CAs to check against).
    pub verified: bool,
    pub valid: bool,
    pub trusted_ca: Option<TrustedCa>,
    pub chain_path: Vec<ChainLink>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub missing_ca_hint: Option<String>,
    pub debug_info: Vec<String>,
}

/// Where the visible signature sits, when the AcroForm could be followed.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub page_index: usize,
    pub rect: [f32; 4],
}

#[derive(Debug, Clone, Serialize)]
pub struct SignerReport {
    pub index: usize,
    pub signer: NameInfo,
    pub issuer: NameInfo,
    pub signer_name: String,
    pub issuer_name: String,
    pub serial_number: String,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub sign_date: Option<DateTime<Utc>>,
    pub sign_date_source: Option<SignDateSource>,
    pub timestamp_authority: bool,
    pub reason: Option<String>,
    pub location: Option<String>,
    pub placement: Option<Placement>,
    pub document_intact: Option<bool>,
    pub covers_whole_document: Option<bool>,
    pub expired: bool,
    pub not_yet_valid: bool,
    pub valid: bool,
    pub chain_validation: ChainValidation,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub cms_sha256: String,
}

impl SignerReport {
    /// Report for a blob that could not even be parsed.
    pub(crate) fn unparseable(index: usize, cms_sha256: String, error: Diagnostic) -> Self {
        Self {
            index,
            signer: NameInfo::default(),
            issuer: NameInfo::default(),
            signer_name: String::new(),
            issuer_name: String::new(),
            serial_number: String::new(),
            valid_from: None,
            valid_until: None,
            sign_date: None,
            sign_date_source: None,
            timestamp_authority: false,
            reason: None,
            location: None,
            placement: None,
            document_intact: None,
            covers_whole_document: None,
            expired: false,
            not_yet_valid: false,
            valid: false,
            chain_validation: ChainValidation::default(),
            errors: vec![error],
            warnings: Vec::new(),
            cms_sha256,
        }
    }

    fn group_key(&self) -> String {
        let date = |d: &Option<DateTime<Utc>>| d.map(|d| d.to_rfc3339()).unwrap_or_default();
        format!(
            "{}|{}|{}|{}",
            self.signer_name,
            self.issuer_name,
            date(&self.valid_from),
            date(&self.valid_until)
        )
    }
}

/// Signatures made with the same certificate, shown once with a count.
#[derive(Debug, Clone, Serialize)]
pub struct SignatureGroup {
    pub signer_name: String,
    pub issuer_name: String,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub valid: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PdfReport {
    pub has_signatures: bool,
    /// Signature dictionaries (or blobs) found before deduplication.
    pub total_found: usize,
    pub unique_signatures: usize,
    pub signatures: Vec<SignerReport>,
    pub groups: Vec<SignatureGroup>,
}

impl PdfReport {
    pub fn new(total_found: usize, signatures: Vec<SignerReport>) -> Self {
        let mut groups: Vec<(String, SignatureGroup)> = Vec::new();
        for sig in &signatures {
            let key = sig.group_key();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => {
                    group.count += 1;
                    group.valid &= sig.valid;
                }
                None => groups.push((
                    key,
                    SignatureGroup {
                        signer_name: sig.signer_name.clone(),
                        issuer_name: sig.issuer_name.clone(),
                        valid_from: sig.valid_from,
                        valid_until: sig.valid_until,
                        valid: sig.valid,
                        count: 1,
                    },
                )),
            }
        }

        Self {
            has_signatures: !signatures.is_empty(),
            total_found,
            unique_signatures: signatures.len(),
            signatures,
            groups: groups.into_iter().map(|(_, g)| g).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateSummary {
    pub subject: NameInfo,
    pub issuer: NameInfo,
    pub subject_name: String,
    pub issuer_name: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: i64,
}

/// Inspection of a PKCS #12 credential.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialReport {
    pub password_correct: bool,
    pub certificate: CertificateSummary,
    pub additional_certificates: usize,
    pub expired: bool,
    pub not_yet_valid: bool,
    pub valid: bool,
    pub chain_validation: ChainValidation,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub details: Vec<String>,
}
