//! Chain building from an end-entity certificate to a configured CA.
//!
//! Three strategies are tried in order:
//!
//! 1. direct: a configured CA whose subject matches the issuer name and whose
//!    key verifies the certificate;
//! 2. walk: climb through a pool made of the configured CAs and the extra
//!    certificates shipped with the signature, at most [`MAX_DEPTH`] levels;
//! 3. brute force: any configured CA whose key verifies the certificate,
//!    names notwithstanding. This catches issuer names that drifted in
//!    encoding between the CA and the certificates it issued.

use std::collections::HashSet;

use crate::certificate::{names_match, Certificate, SignatureCheckError};
use crate::report::{
    ChainLink, ChainValidation, Diagnostic, DiagnosticCode, LinkKind, TrustedCa,
};
use crate::trust_store::{CertificateAuthority, TrustStore};

pub const MAX_DEPTH: usize = 10;

struct PoolEntry<'a> {
    cert: &'a Certificate,
    ca: Option<&'a CertificateAuthority>,
}

fn link(kind: LinkKind, cert: &Certificate) -> ChainLink {
    ChainLink {
        kind,
        subject: cert.subject().display_name(),
        issuer: cert.issuer().display_name(),
    }
}

fn trusted(ca: &CertificateAuthority) -> TrustedCa {
    TrustedCa {
        name: ca.name.clone(),
        subject_cn: ca.subject_cn().map(str::to_string),
        organization: ca.subject_org().map(str::to_string),
    }
}

fn visit_key(cert: &Certificate) -> (String, Vec<u8>) {
    (cert.serial_hex().to_string(), cert.issuer().der().to_vec())
}

/// Builds and checks the chain of `leaf`. Never fails: every problem ends up
/// as a diagnostic on the returned value.
pub fn validate_chain(
    leaf: &Certificate,
    additional: &[Certificate],
    store: &TrustStore,
) -> ChainValidation {
    let mut result = ChainValidation::default();
    let cas: Vec<&CertificateAuthority> = store.list_active().collect();

    if cas.is_empty() {
        result.warnings.push(Diagnostic::new(
            DiagnosticCode::NoTrustStore,
            "no certificate authorities are configured; the chain was not checked",
        ));
        return result;
    }
    result.verified = true;

    let issuer_label = leaf.issuer().display_name();
    let mut unsupported = None;
    let mut tried = HashSet::new();

    // Direct match.
    for (idx, ca) in cas.iter().enumerate() {
        if names_match(leaf.issuer(), ca.certificate.subject()).is_none() {
            continue;
        }
        tried.insert(idx);
        match leaf.verify_signed_by(&ca.certificate) {
            Ok(()) => {
                result
                    .debug_info
                    .push(format!("direct match with CA '{}'", ca.name));
                result.chain_path = vec![
                    link(LinkKind::EndEntity, leaf),
                    link(LinkKind::TrustedCa, &ca.certificate),
                ];
                result.trusted_ca = Some(trusted(ca));
                result.valid = true;
                return result;
            }
            Err(e) => {
                result
                    .debug_info
                    .push(format!("CA '{}' matches by name but: {e}", ca.name));
                if let SignatureCheckError::UnsupportedKey(_) = e {
                    unsupported = Some(e.to_string());
                }
            }
        }
    }

    // Walk through the pool.
    let mut pool: Vec<PoolEntry> = cas
        .iter()
        .map(|ca| PoolEntry {
            cert: &ca.certificate,
            ca: Some(*ca),
        })
        .collect();
    for cert in additional {
        if !cas.iter().any(|ca| ca.certificate.same_as(cert)) {
            pool.push(PoolEntry { cert, ca: None });
        }
    }

    let mut path = vec![link(LinkKind::EndEntity, leaf)];
    let mut visited = HashSet::from([visit_key(leaf)]);
    let mut current = leaf;
    let mut untrusted_root = None;
    for depth in 0..MAX_DEPTH {
        let candidate = pool.iter().find(|p| {
            !visited.contains(&visit_key(p.cert))
                && names_match(current.issuer(), p.cert.subject()).is_some()
                && current.verify_signed_by(p.cert).is_ok()
        });
        let Some(entry) = candidate else {
            result.debug_info.push(format!(
                "walk stopped at depth {depth}: no issuer for '{}'",
                current.subject().display_name()
            ));
            break;
        };

        if let Some(ca) = entry.ca {
            path.push(link(LinkKind::TrustedCa, entry.cert));
            result
                .debug_info
                .push(format!("chain reached CA '{}' at depth {}", ca.name, depth + 1));
            result.chain_path = path;
            result.trusted_ca = Some(trusted(ca));
            result.valid = true;
            return result;
        }

        if entry.cert.is_self_signed() {
            untrusted_root = Some(entry.cert.subject().display_name());
            result.debug_info.push(format!(
                "chain ends at self-signed root '{}' which is not configured",
                entry.cert.subject().display_name()
            ));
            break;
        }

        path.push(link(LinkKind::Intermediate, entry.cert));
        visited.insert(visit_key(entry.cert));
        current = entry.cert;
    }

    // Brute force over the CAs not tried yet.
    for (idx, ca) in cas.iter().enumerate() {
        if tried.contains(&idx) {
            continue;
        }
        if leaf.verify_signed_by(&ca.certificate).is_ok() {
            log::warn!(
                "issuer '{}' matched CA '{}' only by signature",
                issuer_label,
                ca.name
            );
            result
                .debug_info
                .push(format!("CA '{}' verifies the signature without name match", ca.name));
            result.warnings.push(Diagnostic::new(
                DiagnosticCode::NameMismatch,
                format!(
                    "issuer name '{}' does not match CA '{}' exactly; the CA was identified by a brute cryptographic match",
                    issuer_label, ca.name
                ),
            ));
            result.chain_path = vec![
                link(LinkKind::EndEntity, leaf),
                link(LinkKind::TrustedCa, &ca.certificate),
            ];
            result.trusted_ca = Some(trusted(ca));
            result.valid = true;
            return result;
        }
    }

    // Nothing worked: explain why.
    let configured = store.active_common_names();
    let issuer_cn = leaf.issuer().common_name().map(str::to_string);
    let issuer_is_configured = issuer_cn
        .as_ref()
        .is_some_and(|cn| configured.iter().any(|c| c == cn));

    if issuer_is_configured {
        result.errors.push(Diagnostic::new(
            DiagnosticCode::SigVerifyFail,
            format!(
                "issuer '{issuer_label}' is configured, but its certificate does not verify this certificate's signature; \
                 the configured certificate may belong to another generation of the CA"
            ),
        ));
    } else {
        result.errors.push(Diagnostic::new(
            DiagnosticCode::UnknownIssuer,
            format!(
                "certificate issued by '{issuer_label}', which is not among the configured CAs ({}); \
                 add the '{issuer_label}' CA certificate to the trust store to validate it",
                configured.join(", ")
            ),
        ));
        result.missing_ca_hint = Some(issuer_cn.unwrap_or(issuer_label));
    }
    if let Some(root) = untrusted_root {
        result.errors.push(Diagnostic::new(
            DiagnosticCode::UnknownIssuer,
            format!("the chain ends at self-signed root '{root}', which is not configured"),
        ));
    }
    if let Some(message) = unsupported {
        result
            .errors
            .push(Diagnostic::new(DiagnosticCode::UnsupportedKey, message));
    }
    result.chain_path = path;
    result
}
