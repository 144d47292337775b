//! Signing credentials: PKCS #12 loading and the choice between what the
//! caller supplied and what is stored for the user.

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{Id, PKey, Private};
use openssl::x509::X509;

use crate::certificate::Certificate;
use crate::error::CredentialError;

/// Decrypted PKCS #12 contents. Lives no longer than one signing call.
pub struct Credential {
    pub private_key: PKey<Private>,
    pub certificate: X509,
    pub additional_certificates: Vec<X509>,
}

impl Credential {
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, CredentialError> {
        let pkcs12 =
            Pkcs12::from_der(der).map_err(|e| CredentialError::MalformedP12(e.to_string()))?;
        let parsed = pkcs12.parse2(password).map_err(|e| {
            let text = e.to_string().to_lowercase();
            if ["mac", "password", "decrypt"]
                .iter()
                .any(|hint| text.contains(hint))
            {
                CredentialError::BadPassword
            } else {
                CredentialError::MalformedP12(e.to_string())
            }
        })?;

        let private_key = parsed.pkey.ok_or_else(|| {
            CredentialError::MalformedP12("no private key in the bundle".to_string())
        })?;
        let certificate = parsed.cert.ok_or_else(|| {
            CredentialError::MalformedP12("no certificate in the bundle".to_string())
        })?;
        let additional_certificates = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        let key_id = private_key.id();
        if key_id != Id::RSA && key_id != Id::EC {
            return Err(CredentialError::UnsupportedKey(format!("{key_id:?}")));
        }

        Ok(Self {
            private_key,
            certificate,
            additional_certificates,
        })
    }

    pub fn certificate(&self) -> Result<Certificate, CredentialError> {
        Certificate::from_x509(&self.certificate)
            .map_err(|e| CredentialError::MalformedP12(e.to_string()))
    }

    pub fn chain(&self) -> Result<Vec<Certificate>, CredentialError> {
        self.additional_certificates
            .iter()
            .map(|c| {
                Certificate::from_x509(c).map_err(|e| CredentialError::MalformedP12(e.to_string()))
            })
            .collect()
    }
}

/// Values supplied with a single request. Any of them may be missing.
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub p12: Option<Vec<u8>>,
    pub password: Option<String>,
    pub image: Option<Vec<u8>>,
}

/// Values kept on the user record, password already decrypted.
#[derive(Debug, Clone, Default)]
pub struct StoredCredentials {
    pub p12: Option<Vec<u8>>,
    pub password: Option<String>,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub p12: Vec<u8>,
    pub password: String,
    pub image: Vec<u8>,
}

/// Picks each component independently: the request value if present,
/// otherwise the stored one. Blank passwords and empty files count as absent.
pub fn resolve(
    overrides: &CredentialOverrides,
    stored: Option<&StoredCredentials>,
) -> Result<ResolvedCredentials, CredentialError> {
    fn pick_bytes(a: &Option<Vec<u8>>, b: Option<&Option<Vec<u8>>>) -> Option<Vec<u8>> {
        a.as_ref()
            .filter(|v| !v.is_empty())
            .or_else(|| b.and_then(|b| b.as_ref()).filter(|v| !v.is_empty()))
            .cloned()
    }

    let password = overrides
        .password
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .or_else(|| {
            stored
                .and_then(|s| s.password.as_deref())
                .map(str::trim)
                .filter(|p| !p.is_empty())
        })
        .map(str::to_string);

    Ok(ResolvedCredentials {
        p12: pick_bytes(&overrides.p12, stored.map(|s| &s.p12))
            .ok_or(CredentialError::MissingCertificate)?,
        password: password.ok_or(CredentialError::MissingPassword)?,
        image: pick_bytes(&overrides.image, stored.map(|s| &s.image))
            .ok_or(CredentialError::MissingImage)?,
    })
}
