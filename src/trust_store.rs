//! Configured certificate authorities.
//!
//! Trust only ever comes from here. Certificates found inside a PKCS #12 file
//! or a CMS blob can help building a chain, but are never roots.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::certificate::Certificate;
use crate::config::Config;

/// A configured trust anchor, with the metadata shown in listings.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    pub name: String,
    pub sequence: u32,
    pub active: bool,
    pub certificate: Certificate,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaSummary {
    pub name: String,
    pub sequence: u32,
    pub subject_cn: Option<String>,
    pub subject_org: Option<String>,
    pub issuer_cn: Option<String>,
    pub serial_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_self_signed: bool,
    pub active: bool,
}

impl CertificateAuthority {
    pub fn new(name: impl Into<String>, bytes: &[u8], active: bool) -> anyhow::Result<Self> {
        let name = name.into();
        let certificate = Certificate::from_pem_or_der(bytes)
            .with_context(|| format!("invalid certificate for CA {name}"))?;
        Ok(Self {
            name,
            sequence: 10,
            active,
            certificate,
        })
    }

    pub fn subject_cn(&self) -> Option<&str> {
        self.certificate.subject().common_name()
    }

    pub fn subject_org(&self) -> Option<&str> {
        self.certificate.subject().info().organization.as_deref()
    }

    pub fn summary(&self) -> CaSummary {
        let cert = &self.certificate;
        CaSummary {
            name: self.name.clone(),
            sequence: self.sequence,
            subject_cn: self.subject_cn().map(str::to_string),
            subject_org: self.subject_org().map(str::to_string),
            issuer_cn: cert.issuer().common_name().map(str::to_string),
            serial_number: cert.serial_hex().to_string(),
            valid_from: cert.not_before(),
            valid_until: cert.not_after(),
            is_self_signed: cert.is_self_signed(),
            active: self.active,
        }
    }
}

/// Immutable set of CA entries, ordered by sequence then name.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    entries: Vec<CertificateAuthority>,
}

impl TrustStore {
    pub fn new(mut entries: Vec<CertificateAuthority>) -> Self {
        entries.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.name.cmp(&b.name)));
        Self { entries }
    }

    /// Builds the store from the `[[trust_store]]` entries and the optional
    /// PEM directory of the configuration.
    pub fn from_config(config: &Config, base_dir: &Path) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        for entry in &config.trust_store {
            let bytes = entry.certificate_bytes(base_dir)?;
            let mut ca = CertificateAuthority::new(&entry.name, &bytes, entry.active)?;
            ca.sequence = entry.sequence;
            entries.push(ca);
        }
        if let Some(dir) = &config.trust_store_dir {
            entries.extend(load_ca_dir(base_dir.join(dir))?);
        }
        log::info!(
            "trust store loaded: {} entries, {} active",
            entries.len(),
            entries.iter().filter(|e| e.active).count()
        );
        Ok(Self::new(entries))
    }

    pub fn list_active(&self) -> impl Iterator<Item = &CertificateAuthority> {
        self.entries.iter().filter(|e| e.active)
    }

    pub fn count_active(&self) -> usize {
        self.list_active().count()
    }

    pub fn all(&self) -> &[CertificateAuthority] {
        &self.entries
    }

    /// Common names of the active entries, for diagnostics.
    pub fn active_common_names(&self) -> Vec<String> {
        self.list_active()
            .map(|ca| {
                ca.subject_cn()
                    .map(str::to_string)
                    .unwrap_or_else(|| ca.name.clone())
            })
            .collect()
    }

    /// The active entry holding exactly this certificate.
    pub fn find(&self, cert: &Certificate) -> Option<&CertificateAuthority> {
        self.list_active().find(|ca| ca.certificate.same_as(cert))
    }
}

/// Loads every PEM file of a directory as an active CA named after the file.
pub fn load_ca_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<Vec<CertificateAuthority>> {
    let dir = dir.as_ref();
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading CA directory {}", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        entries.push(CertificateAuthority::new(name, &std::fs::read(&path)?, true)?);
    }
    Ok(entries)
}

/// Process wide handle on the current trust store snapshot.
///
/// Readers take a cheap [`Arc`] snapshot and keep using it even if the
/// configuration is reloaded meanwhile.
#[derive(Clone, Default)]
pub struct TrustStoreHandle {
    current: Arc<RwLock<Arc<TrustStore>>>,
}

impl TrustStoreHandle {
    pub fn new(store: TrustStore) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(store))),
        }
    }

    pub fn snapshot(&self) -> Arc<TrustStore> {
        self.current.read().clone()
    }

    pub fn replace(&self, store: TrustStore) {
        *self.current.write() = Arc::new(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPki;

    fn ca(name: &str, cn: &str, active: bool) -> CertificateAuthority {
        let pki = TestPki::new(cn);
        CertificateAuthority::new(name, &pki.ca_cert.to_pem().unwrap(), active).unwrap()
    }

    #[test]
    fn only_active_entries_are_listed() {
        let store = TrustStore::new(vec![
            ca("Root", "Root CA", true),
            ca("Retired", "Old CA", false),
            ca("Sub", "Sub CA", true),
        ]);

        assert_eq!(store.count_active(), 2);
        assert_eq!(store.active_common_names(), ["Root CA", "Sub CA"]);
        assert_eq!(store.all().len(), 3);
    }

    #[test]
    fn summary_metadata() {
        let entry = ca("Root", "Root CA", true);
        let summary = entry.summary();
        assert_eq!(summary.subject_cn.as_deref(), Some("Root CA"));
        assert_eq!(summary.subject_org.as_deref(), Some("Example CA Org"));
        assert_eq!(summary.issuer_cn.as_deref(), Some("Root CA"));
        assert!(summary.is_self_signed);
    }

    #[test]
    fn directory_loading() {
        let dir = tempfile::tempdir().unwrap();
        for cn in ["First CA", "Second CA"] {
            let pki = TestPki::new(cn);
            let path = dir.path().join(format!("{}.pem", cn.replace(' ', "_")));
            std::fs::write(path, pki.ca_cert.to_pem().unwrap()).unwrap();
        }

        let mut names: Vec<_> = load_ca_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|ca| ca.name)
            .collect();
        names.sort();
        assert_eq!(names, ["First_CA", "Second_CA"]);
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = TrustStoreHandle::new(TrustStore::default());
        let before = handle.snapshot();
        handle.replace(TrustStore::new(vec![ca("Root", "Root CA", true)]));

        assert_eq!(before.count_active(), 0);
        assert_eq!(handle.snapshot().count_active(), 1);
    }
}
