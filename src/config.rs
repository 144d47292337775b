//! Runtime configuration, read from a TOML file.
//!
//! ```toml
//! trust_store_dir = "/etc/signflow/cas"
//!
//! [repository]
//! base_url = "http://alfresco:8080"
//! username = "admin"
//! password = "secret"
//!
//! [signing]
//! contents_reserve = 16384
//!
//! [[trust_store]]
//! name = "Autoridad Raíz"
//! path = "/etc/signflow/root.pem"
//! sequence = 1
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const ENV_REPOSITORY_URL: &str = "SIGNFLOW_REPOSITORY_URL";
pub const ENV_REPOSITORY_USERNAME: &str = "SIGNFLOW_REPOSITORY_USERNAME";
pub const ENV_REPOSITORY_PASSWORD: &str = "SIGNFLOW_REPOSITORY_PASSWORD";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub signing: SigningConfig,
    pub trust_store: Vec<TrustStoreEntry>,
    pub trust_store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Node id (or alias) under which the site folders live.
    pub root_node: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Folders between the root node and the per-creator folder.
    pub sites_root: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            username: String::new(),
            password: String::new(),
            root_node: "-root-".to_string(),
            read_timeout_secs: 30,
            write_timeout_secs: 60,
            sites_root: vec!["Sites".to_string(), "Flujos".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Bytes reserved for the CMS blob inside `/Contents`.
    pub contents_reserve: usize,
    /// TrueType fonts tried, in order, before the built-in fallbacks.
    pub font_paths: Vec<PathBuf>,
    pub max_image_width: u32,
    pub caption_px: f32,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            contents_reserve: 16384,
            font_paths: Vec::new(),
            max_image_width: 300,
            caption_px: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrustStoreEntry {
    pub name: String,
    pub path: Option<PathBuf>,
    pub pem: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "default_sequence")]
    pub sequence: u32,
}

fn default_active() -> bool {
    true
}

fn default_sequence() -> u32 {
    10
}

impl TrustStoreEntry {
    /// Certificate bytes, either inline or read from `path`. Relative paths
    /// are resolved against `base_dir`.
    pub fn certificate_bytes(&self, base_dir: &Path) -> anyhow::Result<Vec<u8>> {
        match (&self.pem, &self.path) {
            (Some(pem), _) => Ok(pem.as_bytes().to_vec()),
            (None, Some(path)) => {
                let path = base_dir.join(path);
                std::fs::read(&path)
                    .with_context(|| format!("reading CA certificate {}", path.display()))
            }
            (None, None) => anyhow::bail!("trust store entry {} has no certificate", self.name),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the file and applies the environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let mut config = Self::from_toml(&text)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_REPOSITORY_URL) {
            self.repository.base_url = url;
        }
        if let Ok(username) = std::env::var(ENV_REPOSITORY_USERNAME) {
            self.repository.username = username;
        }
        if let Ok(password) = std::env::var(ENV_REPOSITORY_PASSWORD) {
            self.repository.password = password;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml(
            r#"
            [repository]
            base_url = "http://alfresco:8080"
            username = "admin"
            password = "admin"
            "#,
        )
        .unwrap();

        assert_eq!(config.repository.root_node, "-root-");
        assert_eq!(config.repository.read_timeout_secs, 30);
        assert_eq!(config.repository.write_timeout_secs, 60);
        assert_eq!(config.repository.sites_root, ["Sites", "Flujos"]);
        assert_eq!(config.signing.contents_reserve, 16384);
        assert!(config.trust_store.is_empty());
    }

    #[test]
    fn trust_store_entries() {
        let config = Config::from_toml(
            r#"
            [[trust_store]]
            name = "Root"
            pem = "-----BEGIN CERTIFICATE-----"

            [[trust_store]]
            name = "Old"
            path = "old.pem"
            active = false
            sequence = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.trust_store.len(), 2);
        assert!(config.trust_store[0].active);
        assert!(!config.trust_store[1].active);
        assert_eq!(config.trust_store[1].sequence, 2);
        assert_eq!(
            config.trust_store[0]
                .certificate_bytes(Path::new("."))
                .unwrap(),
            b"-----BEGIN CERTIFICATE-----"
        );
    }
}
