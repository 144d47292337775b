#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod asn1;
mod bitmap_font;
pub mod certificate;
pub mod chain;
pub mod cms;
pub mod config;
pub mod credential;
pub mod error;
pub mod extract;
pub mod openssl;
pub mod orchestrator;
pub mod pdf_fields;
pub mod report;
pub mod repository;
pub mod signature_image;
pub mod signing;
pub mod trust_store;
pub mod validator;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use credential::{Credential, CredentialOverrides, StoredCredentials};
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::DocumentOrchestrator;
pub use report::{CredentialReport, PdfReport, SignerReport};
pub use repository::{AlfrescoRepository, MemoryRepository, Repository};
pub use signature_image::{ImageComposer, SignatureImage};
pub use signing::{PdfSigner, Position, SigningRequest};
pub use trust_store::{CertificateAuthority, TrustStore, TrustStoreHandle};
pub use validator::Validator;
pub use workflow::{WorkflowEngine, WorkflowState};
