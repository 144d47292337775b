//! External content repository holding workflow documents.
//!
//! Nodes are addressed by opaque ids. Folders are looked up by name under a
//! parent, which makes folder creation idempotent.

mod alfresco;
mod memory;

pub use alfresco::AlfrescoRepository;
pub use memory::MemoryRepository;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub is_folder: bool,
}

pub trait Repository: Send + Sync {
    /// Id of the node every path starts from.
    fn root(&self) -> &str;

    /// The child of `parent` called `name`, if any.
    fn find_child(&self, parent: &str, name: &str) -> Result<Option<RemoteNode>, TransportError>;

    /// Fails with [`TransportError::Conflict`] if the name is taken.
    fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteNode, TransportError>;

    /// Stores a new file. If one with the same name exists, its content is
    /// replaced by a new version instead.
    fn upload(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteNode, TransportError>;

    fn fetch(&self, node: &str) -> Result<Vec<u8>, TransportError>;

    fn put_new_version(&self, node: &str, bytes: &[u8]) -> Result<(), TransportError>;

    fn move_node(&self, node: &str, target_folder: &str) -> Result<(), TransportError>;

    fn download_url(&self, node: &str) -> String;
}
