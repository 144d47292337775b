//! In-process repository, used by tests and local runs.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use super::{RemoteNode, Repository};
use crate::error::TransportError;

const ROOT: &str = "-root-";

#[derive(Debug, Clone)]
struct StoredNode {
    node: RemoteNode,
    versions: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    nodes: BTreeMap<String, StoredNode>,
    failing_moves: HashSet<String>,
    failing_uploads: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every move of a node called `name` fail.
    pub fn fail_moves_for(&self, name: &str) {
        self.inner.lock().failing_moves.insert(name.to_string());
    }

    /// Makes every upload of a file called `name` fail.
    pub fn fail_uploads_for(&self, name: &str) {
        self.inner.lock().failing_uploads.insert(name.to_string());
    }

    pub fn node(&self, id: &str) -> Option<RemoteNode> {
        self.inner.lock().nodes.get(id).map(|n| n.node.clone())
    }

    /// Number of stored versions of a file, zero for folders and unknown ids.
    pub fn version_count(&self, id: &str) -> usize {
        self.inner
            .lock()
            .nodes
            .get(id)
            .map_or(0, |n| n.versions.len())
    }

    /// Names of the direct children of `parent`, sorted.
    pub fn children(&self, parent: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .nodes
            .values()
            .filter(|n| n.node.parent_id.as_deref() == Some(parent))
            .map(|n| n.node.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Inner {
    fn child(&self, parent: &str, name: &str) -> Option<&StoredNode> {
        self.nodes
            .values()
            .find(|n| n.node.parent_id.as_deref() == Some(parent) && n.node.name == name)
    }

    fn check_parent(&self, parent: &str) -> Result<(), TransportError> {
        match self.nodes.get(parent) {
            Some(n) if n.node.is_folder => Ok(()),
            Some(_) => Err(TransportError::Status {
                status: 400,
                message: format!("{parent} is not a folder"),
            }),
            None if parent == ROOT => Ok(()),
            None => Err(TransportError::NotFound(parent.to_string())),
        }
    }

    fn insert(&mut self, parent: &str, name: &str, content: Option<&[u8]>) -> RemoteNode {
        self.next_id += 1;
        let node = RemoteNode {
            id: format!("node-{}", self.next_id),
            name: name.to_string(),
            parent_id: Some(parent.to_string()),
            is_folder: content.is_none(),
        };
        self.nodes.insert(
            node.id.clone(),
            StoredNode {
                node: node.clone(),
                versions: content.map(|c| vec![c.to_vec()]).unwrap_or_default(),
            },
        );
        node
    }
}

impl Repository for MemoryRepository {
    fn root(&self) -> &str {
        ROOT
    }

    fn find_child(&self, parent: &str, name: &str) -> Result<Option<RemoteNode>, TransportError> {
        Ok(self.inner.lock().child(parent, name).map(|n| n.node.clone()))
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteNode, TransportError> {
        let mut inner = self.inner.lock();
        inner.check_parent(parent)?;
        if inner.child(parent, name).is_some() {
            return Err(TransportError::Conflict(format!("{parent}/{name}")));
        }
        Ok(inner.insert(parent, name, None))
    }

    fn upload(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteNode, TransportError> {
        let mut inner = self.inner.lock();
        if inner.failing_uploads.contains(name) {
            return Err(TransportError::Status {
                status: 500,
                message: format!("upload of {name} refused"),
            });
        }
        inner.check_parent(folder)?;
        if let Some(existing) = inner.child(folder, name).map(|n| n.node.id.clone()) {
            let stored = inner
                .nodes
                .get_mut(&existing)
                .ok_or_else(|| TransportError::NotFound(existing.clone()))?;
            stored.versions.push(bytes.to_vec());
            return Ok(stored.node.clone());
        }
        Ok(inner.insert(folder, name, Some(bytes)))
    }

    fn fetch(&self, node: &str) -> Result<Vec<u8>, TransportError> {
        self.inner
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.versions.last().cloned())
            .ok_or_else(|| TransportError::NotFound(node.to_string()))
    }

    fn put_new_version(&self, node: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(node) {
            Some(stored) if !stored.node.is_folder => {
                stored.versions.push(bytes.to_vec());
                Ok(())
            }
            _ => Err(TransportError::NotFound(node.to_string())),
        }
    }

    fn move_node(&self, node: &str, target_folder: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.check_parent(target_folder)?;
        let name = inner
            .nodes
            .get(node)
            .map(|n| n.node.name.clone())
            .ok_or_else(|| TransportError::NotFound(node.to_string()))?;
        if inner.failing_moves.contains(&name) {
            return Err(TransportError::Status {
                status: 500,
                message: format!("move of {name} refused"),
            });
        }
        if inner.child(target_folder, &name).is_some() {
            return Err(TransportError::Conflict(format!("{target_folder}/{name}")));
        }
        if let Some(stored) = inner.nodes.get_mut(node) {
            stored.node.parent_id = Some(target_folder.to_string());
        }
        Ok(())
    }

    fn download_url(&self, node: &str) -> String {
        format!("memory://{node}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folders_and_versions() {
        let repo = MemoryRepository::new();
        let sites = repo.create_folder(repo.root(), "Sites").unwrap();
        assert!(matches!(
            repo.create_folder(repo.root(), "Sites"),
            Err(TransportError::Conflict(_))
        ));
        assert_eq!(repo.find_child(repo.root(), "Sites").unwrap(), Some(sites.clone()));
        assert_eq!(repo.find_child(repo.root(), "Other").unwrap(), None);

        let file = repo.upload(&sites.id, "a.pdf", b"v1").unwrap();
        let again = repo.upload(&sites.id, "a.pdf", b"v2").unwrap();
        assert_eq!(file.id, again.id);
        repo.put_new_version(&file.id, b"v3").unwrap();
        assert_eq!(repo.version_count(&file.id), 3);
        assert_eq!(repo.fetch(&file.id).unwrap(), b"v3");
        assert!(repo.put_new_version(&sites.id, b"x").is_err());
    }

    #[test]
    fn moves() {
        let repo = MemoryRepository::new();
        let a = repo.create_folder(repo.root(), "a").unwrap();
        let b = repo.create_folder(repo.root(), "b").unwrap();
        let one = repo.upload(&a.id, "one.pdf", b"1").unwrap();
        let two = repo.upload(&a.id, "two.pdf", b"2").unwrap();
        repo.fail_moves_for("two.pdf");

        repo.move_node(&one.id, &b.id).unwrap();
        assert!(repo.move_node(&two.id, &b.id).is_err());
        assert_eq!(repo.children(&a.id), ["two.pdf"]);
        assert_eq!(repo.children(&b.id), ["one.pdf"]);
        assert!(matches!(
            repo.move_node("missing", &b.id),
            Err(TransportError::NotFound(_))
        ));
    }

    #[test]
    fn injected_upload_failure() {
        let repo = MemoryRepository::new();
        repo.fail_uploads_for("bad.pdf");
        assert!(repo.upload(repo.root(), "bad.pdf", b"x").is_err());
        assert!(repo.upload(repo.root(), "good.pdf", b"x").is_ok());
    }
}
