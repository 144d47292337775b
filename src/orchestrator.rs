//! Moves document bytes between workflow requests and the content
//! repository: upload on send, fetch and write back on every signature,
//! move to the destination folder once everybody signed.

use std::sync::Arc;

use chrono::Utc;

use crate::config::RepositoryConfig;
use crate::error::TransportError;
use crate::repository::Repository;
use crate::workflow::{DocumentContent, RemoteFile, WorkflowDocument};

#[derive(Debug, Default)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failures: Vec<(String, TransportError)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub name: String,
    pub error: Option<String>,
}

/// Per-document results of a move to the destination folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveSummary {
    pub outcomes: Vec<MoveOutcome>,
}

impl MoveSummary {
    pub fn moved(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.moved()
    }

    /// Status line with the counts, then one line per document.
    pub fn status_text(&self) -> String {
        let lines: Vec<String> = self
            .outcomes
            .iter()
            .map(|o| match &o.error {
                None => format!("OK: {}", o.name),
                Some(e) => format!("ERROR: {} - {e}", o.name),
            })
            .collect();
        format!(
            "Movidos: {}, Fallidos: {}\n{}",
            self.moved(),
            self.failed(),
            lines.join("\n")
        )
    }
}

pub struct DocumentOrchestrator {
    repository: Arc<dyn Repository>,
    sites_root: Vec<String>,
}

impl DocumentOrchestrator {
    pub fn new(repository: Arc<dyn Repository>, config: &RepositoryConfig) -> Self {
        Self {
            repository,
            sites_root: config.sites_root.clone(),
        }
    }

    /// Walks `path` from the repository root, creating missing folders, and
    /// returns the id of the last one. A folder created concurrently by
    /// someone else is adopted.
    pub fn ensure_folder_path<S: AsRef<str>>(&self, path: &[S]) -> Result<String, TransportError> {
        let mut parent = self.repository.root().to_string();
        for name in path {
            let name = name.as_ref();
            let node = match self.repository.find_child(&parent, name)? {
                Some(node) => node,
                None => match self.repository.create_folder(&parent, name) {
                    Ok(node) => {
                        log::info!("created folder {name}");
                        node
                    }
                    Err(TransportError::Conflict(_)) => self
                        .repository
                        .find_child(&parent, name)?
                        .ok_or_else(|| TransportError::NotFound(name.to_string()))?,
                    Err(e) => return Err(e),
                },
            };
            parent = node.id;
        }
        Ok(parent)
    }

    /// Folder for the documents of one request:
    /// `{sites_root}/{creator_login}/{request_name}`.
    pub fn workflow_folder(
        &self,
        creator_login: &str,
        request_name: &str,
    ) -> Result<String, TransportError> {
        let mut path: Vec<&str> = self.sites_root.iter().map(String::as_str).collect();
        path.push(creator_login);
        path.push(request_name);
        self.ensure_folder_path(&path)
    }

    pub fn upload(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteFile, TransportError> {
        let node = self.repository.upload(folder, name, bytes)?;
        log::debug!("uploaded {name} as {}", node.id);
        Ok(RemoteFile {
            node_id: node.id,
            folder_id: Some(folder.to_string()),
        })
    }

    pub fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>, TransportError> {
        self.repository.fetch(&file.node_id)
    }

    pub fn put_new_version(&self, file: &RemoteFile, bytes: &[u8]) -> Result<(), TransportError> {
        self.repository.put_new_version(&file.node_id, bytes)
    }

    pub fn move_to(&self, file: &RemoteFile, target_folder: &str) -> Result<(), TransportError> {
        self.repository.move_node(&file.node_id, target_folder)
    }

    pub fn download_url(&self, file: &RemoteFile) -> String {
        self.repository.download_url(&file.node_id)
    }

    /// Current bytes of a document: the latest signed version if there is one.
    pub fn resolve_source(&self, document: &WorkflowDocument) -> Result<Vec<u8>, TransportError> {
        match &document.content {
            DocumentContent::Local { original, signed } => {
                Ok(signed.as_ref().unwrap_or(original).clone())
            }
            DocumentContent::Remote(file) => self.fetch(file),
        }
    }

    /// Stores signed bytes and marks the document signed.
    pub fn write_back(
        &self,
        document: &mut WorkflowDocument,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        match &mut document.content {
            DocumentContent::Local { signed, .. } => *signed = Some(bytes),
            DocumentContent::Remote(file) => self.put_new_version(file, &bytes)?,
        }
        document.signed = true;
        document.signed_at = Some(Utc::now());
        Ok(())
    }

    /// Uploads every document still held locally into `folder`, switching it
    /// to the remote handle. Failures are collected, not raised.
    pub fn upload_local_documents(
        &self,
        documents: &mut [WorkflowDocument],
        folder: &str,
    ) -> UploadSummary {
        let mut summary = UploadSummary::default();
        for document in documents.iter_mut() {
            let bytes = match &document.content {
                DocumentContent::Local { original, signed } => signed.as_ref().unwrap_or(original),
                DocumentContent::Remote(_) => continue,
            };
            match self.upload(folder, &document.name, bytes) {
                Ok(file) => {
                    document.download_url = Some(self.download_url(&file));
                    document.content = DocumentContent::Remote(file);
                    summary.uploaded += 1;
                }
                Err(e) => {
                    log::warn!("uploading {} failed: {e}", document.name);
                    summary.failures.push((document.name.clone(), e));
                }
            }
        }
        summary
    }

    /// Moves every remote document into `destination`. Documents that only
    /// exist locally are skipped; failures are reported, never raised.
    pub fn move_documents(
        &self,
        documents: &mut [WorkflowDocument],
        destination: &str,
    ) -> MoveSummary {
        let mut summary = MoveSummary::default();
        for document in documents.iter_mut() {
            let DocumentContent::Remote(file) = &mut document.content else {
                continue;
            };
            let error = match self.repository.move_node(&file.node_id, destination) {
                Ok(()) => {
                    file.folder_id = Some(destination.to_string());
                    document.moved_to_destination = true;
                    document.moved_at = Some(Utc::now());
                    None
                }
                Err(e) => {
                    log::warn!("moving {} failed: {e}", document.name);
                    Some(e.to_string())
                }
            };
            summary.outcomes.push(MoveOutcome {
                name: document.name.clone(),
                error,
            });
        }
        summary
    }
}
