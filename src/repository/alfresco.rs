//! Alfresco public REST API (v1) client.

use std::time::Duration;

use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{RemoteNode, Repository};
use crate::config::RepositoryConfig;
use crate::error::TransportError;

const API_PATH: &str = "/alfresco/api/-default-/public/alfresco/versions/1";

#[derive(Deserialize)]
struct Entry<T> {
    entry: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEntry {
    id: String,
    name: String,
    parent_id: Option<String>,
    #[serde(default)]
    is_folder: bool,
}

impl From<NodeEntry> for RemoteNode {
    fn from(node: NodeEntry) -> Self {
        RemoteNode {
            id: node.id,
            name: node.name,
            parent_id: node.parent_id,
            is_folder: node.is_folder,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    brief_summary: Option<String>,
}

pub struct AlfrescoRepository {
    base_url: String,
    username: String,
    password: String,
    root: String,
    read_timeout: Duration,
    write_timeout: Duration,
    client: Client,
}

impl AlfrescoRepository {
    pub fn new(config: &RepositoryConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Request(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            root: config.root_node.clone(),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            client,
        })
    }

    fn node_url(&self, node: &str) -> String {
        format!("{}{API_PATH}/nodes/{node}", self.base_url)
    }

    fn read(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.read_timeout)
    }

    fn write(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.write_timeout)
    }

    fn node_from(response: Response) -> Result<RemoteNode, TransportError> {
        let body: Entry<NodeEntry> = check(response)?.json()?;
        Ok(body.entry.into())
    }
}

/// Turns non-success answers into errors, using Alfresco's brief summary
/// as the message when there is one.
fn check(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let message = response
        .json::<ErrorBody>()
        .ok()
        .and_then(|body| body.error.brief_summary)
        .unwrap_or_else(|| format!("{url}: {status}"));
    Err(match status {
        StatusCode::CONFLICT => TransportError::Conflict(message),
        StatusCode::NOT_FOUND => TransportError::NotFound(message),
        _ => TransportError::Status {
            status: status.as_u16(),
            message,
        },
    })
}

impl Repository for AlfrescoRepository {
    fn root(&self) -> &str {
        &self.root
    }

    fn find_child(&self, parent: &str, name: &str) -> Result<Option<RemoteNode>, TransportError> {
        let response = self
            .read(self.client.get(self.node_url(parent)))
            .query(&[("relativePath", name)])
            .send()?;
        match Self::node_from(response) {
            Ok(node) => Ok(Some(node)),
            Err(TransportError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteNode, TransportError> {
        log::debug!("creating folder {name} under {parent}");
        let response = self
            .write(self.client.post(format!("{}/children", self.node_url(parent))))
            .json(&json!({
                "name": name,
                "nodeType": "cm:folder",
                "properties": { "cm:title": name },
            }))
            .send()?;
        Self::node_from(response)
    }

    fn upload(&self, folder: &str, name: &str, bytes: &[u8]) -> Result<RemoteNode, TransportError> {
        let part = multipart::Part::bytes(bytes.to_vec())
            .file_name(name.to_string())
            .mime_str("application/pdf")?;
        let form = multipart::Form::new()
            .text("name", name.to_string())
            .text("nodeType", "cm:content")
            .part("filedata", part);

        let response = self
            .write(self.client.post(format!("{}/children", self.node_url(folder))))
            .multipart(form)
            .send()?;
        match Self::node_from(response) {
            Ok(node) => Ok(node),
            Err(TransportError::Conflict(_)) => {
                log::info!("{name} already exists in {folder}, storing a new version");
                let node = self
                    .find_child(folder, name)?
                    .ok_or_else(|| TransportError::NotFound(format!("{folder}/{name}")))?;
                self.put_new_version(&node.id, bytes)?;
                Ok(node)
            }
            Err(e) => Err(e),
        }
    }

    fn fetch(&self, node: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .read(self.client.get(format!("{}/content", self.node_url(node))))
            .send()?;
        Ok(check(response)?.bytes()?.to_vec())
    }

    fn put_new_version(&self, node: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let response = self
            .write(self.client.put(format!("{}/content", self.node_url(node))))
            .query(&[("majorVersion", "false")])
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(bytes.to_vec())
            .send()?;
        check(response)?;
        Ok(())
    }

    fn move_node(&self, node: &str, target_folder: &str) -> Result<(), TransportError> {
        let response = self
            .write(self.client.post(format!("{}/move", self.node_url(node))))
            .json(&json!({ "targetParentId": target_folder }))
            .send()?;
        check(response)?;
        Ok(())
    }

    fn download_url(&self, node: &str) -> String {
        format!("{}/content?attachment=true", self.node_url(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        let repo = AlfrescoRepository::new(&RepositoryConfig {
            base_url: "http://alfresco:8080/".to_string(),
            ..RepositoryConfig::default()
        })
        .unwrap();
        assert_eq!(repo.root(), "-root-");
        assert_eq!(
            repo.node_url("abc"),
            "http://alfresco:8080/alfresco/api/-default-/public/alfresco/versions/1/nodes/abc"
        );
        assert!(repo.download_url("abc").ends_with("/nodes/abc/content?attachment=true"));
    }

    #[test]
    fn node_entries() {
        let body: Entry<NodeEntry> = serde_json::from_str(
            r#"{"entry": {"id": "n-1", "name": "Flujos", "parentId": "p-0", "isFolder": true, "nodeType": "cm:folder"}}"#,
        )
        .unwrap();
        let node: RemoteNode = body.entry.into();
        assert_eq!(node.id, "n-1");
        assert_eq!(node.parent_id.as_deref(), Some("p-0"));
        assert!(node.is_folder);

        let error: ErrorBody = serde_json::from_str(
            r#"{"error": {"errorKey": "x", "statusCode": 409, "briefSummary": "Duplicate child name"}}"#,
        )
        .unwrap();
        assert_eq!(error.error.brief_summary.as_deref(), Some("Duplicate child name"));
    }
}
