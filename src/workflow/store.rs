//! Persistence of signature requests.
//!
//! Updates are optimistic: a write only succeeds if the stored version is
//! the one the caller read, so two recipients acting at once can not both
//! advance the same turn.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::model::{DocumentId, Workflow, WorkflowId};
use crate::error::StoreError;

pub trait WorkflowStore: Send + Sync {
    /// Stores a new request, assigning its id and its first version.
    fn insert(&self, workflow: Workflow) -> Result<Workflow, StoreError>;

    fn get(&self, id: WorkflowId) -> Result<Workflow, StoreError>;

    /// Replaces the stored request if its version still matches, and returns
    /// it with the new version.
    fn update(&self, workflow: Workflow) -> Result<Workflow, StoreError>;

    fn delete(&self, id: WorkflowId) -> Result<(), StoreError>;

    fn list(&self) -> Vec<Workflow>;

    fn next_document_id(&self) -> DocumentId;
}

#[derive(Default)]
struct Tables {
    last_workflow_id: WorkflowId,
    last_document_id: DocumentId,
    workflows: BTreeMap<WorkflowId, Workflow>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryStore {
    fn insert(&self, mut workflow: Workflow) -> Result<Workflow, StoreError> {
        let mut tables = self.tables.lock();
        tables.last_workflow_id += 1;
        workflow.id = tables.last_workflow_id;
        workflow.version = 1;
        tables.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    fn get(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        self.tables
            .lock()
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn update(&self, mut workflow: Workflow) -> Result<Workflow, StoreError> {
        let mut tables = self.tables.lock();
        let stored = tables
            .workflows
            .get_mut(&workflow.id)
            .ok_or(StoreError::NotFound(workflow.id))?;
        if stored.version != workflow.version {
            return Err(StoreError::ConcurrentModification(workflow.id));
        }
        workflow.version += 1;
        *stored = workflow.clone();
        Ok(workflow)
    }

    fn delete(&self, id: WorkflowId) -> Result<(), StoreError> {
        self.tables
            .lock()
            .workflows
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self) -> Vec<Workflow> {
        self.tables.lock().workflows.values().cloned().collect()
    }

    fn next_document_id(&self) -> DocumentId {
        let mut tables = self.tables.lock();
        tables.last_document_id += 1;
        tables.last_document_id
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::workflow::model::{DocumentSource, WorkflowOptions, WorkflowState};

    fn draft() -> Workflow {
        Workflow {
            id: 0,
            name: "Contrato".to_string(),
            creator: 1,
            slots: Vec::new(),
            current_recipient: None,
            options: WorkflowOptions::default(),
            source: DocumentSource::Remote,
            destination_folder: None,
            documents_moved: false,
            move_status: None,
            state: WorkflowState::Draft,
            created_at: Utc::now(),
            sent_at: None,
            signed_at: None,
            completed_at: None,
            rejected_at: None,
            notes: None,
            rejection_notes: None,
            documents: Vec::new(),
            version: 0,
        }
    }

    #[test]
    fn stale_writes_are_refused() {
        let store = MemoryStore::new();
        let stored = store.insert(draft()).unwrap();
        assert_eq!((stored.id, stored.version), (1, 1));

        let first = store.get(1).unwrap();
        let second = store.get(1).unwrap();

        let updated = store.update(first).unwrap();
        assert_eq!(updated.version, 2);
        assert!(matches!(
            store.update(second),
            Err(StoreError::ConcurrentModification(1))
        ));
        assert_eq!(store.get(1).unwrap().version, 2);
    }

    #[test]
    fn ids_and_deletion() {
        let store = MemoryStore::new();
        store.insert(draft()).unwrap();
        let second = store.insert(draft()).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(store.next_document_id(), 1);
        assert_eq!(store.next_document_id(), 2);

        store.delete(1).unwrap();
        assert!(matches!(store.get(1), Err(StoreError::NotFound(1))));
        assert!(store.delete(1).is_err());
        assert_eq!(store.list().len(), 1);
    }
}
