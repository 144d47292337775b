//! Reusable recipient sets.

use serde::{Deserialize, Serialize};

use super::model::{
    validate_recipients, DocumentSource, RecipientSpec, UserId, Workflow, WorkflowOptions,
};
use super::NewWorkflow;
use crate::error::WorkflowError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub recipients: Vec<Option<RecipientSpec>>,
    pub options: WorkflowOptions,
    pub source: DocumentSource,
    pub destination_folder: Option<String>,
}

impl WorkflowTemplate {
    pub fn new(
        name: impl Into<String>,
        recipients: Vec<Option<RecipientSpec>>,
        options: WorkflowOptions,
    ) -> Result<Self, WorkflowError> {
        validate_recipients(&recipients)?;
        Ok(WorkflowTemplate {
            name: name.into(),
            recipients,
            options,
            source: DocumentSource::default(),
            destination_folder: None,
        })
    }

    /// Saves the recipient set and options of an existing request.
    pub fn from_workflow(name: impl Into<String>, workflow: &Workflow) -> Self {
        WorkflowTemplate {
            name: name.into(),
            recipients: workflow
                .slots
                .iter()
                .map(|slot| {
                    slot.as_ref().map(|slot| RecipientSpec {
                        user: slot.user,
                        role: slot.role.clone(),
                        position: slot.position,
                    })
                })
                .collect(),
            options: workflow.options,
            source: workflow.source,
            destination_folder: workflow.destination_folder.clone(),
        }
    }

    pub fn instantiate(&self, name: impl Into<String>, creator: UserId) -> NewWorkflow {
        NewWorkflow {
            name: name.into(),
            creator,
            recipients: self.recipients.clone(),
            options: self.options,
            source: self.source,
            destination_folder: self.destination_folder.clone(),
            notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::Position;

    #[test]
    fn instantiates_a_request() {
        let template = WorkflowTemplate::new(
            "Compras",
            vec![
                Some(RecipientSpec {
                    user: 4,
                    role: "Aprobado por:".to_string(),
                    position: Position::Left,
                }),
                None,
            ],
            WorkflowOptions {
                opaque_background: true,
                sign_all_pages: false,
            },
        )
        .unwrap();

        let request = template.instantiate("Orden 118", 2);
        assert_eq!(request.name, "Orden 118");
        assert_eq!(request.creator, 2);
        assert_eq!(request.recipients, template.recipients);
        assert!(request.options.opaque_background);
    }

    #[test]
    fn refuses_duplicate_positions() {
        let slot = |user, role: &str| {
            Some(RecipientSpec {
                user,
                role: role.to_string(),
                position: Position::Right,
            })
        };
        assert!(matches!(
            WorkflowTemplate::new("x", vec![slot(1, "A"), slot(2, "B")], WorkflowOptions::default()),
            Err(WorkflowError::DuplicateRoleOrPosition)
        ));
    }
}
