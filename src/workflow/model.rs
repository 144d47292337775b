//! Signature requests and the documents attached to them.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::signing::Position;

pub type WorkflowId = u64;
pub type DocumentId = u64;
pub type UserId = u64;

/// Recipient slots per request.
pub const MAX_RECIPIENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Draft,
    Sent,
    Signed,
    Moving,
    Completed,
    Cancelled,
    Rejected,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Draft => "DRAFT",
            WorkflowState::Sent => "SENT",
            WorkflowState::Signed => "SIGNED",
            WorkflowState::Moving => "MOVING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Cancelled => "CANCELLED",
            WorkflowState::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Cancelled | WorkflowState::Rejected
        )
    }

    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Draft, Sent)
                | (Draft, Cancelled)
                | (Sent, Signed)
                | (Sent, Rejected)
                | (Sent, Cancelled)
                | (Signed, Moving)
                | (Signed, Completed)
                | (Moving, Completed)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientSpec {
    pub user: UserId,
    /// Caption drawn above the signature, e.g. "Aprobado por:".
    pub role: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientSlot {
    pub user: UserId,
    pub role: String,
    pub position: Position,
    pub signed: bool,
    pub signed_at: Option<DateTime<Utc>>,
}

impl From<RecipientSpec> for RecipientSlot {
    fn from(spec: RecipientSpec) -> Self {
        RecipientSlot {
            user: spec.user,
            role: spec.role,
            position: spec.position,
            signed: false,
            signed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub opaque_background: bool,
    pub sign_all_pages: bool,
}

/// Where the documents of a request live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentSource {
    /// Bytes are attached to the request, and uploaded when it is sent.
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub node_id: String,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentContent {
    Local {
        original: Vec<u8>,
        signed: Option<Vec<u8>>,
    },
    /// Signed versions are stored as new versions of the same node.
    Remote(RemoteFile),
}

impl DocumentContent {
    pub fn local(bytes: Vec<u8>) -> Self {
        DocumentContent::Local {
            original: bytes,
            signed: None,
        }
    }

    pub fn remote(&self) -> Option<&RemoteFile> {
        match self {
            DocumentContent::Remote(file) => Some(file),
            DocumentContent::Local { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub id: DocumentId,
    pub name: String,
    pub content: DocumentContent,
    pub download_url: Option<String>,
    pub signed: bool,
    pub signed_at: Option<DateTime<Utc>>,
    /// Slots (1-based) whose signature this document already carries.
    pub signed_by_slots: Vec<usize>,
    pub moved_to_destination: bool,
    pub moved_at: Option<DateTime<Utc>>,
}

impl WorkflowDocument {
    pub fn new(id: DocumentId, name: impl Into<String>, content: DocumentContent) -> Self {
        WorkflowDocument {
            id,
            name: name.into(),
            content,
            download_url: None,
            signed: false,
            signed_at: None,
            signed_by_slots: Vec::new(),
            moved_to_destination: false,
            moved_at: None,
        }
    }

    pub fn is_signed_by(&self, slot: usize) -> bool {
        self.signed_by_slots.contains(&slot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub creator: UserId,
    pub slots: Vec<Option<RecipientSlot>>,
    /// 1-based index into `slots`, set only while the request is SENT.
    pub current_recipient: Option<usize>,
    pub options: WorkflowOptions,
    pub source: DocumentSource,
    pub destination_folder: Option<String>,
    pub documents_moved: bool,
    pub move_status: Option<String>,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub rejection_notes: Option<String>,
    pub documents: Vec<WorkflowDocument>,
    /// Bumped by the store on every successful update.
    pub version: u64,
}

impl Workflow {
    /// Filled slots with their 1-based index, in turn order.
    pub fn active_slots(&self) -> impl Iterator<Item = (usize, &RecipientSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|slot| (i + 1, slot)))
    }

    pub fn slot(&self, index: usize) -> Option<&RecipientSlot> {
        index
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut RecipientSlot> {
        index
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
    }

    pub fn current_slot(&self) -> Option<(usize, &RecipientSlot)> {
        let index = self.current_recipient?;
        self.slot(index).map(|slot| (index, slot))
    }

    /// The first active slot that has not signed yet.
    pub fn next_unsigned(&self) -> Option<usize> {
        self.active_slots()
            .find(|(_, slot)| !slot.signed)
            .map(|(index, _)| index)
    }

    /// Users that still have to sign, in turn order.
    pub fn pending_users(&self) -> Vec<UserId> {
        self.active_slots()
            .filter(|(_, slot)| !slot.signed)
            .map(|(_, slot)| slot.user)
            .collect()
    }

    pub fn all_signed(&self) -> bool {
        self.active_slots().all(|(_, slot)| slot.signed)
    }

    pub fn document(&self, id: DocumentId) -> Option<&WorkflowDocument> {
        self.documents.iter().find(|d| d.id == id)
    }

    /// Every broken consistency rule, described. Empty for a sound request.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.slots.len() > MAX_RECIPIENTS {
            violations.push(format!("{} recipient slots", self.slots.len()));
        }
        if self.active_slots().next().is_none() {
            violations.push("no recipients".to_string());
        }
        if let Err(e) = check_unique(self.active_slots().map(|(_, s)| (s.role.as_str(), s.position))) {
            violations.push(e.to_string());
        }

        match self.state {
            WorkflowState::Sent => match self.current_slot() {
                None => violations.push("SENT without a current recipient".to_string()),
                Some((index, slot)) => {
                    if slot.signed {
                        violations.push(format!("current recipient {index} already signed"));
                    }
                    if self
                        .active_slots()
                        .any(|(i, s)| i < index && !s.signed)
                    {
                        violations.push(format!("a recipient before {index} has not signed"));
                    }
                }
            },
            _ if self.current_recipient.is_some() => violations.push(format!(
                "current recipient set while {}",
                self.state
            )),
            _ => {}
        }

        if matches!(self.state, WorkflowState::Signed | WorkflowState::Moving | WorkflowState::Completed)
            && self.sent_at.is_some()
            && !self.all_signed()
        {
            violations.push(format!("{} with unsigned recipients", self.state));
        }
        violations
    }
}

fn check_unique<'a>(
    slots: impl Iterator<Item = (&'a str, Position)>,
) -> Result<(), WorkflowError> {
    let mut roles = HashSet::new();
    let mut positions = HashSet::new();
    for (role, position) in slots {
        if !roles.insert(role.trim()) || !positions.insert(position) {
            return Err(WorkflowError::DuplicateRoleOrPosition);
        }
    }
    Ok(())
}

/// Checks a recipient set before it is stored: between one and
/// [`MAX_RECIPIENTS`] filled slots, each with a role, no shared role or
/// position.
pub fn validate_recipients(slots: &[Option<RecipientSpec>]) -> Result<(), WorkflowError> {
    if slots.len() > MAX_RECIPIENTS {
        return Err(WorkflowError::InvalidRecipients(format!(
            "at most {MAX_RECIPIENTS} recipients are supported"
        )));
    }
    let active: Vec<&RecipientSpec> = slots.iter().flatten().collect();
    if active.is_empty() {
        return Err(WorkflowError::InvalidRecipients(
            "at least one recipient is required".to_string(),
        ));
    }
    if let Some(spec) = active.iter().find(|s| s.role.trim().is_empty()) {
        return Err(WorkflowError::InvalidRecipients(format!(
            "recipient {} has no role",
            spec.user
        )));
    }
    check_unique(active.iter().map(|s| (s.role.as_str(), s.position)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(user: UserId, role: &str, position: Position) -> Option<RecipientSpec> {
        Some(RecipientSpec {
            user,
            role: role.to_string(),
            position,
        })
    }

    #[test]
    fn transitions() {
        use WorkflowState::*;
        assert!(Draft.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Cancelled));
        assert!(Signed.can_transition_to(Completed));
        assert!(!Draft.can_transition_to(Signed));
        assert!(!Signed.can_transition_to(Cancelled));
        for terminal in [Completed, Cancelled, Rejected] {
            assert!(terminal.is_terminal());
            for next in [Draft, Sent, Signed, Moving, Completed, Cancelled, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn recipient_sets() {
        assert!(validate_recipients(&[
            spec(1, "Aprobado por:", Position::Left),
            None,
            spec(2, "Revisado por:", Position::Right),
        ])
        .is_ok());

        assert!(matches!(
            validate_recipients(&[None, None]),
            Err(WorkflowError::InvalidRecipients(_))
        ));
        assert!(matches!(
            validate_recipients(&[
                spec(1, "Aprobado por:", Position::Left),
                spec(2, "Aprobado por:", Position::Right),
            ]),
            Err(WorkflowError::DuplicateRoleOrPosition)
        ));
        assert!(matches!(
            validate_recipients(&[
                spec(1, "Aprobado por:", Position::Left),
                spec(2, "Revisado por:", Position::Left),
            ]),
            Err(WorkflowError::DuplicateRoleOrPosition)
        ));
        assert!(matches!(
            validate_recipients(&[spec(1, " ", Position::Left)]),
            Err(WorkflowError::InvalidRecipients(_))
        ));
        assert!(matches!(
            validate_recipients(&vec![spec(1, "a", Position::Left); 5]),
            Err(WorkflowError::InvalidRecipients(_))
        ));
    }

    #[test]
    fn slot_navigation() {
        let mut workflow = Workflow {
            id: 1,
            name: "Compra".to_string(),
            creator: 9,
            slots: vec![
                None,
                spec(1, "A", Position::Left).map(Into::into),
                spec(2, "B", Position::Right).map(Into::into),
            ],
            current_recipient: Some(2),
            options: WorkflowOptions::default(),
            source: DocumentSource::Local,
            destination_folder: None,
            documents_moved: false,
            move_status: None,
            state: WorkflowState::Sent,
            created_at: Utc::now(),
            sent_at: Some(Utc::now()),
            signed_at: None,
            completed_at: None,
            rejected_at: None,
            notes: None,
            rejection_notes: None,
            documents: Vec::new(),
            version: 1,
        };
        assert!(workflow.slot(0).is_none());
        assert!(workflow.slot(1).is_none());
        assert_eq!(workflow.next_unsigned(), Some(2));
        assert_eq!(workflow.pending_users(), [1, 2]);
        assert!(workflow.invariant_violations().is_empty());

        workflow.current_recipient = Some(3);
        assert_eq!(workflow.invariant_violations().len(), 1);

        workflow.slot_mut(2).unwrap().signed = true;
        assert!(workflow.invariant_violations().is_empty());
        assert_eq!(workflow.next_unsigned(), Some(3));

        workflow.state = WorkflowState::Completed;
        assert_eq!(workflow.invariant_violations().len(), 2);
    }
}
