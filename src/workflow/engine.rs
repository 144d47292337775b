//! Ordered signature requests: sending, signing turn by turn, rejection and
//! finalization.
//!
//! Every operation reads the request, checks it, changes it and writes it
//! back with an optimistic version check, then notifies. A notification
//! failure is logged and never undoes a state change.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::directory::{Directory, User};
use super::messaging::{ActivityKind, Messenger};
use super::model::{
    validate_recipients, DocumentContent, DocumentId, DocumentSource, RecipientSpec, UserId,
    Workflow, WorkflowDocument, WorkflowId, WorkflowOptions, WorkflowState,
};
use super::store::WorkflowStore;
use crate::config::SigningConfig;
use crate::credential::{self, Credential, CredentialOverrides};
use crate::error::{DocumentError, Error, Result, WorkflowError};
use crate::orchestrator::DocumentOrchestrator;
use crate::signature_image::{ImageComposer, SignatureImage};
use crate::signing::{PdfSigner, Position, SigningRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    pub creator: UserId,
    pub recipients: Vec<Option<RecipientSpec>>,
    pub options: WorkflowOptions,
    pub source: DocumentSource,
    pub destination_folder: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub content: DocumentContent,
}

#[derive(Debug)]
pub struct DocumentFailure {
    pub document: DocumentId,
    pub name: String,
    pub error: Error,
}

/// What a recipient's signature led to.
#[derive(Debug)]
pub enum SignOutcome {
    /// The turn passed to the next recipient.
    Advanced { workflow: Workflow, next_user: UserId },
    /// That was the last signature; the request is COMPLETED.
    Completed { workflow: Workflow },
    /// Some documents could not be signed. The turn stays with the same
    /// recipient, and a retry only signs the documents listed here.
    Incomplete {
        workflow: Workflow,
        failures: Vec<DocumentFailure>,
    },
}

impl SignOutcome {
    pub fn workflow(&self) -> &Workflow {
        match self {
            SignOutcome::Advanced { workflow, .. }
            | SignOutcome::Completed { workflow }
            | SignOutcome::Incomplete { workflow, .. } => workflow,
        }
    }
}

fn wrong_state(expected: &str, actual: WorkflowState) -> WorkflowError {
    WorkflowError::WrongState {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn transition(workflow: &mut Workflow, next: WorkflowState) -> std::result::Result<(), WorkflowError> {
    if !workflow.state.can_transition_to(next) {
        return Err(WorkflowError::WrongState {
            expected: format!("a state leading to {next}"),
            actual: workflow.state.to_string(),
        });
    }
    log::info!("request {}: {} -> {next}", workflow.id, workflow.state);
    workflow.state = next;
    Ok(())
}

fn best_effort<T>(what: &str, result: anyhow::Result<T>) {
    if let Err(e) = result {
        log::warn!("{what} failed: {e:#}");
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    messenger: Arc<dyn Messenger>,
    directory: Arc<dyn Directory>,
    orchestrator: DocumentOrchestrator,
    signer: PdfSigner,
    composer: ImageComposer,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        messenger: Arc<dyn Messenger>,
        directory: Arc<dyn Directory>,
        orchestrator: DocumentOrchestrator,
        signing: &SigningConfig,
    ) -> Self {
        Self {
            store,
            messenger,
            directory,
            orchestrator,
            signer: PdfSigner::new(signing),
            composer: ImageComposer::from_config(signing),
        }
    }

    pub fn get(&self, id: WorkflowId) -> Result<Workflow> {
        Ok(self.store.get(id)?)
    }

    fn user(&self, id: UserId) -> Result<User> {
        Ok(self
            .directory
            .user(id)
            .ok_or(WorkflowError::UnknownUser(id))?)
    }

    /// The creator, or an administrator.
    fn require_owner(&self, workflow: &Workflow, actor: UserId) -> Result<()> {
        let user = self.user(actor)?;
        if workflow.creator == actor || user.is_admin {
            Ok(())
        } else {
            Err(WorkflowError::NotPermitted.into())
        }
    }

    pub fn create(&self, new: NewWorkflow) -> Result<Workflow> {
        validate_recipients(&new.recipients)?;
        self.user(new.creator)?;
        for spec in new.recipients.iter().flatten() {
            self.user(spec.user)?;
        }

        let workflow = Workflow {
            id: 0,
            name: new.name,
            creator: new.creator,
            slots: new.recipients.into_iter().map(|r| r.map(Into::into)).collect(),
            current_recipient: None,
            options: new.options,
            source: new.source,
            destination_folder: new.destination_folder,
            documents_moved: false,
            move_status: None,
            state: WorkflowState::Draft,
            created_at: Utc::now(),
            sent_at: None,
            signed_at: None,
            completed_at: None,
            rejected_at: None,
            notes: new.notes,
            rejection_notes: None,
            documents: Vec::new(),
            version: 0,
        };
        let workflow = self.store.insert(workflow)?;
        log::info!("request {} created: {}", workflow.id, workflow.name);
        Ok(workflow)
    }

    pub fn add_document(&self, id: WorkflowId, actor: UserId, new: NewDocument) -> Result<Workflow> {
        let mut workflow = self.store.get(id)?;
        self.require_owner(&workflow, actor)?;
        if workflow.state != WorkflowState::Draft {
            return Err(wrong_state("DRAFT", workflow.state).into());
        }

        let mut document = WorkflowDocument::new(self.store.next_document_id(), new.name, new.content);
        document.download_url = document
            .content
            .remote()
            .map(|file| self.orchestrator.download_url(file));
        workflow.documents.push(document);
        Ok(self.store.update(workflow)?)
    }

    pub fn send_for_signature(&self, id: WorkflowId, actor: UserId) -> Result<Workflow> {
        let mut workflow = self.store.get(id)?;
        self.require_owner(&workflow, actor)?;
        if workflow.state != WorkflowState::Draft {
            return Err(wrong_state("DRAFT", workflow.state).into());
        }
        if workflow.documents.is_empty() {
            return Err(DocumentError::NoDocuments.into());
        }
        let first = workflow
            .next_unsigned()
            .ok_or_else(|| WorkflowError::InvalidRecipients("no recipients".to_string()))?;

        let has_local = workflow
            .documents
            .iter()
            .any(|d| d.content.remote().is_none());
        if workflow.source == DocumentSource::Local && has_local {
            let creator = self.user(workflow.creator)?;
            let folder = self.orchestrator.workflow_folder(&creator.login, &workflow.name)?;
            let summary = self
                .orchestrator
                .upload_local_documents(&mut workflow.documents, &folder);
            if summary.uploaded == 0 {
                if let Some((_, e)) = summary.failures.into_iter().next() {
                    return Err(e.into());
                }
            } else if !summary.failures.is_empty() {
                log::warn!(
                    "request {}: {} document(s) could not be uploaded and stay local",
                    workflow.id,
                    summary.failures.len()
                );
            }
        }

        transition(&mut workflow, WorkflowState::Sent)?;
        workflow.current_recipient = Some(first);
        workflow.sent_at = Some(Utc::now());
        let workflow = self.store.update(workflow)?;

        self.request_signature(&workflow, first);
        Ok(workflow)
    }

    /// Activity and message for the recipient in `slot`.
    fn request_signature(&self, workflow: &Workflow, slot: usize) {
        let Some(recipient) = workflow.slot(slot) else {
            return;
        };
        let documents: Vec<&str> = workflow.documents.iter().map(|d| d.name.as_str()).collect();
        let mut note = format!(
            "Documentos: {}\nRol de firma: {}\nPosición de firma: {}",
            documents.join(", "),
            recipient.role,
            recipient.position
        );
        if let Some(notes) = &workflow.notes {
            note.push_str(&format!("\nNotas: {notes}"));
        }

        best_effort(
            "creating the signature activity",
            self.messenger.create_activity(
                workflow.id,
                recipient.user,
                ActivityKind::SignatureRequired,
                &format!("Firma requerida: {}", workflow.name),
                &note,
            ),
        );
        best_effort(
            "notifying the recipient",
            self.messenger.post_message(
                workflow.id,
                recipient.user,
                &format!("Nueva solicitud de firma: {}", workflow.name),
                &note,
            ),
        );
    }

    pub fn sign(
        &self,
        id: WorkflowId,
        actor: UserId,
        overrides: &CredentialOverrides,
    ) -> Result<SignOutcome> {
        let mut workflow = self.store.get(id)?;
        let user = self.user(actor)?;
        if workflow.state != WorkflowState::Sent {
            return Err(wrong_state("SENT", workflow.state).into());
        }
        let (index, slot) = workflow
            .current_slot()
            .ok_or(WorkflowError::NotCurrentRecipient)?;
        if slot.user != actor {
            let signed_before = workflow
                .active_slots()
                .any(|(_, s)| s.user == actor && s.signed);
            return Err(if signed_before {
                WorkflowError::AlreadySigned
            } else {
                WorkflowError::NotCurrentRecipient
            }
            .into());
        }
        if slot.signed {
            return Err(WorkflowError::AlreadySigned.into());
        }
        let role = slot.role.clone();
        let position = slot.position;

        let resolved = credential::resolve(overrides, Some(&user.credentials))?;
        let credential = Credential::from_pkcs12(&resolved.p12, &resolved.password)?;
        let image = self
            .composer
            .compose(&resolved.image, &role, workflow.options.opaque_background)?;

        let context = SigningContext {
            credential: &credential,
            image: &image,
            role: &role,
            position,
            sign_all_pages: workflow.options.sign_all_pages,
            email: user.email.as_deref(),
            city: user.city.as_deref(),
        };
        let mut failures = Vec::new();
        for document in workflow
            .documents
            .iter_mut()
            .filter(|d| !d.is_signed_by(index))
        {
            match self.sign_document(document, &context) {
                Ok(()) => document.signed_by_slots.push(index),
                Err(error) => {
                    log::warn!("request {id}: signing {} failed: {error}", document.name);
                    failures.push(DocumentFailure {
                        document: document.id,
                        name: document.name.clone(),
                        error,
                    });
                }
            }
        }

        if !failures.is_empty() {
            let workflow = self.store.update(workflow)?;
            return Ok(SignOutcome::Incomplete { workflow, failures });
        }

        if let Some(slot) = workflow.slot_mut(index) {
            slot.signed = true;
            slot.signed_at = Some(Utc::now());
        }
        log::info!("request {id}: recipient {index} signed");

        match workflow.next_unsigned() {
            Some(next) => {
                workflow.current_recipient = Some(next);
                let workflow = self.store.update(workflow)?;
                best_effort(
                    "dismissing the signer's activity",
                    self.messenger.dismiss_activities(id, Some(actor)),
                );
                self.request_signature(&workflow, next);
                self.report_progress(&workflow, &user);
                let next_user = workflow.slot(next).map_or(0, |s| s.user);
                Ok(SignOutcome::Advanced {
                    workflow,
                    next_user,
                })
            }
            None => {
                transition(&mut workflow, WorkflowState::Signed)?;
                workflow.current_recipient = None;
                workflow.signed_at = Some(Utc::now());
                let workflow = self.store.update(workflow)?;
                best_effort(
                    "dismissing the signer's activity",
                    self.messenger.dismiss_activities(id, Some(actor)),
                );
                let workflow = self.finalize(workflow)?;
                Ok(SignOutcome::Completed { workflow })
            }
        }
    }

    fn sign_document(&self, document: &mut WorkflowDocument, context: &SigningContext) -> Result<()> {
        let bytes = self.orchestrator.resolve_source(document)?;
        let request = SigningRequest {
            document_id: document.id,
            image: context.image,
            position: context.position,
            sign_all_pages: context.sign_all_pages,
            role_label: context.role,
            email: context.email,
            city: context.city,
        };
        let signed = self.signer.sign(&bytes, context.credential, &request)?;
        self.orchestrator.write_back(document, signed)?;
        Ok(())
    }

    /// Tells the creator who signed and who is still missing.
    fn report_progress(&self, workflow: &Workflow, signer: &User) {
        let pending: Vec<String> = workflow
            .pending_users()
            .into_iter()
            .map(|id| self.directory.user(id).map_or_else(|| id.to_string(), |u| u.name))
            .collect();
        best_effort(
            "notifying the creator",
            self.messenger.post_message(
                workflow.id,
                workflow.creator,
                &format!("Documentos firmados: {}", workflow.name),
                &format!(
                    "Documentos firmados por {}. Pendientes: {}",
                    signer.name,
                    pending.join(", ")
                ),
            ),
        );
    }

    /// SIGNED to COMPLETED, moving the documents to the destination folder
    /// on the way if there is one. Move failures only end up in
    /// `move_status`.
    fn finalize(&self, mut workflow: Workflow) -> Result<Workflow> {
        if let Some(destination) = workflow.destination_folder.clone() {
            transition(&mut workflow, WorkflowState::Moving)?;
            workflow = self.store.update(workflow)?;

            let summary = self
                .orchestrator
                .move_documents(&mut workflow.documents, &destination);
            workflow.documents_moved = summary.moved() > 0;
            workflow.move_status = Some(summary.status_text());
            log::info!(
                "request {}: moved {}, failed {}",
                workflow.id,
                summary.moved(),
                summary.failed()
            );
        }

        transition(&mut workflow, WorkflowState::Completed)?;
        workflow.completed_at = Some(Utc::now());
        let workflow = self.store.update(workflow)?;

        best_effort(
            "creating the completion activity",
            self.messenger.create_activity(
                workflow.id,
                workflow.creator,
                ActivityKind::Completed,
                &format!("Firma completada: {}", workflow.name),
                "Todos los destinatarios han firmado los documentos.",
            ),
        );
        best_effort(
            "notifying the creator",
            self.messenger.post_message(
                workflow.id,
                workflow.creator,
                "Firma Completada",
                "Todos los destinatarios han firmado los documentos.",
            ),
        );
        Ok(workflow)
    }

    pub fn reject(&self, id: WorkflowId, actor: UserId, notes: &str) -> Result<Workflow> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(WorkflowError::MissingRejectionNotes.into());
        }
        let mut workflow = self.store.get(id)?;
        let user = self.user(actor)?;
        if workflow.state != WorkflowState::Sent {
            return Err(wrong_state("SENT", workflow.state).into());
        }
        if workflow.current_slot().map(|(_, s)| s.user) != Some(actor) {
            return Err(WorkflowError::NotCurrentRecipient.into());
        }

        transition(&mut workflow, WorkflowState::Rejected)?;
        workflow.current_recipient = None;
        workflow.rejected_at = Some(Utc::now());
        workflow.rejection_notes = Some(notes.to_string());
        let workflow = self.store.update(workflow)?;

        best_effort(
            "dismissing activities",
            self.messenger.dismiss_activities(id, None),
        );
        best_effort(
            "notifying the creator",
            self.messenger.post_message(
                id,
                workflow.creator,
                "Solicitud Rechazada",
                &format!("Solicitud rechazada por {}\nMotivo: {notes}", user.name),
            ),
        );
        Ok(workflow)
    }

    pub fn cancel(&self, id: WorkflowId, actor: UserId) -> Result<Workflow> {
        let mut workflow = self.store.get(id)?;
        self.require_owner(&workflow, actor)?;
        if !matches!(workflow.state, WorkflowState::Draft | WorkflowState::Sent) {
            return Err(wrong_state("DRAFT or SENT", workflow.state).into());
        }

        transition(&mut workflow, WorkflowState::Cancelled)?;
        workflow.current_recipient = None;
        let workflow = self.store.update(workflow)?;
        best_effort(
            "dismissing activities",
            self.messenger.dismiss_activities(id, None),
        );
        Ok(workflow)
    }

    /// Reminds the current recipient, whose user id is returned.
    pub fn send_reminder(&self, id: WorkflowId, actor: UserId) -> Result<UserId> {
        let workflow = self.store.get(id)?;
        self.require_owner(&workflow, actor)?;
        if workflow.state != WorkflowState::Sent {
            return Err(wrong_state("SENT", workflow.state).into());
        }
        let (_, slot) = workflow
            .current_slot()
            .ok_or(WorkflowError::NotCurrentRecipient)?;

        let sent = workflow
            .sent_at
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        best_effort(
            "sending the reminder",
            self.messenger.post_message(
                id,
                slot.user,
                &format!("Recordatorio: Firma Pendiente - {}", workflow.name),
                &format!(
                    "Tiene pendiente la firma de documentos.\nSolicitud: {}\nEnviado: {sent}\nDocumentos: {} archivo(s)",
                    workflow.name,
                    workflow.documents.len()
                ),
            ),
        );
        Ok(slot.user)
    }

    /// Completes a request left in SIGNED, for instance after a failure
    /// between the last signature and the move.
    pub fn mark_completed(&self, id: WorkflowId, actor: UserId) -> Result<Workflow> {
        let workflow = self.store.get(id)?;
        self.require_owner(&workflow, actor)?;
        if workflow.state != WorkflowState::Signed {
            return Err(wrong_state("SIGNED", workflow.state).into());
        }
        self.finalize(workflow)
    }

    pub fn delete(&self, id: WorkflowId, actor: UserId) -> Result<()> {
        let workflow = self.store.get(id)?;
        self.require_owner(&workflow, actor)?;
        self.store.delete(id)?;
        log::info!("request {id} deleted by user {actor}");
        best_effort(
            "dismissing activities",
            self.messenger.dismiss_activities(id, None),
        );
        Ok(())
    }
}

struct SigningContext<'a> {
    credential: &'a Credential,
    image: &'a SignatureImage,
    role: &'a str,
    position: Position,
    sign_all_pages: bool,
    email: Option<&'a str>,
    city: Option<&'a str>,
}
