//! Multi-recipient signature requests.

pub mod directory;
mod engine;
pub mod messaging;
mod model;
pub mod store;
mod template;

pub use directory::{credential_report, CredentialStatus, Directory, MemoryDirectory, User};
pub use engine::{DocumentFailure, NewDocument, NewWorkflow, SignOutcome, WorkflowEngine};
pub use messaging::{Activity, ActivityKind, MemoryMessenger, Message, Messenger};
pub use model::{
    validate_recipients, DocumentContent, DocumentId, DocumentSource, RecipientSlot,
    RecipientSpec, RemoteFile, UserId, Workflow, WorkflowDocument, WorkflowId, WorkflowOptions,
    WorkflowState, MAX_RECIPIENTS,
};
pub use store::{MemoryStore, WorkflowStore};
pub use template::WorkflowTemplate;
