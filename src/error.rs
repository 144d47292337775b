use serde::Serialize;
use thiserror::Error;

/// Which part of the system failed, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Credential,
    Document,
    Workflow,
    Transport,
    Storage,
}

/// Top level error returned by the workflow engine and the signer.
///
/// Chain problems never show up here: the validator reports them as
/// [`crate::report::Diagnostic`]s on the signer report.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Credential(_) => ErrorKind::Credential,
            Error::Document(_) => ErrorKind::Document,
            Error::Workflow(_) => ErrorKind::Workflow,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Stable subcode, suitable for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Credential(e) => e.code(),
            Error::Document(e) => e.code(),
            Error::Workflow(e) => e.code(),
            Error::Transport(e) => e.code(),
            Error::Storage(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("wrong password for the certificate file")]
    BadPassword,
    #[error("malformed PKCS #12 file: {0}")]
    MalformedP12(String),
    #[error("no signature image available")]
    MissingImage,
    #[error("no PKCS #12 certificate available")]
    MissingCertificate,
    #[error("no certificate password available")]
    MissingPassword,
    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),
    #[error("signature image can not be decoded: {0}")]
    InvalidImage(String),
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::BadPassword => "BAD_PASSWORD",
            CredentialError::MalformedP12(_) => "MALFORMED_P12",
            CredentialError::MissingImage => "MISSING_IMAGE",
            CredentialError::MissingCertificate => "MISSING_CERTIFICATE",
            CredentialError::MissingPassword => "MISSING_PASSWORD",
            CredentialError::UnsupportedKey(_) => "UNSUPPORTED_KEY",
            CredentialError::InvalidImage(_) => "INVALID_IMAGE",
        }
    }
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("PDF parsing error: {0}")]
    PdfParse(String),
    #[error("signing failed: {0}")]
    SignFailure(String),
    #[error("no signatures found in the document")]
    NoSignaturesFound,
    #[error("the request has no documents")]
    NoDocuments,
}

impl DocumentError {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentError::PdfParse(_) => "PDF_PARSE_ERROR",
            DocumentError::SignFailure(_) => "SIGN_FAILURE",
            DocumentError::NoSignaturesFound => "NO_SIGNATURES_FOUND",
            DocumentError::NoDocuments => "NO_DOCUMENTS",
        }
    }
}

impl From<lopdf::Error> for DocumentError {
    fn from(e: lopdf::Error) -> Self {
        DocumentError::PdfParse(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for DocumentError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        DocumentError::SignFailure(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("user is not the current recipient")]
    NotCurrentRecipient,
    #[error("recipient has already signed")]
    AlreadySigned,
    #[error("operation not allowed in state {actual} (expected {expected})")]
    WrongState { expected: String, actual: String },
    #[error("two recipients share the same role or position")]
    DuplicateRoleOrPosition,
    #[error("invalid recipient set: {0}")]
    InvalidRecipients(String),
    #[error("operation reserved to the creator or an administrator")]
    NotPermitted,
    #[error("rejection notes are required")]
    MissingRejectionNotes,
    #[error("unknown user {0}")]
    UnknownUser(u64),
    #[error("signature request {0} not found")]
    NotFound(u64),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::NotCurrentRecipient => "NOT_CURRENT_RECIPIENT",
            WorkflowError::AlreadySigned => "ALREADY_SIGNED",
            WorkflowError::WrongState { .. } => "WRONG_STATE",
            WorkflowError::DuplicateRoleOrPosition => "DUPLICATE_ROLE_OR_POSITION",
            WorkflowError::InvalidRecipients(_) => "INVALID_RECIPIENTS",
            WorkflowError::NotPermitted => "NOT_PERMITTED",
            WorkflowError::MissingRejectionNotes => "MISSING_REJECTION_NOTES",
            WorkflowError::UnknownUser(_) => "UNKNOWN_USER",
            WorkflowError::NotFound(_) => "NOT_FOUND",
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("repository request timed out: {0}")]
    Timeout(String),
    #[error("repository answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("node already exists: {0}")]
    Conflict(String),
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("repository request failed: {0}")]
    Request(String),
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "TIMEOUT",
            TransportError::Status { .. } => "HTTP_STATUS",
            TransportError::Conflict(_) => "CONFLICT",
            TransportError::NotFound(_) => "NOT_FOUND",
            TransportError::Request(_) => "REQUEST_FAILED",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("signature request {0} was modified concurrently")]
    ConcurrentModification(u64),
    #[error("signature request {0} not found")]
    NotFound(u64),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            StoreError::NotFound(_) => "NOT_FOUND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        let err: Error = CredentialError::BadPassword.into();
        assert_eq!(err.kind(), ErrorKind::Credential);
        assert_eq!(err.code(), "BAD_PASSWORD");

        let err: Error = WorkflowError::NotCurrentRecipient.into();
        assert_eq!(err.kind(), ErrorKind::Workflow);
        assert_eq!(err.code(), "NOT_CURRENT_RECIPIENT");

        let err: Error = DocumentError::PdfParse("bad xref".into()).into();
        assert_eq!(err.code(), "PDF_PARSE_ERROR");
    }
}
