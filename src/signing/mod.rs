//! PDF signing: one detached PKCS #7 signature per signed page, each added
//! as its own incremental update so earlier signatures stay valid.

mod appearance;
mod increment;
pub mod layout;
mod serialize;

pub use appearance::Appearance;
pub use increment::{append_signature, last_startxref, SignatureField};
pub use layout::{signature_box, Position};

use chrono::Utc;
use lopdf::Document;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;

use crate::config::SigningConfig;
use crate::credential::Credential;
use crate::error::DocumentError;
use crate::pdf_fields;
use crate::signature_image::SignatureImage;

/// What a recipient signs with, besides the credential.
pub struct SigningRequest<'a> {
    /// Used in the field names, `Signature_{document_id}_{page}`.
    pub document_id: u64,
    pub image: &'a SignatureImage,
    pub position: Position,
    pub sign_all_pages: bool,
    pub role_label: &'a str,
    pub email: Option<&'a str>,
    pub city: Option<&'a str>,
}

pub fn signing_date_now() -> String {
    Utc::now().format("D:%Y%m%d%H%M%S+00'00'").to_string()
}

#[derive(Debug, Clone)]
pub struct PdfSigner {
    contents_reserve: usize,
}

impl Default for PdfSigner {
    fn default() -> Self {
        Self::new(&SigningConfig::default())
    }
}

impl PdfSigner {
    pub fn new(config: &SigningConfig) -> Self {
        Self {
            contents_reserve: config.contents_reserve,
        }
    }

    /// Signs the last page, or every page when `sign_all_pages` is set, and
    /// returns the complete signed document.
    pub fn sign(
        &self,
        pdf: &[u8],
        credential: &Credential,
        request: &SigningRequest,
    ) -> Result<Vec<u8>, DocumentError> {
        let appearance = Appearance::from_png_file(request.image.path())?;
        let page_count = Document::load_mem(pdf)?.get_pages().len();
        if page_count == 0 {
            return Err(DocumentError::PdfParse("document has no pages".to_string()));
        }
        let pages: Vec<usize> = if request.sign_all_pages {
            (0..page_count).collect()
        } else {
            vec![page_count - 1]
        };

        let signing_date = signing_date_now();
        let non_empty = |s: Option<&str>| s.filter(|s| !s.trim().is_empty()).map(str::to_string);

        let mut buffer = pdf.to_vec();
        for page_index in pages {
            let doc = Document::load_mem(&buffer)?;
            let page_id = doc
                .get_pages()
                .values()
                .nth(page_index)
                .copied()
                .ok_or_else(|| DocumentError::PdfParse(format!("page {page_index} not found")))?;
            let page_width = pdf_fields::page_width(&doc, page_id)?;
            let rect = signature_box(
                page_width,
                request.image.width(),
                request.image.height(),
                request.position,
            );

            let field = SignatureField {
                name: format!("Signature_{}_{}", request.document_id, page_index),
                page_id,
                rect,
                appearance: Some(&appearance),
                reason: Some(format!("Firma Digital - {}", request.role_label)),
                location: non_empty(request.city),
                contact_info: non_empty(request.email),
                signing_date: signing_date.clone(),
                certify: true,
                contents_reserve: self.contents_reserve,
            };
            let increment = append_signature(&buffer, &doc, &field, |data| {
                detached_pkcs7(credential, data)
            })?;
            buffer.extend(increment);
        }

        log::info!(
            "document {} signed at {} on {} page(s)",
            request.document_id,
            request.position,
            if request.sign_all_pages { page_count } else { 1 }
        );
        Ok(buffer)
    }
}

/// DER encoded detached PKCS #7 over `data`, with the credential's extra
/// certificates embedded for chain building.
pub fn detached_pkcs7(credential: &Credential, data: &[u8]) -> Result<Vec<u8>, DocumentError> {
    let mut extra = Stack::new()?;
    for cert in &credential.additional_certificates {
        extra.push(cert.clone())?;
    }
    let pkcs7 = Pkcs7::sign(
        &credential.certificate,
        &credential.private_key,
        &extra,
        data,
        Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
    )?;
    Ok(pkcs7.to_der()?)
}
