//! Structured access to signature fields through the document's AcroForm,
//! complementing the raw byte scan of [`crate::extract`].

use std::collections::HashMap;
use std::ops::Range;

use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::asn1;
use crate::error::DocumentError;
use crate::report::Placement;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("file is not signed from the beginning")]
    WrongRangeStart,
    #[error("invalid signature range")]
    InvalidRange,
    #[error("signature range does not end at the end of a PDF file")]
    WrongRangeEnd,
}

struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

fn number_array<const N: usize>(doc: &Document, obj: &Object) -> lopdf::Result<[f32; N]> {
    doc.dereference(obj)?
        .1
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_float()))
        .collect::<lopdf::Result<ExactArrayOrNone<f32, N>>>()?
        .0
        .ok_or(lopdf::Error::Type)
}

/// Width of the page's media box, inherited through `/Parent` if needed.
pub fn page_width(doc: &Document, page_id: ObjectId) -> Result<f32, DocumentError> {
    let mut node = doc.get_dictionary(page_id)?;
    // Page trees are shallow; the bound only guards against /Parent loops.
    for _ in 0..64 {
        if let Ok(media_box) = node.get(b"MediaBox") {
            let [x0, _, x1, _] = number_array::<4>(doc, media_box)?;
            return Ok((x1 - x0).abs());
        }
        match node.get(b"Parent").and_then(Object::as_reference) {
            Ok(parent) => node = doc.get_dictionary(parent)?,
            Err(_) => break,
        }
    }
    Err(DocumentError::PdfParse(format!(
        "page {} {} R has no MediaBox",
        page_id.0, page_id.1
    )))
}

fn is_signature(field: &Dictionary) -> bool {
    matches!(field.get(b"FT"), Ok(Object::Name(ft)) if ft == b"Sig")
}

/// Page index and rectangle of every signed field, keyed by the SHA-256 of
/// the CMS blob so they can be joined with the scan results.
pub fn placements(pdf_bytes: &[u8]) -> Result<HashMap<String, Placement>, DocumentError> {
    let doc = Document::load_mem(pdf_bytes)?;
    let mut found = HashMap::new();

    let Ok(acro_form) = doc.get_dict_in_dict(doc.catalog()?, b"AcroForm") else {
        return Ok(found);
    };
    let Ok(fields) = acro_form.get_deref(b"Fields", &doc).and_then(Object::as_array) else {
        return Ok(found);
    };

    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for field_ref in fields {
        let Ok((field_id, Object::Dictionary(field))) = doc.dereference(field_ref) else {
            continue;
        };
        if !is_signature(field) {
            continue;
        }
        let Ok(contents) = field
            .get_deref(b"V", &doc)
            .and_then(Object::as_dict)
            .and_then(|sig| sig.get_deref(b"Contents", &doc))
            .and_then(Object::as_str)
        else {
            continue;
        };
        let Ok(rect) = field.get(b"Rect").and_then(|r| number_array::<4>(&doc, r)) else {
            continue;
        };
        let Some(page_index) = widget_page(&doc, &pages, field_id, field) else {
            continue;
        };

        let digest = hex::encode(Sha256::digest(asn1::trim_to_element(contents)));
        found.insert(digest, Placement { page_index, rect });
    }

    Ok(found)
}

/// The page holding the widget: its `/P` entry, or the page whose `/Annots`
/// lists it.
fn widget_page(
    doc: &Document,
    pages: &[ObjectId],
    widget_id: Option<ObjectId>,
    widget: &Dictionary,
) -> Option<usize> {
    if let Ok(page_id) = widget.get(b"P").and_then(Object::as_reference) {
        if let Some(index) = pages.iter().position(|&p| p == page_id) {
            return Some(index);
        }
    }
    let widget_id = widget_id?;
    pages.iter().position(|&page_id| {
        doc.get_dictionary(page_id)
            .and_then(|page| page.get_deref(b"Annots", doc))
            .and_then(Object::as_array)
            .map(|annots| {
                annots
                    .iter()
                    .any(|a| matches!(a, Object::Reference(id) if *id == widget_id))
            })
            .unwrap_or(false)
    })
}

/// Checks a `/ByteRange` and turns it into the two signed slices.
pub fn signed_ranges(
    byte_range: [i64; 4],
    pdf_len: usize,
) -> Result<[Range<usize>; 2], RangeError> {
    // For soundness, the signature must cover the file since the beginning.
    if byte_range[0] != 0 {
        return Err(RangeError::WrongRangeStart);
    }
    let [_, first_len, second_start, second_len] =
        byte_range.map(|v| usize::try_from(v).map_err(|_| RangeError::InvalidRange));
    let (first_len, second_start) = (first_len?, second_start?);
    let end = second_start
        .checked_add(second_len?)
        .ok_or(RangeError::InvalidRange)?;
    if first_len > second_start || end > pdf_len {
        return Err(RangeError::InvalidRange);
    }
    Ok([0..first_len, second_start..end])
}

/// The skipped gap must hold exactly the hex encoded `/Contents`, and the
/// second range must stop at an `%%EOF` marker.
pub fn check_coverage(
    pdf_bytes: &[u8],
    ranges: &[Range<usize>; 2],
    contents: &[u8],
) -> Result<(), RangeError> {
    let skipped = decode_pdf_hex_string(&pdf_bytes[ranges[0].end..ranges[1].start])
        .ok_or(RangeError::InvalidRange)?;
    if skipped != contents {
        return Err(RangeError::InvalidRange);
    }
    if !pdf_ends_with_eof(&pdf_bytes[..ranges[1].end]) {
        return Err(RangeError::WrongRangeEnd);
    }
    Ok(())
}

/// Decodes a `<...>` hex string as it appears in the file. Whitespace is
/// skipped and an odd final digit is padded with zero. None on any other
/// character.
pub fn decode_pdf_hex_string(raw: &[u8]) -> Option<Vec<u8>> {
    let inner = raw.strip_prefix(b"<")?.strip_suffix(b">")?;
    let mut digits: Vec<u8> = inner
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 == 1 {
        digits.push(b'0');
    }
    hex::decode(digits).ok()
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
pub fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}
