//! Appends one signature to a PDF as an incremental update.
//!
//! The update holds the new signature dictionary, its widget annotation and
//! appearance, the catalog, AcroForm and page objects that had to change,
//! and a classic cross-reference section chained to the previous one with
//! `/Prev`. The original bytes are never touched.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use regex::bytes::Regex;

use super::appearance::Appearance;
use super::serialize::{text_string, write_object};
use crate::error::DocumentError;

const BYTE_RANGE_PLACEHOLDER: &[u8] = b"[0 0000000000 0000000000 0000000000]";

lazy_static::lazy_static! {
    static ref STARTXREF_REGEX: Regex = Regex::new(r"startxref\s+(\d+)\s*%%EOF").unwrap();
}

/// Everything about one signature field besides the CMS blob.
pub struct SignatureField<'a> {
    /// Requested `/T`; a suffix is added if the document already has it.
    pub name: String,
    pub page_id: ObjectId,
    pub rect: [f32; 4],
    pub appearance: Option<&'a Appearance>,
    pub reason: Option<String>,
    pub location: Option<String>,
    pub contact_info: Option<String>,
    /// PDF date string, `D:YYYYMMDDHHMMSS+00'00'`.
    pub signing_date: String,
    /// Make this a certification signature, unless the document is already
    /// certified.
    pub certify: bool,
    /// Bytes reserved for the DER encoded CMS blob.
    pub contents_reserve: usize,
}

struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    fn new(doc: &Document) -> Self {
        let size = doc
            .trailer
            .get(b"Size")
            .and_then(Object::as_i64)
            .unwrap_or(0)
            .max(0) as u32;
        Self {
            next: size.max(doc.max_id + 1),
        }
    }

    fn next(&mut self) -> ObjectId {
        let id = (self.next, 0);
        self.next += 1;
        id
    }
}

/// Offset of the cross-reference section the update must chain to.
pub fn last_startxref(pdf: &[u8]) -> Option<usize> {
    let caps = STARTXREF_REGEX.captures_iter(pdf).last()?;
    std::str::from_utf8(caps.get(1)?.as_bytes())
        .ok()?
        .parse()
        .ok()
}

fn field_names(doc: &Document, fields: &[Object]) -> HashSet<Vec<u8>> {
    fields
        .iter()
        .filter_map(|f| doc.dereference(f).ok())
        .filter_map(|(_, f)| f.as_dict().ok())
        .filter_map(|f| f.get(b"T").and_then(Object::as_str).ok())
        .map(<[u8]>::to_vec)
        .collect()
}

fn unique_name(base: &str, existing: &HashSet<Vec<u8>>) -> String {
    if !existing.contains(base.as_bytes()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if !existing.contains(candidate.as_bytes()) {
            return candidate;
        }
        n += 1;
    }
}

/// Builds the update for `field` on top of `pdf` (already parsed as `doc`)
/// and returns the bytes to append. `sign` receives the bytes covered by the
/// byte range and returns the DER encoded detached CMS.
pub fn append_signature(
    pdf: &[u8],
    doc: &Document,
    field: &SignatureField,
    sign: impl FnOnce(&[u8]) -> Result<Vec<u8>, DocumentError>,
) -> Result<Vec<u8>, DocumentError> {
    let prev_xref = last_startxref(pdf)
        .ok_or_else(|| DocumentError::PdfParse("no startxref before %%EOF".to_string()))?;
    let mut ids = IdAllocator::new(doc);
    let mut updated: BTreeMap<ObjectId, Object> = BTreeMap::new();

    let catalog_id = doc.trailer.get(b"Root")?.as_reference()?;
    let mut catalog = doc.get_dictionary(catalog_id)?.clone();
    let mut catalog_changed = false;

    let sig_id = ids.next();
    let widget_id = ids.next();

    // AcroForm, moved to an indirect object when it was inline or missing.
    let (form_id, mut form) = match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => (*id, doc.get_dictionary(*id)?.clone()),
        Ok(Object::Dictionary(inline)) => {
            catalog_changed = true;
            (ids.next(), inline.clone())
        }
        _ => {
            catalog_changed = true;
            (ids.next(), Dictionary::new())
        }
    };
    catalog.set("AcroForm", form_id);

    let mut fields = match form.get(b"Fields") {
        Ok(obj) => doc.dereference(obj)?.1.as_array()?.clone(),
        Err(_) => Vec::new(),
    };
    let name = unique_name(&field.name, &field_names(doc, &fields));
    fields.push(Object::Reference(widget_id));
    form.set("Fields", fields);
    form.set("SigFlags", 3);
    updated.insert(form_id, Object::Dictionary(form));

    let certify = field.certify && !catalog.has(b"Perms");
    if certify {
        catalog.set("Perms", dictionary! { "DocMDP" => sig_id });
        catalog_changed = true;
    }
    if catalog_changed {
        updated.insert(catalog_id, Object::Dictionary(catalog));
    }

    // Widget annotation on the page.
    let mut page = doc.get_dictionary(field.page_id)?.clone();
    match page.get(b"Annots") {
        Ok(Object::Reference(annots_id)) => {
            let mut annots = doc.get_object(*annots_id)?.as_array()?.clone();
            annots.push(Object::Reference(widget_id));
            updated.insert(*annots_id, Object::Array(annots));
        }
        Ok(Object::Array(annots)) => {
            let mut annots = annots.clone();
            annots.push(Object::Reference(widget_id));
            page.set("Annots", annots);
            updated.insert(field.page_id, Object::Dictionary(page));
        }
        _ => {
            page.set("Annots", vec![Object::Reference(widget_id)]);
            updated.insert(field.page_id, Object::Dictionary(page));
        }
    }

    let mut widget = dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Sig",
        "T" => text_string(&name),
        "V" => sig_id,
        "F" => 132,
        "P" => field.page_id,
    };
    match field.appearance {
        Some(appearance) => {
            widget.set("Rect", field.rect.iter().map(|&v| Object::Real(v)).collect::<Vec<_>>());
            let objects = appearance.objects(field.rect, || ids.next());
            widget.set("AP", dictionary! { "N" => objects[0].0 });
            updated.extend(objects);
        }
        None => widget.set("Rect", vec![0.into(), 0.into(), 0.into(), 0.into()]),
    }
    updated.insert(widget_id, Object::Dictionary(widget));

    // Serialise. Offsets are absolute positions in the final file.
    let mut out = Vec::new();
    if !pdf.ends_with(b"\n") && !pdf.ends_with(b"\r") {
        out.push(b'\n');
    }
    let base = pdf.len();
    let mut offsets: BTreeMap<u32, usize> = BTreeMap::new();

    offsets.insert(sig_id.0, base + out.len());
    let (byte_range_at, contents_at) = write_signature_dictionary(&mut out, sig_id, field, certify);
    for (id, obj) in &updated {
        offsets.insert(id.0, base + out.len());
        let _ = write!(out, "{} {} obj\n", id.0, id.1);
        write_object(&mut out, obj);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_at = base + out.len();
    write_xref(&mut out, &offsets);

    let mut trailer = dictionary! {
        "Size" => ids.next as i64,
        "Root" => catalog_id,
        "Prev" => prev_xref as i64,
    };
    for key in [&b"Info"[..], b"ID"] {
        if let Ok(value) = doc.trailer.get(key) {
            trailer.set(key, value.clone());
        }
    }
    out.extend_from_slice(b"trailer\n");
    write_object(&mut out, &Object::Dictionary(trailer));
    let _ = write!(out, "\nstartxref\n{xref_at}\n%%EOF\n");

    // Byte range around the /Contents hex string, delimiters included.
    let contents_len = field.contents_reserve * 2 + 2;
    let contents_start = base + contents_at;
    let contents_end = contents_start + contents_len;
    let total = base + out.len();
    let byte_range = format!(
        "[0 {} {} {}]",
        contents_start,
        contents_end,
        total - contents_end
    );
    if byte_range.len() > BYTE_RANGE_PLACEHOLDER.len() {
        return Err(DocumentError::SignFailure("document too large".to_string()));
    }
    let slot = &mut out[byte_range_at..byte_range_at + BYTE_RANGE_PLACEHOLDER.len()];
    slot.fill(b' ');
    slot[..byte_range.len()].copy_from_slice(byte_range.as_bytes());

    let mut signed_data = Vec::with_capacity(total - contents_len);
    signed_data.extend_from_slice(pdf);
    signed_data.extend_from_slice(&out[..contents_at]);
    signed_data.extend_from_slice(&out[contents_at + contents_len..]);

    let cms = hex::encode_upper(sign(&signed_data)?);
    if cms.len() > field.contents_reserve * 2 {
        return Err(DocumentError::SignFailure(format!(
            "signature of {} bytes does not fit in the {} bytes reserved",
            cms.len() / 2,
            field.contents_reserve
        )));
    }
    out[contents_at + 1..contents_at + 1 + cms.len()].copy_from_slice(cms.as_bytes());

    log::debug!(
        "signature {name} appended as object {}, byte range {byte_range}",
        sig_id.0
    );
    Ok(out)
}

/// Writes the signature dictionary with placeholders. Returns the positions,
/// relative to `out`, of the `/ByteRange` array and of the `/Contents` string.
fn write_signature_dictionary(
    out: &mut Vec<u8>,
    sig_id: ObjectId,
    field: &SignatureField,
    certify: bool,
) -> (usize, usize) {
    let _ = write!(
        out,
        "{} {} obj\n<</Type /Sig/Filter /Adobe.PPKLite/SubFilter /adbe.pkcs7.detached/ByteRange ",
        sig_id.0, sig_id.1
    );
    let byte_range_at = out.len();
    out.extend_from_slice(BYTE_RANGE_PLACEHOLDER);

    out.extend_from_slice(b"/Contents ");
    let contents_at = out.len();
    out.push(b'<');
    out.resize(out.len() + field.contents_reserve * 2, b'0');
    out.push(b'>');

    let entries = [
        ("M", Some(&field.signing_date)),
        ("Reason", field.reason.as_ref()),
        ("Location", field.location.as_ref()),
        ("ContactInfo", field.contact_info.as_ref()),
    ];
    for (key, value) in entries {
        if let Some(value) = value {
            let _ = write!(out, "/{key} ");
            write_object(out, &text_string(value));
        }
    }

    if certify {
        let reference = dictionary! {
            "Type" => "SigRef",
            "TransformMethod" => "DocMDP",
            "TransformParams" => dictionary! {
                "Type" => "TransformParams",
                "P" => 2,
                "V" => "1.2",
            },
        };
        out.extend_from_slice(b"/Reference ");
        write_object(out, &Object::Array(vec![Object::Dictionary(reference)]));
    }
    out.extend_from_slice(b">>\nendobj\n");

    (byte_range_at, contents_at)
}

/// Classic cross-reference section, one subsection per run of consecutive
/// object numbers.
fn write_xref(out: &mut Vec<u8>, offsets: &BTreeMap<u32, usize>) {
    out.extend_from_slice(b"xref\n");
    let entries: Vec<(u32, usize)> = offsets.iter().map(|(&id, &off)| (id, off)).collect();
    let mut start = 0;
    while start < entries.len() {
        let mut end = start + 1;
        while end < entries.len() && entries[end].0 == entries[end - 1].0 + 1 {
            end += 1;
        }
        let _ = write!(out, "{} {}\n", entries[start].0, end - start);
        for (_, offset) in &entries[start..end] {
            let _ = write!(out, "{offset:010} 00000 n\r\n");
        }
        start = end;
    }
}
