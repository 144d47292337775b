//! Byte level signature scan.
//!
//! Works on damaged or oddly written files that a full parse would reject:
//! signature dictionaries are located by their `/Type /Sig` entry, and when
//! none is found, CMS blobs are recovered from the raw signedData OID.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::bytes::Regex;
use sha2::{Digest, Sha256};

use crate::asn1::{self, SIGNED_DATA_OID_DER, TAG_SEQUENCE};
use crate::pdf_fields::decode_pdf_hex_string;

/// How far before the OID the enclosing SEQUENCE may start.
const FALLBACK_WINDOW: usize = 50;
/// Smaller "SignedData" hits are OID mentions, not signatures.
const FALLBACK_MIN_LENGTH: usize = 100;

lazy_static::lazy_static! {
    static ref SIG_TYPE_REGEX: Regex = Regex::new(r"(?-u)/Type\s*/Sig\b").unwrap();
    static ref CONTENTS_HEX_REGEX: Regex =
        Regex::new(r"(?-u)/Contents\s*(<[0-9A-Fa-f\s]*>)").unwrap();
    static ref CONTENTS_LITERAL_REGEX: Regex = Regex::new(r"(?-u)/Contents\s*\(").unwrap();
    static ref METADATA_REGEX: Regex = Regex::new(r"(?-u)/(Reason|Location|M)\s*([(<])").unwrap();
    static ref BYTE_RANGE_REGEX: Regex =
        Regex::new(r"(?-u)/ByteRange\s*\[\s*(-?\d+)\s+(-?\d+)\s+(-?\d+)\s+(-?\d+)\s*\]").unwrap();
    static ref PDF_DATE_REGEX: Regex = Regex::new(
        r"^(?:D:)?(\d{4})(\d{2})?(\d{2})?(\d{2})?(\d{2})?(\d{2})?(?:([Zz+\-])(?:(\d{2})'?(?:(\d{2})'?)?)?)?"
    )
    .unwrap();
}

/// A CMS blob found in the file, with what its dictionary said about it.
#[derive(Debug, Clone)]
pub struct FoundSignature {
    /// The blob with trailing padding removed.
    pub cms: Vec<u8>,
    /// Lowercase hex SHA-256 of `cms`.
    pub sha256: String,
    pub reason: Option<String>,
    pub location: Option<String>,
    /// Parsed `/M`.
    pub signing_date: Option<DateTime<Utc>>,
    pub byte_range: Option<[i64; 4]>,
    /// Raw `/Contents` bytes, padding included, as written in the file.
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Signature dictionaries (or fallback blobs) seen, duplicates included.
    pub total_found: usize,
    pub signatures: Vec<FoundSignature>,
}

/// Unique signatures of the document, in file order.
pub fn find_signatures(pdf: &[u8]) -> Vec<FoundSignature> {
    extract(pdf).signatures
}

pub fn extract(pdf: &[u8]) -> Extraction {
    let mut seen = HashSet::new();
    let mut extraction = Extraction::default();

    for m in SIG_TYPE_REGEX.find_iter(pdf) {
        let Some(dict) = enclosing_dictionary(pdf, m.start()) else {
            continue;
        };
        let Some(contents) = dictionary_contents(dict) else {
            log::debug!("signature dictionary at {} has no /Contents", m.start());
            continue;
        };
        let cms = asn1::trim_to_element(&contents).to_vec();
        if cms.is_empty() || cms.iter().all(|&b| b == 0) {
            continue;
        }

        extraction.total_found += 1;
        let sha256 = hex::encode(Sha256::digest(&cms));
        if !seen.insert(sha256.clone()) {
            continue;
        }

        let mut found = FoundSignature {
            cms,
            sha256,
            reason: None,
            location: None,
            signing_date: None,
            byte_range: byte_range(dict),
            contents,
        };
        read_metadata(dict, &mut found);
        extraction.signatures.push(found);
    }

    if extraction.signatures.is_empty() {
        for cms in fallback_blobs(pdf) {
            extraction.total_found += 1;
            let sha256 = hex::encode(Sha256::digest(&cms));
            if seen.insert(sha256.clone()) {
                extraction.signatures.push(FoundSignature {
                    contents: cms.clone(),
                    cms,
                    sha256,
                    reason: None,
                    location: None,
                    signing_date: None,
                    byte_range: None,
                });
            }
        }
        if !extraction.signatures.is_empty() {
            log::debug!(
                "{} signature(s) recovered from raw signedData",
                extraction.signatures.len()
            );
        }
    }

    extraction
}

fn is_escaped(pdf: &[u8], at: usize) -> bool {
    pdf[..at].iter().rev().take_while(|&&b| b == b'\\').count() % 2 == 1
}

/// Position of the `(` opening the literal string whose `)` is at `close`.
fn literal_string_start(pdf: &[u8], close: usize) -> Option<usize> {
    let mut nesting = 1usize;
    let mut i = close;
    while i > 0 {
        i -= 1;
        match pdf[i] {
            b')' if !is_escaped(pdf, i) => nesting += 1,
            b'(' if !is_escaped(pdf, i) => {
                nesting -= 1;
                if nesting == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Walks back from `at` to the `<<` opening the dictionary at depth zero,
/// skipping over strings. In a run of `<` or `>` the pairs are delimiters
/// and an odd one out belongs to a hex string.
fn dictionary_start(pdf: &[u8], at: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = at.min(pdf.len());
    while i > 0 {
        i -= 1;
        match pdf[i] {
            b')' if !is_escaped(pdf, i) => i = literal_string_start(pdf, i)?,
            b'>' => {
                let run = pdf[..=i].iter().rev().take_while(|&&b| b == b'>').count();
                depth += run / 2;
                i -= run - 1;
                if run % 2 == 1 {
                    // Hex strings hold no delimiters, skip to their `<`.
                    i = pdf[..i].iter().rposition(|&b| b == b'<')?;
                }
            }
            b'<' => {
                let run = pdf[..=i].iter().rev().take_while(|&&b| b == b'<').count();
                let run_start = i + 1 - run;
                for pair in (0..run / 2).rev() {
                    if depth == 0 {
                        return Some(run_start + pair * 2);
                    }
                    depth -= 1;
                }
                i = run_start;
            }
            _ => {}
        }
    }
    None
}

/// The `<< ... >>` dictionary containing position `at`.
fn enclosing_dictionary(pdf: &[u8], at: usize) -> Option<&[u8]> {
    let start = dictionary_start(pdf, at)?;

    // Forwards to the matching `>>`, skipping strings.
    let mut depth = 0usize;
    let mut i = start;
    while i < pdf.len() {
        match pdf[i] {
            b'<' if pdf.get(i + 1) == Some(&b'<') => {
                depth += 1;
                i += 2;
            }
            b'<' => {
                let close = pdf[i..].iter().position(|&b| b == b'>')?;
                i += close + 1;
            }
            b'>' if pdf.get(i + 1) == Some(&b'>') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some(&pdf[start..i]);
                }
            }
            b'(' => {
                let (_, used) = literal_string(&pdf[i..])?;
                i += used;
            }
            _ => i += 1,
        }
    }
    None
}

fn dictionary_contents(dict: &[u8]) -> Option<Vec<u8>> {
    if let Some(caps) = CONTENTS_HEX_REGEX.captures(dict) {
        let hex: Vec<u8> = caps[1]
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        return decode_pdf_hex_string(&hex);
    }
    let m = CONTENTS_LITERAL_REGEX.find(dict)?;
    literal_string(&dict[m.end() - 1..]).map(|(bytes, _)| bytes)
}

fn byte_range(dict: &[u8]) -> Option<[i64; 4]> {
    let caps = BYTE_RANGE_REGEX.captures(dict)?;
    let mut range = [0i64; 4];
    for (i, value) in range.iter_mut().enumerate() {
        *value = std::str::from_utf8(&caps[i + 1]).ok()?.parse().ok()?;
    }
    Some(range)
}

fn read_metadata(dict: &[u8], found: &mut FoundSignature) {
    for caps in METADATA_REGEX.captures_iter(dict) {
        let (Some(key), Some(open)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let rest = &dict[open.start()..];
        let raw = if open.as_bytes() == b"(" {
            literal_string(rest).map(|(bytes, _)| bytes)
        } else if rest.starts_with(b"<<") {
            None
        } else {
            rest.iter()
                .position(|&b| b == b'>')
                .and_then(|end| {
                    let hex: Vec<u8> = rest[..=end]
                        .iter()
                        .copied()
                        .filter(|b| !b.is_ascii_whitespace())
                        .collect();
                    decode_pdf_hex_string(&hex)
                })
        };
        let Some(raw) = raw else {
            continue;
        };

        let text = decode_text(&raw);
        match key.as_bytes() {
            b"Reason" if found.reason.is_none() => found.reason = Some(text),
            b"Location" if found.location.is_none() => found.location = Some(text),
            b"M" if found.signing_date.is_none() => found.signing_date = parse_pdf_date(&text),
            _ => {}
        }
    }
}

/// Parses a literal string starting at its opening parenthesis. Returns the
/// unescaped bytes and the number of input bytes used.
fn literal_string(input: &[u8]) -> Option<(Vec<u8>, usize)> {
    if input.first() != Some(&b'(') {
        return None;
    }
    let mut out = Vec::new();
    let mut depth = 1;
    let mut i = 1;
    while i < input.len() {
        let b = input[i];
        match b {
            b'\\' => {
                i += 1;
                let escaped = *input.get(i)?;
                match escaped {
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0C),
                    b'0'..=b'7' => {
                        let mut value = 0u32;
                        let mut digits = 0;
                        while digits < 3 {
                            match input.get(i) {
                                Some(d @ b'0'..=b'7') => {
                                    value = value * 8 + (d - b'0') as u32;
                                    i += 1;
                                    digits += 1;
                                }
                                _ => break,
                            }
                        }
                        out.push(value as u8);
                        continue;
                    }
                    b'\r' => {
                        if input.get(i + 1) == Some(&b'\n') {
                            i += 1;
                        }
                    }
                    b'\n' => {}
                    other => out.push(other),
                }
            }
            b'(' => {
                depth += 1;
                out.push(b);
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((out, i + 1));
                }
                out.push(b);
            }
            _ => out.push(b),
        }
        i += 1;
    }
    None
}

/// PDF text string: UTF-16BE with a byte order mark, else UTF-8, else
/// Latin-1.
pub fn decode_text(raw: &[u8]) -> String {
    if let Some(utf16) = raw.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

/// Parses `D:YYYYMMDDHHmmSS+HH'mm'`; everything after the year is optional.
pub fn parse_pdf_date(text: &str) -> Option<DateTime<Utc>> {
    let caps = PDF_DATE_REGEX.captures(text.trim().as_bytes())?;
    let num = |i: usize, default: u32| -> Option<u32> {
        match caps.get(i) {
            Some(m) => std::str::from_utf8(m.as_bytes()).ok()?.parse().ok(),
            None => Some(default),
        }
    };

    let naive = NaiveDate::from_ymd_opt(num(1, 0)? as i32, num(2, 1)?, num(3, 1)?)?
        .and_hms_opt(num(4, 0)?, num(5, 0)?, num(6, 0)?)?;

    let offset_secs = match caps.get(7).map(|m| m.as_bytes()) {
        Some(b"+") => (num(8, 0)? * 3600 + num(9, 0)? * 60) as i32,
        Some(b"-") => -((num(8, 0)? * 3600 + num(9, 0)? * 60) as i32),
        _ => 0,
    };
    let offset = FixedOffset::east_opt(offset_secs)?;
    Some(offset.from_local_datetime(&naive).single()?.with_timezone(&Utc))
}

/// Candidate CMS blobs around every raw signedData OID.
fn fallback_blobs(pdf: &[u8]) -> Vec<Vec<u8>> {
    let mut blobs = Vec::new();
    let oid = &SIGNED_DATA_OID_DER[..];
    let mut from = 0;
    while let Some(pos) = pdf[from..]
        .windows(oid.len())
        .position(|w| w == oid)
        .map(|p| p + from)
    {
        from = pos + 1;
        let lowest = pos.saturating_sub(FALLBACK_WINDOW);
        for start in (lowest..pos).rev() {
            if pdf[start] != TAG_SEQUENCE {
                continue;
            }
            let Some((length, _)) = asn1::read_length(pdf, start + 1) else {
                continue;
            };
            if length <= FALLBACK_MIN_LENGTH {
                continue;
            }
            if let Some(element) = asn1::element_at(pdf, start) {
                blobs.push(element.to_vec());
                break;
            }
        }
    }
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn dictionary_boundaries() {
        let pdf = b"1 0 obj\n<</Type /Sig/Prop <</A 1>>/Contents <3003020101>/Reason (a >> b)>>\nendobj";
        let at = SIG_TYPE_REGEX.find(pdf).unwrap().start();
        let dict = enclosing_dictionary(pdf, at).unwrap();
        assert!(dict.starts_with(b"<</Type /Sig"));
        assert!(dict.ends_with(b"(a >> b)>>"));
        assert_eq!(dictionary_contents(dict).unwrap(), [0x30, 0x03, 0x02, 0x01, 0x01]);
    }

    #[test]
    fn strings_before_the_type_do_not_move_the_start() {
        let pdf = b"<</Kids [2 0 R]>>\n2 0 obj\n<</Reason (x >> y << z \\) >>)/Name<</A<AB>>>/ID <<<0A>/B 1>>/Type /Sig/Contents <3003020101>>>\nendobj";
        let at = SIG_TYPE_REGEX.find(pdf).unwrap().start();
        let dict = enclosing_dictionary(pdf, at).unwrap();
        assert!(dict.starts_with(b"<</Reason (x >> y"));
        assert!(dict.ends_with(b"<3003020101>>>"));
        assert_eq!(dictionary_contents(dict).unwrap(), [0x30, 0x03, 0x02, 0x01, 0x01]);

        let open = b"<</Note (<< unbalanced)/Type /Sig>>";
        let at = SIG_TYPE_REGEX.find(open).unwrap().start();
        assert_eq!(enclosing_dictionary(open, at).unwrap(), &open[..]);
    }

    #[test]
    fn sig_ref_is_not_a_signature() {
        assert!(!SIG_TYPE_REGEX.is_match(b"<</Type /SigRef>>"));
        assert!(SIG_TYPE_REGEX.is_match(b"<</Type/Sig>>"));
    }

    #[test]
    fn metadata_strings() {
        let dict = b"<</Type /Sig/Reason (Firma \\(digital\\) \\101)/Location <FEFF00510075006900740023>/M (D:20240315103000-05'00')>>";
        let mut found = FoundSignature {
            cms: Vec::new(),
            sha256: String::new(),
            reason: None,
            location: None,
            signing_date: None,
            byte_range: None,
            contents: Vec::new(),
        };
        read_metadata(dict, &mut found);
        assert_eq!(found.reason.as_deref(), Some("Firma (digital) A"));
        assert_eq!(found.location.as_deref(), Some("Quit#"));
        let date = found.signing_date.unwrap();
        assert_eq!(date.to_rfc3339(), "2024-03-15T15:30:00+00:00");
    }

    #[test]
    fn dates() {
        let utc = parse_pdf_date("D:20240102030405Z").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        let plus = parse_pdf_date("D:20240102030405+02'30'").unwrap();
        assert_eq!(plus.to_rfc3339(), "2024-01-02T00:34:05+00:00");
        let day_only = parse_pdf_date("D:20241231").unwrap();
        assert_eq!((day_only.year(), day_only.month(), day_only.day()), (2024, 12, 31));
        assert!(parse_pdf_date("yesterday").is_none());
    }

    #[test]
    fn text_decoding() {
        assert_eq!(decode_text(b"plain"), "plain");
        assert_eq!(decode_text(&[0xFE, 0xFF, 0x00, 0xF3]), "ó");
        assert_eq!(decode_text(&[b'S', 0xE1, b'b']), "Sáb");
    }

    #[test]
    fn fallback_finds_raw_signed_data() {
        // SEQUENCE { OID signedData, [0] { 120 filler bytes } }
        let mut blob = vec![0x30, 0x81, 0x00];
        blob.extend_from_slice(&SIGNED_DATA_OID_DER);
        blob.extend_from_slice(&[0xA0, 120]);
        blob.extend(std::iter::repeat(0x04).take(120));
        blob[2] = (blob.len() - 3) as u8;

        let mut pdf = b"%PDF-1.4\nstream\n".to_vec();
        pdf.extend_from_slice(&blob);
        pdf.extend_from_slice(b"\nendstream\n%%EOF\n");

        let extraction = extract(&pdf);
        assert_eq!(extraction.total_found, 1);
        assert_eq!(extraction.signatures[0].cms, blob);
        assert!(extraction.signatures[0].byte_range.is_none());
    }

    #[test]
    fn duplicates_are_counted_once() {
        let dict = b"<</Type /Sig/ByteRange [0 10 20 30]/Contents <3003020101000000>>>";
        let mut pdf = b"%PDF-1.7\n".to_vec();
        pdf.extend_from_slice(dict);
        pdf.extend_from_slice(b"\n");
        pdf.extend_from_slice(dict);

        let extraction = extract(&pdf);
        assert_eq!(extraction.total_found, 2);
        assert_eq!(extraction.signatures.len(), 1);
        let sig = &extraction.signatures[0];
        assert_eq!(sig.cms, [0x30, 0x03, 0x02, 0x01, 0x01]);
        assert_eq!(sig.contents.len(), 8);
        assert_eq!(sig.byte_range, Some([0, 10, 20, 30]));
    }
}
