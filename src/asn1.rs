//! Just enough DER walking to find element boundaries in raw bytes.

/// `06 09 2A 86 48 86 F7 0D 01 07 02`: the encoded OID of PKCS #7 signedData.
pub const SIGNED_DATA_OID_DER: [u8; 11] = [
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02,
];

pub const TAG_SEQUENCE: u8 = 0x30;

/// Reads a DER length starting at `pos`.
///
/// Returns `(length, bytes_consumed)`. Indefinite lengths (BER) are rejected.
pub fn read_length(data: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *data.get(pos)?;
    if first & 0x80 == 0 {
        return Some((first as usize, 1));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > std::mem::size_of::<usize>() {
        return None;
    }
    let bytes = data.get(pos + 1..pos + 1 + count)?;
    let length = bytes.iter().fold(0usize, |acc, &b| acc << 8 | b as usize);
    Some((length, 1 + count))
}

/// Returns the whole TLV element starting at `pos`, if it fits in `data`.
pub fn element_at(data: &[u8], pos: usize) -> Option<&[u8]> {
    let (length, len_size) = read_length(data, pos + 1)?;
    let end = pos.checked_add(1 + len_size)?.checked_add(length)?;
    data.get(pos..end)
}

/// Strips trailing padding after the outer element. PDF signers pad the
/// `/Contents` placeholder with zeros, which DER decoders refuse.
///
/// BER input with an indefinite outer length is returned unchanged.
pub fn trim_to_element(data: &[u8]) -> &[u8] {
    element_at(data, 0).unwrap_or(data)
}

/// Raw bytes of the `tbsCertificate` inside a DER certificate.
pub fn tbs_certificate(cert_der: &[u8]) -> Option<&[u8]> {
    if cert_der.first() != Some(&TAG_SEQUENCE) {
        return None;
    }
    let (_, len_size) = read_length(cert_der, 1)?;
    let tbs_pos = 1 + len_size;
    if cert_der.get(tbs_pos) != Some(&TAG_SEQUENCE) {
        return None;
    }
    element_at(cert_der, tbs_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_lengths() {
        assert_eq!(read_length(&[0x05], 0), Some((5, 1)));
        assert_eq!(read_length(&[0x81, 0xC8], 0), Some((200, 2)));
        assert_eq!(read_length(&[0x82, 0x01, 0x00], 0), Some((256, 3)));
        assert_eq!(read_length(&[0x80], 0), None);
        assert_eq!(read_length(&[0x82, 0x01], 0), None);
    }

    #[test]
    fn trims_zero_padding() {
        let mut padded = vec![0x30, 0x03, 0x02, 0x01, 0x07];
        padded.extend_from_slice(&[0; 16]);
        assert_eq!(trim_to_element(&padded), &[0x30, 0x03, 0x02, 0x01, 0x07]);

        let truncated = [0x30, 0x09, 0x02];
        assert_eq!(trim_to_element(&truncated), &truncated);
    }
}
