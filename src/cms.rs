//! PKCS #7 / CMS SignedData parsing.
//!
//! Only what the reports need: the signer certificate, the other embedded
//! certificates, and when the signature was made.

use chrono::{DateTime, Utc};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::asn1::{GeneralizedTime, ObjectIdentifier, OctetString};
use der::{Any, Decode, Encode, Reader, SliceReader, Tag, Tagged};
use serde::Serialize;
use thiserror::Error;

use crate::asn1;
use crate::certificate::Certificate;

const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_SIGNING_TIME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");
/// `id-aa-signatureTimeStampToken`
const ID_TIME_STAMP_TOKEN: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.14");
/// `id-ct-TSTInfo`
const ID_TST_INFO: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");

#[derive(Error, Debug)]
pub enum Error {
    #[error("content is not PKCS #7 signedData")]
    NotSignedData,
    #[error("signedData has no certificates")]
    NoCertificates,
    #[error("malformed CMS structure: {0}")]
    Malformed(String),
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<crate::certificate::Error> for Error {
    fn from(e: crate::certificate::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

/// Where a signing time was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignDateSource {
    SigningTime,
    Timestamp,
    PdfDictionary,
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub signer: Certificate,
    /// Every embedded certificate except the signer's.
    pub additional_certificates: Vec<Certificate>,
    pub signing_time: Option<DateTime<Utc>>,
    pub sign_date_source: Option<SignDateSource>,
    pub timestamp_authority: bool,
}

/// Parses a DER (or zero padded DER) CMS blob.
pub fn parse(blob: &[u8]) -> Result<ParsedSignature, Error> {
    let content_info = ContentInfo::from_der(asn1::trim_to_element(blob))?;
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(Error::NotSignedData);
    }
    let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

    let mut certificates = Vec::new();
    if let Some(set) = &signed_data.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                certificates.push((cert.clone(), Certificate::from_der(&cert.to_der()?)?));
            }
        }
    }
    if certificates.is_empty() {
        return Err(Error::NoCertificates);
    }

    let signer_info = signed_data.signer_infos.0.iter().next();
    let signer_index = signer_info
        .and_then(|info| find_signer(info, &certificates))
        .unwrap_or_else(|| {
            log::debug!("signer certificate not matched by identifier, using the first one");
            0
        });

    let mut certificates: Vec<Certificate> = certificates.into_iter().map(|(_, c)| c).collect();
    let signer = certificates.remove(signer_index);

    let (signing_time, sign_date_source) = match signer_info {
        Some(info) => match signing_time_attribute(info) {
            Some(time) => (Some(time), Some(SignDateSource::SigningTime)),
            None => match timestamp_token_time(info) {
                Some(time) => (Some(time), Some(SignDateSource::Timestamp)),
                None => (None, None),
            },
        },
        None => (None, None),
    };

    Ok(ParsedSignature {
        signer,
        additional_certificates: certificates,
        signing_time,
        timestamp_authority: sign_date_source == Some(SignDateSource::Timestamp),
        sign_date_source,
    })
}

/// Index of the certificate named by the signer identifier. Serial number and
/// issuer must both match; serial alone is accepted as a second choice.
fn find_signer(
    info: &SignerInfo,
    certificates: &[(x509_cert::Certificate, Certificate)],
) -> Option<usize> {
    match &info.sid {
        SignerIdentifier::IssuerAndSerialNumber(ias) => certificates
            .iter()
            .position(|(c, _)| {
                c.tbs_certificate.serial_number == ias.serial_number
                    && c.tbs_certificate.issuer == ias.issuer
            })
            .or_else(|| {
                certificates
                    .iter()
                    .position(|(c, _)| c.tbs_certificate.serial_number == ias.serial_number)
            }),
        SignerIdentifier::SubjectKeyIdentifier(ski) => {
            let wanted = ski.0.as_bytes();
            certificates.iter().position(|(_, c)| {
                c.x509()
                    .subject_key_id()
                    .is_some_and(|id| id.as_slice() == wanted)
            })
        }
    }
}

fn signing_time_attribute(info: &SignerInfo) -> Option<DateTime<Utc>> {
    let attrs = info.signed_attrs.as_ref()?;
    let attr = attrs.iter().find(|a| a.oid == ID_SIGNING_TIME)?;
    let value = attr.values.iter().next()?;
    let time = x509_cert::time::Time::from_der(&value.to_der().ok()?).ok()?;
    unix_to_datetime(time.to_unix_duration())
}

/// Time asserted by an RFC 3161 token in the unsigned attributes.
fn timestamp_token_time(info: &SignerInfo) -> Option<DateTime<Utc>> {
    let attrs = info.unsigned_attrs.as_ref()?;
    let attr = attrs.iter().find(|a| a.oid == ID_TIME_STAMP_TOKEN)?;
    let token = attr.values.iter().next()?;

    let content_info = ContentInfo::from_der(&token.to_der().ok()?).ok()?;
    if content_info.content_type != ID_SIGNED_DATA {
        return None;
    }
    let signed_data = SignedData::from_der(&content_info.content.to_der().ok()?).ok()?;
    let encap = &signed_data.encap_content_info;
    if encap.econtent_type != ID_TST_INFO {
        log::debug!("timestamp token carries {} content", encap.econtent_type);
    }
    let econtent = encap.econtent.as_ref()?;
    let tst_info = OctetString::from_der(&econtent.to_der().ok()?).ok()?;
    tst_info_gen_time(tst_info.as_bytes())
}

/// `genTime` is the first GeneralizedTime directly inside TSTInfo.
fn tst_info_gen_time(tst_info: &[u8]) -> Option<DateTime<Utc>> {
    let outer = Any::from_der(tst_info).ok()?;
    if outer.tag() != Tag::Sequence {
        return None;
    }
    let mut reader = SliceReader::new(outer.value()).ok()?;
    while !reader.is_finished() {
        let item: Any = reader.decode().ok()?;
        if item.tag() == Tag::GeneralizedTime {
            let time = GeneralizedTime::from_der(&item.to_der().ok()?).ok()?;
            return unix_to_datetime(time.to_unix_duration());
        }
    }
    None
}

fn unix_to_datetime(duration: std::time::Duration) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(duration.as_secs() as i64, 0)
}
