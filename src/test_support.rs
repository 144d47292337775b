//! Fixtures generated on the fly: keys, certificates, PKCS #12 bundles, PDFs
//! and signature images.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};

use lopdf::{dictionary, Document, Object, Stream};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};

static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1000);

const DAY: i64 = 24 * 3600;

fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn name(cn: &str, org: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_nid(Nid::COUNTRYNAME, "EC").unwrap();
    builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, org).unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[allow(clippy::too_many_arguments)]
fn build_cert(
    subject: &X509Name,
    issuer: &X509Name,
    key: &PKey<Private>,
    issuer_key: &PKey<Private>,
    serial: u32,
    not_before: i64,
    not_after: i64,
    ca: bool,
) -> X509 {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_issuer_name(issuer).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
        .unwrap();
    if ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    }
    builder.sign(issuer_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// What to put in an issued certificate.
#[derive(Clone)]
pub struct CertSpec {
    cn: String,
    org: String,
    serial: Option<u32>,
    not_before: i64,
    not_after: i64,
    issuer_cn: Option<String>,
    ca: bool,
}

impl CertSpec {
    pub fn leaf(cn: &str) -> Self {
        Self {
            cn: cn.to_string(),
            org: "Example Org".to_string(),
            serial: None,
            not_before: now() - DAY,
            not_after: now() + 365 * DAY,
            issuer_cn: None,
            ca: false,
        }
    }

    pub fn intermediate(cn: &str) -> Self {
        Self {
            ca: true,
            ..Self::leaf(cn)
        }
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn expired(mut self) -> Self {
        self.not_before = now() - 400 * DAY;
        self.not_after = now() - 30 * DAY;
        self
    }

    pub fn expiring_in_days(mut self, days: i64) -> Self {
        self.not_after = now() + days * DAY;
        self
    }

    /// Writes a different issuer CN than the CA's own subject.
    pub fn issuer_cn(mut self, cn: &str) -> Self {
        self.issuer_cn = Some(cn.to_string());
        self
    }
}

pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// A self-signed CA able to issue certificates.
pub struct TestPki {
    pub ca_key: PKey<Private>,
    pub ca_cert: X509,
    cn: String,
    org: String,
    ec: bool,
}

impl TestPki {
    pub fn new(cn: &str) -> Self {
        Self::build(cn, "Example CA Org", rsa_key(), false)
    }

    pub fn with_org(cn: &str, org: &str) -> Self {
        Self::build(cn, org, rsa_key(), false)
    }

    pub fn new_ec(cn: &str) -> Self {
        Self::build(cn, "Example CA Org", ec_key(), true)
    }

    fn build(cn: &str, org: &str, key: PKey<Private>, ec: bool) -> Self {
        let subject = name(cn, org);
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let ca_cert = build_cert(
            &subject,
            &subject,
            &key,
            &key,
            serial,
            now() - DAY,
            now() + 3650 * DAY,
            true,
        );
        Self {
            ca_key: key,
            ca_cert,
            cn: cn.to_string(),
            org: org.to_string(),
            ec,
        }
    }

    pub fn issue(&self, spec: CertSpec) -> Issued {
        let key = if self.ec { ec_key() } else { rsa_key() };
        let issuer_name = match &spec.issuer_cn {
            Some(cn) => name(cn, &self.org),
            None => name(&self.cn, &self.org),
        };
        let serial = spec
            .serial
            .unwrap_or_else(|| NEXT_SERIAL.fetch_add(1, Ordering::Relaxed));
        let cert = build_cert(
            &name(&spec.cn, &spec.org),
            &issuer_name,
            &key,
            &self.ca_key,
            serial,
            spec.not_before,
            spec.not_after,
            spec.ca,
        );
        Issued { cert, key }
    }

    /// `other`'s CA subject and key, certified by this CA instead of itself.
    pub fn cross_sign(&self, other: &TestPki) -> X509 {
        build_cert(
            &name(&other.cn, &other.org),
            &name(&self.cn, &self.org),
            &other.ca_key,
            &self.ca_key,
            NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            now() - DAY,
            now() + 3650 * DAY,
            true,
        )
    }

    /// A CA issued by this one, able to issue leaves itself.
    pub fn intermediate(&self, cn: &str) -> TestPki {
        let issued = self.issue(CertSpec::intermediate(cn));
        TestPki {
            ca_key: issued.key,
            ca_cert: issued.cert,
            cn: cn.to_string(),
            org: "Example Org".to_string(),
            ec: self.ec,
        }
    }
}

/// PKCS #12 bundle for `issued`, with `chain` as extra certificates.
pub fn make_p12(issued: &Issued, chain: &[&X509], password: &str) -> Vec<u8> {
    let mut builder = Pkcs12::builder();
    builder.name("signer");
    builder.pkey(&issued.key);
    builder.cert(&issued.cert);
    if !chain.is_empty() {
        let mut stack = Stack::new().unwrap();
        for cert in chain {
            stack.push((*cert).clone()).unwrap();
        }
        builder.ca(stack);
    }
    builder.build2(password).unwrap().to_der().unwrap()
}

/// A simple document with `pages` letter-sized pages.
pub fn blank_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids = Vec::new();
    for page_no in 0..pages {
        let text = format!("BT /F1 24 Tf 72 720 Td (Page {}) Tj ET", page_no + 1);
        let content_id = doc.add_object(Stream::new(dictionary! {}, text.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// A PNG with a dark stroke on a transparent background.
pub fn signature_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        if y == height / 2 || x == y {
            image::Rgba([10, 10, 80, 255])
        } else {
            image::Rgba([255, 255, 255, 0])
        }
    });
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}
