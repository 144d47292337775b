//! OpenSSL check that a detached PKCS #7 matches the bytes it claims to sign.
//!
//! Trust is not evaluated here: the chain is built separately against the
//! configured trust store, so certificate verification is turned off and
//! only the signature over the content is checked.

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

/// Verifies `pkcs7_der` over the two signed byte ranges of a document.
pub fn verify_detached(pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> anyhow::Result<()> {
    // Unfortunately OpenSSL requires a contiguous array of bytes to verify
    // the signature, so we must allocate and copy the slices.
    let mut contiguous = Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
    contiguous.extend_from_slice(signed_data[0]);
    contiguous.extend_from_slice(signed_data[1]);

    let pkcs7 = Pkcs7::from_der(pkcs7_der)?;
    let certs: Stack<X509> = Stack::new()?;
    let store = X509StoreBuilder::new()?.build();
    pkcs7.verify(
        &certs,
        &store,
        Some(&contiguous),
        None,
        Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::signing::detached_pkcs7;
    use crate::test_support::{make_p12, CertSpec, TestPki};

    #[test]
    fn detects_changed_content() {
        let pki = TestPki::new("CA-Integrity");
        let p12 = make_p12(&pki.issue(CertSpec::leaf("Dana")), &[], "pw");
        let credential = Credential::from_pkcs12(&p12, "pw").unwrap();

        let signature = detached_pkcs7(&credential, b"first part|second part").unwrap();
        verify_detached(&signature, [b"first part", b"|second part"]).unwrap();
        assert!(verify_detached(&signature, [b"first part", b"|second PART"]).is_err());
        assert!(verify_detached(b"garbage", [b"", b""]).is_err());
    }
}
