//! OpenSSL subject hash (`openssl x509 -subject_hash`).
//!
//! Trust-anchor directories managed by `c_rehash` name certificates
//! `<hash>.0`, where the hash is computed over a canonical form of the
//! subject name:
//!
//! 1. every string attribute value is re-encoded as a UTF8String with
//!    leading and trailing whitespace removed, inner whitespace runs
//!    collapsed to one space, and ASCII letters lower-cased;
//! 2. the RDN sets are DER encoded and concatenated, without the outer
//!    SEQUENCE header;
//! 3. the first four bytes of the SHA-1 digest are read little-endian and
//!    printed as eight hex digits.

use der::asn1::Any;
use der::{Decode, Encode, Tag, Tagged};
use ring::digest;
use x509_cert::name::Name;
use x509_cert::Certificate;

use cainject_core::error::{InjectError, Result};

use crate::truststore::pem::certificate_der;

/// Subject hash of the first certificate in a PEM document.
pub fn subject_hash(pem: &[u8]) -> Result<String> {
    subject_hash_der(&certificate_der(pem)?)
}

/// Subject hash of a DER certificate.
pub fn subject_hash_der(der: &[u8]) -> Result<String> {
    let certificate = Certificate::from_der(der).map_err(asn1_error)?;
    let canonical = canonical_name(&certificate.tbs_certificate.subject)?;
    Ok(name_hash(&canonical))
}

/// Hash of an already canonical name encoding.
pub fn name_hash(canonical: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, canonical);
    let bytes = digest.as_ref();
    let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    format!("{:08x}", value)
}

/// Concatenated DER encodings of the canonicalized RDN sets.
pub fn canonical_name(name: &Name) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for rdn in name.0.iter() {
        let mut attributes = Vec::new();
        for attribute in rdn.0.iter() {
            let mut content = attribute.oid.to_der().map_err(asn1_error)?;
            content.extend(canonical_value(&attribute.value)?);
            attributes.push(tlv(Tag::Sequence, content)?);
        }
        attributes.sort();
        out.extend(tlv(Tag::Set, attributes.concat())?);
    }
    Ok(out)
}

/// Canonicalize one string value as OpenSSL does.
pub fn canonicalize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = false;

    for c in value.chars() {
        if is_openssl_space(c) {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn is_openssl_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r')
}

fn canonical_value(value: &Any) -> Result<Vec<u8>> {
    let text = match value.tag() {
        Tag::Utf8String => String::from_utf8(value.value().to_vec())
            .map_err(|_| InjectError::DecodeError("Invalid UTF8String in subject".to_string()))?,
        Tag::PrintableString | Tag::Ia5String | Tag::VisibleString | Tag::TeletexString => {
            value.value().iter().map(|&b| b as char).collect()
        }
        Tag::BmpString => {
            let bytes = value.value();
            if bytes.len() % 2 != 0 {
                return Err(InjectError::DecodeError("Odd-length BMPString in subject".to_string()));
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units)
                .map_err(|_| InjectError::DecodeError("Invalid BMPString in subject".to_string()))?
        }
        // Non-string values are hashed as encoded
        _ => return value.to_der().map_err(asn1_error),
    };

    tlv(Tag::Utf8String, canonicalize(&text).into_bytes())
}

fn tlv(tag: Tag, content: Vec<u8>) -> Result<Vec<u8>> {
    Any::new(tag, content)
        .and_then(|any| any.to_der())
        .map_err(asn1_error)
}

fn asn1_error(e: der::Error) -> InjectError {
    InjectError::DecodeError(format!("Invalid certificate: {}", e))
}
