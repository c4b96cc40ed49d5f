//! Passwordless PKCS#12 trust stores.
//!
//! Reads PFX files whose authenticated safe holds unencrypted certificate
//! bags, and writes them back the way the JDK writes a passwordless
//! `cacerts`: version 3, no MAC, one unencrypted `data` safe, and each
//! certificate bag tagged with a friendly name and the Java trusted key
//! usage attribute. Integrity MACs on input are not verified.

use der::asn1::{Any, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Reader, Sequence, SliceReader, Tag, Tagged};

use cainject_core::error::{InjectError, Result};

const PFX_VERSION: u8 = 3;

/// pkcs7-data
const DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// pkcs7-encryptedData
const ENCRYPTED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.6");
/// pkcs-12 certBag
const CERT_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.3");
/// pkcs-9 x509Certificate
const X509_CERTIFICATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.22.1");
/// pkcs-9 friendlyName
const FRIENDLY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.20");
/// Oracle's trusted key usage bag attribute
const TRUSTED_KEY_USAGE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.113894.746875.1.1");
/// anyExtendedKeyUsage
const ANY_EXTENDED_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37.0");

#[derive(Clone, Debug, Sequence)]
struct Pfx {
    version: u8,
    auth_safe: ContentInfo,
    mac_data: Option<Any>,
}

#[derive(Clone, Debug, Sequence)]
struct ContentInfo {
    content_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    content: Option<Any>,
}

#[derive(Clone, Debug, Sequence)]
struct SafeBag {
    bag_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    bag_value: Any,
    bag_attributes: Option<Any>,
}

#[derive(Clone, Debug, Sequence)]
struct CertBag {
    cert_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    cert_value: OctetString,
}

// Attribute values are kept as a raw SET; some writers do not sort them.
#[derive(Clone, Debug, Sequence)]
struct BagAttribute {
    attr_id: ObjectIdentifier,
    attr_values: Any,
}

/// A certificate held by a PKCS#12 trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCertificate {
    pub friendly_name: Option<String>,
    pub der: Vec<u8>,
}

/// Certificates of a passwordless PKCS#12 trust store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pkcs12TrustStore {
    certificates: Vec<TrustedCertificate>,
}

impl Pkcs12TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a PFX holding unencrypted certificate bags.
    pub fn load(data: &[u8]) -> Result<Self> {
        let pfx = Pfx::from_der(data).map_err(asn1_error)?;
        if pfx.version != PFX_VERSION {
            return Err(decode_error(format!("unsupported PFX version {}", pfx.version)));
        }
        if pfx.mac_data.is_some() {
            tracing::debug!("Ignoring PKCS#12 integrity MAC");
        }
        if pfx.auth_safe.content_type != DATA {
            return Err(decode_error(format!(
                "unsupported integrity mode {}",
                pfx.auth_safe.content_type
            )));
        }

        let safes = Vec::<ContentInfo>::from_der(data_octets(&pfx.auth_safe)?).map_err(asn1_error)?;

        let mut certificates = Vec::new();
        for safe in &safes {
            if safe.content_type == ENCRYPTED_DATA {
                return Err(decode_error("encrypted content is not supported".to_string()));
            }
            if safe.content_type != DATA {
                return Err(decode_error(format!(
                    "unsupported content type {}",
                    safe.content_type
                )));
            }

            let bags = Vec::<SafeBag>::from_der(data_octets(safe)?).map_err(asn1_error)?;
            for bag in &bags {
                certificates.push(decode_cert_bag(bag)?);
            }
        }

        Ok(Self { certificates })
    }

    /// Encode as a passwordless PFX without MAC.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bags = self
            .certificates
            .iter()
            .map(encode_cert_bag)
            .collect::<Result<Vec<_>>>()?;

        let safe_contents = bags.to_der().map_err(asn1_error)?;
        let authenticated_safe = vec![data_content_info(safe_contents)?]
            .to_der()
            .map_err(asn1_error)?;

        let pfx = Pfx {
            version: PFX_VERSION,
            auth_safe: data_content_info(authenticated_safe)?,
            mac_data: None,
        };
        pfx.to_der().map_err(asn1_error)
    }

    pub fn certificates(&self) -> &[TrustedCertificate] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Append a trusted certificate.
    pub fn add_certificate(&mut self, friendly_name: &str, der: Vec<u8>) {
        self.certificates.push(TrustedCertificate {
            friendly_name: Some(friendly_name.to_string()),
            der,
        });
    }
}

fn decode_error(message: String) -> InjectError {
    InjectError::DecodeError(format!("PKCS#12: {}", message))
}

fn asn1_error(e: der::Error) -> InjectError {
    decode_error(e.to_string())
}

/// Octets carried by a `data` content info.
fn data_octets(info: &ContentInfo) -> Result<&[u8]> {
    match &info.content {
        Some(content) if content.tag() == Tag::OctetString => Ok(content.value()),
        Some(content) => Err(decode_error(format!(
            "expected OCTET STRING content, found {}",
            content.tag()
        ))),
        None => Err(decode_error("content info has no content".to_string())),
    }
}

fn data_content_info(octets: Vec<u8>) -> Result<ContentInfo> {
    Ok(ContentInfo {
        content_type: DATA,
        content: Some(Any::new(Tag::OctetString, octets).map_err(asn1_error)?),
    })
}

fn decode_cert_bag(bag: &SafeBag) -> Result<TrustedCertificate> {
    if bag.bag_id != CERT_BAG {
        return Err(decode_error(format!("unsupported bag type {}", bag.bag_id)));
    }

    let cert_bag = CertBag::from_der(&bag.bag_value.to_der().map_err(asn1_error)?)
        .map_err(asn1_error)?;
    if cert_bag.cert_id != X509_CERTIFICATE {
        return Err(decode_error(format!(
            "unsupported certificate type {}",
            cert_bag.cert_id
        )));
    }

    let friendly_name = match &bag.bag_attributes {
        Some(attributes) => friendly_name(attributes)?,
        None => None,
    };

    Ok(TrustedCertificate {
        friendly_name,
        der: cert_bag.cert_value.as_bytes().to_vec(),
    })
}

fn friendly_name(attributes: &Any) -> Result<Option<String>> {
    let mut reader = SliceReader::new(attributes.value()).map_err(asn1_error)?;
    let mut name = None;

    while !reader.is_finished() {
        let attribute: BagAttribute = reader.decode().map_err(asn1_error)?;
        if attribute.attr_id != FRIENDLY_NAME {
            continue;
        }
        let mut values = SliceReader::new(attribute.attr_values.value()).map_err(asn1_error)?;
        let value: Any = values.decode().map_err(asn1_error)?;
        if value.tag() != Tag::BmpString {
            return Err(decode_error(format!(
                "friendly name is a {}, expected BMPString",
                value.tag()
            )));
        }
        name = Some(decode_bmp(value.value())?);
    }

    Ok(name)
}

fn encode_cert_bag(certificate: &TrustedCertificate) -> Result<SafeBag> {
    let cert_bag = CertBag {
        cert_id: X509_CERTIFICATE,
        cert_value: OctetString::new(certificate.der.clone()).map_err(asn1_error)?,
    };

    let mut attributes = Vec::new();
    if let Some(name) = &certificate.friendly_name {
        let value = Any::new(Tag::BmpString, encode_bmp(name)).map_err(asn1_error)?;
        attributes.push(encode_attribute(FRIENDLY_NAME, value)?);
    }
    let usage = Any::from_der(&ANY_EXTENDED_KEY_USAGE.to_der().map_err(asn1_error)?)
        .map_err(asn1_error)?;
    attributes.push(encode_attribute(TRUSTED_KEY_USAGE, usage)?);

    Ok(SafeBag {
        bag_id: CERT_BAG,
        bag_value: Any::from_der(&cert_bag.to_der().map_err(asn1_error)?).map_err(asn1_error)?,
        bag_attributes: Some(der_set(attributes)?),
    })
}

fn encode_attribute(attr_id: ObjectIdentifier, value: Any) -> Result<Vec<u8>> {
    let attribute = BagAttribute {
        attr_id,
        attr_values: der_set(vec![value.to_der().map_err(asn1_error)?])?,
    };
    attribute.to_der().map_err(asn1_error)
}

/// DER SET OF: elements sorted by their encoding.
fn der_set(mut elements: Vec<Vec<u8>>) -> Result<Any> {
    elements.sort();
    Any::new(Tag::Set, elements.concat()).map_err(asn1_error)
}

fn encode_bmp(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

fn decode_bmp(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(decode_error("odd-length BMPString".to_string()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| decode_error("invalid BMPString".to_string()))
}
