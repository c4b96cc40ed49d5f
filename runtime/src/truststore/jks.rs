//! Java KeyStore (JKS) codec.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic 0xFEEDFEED | version (1 or 2) | entry count
//! entry*: tag (1 = private key, 2 = trusted certificate)
//!         alias (u16 length + modified UTF-8) | timestamp (u64 ms)
//!         private key: u32 length + encrypted key | u32 chain length + certificate*
//!         trusted:     certificate
//! certificate: [type as u16-prefixed UTF, version 2 only] u32 length + bytes
//! SHA-1(UTF-16BE(password) || "Mighty Aphrodite" || everything above)
//! ```

use cainject_core::error::{InjectError, Result};
use ring::digest;

const MAGIC: u32 = 0xFEED_FEED;
const VERSION_1: u32 = 1;
const VERSION_2: u32 = 2;
const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;
const DIGEST_WHITENER: &[u8] = b"Mighty Aphrodite";
const DIGEST_LEN: usize = 20;

/// Certificate type used when none is recorded.
pub const X509_TYPE: &str = "X.509";

/// A certificate as stored in a keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub cert_type: String,
    pub data: Vec<u8>,
}

impl StoredCertificate {
    pub fn x509(der: Vec<u8>) -> Self {
        Self {
            cert_type: X509_TYPE.to_string(),
            data: der,
        }
    }
}

/// One keystore entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreEntry {
    /// Private key entries are carried through untouched.
    PrivateKey {
        alias: String,
        timestamp: u64,
        encrypted_key: Vec<u8>,
        chain: Vec<StoredCertificate>,
    },
    TrustedCertificate {
        alias: String,
        timestamp: u64,
        certificate: StoredCertificate,
    },
}

impl KeyStoreEntry {
    pub fn alias(&self) -> &str {
        match self {
            Self::PrivateKey { alias, .. } | Self::TrustedCertificate { alias, .. } => alias,
        }
    }
}

/// An in-memory Java KeyStore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStore {
    entries: Vec<KeyStoreEntry>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data` starts with the JKS magic.
    pub fn is_jks(data: &[u8]) -> bool {
        data.len() >= 4 && u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == MAGIC
    }

    /// Decode a keystore and check its integrity digest.
    ///
    /// Content that is not a JKS at all is a `FormatMismatch`; a JKS that is
    /// truncated, malformed or fails the password check is a `DecodeError`.
    pub fn load(data: &[u8], password: &str) -> Result<Self> {
        if !Self::is_jks(data) {
            return Err(InjectError::FormatMismatch {
                format: "JKS".to_string(),
                message: "invalid keystore magic".to_string(),
            });
        }
        if data.len() < 12 + DIGEST_LEN {
            return Err(decode_error("keystore is truncated"));
        }

        let (body, expected) = data.split_at(data.len() - DIGEST_LEN);
        if keyed_digest(password, body).as_ref() != expected {
            return Err(decode_error(
                "keystore was tampered with, or password was incorrect",
            ));
        }

        let mut reader = Reader::new(body);
        reader.u32()?;
        let version = reader.u32()?;
        if version != VERSION_1 && version != VERSION_2 {
            return Err(decode_error(&format!("unsupported keystore version {}", version)));
        }
        let count = reader.u32()?;

        let mut entries = Vec::new();
        for _ in 0..count {
            let tag = reader.u32()?;
            let alias = reader.utf()?.to_lowercase();
            let timestamp = reader.u64()?;
            let entry = match tag {
                TAG_PRIVATE_KEY => {
                    let key_len = reader.u32()? as usize;
                    let encrypted_key = reader.bytes(key_len)?.to_vec();
                    let chain_len = reader.u32()?;
                    let chain = (0..chain_len)
                        .map(|_| reader.certificate(version))
                        .collect::<Result<Vec<_>>>()?;
                    KeyStoreEntry::PrivateKey {
                        alias,
                        timestamp,
                        encrypted_key,
                        chain,
                    }
                }
                TAG_TRUSTED_CERT => KeyStoreEntry::TrustedCertificate {
                    alias,
                    timestamp,
                    certificate: reader.certificate(version)?,
                },
                other => return Err(decode_error(&format!("unknown entry tag {}", other))),
            };
            entries.push(entry);
        }

        if !reader.is_empty() {
            return Err(decode_error("trailing data after keystore entries"));
        }

        Ok(Self { entries })
    }

    /// Encode as a version 2 keystore protected by `password`.
    pub fn store(&self, password: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&VERSION_2.to_be_bytes());
        out.extend_from_slice(&length_u32(self.entries.len())?.to_be_bytes());

        for entry in &self.entries {
            match entry {
                KeyStoreEntry::PrivateKey {
                    alias,
                    timestamp,
                    encrypted_key,
                    chain,
                } => {
                    out.extend_from_slice(&TAG_PRIVATE_KEY.to_be_bytes());
                    write_utf(&mut out, alias)?;
                    out.extend_from_slice(&timestamp.to_be_bytes());
                    write_bytes(&mut out, encrypted_key)?;
                    out.extend_from_slice(&length_u32(chain.len())?.to_be_bytes());
                    for certificate in chain {
                        write_certificate(&mut out, certificate)?;
                    }
                }
                KeyStoreEntry::TrustedCertificate {
                    alias,
                    timestamp,
                    certificate,
                } => {
                    out.extend_from_slice(&TAG_TRUSTED_CERT.to_be_bytes());
                    write_utf(&mut out, alias)?;
                    out.extend_from_slice(&timestamp.to_be_bytes());
                    write_certificate(&mut out, certificate)?;
                }
            }
        }

        let digest = keyed_digest(password, &out);
        out.extend_from_slice(digest.as_ref());
        Ok(out)
    }

    pub fn entries(&self) -> &[KeyStoreEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by alias (case-insensitive).
    pub fn get(&self, alias: &str) -> Option<&KeyStoreEntry> {
        let alias = alias.to_lowercase();
        self.entries.iter().find(|e| e.alias() == alias)
    }

    /// Add a trusted certificate, replacing any entry with the same alias.
    /// `content` is stored as given.
    pub fn set_trusted_certificate(&mut self, alias: &str, content: Vec<u8>, timestamp: u64) {
        let entry = KeyStoreEntry::TrustedCertificate {
            alias: alias.to_lowercase(),
            timestamp,
            certificate: StoredCertificate::x509(content),
        };
        match self.entries.iter_mut().find(|e| e.alias() == entry.alias()) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }
}

fn decode_error(message: &str) -> InjectError {
    InjectError::DecodeError(format!("JKS: {}", message))
}

fn keyed_digest(password: &str, body: &[u8]) -> digest::Digest {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    for unit in password.encode_utf16() {
        ctx.update(&unit.to_be_bytes());
    }
    ctx.update(DIGEST_WHITENER);
    ctx.update(body);
    ctx.finish()
}

fn length_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| decode_error("length does not fit in 32 bits"))
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    out.extend_from_slice(&length_u32(data.len())?.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn write_certificate(out: &mut Vec<u8>, certificate: &StoredCertificate) -> Result<()> {
    write_utf(out, &certificate.cert_type)?;
    write_bytes(out, &certificate.data)
}

/// Write a string in Java's modified UTF-8 with a u16 length prefix.
fn write_utf(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let mut encoded = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => encoded.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                encoded.push(0xC0 | (unit >> 6) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                encoded.push(0xE0 | (unit >> 12) as u8);
                encoded.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    let len = u16::try_from(encoded.len())
        .map_err(|_| decode_error(&format!("string too long: {} bytes", encoded.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&encoded);
    Ok(())
}

/// Decode Java's modified UTF-8.
fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let invalid = || decode_error("invalid modified UTF-8 string");

    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1).ok_or_else(invalid)?;
            units.push(((b as u16 & 0x1F) << 6) | (b2 as u16 & 0x3F));
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1).ok_or_else(invalid)?;
            let b3 = *bytes.get(i + 2).ok_or_else(invalid)?;
            units.push(((b as u16 & 0x0F) << 12) | ((b2 as u16 & 0x3F) << 6) | (b3 as u16 & 0x3F));
            i += 3;
        } else {
            return Err(invalid());
        }
    }

    String::from_utf16(&units).map_err(|_| invalid())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| decode_error("unexpected end of keystore"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    fn utf(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        decode_modified_utf8(self.bytes(len)?)
    }

    fn certificate(&mut self, version: u32) -> Result<StoredCertificate> {
        let cert_type = if version == VERSION_2 {
            self.utf()?
        } else {
            X509_TYPE.to_string()
        };
        let len = self.u32()? as usize;
        Ok(StoredCertificate {
            cert_type,
            data: self.bytes(len)?.to_vec(),
        })
    }
}
