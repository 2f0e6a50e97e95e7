//! Checksummed binary envelope for transporting protocol artifacts.
//!
//! ```text
//! [1B version=0x01]
//! [1B kind]                  # 1=WMatrix 2=KvCache
//! [2B flags]                 # bit0: zstd, bit1: xchacha20poly1305, bit2: strong_tail
//! [4B body_len]              # stored body length (after compression/sealing)
//! [24B nonce]                # only when sealed
//! [ ... body ... ]
//! [8B xxh3_64]               # over the stored body, only with strong_tail
//! [4B CRC32]                 # over all above
//! ```
//!
//! All integers are little-endian. The transport string form is the standard
//! base64 encoding of the envelope bytes.

use crate::crypto::{self, SealKey, NONCE_LEN};
use crate::error::{ProtocolError, Result};
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use xxhash_rust::xxh3::xxh3_64;
use zstd::stream::{decode_all, encode_all};

pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 8;
const CRC_LEN: usize = 4;

/// What an envelope carries.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    WMatrix = 0x01,
    KvCache = 0x02,
}

impl ArtifactKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x01 => Some(ArtifactKind::WMatrix),
            0x02 => Some(ArtifactKind::KvCache),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Envelope flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const ZSTD = 1 << 0;
        const XCHACHA = 1 << 1;
        const STRONG_TAIL = 1 << 2;
    }
}

/// How to wrap a body.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// zstd level; `None` stores the body uncompressed.
    pub zstd_level: Option<i32>,
    /// Seal the body for a single recipient.
    pub seal_key: Option<SealKey>,
    pub strong_tail: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            zstd_level: None,
            seal_key: None,
            strong_tail: true,
        }
    }
}

impl EncodeOptions {
    pub fn compressed(level: i32) -> Self {
        Self {
            zstd_level: Some(level),
            ..Default::default()
        }
    }

    pub fn sealed(key: SealKey) -> Self {
        Self {
            seal_key: Some(key),
            ..Default::default()
        }
    }
}

/// Decoded envelope. `body` is always the plain, decompressed payload.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub version: u8,
    pub kind: ArtifactKind,
    pub flags: Flags,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: ArtifactKind, body: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind,
            flags: Flags::empty(),
            body,
        }
    }

    pub fn encode(&self, opts: &EncodeOptions) -> Result<Vec<u8>> {
        let mut flags = Flags::empty();

        let mut stored = match opts.zstd_level {
            Some(level) => {
                flags |= Flags::ZSTD;
                encode_all(Cursor::new(&self.body), level)?
            }
            None => self.body.clone(),
        };

        let mut nonce = None;
        if let Some(key) = &opts.seal_key {
            let n = crypto::generate_nonce();
            stored = crypto::seal(key, &n, &stored)?;
            nonce = Some(n);
            flags |= Flags::XCHACHA;
        }

        if opts.strong_tail {
            flags |= Flags::STRONG_TAIL;
        }

        let body_len = u32::try_from(stored.len())
            .map_err(|_| ProtocolError::serialization("envelope body exceeds 4 GiB"))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + stored.len() + 40);
        buf.write_u8(self.version)?;
        buf.write_u8(self.kind as u8)?;
        buf.write_u16::<LittleEndian>(flags.bits())?;
        buf.write_u32::<LittleEndian>(body_len)?;
        if let Some(n) = nonce {
            buf.extend_from_slice(&n);
        }
        buf.extend_from_slice(&stored);
        if opts.strong_tail {
            buf.write_u64::<LittleEndian>(xxh3_64(&stored))?;
        }

        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc)?;

        Ok(buf)
    }

    /// Decode and verify. A sealed envelope needs `key`.
    pub fn decode(data: &[u8], key: Option<&SealKey>) -> Result<Self> {
        if data.len() < HEADER_LEN + CRC_LEN {
            return Err(ProtocolError::serialization(format!(
                "envelope too short: {} bytes",
                data.len()
            )));
        }

        // Verify CRC32 before trusting any header field
        let (framed, tail) = data.split_at(data.len() - CRC_LEN);
        let crc32 = Cursor::new(tail).read_u32::<LittleEndian>()?;
        let computed_crc = crc32fast::hash(framed);
        if crc32 != computed_crc {
            return Err(ProtocolError::serialization(format!(
                "CRC32 mismatch: expected {:#x}, got {:#x}",
                crc32, computed_crc
            )));
        }

        let mut cursor = Cursor::new(framed);
        let version = cursor.read_u8()?;
        if version != ENVELOPE_VERSION {
            return Err(ProtocolError::serialization(format!(
                "unsupported envelope version {}",
                version
            )));
        }
        let kind = ArtifactKind::from_u8(cursor.read_u8()?)
            .ok_or_else(|| ProtocolError::serialization("invalid artifact kind"))?;
        let flags = Flags::from_bits(cursor.read_u16::<LittleEndian>()?)
            .ok_or_else(|| ProtocolError::serialization("invalid flags"))?;
        let body_len = cursor.read_u32::<LittleEndian>()? as usize;

        let nonce = if flags.contains(Flags::XCHACHA) {
            let mut n = [0u8; NONCE_LEN];
            cursor.read_exact(&mut n)?;
            Some(n)
        } else {
            None
        };

        ensure_remaining(&cursor, body_len)?;
        let mut stored = vec![0u8; body_len];
        cursor.read_exact(&mut stored)?;

        if flags.contains(Flags::STRONG_TAIL) {
            let expected = cursor.read_u64::<LittleEndian>()?;
            let actual = xxh3_64(&stored);
            if expected != actual {
                return Err(ProtocolError::serialization(format!(
                    "strong hash mismatch: expected {:#x}, got {:#x}",
                    expected, actual
                )));
            }
        }

        if (cursor.position() as usize) != framed.len() {
            return Err(ProtocolError::serialization("trailing bytes after envelope body"));
        }

        if let Some(n) = nonce {
            let key = key.ok_or_else(|| {
                ProtocolError::Crypto("sealed envelope requires a key".into())
            })?;
            stored = crypto::open(key, &n, &stored)?;
        }

        let body = if flags.contains(Flags::ZSTD) {
            decode_all(Cursor::new(&stored))?
        } else {
            stored
        };

        Ok(Envelope {
            version,
            kind,
            flags,
            body,
        })
    }

    pub fn to_transport_string(&self, opts: &EncodeOptions) -> Result<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.encode(opts)?))
    }

    pub fn from_transport_string(payload: &str, key: Option<&SealKey>) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
        Self::decode(&bytes, key)
    }

    /// Decode and require a specific artifact kind.
    pub fn expect_kind(self, kind: ArtifactKind) -> Result<Self> {
        if self.kind != kind {
            return Err(ProtocolError::serialization(format!(
                "expected {:?} envelope, got {:?}",
                kind, self.kind
            )));
        }
        Ok(self)
    }
}

fn ensure_remaining(cursor: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if needed > remaining {
        return Err(ProtocolError::serialization(format!(
            "truncated payload: need {} bytes, {} available",
            needed, remaining
        )));
    }
    Ok(())
}

// Body field helpers shared by the artifact codecs.

pub(crate) fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| ProtocolError::serialization("string field longer than 65535 bytes"))?;
    buf.write_u16::<LittleEndian>(len)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    ensure_remaining(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| ProtocolError::serialization(e.to_string()))
}

pub(crate) fn write_f32s(buf: &mut Vec<u8>, values: &[f32]) -> Result<()> {
    buf.reserve(values.len() * 4);
    for &v in values {
        buf.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

pub(crate) fn read_f32s(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<f32>> {
    let bytes = count
        .checked_mul(4)
        .ok_or_else(|| ProtocolError::serialization("element count overflow"))?;
    ensure_remaining(cursor, bytes)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(cursor.read_f32::<LittleEndian>()?);
    }
    Ok(out)
}

pub(crate) fn expect_end(cursor: &Cursor<&[u8]>) -> Result<()> {
    if (cursor.position() as usize) != cursor.get_ref().len() {
        return Err(ProtocolError::serialization("unexpected trailing bytes in body"));
    }
    Ok(())
}
