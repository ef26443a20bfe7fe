use crate::error::{AencError, Result};
use std::io::{Read, Write};

/// Magic bytes identifying an AENC artifact
pub const MAGIC: [u8; 4] = *b"AENC";

/// Current version of the artifact format
pub const VERSION: u8 = 0x01;

/// Salt length, stored in cleartext right after the version byte
pub const SALT_LEN: usize = 16;

/// XChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

/// Trailing HMAC-SHA256 length
pub const MAC_LEN: usize = 32;

/// Hard upper bound on the encrypted-header length field; anything larger
/// is treated as corruption before a single header byte is read.
pub const MAX_HEADER_LEN: usize = 10_000;

/// Default chunk size: 1 MiB of plaintext per chunk
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Fixed bytes before the encrypted header:
/// magic (4) + version (1) + salt (16) + header nonce (24) + header length (4)
pub const ENVELOPE_PREFIX_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4;

/// Serialized length of a header whose strings are all empty
pub const MIN_HEADER_LEN: usize = 1 + 2 + 1 + 1 + 1 + 8 + 8;

/// No artifact of either mode can be shorter than this
pub const MIN_ENVELOPE_LEN: usize = ENVELOPE_PREFIX_LEN + MIN_HEADER_LEN + TAG_LEN + MAC_LEN;

/// Plaintext form of the encrypted header: everything needed to reverse the
/// archive transform and frame the chunk stream.
///
/// Layout (big-endian lengths, exact field order):
/// - uuid_len: u8, uuid bytes (UTF-8)
/// - name_len: u16, name bytes (UTF-8)
/// - ext_len: u8, extension bytes (UTF-8, no leading dot)
/// - was_directory: u8 (0|1)
/// - is_compressed: u8 (0|1)
/// - original_size: i64
/// - compressed_size: i64
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub uuid: String,
    pub original_name: String,
    /// Extension without the leading dot; empty when `was_directory`
    pub original_extension: String,
    pub was_directory: bool,
    pub is_compressed: bool,
    /// Uncompressed byte count of the source file or directory tree
    pub original_size: i64,
    /// Exact byte length of the payload covered by the chunk sequence
    pub compressed_size: i64,
}

impl Header {
    /// Serialize to the exact on-disk field order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.uuid.len() > u8::MAX as usize {
            return Err(AencError::InvalidInput(format!(
                "uuid too long: {} bytes (max {})",
                self.uuid.len(),
                u8::MAX
            )));
        }
        if self.original_name.len() > u16::MAX as usize {
            return Err(AencError::InvalidInput(format!(
                "name too long: {} bytes (max {})",
                self.original_name.len(),
                u16::MAX
            )));
        }
        if self.original_extension.len() > u8::MAX as usize {
            return Err(AencError::InvalidInput(format!(
                "extension too long: {} bytes (max {})",
                self.original_extension.len(),
                u8::MAX
            )));
        }
        if self.original_size < 0 || self.compressed_size < 0 {
            return Err(AencError::InvalidInput(
                "sizes must not be negative".to_string(),
            ));
        }

        let mut buf = Vec::with_capacity(
            MIN_HEADER_LEN
                + self.uuid.len()
                + self.original_name.len()
                + self.original_extension.len(),
        );
        buf.push(self.uuid.len() as u8);
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.extend_from_slice(&(self.original_name.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.original_name.as_bytes());
        buf.push(self.original_extension.len() as u8);
        buf.extend_from_slice(self.original_extension.as_bytes());
        buf.push(self.was_directory as u8);
        buf.push(self.is_compressed as u8);
        buf.extend_from_slice(&self.original_size.to_be_bytes());
        buf.extend_from_slice(&self.compressed_size.to_be_bytes());
        Ok(buf)
    }

    /// Parse a decrypted header. The input must be exactly one serialized
    /// header; trailing bytes are corruption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;

        let uuid_len = read_u8(&mut cursor)? as usize;
        let uuid = read_string(&mut cursor, uuid_len, "uuid")?;
        let name_len = read_u16(&mut cursor)? as usize;
        let original_name = read_string(&mut cursor, name_len, "name")?;
        let ext_len = read_u8(&mut cursor)? as usize;
        let original_extension = read_string(&mut cursor, ext_len, "extension")?;
        let was_directory = read_flag(&mut cursor, "was_directory")?;
        let is_compressed = read_flag(&mut cursor, "is_compressed")?;
        let original_size = read_i64(&mut cursor)?;
        let compressed_size = read_i64(&mut cursor)?;

        if original_size < 0 || compressed_size < 0 {
            return Err(AencError::Corrupt("negative size in header".to_string()));
        }
        if !cursor.is_empty() {
            return Err(AencError::Corrupt(format!(
                "{} unexpected bytes after header fields",
                cursor.len()
            )));
        }

        Ok(Self {
            uuid,
            original_name,
            original_extension,
            was_directory,
            is_compressed,
            original_size,
            compressed_size,
        })
    }
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8> {
    let mut b = [0u8; 1];
    cursor.read_exact(&mut b).map_err(AencError::from_read)?;
    Ok(b[0])
}

fn read_u16(cursor: &mut &[u8]) -> Result<u16> {
    let mut b = [0u8; 2];
    cursor.read_exact(&mut b).map_err(AencError::from_read)?;
    Ok(u16::from_be_bytes(b))
}

fn read_i64(cursor: &mut &[u8]) -> Result<i64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b).map_err(AencError::from_read)?;
    Ok(i64::from_be_bytes(b))
}

fn read_flag(cursor: &mut &[u8], field: &str) -> Result<bool> {
    match read_u8(cursor)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(AencError::Corrupt(format!(
            "invalid {} flag: {}",
            field, other
        ))),
    }
}

fn read_string(cursor: &mut &[u8], len: usize, field: &str) -> Result<String> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(AencError::from_read)?;
    String::from_utf8(bytes)
        .map_err(|_| AencError::Corrupt(format!("{} is not valid UTF-8", field)))
}

/// Number of chunks a payload of `payload_len` bytes occupies at `chunk_size`.
pub fn chunk_count_for(payload_len: u64, chunk_size: u32) -> i64 {
    if payload_len == 0 {
        0
    } else {
        payload_len.div_ceil(chunk_size as u64) as i64
    }
}

/// Plaintext length of chunk `index` out of `count` chunks.
///
/// Every chunk but the last carries exactly `chunk_size` bytes; the last
/// carries the remainder (a full chunk when the payload divides evenly).
pub fn chunk_plain_len(payload_len: u64, chunk_size: u32, index: i64, count: i64) -> u64 {
    if index + 1 < count {
        chunk_size as u64
    } else {
        let rem = payload_len % chunk_size as u64;
        if rem == 0 && payload_len > 0 {
            chunk_size as u64
        } else {
            rem
        }
    }
}

/// Write the fixed envelope prefix: magic, version, salt, header nonce and
/// header length, in that order.
pub fn write_envelope_prefix(
    out: &mut Vec<u8>,
    salt: &[u8; SALT_LEN],
    header_nonce: &[u8; NONCE_LEN],
    header_len: usize,
) -> Result<()> {
    if header_len > MAX_HEADER_LEN {
        return Err(AencError::InvalidInput(format!(
            "encrypted header too large: {} bytes (max {})",
            header_len, MAX_HEADER_LEN
        )));
    }
    out.write_all(&MAGIC)?;
    out.push(VERSION);
    out.write_all(salt)?;
    out.write_all(header_nonce)?;
    out.write_all(&(header_len as u32).to_be_bytes())?;
    Ok(())
}
