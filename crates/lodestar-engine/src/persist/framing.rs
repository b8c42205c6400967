//! Record framing shared by the log and snapshot files.
//!
//! File format: `[magic:4][version:2][reserved:2][records...]`
//! Record format: `[length:4][sequence:8][json bytes:N][crc32:4]`
//!
//! All integers are little-endian; the CRC covers the JSON payload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;

use crate::error::StoreError;

pub(crate) const FORMAT_VERSION: u16 = 1;
/// magic(4) + version(2) + reserved(2)
pub(crate) const HEADER_SIZE: usize = 8;
/// length(4) + sequence(8)
const RECORD_PREFIX: usize = 12;
/// length(4) + sequence(8) + crc32(4)
const RECORD_OVERHEAD: usize = 16;

pub(crate) fn write_header(w: &mut impl Write, magic: &[u8; 4]) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(magic);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    w.write_all(&header)
}

/// Serialize one framed record.
pub(crate) fn encode<T: Serialize>(sequence: u64, record: &T) -> Result<Vec<u8>, StoreError> {
    let payload = serde_json::to_vec(record)?;
    let length = u32::try_from(payload.len())
        .map_err(|_| StoreError::Serialization("record larger than 4 GiB".into()))?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// A decoded record and where it started.
#[derive(Debug)]
pub(crate) struct Frame<T> {
    pub offset: u64,
    pub sequence: u64,
    pub record: T,
}

/// Result of scanning a whole file.
#[derive(Debug)]
pub(crate) struct Scan<T> {
    pub frames: Vec<Frame<T>>,
    /// Offset of an incomplete trailing record, if the file ends mid-record
    pub torn_at: Option<u64>,
}

/// Decode every record in `bytes`.
///
/// An incomplete trailing record (or header) is reported through
/// [`Scan::torn_at`]; everything else that does not check out is corruption.
pub(crate) fn scan<T: DeserializeOwned>(
    bytes: &[u8],
    magic: &[u8; 4],
    file: &str,
) -> Result<Scan<T>, StoreError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(Scan {
            frames: Vec::new(),
            torn_at: (!bytes.is_empty()).then_some(0),
        });
    }
    if &bytes[..4] != magic {
        return Err(corruption(file, 0, "bad magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            file: file.to_string(),
            version,
        });
    }

    let mut frames = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos < bytes.len() {
        let offset = pos as u64;
        let remaining = bytes.len() - pos;
        if remaining < RECORD_PREFIX {
            return Ok(Scan {
                frames,
                torn_at: Some(offset),
            });
        }

        let length = read_u32(&bytes[pos..]) as usize;
        let sequence = read_u64(&bytes[pos + 4..]);
        if length == 0 {
            return Err(corruption(file, offset, "zero-length record"));
        }
        if remaining < RECORD_OVERHEAD + length {
            return Ok(Scan {
                frames,
                torn_at: Some(offset),
            });
        }

        let payload = &bytes[pos + RECORD_PREFIX..pos + RECORD_PREFIX + length];
        let stored_crc = read_u32(&bytes[pos + RECORD_PREFIX + length..]);
        if crc32fast::hash(payload) != stored_crc {
            return Err(corruption(file, offset, "checksum mismatch"));
        }
        let record = serde_json::from_slice(payload)
            .map_err(|e| corruption(file, offset, &format!("undecodable record: {e}")))?;

        frames.push(Frame {
            offset,
            sequence,
            record,
        });
        pos += RECORD_OVERHEAD + length;
    }

    Ok(Scan {
        frames,
        torn_at: None,
    })
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_le_bytes(buf)
}

fn corruption(file: &str, offset: u64, reason: &str) -> StoreError {
    StoreError::Corruption {
        file: file.to_string(),
        offset,
        reason: reason.to_string(),
    }
}
