//! Per-chunk compression for the chunk store
//!
//! A day file may mix compressions: each chunk's aux ref records how its
//! stored bytes were encoded, so decompression is always chosen per chunk.

use crate::storage::error::{SpdbError, SpdbResult};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::str::FromStr;

/// Compression applied to the stored bytes of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Bzip2 = 2,
}

impl Compression {
    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }
}

impl TryFrom<u32> for Compression {
    type Error = SpdbError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Bzip2),
            _ => Err(SpdbError::Compression(format!(
                "Unknown compression type: {}",
                value
            ))),
        }
    }
}

impl FromStr for Compression {
    type Err = SpdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            other => Err(SpdbError::InvalidArgument(format!(
                "Unknown compression '{}'. Use: none, gzip, bzip2",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Bzip2 => write!(f, "bzip2"),
        }
    }
}

/// Compress `data` with the given method
pub fn compress(method: Compression, data: &[u8]) -> SpdbResult<Vec<u8>> {
    match method {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| SpdbError::Compression(format!("gzip compression failed: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| SpdbError::Compression(format!("gzip compression failed: {}", e)))
        }
        Compression::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| SpdbError::Compression(format!("bzip2 compression failed: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| SpdbError::Compression(format!("bzip2 compression failed: {}", e)))
        }
    }
}

/// Decompress bytes that were stored with `method`
pub fn decompress(method: Compression, data: &[u8]) -> SpdbResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    match method {
        Compression::None => return Ok(data.to_vec()),
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| SpdbError::Compression(format!("gzip decompression failed: {}", e)))?;
        }
        Compression::Bzip2 => {
            bzip2::read::BzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| {
                    SpdbError::Compression(format!("bzip2 decompression failed: {}", e))
                })?;
        }
    }
    Ok(out)
}

/// Encode a payload for storage.
///
/// Falls back to storing raw bytes when compression would not shrink them,
/// so the returned method may be `None` even if `requested` is not.
pub fn encode_for_store(requested: Compression, data: &[u8]) -> SpdbResult<(Compression, Vec<u8>)> {
    if !requested.is_compressed() {
        return Ok((Compression::None, data.to_vec()));
    }
    let compressed = compress(requested, data)?;
    if compressed.len() >= data.len() {
        Ok((Compression::None, data.to_vec()))
    } else {
        Ok((requested, compressed))
    }
}
