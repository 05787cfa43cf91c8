//! Core data types for the SPDB chunk store
//!
//! - `ChunkRef` / `AuxRef`: per-chunk index entries stored in a day's index file
//! - `PutChunk`: a chunk queued for writing
//! - `Chunk`: a chunk returned by a query
//! - `GetOptions`: type filter and flags shared by every query
//! - `PutMode`, `UniqueMode`, `LeadTimeStorage`: engine settings

use crate::storage::compression::Compression;
use serde::{Deserialize, Serialize};

/// Seconds in one UTC day
pub const SECS_PER_DAY: i64 = 86_400;

/// Entries in the per-day minute index
pub const MINS_PER_DAY: usize = 1440;

/// On-disk width of a chunk tag, including the terminating NUL
pub const TAG_LEN: usize = 64;

/// Start (00:00:00 UTC) of the day containing `t`
pub fn day_start(t: i64) -> i64 {
    t.div_euclid(SECS_PER_DAY) * SECS_PER_DAY
}

/// Index entry for one stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub data_type: i32,
    pub data_type2: i32,
    /// Unix seconds the chunk represents
    pub valid_time: i64,
    /// Unix seconds after which the chunk is no longer "currently valid"
    pub expire_time: i64,
    /// Wall-clock time the chunk was put
    pub write_time: i64,
    /// Byte offset into the day's data file
    pub offset: u64,
    /// Stored (possibly compressed) length
    pub len: u32,
    /// Position of this chunk's aux ref
    pub aux_index: u32,
}

impl ChunkRef {
    /// Whether this ref matches the requested types.
    ///
    /// Without `respect_zero`, a requested type of 0 is a wildcard:
    /// `data_type2 == 0` matches any `data_type2` (and `data_type == 0` then
    /// matches anything), while `data_type == 0` with a non-zero
    /// `data_type2` selects on `data_type2` alone.
    pub fn matches_types(&self, data_type: i32, data_type2: i32, respect_zero: bool) -> bool {
        if respect_zero {
            return data_type == self.data_type && data_type2 == self.data_type2;
        }
        if data_type2 == 0 {
            data_type == 0 || data_type == self.data_type
        } else if data_type == 0 {
            data_type2 == self.data_type2
        } else {
            data_type == self.data_type && data_type2 == self.data_type2
        }
    }

    /// End of the stored region in the data file
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}

/// Auxiliary per-chunk metadata, parallel to the ref array
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuxRef {
    /// How the stored bytes are encoded
    pub compression: Compression,
    /// Free-form label, at most `TAG_LEN - 1` bytes on disk
    pub tag: Option<String>,
}

/// A chunk queued for a put
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutChunk {
    pub valid_time: i64,
    pub expire_time: i64,
    pub data_type: i32,
    pub data_type2: i32,
    pub tag: Option<String>,
    /// Overrides the write time stamped when the chunk is queued
    pub write_time: Option<i64>,
    pub data: Vec<u8>,
}

impl PutChunk {
    pub fn new(valid_time: i64, expire_time: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            valid_time,
            expire_time,
            data_type: 0,
            data_type2: 0,
            tag: None,
            write_time: None,
            data: data.into(),
        }
    }

    /// Builder method: set data_type
    pub fn data_type(mut self, data_type: i32) -> Self {
        self.data_type = data_type;
        self
    }

    /// Builder method: set data_type2
    pub fn data_type2(mut self, data_type2: i32) -> Self {
        self.data_type2 = data_type2;
        self
    }

    /// Builder method: set the tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Builder method: set an explicit write time
    pub fn write_time(mut self, write_time: i64) -> Self {
        self.write_time = Some(write_time);
        self
    }
}

/// A chunk returned by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub chunk_ref: ChunkRef,
    pub aux: AuxRef,
    /// Payload; empty for refs-only queries
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Encoding of `data` as held in memory
    pub compression: Compression,
}

impl Chunk {
    pub fn valid_time(&self) -> i64 {
        self.chunk_ref.valid_time
    }

    pub fn data_type(&self) -> i32 {
        self.chunk_ref.data_type
    }
}

/// How a put treats chunks already stored at the same time and types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutMode {
    /// Replace the first matching chunk, or insert
    #[default]
    Over,
    /// Fail if a matching chunk exists
    Once,
    /// Always insert after existing chunks at the same time
    Add,
    /// Insert unless an identical chunk is already stored
    AddUnique,
}

impl std::str::FromStr for PutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "over" => Ok(PutMode::Over),
            "once" => Ok(PutMode::Once),
            "add" => Ok(PutMode::Add),
            "add_unique" | "add-unique" | "addunique" => Ok(PutMode::AddUnique),
            _ => Err(format!(
                "Invalid put mode: {}. Use: over, once, add, add_unique",
                s
            )),
        }
    }
}

/// Post-query collapse of chunks sharing a data_type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueMode {
    #[default]
    Off,
    Latest,
    Earliest,
}

/// Where a forecast lead time is carried, recorded in every day header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum LeadTimeStorage {
    #[default]
    NotApplicable = 0,
    InDataType = 1,
    InDataType2 = 2,
}

impl TryFrom<i32> for LeadTimeStorage {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LeadTimeStorage::NotApplicable),
            1 => Ok(LeadTimeStorage::InDataType),
            2 => Ok(LeadTimeStorage::InDataType2),
            _ => Err(format!("Unknown lead time storage: {}", value)),
        }
    }
}

/// Type filter and flags shared by every get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetOptions {
    pub data_type: i32,
    pub data_type2: i32,
    /// Return refs only, never touching the data file
    pub refs_only: bool,
    /// Treat 0 as a literal type instead of a wildcard
    pub respect_zero_types: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: filter on data_type
    pub fn data_type(mut self, data_type: i32) -> Self {
        self.data_type = data_type;
        self
    }

    /// Builder method: filter on data_type2
    pub fn data_type2(mut self, data_type2: i32) -> Self {
        self.data_type2 = data_type2;
        self
    }

    /// Builder method: return refs only
    pub fn refs_only(mut self) -> Self {
        self.refs_only = true;
        self
    }

    /// Builder method: match 0 literally
    pub fn respect_zero_types(mut self) -> Self {
        self.respect_zero_types = true;
        self
    }

    /// Whether a stored ref passes the type filter and the optional write-time ceiling
    pub fn accepts(&self, chunk_ref: &ChunkRef, write_time_ceiling: Option<i64>) -> bool {
        if let Some(ceiling) = write_time_ceiling {
            if chunk_ref.write_time > ceiling {
                return false;
            }
        }
        chunk_ref.matches_types(self.data_type, self.data_type2, self.respect_zero_types)
    }
}

/// Time span of a database; all `None` when it holds no chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DbTimes {
    /// Earliest valid time in the first day file
    pub first_time: Option<i64>,
    /// Latest valid time in the last non-empty day file
    pub last_time: Option<i64>,
    /// Latest valid time that passes the write-time ceiling
    pub last_valid_time: Option<i64>,
}
