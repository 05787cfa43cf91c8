//! # SPDB
//!
//! Symbolic Products Data Base - a file-based store for time-tagged binary
//! chunks, partitioned into one index + data file pair per UTC day.
//!
//! ## Features
//!
//! - **Day files**: `YYYYMMDD.indx` / `YYYYMMDD.data` with a minute index for fast seeks
//! - **Put modes**: overwrite, once-only, add and add-unique
//! - **Queries**: exact, closest, interval, valid, latest, first before/after
//! - **Safe concurrency**: per-day advisory locks with atomic index replacement
//! - **Compression**: optional gzip or bzip2 per chunk
//!
//! ## Modules
//!
//! - [`storage`]: Chunk database engine
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spdb::storage::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut db = Spdb::new();
//!     db.set_chunk_compress_on_put(Compression::Gzip);
//!
//!     // Queue and store two chunks
//!     let t = 1_704_067_200;
//!     db.add_put_chunk(PutChunk::new(t, t + 300, b"first".to_vec()).data_type(1));
//!     db.add_put_chunk(PutChunk::new(t + 300, t + 600, b"second".to_vec()).data_type(1));
//!     db.put("./data/obs", 0, "surface obs")?;
//!
//!     // What is valid now?
//!     let chunks = db.get_valid("./data/obs", t + 400, GetOptions::new())?;
//!     println!("Found {} valid chunks", chunks.len());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    Chunk, ChunkRef, Compression, GetOptions, PutChunk, PutMode, Query, Spdb, SpdbConfig,
    SpdbError, SpdbResult, UniqueMode,
};

pub use config::{Config, ConfigError, LoadedConfig, LoggingConfig, SpdbSection};
