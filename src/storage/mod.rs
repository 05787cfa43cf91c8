//! SPDB Storage Engine
//!
//! This module provides the day-partitioned chunk database:
//!
//! - **types**: Core data structures (ChunkRef, PutChunk, Chunk, GetOptions)
//! - **compression**: Gzip / bzip2 chunk payload encoding
//! - **codec**: Versioned big-endian index file format
//! - **chunk_store**: Data file arena with staged in-place writes
//! - **lock**: Per-day advisory file locks
//! - **day_file**: One day's index + data pair, open/commit/defrag
//! - **query**: Query kinds and result selection rules
//! - **hash**: Short ID ↔ data_type packing
//! - **engine**: The `Spdb` handle orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Put Path:
//!   PutChunk → Buffer → Compress → Day lock → Store (per mode) → Commit (data fsync, index rename)
//!
//! Get Path:
//!   Query → List days → Shared lock → Decode index → Filter refs → Read + decompress
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use spdb::storage::{GetOptions, PutChunk, PutMode, Spdb};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut db = Spdb::new();
//!     db.set_put_mode(PutMode::Over);
//!
//!     // Store a chunk valid for ten minutes
//!     let t = 1_704_067_200;
//!     db.put_chunk("./data/radar", 100, "radar mosaic", PutChunk::new(t, t + 600, b"payload".to_vec()).data_type(7))?;
//!
//!     // Read it back
//!     let chunks = db.get_exact("./data/radar", t, GetOptions::new().data_type(7))?;
//!     println!("Found {} chunks", chunks.len());
//!
//!     Ok(())
//! }
//! ```

pub mod chunk_store;
pub mod codec;
pub mod compression;
pub mod day_file;
pub mod engine;
pub mod error;
pub mod hash;
pub mod lock;
pub mod query;
pub mod types;

// Re-export commonly used types
pub use codec::{Header, IndexFile};
pub use compression::Compression;
pub use day_file::{DayFile, DayPaths};
pub use engine::{Spdb, SpdbConfig};
pub use error::{SpdbError, SpdbResult};
pub use hash::{dehash_i32_to_4chars, dehash_i32_to_5chars, hash_4chars_to_i32, hash_5chars_to_i32};
pub use query::{FailedDay, Query};
pub use types::{
    AuxRef, Chunk, ChunkRef, DbTimes, GetOptions, LeadTimeStorage, PutChunk, PutMode, UniqueMode,
};
