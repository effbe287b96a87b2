//! A minimal on-disk block database for time series.
//!
//! Blocks are immutable directories named by a ULID:
//!
//! ```text
//! <ULID>/
//!   meta.json      block metadata (interval, stats, compaction lineage)
//!   index          sorted series directory pointing into the chunk segment
//!   chunks/000001  fixed-width little-endian sample records
//!   tombstones     deletion-intent marker, empty until a deletion is staged
//! ```
//!
//! Writers buffer appends in transactions and lay the block down on `flush`;
//! readers merge any number of blocks behind a single sorted series cursor.

pub mod block;
pub mod chunks;
pub mod compact;
pub mod db;
pub mod index;
pub mod meta;
pub mod writer;

pub use block::Block;
pub use compact::LeveledCompactor;
pub use db::Db;
pub use meta::{
    BlockMeta,
    BlockStats,
};
pub use ulid::Ulid;
pub use writer::{
    Appender,
    BlockWriter,
};

/// The native block duration `D`: two hours in milliseconds.
pub const NATIVE_BLOCK_DURATION_MS: i64 = 2 * 60 * 60 * 1000;

pub const META_FILENAME: &str = "meta.json";
pub const INDEX_FILENAME: &str = "index";
pub const TOMBSTONES_FILENAME: &str = "tombstones";
pub const CHUNKS_DIRNAME: &str = "chunks";
pub const CHUNK_SEGMENT_FILENAME: &str = "000001";
