#![doc = include_str!("../README.md")]

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub mod chunk;
pub mod counters;
pub mod read;
pub mod records;
pub mod replica;
pub mod retention;
pub mod segment;
pub mod write;

pub use counters::{LogCounters, ReplicaCounters, SharedOffsets};
pub use read::{LogReader, OffsetSpec, ParsedChunk, RawChunk};
pub use records::{ChunkHeader, ChunkType, Entry, TrackingKind, TrackingMap, WriterEntry, WriterMap, WriterSeqs};
pub use replica::Replica;
pub use retention::RetentionSpec;
pub use segment::{delete_directory, overview, SegmentInfo};
pub use write::{LogOptions, Writer};

/// Everything that can go wrong operating a log.
///
/// Most variants are unrecoverable for the task that owns the log: on-disk
/// corruption ([`InvalidChunkHeader`](OsilError::InvalidChunkHeader),
/// [`CrcMismatch`](OsilError::CrcMismatch)), epoch protocol violations
/// ([`InvalidEpoch`](OsilError::InvalidEpoch),
/// [`AcceptChunkOutOfOrder`](OsilError::AcceptChunkOutOfOrder)) and lookup
/// invariant breaks ([`SegmentNotFound`](OsilError::SegmentNotFound),
/// [`EpochRegression`](OsilError::EpochRegression)) should crash the task and
/// let the supervisor decide.
/// [`OffsetOutOfRange`](OsilError::OffsetOutOfRange) and
/// [`InvalidLastOffsetEpoch`](OsilError::InvalidLastOffsetEpoch) are answers,
/// not failures: the caller asked for history that is not here, or must
/// truncate before resuming. [`MissingFile`](OsilError::MissingFile) means
/// retention won a race and the operation should be retried from a fresh
/// overview.
#[derive(Debug, Error)]
pub enum OsilError {
    #[error("offset out of range; the log covers {range:?}")]
    OffsetOutOfRange { range: Option<(u64, u64)> },

    #[error("follower claims epoch {expected} for its last chunk, log has {found}")]
    InvalidLastOffsetEpoch { expected: u64, found: u64 },

    #[error("log on disk reached epoch {found}, past the configured epoch {configured}")]
    InvalidEpoch { found: u64, configured: u64 },

    #[error("accepted chunk carries offset {got}, expected {expected}")]
    AcceptChunkOutOfOrder { got: u64, expected: u64 },

    #[error("invalid chunk header: {0}")]
    InvalidChunkHeader(String),

    #[error("chunk {chunk_id} CRC mismatch: header {saved:#010x}, calculated {calculated:#010x}")]
    CrcMismatch {
        chunk_id: u64,
        saved: u32,
        calculated: u32,
    },

    #[error("no segment holds offset {offset}")]
    SegmentNotFound { offset: u64 },

    #[error("a segment or index file vanished mid-operation")]
    MissingFile,

    #[error("chunk truncated: needed {expected} bytes, {available} available")]
    TruncatedChunk { expected: u64, available: u64 },

    #[error("epoch regressed from {prev} to {found} while walking the index")]
    EpochRegression { prev: u64, found: u64 },

    #[error("bad segment or index file header: {0}")]
    BadFileHeader(String),

    #[error("entry of {0} bytes exceeds the 31-bit size field")]
    EntryTooLarge(u64),

    #[error("a chunk holds at most 65535 entries, got {0}")]
    TooManyEntries(usize),

    #[error("tracking and writer ids fit in 255 bytes, got {0}")]
    IdTooLong(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] binrw::Error),
}

pub type OsilResult<T> = std::result::Result<T, OsilError>;

/// Millisecond wall clock. Chunk timestamps are informational, so a pre-epoch
/// clock degrades to zero instead of failing the append path.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
