//! On-disk record layouts for OSIL segment and index files.
//!
//! A log is a directory of paired `<first-offset>.segment` / `<first-offset>.index`
//! files. Segment files are a fixed 8-byte file header followed by chunks; index
//! files are the same 8-byte shape followed by dense 28-byte index records, one
//! per chunk. All integers are big-endian.

use std::collections::BTreeMap;

use binrw::*;

use crate::OsilError;

/// Magic bytes opening every segment file.
pub const SEG_MAGIC: &[u8; 4] = b"OSIL";
/// Magic bytes opening every index file.
pub const IDX_MAGIC: &[u8; 4] = b"OSII";
/// On-disk format version, shared by segment and index files.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the segment/index file header: magic plus a `u32` version.
pub const FILE_HEADER_SIZE: u64 = 8;

/// Size of a chunk header on disk.
///
/// The defined fields occupy 44 bytes; the remaining 12 are reserved, written
/// as zero and ignored on read.
pub const HEADER_SIZE: usize = 56;

/// First byte of every chunk header: magic nibble `0x5`, version nibble `0x1`.
pub const HEADER_TAG: u8 = 0x51;

/// Size of one index record on disk.
pub const INDEX_RECORD_SIZE: usize = 28;

/// Raw sub-batch compression designators.
///
/// The engine carries these opaquely; producers and consumers agree on the
/// codec out of band.
pub mod compression {
    pub const NONE: u8 = 0;
    pub const GZIP: u8 = 1;
    pub const SNAPPY: u8 = 2;
    pub const LZ4: u8 = 3;
    pub const ZSTD: u8 = 4;
}

/// The kind of payload a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Application records.
    User = 0,
    /// Incremental update to the offset-tracking map.
    TrackingDelta = 1,
    /// Full replacement of the offset-tracking map.
    TrackingSnapshot = 2,
    /// Full replacement of the writer-dedup map.
    WriterSnapshot = 3,
}

impl TryFrom<u8> for ChunkType {
    type Error = OsilError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChunkType::User),
            1 => Ok(ChunkType::TrackingDelta),
            2 => Ok(ChunkType::TrackingSnapshot),
            3 => Ok(ChunkType::WriterSnapshot),
            other => Err(OsilError::InvalidChunkHeader(format!(
                "unknown chunk type {other}"
            ))),
        }
    }
}

/// The fixed header opening every chunk.
///
/// The CRC covers the entry region only, i.e. the `data_len` bytes that follow
/// the header; the trailer is excluded.
#[binrw]
#[brw(big, magic = 0x51u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    #[br(try_map = |x: u8| ChunkType::try_from(x))]
    #[bw(map = |t| *t as u8)]
    pub chunk_type: ChunkType,
    pub num_entries: u16,
    pub num_records: u32,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub epoch: u64,
    /// Offset of the first record in the chunk; the chunk's id.
    pub chunk_id: u64,
    pub crc: u32,
    pub data_len: u32,
    #[brw(pad_after = 12)]
    pub trailer_len: u32,
}

impl ChunkHeader {
    /// Offset of the first record past this chunk.
    pub fn next_offset(&self) -> u64 {
        self.chunk_id + self.num_records as u64
    }

    /// Bytes the whole chunk occupies on disk, header included.
    pub fn total_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.data_len as u64 + self.trailer_len as u64
    }
}

/// One 28-byte index record; a dense array of these follows the index file
/// header, one per chunk in the paired segment.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub chunk_id: u64,
    pub timestamp: i64,
    pub epoch: u64,
    /// Position of the chunk header in the paired segment file.
    pub file_pos: u32,
}

/// The 8-byte header opening a segment file.
#[binrw]
#[brw(big, magic = b"OSIL")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFileHeader {
    pub version: u32,
}

/// The 8-byte header opening an index file.
#[binrw]
#[brw(big, magic = b"OSII")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFileHeader {
    pub version: u32,
}

/// One entry in a chunk's data region, borrowed from the caller (on write) or
/// from a chunk buffer (on parsed read).
///
/// The first byte's high bit discriminates: clear for a simple record (a
/// 31-bit size then the record bytes), set for a sub-batch (compression tag,
/// record count and size, then the pre-encoded batch bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    /// A single record.
    Record(&'a [u8]),
    /// An opaque pre-encoded group of records, optionally compressed by the
    /// producer.
    SubBatch {
        num_records: u16,
        compression: u8,
        bytes: &'a [u8],
    },
}

impl Entry<'_> {
    /// How many record offsets this entry consumes.
    pub fn num_records(&self) -> u32 {
        match self {
            Entry::Record(_) => 1,
            Entry::SubBatch { num_records, .. } => *num_records as u32,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Entry::Record(b) => b,
            Entry::SubBatch { bytes, .. } => bytes,
        }
    }
}

/// Offset-tracking map: tracking id to offset.
pub type TrackingMap = BTreeMap<Vec<u8>, u64>;

/// Writer-dedup state for one writer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterEntry {
    /// Id of the last chunk that carried this writer.
    pub chunk_id: u64,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub sequence: u64,
}

/// Writer-dedup map: writer id to its last committed `(chunk_id, ts, seq)`.
pub type WriterMap = BTreeMap<Vec<u8>, WriterEntry>;

/// Fresh writer contributions supplied with a single write: writer id to
/// `(timestamp, sequence)`. Recorded in the chunk trailer.
pub type WriterSeqs = BTreeMap<Vec<u8>, (u64, u64)>;

/// Whether a tracking write replaces the map or merges into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingKind {
    Delta,
    Snapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn chunk_header_round_trip() {
        let header = ChunkHeader {
            chunk_type: ChunkType::User,
            num_entries: 2,
            num_records: 7,
            timestamp: 1_700_000_000_123,
            epoch: 4,
            chunk_id: 99,
            crc: 0xdead_beef,
            data_len: 1024,
            trailer_len: 25,
        };

        let mut buf = Vec::new();
        Cursor::new(&mut buf).write_be(&header).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf[0], HEADER_TAG);
        // reserved region is zeroed
        assert!(buf[HEADER_SIZE - 12..].iter().all(|b| *b == 0));

        let parsed: ChunkHeader = Cursor::new(&buf).read_be().unwrap();
        assert_eq!(parsed, header);

        let mut again = Vec::new();
        Cursor::new(&mut again).write_be(&parsed).unwrap();
        assert_eq!(buf, again);
    }

    #[test]
    fn chunk_header_rejects_unknown_type() {
        let header = ChunkHeader {
            chunk_type: ChunkType::TrackingDelta,
            num_entries: 1,
            num_records: 1,
            timestamp: 0,
            epoch: 1,
            chunk_id: 0,
            crc: 0,
            data_len: 0,
            trailer_len: 0,
        };
        let mut buf = Vec::new();
        Cursor::new(&mut buf).write_be(&header).unwrap();
        buf[1] = 9;
        assert!(Cursor::new(&buf).read_be::<ChunkHeader>().is_err());
    }

    #[test]
    fn index_record_is_28_bytes() {
        let rec = IndexRecord {
            chunk_id: 3,
            timestamp: -1,
            epoch: 2,
            file_pos: 8,
        };
        let mut buf = Vec::new();
        Cursor::new(&mut buf).write_be(&rec).unwrap();
        assert_eq!(buf.len(), INDEX_RECORD_SIZE);

        let parsed: IndexRecord = Cursor::new(&buf).read_be().unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn file_headers() {
        let mut buf = Vec::new();
        Cursor::new(&mut buf)
            .write_be(&SegmentFileHeader {
                version: FORMAT_VERSION,
            })
            .unwrap();
        assert_eq!(&buf[..4], SEG_MAGIC);
        assert_eq!(buf.len() as u64, FILE_HEADER_SIZE);

        buf.clear();
        Cursor::new(&mut buf)
            .write_be(&IndexFileHeader {
                version: FORMAT_VERSION,
            })
            .unwrap();
        assert_eq!(&buf[..4], IDX_MAGIC);
        assert_eq!(buf.len() as u64, FILE_HEADER_SIZE);
    }
}
