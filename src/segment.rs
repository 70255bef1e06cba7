//! Segment and index files: naming, creation, truncation, and the directory
//! overview used to locate chunks by offset or timestamp.
//!
//! Segments are named by the offset of the first record they contain,
//! zero-padded to twenty digits so lexical order is offset order. Retention
//! deletes whole pairs while readers may still hold them open, so every scan
//! here treats a missing file as "the directory moved under us" and restarts.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use binrw::{BinReaderExt, BinWriterExt};
use log::{debug, warn};

use crate::chunk::decode_header;
use crate::records::{
    ChunkHeader, IndexFileHeader, IndexRecord, SegmentFileHeader, FILE_HEADER_SIZE, FORMAT_VERSION,
    HEADER_SIZE, IDX_MAGIC, INDEX_RECORD_SIZE, SEG_MAGIC,
};
use crate::{OsilError, OsilResult};

pub const SEGMENT_EXT: &str = "segment";
pub const INDEX_EXT: &str = "index";

/// `printf("%020d.segment", first_offset)`, bit-exact.
pub fn segment_file_name(first_offset: u64) -> String {
    format!("{first_offset:020}.{SEGMENT_EXT}")
}

pub fn index_file_name(first_offset: u64) -> String {
    format!("{first_offset:020}.{INDEX_EXT}")
}

/// Parse the first offset back out of a segment or index file name.
pub fn first_offset_from_path(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// What is known about one chunk from the index plus its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: u64,
    pub timestamp: i64,
    pub epoch: u64,
    pub num_records: u32,
    /// Position of the chunk header within the segment file.
    pub file_pos: u32,
}

impl ChunkInfo {
    pub fn next_offset(&self) -> u64 {
        self.chunk_id + self.num_records as u64
    }

    fn from_header(header: &ChunkHeader, file_pos: u32) -> Self {
        Self {
            chunk_id: header.chunk_id,
            timestamp: header.timestamp,
            epoch: header.epoch,
            num_records: header.num_records,
            file_pos,
        }
    }
}

/// One `.segment`/`.index` pair as seen by a directory scan.
///
/// `first` and `last` are `None` for a pair holding only file headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub segment: PathBuf,
    pub index: PathBuf,
    /// Segment file size in bytes.
    pub size: u64,
    /// Offset the pair is named by.
    pub base_offset: u64,
    pub first: Option<ChunkInfo>,
    pub last: Option<ChunkInfo>,
}

impl SegmentInfo {
    /// The offset the next chunk appended to this segment would take.
    pub fn next_offset(&self) -> u64 {
        self.last
            .as_ref()
            .map(|l| l.next_offset())
            .unwrap_or(self.base_offset)
    }
}

/// Outcome of locating the segment that holds a given offset.
#[derive(Debug)]
pub enum SegmentSearch<'a> {
    /// The offset lies inside this segment.
    Found(&'a SegmentInfo),
    /// The offset is the next offset to be written; for a log with no
    /// segments at offset zero the carried segment is `None`.
    EndOfLog(Option<&'a SegmentInfo>),
    NotFound,
}

/// Scan a log directory into ascending [`SegmentInfo`]s.
///
/// Retention may delete pairs while the scan runs; a vanished file restarts
/// the whole scan so the result is a consistent snapshot.
pub fn segments(dir: &Path) -> OsilResult<Vec<SegmentInfo>> {
    loop {
        match scan_once(dir)? {
            Some(segs) => return Ok(segs),
            None => {
                debug!("segment scan of {} raced a deletion, retrying", dir.display());
            }
        }
    }
}

/// One scan attempt; `None` means a file vanished mid-scan and the caller
/// should retry.
fn scan_once(dir: &Path) -> OsilResult<Option<Vec<SegmentInfo>>> {
    let mut index_paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == INDEX_EXT))
        .collect();
    index_paths.sort();

    let mut out = Vec::with_capacity(index_paths.len());
    for index in index_paths {
        let Some(base_offset) = first_offset_from_path(&index) else {
            warn!("ignoring stray index file {}", index.display());
            continue;
        };
        let segment = index.with_extension(SEGMENT_EXT);
        match read_segment_info(&segment, &index, base_offset) {
            Ok(info) => out.push(info),
            Err(OsilError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(out))
}

fn read_segment_info(segment: &Path, index: &Path, base_offset: u64) -> OsilResult<SegmentInfo> {
    let mut idx = File::open(index)?;
    check_index_header(&mut idx)?;
    let idx_len = idx.metadata()?.len();

    let mut seg = File::open(segment)?;
    check_segment_header(&mut seg)?;
    let size = seg.metadata()?.len();

    let num_records = index_record_count(idx_len);
    if num_records == 0 {
        return Ok(SegmentInfo {
            segment: segment.to_owned(),
            index: index.to_owned(),
            size,
            base_offset,
            first: None,
            last: None,
        });
    }

    // First chunk sits at the fixed position right past the file header; the
    // last is wherever the final complete index record points.
    let first_header = read_header_at(&mut seg, FILE_HEADER_SIZE)?;
    let first = ChunkInfo::from_header(&first_header, FILE_HEADER_SIZE as u32);

    idx.seek(SeekFrom::Start(
        FILE_HEADER_SIZE + (num_records - 1) * INDEX_RECORD_SIZE as u64,
    ))?;
    let last_record: IndexRecord = idx.read_be()?;
    let last_header = read_header_at(&mut seg, last_record.file_pos as u64)?;
    let last = ChunkInfo::from_header(&last_header, last_record.file_pos);

    Ok(SegmentInfo {
        segment: segment.to_owned(),
        index: index.to_owned(),
        size,
        base_offset,
        first: Some(first),
        last: Some(last),
    })
}

/// Number of complete index records a file of `len` bytes holds.
fn index_record_count(len: u64) -> u64 {
    len.saturating_sub(FILE_HEADER_SIZE) / INDEX_RECORD_SIZE as u64
}

/// Admin view of a log directory: its offset range plus the per-epoch last
/// chunk ids a leader hands to followers for truncation.
pub fn overview(dir: &Path) -> OsilResult<(Option<(u64, u64)>, Vec<(u64, u64)>)> {
    let segs = segments(dir)?;
    let range = range(&segs);
    let epoch_offsets = last_offset_epochs(&segs)?;
    Ok((range, epoch_offsets))
}

/// Inclusive offset range of the log, or `None` when empty.
pub fn range(segs: &[SegmentInfo]) -> Option<(u64, u64)> {
    let first = segs.iter().find_map(|s| s.first.as_ref())?;
    let last = segs.iter().rev().find_map(|s| s.last.as_ref())?;
    Some((first.chunk_id, last.next_offset() - 1))
}

/// Walk every index record and aggregate, per contiguous epoch, the highest
/// chunk id observed. Epochs are non-decreasing across a log; a regression is
/// an invariant violation.
pub fn last_offset_epochs(segs: &[SegmentInfo]) -> OsilResult<Vec<(u64, u64)>> {
    let mut out: Vec<(u64, u64)> = Vec::new();
    for seg in segs {
        let mut records = IndexRecords::open(&seg.index)?;
        while let Some(record) = records.next_record()? {
            match out.last_mut() {
                Some((epoch, last)) if *epoch == record.epoch => *last = record.chunk_id,
                Some((epoch, _)) if *epoch > record.epoch => {
                    return Err(OsilError::EpochRegression {
                        prev: *epoch,
                        found: record.epoch,
                    });
                }
                _ => out.push((record.epoch, record.chunk_id)),
            }
        }
    }
    Ok(out)
}

/// Locate the segment whose offset span contains `offset`.
pub fn find_segment_for_offset<'a>(offset: u64, segs: &'a [SegmentInfo]) -> SegmentSearch<'a> {
    for seg in segs {
        if let (Some(first), Some(last)) = (&seg.first, &seg.last) {
            if offset >= first.chunk_id && offset < last.next_offset() {
                return SegmentSearch::Found(seg);
            }
        }
    }
    match segs.last() {
        Some(seg) if offset == seg.next_offset() => SegmentSearch::EndOfLog(Some(seg)),
        None if offset == 0 => SegmentSearch::EndOfLog(None),
        _ => SegmentSearch::NotFound,
    }
}

/// Scan an index for the chunk containing `target`, returning its
/// `(chunk_id, file_pos)` or `None` when the target is past the last chunk.
///
/// Records are read pairwise so the span `[cur, next)` is known without
/// touching the segment; only the final record needs the segment header's
/// `num_records` to close the span.
pub fn scan_index(index: &Path, segment: &Path, target: u64) -> OsilResult<Option<(u64, u32)>> {
    let mut records = IndexRecords::open(index)?;
    let Some(mut cur) = records.next_record()? else {
        return Ok(None);
    };
    loop {
        match records.next_record()? {
            Some(next) => {
                if target < next.chunk_id {
                    return Ok(Some((cur.chunk_id, cur.file_pos)));
                }
                cur = next;
            }
            None => {
                let mut seg = File::open(segment)?;
                let header = read_header_at(&mut seg, cur.file_pos as u64)?;
                if target < header.next_offset() {
                    return Ok(Some((cur.chunk_id, cur.file_pos)));
                }
                return Ok(None);
            }
        }
    }
}

/// First chunk in the segment whose timestamp is at or past `ts`.
pub fn chunk_id_for_timestamp(seg: &SegmentInfo, ts: i64) -> OsilResult<Option<u64>> {
    let mut records = IndexRecords::open(&seg.index)?;
    while let Some(record) = records.next_record()? {
        if record.timestamp >= ts {
            return Ok(Some(record.chunk_id));
        }
    }
    Ok(None)
}

/// Sequential reader over an index file's records.
pub(crate) struct IndexRecords {
    reader: BufReader<File>,
}

impl IndexRecords {
    pub(crate) fn open(index: &Path) -> OsilResult<Self> {
        let mut file = File::open(index)?;
        check_index_header(&mut file)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// The next complete record; a partial tail reads as end-of-file.
    pub(crate) fn next_record(&mut self) -> OsilResult<Option<IndexRecord>> {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        match read_exact_or_eof(&mut self.reader, &mut buf)? {
            n if n < INDEX_RECORD_SIZE => Ok(None),
            _ => {
                let record: IndexRecord = std::io::Cursor::new(&buf).read_be()?;
                Ok(Some(record))
            }
        }
    }
}

/// Read up to `buf.len()` bytes, returning how many were actually read before
/// end-of-file.
pub(crate) fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> OsilResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Read and validate a chunk header at `pos` without moving past it logically.
pub(crate) fn read_header_at(file: &mut File, pos: u64) -> OsilResult<ChunkHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(&mut buf)?;
    decode_header(&buf)
}

fn check_segment_header(file: &mut File) -> OsilResult<()> {
    check_file_header(file, SEG_MAGIC)
}

fn check_index_header(file: &mut File) -> OsilResult<()> {
    check_file_header(file, IDX_MAGIC)
}

/// Validate the 8-byte magic-plus-version file header, leaving the cursor
/// just past it.
fn check_file_header(file: &mut File, magic: &[u8; 4]) -> OsilResult<()> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    let n = read_exact_or_eof(file, &mut buf)?;
    if n < buf.len() || &buf[..4] != magic {
        return Err(OsilError::BadFileHeader(format!("{:02x?}", &buf[..n])));
    }
    let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(OsilError::BadFileHeader(format!(
            "unsupported format version {version}"
        )));
    }
    Ok(())
}

/// Create a fresh `.segment`/`.index` pair named by `first_offset`, returning
/// the files positioned for appending.
pub(crate) fn create_pair(dir: &Path, first_offset: u64) -> OsilResult<(File, File)> {
    let seg_path = dir.join(segment_file_name(first_offset));
    let idx_path = dir.join(index_file_name(first_offset));

    let mut seg = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&seg_path)?;
    let mut idx = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&idx_path)?;

    if seg.metadata()?.len() == 0 {
        seg.write_be(&SegmentFileHeader {
            version: FORMAT_VERSION,
        })?;
    }
    if idx.metadata()?.len() == 0 {
        idx.write_be(&IndexFileHeader {
            version: FORMAT_VERSION,
        })?;
    }

    seg.seek(SeekFrom::End(0))?;
    idx.seek(SeekFrom::End(0))?;
    Ok((seg, idx))
}

/// Reopen an existing pair for appending, positioned at their ends.
pub(crate) fn open_pair_for_append(seg_info: &SegmentInfo) -> OsilResult<(File, File)> {
    let mut seg = OpenOptions::new().read(true).write(true).open(&seg_info.segment)?;
    check_segment_header(&mut seg)?;
    let mut idx = OpenOptions::new().read(true).write(true).open(&seg_info.index)?;
    check_index_header(&mut idx)?;

    // A partial chunk tail (a crash mid-append) is cut off; the index is
    // truncated to the records the segment actually holds.
    let valid = last_valid_positions(&mut seg)?;
    seg.set_len(valid.segment_len)?;
    idx.set_len(FILE_HEADER_SIZE + valid.chunks * INDEX_RECORD_SIZE as u64)?;

    seg.seek(SeekFrom::End(0))?;
    idx.seek(SeekFrom::End(0))?;
    Ok((seg, idx))
}

struct ValidTail {
    segment_len: u64,
    chunks: u64,
}

/// Walk the segment's chunks and find where the last complete one ends.
fn last_valid_positions(seg: &mut File) -> OsilResult<ValidTail> {
    let len = seg.metadata()?.len();
    let mut pos = FILE_HEADER_SIZE;
    let mut chunks = 0u64;
    while pos + HEADER_SIZE as u64 <= len {
        let header = read_header_at(seg, pos)?;
        let end = pos + header.total_size();
        if end > len {
            break;
        }
        pos = end;
        chunks += 1;
    }
    Ok(ValidTail {
        segment_len: pos,
        chunks,
    })
}

/// Cut the pair so that the chunk with `chunk_id` is the last one; the chunk
/// must exist in this segment.
pub(crate) fn truncate_after(seg_info: &SegmentInfo, chunk_id: u64) -> OsilResult<()> {
    let mut records = IndexRecords::open(&seg_info.index)?;
    let mut kept = 0u64;
    let mut cut: Option<IndexRecord> = None;
    while let Some(record) = records.next_record()? {
        kept += 1;
        if record.chunk_id == chunk_id {
            cut = Some(record);
            break;
        }
    }
    let record = cut.ok_or(OsilError::SegmentNotFound { offset: chunk_id })?;

    let mut seg = OpenOptions::new().read(true).write(true).open(&seg_info.segment)?;
    let header = read_header_at(&mut seg, record.file_pos as u64)?;
    seg.set_len(record.file_pos as u64 + header.total_size())?;
    seg.sync_data()?;

    let idx = OpenOptions::new().write(true).open(&seg_info.index)?;
    idx.set_len(FILE_HEADER_SIZE + kept * INDEX_RECORD_SIZE as u64)?;
    idx.sync_data()?;
    Ok(())
}

/// Delete a pair; missing files are fine, retention may have raced us.
pub(crate) fn delete_pair(seg_info: &SegmentInfo) -> OsilResult<()> {
    debug!("deleting segment {}", seg_info.segment.display());
    for path in [&seg_info.segment, &seg_info.index] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Remove a log directory and everything in it.
pub fn delete_directory(dir: &Path) -> OsilResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_twenty_digit_padded() {
        assert_eq!(segment_file_name(0), "00000000000000000000.segment");
        assert_eq!(segment_file_name(42), "00000000000000000042.segment");
        assert_eq!(index_file_name(42), "00000000000000000042.index");
        assert_eq!(
            segment_file_name(u64::MAX),
            "18446744073709551615.segment"
        );
    }

    #[test]
    fn first_offset_parses_back() {
        let p = PathBuf::from("/logs/s1/00000000000000000042.segment");
        assert_eq!(first_offset_from_path(&p), Some(42));
        let p = PathBuf::from("/logs/s1/garbage.segment");
        assert_eq!(first_offset_from_path(&p), None);
    }

    #[test]
    fn empty_scan_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(segments(dir.path()).unwrap().is_empty());
        assert_eq!(range(&[]), None);
        assert!(matches!(
            find_segment_for_offset(0, &[]),
            SegmentSearch::EndOfLog(None)
        ));
        assert!(matches!(
            find_segment_for_offset(1, &[]),
            SegmentSearch::NotFound
        ));
    }

    #[test]
    fn create_pair_writes_headers() {
        let dir = tempfile::tempdir().unwrap();
        let (seg, idx) = create_pair(dir.path(), 7).unwrap();
        drop((seg, idx));

        let seg_bytes = fs::read(dir.path().join(segment_file_name(7))).unwrap();
        assert_eq!(&seg_bytes[..4], SEG_MAGIC);
        let idx_bytes = fs::read(dir.path().join(index_file_name(7))).unwrap();
        assert_eq!(&idx_bytes[..4], IDX_MAGIC);

        let segs = segments(dir.path()).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].base_offset, 7);
        assert_eq!(segs[0].first, None);
        assert_eq!(segs[0].last, None);
        assert_eq!(segs[0].next_offset(), 7);
    }
}
