//! Read OSIL logs.
//!
//! Two reader flavors share one shell. *Data readers* follow the log from a
//! chunk boundary and are unthrottled; replication uses them to stream raw
//! chunks. *Offset readers* serve consumers and are gated by the shared
//! committed-offset cell: a chunk is never handed out before the writer has
//! declared its first record durable.
//!
//! Readers hold their segment files read-only and tolerate retention deleting
//! them mid-read: a vanished next segment is simply end-of-stream until the
//! overview is rebuilt.

use std::fs::File;
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::chunk::{self, decode_header, Entries};
use crate::counters::SharedOffsets;
use crate::records::{ChunkHeader, ChunkType, FILE_HEADER_SIZE, HEADER_SIZE};
use crate::segment::{
    self, find_segment_for_offset, read_exact_or_eof, segment_file_name, SegmentInfo,
    SegmentSearch,
};
use crate::{OsilError, OsilResult};

/// Where an offset reader should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// The oldest offset still in the log.
    First,
    /// The chunk containing the newest offset.
    Last,
    /// The offset the writer will assign next; i.e. only new data.
    Next,
    /// Exactly this offset; out of range is an error.
    Abs(u64),
    /// This offset, clamped into the log's range.
    Offset(u64),
    /// The first chunk whose timestamp is at or past this many milliseconds
    /// since the UNIX epoch.
    Timestamp(i64),
}

#[derive(Debug)]
enum ReaderMode {
    Data,
    Offset { shared: Arc<SharedOffsets> },
}

/// A whole chunk as stored: header, entries and trailer.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub header: ChunkHeader,
    /// The complete on-disk chunk bytes, header included.
    pub bytes: Vec<u8>,
}

/// A chunk with its entry region retained for record iteration.
#[derive(Debug, Clone)]
pub struct ParsedChunk {
    pub header: ChunkHeader,
    data: Vec<u8>,
}

impl ParsedChunk {
    /// Iterate the entries with the offset each one starts at.
    pub fn records(&self) -> Entries<'_> {
        Entries::new(&self.header, &self.data)
    }
}

/// A follower of one log directory; see the module docs for the two modes.
#[derive(Debug)]
pub struct LogReader {
    dir: PathBuf,
    mode: ReaderMode,
    /// Current segment, if attached; an empty log has nothing to open yet.
    file: Option<(File, PathBuf)>,
    /// Byte position of the next chunk header in the current segment.
    position: u64,
    /// Chunk id the next read will deliver.
    next_offset: u64,
}

impl LogReader {
    /// Open a data reader at `start_offset`, validating the follower's last
    /// `(epoch, chunk_id)` against the local log.
    ///
    /// A `start_offset` below the log's first offset is silently forwarded to
    /// it (the follower will discard its stale tail). Starting past the next
    /// offset, or anywhere but zero on an empty log, is
    /// [`OsilError::OffsetOutOfRange`]. A `None` `prev_epoch_offset` is only
    /// valid together with `start_offset` zero; a follower resuming anywhere
    /// else must present the `(epoch, chunk_id)` it last replicated, or get
    /// [`OsilError::InvalidLastOffsetEpoch`].
    pub fn data(
        dir: impl Into<PathBuf>,
        start_offset: u64,
        prev_epoch_offset: Option<(u64, u64)>,
    ) -> OsilResult<LogReader> {
        let dir = dir.into();
        let segs = segment::segments(&dir)?;
        let range = segment::range(&segs);

        let start = match range {
            None => {
                if start_offset > 0 {
                    return Err(OsilError::OffsetOutOfRange { range: None });
                }
                start_offset
            }
            Some((first, last)) => {
                if start_offset > last + 1 {
                    return Err(OsilError::OffsetOutOfRange { range });
                }
                start_offset.max(first)
            }
        };

        match prev_epoch_offset {
            None => {
                // a follower with no history may only attach at the start of
                // history; anywhere else needs the epoch continuity check
                if start_offset != 0 {
                    let found = segs
                        .iter()
                        .rev()
                        .find_map(|s| s.last)
                        .map(|last| last.epoch)
                        .unwrap_or(0);
                    return Err(OsilError::InvalidLastOffsetEpoch { expected: 0, found });
                }
            }
            Some((prev_epoch, prev_off)) => {
                // Skip the check when retention already dropped that chunk;
                // the forwarded start position supersedes it.
                let reachable = range.map_or(false, |(first, _)| prev_off >= first);
                if reachable {
                    check_epoch_at(&segs, prev_epoch, prev_off)?;
                }
            }
        }

        let mut reader = LogReader {
            dir,
            mode: ReaderMode::Data,
            file: None,
            position: FILE_HEADER_SIZE,
            next_offset: start,
        };
        reader.position_at(&segs, start)?;
        Ok(reader)
    }

    /// Open a consumer-facing reader at the position named by `spec`, gated by
    /// the `shared` committed-offset cell.
    pub fn offset(
        dir: impl Into<PathBuf>,
        spec: OffsetSpec,
        shared: Arc<SharedOffsets>,
    ) -> OsilResult<LogReader> {
        let dir = dir.into();
        // a vanished segment is a retryable race, a missing log is not
        std::fs::metadata(&dir)?;
        loop {
            match Self::offset_attempt(&dir, spec, Arc::clone(&shared)) {
                Err(e) if is_missing_file(&e) => {
                    // retention deleted a segment mid-setup
                    debug!("offset reader init on {} raced retention, retrying", dir.display());
                }
                other => return other,
            }
        }
    }

    fn offset_attempt(
        dir: &Path,
        spec: OffsetSpec,
        shared: Arc<SharedOffsets>,
    ) -> OsilResult<LogReader> {
        let segs = segment::segments(dir)?;
        let range = segment::range(&segs);
        let tail_next = segs.last().map(|s| s.next_offset()).unwrap_or(0);

        let target = match spec {
            OffsetSpec::First => range.map(|(first, _)| first).unwrap_or(tail_next),
            OffsetSpec::Last => range.map(|(_, last)| last).unwrap_or(tail_next),
            OffsetSpec::Next => range.map(|(_, last)| last + 1).unwrap_or(tail_next),
            OffsetSpec::Abs(offset) => match range {
                Some((first, last)) if offset >= first && offset <= last + 1 => offset,
                Some(_) | None => return Err(OsilError::OffsetOutOfRange { range }),
            },
            OffsetSpec::Offset(offset) => match range {
                Some((first, last)) => offset.clamp(first, last + 1),
                None => tail_next,
            },
            OffsetSpec::Timestamp(ts) => chunk_for_timestamp(&segs, ts)?.unwrap_or(tail_next),
        };

        let mut reader = LogReader {
            dir: dir.to_owned(),
            mode: ReaderMode::Offset { shared },
            file: None,
            position: FILE_HEADER_SIZE,
            next_offset: target,
        };
        reader.position_at(&segs, target)?;
        Ok(reader)
    }

    /// Attach to the segment holding `offset` and seek to its chunk.
    fn position_at(&mut self, segs: &[SegmentInfo], offset: u64) -> OsilResult<()> {
        match find_segment_for_offset(offset, segs) {
            SegmentSearch::Found(seg) => {
                let (chunk_id, file_pos) =
                    segment::scan_index(&seg.index, &seg.segment, offset)?
                        .ok_or(OsilError::SegmentNotFound { offset })?;
                let file = File::open(&seg.segment)?;
                self.file = Some((file, seg.segment.clone()));
                self.position = file_pos as u64;
                self.next_offset = chunk_id;
            }
            SegmentSearch::EndOfLog(Some(seg)) => {
                let mut file = File::open(&seg.segment)?;
                self.position = match &seg.last {
                    Some(last) => {
                        let header = segment::read_header_at(&mut file, last.file_pos as u64)?;
                        last.file_pos as u64 + header.total_size()
                    }
                    None => FILE_HEADER_SIZE,
                };
                self.file = Some((file, seg.segment.clone()));
                self.next_offset = offset;
            }
            SegmentSearch::EndOfLog(None) => {
                // nothing on disk yet; reads will attach once a segment shows up
                self.file = None;
                self.position = FILE_HEADER_SIZE;
                self.next_offset = offset;
            }
            SegmentSearch::NotFound => {
                return Err(OsilError::SegmentNotFound { offset });
            }
        }
        Ok(())
    }

    /// True when an offset reader must hold back the chunk at `next_offset`.
    fn gated(&self) -> bool {
        match &self.mode {
            ReaderMode::Data => false,
            ReaderMode::Offset { shared } => shared
                .committed_offset()
                .map_or(true, |committed| committed < self.next_offset),
        }
    }

    fn is_offset_mode(&self) -> bool {
        matches!(self.mode, ReaderMode::Offset { .. })
    }

    /// Position at and parse the next chunk header without consuming it.
    ///
    /// Returns `None` at end of stream: gated, a partial chunk tail, or no
    /// successor segment yet. Crossing a segment boundary happens here: at a
    /// clean end-of-file the successor's name is derived from `next_offset`
    /// and opened if it exists.
    fn peek_header(&mut self) -> OsilResult<Option<ChunkHeader>> {
        if self.gated() {
            return Ok(None);
        }
        loop {
            let Some((file, path)) = self.file.as_mut() else {
                if !self.attach_next_segment()? {
                    return Ok(None);
                }
                continue;
            };

            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(self.position))?;
            let n = read_exact_or_eof(file, &mut buf)?;
            if n == HEADER_SIZE {
                return decode_header(&buf).map(Some);
            }
            if n > 0 {
                // a chunk is mid-append; leave the position on its header
                return Ok(None);
            }

            // clean chunk boundary: the next chunk can only be in the
            // successor segment, which is named by the offset it starts at
            let next_name = segment_file_name(self.next_offset);
            if path.file_name().map_or(false, |f| f == next_name.as_str()) {
                return Ok(None);
            }
            if !self.attach_next_segment()? {
                return Ok(None);
            }
        }
    }

    /// Try to open the segment that starts at `next_offset`. Missing file is
    /// not an error, just "nothing more yet".
    fn attach_next_segment(&mut self) -> OsilResult<bool> {
        let path = self.dir.join(segment_file_name(self.next_offset));
        match File::open(&path) {
            Ok(file) => {
                debug!("reader crossing into {}", path.display());
                self.file = Some((file, path));
                self.position = FILE_HEADER_SIZE;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn advance_past(&mut self, header: &ChunkHeader) {
        self.position += header.total_size();
        self.next_offset = header.next_offset();
    }

    /// Parse and consume the next chunk header, skipping its payload.
    ///
    /// `None` is end of stream: no more committed chunks right now.
    pub fn read_header(&mut self) -> OsilResult<Option<ChunkHeader>> {
        let Some(header) = self.peek_header()? else {
            return Ok(None);
        };
        self.advance_past(&header);
        Ok(Some(header))
    }

    /// Read the next chunk whole (header, entries, trailer), validating its
    /// CRC.
    pub fn read_chunk(&mut self) -> OsilResult<Option<RawChunk>> {
        let Some(header) = self.peek_header()? else {
            return Ok(None);
        };
        let mut bytes = vec![0u8; header.total_size() as usize];
        let (file, _) = self.file.as_mut().expect("peek_header attached a segment");
        file.seek(SeekFrom::Start(self.position))?;
        let n = read_exact_or_eof(file, &mut bytes)?;
        if n < bytes.len() {
            // chunk is still being appended
            return Ok(None);
        }
        chunk::check_crc(
            &header,
            &bytes[HEADER_SIZE..HEADER_SIZE + header.data_len as usize],
        )?;
        self.advance_past(&header);
        Ok(Some(RawChunk { header, bytes }))
    }

    /// Read the next chunk and keep its entry region for record iteration.
    ///
    /// Offset readers skip non-user chunks transparently; data readers get
    /// tracking and snapshot chunks too, with their bodies parsed the same
    /// way.
    pub fn read_chunk_parsed(&mut self) -> OsilResult<Option<ParsedChunk>> {
        loop {
            let Some(raw) = self.read_chunk()? else {
                return Ok(None);
            };
            if self.is_offset_mode() && raw.header.chunk_type != ChunkType::User {
                continue;
            }
            let data = raw.bytes
                [HEADER_SIZE..HEADER_SIZE + raw.header.data_len as usize]
                .to_vec();
            return Ok(Some(ParsedChunk {
                header: raw.header,
                data,
            }));
        }
    }

    /// Stream the next available chunk into `sock` with the host's zero-copy
    /// file-to-socket primitive, calling `on_chunk` once it is fully sent.
    ///
    /// Data readers send chunks whole; offset readers send `header + data`
    /// only (trailers are not client-visible) and skip non-user chunks.
    /// Returns the bytes transferred, or `None` at end of stream.
    pub fn send_file<S, F>(&mut self, sock: &mut S, mut on_chunk: F) -> OsilResult<Option<u64>>
    where
        S: Write + AsRawFd,
        F: FnMut(&ChunkHeader),
    {
        loop {
            let Some(header) = self.peek_header()? else {
                return Ok(None);
            };
            if self.is_offset_mode() && header.chunk_type != ChunkType::User {
                self.advance_past(&header);
                continue;
            }

            let to_send = if self.is_offset_mode() {
                HEADER_SIZE as u64 + header.data_len as u64
            } else {
                header.total_size()
            };

            let (file, _) = self.file.as_ref().expect("peek_header attached a segment");
            let mut offset = self.position;
            let mut remaining = to_send;
            while remaining > 0 {
                // the primitive may report zero on a would-block socket;
                // retrying is the whole backpressure story here
                let sent = raw_send(file, sock, offset, remaining)?;
                offset += sent;
                remaining -= sent;
            }

            // the zero-copy call never moves our cursor; skip the whole
            // chunk, unsent trailer included
            self.advance_past(&header);
            on_chunk(&header);
            return Ok(Some(to_send));
        }
    }

    /// The highest committed offset visible to this reader, if any.
    pub fn committed_offset(&self) -> Option<u64> {
        match &self.mode {
            ReaderMode::Data => None,
            ReaderMode::Offset { shared } => shared.committed_offset(),
        }
    }

    /// Offset of the next chunk this reader will deliver.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn close(self) {}
}

/// Confirm the chunk at `chunk_id` carries `epoch`; the follower's view of
/// history must match ours before it may resume.
fn check_epoch_at(segs: &[SegmentInfo], epoch: u64, chunk_id: u64) -> OsilResult<()> {
    let SegmentSearch::Found(seg) = find_segment_for_offset(chunk_id, segs) else {
        return Err(OsilError::SegmentNotFound { offset: chunk_id });
    };
    let (found_id, file_pos) = segment::scan_index(&seg.index, &seg.segment, chunk_id)?
        .ok_or(OsilError::SegmentNotFound { offset: chunk_id })?;
    let mut file = File::open(&seg.segment)?;
    let header = segment::read_header_at(&mut file, file_pos as u64)?;
    if found_id != chunk_id || header.epoch != epoch {
        return Err(OsilError::InvalidLastOffsetEpoch {
            expected: epoch,
            found: header.epoch,
        });
    }
    Ok(())
}

/// Resolve a timestamp spec to a chunk id: the first chunk at or past `ts`,
/// `None` when everything is older (read only what comes next).
fn chunk_for_timestamp(segs: &[SegmentInfo], ts: i64) -> OsilResult<Option<u64>> {
    for seg in segs {
        let (Some(first), Some(last)) = (&seg.first, &seg.last) else {
            continue;
        };
        if last.timestamp < ts {
            continue;
        }
        if first.timestamp >= ts {
            return Ok(Some(first.chunk_id));
        }
        return segment::chunk_id_for_timestamp(seg, ts);
    }
    Ok(None)
}

fn is_missing_file(err: &OsilError) -> bool {
    match err {
        OsilError::MissingFile => true,
        OsilError::Io(e) => e.kind() == ErrorKind::NotFound,
        _ => false,
    }
}

/// One zero-copy transfer attempt; returns bytes moved, zero meaning "try
/// again".
#[cfg(target_os = "linux")]
fn raw_send<S: AsRawFd>(file: &File, sock: &S, offset: u64, len: u64) -> OsilResult<u64> {
    let mut off = offset as libc::off_t;
    let n = unsafe {
        libc::sendfile(
            sock.as_raw_fd(),
            file.as_raw_fd(),
            &mut off,
            len.min(usize::MAX as u64) as usize,
        )
    };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        return match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(0),
            _ => Err(err.into()),
        };
    }
    Ok(n as u64)
}

/// Userspace fallback for hosts without a file-to-socket primitive.
#[cfg(not(target_os = "linux"))]
fn raw_send<S: Write>(file: &File, sock: &mut S, offset: u64, len: u64) -> OsilResult<u64> {
    use std::os::unix::fs::FileExt;

    let mut buf = vec![0u8; len.min(64 * 1024) as usize];
    let n = file.read_at(&mut buf, offset)?;
    sock.write_all(&buf[..n])?;
    Ok(n as u64)
}
