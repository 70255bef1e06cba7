//! Write OSIL logs: the single-writer append path and the replication
//! acceptor.
//!
//! A [`Writer`] owns the active segment/index pair for one log directory and
//! is the only task that mutates it. Writers append freshly-encoded chunks;
//! acceptors append pre-formed chunks received from a leader and run the
//! epoch-divergence truncation protocol before opening. Both roll to a new
//! segment once the active one crosses the size threshold: the chunk that
//! crossed the line stays in the old segment, and the new segment opens
//! lazily on the next append, headed by a tracking-snapshot/writer-snapshot
//! pair so recovery never needs to look further back than one segment.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use binrw::BinWriterExt;
use log::{debug, info, warn};

use crate::chunk::{
    self, encode_chunk, encode_tracking_body, encode_writer_body, Entries,
};
use crate::counters::{LogCounters, SharedOffsets};
use crate::records::{
    ChunkHeader, ChunkType, Entry, IndexRecord, TrackingKind, TrackingMap, WriterEntry, WriterMap,
    WriterSeqs, FILE_HEADER_SIZE, HEADER_SIZE,
};
use crate::retention::{self, RetentionSpec};
use crate::segment::{self, IndexRecords, SegmentInfo};
use crate::{now_ms, OsilError, OsilResult};

/// Default segment rollover threshold: 500 MB.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 500 * 1000 * 1000;

/// Default bound on the writer-dedup map.
pub const DEFAULT_MAX_WRITERS: usize = 255;

/// Configuration for opening a log, writer or acceptor.
///
/// ```no_run
/// # fn run() -> osil::OsilResult<()> {
/// let mut writer = osil::LogOptions::new()
///     .epoch(1)
///     .max_segment_size(64 * 1024 * 1024)
///     .open("/var/lib/streams/orders")?;
/// writer.write(&[osil::Entry::Record(b"hello")])?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LogOptions {
    epoch: u64,
    max_segment_size: u64,
    retention: Vec<RetentionSpec>,
    max_writers: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            epoch: 0,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            retention: Vec::new(),
            max_writers: DEFAULT_MAX_WRITERS,
        }
    }
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The leader term this writer claims. The log on disk must not have
    /// advanced past it.
    pub fn epoch(self, epoch: u64) -> Self {
        Self { epoch, ..self }
    }

    /// Segment rollover threshold in bytes.
    pub fn max_segment_size(self, max_segment_size: u64) -> Self {
        Self {
            max_segment_size,
            ..self
        }
    }

    /// Retention policies evaluated at every rollover, in order.
    pub fn retention(self, retention: Vec<RetentionSpec>) -> Self {
        Self { retention, ..self }
    }

    /// Bound on the writer-dedup map; the oldest writers by timestamp are
    /// evicted at rollover.
    pub fn max_writers(self, max_writers: usize) -> Self {
        Self {
            max_writers,
            ..self
        }
    }

    /// Open (creating if needed) the log at `dir` for writing.
    pub fn open(self, dir: impl Into<PathBuf>) -> OsilResult<Writer> {
        Writer::init(dir.into(), WriterKind::Writer, self)
    }

    /// Open the log at `dir` as a replication acceptor, first truncating any
    /// divergent tail against the leader's `(epoch, last_offset)` list.
    pub fn open_acceptor(
        self,
        dir: impl Into<PathBuf>,
        leader_epoch_offsets: &[(u64, u64)],
    ) -> OsilResult<Writer> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        truncate_to(&dir, leader_epoch_offsets)?;
        Writer::init(dir, WriterKind::Acceptor, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterKind {
    Writer,
    Acceptor,
}

/// The owning handle for one log's append path.
#[derive(Debug)]
pub struct Writer {
    dir: PathBuf,
    kind: WriterKind,
    options: LogOptions,
    /// Active segment and index; `None` between a size-triggered close and
    /// the next append.
    files: Option<(File, File)>,
    /// Byte size of the active segment.
    position: u64,
    epoch: u64,
    next_offset: u64,
    /// `(epoch, chunk_id)` of the last chunk in the log.
    last_epoch_offset: Option<(u64, u64)>,
    tracking: TrackingMap,
    writers: WriterMap,
    shared: Arc<SharedOffsets>,
    counters: Arc<LogCounters>,
}

impl Writer {
    fn init(dir: PathBuf, kind: WriterKind, options: LogOptions) -> OsilResult<Writer> {
        fs::create_dir_all(&dir)?;
        let segs = segment::segments(&dir)?;

        let shared = Arc::new(SharedOffsets::new());
        let counters = Arc::new(LogCounters::default());

        let mut writer = Writer {
            dir,
            kind,
            epoch: options.epoch,
            options,
            files: None,
            position: FILE_HEADER_SIZE,
            next_offset: 0,
            last_epoch_offset: None,
            tracking: TrackingMap::new(),
            writers: WriterMap::new(),
            shared,
            counters,
        };

        let last_chunk = segs.iter().rev().find_map(|s| s.last);
        match (segs.last(), last_chunk) {
            (None, _) => {
                // empty directory: fresh first segment at offset zero
                let files = segment::create_pair(&writer.dir, 0)?;
                writer.files = Some(files);
            }
            (Some(tail), Some(last)) => {
                if last.epoch > writer.options.epoch {
                    return Err(OsilError::InvalidEpoch {
                        found: last.epoch,
                        configured: writer.options.epoch,
                    });
                }
                writer.next_offset = last.next_offset();
                writer.last_epoch_offset = Some((last.epoch, last.chunk_id));

                let recover_from = segs
                    .iter()
                    .rev()
                    .find(|s| s.last.is_some())
                    .expect("a chunk exists, so some segment holds it");
                writer.recover_state(recover_from)?;

                let files = segment::open_pair_for_append(tail)?;
                writer.position = files.0.metadata()?.len();
                writer.files = Some(files);
            }
            (Some(tail), None) => {
                // all segments are header-only; resume at the tail's offset
                writer.next_offset = tail.base_offset;
                let files = segment::open_pair_for_append(tail)?;
                writer.position = files.0.metadata()?.len();
                writer.files = Some(files);
            }
        }

        if let Some((first, _)) = segment::range(&segs) {
            writer.shared.set_first_offset(first);
        }
        writer.counters.set_offset(writer.next_offset);
        writer.counters.set_first_offset(writer.shared.first_offset());
        debug!(
            "opened log {} as {:?} at offset {}",
            writer.dir.display(),
            writer.kind,
            writer.next_offset
        );
        Ok(writer)
    }

    /// Append one chunk of user entries, stamped with the current wall clock.
    /// Returns the chunk's id.
    pub fn write(&mut self, entries: &[Entry<'_>]) -> OsilResult<u64> {
        self.write_with_writers(entries, &WriterSeqs::new(), now_ms())
    }

    /// Append one chunk of user entries with writer-dedup contributions.
    ///
    /// If `writers` is non-empty and every `(writer, sequence)` pair is at or
    /// below the recorded last sequence, the whole write is a duplicate and is
    /// elided; the current `next_offset` is returned unchanged.
    pub fn write_with_writers(
        &mut self,
        entries: &[Entry<'_>],
        writers: &WriterSeqs,
        timestamp: i64,
    ) -> OsilResult<u64> {
        if !writers.is_empty()
            && writers.iter().all(|(id, (_, seq))| {
                self.writers
                    .get(id)
                    .map_or(false, |known| *seq <= known.sequence)
            })
        {
            debug!(
                "eliding duplicate write of {} entries at offset {}",
                entries.len(),
                self.next_offset
            );
            return Ok(self.next_offset);
        }

        // open the successor segment before taking the chunk id: its
        // snapshot pair advances next_offset
        self.ensure_segment()?;
        let chunk_id = self.next_offset;
        let chunk = encode_chunk(
            entries,
            writers,
            ChunkType::User,
            timestamp,
            self.epoch,
            chunk_id,
        )?;
        self.append_encoded(
            &chunk.bytes,
            chunk_id,
            timestamp,
            self.epoch,
            chunk.num_records,
            true,
        )?;
        for (id, (ts, seq)) in writers {
            self.writers.insert(
                id.clone(),
                WriterEntry {
                    chunk_id,
                    timestamp: *ts,
                    sequence: *seq,
                },
            );
        }
        Ok(chunk_id)
    }

    /// Record a tracking update. Deltas merge into the in-memory map and land
    /// as a `TrackingDelta` chunk (an empty delta is a no-op); snapshots
    /// replace the map and land as a `TrackingSnapshot` chunk. Returns the
    /// next offset.
    pub fn write_tracking(&mut self, map: &TrackingMap, kind: TrackingKind) -> OsilResult<u64> {
        match kind {
            TrackingKind::Delta => {
                if map.is_empty() {
                    return Ok(self.next_offset);
                }
                for (id, offset) in map {
                    self.tracking.insert(id.clone(), *offset);
                }
                self.append_tracking_chunk(
                    ChunkType::TrackingDelta,
                    encode_tracking_body(map)?,
                    true,
                )?;
            }
            TrackingKind::Snapshot => {
                self.tracking = map.clone();
                self.append_tracking_chunk(
                    ChunkType::TrackingSnapshot,
                    encode_tracking_body(map)?,
                    true,
                )?;
            }
        }
        Ok(self.next_offset)
    }

    /// Append a pre-formed chunk received from the leader, verbatim.
    ///
    /// The chunk must land exactly at `next_offset`; replication delivers in
    /// the order the leader wrote. The data region is CRC-checked, but the
    /// trailer is not parsed: writer-dedup state travels via the writer
    /// snapshots the leader emits at rollover.
    pub fn accept_chunk(&mut self, bytes: &[u8]) -> OsilResult<u64> {
        if bytes.len() < HEADER_SIZE {
            return Err(OsilError::TruncatedChunk {
                expected: HEADER_SIZE as u64,
                available: bytes.len() as u64,
            });
        }
        let header = chunk::decode_header(&bytes[..HEADER_SIZE])?;
        if header.chunk_id != self.next_offset {
            return Err(OsilError::AcceptChunkOutOfOrder {
                got: header.chunk_id,
                expected: self.next_offset,
            });
        }
        let total = header.total_size() as usize;
        if bytes.len() < total {
            return Err(OsilError::TruncatedChunk {
                expected: total as u64,
                available: bytes.len() as u64,
            });
        }
        chunk::check_crc(
            &header,
            &bytes[HEADER_SIZE..HEADER_SIZE + header.data_len as usize],
        )?;

        self.ensure_segment()?;
        self.epoch = header.epoch;
        self.append_encoded(
            &bytes[..total],
            header.chunk_id,
            header.timestamp,
            header.epoch,
            header.num_records,
            true,
        )?;
        Ok(header.next_offset())
    }

    fn append_tracking_chunk(
        &mut self,
        chunk_type: ChunkType,
        body: Vec<u8>,
        may_roll: bool,
    ) -> OsilResult<()> {
        self.ensure_segment()?;
        let chunk_id = self.next_offset;
        let timestamp = now_ms();
        let chunk = encode_chunk(
            &[Entry::Record(&body)],
            &WriterSeqs::new(),
            chunk_type,
            timestamp,
            self.epoch,
            chunk_id,
        )?;
        self.append_encoded(
            &chunk.bytes,
            chunk_id,
            timestamp,
            self.epoch,
            chunk.num_records,
            may_roll,
        )
    }

    /// The shared append tail: write the encoded chunk, index it, advance the
    /// offset, and close the segment if it crossed the size threshold. The
    /// close is deferred-open: the next append runs `ensure_segment` before
    /// assigning its chunk id, since opening the successor emits the snapshot
    /// pair and moves `next_offset`. That pair itself passes
    /// `may_roll = false`; it must land in the segment being opened.
    fn append_encoded(
        &mut self,
        bytes: &[u8],
        chunk_id: u64,
        timestamp: i64,
        epoch: u64,
        num_records: u32,
        may_roll: bool,
    ) -> OsilResult<()> {
        let file_pos = self.position as u32;
        let (seg, idx) = self.files.as_mut().expect("the write path opened the pair");
        seg.write_all(bytes)?;
        idx.write_be(&IndexRecord {
            chunk_id,
            timestamp,
            epoch,
            file_pos,
        })?;

        self.position += bytes.len() as u64;
        self.next_offset = chunk_id + num_records as u64;
        self.last_epoch_offset = Some((epoch, chunk_id));
        self.counters.set_offset(self.next_offset);
        self.counters.incr_chunks();

        if may_roll && self.position >= self.options.max_segment_size {
            debug!(
                "segment for {} reached {} bytes, rolling",
                self.dir.display(),
                self.position
            );
            self.close_segment()?;
        }
        Ok(())
    }

    /// Open the successor segment if the previous append closed the old one.
    fn ensure_segment(&mut self) -> OsilResult<()> {
        if self.files.is_some() {
            return Ok(());
        }
        let base = self.next_offset;
        info!("opening segment {} in {}", base, self.dir.display());
        let files = segment::create_pair(&self.dir, base)?;
        self.position = FILE_HEADER_SIZE;
        self.files = Some(files);

        let first = self.shared.first_offset();
        self.tracking.retain(|_, offset| *offset >= first);
        while self.writers.len() > self.options.max_writers {
            let oldest = self
                .writers
                .iter()
                .min_by_key(|(_, w)| w.timestamp)
                .map(|(id, _)| id.clone())
                .expect("map is non-empty");
            self.writers.remove(&oldest);
        }

        // Snapshot pair first, so this segment alone can rebuild state.
        // Acceptors skip it: they receive the leader's snapshot chunks in
        // the replicated stream itself.
        if self.kind == WriterKind::Writer && self.next_offset > 0 {
            let tracking = encode_tracking_body(&self.tracking)?;
            self.append_tracking_chunk(ChunkType::TrackingSnapshot, tracking, false)?;
            let writers = encode_writer_body(&self.writers)?;
            self.append_tracking_chunk(ChunkType::WriterSnapshot, writers, false)?;
        }

        if !self.options.retention.is_empty() {
            if let Some((new_first, _)) = retention::evaluate(&self.dir, &self.options.retention)? {
                self.shared.set_first_offset(new_first);
                self.counters.set_first_offset(self.shared.first_offset());
            }
        }
        Ok(())
    }

    fn close_segment(&mut self) -> OsilResult<()> {
        if let Some((seg, idx)) = self.files.take() {
            idx.sync_data()?;
            seg.sync_data()?;
        }
        Ok(())
    }

    /// Rebuild tracking and writer-dedup state from the most recent segment
    /// holding chunks. Rollover puts a snapshot pair at the head of every
    /// segment, so one segment is all recovery ever needs.
    fn recover_state(&mut self, seg_info: &SegmentInfo) -> OsilResult<()> {
        let mut file = File::open(&seg_info.segment)?;
        let len = file.metadata()?.len();
        let mut pos = FILE_HEADER_SIZE;

        while pos + HEADER_SIZE as u64 <= len {
            let header = segment::read_header_at(&mut file, pos)?;
            if pos + header.total_size() > len {
                // partial tail; open_pair_for_append will cut it
                break;
            }
            match header.chunk_type {
                ChunkType::TrackingDelta => {
                    let body = read_tracking_entry(&mut file, &header)?;
                    for (id, offset) in chunk::parse_tracking_body(&body)? {
                        self.tracking.insert(id, offset);
                    }
                }
                ChunkType::TrackingSnapshot => {
                    let body = read_tracking_entry(&mut file, &header)?;
                    self.tracking = chunk::parse_tracking_body(&body)?;
                }
                ChunkType::WriterSnapshot => {
                    let body = read_tracking_entry(&mut file, &header)?;
                    self.writers = chunk::parse_writer_body(&body, header.chunk_id)?;
                }
                ChunkType::User => {
                    if header.trailer_len > 0 {
                        let trailer_pos = pos + HEADER_SIZE as u64 + header.data_len as u64;
                        let mut trailer = vec![0u8; header.trailer_len as usize];
                        read_at(&mut file, trailer_pos, &mut trailer)?;
                        for (id, ts, seq) in chunk::parse_trailer(&trailer)? {
                            self.writers.insert(
                                id,
                                WriterEntry {
                                    chunk_id: header.chunk_id,
                                    timestamp: ts,
                                    sequence: seq,
                                },
                            );
                        }
                    }
                }
            }
            pos += header.total_size();
        }
        debug!(
            "recovered {} tracking ids and {} writers from {}",
            self.tracking.len(),
            self.writers.len(),
            seg_info.segment.display()
        );
        Ok(())
    }

    /// The offset the next chunk will take.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// `(next_offset, last (epoch, chunk_id))`: what a successor writer or a
    /// follower needs to resume.
    pub fn tail_info(&self) -> (u64, Option<(u64, u64)>) {
        (self.next_offset, self.last_epoch_offset)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn tracking(&self) -> &TrackingMap {
        &self.tracking
    }

    pub fn writers(&self) -> &WriterMap {
        &self.writers
    }

    /// The committed/first offset cells shared with readers and retention.
    pub fn shared(&self) -> Arc<SharedOffsets> {
        Arc::clone(&self.shared)
    }

    pub fn counters(&self) -> Arc<LogCounters> {
        Arc::clone(&self.counters)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Sync and close the active segment pair.
    pub fn close(mut self) -> OsilResult<()> {
        self.close_segment()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.close_segment() {
            warn!("closing log {} failed: {e}", self.dir.display());
        }
    }
}

/// Tracking chunks wrap their body in a single simple entry; pull it back out.
fn read_tracking_entry(file: &mut File, header: &ChunkHeader) -> OsilResult<Vec<u8>> {
    let mut data = vec![0u8; header.data_len as usize];
    // the cursor sits right past the header after read_header_at
    read_current(file, &mut data)?;
    match Entries::new(header, &data).next() {
        Some(entry) => Ok(entry?.1.bytes().to_vec()),
        None => Ok(Vec::new()),
    }
}

fn read_current(file: &mut File, buf: &mut [u8]) -> OsilResult<()> {
    use std::io::Read as _;
    file.read_exact(buf)?;
    Ok(())
}

fn read_at(file: &mut File, pos: u64, buf: &mut [u8]) -> OsilResult<()> {
    use std::io::{Read as _, Seek as _, SeekFrom};
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(buf)?;
    Ok(())
}

/// The acceptor-side truncation protocol: find the highest leader
/// `(epoch, last_offset)` pair that exists locally and cut everything above
/// it; with no common point the whole local log is divergent and deleted.
fn truncate_to(dir: &Path, epoch_offsets: &[(u64, u64)]) -> OsilResult<()> {
    let segs = segment::segments(dir)?;
    if segs.is_empty() {
        return Ok(());
    }

    let mut pairs = epoch_offsets.to_vec();
    pairs.sort_by(|a, b| b.cmp(a));
    for (epoch, last_offset) in pairs {
        if let Some(seg) = find_exact_chunk(&segs, epoch, last_offset)? {
            info!(
                "truncating {} after chunk {} (epoch {})",
                dir.display(),
                last_offset,
                epoch
            );
            segment::truncate_after(seg, last_offset)?;
            for s in &segs {
                if s.base_offset > last_offset {
                    segment::delete_pair(s)?;
                }
            }
            return Ok(());
        }
    }

    warn!(
        "log {} shares no epoch-offset with the leader, deleting it",
        dir.display()
    );
    for s in &segs {
        segment::delete_pair(s)?;
    }
    Ok(())
}

/// Look for a chunk with exactly this `(epoch, chunk_id)` and return its
/// segment.
fn find_exact_chunk<'a>(
    segs: &'a [SegmentInfo],
    epoch: u64,
    chunk_id: u64,
) -> OsilResult<Option<&'a SegmentInfo>> {
    for seg in segs {
        let (Some(first), Some(last)) = (&seg.first, &seg.last) else {
            continue;
        };
        if chunk_id < first.chunk_id || chunk_id > last.chunk_id {
            continue;
        }
        let mut records = IndexRecords::open(&seg.index)?;
        while let Some(record) = records.next_record()? {
            if record.chunk_id == chunk_id {
                return Ok((record.epoch == epoch).then_some(seg));
            }
        }
    }
    Ok(None)
}
