//! Chunk codec: encoding entries into the on-disk chunk byte sequence and
//! parsing the variable-length regions back out.
//!
//! The fixed 56-byte header is handled by the binrw structs in
//! [`records`](crate::records); everything past it (entries, the writer
//! trailer, tracking bodies) is hand-rolled because the layouts are
//! discriminated by packed bits rather than whole fields.

use std::io::Cursor;

use binrw::{BinReaderExt, BinWriterExt};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::hash as crc32;

use crate::records::{
    ChunkHeader, ChunkType, Entry, TrackingMap, WriterEntry, WriterMap, WriterSeqs, HEADER_SIZE,
    HEADER_TAG,
};
use crate::{OsilError, OsilResult};

/// Largest encodable simple record: the size field is 31 bits.
const MAX_RECORD_SIZE: u64 = (1 << 31) - 1;

/// A fully-encoded chunk ready to be appended to a segment.
pub struct EncodedChunk {
    /// Header, entries and trailer, in on-disk order.
    pub bytes: Vec<u8>,
    pub num_records: u32,
}

/// Encode a chunk from the supplied entries, in the order supplied.
///
/// `writers` contributes the dedup trailer and is only meaningful for
/// [`ChunkType::User`]; tracking and snapshot chunks pass an empty map.
pub fn encode_chunk(
    entries: &[Entry<'_>],
    writers: &WriterSeqs,
    chunk_type: ChunkType,
    timestamp: i64,
    epoch: u64,
    chunk_id: u64,
) -> OsilResult<EncodedChunk> {
    if entries.len() > u16::MAX as usize {
        return Err(OsilError::TooManyEntries(entries.len()));
    }

    let mut num_records: u32 = 0;
    let mut data = Vec::new();
    for entry in entries {
        num_records += entry.num_records();
        match entry {
            Entry::Record(bytes) => {
                if bytes.len() as u64 > MAX_RECORD_SIZE {
                    return Err(OsilError::EntryTooLarge(bytes.len() as u64));
                }
                data.write_u32::<BigEndian>(bytes.len() as u32)?;
                data.extend_from_slice(bytes);
            }
            Entry::SubBatch {
                num_records: batch_records,
                compression,
                bytes,
            } => {
                if bytes.len() > u32::MAX as usize {
                    return Err(OsilError::EntryTooLarge(bytes.len() as u64));
                }
                data.write_u8(0x80 | ((compression & 0x07) << 4))?;
                data.write_u16::<BigEndian>(*batch_records)?;
                data.write_u32::<BigEndian>(bytes.len() as u32)?;
                data.extend_from_slice(bytes);
            }
        }
    }

    let mut trailer = Vec::new();
    if chunk_type == ChunkType::User {
        for (id, (ts, seq)) in writers {
            trailer.extend_from_slice(&encode_id(id)?);
            trailer.write_u64::<BigEndian>(*ts)?;
            trailer.write_u64::<BigEndian>(*seq)?;
        }
    }

    let header = ChunkHeader {
        chunk_type,
        num_entries: entries.len() as u16,
        num_records,
        timestamp,
        epoch,
        chunk_id,
        crc: crc32(&data),
        data_len: data.len() as u32,
        trailer_len: trailer.len() as u32,
    };

    let mut bytes = Vec::with_capacity(HEADER_SIZE + data.len() + trailer.len());
    Cursor::new(&mut bytes).write_be(&header)?;
    bytes.extend_from_slice(&data);
    bytes.extend_from_slice(&trailer);

    Ok(EncodedChunk { bytes, num_records })
}

/// Parse a chunk header from exactly [`HEADER_SIZE`] bytes.
pub fn decode_header(buf: &[u8]) -> OsilResult<ChunkHeader> {
    debug_assert_eq!(buf.len(), HEADER_SIZE);
    if buf[0] != HEADER_TAG {
        return Err(OsilError::InvalidChunkHeader(format!(
            "bad leading bytes {:02x?}",
            &buf[..8.min(buf.len())]
        )));
    }
    Cursor::new(buf)
        .read_be::<ChunkHeader>()
        .map_err(|e| OsilError::InvalidChunkHeader(e.to_string()))
}

/// Validate the header CRC against the entry region.
pub fn check_crc(header: &ChunkHeader, data: &[u8]) -> OsilResult<()> {
    let calculated = crc32(data);
    if calculated != header.crc {
        return Err(OsilError::CrcMismatch {
            chunk_id: header.chunk_id,
            saved: header.crc,
            calculated,
        });
    }
    Ok(())
}

/// Iterator over the entries in a chunk's data region, yielding each entry
/// with the offset of its first record.
pub struct Entries<'a> {
    data: &'a [u8],
    pos: usize,
    offset: u64,
    remaining: u16,
}

impl<'a> Entries<'a> {
    pub fn new(header: &ChunkHeader, data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            offset: header.chunk_id,
            remaining: header.num_entries,
        }
    }

    fn take(&mut self, n: usize) -> OsilResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(OsilError::TruncatedChunk {
                expected: (self.pos + n) as u64,
                available: self.data.len() as u64,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn next_entry(&mut self) -> OsilResult<(u64, Entry<'a>)> {
        let offset = self.offset;
        let first = self.take(1)?[0];
        let entry = if first & 0x80 == 0 {
            // simple record: the byte we peeked is the top of a 31-bit size
            let rest = self.take(3)?;
            let size = u32::from_be_bytes([first, rest[0], rest[1], rest[2]]);
            Entry::Record(self.take(size as usize)?)
        } else {
            let compression = (first >> 4) & 0x07;
            let mut meta = Cursor::new(self.take(6)?);
            let num_records = meta.read_u16::<BigEndian>()?;
            let size = meta.read_u32::<BigEndian>()?;
            Entry::SubBatch {
                num_records,
                compression,
                bytes: self.take(size as usize)?,
            }
        };
        self.offset += entry.num_records() as u64;
        Ok((offset, entry))
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = OsilResult<(u64, Entry<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.next_entry() {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Parse a USER chunk trailer into `(writer_id, timestamp, sequence)` records.
pub fn parse_trailer(bytes: &[u8]) -> OsilResult<Vec<(Vec<u8>, u64, u64)>> {
    let mut cur = Cursor::new(bytes);
    let mut out = Vec::new();
    while (cur.position() as usize) < bytes.len() {
        let id = read_id(&mut cur, bytes)?;
        let ts = cur.read_u64::<BigEndian>()?;
        let seq = cur.read_u64::<BigEndian>()?;
        out.push((id, ts, seq));
    }
    Ok(out)
}

/// Parse a tracking delta/snapshot body into an id-to-offset map.
pub fn parse_tracking_body(bytes: &[u8]) -> OsilResult<TrackingMap> {
    let mut cur = Cursor::new(bytes);
    let mut map = TrackingMap::new();
    while (cur.position() as usize) < bytes.len() {
        let id = read_id(&mut cur, bytes)?;
        let offset = cur.read_u64::<BigEndian>()?;
        map.insert(id, offset);
    }
    Ok(map)
}

/// Parse a writer snapshot body; every entry takes the snapshot chunk's own id
/// as its `chunk_id`.
pub fn parse_writer_body(bytes: &[u8], chunk_id: u64) -> OsilResult<WriterMap> {
    let mut cur = Cursor::new(bytes);
    let mut map = WriterMap::new();
    while (cur.position() as usize) < bytes.len() {
        let id = read_id(&mut cur, bytes)?;
        let timestamp = cur.read_u64::<BigEndian>()?;
        let sequence = cur.read_u64::<BigEndian>()?;
        map.insert(
            id,
            WriterEntry {
                chunk_id,
                timestamp,
                sequence,
            },
        );
    }
    Ok(map)
}

pub fn encode_tracking_body(map: &TrackingMap) -> OsilResult<Vec<u8>> {
    let mut out = Vec::new();
    for (id, offset) in map {
        out.extend_from_slice(&encode_id(id)?);
        out.write_u64::<BigEndian>(*offset)?;
    }
    Ok(out)
}

pub fn encode_writer_body(map: &WriterMap) -> OsilResult<Vec<u8>> {
    let mut out = Vec::new();
    for (id, entry) in map {
        out.extend_from_slice(&encode_id(id)?);
        out.write_u64::<BigEndian>(entry.timestamp)?;
        out.write_u64::<BigEndian>(entry.sequence)?;
    }
    Ok(out)
}

fn encode_id(id: &[u8]) -> OsilResult<Vec<u8>> {
    if id.len() > u8::MAX as usize {
        return Err(OsilError::IdTooLong(id.len()));
    }
    let mut out = Vec::with_capacity(1 + id.len());
    out.push(id.len() as u8);
    out.extend_from_slice(id);
    Ok(out)
}

fn read_id(cur: &mut Cursor<&[u8]>, bytes: &[u8]) -> OsilResult<Vec<u8>> {
    let len = cur.read_u8()? as usize;
    let start = cur.position() as usize;
    if start + len > bytes.len() {
        return Err(OsilError::TruncatedChunk {
            expected: (start + len) as u64,
            available: bytes.len() as u64,
        });
    }
    cur.set_position((start + len) as u64);
    Ok(bytes[start..start + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::compression;
    use std::collections::BTreeMap;

    fn user_chunk(entries: &[Entry<'_>]) -> EncodedChunk {
        encode_chunk(entries, &BTreeMap::new(), ChunkType::User, 12345, 1, 0).unwrap()
    }

    #[test]
    fn encode_and_parse_simple_entries() {
        let chunk = user_chunk(&[Entry::Record(b"hello"), Entry::Record(b"world!")]);
        assert_eq!(chunk.num_records, 2);

        let header = decode_header(&chunk.bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.num_entries, 2);
        assert_eq!(header.num_records, 2);
        assert_eq!(header.trailer_len, 0);

        let data = &chunk.bytes[HEADER_SIZE..HEADER_SIZE + header.data_len as usize];
        check_crc(&header, data).unwrap();

        let entries: Vec<_> = Entries::new(&header, data).map(|e| e.unwrap()).collect();
        assert_eq!(
            entries,
            vec![
                (0, Entry::Record(b"hello".as_slice())),
                (1, Entry::Record(b"world!".as_slice())),
            ]
        );
    }

    #[test]
    fn encode_and_parse_sub_batch() {
        let chunk = user_chunk(&[
            Entry::Record(b"a"),
            Entry::SubBatch {
                num_records: 3,
                compression: compression::ZSTD,
                bytes: b"compressed-bytes",
            },
            Entry::Record(b"z"),
        ]);
        assert_eq!(chunk.num_records, 5);

        let header = decode_header(&chunk.bytes[..HEADER_SIZE]).unwrap();
        let data = &chunk.bytes[HEADER_SIZE..HEADER_SIZE + header.data_len as usize];
        let entries: Vec<_> = Entries::new(&header, data).map(|e| e.unwrap()).collect();
        assert_eq!(entries[0], (0, Entry::Record(b"a".as_slice())));
        assert_eq!(
            entries[1],
            (
                1,
                Entry::SubBatch {
                    num_records: 3,
                    compression: compression::ZSTD,
                    bytes: b"compressed-bytes".as_slice(),
                }
            )
        );
        // the sub-batch consumed three offsets
        assert_eq!(entries[2], (4, Entry::Record(b"z".as_slice())));
    }

    #[test]
    fn trailer_round_trip() {
        let mut writers = WriterSeqs::new();
        writers.insert(b"wr-1".to_vec(), (111, 7));
        writers.insert(b"wr-2".to_vec(), (222, 9));
        let chunk =
            encode_chunk(&[Entry::Record(b"x")], &writers, ChunkType::User, 0, 1, 5).unwrap();

        let header = decode_header(&chunk.bytes[..HEADER_SIZE]).unwrap();
        let trailer = &chunk.bytes[HEADER_SIZE + header.data_len as usize..];
        assert_eq!(trailer.len(), header.trailer_len as usize);

        let parsed = parse_trailer(trailer).unwrap();
        assert_eq!(
            parsed,
            vec![
                (b"wr-1".to_vec(), 111, 7),
                (b"wr-2".to_vec(), 222, 9),
            ]
        );
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut chunk = user_chunk(&[Entry::Record(b"payload")]);
        let last = chunk.bytes.len() - 1;
        chunk.bytes[last] ^= 0xff;

        let header = decode_header(&chunk.bytes[..HEADER_SIZE]).unwrap();
        let data = &chunk.bytes[HEADER_SIZE..];
        assert!(matches!(
            check_crc(&header, data),
            Err(OsilError::CrcMismatch { chunk_id: 0, .. })
        ));
    }

    #[test]
    fn bad_leading_byte_rejected() {
        let mut chunk = user_chunk(&[Entry::Record(b"x")]);
        chunk.bytes[0] = 0x61;
        assert!(matches!(
            decode_header(&chunk.bytes[..HEADER_SIZE]),
            Err(OsilError::InvalidChunkHeader(_))
        ));
    }

    #[test]
    fn tracking_bodies_round_trip() {
        let mut map = TrackingMap::new();
        map.insert(b"consumer-a".to_vec(), 42);
        map.insert(b"consumer-b".to_vec(), 7);
        let body = encode_tracking_body(&map).unwrap();
        assert_eq!(parse_tracking_body(&body).unwrap(), map);

        let mut writers = WriterMap::new();
        writers.insert(
            b"w1".to_vec(),
            WriterEntry {
                chunk_id: 9,
                timestamp: 1000,
                sequence: 3,
            },
        );
        let body = encode_writer_body(&writers).unwrap();
        assert_eq!(parse_writer_body(&body, 9).unwrap(), writers);
    }
}
