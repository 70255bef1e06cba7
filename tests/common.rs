use osil::{Entry, LogReader, Writer};

/// Append one chunk of simple records, returning its chunk id.
pub fn write_records(writer: &mut Writer, records: &[&[u8]]) -> u64 {
    let entries: Vec<Entry<'_>> = records.iter().map(|r| Entry::Record(r)).collect();
    writer.write(&entries).unwrap()
}

/// Drain the reader, flattening every user record into `(offset, bytes)`.
pub fn collect_records(reader: &mut LogReader) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    while let Some(chunk) = reader.read_chunk_parsed().unwrap() {
        if chunk.header.chunk_type != osil::ChunkType::User {
            continue;
        }
        for record in chunk.records() {
            let (offset, entry) = record.unwrap();
            out.push((offset, entry.bytes().to_vec()));
        }
    }
    out
}
