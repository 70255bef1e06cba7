mod common;

use common::*;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::thread;

use anyhow::Result;
use itertools::Itertools;
use osil::records::HEADER_SIZE;
use osil::{LogOptions, LogReader, Replica};

/// Drain one end of the socket on a thread so sendfile never blocks on a
/// full buffer.
fn drain(mut sock: UnixStream) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut out = Vec::new();
        sock.read_to_end(&mut out).unwrap();
        out
    })
}

/// Split a verbatim chunk stream back into chunks the way a remote acceptor
/// does: parse each header, take `total_size` bytes.
fn split_chunks(stream: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + HEADER_SIZE <= stream.len() {
        let header = osil::chunk::decode_header(&stream[pos..pos + HEADER_SIZE]).unwrap();
        let total = header.total_size() as usize;
        out.push(stream[pos..pos + total].to_vec());
        pos += total;
    }
    assert_eq!(pos, stream.len(), "stream ended mid-chunk");
    out
}

/// Leader to follower to acceptor: chunks stream zero-copy with no framing
/// and replay byte-identically on the replica.
#[test]
fn follower_streams_chunks_to_an_acceptor() -> Result<()> {
    let leader_dir = tempfile::tempdir()?;
    let replica_dir = tempfile::tempdir()?;

    let mut leader = LogOptions::new().epoch(1).open(leader_dir.path())?;
    write_records(&mut leader, &[b"a", b"b"]);
    write_records(&mut leader, &[b"c"]);

    let (tx, rx) = UnixStream::pair()?;
    let receiver = drain(rx);

    let reader = LogReader::data(leader_dir.path(), 0, None)?;
    let mut replica = Replica::new(reader, tx);
    let registered_at = replica.on_more_data()?;
    assert_eq!(registered_at, 3);
    assert_eq!(replica.counters().chunks_sent(), 2);
    assert_eq!(replica.counters().offset(), 3);
    assert_eq!(replica.counters().offset_listeners(), 1);
    drop(replica.close());

    let stream = receiver.join().unwrap();
    let chunks = split_chunks(&stream);
    assert_eq!(chunks.len(), 2);

    let mut acceptor = LogOptions::new()
        .epoch(1)
        .open_acceptor(replica_dir.path(), &[])?;
    for chunk in &chunks {
        acceptor.accept_chunk(chunk)?;
    }
    assert_eq!(acceptor.next_offset(), 3);
    assert_eq!(acceptor.tail_info(), leader.tail_info());
    drop(acceptor);

    // the replica's log now reads identically to the leader's
    let mut leader_reader = LogReader::data(leader_dir.path(), 0, None)?;
    let ours: Vec<_> = std::iter::from_fn(|| leader_reader.read_chunk().transpose())
        .collect::<osil::OsilResult<_>>()?;
    let mut replica_reader = LogReader::data(replica_dir.path(), 0, None)?;
    let theirs: Vec<_> = std::iter::from_fn(|| replica_reader.read_chunk().transpose())
        .collect::<osil::OsilResult<_>>()?;
    for (a, b) in ours.iter().zip_eq(&theirs) {
        assert_eq!(a.bytes, b.bytes);
    }
    Ok(())
}

/// A second poke after new leader writes resumes exactly where the first
/// stopped.
#[test]
fn follower_resumes_after_more_data() -> Result<()> {
    let leader_dir = tempfile::tempdir()?;
    let mut leader = LogOptions::new().epoch(1).open(leader_dir.path())?;
    write_records(&mut leader, &[b"first"]);

    let (tx, rx) = UnixStream::pair()?;
    let receiver = drain(rx);

    let reader = LogReader::data(leader_dir.path(), 0, None)?;
    let mut replica = Replica::new(reader, tx);
    assert_eq!(replica.on_more_data()?, 1);

    write_records(&mut leader, &[b"second", b"third"]);
    assert_eq!(replica.on_more_data()?, 3);
    assert_eq!(replica.counters().chunks_sent(), 2);
    assert_eq!(replica.counters().offset_listeners(), 2);

    drop(replica.close());
    let chunks = split_chunks(&receiver.join().unwrap());
    assert_eq!(chunks.len(), 2);
    Ok(())
}
