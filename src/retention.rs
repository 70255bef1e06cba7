//! Whole-segment retention.
//!
//! Policies only ever delete the oldest `.segment`/`.index` pairs; chunks are
//! never rewritten and the newest segment is never touched, so the last
//! offset is unaffected. Readers holding a deleted segment keep reading it
//! until they cross into the next one.

use std::path::Path;
use std::time::Duration;

use log::info;

use crate::segment::{self, SegmentInfo};
use crate::{now_ms, OsilResult};

/// One retention policy; a log may carry several, evaluated in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionSpec {
    /// Delete oldest segments while the log's total size exceeds this.
    MaxBytes(u64),
    /// Delete oldest segments whose newest data is older than this.
    MaxAge(Duration),
}

/// Apply `specs` to the log at `dir` and return the offset range that
/// remains.
pub fn evaluate(dir: &Path, specs: &[RetentionSpec]) -> OsilResult<Option<(u64, u64)>> {
    let mut segs = segment::segments(dir)?;

    for spec in specs {
        match spec {
            RetentionSpec::MaxBytes(limit) => max_bytes(&mut segs, *limit)?,
            RetentionSpec::MaxAge(age) => max_age(&mut segs, *age)?,
        }
    }

    Ok(segment::range(&segs))
}

/// Like [`evaluate`], but hands the surviving range to `apply` so the caller
/// can bump its first-offset counter in the same breath.
pub fn evaluate_with<F>(dir: &Path, specs: &[RetentionSpec], apply: F) -> OsilResult<Option<(u64, u64)>>
where
    F: FnOnce(Option<(u64, u64)>),
{
    let range = evaluate(dir, specs)?;
    apply(range);
    Ok(range)
}

fn max_bytes(segs: &mut Vec<SegmentInfo>, limit: u64) -> OsilResult<()> {
    let mut total: u64 = segs.iter().map(|s| s.size).sum();
    while total > limit && segs.len() > 1 {
        let oldest = segs.remove(0);
        info!(
            "max_bytes({limit}): dropping segment {} ({} bytes)",
            oldest.segment.display(),
            oldest.size
        );
        total -= oldest.size;
        segment::delete_pair(&oldest)?;
    }
    Ok(())
}

fn max_age(segs: &mut Vec<SegmentInfo>, age: Duration) -> OsilResult<()> {
    let cutoff = now_ms() - age.as_millis() as i64;
    while segs.len() > 1 {
        let first_ts = match segs[0].first {
            Some(first) => first.timestamp,
            None => break,
        };
        if first_ts >= cutoff {
            break;
        }
        let oldest = segs.remove(0);
        info!(
            "max_age({}ms): dropping segment {}",
            age.as_millis(),
            oldest.segment.display()
        );
        segment::delete_pair(&oldest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Entry;
    use crate::write::LogOptions;

    /// A writer with a tiny segment threshold so every chunk rolls.
    fn tiny_writer(dir: &Path) -> crate::write::Writer {
        LogOptions::new().epoch(1).max_segment_size(1).open(dir).unwrap()
    }

    #[test]
    fn max_bytes_keeps_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = tiny_writer(dir.path());
        for _ in 0..5 {
            writer.write(&[Entry::Record(&[0u8; 64])]).unwrap();
        }

        // a zero byte limit still refuses to delete the last segment
        let range = evaluate(dir.path(), &[RetentionSpec::MaxBytes(0)]).unwrap();
        let segs = segment::segments(dir.path()).unwrap();
        assert_eq!(segs.len(), 1);
        // the last offset is untouched by retention
        assert_eq!(range.map(|r| r.1), Some(writer.next_offset() - 1));
    }

    #[test]
    fn max_bytes_deletes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = tiny_writer(dir.path());
        for _ in 0..4 {
            writer.write(&[Entry::Record(&[0u8; 64])]).unwrap();
        }
        let before = segment::segments(dir.path()).unwrap();
        assert!(before.len() > 2);
        let total: u64 = before.iter().map(|s| s.size).sum();

        let limit = total - 1;
        evaluate(dir.path(), &[RetentionSpec::MaxBytes(limit)]).unwrap();
        let after = segment::segments(dir.path()).unwrap();
        assert_eq!(after.first().unwrap().base_offset, before[1].base_offset);
    }

    #[test]
    fn max_age_ignores_fresh_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = tiny_writer(dir.path());
        for _ in 0..3 {
            writer.write(&[Entry::Record(b"x")]).unwrap();
        }
        let before = segment::segments(dir.path()).unwrap().len();
        evaluate(
            dir.path(),
            &[RetentionSpec::MaxAge(Duration::from_secs(3600))],
        )
        .unwrap();
        assert_eq!(segment::segments(dir.path()).unwrap().len(), before);
    }
}
