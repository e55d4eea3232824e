use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::aggregate::snapshot::WindowSnapshot;
use crate::encode::binary::decode_binary;

const SPILL_EXT: &str = "pcws";

/// Writes one binary envelope per sealed window into a directory.
///
/// Files are named `<window_start_ns:020>.pcws`, so lexical order is window
/// order. Each write goes through a temp file and a rename.
pub struct SpillWriter {
    dir: PathBuf,
    max_files: usize,
}

impl SpillWriter {
    /// Opens (and creates if needed) the spill directory.
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating spill dir {}", dir.display()))?;
        Ok(Self {
            dir,
            max_files: max_files.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a window starting at `window_start_ns` is spilled to.
    pub fn path_for(&self, window_start_ns: u64) -> PathBuf {
        self.dir
            .join(format!("{window_start_ns:020}.{SPILL_EXT}"))
    }

    /// Persists an encoded window, then prunes the oldest files.
    pub fn write(&self, window_start_ns: u64, envelope: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(window_start_ns);
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, envelope).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming {}", tmp.display()))?;

        self.prune()?;
        Ok(path)
    }

    /// Decodes up to `limit` of the newest spilled windows, oldest first.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn load_recent(&self, limit: usize) -> Result<Vec<WindowSnapshot>> {
        let files = list_spill_files(&self.dir)?;
        let skip = files.len().saturating_sub(limit);

        let mut out = Vec::with_capacity(files.len() - skip);
        for path in files.into_iter().skip(skip) {
            match read_spill_file(&path) {
                Ok((_, snapshot)) => out.push(snapshot),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable spill file"),
            }
        }
        Ok(out)
    }

    fn prune(&self) -> Result<()> {
        let files = list_spill_files(&self.dir)?;
        let excess = files.len().saturating_sub(self.max_files);
        for path in files.into_iter().take(excess) {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            debug!(path = %path.display(), "pruned spill file");
        }
        Ok(())
    }
}

/// Spill files in `dir`, oldest window first.
pub fn list_spill_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SPILL_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads one spill file, returning its sequence id and window.
pub fn read_spill_file(path: &Path) -> Result<(u64, WindowSnapshot)> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_binary(&data).with_context(|| format!("decoding {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::snapshot::MetricKey;
    use crate::aggregate::stats::MetricStats;
    use crate::encode::binary::encode_binary;

    fn envelope(start: u64, seq: u64) -> (WindowSnapshot, Vec<u8>) {
        let mut snap = WindowSnapshot::new(start, 1_000);
        snap.metrics
            .insert(MetricKey::new("frame_time", "render"), MetricStats::from_sample(16.6));
        let bytes = encode_binary(&snap, seq).expect("encode");
        (snap, bytes)
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = SpillWriter::new(dir.path(), 10).expect("writer");
        let (snap, bytes) = envelope(42_000, 7);

        let path = writer.write(snap.window_start_ns, &bytes).expect("write");
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("00000000000000042000.pcws")
        );

        let (seq, decoded) = read_spill_file(&path).expect("read");
        assert_eq!(seq, 7);
        assert_eq!(decoded, snap);
        assert_eq!(fs::read(&path).expect("raw"), bytes);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = SpillWriter::new(dir.path(), 3).expect("writer");
        for i in 0..5u64 {
            let (snap, bytes) = envelope(i * 1_000, i);
            writer.write(snap.window_start_ns, &bytes).expect("write");
        }

        let files = list_spill_files(dir.path()).expect("list");
        assert_eq!(files.len(), 3);
        assert_eq!(files[0], writer.path_for(2_000));
    }

    #[test]
    fn test_load_recent_skips_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = SpillWriter::new(dir.path(), 10).expect("writer");
        for i in 0..3u64 {
            let (snap, bytes) = envelope(i * 1_000, i);
            writer.write(snap.window_start_ns, &bytes).expect("write");
        }
        fs::write(writer.path_for(5_000), b"garbage").expect("corrupt file");
        fs::write(dir.path().join("notes.txt"), b"ignored").expect("other file");

        let loaded = writer.load_recent(10).expect("load");
        let starts: Vec<u64> = loaded.iter().map(|s| s.window_start_ns).collect();
        assert_eq!(starts, vec![0, 1_000, 2_000]);

        let newest = writer.load_recent(2).expect("load");
        // The corrupt newest file counts toward the limit and is skipped.
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].window_start_ns, 2_000);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_spill_file(&dir.path().join("missing.pcws")).unwrap_err();
        assert!(err.to_string().contains("reading"));
    }
}
