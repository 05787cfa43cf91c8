//! Data file access for one day
//!
//! The data file is a flat arena of chunk bytes. Appends go straight to the
//! end of the file, beyond every region a committed index can reference.
//! Anything that would change bytes a committed index already points at is
//! held back until the new index is durable on disk: in-place overwrites are
//! staged until [`ChunkStore::flush`], and a compacted copy waits in
//! `<data>.defrag` until [`ChunkStore::install_compacted`].

use crate::storage::error::{SpdbError, SpdbResult};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct ChunkStore {
    path: PathBuf,
    file: File,
    /// Length when opened; an aborted put truncates back to it
    committed_len: u64,
    len: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    /// Length of a fully written `<data>.defrag` awaiting install
    compacted: Option<u64>,
}

impl ChunkStore {
    /// Open for reading only
    pub fn open_read(path: impl Into<PathBuf>) -> SpdbResult<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Self::from_file(path, file)
    }

    /// Open for writing, creating the file if needed
    pub fn open_write(path: impl Into<PathBuf>) -> SpdbResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Self::from_file(path, file)
    }

    /// Start an empty data file, discarding bytes no index refers to
    pub fn create(path: impl Into<PathBuf>) -> SpdbResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Self::from_file(path, file)
    }

    fn from_file(path: PathBuf, file: File) -> SpdbResult<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            committed_len: len,
            len,
            pending: BTreeMap::new(),
            compacted: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length including appended bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `bytes`, reusing the region `(offset, len)` in `hint` when they fit.
    ///
    /// Returns the offset the bytes now live at. The caller owns the ref
    /// bookkeeping, including accounting for any freed region.
    pub fn write_chunk(&mut self, hint: Option<(u64, u32)>, bytes: &[u8]) -> SpdbResult<u64> {
        if let Some((offset, old_len)) = hint {
            if bytes.len() <= old_len as usize {
                self.pending.insert(offset, bytes.to_vec());
                return Ok(offset);
            }
        }

        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(offset)
    }

    /// Read `len` stored bytes at `offset`, seeing staged overwrites
    pub fn read_chunk(&mut self, offset: u64, len: u32) -> SpdbResult<Vec<u8>> {
        if let Some(staged) = self.pending.get(&offset) {
            if staged.len() == len as usize {
                return Ok(staged.clone());
            }
        }

        let in_bounds = offset
            .checked_add(u64::from(len))
            .is_some_and(|end| end <= self.len);
        if !in_bounds {
            return Err(SpdbError::corrupt(
                &self.path,
                format!(
                    "chunk region {}+{} beyond end of data file ({} bytes)",
                    offset, len, self.len
                ),
            ));
        }

        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Make appended bytes durable without touching committed regions
    pub fn sync_appends(&mut self) -> SpdbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Write staged overwrites and fsync
    pub fn flush(&mut self) -> SpdbResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for (offset, bytes) in &pending {
            self.file.seek(SeekFrom::Start(*offset))?;
            self.file.write_all(bytes)?;
        }
        self.file.sync_all()?;
        self.committed_len = self.len;
        Ok(())
    }

    /// Drop staged work: overwrites, appends since the last flush and any
    /// compacted copy that was never installed
    pub fn abort(&mut self) -> SpdbResult<()> {
        self.pending.clear();
        if self.compacted.take().is_some() {
            let _ = std::fs::remove_file(defrag_path(&self.path));
        }
        if self.len != self.committed_len {
            self.file.set_len(self.committed_len)?;
            self.len = self.committed_len;
        }
        Ok(())
    }

    /// Copy `regions`, in order and back to back, into `<data>.defrag`.
    ///
    /// The copy is synced but the data file itself is left alone until
    /// [`ChunkStore::install_compacted`]. Returns the new offset of each region.
    pub fn stage_compacted(&mut self, regions: &[(u64, u32)]) -> SpdbResult<Vec<u64>> {
        let tmp_path = defrag_path(&self.path);
        let mut new_offsets = Vec::with_capacity(regions.len());
        let written = (|| -> SpdbResult<u64> {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            let mut pos = 0u64;
            for &(offset, len) in regions {
                let bytes = self.read_chunk(offset, len)?;
                writer.write_all(&bytes)?;
                new_offsets.push(pos);
                pos += u64::from(len);
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok(pos)
        })();

        match written {
            Ok(len) => {
                self.compacted = Some(len);
                Ok(new_offsets)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// Rename the staged compacted copy over the data file and reopen it
    pub fn install_compacted(&mut self) -> SpdbResult<()> {
        let Some(new_len) = self.compacted else {
            return Err(SpdbError::InvalidArgument(format!(
                "no compacted copy of {:?} to install",
                self.path
            )));
        };
        std::fs::rename(defrag_path(&self.path), &self.path)?;
        self.compacted = None;
        self.pending.clear();
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.len = new_len;
        self.committed_len = new_len;
        Ok(())
    }
}

fn defrag_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".defrag");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let mut store = ChunkStore::open_write(dir.path().join("20240101.data")).unwrap();

        let a = store.write_chunk(None, b"alpha").unwrap();
        let b = store.write_chunk(None, b"bravo!").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        assert_eq!(store.len(), 11);
        assert_eq!(store.read_chunk(b, 6).unwrap(), b"bravo!");
    }

    #[test]
    fn test_in_place_write_is_staged_until_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("20240101.data");
        let mut store = ChunkStore::open_write(&path).unwrap();
        store.write_chunk(None, b"original").unwrap();
        store.flush().unwrap();

        let offset = store.write_chunk(Some((0, 8)), b"new").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(store.read_chunk(0, 3).unwrap(), b"new");

        // Not yet on disk
        assert_eq!(std::fs::read(&path).unwrap(), b"original");

        store.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"newginal");
    }

    #[test]
    fn test_too_large_for_hint_appends() {
        let dir = tempdir().unwrap();
        let mut store = ChunkStore::open_write(dir.path().join("d.data")).unwrap();
        store.write_chunk(None, b"abc").unwrap();
        let offset = store.write_chunk(Some((0, 3)), b"abcdef").unwrap();
        assert_eq!(offset, 3);
        assert_eq!(store.len(), 9);
    }

    #[test]
    fn test_abort_truncates_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.data");
        let mut store = ChunkStore::open_write(&path).unwrap();
        store.write_chunk(None, b"kept").unwrap();
        store.flush().unwrap();

        store.write_chunk(None, b"dropped").unwrap();
        store.write_chunk(Some((0, 4)), b"xx").unwrap();
        store.abort().unwrap();

        assert_eq!(store.len(), 4);
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
    }

    #[test]
    fn test_read_beyond_end_is_corruption() {
        let dir = tempdir().unwrap();
        let mut store = ChunkStore::open_write(dir.path().join("d.data")).unwrap();
        store.write_chunk(None, b"short").unwrap();
        let err = store.read_chunk(2, 10).unwrap_err();
        assert!(matches!(err, SpdbError::CorruptOrUnsupportedHeader { .. }));
    }

    #[test]
    fn test_compact_keeps_live_regions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.data");
        let mut store = ChunkStore::open_write(&path).unwrap();
        store.write_chunk(None, b"aaaa").unwrap();
        store.write_chunk(None, b"hole").unwrap();
        store.write_chunk(None, b"cc").unwrap();
        store.flush().unwrap();

        let offsets = store.stage_compacted(&[(0, 4), (8, 2)]).unwrap();
        assert_eq!(offsets, vec![0, 4]);
        // Staged only; the live file is untouched
        assert_eq!(std::fs::read(&path).unwrap(), b"aaaaholecc");
        assert_eq!(std::fs::read(defrag_path(&path)).unwrap(), b"aaaacc");

        store.install_compacted().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"aaaacc");
        assert!(!defrag_path(&path).exists());
        assert_eq!(store.read_chunk(4, 2).unwrap(), b"cc");
    }

    #[test]
    fn test_abort_discards_staged_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.data");
        let mut store = ChunkStore::open_write(&path).unwrap();
        store.write_chunk(None, b"keep").unwrap();
        store.write_chunk(None, b"drop").unwrap();
        store.flush().unwrap();

        store.stage_compacted(&[(0, 4)]).unwrap();
        store.abort().unwrap();
        assert!(!defrag_path(&path).exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"keepdrop");
        assert!(store.install_compacted().is_err());
    }
}
