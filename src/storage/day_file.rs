//! Day files: the index + data pair holding one UTC day of chunks
//!
//! A write handle holds the day's exclusive lock from open until commit or
//! drop. All ref changes stay in memory until [`DayFile::commit`]. Commit
//! makes the new index durable in `YYYYMMDD.indx.tmp` before it changes any
//! byte the old index refers to, then installs the data and renames the
//! index into place. A commit that fails before that point, or a write handle
//! dropped uncommitted, leaves the committed state on disk as it was.

use crate::storage::chunk_store::ChunkStore;
use crate::storage::codec::{truncate_to, Header, IndexFile, LABEL_LEN};
use crate::storage::compression::{decompress, Compression};
use crate::storage::engine::SpdbConfig;
use crate::storage::error::{SpdbError, SpdbResult};
use crate::storage::lock::DayLock;
use crate::storage::types::{day_start, AuxRef, ChunkRef, PutChunk, PutMode, SECS_PER_DAY, TAG_LEN};
use chrono::NaiveDate;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const INDEX_EXT: &str = "indx";
pub const DATA_EXT: &str = "data";
pub const LOCK_EXT: &str = "lock";

/// File names of one day, `YYYYMMDD.<ext>` in the database directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayPaths {
    pub index: PathBuf,
    pub data: PathBuf,
    pub lock: PathBuf,
}

impl DayPaths {
    /// Paths for the day containing `t`
    pub fn for_time(dir: &Path, t: i64) -> SpdbResult<Self> {
        let stamp = day_stamp(t)?;
        Ok(Self {
            index: dir.join(format!("{}.{}", stamp, INDEX_EXT)),
            data: dir.join(format!("{}.{}", stamp, DATA_EXT)),
            lock: dir.join(format!("{}.{}", stamp, LOCK_EXT)),
        })
    }

    fn index_tmp(&self) -> PathBuf {
        let mut name = self.index.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// `YYYYMMDD` for the UTC day containing `t`
pub fn day_stamp(t: i64) -> SpdbResult<String> {
    let dt = chrono::DateTime::from_timestamp(t, 0)
        .ok_or_else(|| SpdbError::InvalidArgument(format!("time {} out of range", t)))?;
    Ok(dt.format("%Y%m%d").to_string())
}

/// Start times of every day that has an index file in `dir`, ascending.
///
/// Names that do not parse as `YYYYMMDD.indx` are skipped.
pub fn list_days(dir: &Path) -> SpdbResult<Vec<i64>> {
    check_dir(dir)?;

    let mut days = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e != INDEX_EXT).unwrap_or(true) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match parse_day_stamp(stem) {
            Some(start) => days.push(start),
            None => tracing::debug!("Skipping {:?}: not a day index", path),
        }
    }
    days.sort_unstable();
    Ok(days)
}

/// Start of the day named by a `YYYYMMDD` stamp
pub fn parse_day_stamp(stamp: &str) -> Option<i64> {
    if stamp.len() != 8 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = stamp[0..4].parse().ok()?;
    let month = stamp[4..6].parse().ok()?;
    let day = stamp[6..8].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

/// What a single store did to the day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Replaced,
    /// AddUnique found an identical chunk
    Unchanged,
}

/// An open day file
pub struct DayFile {
    paths: DayPaths,
    index: IndexFile,
    store: ChunkStore,
    lock: DayLock,
    writable: bool,
    finished: bool,
}

impl DayFile {
    /// Open the day containing `t` for writing, creating it if needed
    pub fn open_write(
        dir: &Path,
        t: i64,
        prod_id: i32,
        prod_label: &str,
        config: &SpdbConfig,
    ) -> SpdbResult<Self> {
        std::fs::create_dir_all(dir)?;
        let paths = DayPaths::for_time(dir, t)?;
        let lock = DayLock::exclusive(&paths.lock, config.lock_timeout, config.lock_retry_interval)?;
        let start_of_day = day_start(t);

        if !paths.index.exists() {
            tracing::info!("Creating day file {:?}", paths.index);
            let store = ChunkStore::create(&paths.data)?;
            return Ok(Self {
                index: IndexFile::new(Header::new(start_of_day, prod_id, prod_label)),
                paths,
                store,
                lock,
                writable: true,
                finished: false,
            });
        }

        let mut index = read_index(&paths.index)?;
        if index.header.is_newer_than_supported() {
            return Err(SpdbError::corrupt(
                &paths.index,
                format!(
                    "written by newer revision {}.{}; refusing to rewrite",
                    index.header.major_revision, index.header.minor_revision
                ),
            ));
        }
        check_day(&index, &paths.index, start_of_day)?;
        check_product(&mut index.header, &paths.index, prod_id, prod_label)?;

        if !paths.data.exists() && !index.refs.is_empty() {
            return Err(SpdbError::corrupt(
                &paths.data,
                format!("data file missing for {} chunks", index.refs.len()),
            ));
        }
        let store = ChunkStore::open_write(&paths.data)?;

        // Bytes past everything the index accounts for were left by a writer
        // that died before its commit
        let tracked = index.header.nbytes_data + index.header.nbytes_frag;
        if store.len() > tracked {
            let orphaned = store.len() - tracked;
            tracing::debug!("{:?} has {} unreferenced trailing bytes", paths.data, orphaned);
            index.header.nbytes_frag += orphaned;
        }

        Ok(Self {
            paths,
            index,
            store,
            lock,
            writable: true,
            finished: false,
        })
    }

    /// Open the day containing `t` for reading; `None` if the day has no files
    pub fn open_read(dir: &Path, t: i64, config: &SpdbConfig) -> SpdbResult<Option<Self>> {
        check_dir(dir)?;
        let paths = DayPaths::for_time(dir, t)?;
        if !paths.index.exists() {
            return Ok(None);
        }

        let lock = if config.allow_no_lock {
            DayLock::unlocked(&paths.lock)
        } else {
            DayLock::shared(
                &paths.lock,
                config.read_lock_timeout,
                config.lock_retry_interval,
            )
        };

        let index = match read_index(&paths.index) {
            Ok(index) => index,
            Err(SpdbError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        check_day(&index, &paths.index, day_start(t))?;

        if !paths.data.exists() {
            if index.refs.is_empty() {
                return Ok(None);
            }
            return Err(SpdbError::corrupt(
                &paths.data,
                format!("data file missing for {} chunks", index.refs.len()),
            ));
        }
        let store = ChunkStore::open_read(&paths.data)?;

        Ok(Some(Self {
            paths,
            index,
            store,
            lock,
            writable: false,
            finished: false,
        }))
    }

    pub fn paths(&self) -> &DayPaths {
        &self.paths
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    pub fn header(&self) -> &Header {
        &self.index.header
    }

    pub fn refs(&self) -> &[ChunkRef] {
        &self.index.refs
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.index.header
    }

    /// Stored (possibly compressed) bytes of a chunk
    pub fn read_stored(&mut self, chunk_ref: &ChunkRef) -> SpdbResult<Vec<u8>> {
        self.store.read_chunk(chunk_ref.offset, chunk_ref.len)
    }

    /// Apply one put to this day according to `mode`.
    ///
    /// `stored` is the payload as it goes to disk, encoded with `compression`.
    pub fn store_chunk(
        &mut self,
        chunk: &PutChunk,
        compression: Compression,
        stored: &[u8],
        write_time: i64,
        mode: PutMode,
        respect_zero_types: bool,
    ) -> SpdbResult<StoreOutcome> {
        self.ensure_writable()?;
        let t = chunk.valid_time;
        if t < self.index.header.start_of_day || t > self.index.header.end_of_day {
            return Err(SpdbError::InvalidArgument(format!(
                "valid_time {} does not belong to {:?}",
                t, self.paths.index
            )));
        }
        let len = u32::try_from(stored.len()).map_err(|_| {
            SpdbError::InvalidArgument(format!("chunk of {} bytes is too large", stored.len()))
        })?;

        let refs = &self.index.refs;
        let lo = refs.partition_point(|r| r.valid_time < t);
        let hi = refs.partition_point(|r| r.valid_time <= t);
        let matching = (lo..hi)
            .find(|&i| refs[i].matches_types(chunk.data_type, chunk.data_type2, respect_zero_types));

        let aux = AuxRef {
            compression,
            tag: chunk
                .tag
                .as_deref()
                .filter(|tag| !tag.is_empty())
                .map(|tag| truncate_to(tag, TAG_LEN - 1)),
        };
        let mut new_ref = ChunkRef {
            data_type: chunk.data_type,
            data_type2: chunk.data_type2,
            valid_time: t,
            expire_time: chunk.expire_time,
            write_time,
            offset: 0,
            len,
            aux_index: 0,
        };

        if mode == PutMode::AddUnique && self.holds_identical(lo..hi, &new_ref, &chunk.data)? {
            return Ok(StoreOutcome::Unchanged);
        }

        match (mode, matching) {
            (PutMode::Over, Some(i)) => {
                let old = self.index.refs[i];
                new_ref.offset = self.store.write_chunk(Some((old.offset, old.len)), stored)?;
                // In place leaves the tail as a hole, a move frees the whole region
                let freed = if len <= old.len { old.len - len } else { old.len };
                self.index.header.nbytes_frag += u64::from(freed);
                self.index.refs[i] = new_ref;
                self.index.aux[i] = aux;
                Ok(StoreOutcome::Replaced)
            }
            (PutMode::Once, Some(_)) => Err(SpdbError::DuplicatePut {
                valid_time: t,
                data_type: chunk.data_type,
                data_type2: chunk.data_type2,
            }),
            _ => {
                new_ref.offset = self.store.write_chunk(None, stored)?;
                self.index.refs.insert(hi, new_ref);
                self.index.aux.insert(hi, aux);
                Ok(StoreOutcome::Inserted)
            }
        }
    }

    /// Whether a candidate has the same types and expiry and the same payload
    /// once decoded, however each copy was compressed
    fn holds_identical(
        &mut self,
        candidates: std::ops::Range<usize>,
        incoming: &ChunkRef,
        raw: &[u8],
    ) -> SpdbResult<bool> {
        for i in candidates {
            let existing = self.index.refs[i];
            let compression = self.index.aux[i].compression;
            if existing.data_type != incoming.data_type
                || existing.data_type2 != incoming.data_type2
                || existing.expire_time != incoming.expire_time
                || (!compression.is_compressed() && existing.len as usize != raw.len())
            {
                continue;
            }
            let stored = self.store.read_chunk(existing.offset, existing.len)?;
            let decoded = if compression.is_compressed() {
                decompress(compression, &stored)?
            } else {
                stored
            };
            if decoded == raw {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove every chunk at `valid_time` matching the types; returns how many
    pub fn erase(
        &mut self,
        valid_time: i64,
        data_type: i32,
        data_type2: i32,
        respect_zero_types: bool,
    ) -> SpdbResult<usize> {
        self.ensure_writable()?;
        let refs = &self.index.refs;
        let lo = refs.partition_point(|r| r.valid_time < valid_time);
        let hi = refs.partition_point(|r| r.valid_time <= valid_time);

        let mut erased = 0;
        for i in (lo..hi).rev() {
            if self.index.refs[i].matches_types(data_type, data_type2, respect_zero_types) {
                let removed = self.index.refs.remove(i);
                self.index.aux.remove(i);
                self.index.header.nbytes_frag += u64::from(removed.len);
                erased += 1;
            }
        }
        Ok(erased)
    }

    /// Persist all changes.
    ///
    /// Order: sync appended bytes (or stage a compacted copy), write and
    /// sync `.indx.tmp`, apply in-place writes (or install the compacted
    /// copy), then rename the index. Until the index temp file is durable
    /// nothing the old index points at has changed, so any earlier failure
    /// leaves the committed day intact.
    pub fn commit(mut self, config: &SpdbConfig) -> SpdbResult<()> {
        self.ensure_writable()?;
        self.index.recompute();

        let hdr = &self.index.header;
        let compact = config.enable_defrag && config.should_defrag(hdr.nbytes_data, hdr.nbytes_frag);
        let before = self.store.len();
        if compact {
            self.stage_defrag()?;
        } else {
            self.store.sync_appends()?;
        }

        self.index.header.latest_write = chrono::Utc::now().timestamp();
        let tmp = self.paths.index_tmp();
        if let Err(e) = write_synced(&tmp, &self.index.encode()) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        let installed = if compact {
            self.store.install_compacted()
        } else {
            self.store.flush()
        };
        if let Err(e) = installed {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, &self.paths.index)?;
        self.finished = true;

        if compact {
            tracing::info!(
                "Defragmented {:?}: {} -> {} bytes",
                self.paths.data,
                before,
                self.store.len()
            );
        }
        tracing::debug!(
            "Committed {:?}: {} chunks, {} data bytes, {} frag bytes",
            self.paths.index,
            self.index.refs.len(),
            self.index.header.nbytes_data,
            self.index.header.nbytes_frag
        );
        Ok(())
    }

    /// Write the live regions to a compacted copy and point the refs at it
    fn stage_defrag(&mut self) -> SpdbResult<()> {
        let regions: Vec<(u64, u32)> = self.index.refs.iter().map(|r| (r.offset, r.len)).collect();
        let offsets = self.store.stage_compacted(&regions)?;
        for (r, offset) in self.index.refs.iter_mut().zip(offsets) {
            r.offset = offset;
        }
        self.index.header.nbytes_frag = 0;
        Ok(())
    }

    fn ensure_writable(&self) -> SpdbResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(SpdbError::InvalidArgument(format!(
                "{:?} is open read-only",
                self.paths.index
            )))
        }
    }
}

impl Drop for DayFile {
    fn drop(&mut self) {
        if self.writable && !self.finished {
            if let Err(e) = self.store.abort() {
                tracing::warn!("Failed to roll back {:?}: {}", self.paths.data, e);
            }
        }
    }
}

/// A missing database directory is reported like an unreadable header
pub(crate) fn check_dir(dir: &Path) -> SpdbResult<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(SpdbError::corrupt(dir, "database directory does not exist"))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> SpdbResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn read_index(path: &Path) -> SpdbResult<IndexFile> {
    let bytes = std::fs::read(path)?;
    IndexFile::decode(&bytes, path)
}

fn check_day(index: &IndexFile, path: &Path, start_of_day: i64) -> SpdbResult<()> {
    let hdr = &index.header;
    if hdr.start_of_day != start_of_day || hdr.end_of_day != start_of_day + SECS_PER_DAY - 1 {
        return Err(SpdbError::corrupt(
            path,
            format!(
                "header covers {}..={}, file name implies day starting {}",
                hdr.start_of_day, hdr.end_of_day, start_of_day
            ),
        ));
    }
    Ok(())
}

/// Refuse a different product; adopt id/label where the stored one is unset
fn check_product(header: &mut Header, path: &Path, prod_id: i32, prod_label: &str) -> SpdbResult<()> {
    let label = truncate_to(prod_label, LABEL_LEN - 1);
    let id_conflict = header.prod_id != 0 && prod_id != 0 && header.prod_id != prod_id;
    let label_conflict =
        !header.prod_label.is_empty() && !label.is_empty() && header.prod_label != label;
    if id_conflict || label_conflict {
        return Err(SpdbError::ProductIdMismatch {
            path: path.to_path_buf(),
            stored_id: header.prod_id,
            stored_label: header.prod_label.clone(),
            requested_id: prod_id,
            requested_label: label,
        });
    }
    if header.prod_id == 0 {
        header.prod_id = prod_id;
    }
    if header.prod_label.is_empty() {
        header.prod_label = label;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::MINOR_REVISION;
    use crate::storage::types::MINS_PER_DAY;
    use tempfile::tempdir;

    // 2024-01-01T00:00:00Z
    const DAY: i64 = 1_704_067_200;

    fn config() -> SpdbConfig {
        SpdbConfig::default()
    }

    fn put(day: &mut DayFile, t: i64, data_type: i32, payload: &[u8], mode: PutMode) -> SpdbResult<StoreOutcome> {
        let chunk = PutChunk::new(t, t + 600, payload.to_vec()).data_type(data_type);
        day.store_chunk(&chunk, Compression::None, payload, DAY + 1, mode, false)
    }

    #[test]
    fn test_day_paths_naming() {
        let paths = DayPaths::for_time(Path::new("/db"), DAY + 3600).unwrap();
        assert_eq!(paths.index, PathBuf::from("/db/20240101.indx"));
        assert_eq!(paths.data, PathBuf::from("/db/20240101.data"));
        assert_eq!(paths.lock, PathBuf::from("/db/20240101.lock"));
        assert_eq!(day_stamp(0).unwrap(), "19700101");
    }

    #[test]
    fn test_parse_day_stamp() {
        assert_eq!(parse_day_stamp("20240101"), Some(DAY));
        assert_eq!(parse_day_stamp("20240230"), None);
        assert_eq!(parse_day_stamp("2024011"), None);
        assert_eq!(parse_day_stamp("notes"), None);
    }

    #[test]
    fn test_create_commit_reopen() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 42, "mosaic", &config()).unwrap();
        put(&mut day, DAY + 120, 7, b"second", PutMode::Over).unwrap();
        put(&mut day, DAY + 60, 7, b"first", PutMode::Over).unwrap();
        day.commit(&config()).unwrap();

        let mut day = DayFile::open_read(dir.path(), DAY + 5, &config()).unwrap().unwrap();
        assert_eq!(day.header().prod_id, 42);
        assert_eq!(day.header().prod_label, "mosaic");
        assert!(day.header().latest_write > 0);
        let times: Vec<i64> = day.refs().iter().map(|r| r.valid_time).collect();
        assert_eq!(times, vec![DAY + 60, DAY + 120]);
        let r = day.refs()[0];
        assert_eq!(day.read_stored(&r).unwrap(), b"first");
    }

    #[test]
    fn test_open_read_missing_day_is_none() {
        let dir = tempdir().unwrap();
        assert!(DayFile::open_read(dir.path(), DAY, &config()).unwrap().is_none());
        assert!(!dir.path().join("20240101.data").exists());
    }

    #[test]
    fn test_open_read_missing_directory() {
        let dir = tempdir().unwrap();
        let err = DayFile::open_read(&dir.path().join("nope"), DAY, &config())
            .err()
            .unwrap();
        assert!(
            matches!(&err, SpdbError::CorruptOrUnsupportedHeader { reason, .. } if reason.contains("does not exist"))
        );
        assert!(list_days(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_over_replaces_in_place_and_counts_hole() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"0123456789", PutMode::Over).unwrap();
        assert_eq!(
            put(&mut day, DAY + 10, 7, b"abc", PutMode::Over).unwrap(),
            StoreOutcome::Replaced
        );
        assert_eq!(day.refs().len(), 1);
        assert_eq!(day.refs()[0].offset, 0);
        assert_eq!(day.header().nbytes_frag, 7);

        // Larger payload moves to the end; the whole old region is freed
        put(&mut day, DAY + 10, 7, b"abcdefghijkl", PutMode::Over).unwrap();
        assert_eq!(day.refs()[0].offset, 10);
        assert_eq!(day.header().nbytes_frag, 10);

        let r = day.refs()[0];
        assert_eq!(day.read_stored(&r).unwrap(), b"abcdefghijkl");
    }

    #[test]
    fn test_once_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"kept", PutMode::Once).unwrap();
        let err = put(&mut day, DAY + 10, 7, b"other", PutMode::Once).unwrap_err();
        assert!(matches!(err, SpdbError::DuplicatePut { valid_time, data_type: 7, .. } if valid_time == DAY + 10));

        // Different type at the same time is not a duplicate
        put(&mut day, DAY + 10, 9, b"nine", PutMode::Once).unwrap();
        assert_eq!(day.refs().len(), 2);
    }

    #[test]
    fn test_add_keeps_insertion_order_at_equal_times() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 1, b"a", PutMode::Add).unwrap();
        put(&mut day, DAY + 5, 1, b"early", PutMode::Add).unwrap();
        put(&mut day, DAY + 10, 1, b"b", PutMode::Add).unwrap();
        put(&mut day, DAY + 10, 1, b"c", PutMode::Add).unwrap();

        let payloads: Vec<Vec<u8>> = day
            .refs()
            .to_vec()
            .iter()
            .map(|r| day.read_stored(r).unwrap())
            .collect();
        assert_eq!(payloads, vec![b"early".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_add_unique_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        assert_eq!(
            put(&mut day, DAY + 10, 7, b"same", PutMode::AddUnique).unwrap(),
            StoreOutcome::Inserted
        );
        assert_eq!(
            put(&mut day, DAY + 10, 7, b"same", PutMode::AddUnique).unwrap(),
            StoreOutcome::Unchanged
        );
        assert_eq!(
            put(&mut day, DAY + 10, 7, b"diff", PutMode::AddUnique).unwrap(),
            StoreOutcome::Inserted
        );
        assert_eq!(day.refs().len(), 2);
    }

    #[test]
    fn test_erase_matching_refs() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"seven", PutMode::Add).unwrap();
        put(&mut day, DAY + 10, 9, b"nine", PutMode::Add).unwrap();
        put(&mut day, DAY + 20, 7, b"later", PutMode::Add).unwrap();

        assert_eq!(day.erase(DAY + 10, 7, 0, false).unwrap(), 1);
        assert_eq!(day.refs().len(), 2);
        assert_eq!(day.header().nbytes_frag, 5);
        assert_eq!(day.erase(DAY + 10, 0, 0, false).unwrap(), 1);
        assert_eq!(day.erase(DAY + 10, 0, 0, false).unwrap(), 0);
        assert_eq!(day.refs()[0].valid_time, DAY + 20);
    }

    #[test]
    fn test_uncommitted_changes_are_discarded() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"committed", PutMode::Over).unwrap();
        day.commit(&config()).unwrap();
        let index_before = std::fs::read(dir.path().join("20240101.indx")).unwrap();

        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"new", PutMode::Over).unwrap();
        put(&mut day, DAY + 30, 7, b"appended", PutMode::Over).unwrap();
        drop(day);

        assert_eq!(std::fs::read(dir.path().join("20240101.indx")).unwrap(), index_before);
        assert_eq!(std::fs::read(dir.path().join("20240101.data")).unwrap(), b"committed");
    }

    #[test]
    fn test_product_mismatch() {
        let dir = tempdir().unwrap();
        let day = DayFile::open_write(dir.path(), DAY, 42, "mosaic", &config()).unwrap();
        day.commit(&config()).unwrap();

        let err = DayFile::open_write(dir.path(), DAY, 43, "mosaic", &config()).err().unwrap();
        assert!(matches!(err, SpdbError::ProductIdMismatch { stored_id: 42, .. }));
        let err = DayFile::open_write(dir.path(), DAY, 42, "other", &config()).err().unwrap();
        assert!(matches!(err, SpdbError::ProductIdMismatch { .. }));

        // Unset id/label on the caller side is accepted
        assert!(DayFile::open_write(dir.path(), DAY, 0, "", &config()).is_ok());
    }

    #[test]
    fn test_newer_minor_revision_not_rewritten() {
        let dir = tempdir().unwrap();
        let day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        day.commit(&config()).unwrap();

        let path = dir.path().join("20240101.indx");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10..12].copy_from_slice(&(MINOR_REVISION + 1).to_be_bytes());
        let body = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..body]);
        bytes[body..].copy_from_slice(&crc.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(DayFile::open_read(dir.path(), DAY, &config()).unwrap().is_some());
        let err = DayFile::open_write(dir.path(), DAY, 1, "", &config()).err().unwrap();
        assert!(matches!(err, SpdbError::CorruptOrUnsupportedHeader { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_minute_index_after_commit() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        for offset in [7200, 30, 3600, 3630, 86_399] {
            put(&mut day, DAY + offset, 1, b"x", PutMode::Add).unwrap();
        }
        day.commit(&config()).unwrap();

        let day = DayFile::open_read(dir.path(), DAY, &config()).unwrap().unwrap();
        let posn = &day.header().minute_posn;
        assert_eq!(posn.len(), MINS_PER_DAY);
        assert_eq!(posn[0], 0);
        assert_eq!(posn[1], 1);
        assert_eq!(posn[60], 1);
        assert_eq!(posn[61], 3);
        assert_eq!(posn[120], 3);
        assert_eq!(posn[121], 4);
        assert_eq!(posn[1439], 4);
    }

    #[test]
    fn test_defrag_compacts_data_file() {
        let dir = tempdir().unwrap();
        let mut cfg = config();
        cfg.enable_defrag = true;
        cfg.defrag_min_frag_bytes = 1;
        cfg.defrag_min_fraction = 0.01;

        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &cfg).unwrap();
        put(&mut day, DAY + 10, 1, b"aaaaaaaaaa", PutMode::Add).unwrap();
        put(&mut day, DAY + 20, 1, b"bbbbbbbbbb", PutMode::Add).unwrap();
        put(&mut day, DAY + 30, 1, b"cccccccccc", PutMode::Add).unwrap();
        day.commit(&cfg).unwrap();

        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &cfg).unwrap();
        day.erase(DAY + 20, 0, 0, false).unwrap();
        day.commit(&cfg).unwrap();

        let data = std::fs::read(dir.path().join("20240101.data")).unwrap();
        assert_eq!(data, b"aaaaaaaaaacccccccccc");
        let mut day = DayFile::open_read(dir.path(), DAY, &cfg).unwrap().unwrap();
        assert_eq!(day.header().nbytes_frag, 0);
        let r = day.refs()[1];
        assert_eq!(day.read_stored(&r).unwrap(), b"cccccccccc");
    }

    fn block_index_tmp(dir: &Path) {
        std::fs::create_dir(dir.join("20240101.indx.tmp")).unwrap();
    }

    fn read_all(dir: &Path) -> Vec<(i64, Vec<u8>)> {
        let mut day = DayFile::open_read(dir, DAY, &config()).unwrap().unwrap();
        day.refs()
            .to_vec()
            .iter()
            .map(|r| (r.valid_time - DAY, day.read_stored(r).unwrap()))
            .collect()
    }

    #[test]
    fn test_failed_defrag_commit_keeps_committed_day() {
        let dir = tempdir().unwrap();
        let mut cfg = config();
        cfg.enable_defrag = true;
        cfg.defrag_min_frag_bytes = 1;
        cfg.defrag_min_fraction = 0.01;

        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &cfg).unwrap();
        for (offset, fill) in [(10, b'a'), (20, b'b'), (30, b'c'), (40, b'd')] {
            put(&mut day, DAY + offset, 1, &[fill; 100], PutMode::Add).unwrap();
        }
        day.commit(&cfg).unwrap();
        let before = read_all(dir.path());
        let data_path = dir.path().join("20240101.data");
        let data_before = std::fs::read(&data_path).unwrap();

        block_index_tmp(dir.path());
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &cfg).unwrap();
        assert_eq!(day.erase(DAY + 20, 0, 0, false).unwrap(), 1);
        assert!(day.commit(&cfg).is_err());

        assert_eq!(read_all(dir.path()), before);
        assert_eq!(before[1], (20, vec![b'b'; 100]));
        assert_eq!(std::fs::read(&data_path).unwrap(), data_before);
        assert!(!dir.path().join("20240101.data.defrag").exists());
    }

    #[test]
    fn test_failed_commit_leaves_in_place_bytes_alone() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"0123456789", PutMode::Over).unwrap();
        day.commit(&config()).unwrap();

        block_index_tmp(dir.path());
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        assert_eq!(
            put(&mut day, DAY + 10, 7, b"abc", PutMode::Over).unwrap(),
            StoreOutcome::Replaced
        );
        put(&mut day, DAY + 20, 7, b"appended", PutMode::Over).unwrap();
        assert!(day.commit(&config()).is_err());

        assert_eq!(read_all(dir.path()), vec![(10, b"0123456789".to_vec())]);
        assert_eq!(std::fs::read(dir.path().join("20240101.data")).unwrap(), b"0123456789");
    }

    #[test]
    fn test_orphaned_tail_counts_as_fragmentation() {
        let dir = tempdir().unwrap();
        let mut day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        put(&mut day, DAY + 10, 7, b"abc", PutMode::Over).unwrap();
        day.commit(&config()).unwrap();

        // A writer that died after appending but before its index rename
        let mut data = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("20240101.data"))
            .unwrap();
        data.write_all(b"crashed").unwrap();
        drop(data);

        let day = DayFile::open_write(dir.path(), DAY, 1, "", &config()).unwrap();
        assert_eq!(day.header().nbytes_data, 3);
        assert_eq!(day.header().nbytes_frag, 7);
    }

    #[test]
    fn test_list_days_skips_foreign_files() {
        let dir = tempdir().unwrap();
        for t in [DAY, DAY + 2 * SECS_PER_DAY] {
            DayFile::open_write(dir.path(), t, 1, "", &config())
                .unwrap()
                .commit(&config())
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.indx"), b"junk").unwrap();
        std::fs::write(dir.path().join("_latest_data_info"), b"junk").unwrap();

        assert_eq!(list_days(dir.path()).unwrap(), vec![DAY, DAY + 2 * SECS_PER_DAY]);
    }
}
