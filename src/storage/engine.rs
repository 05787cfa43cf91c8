//! SPDB engine handle
//!
//! [`Spdb`] owns every per-caller setting: put mode, compression, type
//! matching, unique filtering, the write-time ceiling, the put buffer and the
//! last get result. There is no process-wide state; two handles in one
//! process coordinate only through the per-day file locks.
//!
//! - Put path: buffer → group by day → lock → store (per mode) → commit
//! - Get path: list days → shared lock → decode index → filter refs → read chunks

use crate::storage::codec::Header;
use crate::storage::compression::{decompress, encode_for_store, Compression};
use crate::storage::day_file::{self, list_days, DayFile, DayPaths, StoreOutcome};
use crate::storage::error::{SpdbError, SpdbResult};
use crate::storage::query::{make_unique, nearest_time, thin_times, FailedDay, Query};
use crate::storage::types::{
    day_start, Chunk, ChunkRef, DbTimes, GetOptions, LeadTimeStorage, PutChunk, PutMode,
    UniqueMode, SECS_PER_DAY,
};
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

/// Engine tunables
#[derive(Debug, Clone, PartialEq)]
pub struct SpdbConfig {
    /// How long a writer waits for a day's exclusive lock
    pub lock_timeout: Duration,
    /// How long a reader waits for a shared lock before reading unlocked
    pub read_lock_timeout: Duration,
    /// Sleep between lock attempts
    pub lock_retry_interval: Duration,
    /// Readers skip locking entirely
    pub allow_no_lock: bool,
    /// Compact data files on commit when fragmentation crosses the thresholds
    pub enable_defrag: bool,
    pub defrag_min_frag_bytes: u64,
    pub defrag_min_fraction: f64,
    /// Fragmentation fraction that forces a compaction regardless of size
    pub defrag_force_fraction: f64,
    /// Days before the request day searched by valid-time queries
    pub valid_lookback_days: u32,
}

impl Default for SpdbConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            read_lock_timeout: Duration::from_millis(1000),
            lock_retry_interval: Duration::from_millis(50),
            allow_no_lock: false,
            enable_defrag: false,
            defrag_min_frag_bytes: 10_000,
            defrag_min_fraction: 0.05,
            defrag_force_fraction: 0.3,
            valid_lookback_days: 3,
        }
    }
}

impl SpdbConfig {
    /// Whether a day with these byte counts is fragmented enough to compact
    pub fn should_defrag(&self, nbytes_data: u64, nbytes_frag: u64) -> bool {
        let total = nbytes_data + nbytes_frag;
        if nbytes_frag == 0 || total == 0 {
            return false;
        }
        let frac = nbytes_frag as f64 / total as f64;
        (nbytes_frag >= self.defrag_min_frag_bytes && frac >= self.defrag_min_fraction)
            || frac >= self.defrag_force_fraction
    }
}

/// Handle onto SPDB directories
#[derive(Debug)]
pub struct Spdb {
    config: SpdbConfig,

    put_mode: PutMode,
    compress_on_put: Compression,
    respect_zero_types_on_put: bool,
    lead_time_storage: Option<LeadTimeStorage>,
    info: Option<String>,
    prod_id: i32,
    prod_label: String,
    put_chunks: Vec<PutChunk>,
    latest_valid_time_put: Option<i64>,

    uncompress_on_get: bool,
    unique: UniqueMode,
    write_time_ceiling: Option<i64>,
    aux_xml: String,
    chunks: Vec<Chunk>,
    time_list: Vec<i64>,
    failed_days: Vec<FailedDay>,
}

impl Default for Spdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Spdb {
    pub fn new() -> Self {
        Self::with_config(SpdbConfig::default())
    }

    pub fn with_config(config: SpdbConfig) -> Self {
        Self {
            config,
            put_mode: PutMode::default(),
            compress_on_put: Compression::None,
            respect_zero_types_on_put: false,
            lead_time_storage: None,
            info: None,
            prod_id: 0,
            prod_label: String::new(),
            put_chunks: Vec::new(),
            latest_valid_time_put: None,
            uncompress_on_get: true,
            unique: UniqueMode::Off,
            write_time_ceiling: None,
            aux_xml: String::new(),
            chunks: Vec::new(),
            time_list: Vec::new(),
            failed_days: Vec::new(),
        }
    }

    pub fn config(&self) -> &SpdbConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Settings

    pub fn set_put_mode(&mut self, mode: PutMode) {
        self.put_mode = mode;
    }

    pub fn put_mode(&self) -> PutMode {
        self.put_mode
    }

    pub fn set_chunk_compress_on_put(&mut self, compression: Compression) {
        self.compress_on_put = compression;
    }

    pub fn set_chunk_uncompress_on_get(&mut self, uncompress: bool) {
        self.uncompress_on_get = uncompress;
    }

    /// Match data_type 0 literally when putting and erasing
    pub fn set_respect_zero_types_on_put(&mut self, respect: bool) {
        self.respect_zero_types_on_put = respect;
    }

    pub fn set_lead_time_storage(&mut self, storage: LeadTimeStorage) {
        self.lead_time_storage = Some(storage);
    }

    /// Free-form info string written to every day header on put
    pub fn set_info(&mut self, info: impl Into<String>) {
        self.info = Some(info.into());
    }

    /// Product used by erase; refreshed from headers read by gets
    pub fn set_prod_id(&mut self, prod_id: i32, prod_label: impl Into<String>) {
        self.prod_id = prod_id;
        self.prod_label = prod_label.into();
    }

    pub fn prod_id(&self) -> i32 {
        self.prod_id
    }

    pub fn prod_label(&self) -> &str {
        &self.prod_label
    }

    pub fn set_unique(&mut self, mode: UniqueMode) {
        self.unique = mode;
    }

    /// Only return chunks written at or before `write_time`
    pub fn set_check_write_time_on_get(&mut self, write_time: i64) {
        self.write_time_ceiling = Some(write_time);
    }

    pub fn clear_check_write_time_on_get(&mut self) {
        self.write_time_ceiling = None;
    }

    /// Opaque side-channel text carried for clients; never interpreted here
    pub fn set_aux_xml(&mut self, xml: impl Into<String>) {
        self.aux_xml = xml.into();
    }

    pub fn clear_aux_xml(&mut self) {
        self.aux_xml.clear();
    }

    pub fn aux_xml(&self) -> &str {
        &self.aux_xml
    }

    // ------------------------------------------------------------------
    // Put

    /// Empty the put buffer and reset zero-type matching
    pub fn clear_put_chunks(&mut self) {
        self.put_chunks.clear();
        self.respect_zero_types_on_put = false;
    }

    /// Queue a chunk, stamping its write time now unless it carries one
    pub fn add_put_chunk(&mut self, mut chunk: PutChunk) {
        if chunk.write_time.is_none() {
            chunk.write_time = Some(chrono::Utc::now().timestamp());
        }
        self.put_chunks.push(chunk);
    }

    pub fn put_chunks(&self) -> &[PutChunk] {
        &self.put_chunks
    }

    /// Store every queued chunk under `dir`.
    ///
    /// Chunks are applied in buffer order; each day is committed before the
    /// next one is opened. On error the day in progress is left untouched,
    /// while days committed earlier in the same call stay committed.
    pub fn put(&mut self, dir: impl AsRef<Path>, prod_id: i32, prod_label: &str) -> SpdbResult<()> {
        let dir = dir.as_ref();
        self.latest_valid_time_put = None;
        if self.put_chunks.is_empty() {
            return Ok(());
        }

        let mut current: Option<(i64, DayFile)> = None;
        let mut latest: Option<i64> = None;
        let (mut inserted, mut replaced, mut unchanged) = (0usize, 0usize, 0usize);

        for chunk in &self.put_chunks {
            let day = day_start(chunk.valid_time);
            if current.as_ref().map(|(d, _)| *d) != Some(day) {
                if let Some((_, file)) = current.take() {
                    file.commit(&self.config)?;
                }
                let mut file = DayFile::open_write(dir, chunk.valid_time, prod_id, prod_label, &self.config)?;
                if let Some(info) = &self.info {
                    file.header_mut().info = info.clone();
                }
                if let Some(storage) = self.lead_time_storage {
                    file.header_mut().lead_time_storage = storage;
                }
                current = Some((day, file));
            }
            let Some((_, file)) = current.as_mut() else {
                continue;
            };

            let (compression, stored) = encode_for_store(self.compress_on_put, &chunk.data)?;
            let write_time = chunk
                .write_time
                .unwrap_or_else(|| chrono::Utc::now().timestamp());
            match file.store_chunk(
                chunk,
                compression,
                &stored,
                write_time,
                self.put_mode,
                self.respect_zero_types_on_put,
            )? {
                StoreOutcome::Inserted => inserted += 1,
                StoreOutcome::Replaced => replaced += 1,
                StoreOutcome::Unchanged => unchanged += 1,
            }
            latest = latest.max(Some(chunk.valid_time));
        }

        if let Some((_, file)) = current.take() {
            file.commit(&self.config)?;
        }

        self.latest_valid_time_put = latest;
        tracing::info!(
            "Put {} chunks to {:?}: {} inserted, {} replaced, {} unchanged",
            self.put_chunks.len(),
            dir,
            inserted,
            replaced,
            unchanged
        );
        Ok(())
    }

    /// Put a single chunk, replacing the buffer
    pub fn put_chunk(
        &mut self,
        dir: impl AsRef<Path>,
        prod_id: i32,
        prod_label: &str,
        chunk: PutChunk,
    ) -> SpdbResult<()> {
        self.put_chunks.clear();
        self.add_put_chunk(chunk);
        self.put(dir, prod_id, prod_label)
    }

    /// Largest valid time stored by the last successful put
    pub fn latest_valid_time_put(&self) -> Option<i64> {
        self.latest_valid_time_put
    }

    // ------------------------------------------------------------------
    // Erase

    /// Remove chunks at `valid_time` matching the types. Returns how many went.
    pub fn erase(
        &mut self,
        dir: impl AsRef<Path>,
        valid_time: i64,
        data_type: i32,
        data_type2: i32,
    ) -> SpdbResult<usize> {
        let dir = dir.as_ref();
        if !DayPaths::for_time(dir, valid_time)?.index.exists() {
            return Ok(0);
        }

        let mut file = DayFile::open_write(dir, valid_time, self.prod_id, &self.prod_label, &self.config)?;
        let erased = file.erase(valid_time, data_type, data_type2, self.respect_zero_types_on_put)?;
        if erased > 0 {
            file.commit(&self.config)?;
            tracing::debug!("Erased {} chunks at {} from {:?}", erased, valid_time, dir);
        }
        Ok(erased)
    }

    /// Erase every (time, types) currently in the put buffer
    pub fn erase_put_chunks(&mut self, dir: impl AsRef<Path>) -> SpdbResult<usize> {
        let dir = dir.as_ref();
        let targets: Vec<(i64, i32, i32)> = self
            .put_chunks
            .iter()
            .map(|c| (c.valid_time, c.data_type, c.data_type2))
            .collect();
        let mut total = 0;
        for (t, data_type, data_type2) in targets {
            total += self.erase(dir, t, data_type, data_type2)?;
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Get

    /// Run any query; the result is also kept for [`Spdb::chunks`]
    pub fn get(&mut self, dir: impl AsRef<Path>, query: Query, opts: GetOptions) -> SpdbResult<&[Chunk]> {
        let dir = dir.as_ref();
        self.chunks.clear();
        self.failed_days.clear();

        let mut failed = Vec::new();
        let mut chunks = match query {
            Query::Exact { time } => self.fetch_exact(dir, time, &opts)?,
            Query::Interval { start, end } => self.fetch_interval(dir, start, end, &opts, &mut failed)?,
            Query::Valid { time } => self.fetch_valid(dir, time, &opts, &mut failed)?,
            Query::Closest { time, margin } => {
                let before = self.time_before(dir, time, margin, &opts, &mut failed)?;
                let after = self.time_after(dir, time, margin, &opts, &mut failed)?;
                self.fetch_at(dir, nearest_time(time, before, after), &opts, &mut failed)?
            }
            Query::Latest { margin } => match self.latest_time(dir, &opts, &mut failed)? {
                Some(latest) => {
                    self.fetch_interval(dir, latest.saturating_sub(margin.max(0)), latest, &opts, &mut failed)?
                }
                None => Vec::new(),
            },
            Query::FirstBefore { time, margin } => {
                let found = self.time_before(dir, time, margin, &opts, &mut failed)?;
                self.fetch_at(dir, found, &opts, &mut failed)?
            }
            Query::FirstAfter { time, margin } => {
                let found = self.time_after(dir, time, margin, &opts, &mut failed)?;
                self.fetch_at(dir, found, &opts, &mut failed)?
            }
        };

        make_unique(&mut chunks, self.unique);
        for f in &failed {
            tracing::warn!("Skipped day {} in {:?}: {}", f.day_start, dir, f.error);
        }
        tracing::debug!("{:?} on {:?} returned {} chunks", query, dir, chunks.len());

        self.chunks = chunks;
        self.failed_days = failed;
        Ok(&self.chunks)
    }

    pub fn get_exact(&mut self, dir: impl AsRef<Path>, time: i64, opts: GetOptions) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::Exact { time }, opts)
    }

    pub fn get_closest(
        &mut self,
        dir: impl AsRef<Path>,
        time: i64,
        margin: i64,
        opts: GetOptions,
    ) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::Closest { time, margin }, opts)
    }

    pub fn get_interval(
        &mut self,
        dir: impl AsRef<Path>,
        start: i64,
        end: i64,
        opts: GetOptions,
    ) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::Interval { start, end }, opts)
    }

    pub fn get_valid(&mut self, dir: impl AsRef<Path>, time: i64, opts: GetOptions) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::Valid { time }, opts)
    }

    pub fn get_latest(&mut self, dir: impl AsRef<Path>, margin: i64, opts: GetOptions) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::Latest { margin }, opts)
    }

    pub fn get_first_before(
        &mut self,
        dir: impl AsRef<Path>,
        time: i64,
        margin: i64,
        opts: GetOptions,
    ) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::FirstBefore { time, margin }, opts)
    }

    pub fn get_first_after(
        &mut self,
        dir: impl AsRef<Path>,
        time: i64,
        margin: i64,
        opts: GetOptions,
    ) -> SpdbResult<&[Chunk]> {
        self.get(dir, Query::FirstAfter { time, margin }, opts)
    }

    /// Result of the last get
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk_refs(&self) -> Vec<ChunkRef> {
        self.chunks.iter().map(|c| c.chunk_ref).collect()
    }

    pub fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Days skipped by the last multi-day get
    pub fn failed_days(&self) -> &[FailedDay] {
        &self.failed_days
    }

    pub fn make_unique_latest(&mut self) {
        make_unique(&mut self.chunks, UniqueMode::Latest);
    }

    pub fn make_unique_earliest(&mut self) {
        make_unique(&mut self.chunks, UniqueMode::Earliest);
    }

    /// Decompress chunks fetched with auto-uncompress turned off
    pub fn uncompress_get_chunks(&mut self) -> SpdbResult<()> {
        for chunk in &mut self.chunks {
            if chunk.compression.is_compressed() && !chunk.data.is_empty() {
                chunk.data = decompress(chunk.compression, &chunk.data)?;
                chunk.compression = Compression::None;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Times and headers

    /// Valid times in `[start, end]` across all days, thinned by `min_interval`
    pub fn compile_time_list(
        &mut self,
        dir: impl AsRef<Path>,
        start: i64,
        end: i64,
        min_interval: i64,
    ) -> SpdbResult<&[i64]> {
        let dir = dir.as_ref();
        self.time_list.clear();
        self.failed_days.clear();

        let ceiling = self.write_time_ceiling;
        let days = days_overlapping(dir, start, end)?;
        let mut times = Vec::new();
        let mut failed = Vec::new();
        self.for_each_day(dir, &days, &mut failed, |file| {
            let index = file.index();
            times.extend(
                index.refs[index.range(start, end)]
                    .iter()
                    .filter(|r| ceiling.map_or(true, |c| r.write_time <= c))
                    .map(|r| r.valid_time),
            );
            Ok(ControlFlow::Continue(()))
        })?;

        self.time_list = thin_times(times, min_interval);
        self.failed_days = failed;
        Ok(&self.time_list)
    }

    pub fn time_list(&self) -> &[i64] {
        &self.time_list
    }

    /// First and last valid times in the database, respecting the write-time ceiling
    pub fn get_times(&mut self, dir: impl AsRef<Path>) -> SpdbResult<DbTimes> {
        let dir = dir.as_ref();
        let days = list_days(dir)?;
        let mut failed = Vec::new();

        let mut first_time = None;
        self.for_each_day(dir, &days, &mut failed, |file| {
            if file.refs().is_empty() {
                return Ok(ControlFlow::Continue(()));
            }
            first_time = Some(file.header().start_valid);
            Ok(ControlFlow::Break(()))
        })?;

        let mut last_time = None;
        let newest_first: Vec<i64> = days.iter().rev().copied().collect();
        self.for_each_day(dir, &newest_first, &mut failed, |file| {
            if file.refs().is_empty() {
                return Ok(ControlFlow::Continue(()));
            }
            last_time = Some(file.header().end_valid);
            Ok(ControlFlow::Break(()))
        })?;

        let mut last_valid_time = self.latest_time(dir, &GetOptions::default(), &mut failed)?;
        self.failed_days = failed;

        if let Some(ceiling) = self.write_time_ceiling {
            if first_time.is_some_and(|t| t > ceiling) {
                return Ok(DbTimes::default());
            }
            last_time = last_time.map(|t| t.min(ceiling));
            last_valid_time = last_valid_time.map(|t| t.min(ceiling));
        }

        Ok(DbTimes {
            first_time,
            last_time,
            last_valid_time,
        })
    }

    /// Header of the day containing `time`, if that day exists
    pub fn header_info(&mut self, dir: impl AsRef<Path>, time: i64) -> SpdbResult<Option<Header>> {
        let file = DayFile::open_read(dir.as_ref(), time, &self.config)?;
        Ok(file.map(|f| {
            self.adopt_product(f.header());
            f.header().clone()
        }))
    }

    // ------------------------------------------------------------------
    // Internals

    /// Visit readable days in the order given, recording days that fail
    fn for_each_day<F>(
        &self,
        dir: &Path,
        days: &[i64],
        failed: &mut Vec<FailedDay>,
        mut visit: F,
    ) -> SpdbResult<()>
    where
        F: FnMut(&mut DayFile) -> SpdbResult<ControlFlow<()>>,
    {
        day_file::check_dir(dir)?;
        for &day in days {
            let mut file = match DayFile::open_read(dir, day, &self.config) {
                Ok(Some(file)) => file,
                Ok(None) => continue,
                Err(e) => {
                    failed.push(FailedDay {
                        day_start: day,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            match visit(&mut file) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => failed.push(FailedDay {
                    day_start: day,
                    error: e.to_string(),
                }),
            }
        }
        Ok(())
    }

    fn adopt_product(&mut self, header: &Header) {
        if header.prod_id != 0 {
            self.prod_id = header.prod_id;
            self.prod_label = header.prod_label.clone();
        }
        if header.lead_time_storage != LeadTimeStorage::NotApplicable {
            self.lead_time_storage = Some(header.lead_time_storage);
        }
    }

    fn fetch_exact(&mut self, dir: &Path, time: i64, opts: &GetOptions) -> SpdbResult<Vec<Chunk>> {
        let Some(mut file) = DayFile::open_read(dir, time, &self.config)? else {
            return Ok(Vec::new());
        };
        self.adopt_product(file.header());
        let range = file.index().range(time, time);
        load_accepted(&mut file, range, opts, self.write_time_ceiling, self.uncompress_on_get)
    }

    fn fetch_interval(
        &self,
        dir: &Path,
        start: i64,
        end: i64,
        opts: &GetOptions,
        failed: &mut Vec<FailedDay>,
    ) -> SpdbResult<Vec<Chunk>> {
        let days = days_overlapping(dir, start, end)?;
        let mut out = Vec::new();
        self.for_each_day(dir, &days, failed, |file| {
            let range = file.index().range(start, end);
            out.extend(load_accepted(file, range, opts, self.write_time_ceiling, self.uncompress_on_get)?);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(out)
    }

    fn fetch_valid(
        &self,
        dir: &Path,
        time: i64,
        opts: &GetOptions,
        failed: &mut Vec<FailedDay>,
    ) -> SpdbResult<Vec<Chunk>> {
        let lookback = i64::from(self.config.valid_lookback_days) * SECS_PER_DAY;
        let days = days_overlapping(dir, day_start(time).saturating_sub(lookback), time)?;
        let mut out = Vec::new();
        self.for_each_day(dir, &days, failed, |file| {
            if file.header().latest_expire <= time {
                return Ok(ControlFlow::Continue(()));
            }
            let index = file.index();
            let hits: Vec<usize> = index
                .range(i64::MIN, time)
                .filter(|&i| index.refs[i].expire_time > time)
                .collect();
            out.extend(load_accepted(file, hits, opts, self.write_time_ceiling, self.uncompress_on_get)?);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(out)
    }

    /// All accepted chunks at exactly `time`, if one was found
    fn fetch_at(
        &self,
        dir: &Path,
        time: Option<i64>,
        opts: &GetOptions,
        failed: &mut Vec<FailedDay>,
    ) -> SpdbResult<Vec<Chunk>> {
        match time {
            Some(t) => self.fetch_interval(dir, t, t, opts, failed),
            None => Ok(Vec::new()),
        }
    }

    /// Latest accepted valid time in `[time - margin, time]`
    fn time_before(
        &self,
        dir: &Path,
        time: i64,
        margin: i64,
        opts: &GetOptions,
        failed: &mut Vec<FailedDay>,
    ) -> SpdbResult<Option<i64>> {
        let lower = if margin < 0 { i64::MIN } else { time.saturating_sub(margin) };
        let mut days = days_overlapping(dir, lower, time)?;
        days.reverse();

        let ceiling = self.write_time_ceiling;
        let mut found = None;
        self.for_each_day(dir, &days, failed, |file| {
            let index = file.index();
            found = index.refs[index.range(lower, time)]
                .iter()
                .rev()
                .find(|r| opts.accepts(r, ceiling))
                .map(|r| r.valid_time);
            Ok(if found.is_some() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })?;
        Ok(found)
    }

    /// Earliest accepted valid time in `[time, time + margin]`
    fn time_after(
        &self,
        dir: &Path,
        time: i64,
        margin: i64,
        opts: &GetOptions,
        failed: &mut Vec<FailedDay>,
    ) -> SpdbResult<Option<i64>> {
        let upper = if margin < 0 { i64::MAX } else { time.saturating_add(margin) };
        let days = days_overlapping(dir, time, upper)?;

        let ceiling = self.write_time_ceiling;
        let mut found = None;
        self.for_each_day(dir, &days, failed, |file| {
            let index = file.index();
            found = index.refs[index.range(time, upper)]
                .iter()
                .find(|r| opts.accepts(r, ceiling))
                .map(|r| r.valid_time);
            Ok(if found.is_some() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })?;
        Ok(found)
    }

    /// Newest accepted valid time anywhere in the database
    fn latest_time(
        &self,
        dir: &Path,
        opts: &GetOptions,
        failed: &mut Vec<FailedDay>,
    ) -> SpdbResult<Option<i64>> {
        self.time_before(dir, i64::MAX, -1, opts, failed)
    }
}

/// Existing days that can hold valid times in `[start, end]`, ascending
fn days_overlapping(dir: &Path, start: i64, end: i64) -> SpdbResult<Vec<i64>> {
    Ok(list_days(dir)?
        .into_iter()
        .filter(|&d| d + SECS_PER_DAY > start && d <= end)
        .collect())
}

/// Load chunks at `positions` that pass the filter
fn load_accepted(
    file: &mut DayFile,
    positions: impl IntoIterator<Item = usize>,
    opts: &GetOptions,
    write_time_ceiling: Option<i64>,
    uncompress: bool,
) -> SpdbResult<Vec<Chunk>> {
    let mut out = Vec::new();
    for i in positions {
        let chunk_ref = file.refs()[i];
        if !opts.accepts(&chunk_ref, write_time_ceiling) {
            continue;
        }
        let aux = file.index().aux_for(&chunk_ref);
        if opts.refs_only {
            out.push(Chunk {
                chunk_ref,
                compression: aux.compression,
                aux,
                data: Vec::new(),
            });
            continue;
        }

        let stored = file.read_stored(&chunk_ref)?;
        let (data, compression) = if uncompress && aux.compression.is_compressed() {
            (decompress(aux.compression, &stored)?, Compression::None)
        } else {
            (stored, aux.compression)
        };
        out.push(Chunk {
            chunk_ref,
            aux,
            data,
            compression,
        });
    }
    Ok(out)
}
