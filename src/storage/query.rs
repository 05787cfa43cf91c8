//! Query kinds and the selection rules applied to fetched results

use crate::storage::types::{Chunk, UniqueMode};
use serde::Serialize;
use std::collections::HashMap;

/// One get request. Margins are in seconds; a negative margin is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    /// Chunks with `valid_time == time`
    Exact { time: i64 },
    /// Chunks at the accepted time nearest `time`; ties favor the later time
    Closest { time: i64, margin: i64 },
    /// Chunks with `start <= valid_time <= end`
    Interval { start: i64, end: i64 },
    /// Chunks with `valid_time <= time < expire_time`
    Valid { time: i64 },
    /// Interval `[latest - margin, latest]` around the newest accepted chunk
    Latest { margin: i64 },
    /// Chunks at the latest accepted time in `[time - margin, time]`
    FirstBefore { time: i64, margin: i64 },
    /// Chunks at the earliest accepted time in `[time, time + margin]`
    FirstAfter { time: i64, margin: i64 },
}

/// A day whose files could not be read during a multi-day query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDay {
    pub day_start: i64,
    pub error: String,
}

/// Pick between the nearest accepted times on either side of `t`
pub fn nearest_time(t: i64, before: Option<i64>, after: Option<i64>) -> Option<i64> {
    match (before, after) {
        (Some(b), Some(a)) => {
            if t.abs_diff(b) < a.abs_diff(t) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (b, a) => a.or(b),
    }
}

/// Collapse chunks sharing a non-zero data_type to the latest or earliest one.
///
/// `chunks` must be in valid_time order. Chunks with data_type 0 are kept.
pub fn make_unique(chunks: &mut Vec<Chunk>, mode: UniqueMode) {
    let mut keep_index: HashMap<i32, usize> = HashMap::new();
    match mode {
        UniqueMode::Off => return,
        UniqueMode::Latest => {
            for (i, chunk) in chunks.iter().enumerate() {
                keep_index.insert(chunk.data_type(), i);
            }
        }
        UniqueMode::Earliest => {
            for (i, chunk) in chunks.iter().enumerate() {
                keep_index.entry(chunk.data_type()).or_insert(i);
            }
        }
    }

    let mut i = 0;
    chunks.retain(|chunk| {
        let keep = chunk.data_type() == 0 || keep_index.get(&chunk.data_type()) == Some(&i);
        i += 1;
        keep
    });
}

/// Apply the minimum spacing rule to an ascending list of times.
///
/// 0 keeps duplicates, 1 removes them, larger values thin the list so that
/// consecutive kept times are at least `min_interval` apart.
pub fn thin_times(times: impl IntoIterator<Item = i64>, min_interval: i64) -> Vec<i64> {
    let mut out = Vec::new();
    let mut last: Option<i64> = None;
    for t in times {
        if last.map_or(true, |prev| t - prev >= min_interval) {
            out.push(t);
            last = Some(t);
        }
    }
    out
}
