//! Index file format for SPDB day files
//!
//! One index file per UTC day holds the header, the chunk-ref array and the
//! aux-ref array. Every integer is big-endian; strings are NUL padded.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (6080 bytes)                          │
//! │   magic: [u8; 8] = "SPDBINDX"                │
//! │   major, minor revision: u16, u16            │
//! │   prod_id: i32                               │
//! │   lead_time_storage: i32                     │
//! │   n_chunks, n_aux: u32, u32                  │
//! │   prod_label: [u8; 64]                       │
//! │   info: [u8; 128]                            │
//! │   nbytes_data, nbytes_frag: u64, u64         │
//! │   max_duration .. latest_write: 8 x i64      │
//! │   spare: [u8; 20]                            │
//! │   minute_posn: [i32; 1440]                   │
//! ├──────────────────────────────────────────────┤
//! │ CHUNK REFS (48 bytes each)                   │
//! │   data_type, data_type2: i32, i32            │
//! │   valid, expire, write: i64 x 3              │
//! │   offset: u64, len: u32, aux_index: u32      │
//! ├──────────────────────────────────────────────┤
//! │ AUX REFS (72 bytes each)                     │
//! │   compression: u32, spare: u32, tag: [u8;64] │
//! ├──────────────────────────────────────────────┤
//! │ crc32 of everything above: u32               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Counts are validated against the buffer length before any ref is read.

use crate::storage::compression::Compression;
use crate::storage::error::{SpdbError, SpdbResult};
use crate::storage::types::{
    AuxRef, ChunkRef, LeadTimeStorage, MINS_PER_DAY, SECS_PER_DAY, TAG_LEN,
};
use serde::Serialize;
use std::ops::Range;
use std::path::Path;

/// Magic bytes identifying an index file
pub const INDEX_MAGIC: [u8; 8] = *b"SPDBINDX";

/// Revision written by this codec
pub const MAJOR_REVISION: u16 = 2;
pub const MINOR_REVISION: u16 = 0;

pub const LABEL_LEN: usize = 64;
pub const INFO_LEN: usize = 128;

pub const HEADER_SIZE: usize = 320 + MINS_PER_DAY * 4;
pub const REF_SIZE: usize = 48;
pub const AUX_SIZE: usize = 8 + TAG_LEN;
const CHECKSUM_SIZE: usize = 4;

/// Decoded day header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub major_revision: u16,
    pub minor_revision: u16,
    pub prod_id: i32,
    pub prod_label: String,
    pub info: String,
    pub lead_time_storage: LeadTimeStorage,
    /// Bytes held by live chunks
    pub nbytes_data: u64,
    /// Bytes in holes left by overwrites and erases
    pub nbytes_frag: u64,
    /// Largest `expire_time - valid_time` in the day
    pub max_duration: i64,
    pub start_of_day: i64,
    pub end_of_day: i64,
    pub start_valid: i64,
    pub end_valid: i64,
    /// Earliest valid time among chunks still valid after the end of the day
    pub earliest_valid: i64,
    pub latest_expire: i64,
    /// Wall-clock time of the last committed rewrite
    pub latest_write: i64,
    #[serde(skip)]
    pub minute_posn: Vec<i32>,
}

impl Header {
    /// Empty header for the day starting at `start_of_day`
    pub fn new(start_of_day: i64, prod_id: i32, prod_label: &str) -> Self {
        Self {
            major_revision: MAJOR_REVISION,
            minor_revision: MINOR_REVISION,
            prod_id,
            prod_label: truncate_to(prod_label, LABEL_LEN - 1),
            info: String::new(),
            lead_time_storage: LeadTimeStorage::NotApplicable,
            nbytes_data: 0,
            nbytes_frag: 0,
            max_duration: 0,
            start_of_day,
            end_of_day: start_of_day + SECS_PER_DAY - 1,
            start_valid: 0,
            end_valid: 0,
            earliest_valid: 0,
            latest_expire: 0,
            latest_write: 0,
            minute_posn: vec![-1; MINS_PER_DAY],
        }
    }

    /// Written by a newer engine; readable, but must not be rewritten
    pub fn is_newer_than_supported(&self) -> bool {
        (self.major_revision, self.minor_revision) > (MAJOR_REVISION, MINOR_REVISION)
    }
}

/// A whole decoded index file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    pub header: Header,
    pub refs: Vec<ChunkRef>,
    pub aux: Vec<AuxRef>,
}

impl IndexFile {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            refs: Vec::new(),
            aux: Vec::new(),
        }
    }

    pub fn n_chunks(&self) -> usize {
        self.refs.len()
    }

    /// Aux ref belonging to `chunk_ref`
    pub fn aux_for(&self, chunk_ref: &ChunkRef) -> AuxRef {
        self.aux
            .get(chunk_ref.aux_index as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Rebuild every derived header field from the ref array.
    ///
    /// `refs` and `aux` must be parallel; aux indices are renumbered to match.
    pub fn recompute(&mut self) {
        for (i, r) in self.refs.iter_mut().enumerate() {
            r.aux_index = i as u32;
        }

        let hdr = &mut self.header;
        hdr.nbytes_data = self.refs.iter().map(|r| u64::from(r.len)).sum();
        hdr.max_duration = self
            .refs
            .iter()
            .map(|r| r.expire_time - r.valid_time)
            .max()
            .unwrap_or(0);
        hdr.start_valid = self.refs.first().map(|r| r.valid_time).unwrap_or(0);
        hdr.end_valid = self.refs.last().map(|r| r.valid_time).unwrap_or(0);
        hdr.latest_expire = self.refs.iter().map(|r| r.expire_time).max().unwrap_or(0);
        hdr.earliest_valid = self
            .refs
            .iter()
            .filter(|r| r.expire_time > hdr.end_of_day)
            .map(|r| r.valid_time)
            .min()
            .unwrap_or(0);
        hdr.minute_posn = compute_minute_posn(&self.refs, hdr.start_of_day);
    }

    /// Index of the first ref with `valid_time >= t`, located via the minute index
    pub fn lower_bound(&self, t: i64) -> usize {
        let n = self.refs.len();
        let sod = self.header.start_of_day;
        if t <= sod {
            return 0;
        }
        let minute = (t.saturating_sub(sod) / 60) as usize;
        let mut i = match self.header.minute_posn.get(minute) {
            Some(&p) if p >= 0 => p as usize,
            Some(_) => return n,
            None => return n,
        };
        while i < n && self.refs[i].valid_time < t {
            i += 1;
        }
        i
    }

    /// Positions of refs with `start <= valid_time <= end`
    pub fn range(&self, start: i64, end: i64) -> Range<usize> {
        if start > end {
            return 0..0;
        }
        let lo = self.lower_bound(start);
        let mut hi = lo;
        while hi < self.refs.len() && self.refs[hi].valid_time <= end {
            hi += 1;
        }
        lo..hi
    }

    /// Serialize at the current revision
    pub fn encode(&self) -> Vec<u8> {
        let n = self.refs.len();
        let mut buf =
            Vec::with_capacity(HEADER_SIZE + n * REF_SIZE + self.aux.len() * AUX_SIZE + CHECKSUM_SIZE);
        let hdr = &self.header;

        buf.extend_from_slice(&INDEX_MAGIC);
        buf.extend_from_slice(&MAJOR_REVISION.to_be_bytes());
        buf.extend_from_slice(&MINOR_REVISION.to_be_bytes());
        buf.extend_from_slice(&hdr.prod_id.to_be_bytes());
        buf.extend_from_slice(&(hdr.lead_time_storage as i32).to_be_bytes());
        buf.extend_from_slice(&(n as u32).to_be_bytes());
        buf.extend_from_slice(&(self.aux.len() as u32).to_be_bytes());
        put_fixed_str(&mut buf, &hdr.prod_label, LABEL_LEN);
        put_fixed_str(&mut buf, &hdr.info, INFO_LEN);
        buf.extend_from_slice(&hdr.nbytes_data.to_be_bytes());
        buf.extend_from_slice(&hdr.nbytes_frag.to_be_bytes());
        for t in [
            hdr.max_duration,
            hdr.start_of_day,
            hdr.end_of_day,
            hdr.start_valid,
            hdr.end_valid,
            hdr.earliest_valid,
            hdr.latest_expire,
            hdr.latest_write,
        ] {
            buf.extend_from_slice(&t.to_be_bytes());
        }
        buf.resize(320, 0);
        for m in 0..MINS_PER_DAY {
            let p = hdr.minute_posn.get(m).copied().unwrap_or(-1);
            buf.extend_from_slice(&p.to_be_bytes());
        }

        for r in &self.refs {
            buf.extend_from_slice(&r.data_type.to_be_bytes());
            buf.extend_from_slice(&r.data_type2.to_be_bytes());
            buf.extend_from_slice(&r.valid_time.to_be_bytes());
            buf.extend_from_slice(&r.expire_time.to_be_bytes());
            buf.extend_from_slice(&r.write_time.to_be_bytes());
            buf.extend_from_slice(&r.offset.to_be_bytes());
            buf.extend_from_slice(&r.len.to_be_bytes());
            buf.extend_from_slice(&r.aux_index.to_be_bytes());
        }

        for a in &self.aux {
            buf.extend_from_slice(&(a.compression as u32).to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            put_fixed_str(&mut buf, a.tag.as_deref().unwrap_or(""), TAG_LEN);
        }

        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Parse and validate an index file read from `path`
    pub fn decode(buf: &[u8], path: &Path) -> SpdbResult<Self> {
        let corrupt = |reason: String| SpdbError::corrupt(path, reason);

        if buf.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(corrupt(format!("truncated index: {} bytes", buf.len())));
        }
        if buf[0..8] != INDEX_MAGIC {
            return Err(corrupt(format!("invalid magic: {:?}", &buf[0..8])));
        }

        let mut rd = ByteReader::new(buf);
        rd.skip(8);
        let major_revision = rd.u16();
        let minor_revision = rd.u16();
        if major_revision != MAJOR_REVISION {
            return Err(corrupt(format!(
                "unsupported revision {}.{} (this engine reads {}.x)",
                major_revision, minor_revision, MAJOR_REVISION
            )));
        }

        let prod_id = rd.i32();
        let lead_time_storage = LeadTimeStorage::try_from(rd.i32()).map_err(corrupt)?;
        let n_chunks = rd.u32() as usize;
        let n_aux = rd.u32() as usize;
        if n_chunks != n_aux {
            return Err(corrupt(format!(
                "ref count {} does not match aux count {}",
                n_chunks, n_aux
            )));
        }

        let expected = (n_chunks as u64) * (REF_SIZE + AUX_SIZE) as u64
            + (HEADER_SIZE + CHECKSUM_SIZE) as u64;
        if buf.len() as u64 != expected {
            return Err(corrupt(format!(
                "size {} does not match {} declared chunks (expected {})",
                buf.len(),
                n_chunks,
                expected
            )));
        }

        let body_len = buf.len() - CHECKSUM_SIZE;
        let stored_checksum = u32::from_be_bytes([
            buf[body_len],
            buf[body_len + 1],
            buf[body_len + 2],
            buf[body_len + 3],
        ]);
        let computed_checksum = crc32fast::hash(&buf[..body_len]);
        if stored_checksum != computed_checksum {
            return Err(corrupt(format!(
                "checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        let prod_label = rd.fixed_str(LABEL_LEN);
        let info = rd.fixed_str(INFO_LEN);
        let nbytes_data = rd.u64();
        let nbytes_frag = rd.u64();
        let max_duration = rd.i64();
        let start_of_day = rd.i64();
        let end_of_day = rd.i64();
        let start_valid = rd.i64();
        let end_valid = rd.i64();
        let earliest_valid = rd.i64();
        let latest_expire = rd.i64();
        let latest_write = rd.i64();
        rd.skip(320 - rd.pos);

        let mut minute_posn = Vec::with_capacity(MINS_PER_DAY);
        for m in 0..MINS_PER_DAY {
            let p = rd.i32();
            if p < -1 || (p >= 0 && p as usize >= n_chunks) {
                return Err(corrupt(format!("minute_posn[{}] = {} out of range", m, p)));
            }
            minute_posn.push(p);
        }

        let mut refs: Vec<ChunkRef> = Vec::with_capacity(n_chunks);
        for i in 0..n_chunks {
            let r = ChunkRef {
                data_type: rd.i32(),
                data_type2: rd.i32(),
                valid_time: rd.i64(),
                expire_time: rd.i64(),
                write_time: rd.i64(),
                offset: rd.u64(),
                len: rd.u32(),
                aux_index: rd.u32(),
            };
            if r.aux_index as usize >= n_aux {
                return Err(corrupt(format!(
                    "ref {} has aux_index {} beyond {} aux refs",
                    i, r.aux_index, n_aux
                )));
            }
            if r.valid_time < start_of_day || r.valid_time > end_of_day {
                return Err(corrupt(format!(
                    "ref {} valid_time {} outside day {}..={}",
                    i, r.valid_time, start_of_day, end_of_day
                )));
            }
            if refs.last().is_some_and(|prev| r.valid_time < prev.valid_time) {
                return Err(corrupt(format!("ref {} out of valid_time order", i)));
            }
            if r.offset.checked_add(u64::from(r.len)).is_none() {
                return Err(corrupt(format!("ref {} region overflows", i)));
            }
            refs.push(r);
        }

        let mut aux = Vec::with_capacity(n_aux);
        for _ in 0..n_aux {
            let compression = Compression::try_from(rd.u32())
                .map_err(|e| corrupt(e.to_string()))?;
            rd.skip(4);
            let tag = rd.fixed_str(TAG_LEN);
            aux.push(AuxRef {
                compression,
                tag: if tag.is_empty() { None } else { Some(tag) },
            });
        }

        Ok(Self {
            header: Header {
                major_revision,
                minor_revision,
                prod_id,
                prod_label,
                info,
                lead_time_storage,
                nbytes_data,
                nbytes_frag,
                max_duration,
                start_of_day,
                end_of_day,
                start_valid,
                end_valid,
                earliest_valid,
                latest_expire,
                latest_write,
                minute_posn,
            },
            refs,
            aux,
        })
    }
}

/// Minute index: for each minute, the first ref at or after its start, or -1
pub fn compute_minute_posn(refs: &[ChunkRef], start_of_day: i64) -> Vec<i32> {
    let mut posn = vec![-1; MINS_PER_DAY];
    let mut idx = 0usize;
    for (m, slot) in posn.iter_mut().enumerate() {
        let minute_start = start_of_day + 60 * m as i64;
        while idx < refs.len() && refs[idx].valid_time < minute_start {
            idx += 1;
        }
        if idx < refs.len() {
            *slot = idx as i32;
        }
    }
    posn
}

/// Cut `s` to at most `max` bytes on a char boundary
pub(crate) fn truncate_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn put_fixed_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let s = truncate_to(s, width - 1);
    buf.extend_from_slice(s.as_bytes());
    buf.resize(buf.len() + width - s.len(), 0);
}

/// Big-endian reader over a buffer whose length was already validated
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.buf.get(self.pos..self.pos + N) {
            out.copy_from_slice(src);
        }
        self.pos += N;
        out
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_be_bytes(self.take())
    }

    fn fixed_str(&mut self, width: usize) -> String {
        let raw = self.buf.get(self.pos..self.pos + width).unwrap_or(&[]);
        self.pos += width;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    const DAY: i64 = 19_000 * SECS_PER_DAY;

    fn path() -> PathBuf {
        PathBuf::from("20220102.indx")
    }

    fn make_index(times: &[i64]) -> IndexFile {
        let mut header = Header::new(DAY, 42, "radar mosaic");
        header.info = "test day".to_string();
        header.nbytes_frag = 17;
        header.latest_write = DAY + 50_000;
        let mut index = IndexFile::new(header);
        let mut offset = 0u64;
        for (i, &t) in times.iter().enumerate() {
            index.refs.push(ChunkRef {
                data_type: i as i32 % 3,
                data_type2: 5,
                valid_time: t,
                expire_time: t + 600,
                write_time: DAY + 40_000,
                offset,
                len: 10,
                aux_index: 0,
            });
            index.aux.push(AuxRef {
                compression: if i % 2 == 0 {
                    Compression::Gzip
                } else {
                    Compression::None
                },
                tag: if i % 3 == 0 { Some(format!("tag-{}", i)) } else { None },
            });
            offset += 10;
        }
        index.recompute();
        index
    }

    #[test]
    fn test_empty_roundtrip() {
        let index = IndexFile::new(Header::new(DAY, 0, ""));
        let bytes = index.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        let decoded = IndexFile::decode(&bytes, &path()).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_roundtrip_with_refs() {
        let index = make_index(&[DAY, DAY + 59, DAY + 60, DAY + 3600, DAY + 3600, DAY + 86_399]);
        let bytes = index.encode();
        let decoded = IndexFile::decode(&bytes, &path()).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_large_ref_count_roundtrip() {
        let times: Vec<i64> = (0..20_000).map(|i| DAY + (i * 4) as i64).collect();
        let index = make_index(&times);
        let bytes = index.encode();
        let decoded = IndexFile::decode(&bytes, &path()).unwrap();
        assert_eq!(decoded.refs.len(), 20_000);
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = make_index(&[DAY + 5]).encode();
        bytes[0] = b'X';
        let err = IndexFile::decode(&bytes, &path()).unwrap_err();
        assert!(matches!(err, SpdbError::CorruptOrUnsupportedHeader { .. }));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let bytes = make_index(&[DAY + 5, DAY + 6]).encode();
        let err = IndexFile::decode(&bytes[..bytes.len() - 10], &path()).unwrap_err();
        assert!(matches!(err, SpdbError::CorruptOrUnsupportedHeader { .. }));

        let err = IndexFile::decode(&bytes[..100], &path()).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_rejects_inflated_count() {
        let mut bytes = make_index(&[DAY + 5]).encode();
        bytes[20..24].copy_from_slice(&u32::MAX.to_be_bytes());
        bytes[24..28].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = IndexFile::decode(&bytes, &path()).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_rejects_newer_major_revision() {
        let mut bytes = make_index(&[]).encode();
        bytes[8..10].copy_from_slice(&(MAJOR_REVISION + 1).to_be_bytes());
        let err = IndexFile::decode(&bytes, &path()).unwrap_err();
        assert!(err.to_string().contains("unsupported revision"));
    }

    #[test]
    fn test_newer_minor_revision_is_readable() {
        let mut bytes = make_index(&[DAY + 5]).encode();
        bytes[10..12].copy_from_slice(&(MINOR_REVISION + 1).to_be_bytes());
        let body = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..body]);
        bytes[body..].copy_from_slice(&crc.to_be_bytes());

        let decoded = IndexFile::decode(&bytes, &path()).unwrap();
        assert!(decoded.header.is_newer_than_supported());
        // Re-encoding never keeps the newer revision
        let reencoded = decoded.encode();
        assert_eq!(&reencoded[10..12], &MINOR_REVISION.to_be_bytes());
    }

    #[test]
    fn test_rejects_checksum_mismatch() {
        let mut bytes = make_index(&[DAY + 5]).encode();
        bytes[HEADER_SIZE + 2] ^= 0xff;
        let err = IndexFile::decode(&bytes, &path()).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_big_endian_fields() {
        let bytes = make_index(&[]).encode();
        assert_eq!(&bytes[12..16], &42i32.to_be_bytes());
        assert_eq!(&bytes[28..40], b"radar mosaic");
    }

    #[test]
    fn test_minute_posn_fill_forward() {
        let index = make_index(&[DAY + 30, DAY + 90, DAY + 90, DAY + 600]);
        let posn = &index.header.minute_posn;
        assert_eq!(posn[0], 0);
        assert_eq!(posn[1], 1);
        assert_eq!(posn[2], 3);
        assert_eq!(posn[10], 3);
        assert_eq!(posn[11], -1);
        assert_eq!(posn[1439], -1);
    }

    #[test]
    fn test_range_lookup() {
        let index = make_index(&[DAY + 30, DAY + 90, DAY + 90, DAY + 600]);
        assert_eq!(index.range(DAY + 90, DAY + 90), 1..3);
        assert_eq!(index.range(DAY, DAY + 86_399), 0..4);
        assert_eq!(index.range(DAY + 601, DAY + 86_399), 4..4);
        assert_eq!(index.range(DAY + 91, DAY + 599), 3..3);
    }

    #[test]
    fn test_label_truncated_to_field_width() {
        let label = "x".repeat(100);
        let header = Header::new(DAY, 1, &label);
        assert_eq!(header.prod_label.len(), LABEL_LEN - 1);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_and_minute_index(mut offsets in proptest::collection::vec(0i64..SECS_PER_DAY, 0..200)) {
            offsets.sort();
            let times: Vec<i64> = offsets.iter().map(|o| DAY + o).collect();
            let index = make_index(&times);
            let decoded = IndexFile::decode(&index.encode(), &path()).unwrap();
            prop_assert_eq!(&decoded, &index);

            for m in 0..MINS_PER_DAY {
                let minute_start = DAY + 60 * m as i64;
                let first = decoded.refs.iter().position(|r| r.valid_time >= minute_start);
                match first {
                    Some(i) => prop_assert_eq!(decoded.header.minute_posn[m], i as i32),
                    None => prop_assert_eq!(decoded.header.minute_posn[m], -1),
                }
            }
        }
    }
}
