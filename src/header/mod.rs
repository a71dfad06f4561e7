//! RPM header decoder.
//!
//! A header is one self-describing tag/value blob, serialized big-endian:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     tag_count: u32be
//! 4       4     data_size: u32be
//! 8       16*N  tag index: EntryInfo x tag_count
//! 8+16*N  D     data arena
//! ```
//!
//! The index is decoded and verified up front (monotonicity and the region
//! envelope are cross-entry properties); values are decoded on demand via
//! [`Header::read`].

pub mod tag;
pub mod value;

use crate::error::{Error, Result};
use crate::io::{ReadAt, Rope};

pub use tag::Kind;
pub use value::Value;

// ── Constants ──────────────────────────────────────────────────────

/// Preamble size: tag_count + data_size.
pub const PREAMBLE_SIZE: u64 = 8;

/// Size of one serialized EntryInfo.
pub const ENTRY_INFO_SIZE: u64 = 16;

/// A region entry's data is one trailing EntryInfo.
const REGION_TAG_COUNT: u32 = ENTRY_INFO_SIZE as u32;

/// Total header size cap.
const MAX_HEADER_SIZE: u64 = 256 << 20;

/// Tag count fits in 16 bits.
const MAX_TAG_COUNT: u32 = 1 << 16;

/// Data arena length fits in 28 bits.
const MAX_DATA_SIZE: u32 = 1 << 28;

// ── EntryInfo ──────────────────────────────────────────────────────

/// One tag index entry, exactly 16 bytes on disk.
///
/// ```text
/// Offset  Size  Field
/// 0       4     tag: i32be
/// 4       4     kind: u32be
/// 8       4     offset: i32be (into the data arena)
/// 12      4     count: u32be
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub tag: i32,
    pub kind: Kind,
    pub offset: i32,
    pub count: u32,
}

impl EntryInfo {
    fn from_bytes(bytes: &[u8; 16]) -> Result<Self> {
        let tag = i32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let raw_kind = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let kind = Kind::from_u32(raw_kind).ok_or_else(|| {
            Error::MalformedHeader(format!("tag {}: unknown value kind {}", tag, raw_kind))
        })?;
        let offset = i32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let count = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        Ok(Self { tag, kind, offset, count })
    }
}

// ── Header ─────────────────────────────────────────────────────────

/// A decoded header: verified tag index over an unread data arena.
#[derive(Debug)]
pub struct Header {
    blob: Rope,
    infos: Vec<EntryInfo>,
    region_tag: Option<i32>,
    data_start: u64,
    data_size: u64,
}

impl Header {
    /// Parse and verify a header blob.
    pub fn parse(blob: Rope) -> Result<Self> {
        let mut pre = [0u8; PREAMBLE_SIZE as usize];
        blob.read_exact_at(&mut pre, 0)
            .map_err(|_| Error::MalformedHeader("short preamble".into()))?;
        let tag_count = u32::from_be_bytes(pre[0..4].try_into().unwrap());
        let data_size = u32::from_be_bytes(pre[4..8].try_into().unwrap());

        if tag_count == 0 {
            return Err(Error::MalformedHeader("no tag entries".into()));
        }
        if tag_count >= MAX_TAG_COUNT {
            return Err(Error::MalformedHeader(format!(
                "tag count {} out of range",
                tag_count
            )));
        }
        if data_size >= MAX_DATA_SIZE {
            return Err(Error::MalformedHeader(format!(
                "data size {} out of range",
                data_size
            )));
        }
        let data_start = PREAMBLE_SIZE + u64::from(tag_count) * ENTRY_INFO_SIZE;
        let total = data_start + u64::from(data_size);
        if total > MAX_HEADER_SIZE {
            return Err(Error::MalformedHeader(format!(
                "header size {} exceeds cap",
                total
            )));
        }
        if total > blob.size() {
            return Err(Error::MalformedHeader(format!(
                "truncated header: need {} bytes, have {}",
                total,
                blob.size()
            )));
        }

        let mut index = vec![0u8; (u64::from(tag_count) * ENTRY_INFO_SIZE) as usize];
        blob.read_exact_at(&mut index, PREAMBLE_SIZE)
            .map_err(|_| Error::MalformedHeader("truncated tag index".into()))?;
        let mut infos = Vec::with_capacity(tag_count as usize);
        for raw in index.chunks_exact(ENTRY_INFO_SIZE as usize) {
            infos.push(EntryInfo::from_bytes(raw.try_into().unwrap())?);
        }

        let header = Self {
            blob,
            infos,
            region_tag: None,
            data_start,
            data_size: u64::from(data_size),
        };
        let header = header.verify_region()?;
        header.verify_infos()?;
        Ok(header)
    }

    /// Verified tag index entries, in on-disk order.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.infos
    }

    /// The region tag opening this header, if any.
    pub fn region_tag(&self) -> Option<i32> {
        self.region_tag
    }

    /// Find the entry for `tag`.
    pub fn get(&self, tag: i32) -> Option<&EntryInfo> {
        self.infos.iter().find(|e| e.tag == tag)
    }

    // ── Region envelope ────────────────────────────────────────────

    /// Verify the optional region envelope.
    ///
    /// Older bdb-hosted headers omit the leading region tag; when the first
    /// tag is none of the recognized region tags the envelope rules are
    /// relaxed. The decision is driven by the header bytes alone so a
    /// header stream survives round-tripping through any backend.
    fn verify_region(mut self) -> Result<Self> {
        let e0 = self.infos[0];
        if !tag::is_region_tag(e0.tag) {
            return Ok(self);
        }
        if e0.kind != Kind::Bin {
            return Err(Error::MalformedHeader(format!(
                "region tag {}: kind {:?} is not binary",
                e0.tag, e0.kind
            )));
        }
        if e0.count != REGION_TAG_COUNT {
            return Err(Error::MalformedHeader(format!(
                "region tag {}: count {} is not {}",
                e0.tag, e0.count, REGION_TAG_COUNT
            )));
        }
        if e0.offset < 0 || u64::from(e0.offset as u32) + u64::from(REGION_TAG_COUNT) > self.data_size
        {
            return Err(Error::MalformedHeader(
                "region trailer lies outside the data arena".into(),
            ));
        }

        let mut raw = [0u8; ENTRY_INFO_SIZE as usize];
        self.blob
            .read_exact_at(&mut raw, self.data_start + e0.offset as u64)
            .map_err(|_| Error::MalformedHeader("short region trailer".into()))?;
        let trailer = EntryInfo::from_bytes(&raw)?;

        if trailer.tag != e0.tag {
            return Err(Error::MalformedHeader(format!(
                "region trailer tag {} does not match {}",
                trailer.tag, e0.tag
            )));
        }
        if trailer.kind != Kind::Bin || trailer.count != REGION_TAG_COUNT {
            return Err(Error::MalformedHeader("invalid region trailer".into()));
        }
        if trailer.offset >= 0 {
            return Err(Error::MalformedHeader(
                "region trailer offset is not negated".into(),
            ));
        }
        let index_len = -(i64::from(trailer.offset));
        if index_len % i64::from(ENTRY_INFO_SIZE as u32) != 0
            || index_len / 16 > self.infos.len() as i64
        {
            return Err(Error::MalformedHeader(format!(
                "region declares {} index bytes over {} entries",
                index_len,
                self.infos.len()
            )));
        }

        self.region_tag = Some(e0.tag);
        Ok(self)
    }

    // ── Entry verification ─────────────────────────────────────────

    fn verify_infos(&self) -> Result<()> {
        let has_region = self.region_tag.is_some();
        let start = if has_region { 1 } else { 0 };
        let mut prev_offset = -1i32;
        for e in &self.infos[start..] {
            // Headers written with a region keep payload tags at or above
            // the i18n table; regionless legacy headers do not.
            if has_region && e.tag < tag::TAG_HEADER_I18N_TABLE {
                return Err(Error::MalformedHeader(format!(
                    "tag {} below the payload range",
                    e.tag
                )));
            }
            if e.kind != Kind::Null && e.count == 0 {
                return Err(Error::MalformedHeader(format!("tag {}: zero count", e.tag)));
            }
            if e.offset < 0 {
                return Err(Error::MalformedHeader(format!(
                    "tag {}: negative offset",
                    e.tag
                )));
            }
            if e.offset < prev_offset {
                return Err(Error::MalformedHeader(format!(
                    "tag {}: offsets out of order ({} after {})",
                    e.tag, e.offset, prev_offset
                )));
            }
            prev_offset = e.offset;

            let off = e.offset as u64;
            if off % e.kind.alignment() != 0 {
                return Err(Error::MalformedHeader(format!(
                    "tag {}: offset {} misaligned for {:?}",
                    e.tag, e.offset, e.kind
                )));
            }
            match e.kind.element_size() {
                Some(size) => {
                    let end = off + u64::from(e.count) * size;
                    if end > self.data_size {
                        return Err(Error::MalformedHeader(format!(
                            "tag {}: data [{}, {}) outside arena of {} bytes",
                            e.tag, off, end, self.data_size
                        )));
                    }
                }
                // NUL-terminated kinds are bounds-checked while scanning.
                None => {
                    if off >= self.data_size {
                        return Err(Error::MalformedHeader(format!(
                            "tag {}: string data starts outside the arena",
                            e.tag
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ── Typed read ─────────────────────────────────────────────────

    /// Decode the value of one verified entry.
    pub fn read(&self, e: &EntryInfo) -> Result<Value> {
        let off = e.offset as u64;
        let count = e.count as usize;
        match e.kind {
            Kind::Null => Ok(Value::Null),
            Kind::Char => Ok(Value::Char(self.read_arena(off, count)?)),
            Kind::Bin => Ok(Value::Bin(self.read_arena(off, count)?)),
            Kind::Int8 => {
                let raw = self.read_arena(off, count)?;
                Ok(Value::Int8(raw.into_iter().map(|b| b as i8).collect()))
            }
            Kind::Int16 => {
                let raw = self.read_arena(off, count * 2)?;
                Ok(Value::Int16(
                    raw.chunks_exact(2)
                        .map(|c| i16::from_be_bytes(c.try_into().unwrap()))
                        .collect(),
                ))
            }
            Kind::Int32 => {
                let raw = self.read_arena(off, count * 4)?;
                Ok(Value::Int32(
                    raw.chunks_exact(4)
                        .map(|c| i32::from_be_bytes(c.try_into().unwrap()))
                        .collect(),
                ))
            }
            Kind::Int64 => {
                let raw = self.read_arena(off, count * 8)?;
                Ok(Value::Int64(
                    raw.chunks_exact(8)
                        .map(|c| i64::from_be_bytes(c.try_into().unwrap()))
                        .collect(),
                ))
            }
            Kind::String => {
                if e.count != 1 {
                    return Err(Error::MalformedHeader(format!(
                        "tag {}: string entry with count {}",
                        e.tag, e.count
                    )));
                }
                let mut strings = self.read_strings(e.tag, off, 1)?;
                Ok(Value::String(strings.pop().unwrap()))
            }
            Kind::StringArray => Ok(Value::StringArray(self.read_strings(e.tag, off, count)?)),
            Kind::I18nString => Ok(Value::I18nString(self.read_strings(e.tag, off, count)?)),
        }
    }

    fn read_arena(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        if off + len as u64 > self.data_size {
            return Err(Error::MalformedHeader("entry data outside arena".into()));
        }
        let mut buf = vec![0u8; len];
        self.blob
            .read_exact_at(&mut buf, self.data_start + off)
            .map_err(|_| Error::MalformedHeader("short arena read".into()))?;
        Ok(buf)
    }

    /// Scan `n` NUL-terminated strings starting at arena offset `off`.
    ///
    /// Non-UTF-8 bytes are lossily replaced; historical databases carry
    /// latin-1 in changelog-adjacent tags.
    fn read_strings(&self, tag: i32, off: u64, n: usize) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(n);
        let mut cur: Vec<u8> = Vec::new();
        let mut pos = self.data_start + off;
        let end = self.data_start + self.data_size;
        let mut chunk = [0u8; 4096];

        while out.len() < n {
            if pos >= end {
                return Err(Error::MalformedHeader(format!(
                    "tag {}: unterminated string ({} of {} read)",
                    tag,
                    out.len(),
                    n
                )));
            }
            let want = chunk.len().min((end - pos) as usize);
            self.blob
                .read_exact_at(&mut chunk[..want], pos)
                .map_err(|_| Error::MalformedHeader("short arena read".into()))?;
            for &b in &chunk[..want] {
                if b == 0 {
                    out.push(String::from_utf8_lossy(&cur).into_owned());
                    cur.clear();
                    if out.len() == n {
                        break;
                    }
                } else {
                    cur.push(b);
                }
            }
            pos += want as u64;
        }
        Ok(out)
    }
}
