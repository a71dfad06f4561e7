//! BerkeleyDB hash file reader.
//!
//! Reads the `Packages` file of a bdb-backed rpm database: a BerkeleyDB
//! hash file treated as a read-only snapshot. Only hash-meta, hash and
//! overflow pages are decoded; btree, queue and log pages are out of scope.
//!
//! Metadata page (first 512 bytes, generic DBMETA then HMETA):
//!
//! ```text
//! Offset  Size  Field
//! 0       8     lsn: {file: u32, offset: u32}
//! 12      4     magic: 0x00061561 (byte order discovered here)
//! 20      4     page_size: power of two in [512, 65536]
//! 24      1     encrypt_alg: must be 0
//! 25      1     page type: 8 (hash metadata)
//! 32      4     last_pgno
//! 72      4     max_bucket
//! 96      128   spares: [u32; 32]
//! ```
//!
//! Regular pages share a 26-byte header: lsn at 0, next_pgno at 16,
//! entries at 20, hf_offset at 22, type at 25.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::{ReadAt, Rope};

// ── Constants ──────────────────────────────────────────────────────

/// Hash file magic, stored at byte 12 of the metadata page.
pub(crate) const HASH_MAGIC: u32 = 0x0006_1561;

const META_BYTES: usize = 512;

// Page types.
const P_HASH_UNSORTED: u8 = 2;
const P_OVERFLOW: u8 = 7;
const P_HASH_META: u8 = 8;
const P_HASH: u8 = 13;

// Hash page entry types.
const H_KEYDATA: u8 = 1;
const H_DUPLICATE: u8 = 2;
const H_OFFPAGE: u8 = 3;
const H_OFFDUP: u8 = 4;
const H_BLOB: u8 = 5;

// Generic page header offsets.
const PAGE_NEXT_PGNO: usize = 16;
const PAGE_ENTRIES: usize = 20;
const PAGE_HF_OFFSET: usize = 22;
const PAGE_TYPE: usize = 25;
const PAGE_HEADER_SIZE: usize = 26;

/// Size of an off-page entry: type, 3 pad bytes, pgno, tlen.
const OFFPAGE_SIZE: usize = 12;

// ── Byte order ─────────────────────────────────────────────────────

/// File byte order, discovered from the metadata magic. Governs every
/// subsequent field read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(&self, bytes: &[u8]) -> u16 {
        let raw: [u8; 2] = bytes[..2].try_into().unwrap();
        match self {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }

    fn u32(&self, bytes: &[u8]) -> u32 {
        let raw: [u8; 4] = bytes[..4].try_into().unwrap();
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    /// Combine an on-disk LSN (file, offset) into one comparable value.
    fn lsn(&self, bytes: &[u8]) -> u64 {
        (u64::from(self.u32(&bytes[0..4])) << 32) | u64::from(self.u32(&bytes[4..8]))
    }
}

/// Magic probe used by discovery: bytes 12..16 of the file, either order.
pub(crate) fn magic_matches(prefix: &[u8]) -> bool {
    if prefix.len() < 16 {
        return false;
    }
    let raw: [u8; 4] = prefix[12..16].try_into().unwrap();
    u32::from_le_bytes(raw) == HASH_MAGIC || u32::from_be_bytes(raw) == HASH_MAGIC
}

// ── Reader ─────────────────────────────────────────────────────────

/// Read-only view over one BerkeleyDB hash file.
pub struct BdbReader {
    src: Arc<dyn ReadAt>,
    order: ByteOrder,
    page_size: u32,
    last_pgno: u32,
    max_bucket: u32,
    spares: [u32; 32],
    meta_lsn: u64,
}

impl std::fmt::Debug for BdbReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdbReader")
            .field("order", &self.order)
            .field("page_size", &self.page_size)
            .field("last_pgno", &self.last_pgno)
            .field("max_bucket", &self.max_bucket)
            .finish()
    }
}

impl BdbReader {
    /// Open and validate the metadata page.
    pub fn new(src: Arc<dyn ReadAt>) -> Result<Self> {
        let mut meta = [0u8; META_BYTES];
        src.read_exact_at(&mut meta, 0)
            .map_err(|_| Error::NotAnRpmDatabase("file too small for hash metadata".into()))?;

        let raw: [u8; 4] = meta[12..16].try_into().unwrap();
        let order = if u32::from_le_bytes(raw) == HASH_MAGIC {
            ByteOrder::Little
        } else if u32::from_be_bytes(raw) == HASH_MAGIC {
            ByteOrder::Big
        } else {
            return Err(Error::NotAnRpmDatabase("no hash magic".into()));
        };

        if meta[PAGE_TYPE] != P_HASH_META {
            return Err(Error::NotAnRpmDatabase(format!(
                "metadata page type {} is not hash metadata",
                meta[PAGE_TYPE]
            )));
        }
        if meta[24] != 0 {
            return Err(Error::Unsupported(format!(
                "encrypted database (algorithm {})",
                meta[24]
            )));
        }
        let page_size = order.u32(&meta[20..24]);
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::NotAnRpmDatabase(format!(
                "implausible page size {}",
                page_size
            )));
        }

        let mut spares = [0u32; 32];
        for (i, s) in spares.iter_mut().enumerate() {
            *s = order.u32(&meta[96 + 4 * i..96 + 4 * i + 4]);
        }

        Ok(Self {
            src,
            order,
            page_size,
            last_pgno: order.u32(&meta[32..36]),
            max_bucket: order.u32(&meta[72..76]),
            spares,
            meta_lsn: order.lsn(&meta[0..8]),
        })
    }

    /// Validation beyond the constructor is not needed; kept for the
    /// uniform backend contract.
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Lazy sequence of header blobs in bucket order.
    pub fn headers(&self) -> Headers<'_> {
        Headers {
            db: self,
            next_bucket: 0,
            cur: None,
            fused: false,
        }
    }

    /// Page number of a bucket's root page.
    fn bucket_page(&self, bucket: u32) -> u32 {
        bucket + self.spares[ceil_log2(bucket + 1)]
    }

    /// Load a full page and check its LSN against the metadata page.
    fn load_page(&self, pgno: u32) -> Result<Vec<u8>> {
        if pgno == 0 || pgno > self.last_pgno {
            return Err(Error::MalformedHeader(format!(
                "page {} out of range (last is {})",
                pgno, self.last_pgno
            )));
        }
        let mut page = vec![0u8; self.page_size as usize];
        self.src
            .read_exact_at(&mut page, u64::from(pgno) * u64::from(self.page_size))
            .map_err(|_| Error::MalformedHeader(format!("short read of page {}", pgno)))?;
        let lsn = self.order.lsn(&page[0..8]);
        if lsn != self.meta_lsn {
            return Err(Error::StaleLsn {
                page: pgno,
                expected: self.meta_lsn,
                actual: lsn,
            });
        }
        Ok(page)
    }

    /// Follow an overflow chain, stitching payloads into one rope.
    fn assemble_overflow(&self, mut pgno: u32, tlen: u32) -> Result<Rope> {
        let mut rope = Rope::new();
        let mut hops = 0u32;
        while pgno != 0 {
            let page = self.load_page(pgno)?;
            if page[PAGE_TYPE] != P_OVERFLOW {
                return Err(Error::MalformedHeader(format!(
                    "page {} in overflow chain has type {}",
                    pgno, page[PAGE_TYPE]
                )));
            }
            let len = u64::from(self.order.u16(&page[PAGE_HF_OFFSET..PAGE_HF_OFFSET + 2]));
            if PAGE_HEADER_SIZE as u64 + len > u64::from(self.page_size) {
                return Err(Error::MalformedHeader(format!(
                    "overflow page {} claims {} payload bytes",
                    pgno, len
                )));
            }
            let next = self.order.u32(&page[PAGE_NEXT_PGNO..PAGE_NEXT_PGNO + 4]);
            rope.push(Arc::new(page), PAGE_HEADER_SIZE as u64, len);
            pgno = next;

            hops += 1;
            if hops > self.last_pgno {
                return Err(Error::MalformedHeader("overflow chain cycle".into()));
            }
        }
        if rope.size() != u64::from(tlen) {
            return Err(Error::MalformedHeader(format!(
                "overflow chain holds {} bytes, entry claims {}",
                rope.size(),
                tlen
            )));
        }
        Ok(rope)
    }
}

fn ceil_log2(n: u32) -> usize {
    if n <= 1 {
        0
    } else {
        (32 - (n - 1).leading_zeros()) as usize
    }
}

// ── Iteration ──────────────────────────────────────────────────────

enum Decoded {
    Skip,
    Blob(Rope),
    Fail(Error),
}

/// Iterator over header blobs. Recoverable errors are in-stream; a fatal
/// error (stale LSN, unreadable metadata state) fuses the iterator.
pub struct Headers<'a> {
    db: &'a BdbReader,
    next_bucket: u32,
    cur: Option<PageCursor>,
    fused: bool,
}

struct PageCursor {
    page: Vec<u8>,
    next_pair: u16,
}

impl Headers<'_> {
    /// Load a bucket's root page or an in-chain page, checking its type.
    fn enter_page(&mut self, pgno: u32, bucket: u32) -> Option<Error> {
        match self.db.load_page(pgno) {
            Ok(page) => {
                let t = page[PAGE_TYPE];
                if t != P_HASH && t != P_HASH_UNSORTED {
                    return Some(Error::MalformedHeader(format!(
                        "bucket {}: page {} has type {}, expected hash",
                        bucket, pgno, t
                    )));
                }
                let nslots = self.db.order.u16(&page[PAGE_ENTRIES..PAGE_ENTRIES + 2]) as usize;
                if PAGE_HEADER_SIZE + 2 * nslots > self.db.page_size as usize {
                    return Some(Error::MalformedHeader(format!(
                        "bucket {}: page {} claims {} entries",
                        bucket, pgno, nslots
                    )));
                }
                self.cur = Some(PageCursor { page, next_pair: 0 });
                None
            }
            Err(e) => Some(e),
        }
    }

    /// Decode the key/value pair starting at slot `ki`.
    fn decode_pair(&self, cursor: &PageCursor, ki: u16) -> Decoded {
        let db = self.db;
        let page = &cursor.page;
        let page_size = db.page_size as usize;
        let nslots = db.order.u16(&page[PAGE_ENTRIES..PAGE_ENTRIES + 2]) as usize;
        let slots_end = PAGE_HEADER_SIZE + 2 * nslots;

        let slot = |i: usize| -> usize {
            db.order.u16(&page[PAGE_HEADER_SIZE + 2 * i..PAGE_HEADER_SIZE + 2 * i + 2]) as usize
        };
        // Entries pack backward from page end; the previous slot bounds
        // this one.
        let boundary = |i: usize| -> usize {
            if i == 0 {
                page_size
            } else {
                slot(i - 1)
            }
        };

        let ki = ki as usize;
        let vi = ki + 1;
        let (k_off, k_end) = (slot(ki), boundary(ki));
        let (v_off, v_end) = (slot(vi), boundary(vi));
        if k_off < slots_end || k_off >= k_end || k_end > page_size || v_off < slots_end
            || v_off >= v_end
        {
            return Decoded::Fail(Error::MalformedHeader(format!(
                "hash entry {} has inverted slot offsets",
                ki
            )));
        }

        // The all-zero key carries the package count; skip the pair.
        if page[k_off + 1..k_end].iter().all(|&b| b == 0) {
            return Decoded::Skip;
        }

        match page[v_off] {
            H_KEYDATA => {
                let data = page[v_off + 1..v_end].to_vec();
                Decoded::Blob(Rope::from_vec(data))
            }
            H_OFFPAGE => {
                if v_off + OFFPAGE_SIZE > v_end {
                    return Decoded::Fail(Error::MalformedHeader(
                        "truncated off-page entry".into(),
                    ));
                }
                let pgno = db.order.u32(&page[v_off + 4..v_off + 8]);
                let tlen = db.order.u32(&page[v_off + 8..v_off + 12]);
                match db.assemble_overflow(pgno, tlen) {
                    Ok(rope) => Decoded::Blob(rope),
                    Err(e) => Decoded::Fail(e),
                }
            }
            H_DUPLICATE => {
                Decoded::Fail(Error::Unsupported("hash duplicate entry".into()))
            }
            H_OFFDUP => {
                Decoded::Fail(Error::Unsupported("hash off-page duplicate entry".into()))
            }
            H_BLOB => Decoded::Fail(Error::Unsupported("hash blob entry".into())),
            t => Decoded::Fail(Error::MalformedHeader(format!(
                "unknown hash entry type {}",
                t
            ))),
        }
    }
}

impl Iterator for Headers<'_> {
    type Item = Result<Rope>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        loop {
            let Some(cursor) = self.cur.as_ref() else {
                if self.next_bucket > self.db.max_bucket {
                    return None;
                }
                let bucket = self.next_bucket;
                self.next_bucket += 1;
                let pgno = self.db.bucket_page(bucket);
                if let Some(e) = self.enter_page(pgno, bucket) {
                    if !e.is_recoverable() {
                        self.fused = true;
                    }
                    return Some(Err(e));
                }
                continue;
            };

            let nslots = self
                .db
                .order
                .u16(&cursor.page[PAGE_ENTRIES..PAGE_ENTRIES + 2]);
            // A final unpaired slot is a key without a value; skip it.
            if cursor.next_pair + 1 >= nslots {
                let next = self
                    .db
                    .order
                    .u32(&cursor.page[PAGE_NEXT_PGNO..PAGE_NEXT_PGNO + 4]);
                let bucket = self.next_bucket - 1;
                self.cur = None;
                if next != 0 {
                    if let Some(e) = self.enter_page(next, bucket) {
                        if !e.is_recoverable() {
                            self.fused = true;
                        }
                        return Some(Err(e));
                    }
                }
                continue;
            }

            let ki = cursor.next_pair;
            let decoded = self.decode_pair(cursor, ki);
            self.cur.as_mut().unwrap().next_pair += 2;
            match decoded {
                Decoded::Skip => continue,
                Decoded::Blob(rope) => return Some(Ok(rope)),
                Decoded::Fail(e) => {
                    if !e.is_recoverable() {
                        self.fused = true;
                    }
                    return Some(Err(e));
                }
            }
        }
    }
}
