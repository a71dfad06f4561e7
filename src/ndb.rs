//! NDB package file reader.
//!
//! Reads the `Packages.db` file of an ndb-backed rpm database: a slotted
//! file of checksummed blobs, one per installed package. All fields are
//! little-endian; pages are hard-coded to 4096 bytes and blob extents are
//! counted in 16-byte blocks.
//!
//! ```text
//! File header (32 bytes, slot 0 and 1 of the first slot page):
//! 0   4  magic: "RpmP"
//! 4   4  version: 0
//! 8   4  generation
//! 12  4  slot pages
//! 16  4  next package index
//!
//! Slot (16 bytes each, from byte 32):        Blob envelope:
//! 0  4  magic: "Slot"                        0   4  magic: "BlbS"
//! 4  4  package index                        4   4  package index
//! 8  4  blk_offset (16-byte blocks)          8   4  generation
//! 12 4  blk_count                            12  4  length
//!                                            ...     data, padding
//!                                            -12  4  adler32 checksum
//!                                            -8   4  length (again)
//!                                            -4   4  magic: "BlbE"
//! ```
//!
//! The tag-index sibling (`Index.db`) is not read; package enumeration
//! does not need it.

use std::sync::Arc;

use adler32::RollingAdler32;

use crate::error::{Error, Result};
use crate::io::{ReadAt, Rope};

// ── Constants ──────────────────────────────────────────────────────

const NDB_MAGIC: [u8; 4] = *b"RpmP";
/// Magic of the tag-index sibling; accepted by the discovery probe only.
const XDB_MAGIC: [u8; 4] = *b"RpmX";
const SLOT_MAGIC: [u8; 4] = *b"Slot";
const BLOB_MAGIC: [u8; 4] = *b"BlbS";
const TRAILER_MAGIC: [u8; 4] = *b"BlbE";

const NDB_VERSION: u32 = 0;
const PAGE_SIZE: u64 = 4096;
const BLOCK_SIZE: u64 = 16;
const SLOT_SIZE: u64 = 16;
const HEADER_SIZE: u64 = 32;
const BLOB_HEADER_SIZE: u64 = 16;
const BLOB_TRAILER_SIZE: u64 = 12;

/// Smallest legal blob allocation: header + trailer, block-rounded.
const MIN_BLOB_BLOCKS: u32 =
    ((BLOB_HEADER_SIZE + BLOB_TRAILER_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32;

/// Magic probe used by discovery: the first four bytes of the file.
pub(crate) fn magic_matches(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && (prefix[..4] == NDB_MAGIC || prefix[..4] == XDB_MAGIC)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

// ── Reader ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Slot {
    index: u32,
    blk_offset: u32,
    blk_count: u32,
}

/// Read-only view over one NDB package file.
pub struct NdbReader {
    src: Arc<dyn ReadAt>,
    slots: Vec<Slot>,
}

impl std::fmt::Debug for NdbReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdbReader")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl NdbReader {
    /// Open the file: validate the header and decode the slot table.
    ///
    /// A corrupt slot table fails the open (it invalidates the whole
    /// backend); damage inside an individual blob surfaces later as a
    /// recoverable per-header error.
    pub fn new(src: Arc<dyn ReadAt>) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        src.read_exact_at(&mut header, 0)
            .map_err(|_| Error::NotAnRpmDatabase("file too small for ndb header".into()))?;

        if header[0..4] != NDB_MAGIC {
            return Err(Error::NotAnRpmDatabase("no ndb magic".into()));
        }
        let version = read_u32(&header, 4);
        if version != NDB_VERSION {
            return Err(Error::Unsupported(format!("ndb version {}", version)));
        }
        let slot_pages = read_u32(&header, 12);
        let next_pkg_idx = read_u32(&header, 16);
        if slot_pages == 0 {
            return Err(Error::NotAnRpmDatabase("no slot pages".into()));
        }
        let slot_area_end = u64::from(slot_pages) * PAGE_SIZE;
        if slot_area_end > src.size() {
            return Err(Error::NotAnRpmDatabase(format!(
                "slot area of {} pages exceeds the file",
                slot_pages
            )));
        }

        let wanted = next_pkg_idx.saturating_sub(1) as usize;
        let mut slots = Vec::with_capacity(wanted);
        let mut raw = [0u8; SLOT_SIZE as usize];
        let mut off = HEADER_SIZE;
        while slots.len() < wanted && off + SLOT_SIZE <= slot_area_end {
            src.read_exact_at(&mut raw, off)
                .map_err(|_| Error::MalformedHeader("short slot table read".into()))?;
            if raw[0..4] != SLOT_MAGIC {
                return Err(Error::MalformedHeader(format!(
                    "corrupt slot table at byte {}",
                    off
                )));
            }
            let slot = Slot {
                index: read_u32(&raw, 4),
                blk_offset: read_u32(&raw, 8),
                blk_count: read_u32(&raw, 12),
            };
            off += SLOT_SIZE;
            // Unoccupied slots keep the magic with a zero index.
            if slot.index == 0 || slot.blk_offset == 0 {
                continue;
            }
            slots.push(slot);
        }

        Ok(Self { src, slots })
    }

    /// Validation beyond the constructor is not needed; kept for the
    /// uniform backend contract.
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Number of occupied slots.
    pub fn package_count(&self) -> usize {
        self.slots.len()
    }

    /// Lazy sequence of header blobs in slot order.
    pub fn headers(&self) -> Headers<'_> {
        Headers { db: self, next: 0 }
    }

    /// Verify one slot's blob envelope and window out the header bytes.
    fn read_blob(&self, slot: &Slot) -> Result<Rope> {
        if slot.blk_count < MIN_BLOB_BLOCKS {
            return Err(Error::MalformedHeader(format!(
                "slot {}: {} blocks cannot hold a blob envelope",
                slot.index, slot.blk_count
            )));
        }
        let offset = u64::from(slot.blk_offset) * BLOCK_SIZE;
        let total = u64::from(slot.blk_count) * BLOCK_SIZE;
        if offset + total > self.src.size() {
            return Err(Error::MalformedHeader(format!(
                "slot {}: blob [{}, {}) extends past end of file",
                slot.index,
                offset,
                offset + total
            )));
        }

        let mut head = [0u8; BLOB_HEADER_SIZE as usize];
        self.src.read_exact_at(&mut head, offset)?;
        if head[0..4] != BLOB_MAGIC {
            return Err(Error::MalformedHeader(format!(
                "slot {}: no blob magic",
                slot.index
            )));
        }
        let pkg_id = read_u32(&head, 4);
        if pkg_id != slot.index {
            return Err(Error::MalformedHeader(format!(
                "slot {}: blob belongs to package {}",
                slot.index, pkg_id
            )));
        }
        let len = u64::from(read_u32(&head, 12));

        let trailer_at = offset + total - BLOB_TRAILER_SIZE;
        let mut tail = [0u8; BLOB_TRAILER_SIZE as usize];
        self.src.read_exact_at(&mut tail, trailer_at)?;
        if tail[8..12] != TRAILER_MAGIC {
            return Err(Error::MalformedHeader(format!(
                "slot {}: no blob trailer magic",
                slot.index
            )));
        }
        let stored = read_u32(&tail, 0);
        let tail_len = u64::from(read_u32(&tail, 4));
        if tail_len != len {
            return Err(Error::MalformedHeader(format!(
                "slot {}: header claims {} bytes, trailer {}",
                slot.index, len, tail_len
            )));
        }
        if BLOB_HEADER_SIZE + len > total - BLOB_TRAILER_SIZE {
            return Err(Error::MalformedHeader(format!(
                "slot {}: {} data bytes overflow a {}-block allocation",
                slot.index, len, slot.blk_count
            )));
        }

        // Adler-32 over everything before the trailer, padding included.
        let computed = self.adler32(offset, trailer_at)?;
        if computed != stored {
            return Err(Error::ChecksumMismatch {
                stored,
                computed,
            });
        }

        let mut rope = Rope::new();
        rope.push(self.src.clone(), offset + BLOB_HEADER_SIZE, len);
        Ok(rope)
    }

    fn adler32(&self, mut from: u64, to: u64) -> Result<u32> {
        let mut hasher = RollingAdler32::new();
        let mut chunk = vec![0u8; 64 * 1024];
        while from < to {
            let want = chunk.len().min((to - from) as usize);
            self.src.read_exact_at(&mut chunk[..want], from)?;
            hasher.update_buffer(&chunk[..want]);
            from += want as u64;
        }
        Ok(hasher.hash())
    }
}

// ── Iteration ──────────────────────────────────────────────────────

/// Iterator over header blobs in slot order. Every error an individual
/// slot can produce is recoverable; iteration continues with the next.
pub struct Headers<'a> {
    db: &'a NdbReader,
    next: usize,
}

impl Iterator for Headers<'_> {
    type Item = Result<Rope>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.db.slots.get(self.next)?;
        self.next += 1;
        Some(self.db.read_blob(slot))
    }
}
