//! Test fixtures: builders that synthesize header blobs and database
//! files, so the format tests run against bytes we control end to end.

use std::path::Path;

use crate::bdb::ByteOrder;
use crate::header::tag::{self, Kind};

// ── Header blobs ───────────────────────────────────────────────────

/// A value to place in a synthesized header entry.
pub enum TestValue {
    Str(String),
    StrArray(Vec<String>),
    I18n(Vec<String>),
    I32(Vec<i32>),
    Bin(Vec<u8>),
}

impl TestValue {
    fn kind(&self) -> Kind {
        match self {
            TestValue::Str(_) => Kind::String,
            TestValue::StrArray(_) => Kind::StringArray,
            TestValue::I18n(_) => Kind::I18nString,
            TestValue::I32(_) => Kind::Int32,
            TestValue::Bin(_) => Kind::Bin,
        }
    }

    fn count(&self) -> u32 {
        match self {
            TestValue::Str(_) => 1,
            TestValue::StrArray(v) | TestValue::I18n(v) => v.len() as u32,
            TestValue::I32(v) => v.len() as u32,
            TestValue::Bin(b) => b.len() as u32,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            TestValue::Str(s) => {
                let mut out = s.clone().into_bytes();
                out.push(0);
                out
            }
            TestValue::StrArray(v) | TestValue::I18n(v) => {
                let mut out = Vec::new();
                for s in v {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                out
            }
            TestValue::I32(v) => v.iter().flat_map(|n| n.to_be_bytes()).collect(),
            TestValue::Bin(b) => b.clone(),
        }
    }
}

/// Builds one serialized header blob, optionally wrapped in a region
/// envelope (the trailer lands at the end of the data arena, as rpm
/// writes it).
pub struct HeaderBuilder {
    region: Option<i32>,
    entries: Vec<(i32, TestValue)>,
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self { region: None, entries: Vec::new() }
    }

    pub fn region(mut self, tag: i32) -> Self {
        self.region = Some(tag);
        self
    }

    pub fn entry(mut self, tag: i32, value: TestValue) -> Self {
        self.entries.push((tag, value));
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.build_with(|_| {})
    }

    /// Build, then let `mutate` corrupt the raw bytes.
    pub fn build_with(self, mutate: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let total_entries = self.entries.len() + usize::from(self.region.is_some());

        let mut arena: Vec<u8> = Vec::new();
        let mut index: Vec<(i32, Kind, u32, u32)> = Vec::new();
        for (tag, value) in &self.entries {
            let kind = value.kind();
            while arena.len() as u64 % kind.alignment() != 0 {
                arena.push(0);
            }
            index.push((*tag, kind, arena.len() as u32, value.count()));
            arena.extend(value.encode());
        }

        let region_entry = self.region.map(|rtag| {
            let trailer_offset = arena.len() as u32;
            arena.extend(rtag.to_be_bytes());
            arena.extend((Kind::Bin as u32).to_be_bytes());
            arena.extend((-(16 * total_entries as i32)).to_be_bytes());
            arena.extend(16u32.to_be_bytes());
            (rtag, Kind::Bin, trailer_offset, 16u32)
        });

        let mut blob = Vec::new();
        blob.extend((total_entries as u32).to_be_bytes());
        blob.extend((arena.len() as u32).to_be_bytes());
        for (tag, kind, offset, count) in region_entry.into_iter().chain(index) {
            blob.extend(tag.to_be_bytes());
            blob.extend((kind as u32).to_be_bytes());
            blob.extend((offset as i32).to_be_bytes());
            blob.extend(count.to_be_bytes());
        }
        blob.extend(arena);

        let mut blob = blob;
        mutate(&mut blob);
        blob
    }
}

impl Default for HeaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Package headers ────────────────────────────────────────────────

/// Shorthand description of a package for fixture headers.
#[derive(Default)]
pub struct PackageSpec {
    pub name: &'static str,
    pub version: &'static str,
    pub release: &'static str,
    pub arch: &'static str,
    pub epoch: Option<i32>,
    pub source_rpm: &'static str,
    pub module: &'static str,
    pub files: &'static [&'static str],
}

/// Serialize a realistic package header: region envelope plus the
/// dirname-compressed filename triple.
pub fn package_header(spec: &PackageSpec) -> Vec<u8> {
    let mut b = HeaderBuilder::new()
        .region(tag::TAG_HEADER_IMMUTABLE)
        .entry(tag::TAG_NAME, TestValue::Str(spec.name.into()))
        .entry(tag::TAG_VERSION, TestValue::Str(spec.version.into()))
        .entry(tag::TAG_RELEASE, TestValue::Str(spec.release.into()));
    if let Some(epoch) = spec.epoch {
        b = b.entry(tag::TAG_EPOCH, TestValue::I32(vec![epoch]));
    }
    if !spec.arch.is_empty() {
        b = b.entry(tag::TAG_ARCH, TestValue::Str(spec.arch.into()));
    }
    if !spec.source_rpm.is_empty() {
        b = b.entry(tag::TAG_SOURCE_RPM, TestValue::Str(spec.source_rpm.into()));
    }
    if !spec.module.is_empty() {
        b = b.entry(tag::TAG_MODULARITY_LABEL, TestValue::Str(spec.module.into()));
    }
    if !spec.files.is_empty() {
        let paths: Vec<String> = spec.files.iter().map(|s| s.to_string()).collect();
        let (dirs, indexes, bases) = crate::package::synthesize_dirnames(paths);
        b = b
            .entry(tag::TAG_DIR_INDEXES, TestValue::I32(indexes))
            .entry(tag::TAG_BASENAMES, TestValue::StrArray(bases))
            .entry(tag::TAG_DIR_NAMES, TestValue::StrArray(dirs));
    }
    b.build()
}

/// Deterministic filler package for corpus-sized fixtures.
pub fn package_spec_header(i: usize) -> Vec<u8> {
    let name: &'static str = Box::leak(format!("pkg-{i:03}").into_boxed_str());
    let version: &'static str = Box::leak(format!("1.{i}").into_boxed_str());
    let file: &'static str =
        Box::leak(format!("/usr/lib/pkg-{i:03}/data").into_boxed_str());
    let files: &'static [&'static str] = Box::leak(vec![file].into_boxed_slice());
    package_header(&PackageSpec {
        name,
        version,
        release: "1.el8",
        arch: "x86_64",
        files,
        ..Default::default()
    })
}

// ── PGP packets ────────────────────────────────────────────────────

/// Minimal V4 signature packet (old-format framing) carrying an issuer
/// subpacket in the unhashed area.
pub fn v4_signature_packet(sigtype: u8, keyid: [u8; 8]) -> Vec<u8> {
    let mut body = vec![4u8, sigtype, 1, 8];
    body.extend(0u16.to_be_bytes()); // no hashed subpackets
    let mut sub = vec![9u8, 16u8]; // length, issuer type
    sub.extend(keyid);
    body.extend((sub.len() as u16).to_be_bytes());
    body.extend(sub);
    body.extend([0xde, 0xad]); // left 16 bits of hash
    let mut pkt = vec![0x88, body.len() as u8];
    pkt.extend(body);
    pkt
}

/// Minimal V3 signature packet with the key id in its fixed position.
pub fn v3_signature_packet(keyid: [u8; 8]) -> Vec<u8> {
    let mut body = vec![3u8, 5, 0];
    body.extend([0u8; 4]); // creation time
    body.extend(keyid);
    body.extend([1u8, 8]); // pubkey and hash algorithms
    let mut pkt = vec![0x88, body.len() as u8];
    pkt.extend(body);
    pkt
}

// ── BerkeleyDB hash files ──────────────────────────────────────────

const PS: usize = 4096;
const PAGE_HEADER: usize = 26;

/// One value for the bdb builder to store.
pub enum BdbValue {
    /// Stored inline on the hash page.
    Inline(Vec<u8>),
    /// Stored on an overflow chain.
    OffPage(Vec<u8>),
    /// An entry with an arbitrary type byte, for unsupported-type tests.
    RawType(u8, Vec<u8>),
}

/// Builds a single-bucket BerkeleyDB hash file in either byte order.
pub struct BdbBuilder {
    order: ByteOrder,
    values: Vec<BdbValue>,
}

struct HashPageState {
    pgno: usize,
    nslots: usize,
    floor: usize,
}

impl BdbBuilder {
    pub fn new(order: ByteOrder) -> Self {
        Self { order, values: Vec::new() }
    }

    pub fn value(mut self, v: BdbValue) -> Self {
        self.values.push(v);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let order = self.order;
        let mut pages: Vec<Vec<u8>> = vec![vec![0u8; PS]]; // meta, filled last
        let mut cur: Option<HashPageState> = None;

        // Package-count pair under the all-zero key, then the values.
        let zero_key = entry_bytes(1, &[0, 0, 0, 0]);
        let count_val = entry_bytes(1, &(self.values.len() as u32).to_le_bytes());
        insert_pair(order, &mut pages, &mut cur, &zero_key, &count_val);

        for (i, v) in self.values.iter().enumerate() {
            let key = entry_bytes(1, &(i as u32 + 1).to_le_bytes());
            let val = match v {
                BdbValue::Inline(d) => entry_bytes(1, d),
                BdbValue::RawType(t, d) => entry_bytes(*t, d),
                BdbValue::OffPage(d) => {
                    let (pgno, tlen) = append_overflow_chain(order, &mut pages, d);
                    let mut e = vec![3u8, 0, 0, 0];
                    e.extend(ser_u32(order, pgno as u32));
                    e.extend(ser_u32(order, tlen));
                    e
                }
            };
            insert_pair(order, &mut pages, &mut cur, &key, &val);
        }

        // Metadata page.
        let last_pgno = pages.len() as u32 - 1;
        let meta = &mut pages[0];
        write_lsn(order, meta);
        meta[12..16].copy_from_slice(&ser_u32(order, crate::bdb::HASH_MAGIC));
        meta[16..20].copy_from_slice(&ser_u32(order, 9)); // version
        meta[20..24].copy_from_slice(&ser_u32(order, PS as u32));
        meta[24] = 0; // unencrypted
        meta[25] = 8; // hash metadata
        meta[32..36].copy_from_slice(&ser_u32(order, last_pgno));
        meta[72..76].copy_from_slice(&ser_u32(order, 0)); // max_bucket
        meta[96..100].copy_from_slice(&ser_u32(order, 1)); // spares[0]: bucket 0 on page 1

        pages.concat()
    }
}

fn ser_u16(order: ByteOrder, v: u16) -> [u8; 2] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

fn ser_u32(order: ByteOrder, v: u32) -> [u8; 4] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

/// All pages share one LSN so the metadata check passes.
fn write_lsn(order: ByteOrder, page: &mut [u8]) {
    page[0..4].copy_from_slice(&ser_u32(order, 1));
    page[4..8].copy_from_slice(&ser_u32(order, 0x42));
}

fn entry_bytes(entry_type: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![entry_type];
    out.extend_from_slice(data);
    out
}

fn new_hash_page(order: ByteOrder, pages: &mut Vec<Vec<u8>>) -> usize {
    let mut page = vec![0u8; PS];
    write_lsn(order, &mut page);
    page[25] = 13; // sorted hash page
    pages.push(page);
    pages.len() - 1
}

fn insert_pair(
    order: ByteOrder,
    pages: &mut Vec<Vec<u8>>,
    cur: &mut Option<HashPageState>,
    key: &[u8],
    val: &[u8],
) {
    let needed = 4 + key.len() + val.len();
    loop {
        if cur.is_none() {
            let pgno = new_hash_page(order, pages);
            *cur = Some(HashPageState { pgno, nslots: 0, floor: PS });
        }
        let state = cur.as_mut().unwrap();
        let free = state.floor - (PAGE_HEADER + 2 * state.nslots);
        if needed > free {
            // Chain a fresh page off the full one.
            let full_pgno = state.pgno;
            let next = new_hash_page(order, pages);
            pages[full_pgno][16..20].copy_from_slice(&ser_u32(order, next as u32));
            *cur = Some(HashPageState { pgno: next, nslots: 0, floor: PS });
            continue;
        }

        let state = cur.as_mut().unwrap();
        let page = &mut pages[state.pgno];
        for item in [key, val] {
            state.floor -= item.len();
            page[state.floor..state.floor + item.len()].copy_from_slice(item);
            let slot_at = PAGE_HEADER + 2 * state.nslots;
            page[slot_at..slot_at + 2].copy_from_slice(&ser_u16(order, state.floor as u16));
            state.nslots += 1;
        }
        page[20..22].copy_from_slice(&ser_u16(order, state.nslots as u16));
        return;
    }
}

fn append_overflow_chain(
    order: ByteOrder,
    pages: &mut Vec<Vec<u8>>,
    data: &[u8],
) -> (usize, u32) {
    let capacity = PS - PAGE_HEADER;
    let first = pages.len();
    let chunks: Vec<&[u8]> = data.chunks(capacity).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = vec![0u8; PS];
        write_lsn(order, &mut page);
        page[25] = 7; // overflow
        page[22..24].copy_from_slice(&ser_u16(order, chunk.len() as u16));
        let next = if i + 1 < chunks.len() { (first + i + 1) as u32 } else { 0 };
        page[16..20].copy_from_slice(&ser_u32(order, next));
        page[PAGE_HEADER..PAGE_HEADER + chunk.len()].copy_from_slice(chunk);
        pages.push(page);
    }
    (first, data.len() as u32)
}

// ── NDB files ──────────────────────────────────────────────────────

/// Builds an NDB package file with one slot page.
pub struct NdbBuilder {
    items: Vec<Option<Vec<u8>>>,
}

impl NdbBuilder {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn blob(mut self, data: Vec<u8>) -> Self {
        self.items.push(Some(data));
        self
    }

    /// A slot whose package was removed: magic kept, index zeroed.
    pub fn free_slot(mut self) -> Self {
        self.items.push(None);
        self
    }

    pub fn build(self) -> Vec<u8> {
        assert!(self.items.len() <= 254, "one slot page holds 254 slots");
        let mut file = vec![0u8; PS];

        // Header: magic, version, generation, slot pages, next index.
        file[0..4].copy_from_slice(b"RpmP");
        file[4..8].copy_from_slice(&0u32.to_le_bytes());
        file[8..12].copy_from_slice(&1u32.to_le_bytes());
        file[12..16].copy_from_slice(&1u32.to_le_bytes());
        file[16..20].copy_from_slice(&(self.items.len() as u32 + 1).to_le_bytes());

        // Every slot position carries the magic, occupied or not.
        for slot in (32..PS).step_by(16) {
            file[slot..slot + 4].copy_from_slice(b"Slot");
        }

        for (i, item) in self.items.iter().enumerate() {
            let slot = 32 + i * 16;
            let Some(data) = item else {
                continue; // free: index and extent stay zero
            };
            let idx = i as u32 + 1;
            let total = (16 + data.len() + 12 + 15) / 16 * 16;
            let blk_offset = (file.len() / 16) as u32;
            let blk_count = (total / 16) as u32;

            let mut blob = vec![0u8; total];
            blob[0..4].copy_from_slice(b"BlbS");
            blob[4..8].copy_from_slice(&idx.to_le_bytes());
            blob[8..12].copy_from_slice(&1u32.to_le_bytes());
            blob[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
            blob[16..16 + data.len()].copy_from_slice(data);

            let trailer = total - 12;
            let mut hasher = adler32::RollingAdler32::new();
            hasher.update_buffer(&blob[..trailer]);
            blob[trailer..trailer + 4].copy_from_slice(&hasher.hash().to_le_bytes());
            blob[trailer + 4..trailer + 8]
                .copy_from_slice(&(data.len() as u32).to_le_bytes());
            blob[trailer + 8..trailer + 12].copy_from_slice(b"BlbE");

            file.extend(blob);

            file[slot + 4..slot + 8].copy_from_slice(&idx.to_le_bytes());
            file[slot + 8..slot + 12].copy_from_slice(&blk_offset.to_le_bytes());
            file[slot + 12..slot + 16].copy_from_slice(&blk_count.to_le_bytes());
        }
        file
    }
}

impl Default for NdbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── SQLite files ───────────────────────────────────────────────────

/// Write an `rpmdb.sqlite` fixture with sequential `hnum` keys.
pub fn sqlite_db(path: &Path, blobs: &[Vec<u8>]) {
    let numbered: Vec<(i64, Vec<u8>)> = blobs
        .iter()
        .enumerate()
        .map(|(i, b)| (i as i64 + 1, b.clone()))
        .collect();
    sqlite_db_with_hnums(path, &numbered);
}

/// Write an `rpmdb.sqlite` fixture with explicit `hnum` keys.
pub fn sqlite_db_with_hnums(path: &Path, rows: &[(i64, Vec<u8>)]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE Packages (hnum INTEGER PRIMARY KEY, blob BLOB NOT NULL)")
        .unwrap();
    for (hnum, blob) in rows {
        conn.execute(
            "INSERT INTO Packages (hnum, blob) VALUES (?1, ?2)",
            rusqlite::params![hnum, blob],
        )
        .unwrap();
    }
}
