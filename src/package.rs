//! Package records lifted out of decoded headers.
//!
//! [`Info`] is the raw per-package extraction: the recognized tag subset
//! plus the reconstructed filename list. [`Package`] is the record handed
//! to consumers, with the version folded into EVR form and a synthesized
//! source package when the SourceRPM filename parses.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::header::{tag, Header, Value};

// ── Info ───────────────────────────────────────────────────────────

/// Payload digest algorithm id for SHA-256.
const DIGEST_ALGO_SHA256: i32 = 8;

/// The tag subset extracted from each package header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Info {
    pub name: String,
    pub epoch: Option<i32>,
    pub version: String,
    pub release: String,
    pub source_rpm: String,
    pub module: String,
    pub arch: String,
    pub digest_algo: i32,
    pub digest: String,
    pub signature: Vec<u8>,
    pub filenames: Vec<String>,
}

impl Info {
    /// Extract the recognized tags from a decoded header.
    ///
    /// Returns `None` for `gpg-pubkey` entries, which are stored in the
    /// database but are not rpm packages.
    pub fn load(h: &Header) -> Result<Option<Info>> {
        let mut info = Info::default();
        let mut dirnames: Option<Vec<String>> = None;
        let mut dirindexes: Option<Vec<i32>> = None;
        let mut basenames: Option<Vec<String>> = None;
        let mut fullpaths: Option<Vec<String>> = None;

        for e in h.entries() {
            match e.tag {
                tag::TAG_NAME => info.name = read_string(h, e)?,
                tag::TAG_VERSION => info.version = read_string(h, e)?,
                tag::TAG_RELEASE => info.release = read_string(h, e)?,
                tag::TAG_SOURCE_RPM => info.source_rpm = read_string(h, e)?,
                tag::TAG_MODULARITY_LABEL => info.module = read_string(h, e)?,
                tag::TAG_ARCH => info.arch = read_string(h, e)?,
                tag::TAG_EPOCH => info.epoch = Some(read_first_i32(h, e)?),
                tag::TAG_PAYLOAD_DIGEST_ALGO => info.digest_algo = read_first_i32(h, e)?,
                tag::TAG_PAYLOAD_DIGEST => {
                    info.digest = read_strings(h, e)?.into_iter().next().unwrap_or_default()
                }
                tag::TAG_SIG_PGP => info.signature = read_bin(h, e)?,
                tag::TAG_DIR_NAMES => dirnames = Some(read_strings(h, e)?),
                tag::TAG_DIR_INDEXES => dirindexes = Some(read_i32s(h, e)?),
                tag::TAG_BASENAMES => basenames = Some(read_strings(h, e)?),
                tag::TAG_OLD_FILENAMES => fullpaths = Some(read_strings(h, e)?),
                _ => {}
            }
        }

        if info.name == "gpg-pubkey" {
            return Ok(None);
        }
        if info.name.is_empty() || info.version.is_empty() || info.release.is_empty() {
            return Err(Error::MalformedHeader(
                "package header missing name, version or release".into(),
            ));
        }

        // Old headers carry full paths; the dirname-compressed triple is
        // synthesized from them. When a header carries both, the full
        // paths win.
        if let Some(paths) = fullpaths {
            let (d, di, b) = synthesize_dirnames(paths);
            dirnames = Some(d);
            dirindexes = Some(di);
            basenames = Some(b);
        }
        info.filenames = join_filenames(&info.name, dirnames, dirindexes, basenames);

        Ok(Some(info))
    }

    /// `[epoch:]version-release`.
    pub fn evr(&self) -> String {
        match self.epoch {
            Some(e) => format!("{}:{}-{}", e, self.version, self.release),
            None => format!("{}-{}", self.version, self.release),
        }
    }

    /// `name-[epoch:]version-release.arch`.
    pub fn nevra(&self) -> String {
        format!("{}-{}.{}", self.name, self.evr(), self.arch)
    }

    /// The `name:stream` prefix of the modularity label, or empty when the
    /// label has fewer than two `:` separators.
    pub fn module_stream(&self) -> &str {
        module_stream(&self.module)
    }

    /// Query-encoded repository hint: the payload hash when it is SHA-256,
    /// plus one `key` pair per signing key id found in the PGP signature.
    pub fn repository_hint(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        if self.digest_algo == DIGEST_ALGO_SHA256 && !self.digest.is_empty() {
            ser.append_pair("hash", &format!("sha256:{}", self.digest));
        }
        for id in pgp_issuer_key_ids(&self.signature) {
            ser.append_pair("key", &id);
        }
        ser.finish()
    }
}

// ── Typed tag reads ────────────────────────────────────────────────
//
// Databases written across three decades swap the string kinds freely;
// reads of a string-kinded tag accept any of the three. Anything else is
// a type mismatch.

fn mismatch(tag: i32, want: &str, got: &Value) -> Error {
    Error::MalformedHeader(format!(
        "tag {}: expected {}, found {:?}",
        tag, want, got
    ))
}

fn read_string(h: &Header, e: &crate::header::EntryInfo) -> Result<String> {
    match h.read(e)? {
        Value::String(s) => Ok(s),
        Value::StringArray(mut v) | Value::I18nString(mut v) if !v.is_empty() => {
            Ok(v.swap_remove(0))
        }
        v => Err(mismatch(e.tag, "string", &v)),
    }
}

fn read_strings(h: &Header, e: &crate::header::EntryInfo) -> Result<Vec<String>> {
    match h.read(e)? {
        Value::StringArray(v) | Value::I18nString(v) => Ok(v),
        Value::String(s) => Ok(vec![s]),
        v => Err(mismatch(e.tag, "string array", &v)),
    }
}

fn read_first_i32(h: &Header, e: &crate::header::EntryInfo) -> Result<i32> {
    match h.read(e)? {
        Value::Int32(v) if !v.is_empty() => Ok(v[0]),
        v => Err(mismatch(e.tag, "int32", &v)),
    }
}

fn read_i32s(h: &Header, e: &crate::header::EntryInfo) -> Result<Vec<i32>> {
    match h.read(e)? {
        Value::Int32(v) => Ok(v),
        v => Err(mismatch(e.tag, "int32 array", &v)),
    }
}

fn read_bin(h: &Header, e: &crate::header::EntryInfo) -> Result<Vec<u8>> {
    match h.read(e)? {
        Value::Bin(b) => Ok(b),
        v => Err(mismatch(e.tag, "binary", &v)),
    }
}

// ── Filenames ──────────────────────────────────────────────────────

/// Build the dirname-compressed triple from a sorted full-path list:
/// dirnames are unique in order of first appearance, dirindexes index
/// into them, basenames are the path tails.
pub(crate) fn synthesize_dirnames(
    mut paths: Vec<String>,
) -> (Vec<String>, Vec<i32>, Vec<String>) {
    paths.sort();
    let mut dirnames: Vec<String> = Vec::new();
    let mut dirindexes = Vec::with_capacity(paths.len());
    let mut basenames = Vec::with_capacity(paths.len());
    for p in &paths {
        let cut = p.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (dir, base) = p.split_at(cut);
        let idx = match dirnames.iter().position(|d| d == dir) {
            Some(i) => i,
            None => {
                dirnames.push(dir.to_string());
                dirnames.len() - 1
            }
        };
        dirindexes.push(idx as i32);
        basenames.push(base.to_string());
    }
    (dirnames, dirindexes, basenames)
}

/// Join the triple into normalized paths: `/`-separated with the leading
/// `/` stripped. Mismatched parallel arrays are logged and yield an empty
/// list; the rest of the record stays usable.
fn join_filenames(
    name: &str,
    dirnames: Option<Vec<String>>,
    dirindexes: Option<Vec<i32>>,
    basenames: Option<Vec<String>>,
) -> Vec<String> {
    let (Some(dirs), Some(indexes), Some(bases)) = (dirnames, dirindexes, basenames) else {
        return Vec::new();
    };
    if bases.len() != indexes.len()
        || indexes
            .iter()
            .any(|&i| i < 0 || i as usize >= dirs.len())
    {
        tracing::warn!(
            "package {}: mismatched filename arrays ({} basenames, {} dirindexes, {} dirnames); dropping filenames",
            name,
            bases.len(),
            indexes.len(),
            dirs.len()
        );
        return Vec::new();
    }
    indexes
        .iter()
        .zip(bases.iter())
        .map(|(&i, base)| {
            let joined = format!("{}{}", dirs[i as usize], base);
            joined.trim_start_matches('/').to_string()
        })
        .collect()
}

/// `name:stream` prefix of a modularity label with at least two `:`.
pub fn module_stream(label: &str) -> &str {
    let mut colons = label.match_indices(':');
    match (colons.next(), colons.next()) {
        (Some(_), Some((second, _))) => &label[..second],
        _ => "",
    }
}

// ── PGP signature walk ─────────────────────────────────────────────
//
// Just enough OpenPGP packet framing to pull issuer key ids out of V3 and
// V4 signature packets over binary documents (signature type zero).
// Anything unparseable ends the walk; a package hint is advisory.

fn pgp_issuer_key_ids(buf: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = buf;
    while let Some((ptag, body, next)) = pgp_packet(rest) {
        if ptag == 2 {
            if let Some(id) = signature_issuer(body) {
                out.push(hex::encode(id));
            }
        }
        rest = next;
    }
    out
}

/// Split one packet off the front: (tag, body, remainder).
fn pgp_packet(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let b0 = *buf.first()?;
    if b0 & 0x80 == 0 {
        return None;
    }
    let (ptag, len, header) = if b0 & 0x40 != 0 {
        // New format lengths: 1, 2 or 5 octets. Partial bodies are not
        // used in rpm signature tags.
        let l0 = *buf.get(1)?;
        match l0 {
            0..=191 => (b0 & 0x3f, l0 as usize, 2),
            192..=223 => {
                let l1 = *buf.get(2)? as usize;
                (b0 & 0x3f, ((l0 as usize - 192) << 8) + l1 + 192, 3)
            }
            255 => {
                let raw: [u8; 4] = buf.get(2..6)?.try_into().ok()?;
                (b0 & 0x3f, u32::from_be_bytes(raw) as usize, 6)
            }
            _ => return None,
        }
    } else {
        let ptag = (b0 >> 2) & 0x0f;
        match b0 & 0x03 {
            0 => (ptag, *buf.get(1)? as usize, 2),
            1 => {
                let raw: [u8; 2] = buf.get(1..3)?.try_into().ok()?;
                (ptag, u16::from_be_bytes(raw) as usize, 3)
            }
            2 => {
                let raw: [u8; 4] = buf.get(1..5)?.try_into().ok()?;
                (ptag, u32::from_be_bytes(raw) as usize, 5)
            }
            // Indeterminate length runs to the end of the buffer.
            _ => (ptag, buf.len() - 1, 1),
        }
    };
    let body = buf.get(header..header + len)?;
    Some((ptag, body, &buf[header + len..]))
}

/// Issuer key id of a V3/V4 signature packet with signature type zero.
fn signature_issuer(body: &[u8]) -> Option<[u8; 8]> {
    match *body.first()? {
        3 => {
            // version, hashed-length (must be 5), type, time, key id.
            if *body.get(1)? != 5 || *body.get(2)? != 0 {
                return None;
            }
            body.get(7..15)?.try_into().ok()
        }
        4 => {
            if *body.get(1)? != 0 {
                return None;
            }
            let raw: [u8; 2] = body.get(4..6)?.try_into().ok()?;
            let hashed_len = u16::from_be_bytes(raw) as usize;
            let hashed = body.get(6..6 + hashed_len)?;
            let unhashed_at = 6 + hashed_len;
            let raw: [u8; 2] = body.get(unhashed_at..unhashed_at + 2)?.try_into().ok()?;
            let unhashed_len = u16::from_be_bytes(raw) as usize;
            let unhashed = body.get(unhashed_at + 2..unhashed_at + 2 + unhashed_len)?;
            subpacket_issuer(hashed).or_else(|| subpacket_issuer(unhashed))
        }
        _ => None,
    }
}

/// Scan a subpacket area for the issuer (type 16) subpacket.
fn subpacket_issuer(mut area: &[u8]) -> Option<[u8; 8]> {
    while !area.is_empty() {
        let l0 = *area.first()?;
        let (len, header) = match l0 {
            0..=191 => (l0 as usize, 1),
            192..=254 => {
                let l1 = *area.get(1)? as usize;
                (((l0 as usize - 192) << 8) + l1 + 192, 2)
            }
            255 => {
                let raw: [u8; 4] = area.get(1..5)?.try_into().ok()?;
                (u32::from_be_bytes(raw) as usize, 5)
            }
        };
        if len == 0 {
            return None;
        }
        let body = area.get(header..header + len)?;
        if body[0] & 0x7f == 16 {
            return body.get(1..9)?.try_into().ok();
        }
        area = &area[header + len..];
    }
    None
}

// ── Package ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    Binary,
    Source,
}

/// The record emitted to consumers, one per installed package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// `[epoch:]version-release`.
    pub version: String,
    pub kind: PackageKind,
    /// Synthesized from the SourceRPM filename when it parses as an NVR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Box<Package>>,
    /// `name:stream`, or empty for non-modular packages.
    pub module: String,
    pub arch: String,
    /// Query-encoded hash and signing-key hints.
    pub repository_hint: String,
    /// `<kind>:<dir>` of the database the record came from.
    pub package_db: String,
}

impl Package {
    /// Build the emitted record for one extracted package.
    pub fn from_info(info: &Info, package_db: &str) -> Package {
        let module = info.module_stream().to_string();
        let source = match parse_source_nvr(&info.source_rpm) {
            Some((name, version, release)) => Some(Box::new(Package {
                name,
                version: format!("{}-{}", version, release),
                kind: PackageKind::Source,
                source: None,
                module: module.clone(),
                arch: String::new(),
                repository_hint: String::new(),
                package_db: package_db.to_string(),
            })),
            None => {
                if !info.source_rpm.is_empty() {
                    tracing::debug!(
                        "package {}: source rpm {:?} does not parse as an NVR",
                        info.name,
                        info.source_rpm
                    );
                }
                None
            }
        };
        Package {
            name: info.name.clone(),
            version: info.evr(),
            kind: PackageKind::Binary,
            source,
            module,
            arch: info.arch.clone(),
            repository_hint: info.repository_hint(),
            package_db: package_db.to_string(),
        }
    }
}

/// Parse `name-version-release` out of a source rpm filename, stripping
/// one of the rpm suffixes first.
pub(crate) fn parse_source_nvr(filename: &str) -> Option<(String, String, String)> {
    let stem = filename
        .strip_suffix(".nosrc.rpm")
        .or_else(|| filename.strip_suffix(".src.rpm"))
        .or_else(|| filename.strip_suffix(".rpm"))?;
    let (nv, release) = stem.rsplit_once('-')?;
    let (name, version) = nv.rsplit_once('-')?;
    if name.is_empty() || version.is_empty() || release.is_empty() {
        return None;
    }
    Some((name.to_string(), version.to_string(), release.to_string()))
}
