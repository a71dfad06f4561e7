//! Database discovery and open.
//!
//! Discovery walks a layer on a producer thread, classifies candidate
//! files by leaf name and magic, and hands `{dir, kind}` pairs to the
//! consumer over a bounded channel. Open turns a found database into a
//! backend: through the layer's random-access view when it has one, or
//! through a temporary spool file otherwise. The SQLite driver always
//! needs a real path, so that backend always spools.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};
use memmap2::Mmap;
use tempfile::NamedTempFile;

use crate::bdb::{self, BdbReader};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fs::{FileKind, LayerFs, WalkStep};
use crate::io::{ReadAt, Rope};
use crate::ndb::{self, NdbReader};
use crate::sqlite::SqliteReader;

// ── Classification ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbKind {
    Bdb,
    Sqlite,
    Ndb,
}

impl DbKind {
    /// Leaf name of the backend's main file.
    pub fn filename(&self) -> &'static str {
        match self {
            DbKind::Bdb => "Packages",
            DbKind::Sqlite => "rpmdb.sqlite",
            DbKind::Ndb => "Packages.db",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbKind::Bdb => "bdb",
            DbKind::Sqlite => "sqlite",
            DbKind::Ndb => "ndb",
        }
    }
}

/// A database located inside a layer. The named file has passed the magic
/// probe for its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDb {
    pub dir: PathBuf,
    pub kind: DbKind,
}

impl FoundDb {
    /// The `<kind>:<dir>` identifier recorded on emitted packages.
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.dir.display())
    }
}

/// Classify one regular file by leaf name and magic. `Ok(None)` means the
/// file is not a database; probe IO errors are reported to the caller.
fn classify(fs: &dyn LayerFs, path: &Path) -> Result<Option<DbKind>> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    match name {
        "Packages" => {
            let mut prefix = [0u8; 16];
            let n = read_prefix(fs, path, &mut prefix)?;
            Ok(bdb::magic_matches(&prefix[..n]).then_some(DbKind::Bdb))
        }
        "Packages.db" => {
            let mut prefix = [0u8; 4];
            let n = read_prefix(fs, path, &mut prefix)?;
            Ok(ndb::magic_matches(&prefix[..n]).then_some(DbKind::Ndb))
        }
        // Validated on open; the driver does its own format check.
        "rpmdb.sqlite" => Ok(Some(DbKind::Sqlite)),
        _ => Ok(None),
    }
}

fn read_prefix(fs: &dyn LayerFs, path: &Path, buf: &mut [u8]) -> Result<usize> {
    let mut src = fs.open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ── Discovery ──────────────────────────────────────────────────────

/// Walk a layer for rpm databases. Emission is lazy: the walk runs on a
/// producer thread and pairs arrive in filesystem-walk order. Dropping
/// the iterator cancels the producer; that exit is suppressed, while
/// token cancellation surfaces as a final `Err(Cancelled)` item.
pub fn find_dbs(fs: Arc<dyn LayerFs>, token: CancelToken) -> FoundDbs {
    let (tx, rx) = bounded::<Result<FoundDb>>(8);
    let producer_token = token.clone();
    let handle = std::thread::spawn(move || {
        let walked = fs.walk(&mut |path, info| {
            if producer_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if info.kind != FileKind::File {
                return Ok(WalkStep::Continue);
            }
            let kind = match classify(&*fs, path) {
                Ok(Some(kind)) => kind,
                Ok(None) => return Ok(WalkStep::Continue),
                Err(e) => {
                    tracing::debug!("probe of {} failed: {}", path.display(), e);
                    return Ok(WalkStep::Continue);
                }
            };
            let found = FoundDb {
                dir: path.parent().unwrap_or(Path::new("")).to_path_buf(),
                kind,
            };
            crossbeam_channel::select! {
                send(tx, Ok(found)) -> sent => {
                    // Consumer gone: stop quietly.
                    if sent.is_err() {
                        return Ok(WalkStep::Stop);
                    }
                }
                recv(producer_token.channel()) -> _ => return Err(Error::Cancelled),
            }
            Ok(WalkStep::Continue)
        });
        match walked {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                let _ = tx.try_send(Err(Error::Cancelled));
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    });
    FoundDbs {
        rx: Some(rx),
        token,
        reported_cancel: false,
        handle: Some(handle),
    }
}

/// Iterator side of [`find_dbs`].
pub struct FoundDbs {
    rx: Option<Receiver<Result<FoundDb>>>,
    token: CancelToken,
    reported_cancel: bool,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for FoundDbs {
    type Item = Result<FoundDb>;

    fn next(&mut self) -> Option<Self::Item> {
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(item) => {
                if matches!(item, Err(Error::Cancelled)) {
                    self.reported_cancel = true;
                }
                Some(item)
            }
            Err(_) => {
                // Producer finished. If the token preempted it before it
                // could say so, report the cancellation once.
                if self.token.is_cancelled() && !self.reported_cancel {
                    self.reported_cancel = true;
                    Some(Err(Error::Cancelled))
                } else {
                    None
                }
            }
        }
    }
}

impl Drop for FoundDbs {
    fn drop(&mut self) {
        // Close our side first so a blocked producer send fails fast.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ── Open ───────────────────────────────────────────────────────────

/// One open backend behind a uniform header-iteration surface.
#[derive(Debug)]
pub enum Backend {
    Bdb(BdbReader),
    Ndb(NdbReader),
    Sqlite(SqliteReader),
}

impl Backend {
    pub fn validate(&self) -> Result<()> {
        match self {
            Backend::Bdb(db) => db.validate(),
            Backend::Ndb(db) => db.validate(),
            Backend::Sqlite(db) => db.validate(),
        }
    }

    /// Single-use lazy sequence of header blobs.
    pub fn headers(&self) -> BackendHeaders<'_> {
        match self {
            Backend::Bdb(db) => BackendHeaders::Bdb(db.headers()),
            Backend::Ndb(db) => BackendHeaders::Ndb(db.headers()),
            Backend::Sqlite(db) => BackendHeaders::Sqlite(db.headers()),
        }
    }
}

pub enum BackendHeaders<'a> {
    Bdb(crate::bdb::Headers<'a>),
    Ndb(crate::ndb::Headers<'a>),
    Sqlite(crate::sqlite::Headers<'a>),
}

impl Iterator for BackendHeaders<'_> {
    type Item = Result<Rope>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BackendHeaders::Bdb(it) => it.next(),
            BackendHeaders::Ndb(it) => it.next(),
            BackendHeaders::Sqlite(it) => it.next(),
        }
    }
}

/// An opened database. Holds the spool file, if one was needed, for as
/// long as the backend lives; the spool unlinks on drop.
#[derive(Debug)]
pub struct OpenedDb {
    pub found: FoundDb,
    backend: Backend,
    _spool: Option<NamedTempFile>,
}

impl OpenedDb {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

/// Open the backend for a discovered database and validate it.
pub fn open_db(
    fs: &dyn LayerFs,
    found: &FoundDb,
    spool_dir: Option<&Path>,
) -> Result<OpenedDb> {
    let file_path = found.dir.join(found.kind.filename());
    match found.kind {
        DbKind::Sqlite => {
            let (path, spool) = spool(fs, &file_path, spool_dir)?;
            let reader = SqliteReader::open(&path)?;
            reader.validate()?;
            Ok(OpenedDb {
                found: found.clone(),
                backend: Backend::Sqlite(reader),
                _spool: Some(spool),
            })
        }
        DbKind::Bdb | DbKind::Ndb => {
            let (src, spool): (Arc<dyn ReadAt>, Option<NamedTempFile>) =
                match fs.open_at(&file_path) {
                    Some(view) => (view?, None),
                    None => {
                        let (path, spool) = spool(fs, &file_path, spool_dir)?;
                        let file = File::open(&path)?;
                        if file.metadata()?.len() == 0 {
                            return Err(Error::NotAnRpmDatabase(format!(
                                "{}: empty file",
                                file_path.display()
                            )));
                        }
                        let mmap = unsafe { Mmap::map(&file) }?;
                        (Arc::new(mmap), Some(spool))
                    }
                };
            let backend = match found.kind {
                DbKind::Bdb => Backend::Bdb(BdbReader::new(src)?),
                DbKind::Ndb => Backend::Ndb(NdbReader::new(src)?),
                DbKind::Sqlite => unreachable!(),
            };
            backend.validate()?;
            Ok(OpenedDb {
                found: found.clone(),
                backend,
                _spool: spool,
            })
        }
    }
}

/// Copy a layer file into a named temporary file.
fn spool(
    fs: &dyn LayerFs,
    path: &Path,
    dir: Option<&Path>,
) -> Result<(PathBuf, NamedTempFile)> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("rpmdb-spool-");
        b
    };
    let mut file = match dir {
        Some(d) => builder.tempfile_in(d)?,
        None => builder.tempfile()?,
    };
    let mut src = fs.open(path)?;
    std::io::copy(&mut src, file.as_file_mut())?;
    Ok((file.path().to_path_buf(), file))
}
