//! Read-only filesystem contract for layer snapshots.
//!
//! The scanner never touches the host filesystem directly: it sees a layer
//! through [`LayerFs`], which a tar-backed store or a test fixture can
//! implement. [`DirLayer`] is the directory-backed implementation used by
//! tests and local scans; it serves random access through a memory map so
//! backends skip the spool.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::Result;
use crate::io::ReadAt;

// ── Contract ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub kind: FileKind,
    pub size: u64,
}

/// Visitor verdict for [`LayerFs::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    Continue,
    /// Stop the walk early; not an error.
    Stop,
}

/// A read-only view of one layer's file tree. Paths are relative to the
/// layer root.
pub trait LayerFs: Send + Sync {
    /// Stream the bytes of a regular file.
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    /// Describe a path without following symlinks.
    fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Depth-first traversal from the root. The visitor sees every entry;
    /// returning [`WalkStep::Stop`] ends the walk cleanly and an error
    /// aborts it.
    fn walk(
        &self,
        visit: &mut dyn FnMut(&Path, &FileInfo) -> Result<WalkStep>,
    ) -> Result<()>;

    /// Random-access view of a regular file, when the backing store can
    /// provide one. Backends spool through a temporary file otherwise.
    fn open_at(&self, _path: &Path) -> Option<Result<Arc<dyn ReadAt>>> {
        None
    }
}

// ── Directory-backed layer ─────────────────────────────────────────

/// A layer rooted at a plain directory.
pub struct DirLayer {
    root: PathBuf,
}

impl DirLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn walk_dir(
        &self,
        rel: &Path,
        visit: &mut dyn FnMut(&Path, &FileInfo) -> Result<WalkStep>,
    ) -> Result<WalkStep> {
        let mut entries: Vec<_> =
            std::fs::read_dir(self.full(rel))?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let rel_path = rel.join(entry.file_name());
            let info = self.stat(&rel_path)?;
            if visit(&rel_path, &info)? == WalkStep::Stop {
                return Ok(WalkStep::Stop);
            }
            if info.kind == FileKind::Dir {
                if self.walk_dir(&rel_path, visit)? == WalkStep::Stop {
                    return Ok(WalkStep::Stop);
                }
            }
        }
        Ok(WalkStep::Continue)
    }
}

impl LayerFs for DirLayer {
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.full(path))?))
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let meta = std::fs::symlink_metadata(self.full(path))?;
        let kind = if meta.file_type().is_dir() {
            FileKind::Dir
        } else if meta.file_type().is_file() {
            FileKind::File
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        };
        Ok(FileInfo { kind, size: meta.len() })
    }

    fn walk(
        &self,
        visit: &mut dyn FnMut(&Path, &FileInfo) -> Result<WalkStep>,
    ) -> Result<()> {
        self.walk_dir(Path::new(""), visit)?;
        Ok(())
    }

    fn open_at(&self, path: &Path) -> Option<Result<Arc<dyn ReadAt>>> {
        let map = || -> Result<Arc<dyn ReadAt>> {
            let file = File::open(self.full(path))?;
            if file.metadata()?.len() == 0 {
                // Cannot map an empty file; an empty buffer reads the same.
                return Ok(Arc::new(Vec::new()));
            }
            let mmap = unsafe { Mmap::map(&file) }?;
            Ok(Arc::new(mmap))
        };
        Some(map())
    }
}
