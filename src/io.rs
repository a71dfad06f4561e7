//! Random-access byte sources.
//!
//! Backends hand the header decoder a read-only window into their file. For
//! inline values that window is a single owned buffer; for values that span
//! several on-disk pages it is a `Rope` stitching the page fragments into
//! one contiguous view.

use std::fs::File;
use std::io;
use std::sync::Arc;

// ── ReadAt ─────────────────────────────────────────────────────────

/// Positioned reads over an immutable byte source.
pub trait ReadAt: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; 0 means end of source.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` exactly, failing with `UnexpectedEof` on a short source.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read from byte source",
                    ))
                }
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        slice_read_at(self, buf, offset)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn size(&self) -> u64 {
        self.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

impl ReadAt for memmap2::Mmap {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        slice_read_at(self, buf, offset)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

fn slice_read_at(data: &[u8], buf: &mut [u8], offset: u64) -> io::Result<usize> {
    if offset >= data.len() as u64 {
        return Ok(0);
    }
    let start = offset as usize;
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}

// ── Rope ───────────────────────────────────────────────────────────

/// An append-only concatenation of byte ranges presenting a single
/// random-access view.
///
/// Used to reassemble a header that spans multiple overflow pages (bdb) and
/// to window a blob out of a larger mapping (ndb). `size()` is the sum of
/// segment sizes; reads spanning segment boundaries are transparent.
pub struct Rope {
    segments: Vec<Segment>,
    size: u64,
}

struct Segment {
    src: Arc<dyn ReadAt>,
    offset: u64,
    len: u64,
}

impl Rope {
    pub fn new() -> Self {
        Self { segments: Vec::new(), size: 0 }
    }

    /// A rope over one owned buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        let mut rope = Self::new();
        rope.push(Arc::new(data), 0, len);
        rope
    }

    /// Append `len` bytes of `src` starting at `offset`.
    pub fn push(&mut self, src: Arc<dyn ReadAt>, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.size += len;
        self.segments.push(Segment { src, offset, len });
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copy the whole rope into one buffer.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.read_exact_at(&mut out, 0)?;
        Ok(out)
    }
}

impl Default for Rope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Rope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rope")
            .field("segments", &self.segments.len())
            .field("size", &self.size)
            .finish()
    }
}

impl ReadAt for Rope {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let mut seg_start = 0u64;
        let mut filled = 0usize;
        let mut pos = offset;
        for seg in &self.segments {
            let seg_end = seg_start + seg.len;
            if pos < seg_end {
                let within = pos - seg_start;
                let want = (buf.len() - filled).min((seg.len - within) as usize);
                seg.src
                    .read_exact_at(&mut buf[filled..filled + want], seg.offset + within)?;
                filled += want;
                pos += want as u64;
                if filled == buf.len() {
                    break;
                }
            }
            seg_start = seg_end;
        }
        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
