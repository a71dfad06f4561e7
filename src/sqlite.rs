//! SQLite rpm database backend.
//!
//! The `rpmdb.sqlite` schema stores one header blob per row:
//! `Packages(hnum INTEGER PRIMARY KEY, blob BLOB NOT NULL)`. The reader
//! streams blobs in primary-key order without holding a statement across
//! iterator steps (each step re-seeks past the last key), so the iterator
//! borrows only the connection.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};
use crate::io::Rope;

/// Read-only view over one `rpmdb.sqlite` file.
#[derive(Debug)]
pub struct SqliteReader {
    conn: Connection,
}

impl SqliteReader {
    /// Open the database read-only. The driver demands a real file path,
    /// which is why discovery spools this backend.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(Self { conn })
    }

    /// The file is an rpm database only if the package query runs and
    /// returns at least one row.
    pub fn validate(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT hnum FROM Packages ORDER BY hnum LIMIT 1")
            .map_err(|e| Error::NotAnRpmDatabase(format!("package query failed: {}", e)))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| Error::NotAnRpmDatabase(format!("package query failed: {}", e)))?;
        match rows.next()? {
            Some(_) => Ok(()),
            None => Err(Error::NotAnRpmDatabase("no package rows".into())),
        }
    }

    /// Lazy sequence of header blobs ordered by `hnum`.
    pub fn headers(&self) -> Headers<'_> {
        Headers {
            conn: &self.conn,
            last: None,
            fused: false,
        }
    }
}

/// Iterator over header blobs. A driver error is fatal and fuses the
/// iterator.
pub struct Headers<'a> {
    conn: &'a Connection,
    last: Option<i64>,
    fused: bool,
}

impl Headers<'_> {
    fn step(&mut self) -> Result<Option<(i64, Vec<u8>)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT hnum, blob FROM Packages WHERE hnum > ?1 ORDER BY hnum LIMIT 1",
        )?;
        let mut rows = stmt.query([self.last.unwrap_or(i64::MIN)])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }
}

impl Iterator for Headers<'_> {
    type Item = Result<Rope>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.step() {
            Ok(Some((hnum, blob))) => {
                self.last = Some(hnum);
                Some(Ok(Rope::from_vec(blob)))
            }
            Ok(None) => None,
            Err(e) => {
                self.fused = true;
                Some(Err(e))
            }
        }
    }
}
