//! Read-only access to the rpm package databases found inside container
//! layer filesystems.
//!
//! A layer snapshot may carry its installed-package inventory in any of
//! three on-disk shapes: the BerkeleyDB hash `Packages` file, the NDB
//! `Packages.db` slotted-blob file, or the `rpmdb.sqlite` schema. This
//! crate probes a read-only file tree for all three, decodes the header
//! blobs they store, and emits normalized package records.
//!
//! The pieces compose bottom-up:
//!
//! - [`header`] decodes one self-describing tag/value blob.
//! - [`bdb`], [`ndb`] and [`sqlite`] walk the three database layouts and
//!   yield header blobs lazily.
//! - [`package`] lifts the recognized tag subset into [`Info`] and the
//!   consumer-facing [`Package`] record.
//! - [`discover`] classifies candidate files by magic and opens the
//!   right backend, spooling through a temp file when the filesystem has
//!   no random-access view.
//! - [`scanner`] runs the header-to-record pipeline over a whole layer.
//! - [`cache`] memoizes each layer's package-owned path set under weak
//!   references with single-flight deduplication.
//!
//! Nothing here writes to a database, and nothing reads the host
//! filesystem except through the [`LayerFs`] contract.

pub mod bdb;
pub mod cache;
pub mod cancel;
pub mod discover;
pub mod error;
pub mod fs;
pub mod header;
pub mod io;
pub mod ndb;
pub mod package;
pub mod scanner;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{PathSet, PathSetCache};
pub use cancel::{CancelSource, CancelToken};
pub use discover::{find_dbs, open_db, Backend, DbKind, FoundDb, OpenedDb};
pub use error::{Error, Result};
pub use fs::{DirLayer, FileInfo, FileKind, LayerFs, WalkStep};
pub use header::{EntryInfo, Header, Kind, Value};
pub use package::{Info, Package, PackageKind};
pub use scanner::{
    file_paths_in_layer, package_records, packages_in_layer, ScanConfig, ScanReport,
};
