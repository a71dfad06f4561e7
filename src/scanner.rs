//! Iteration glue: from header blobs to per-layer package results.
//!
//! Every backend exposes the same lazy header sequence; this module runs
//! the header-to-record pipeline over it and drives whole-layer scans.
//! Recoverable errors ride along in the stream and the consumer decides
//! whether to continue; fatal errors end a backend's iteration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;

use crate::cancel::CancelToken;
use crate::discover::{find_dbs, open_db, OpenedDb};
use crate::error::{Error, Result};
use crate::fs::LayerFs;
use crate::header::Header;
use crate::package::{Info, Package};

// ── Configuration ──────────────────────────────────────────────────

/// Scan options. The defaults match production behavior; tests and
/// embedders can narrow the file allow-list or pin the spool directory.
#[derive(Default)]
pub struct ScanConfig {
    /// Overrides the built-in package-owned-file allow-list.
    pub allowlist: Option<Regex>,
    /// Directory for backend spool files; the system default otherwise.
    pub spool_dir: Option<PathBuf>,
}

impl ScanConfig {
    fn files_pattern(&self) -> &Regex {
        self.allowlist.as_ref().unwrap_or_else(|| default_allowlist())
    }
}

/// Paths worth recording in a layer's path set: language-ecosystem
/// artifacts and executables, matched against absolute `/`-paths.
pub fn default_allowlist() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            "^(?:",
            ".*/[^/]+\\.[ejw]ar",                        // Jar/Ear/War
            "|.*/site-packages/[^/]+\\.egg-info/PKG-INFO", // Python egg metadata
            "|.*/package\\.json",                        // npm manifest
            "|.*/[^/]+\\.gemspec",                       // Ruby gem spec
            "|/usr/s?bin/[^/]+",                         // executables
            "|/usr/libexec/[^/]+/[^/]+",                 // libexec executables
            ")$",
        ))
        .unwrap()
    })
}

// ── Record pipelines ───────────────────────────────────────────────

/// Lazy `Info` records over one opened backend. Per-record failures are
/// in-stream; `gpg-pubkey` entries are silently dropped.
pub fn info_records<'a>(db: &'a OpenedDb) -> impl Iterator<Item = Result<Info>> + 'a {
    db.backend().headers().filter_map(|item| match item {
        Ok(blob) => match Header::parse(blob).and_then(|h| Info::load(&h)) {
            Ok(Some(info)) => Some(Ok(info)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        },
        Err(e) => Some(Err(e)),
    })
}

/// Lazy consumer-facing package records over one opened backend.
pub fn package_records<'a>(db: &'a OpenedDb) -> impl Iterator<Item = Result<Package>> + 'a {
    let id = db.found.id();
    info_records(db).map(move |item| item.map(|info| Package::from_info(&info, &id)))
}

// ── Layer drivers ──────────────────────────────────────────────────

/// Outcome of a whole-layer scan: the records plus a summary of the
/// non-fatal errors encountered along the way.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub packages: Vec<Package>,
    pub errors: Vec<Error>,
}

/// Open every database in the layer once (deduplicated by directory) and
/// run `f` over it. Discovery failures and cancellation abort the scan;
/// per-database open failures are collected and the scan continues.
fn for_each_db(
    fs: &Arc<dyn LayerFs>,
    config: &ScanConfig,
    token: &CancelToken,
    f: &mut dyn FnMut(&OpenedDb) -> Result<()>,
) -> Result<Vec<Error>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for item in find_dbs(fs.clone(), token.clone()) {
        let found = item?;
        if !seen.insert(found.dir.clone()) {
            continue;
        }
        match open_db(&**fs, &found, config.spool_dir.as_deref()) {
            Ok(db) => f(&db)?,
            Err(e) => {
                tracing::warn!("failed to open {}: {}", found.id(), e);
                errors.push(e);
            }
        }
    }
    Ok(errors)
}

/// Scan one layer for installed packages.
///
/// Returns an error only when discovery fails outright (or the caller
/// cancels); otherwise the report carries whatever was readable plus the
/// per-database error summary.
pub fn packages_in_layer(
    fs: &Arc<dyn LayerFs>,
    config: &ScanConfig,
    token: &CancelToken,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let open_errors = for_each_db(fs, config, token, &mut |db| {
        for item in package_records(db) {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match item {
                Ok(pkg) => report.packages.push(pkg),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("{}: skipping record: {}", db.found.id(), e);
                    report.errors.push(e);
                }
                Err(e) => {
                    tracing::warn!("{}: iteration ended: {}", db.found.id(), e);
                    report.errors.push(e);
                    break;
                }
            }
        }
        Ok(())
    })?;
    report.errors.extend(open_errors);
    Ok(report)
}

/// Collect the allow-listed file paths claimed by any package in the
/// layer. This is the heavy path behind the layer cache.
pub fn file_paths_in_layer(
    fs: &Arc<dyn LayerFs>,
    config: &ScanConfig,
    token: &CancelToken,
) -> Result<HashSet<String>> {
    let mut paths = HashSet::new();
    let pattern = config.files_pattern();
    for_each_db(fs, config, token, &mut |db| {
        for item in info_records(db) {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match item {
                Ok(info) => {
                    for name in &info.filenames {
                        // The allow-list speaks absolute paths.
                        let absolute = format!("/{}", name);
                        if pattern.is_match(&absolute) {
                            paths.insert(name.clone());
                        }
                    }
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("{}: skipping record: {}", db.found.id(), e);
                }
                Err(e) => {
                    tracing::warn!("{}: iteration ended: {}", db.found.id(), e);
                    break;
                }
            }
        }
        Ok(())
    })?;
    Ok(paths)
}
