//! # Extraction Module
//!
//! Reading side of the archive: listing, verification and unpacking. The low-level
//! random-access API lives in [`reader`]; this module drives it through the worker
//! pool for bulk operations.
//!
//! Unpacking runs in fixed phases so that nothing is written before every selected
//! path has passed the containment check:
//!
//! 1. select entries and check every target path and symlink target,
//! 2. create directories,
//! 3. decompress files in parallel and write them in archive order,
//! 4. create symlinks,
//! 5. restore directory permissions, deepest first.

pub mod reader;

pub use reader::ArchiveReader;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::common::{display_size, Entry, EntryKind, ErrorPolicy, Summary};
use crate::compress::block::DEFAULT_MAX_ENTRY_SIZE;
use crate::fsx;
use crate::path::{check_link_chain, is_within, normalize_archive_path, resolve_within};
use crate::workers::{resolve_threads, CancelToken, WorkerPool, DEFAULT_MAX_THREADS};
use crate::ArchiverError;

use reader::restore_entry;

/// Suffix of files that are still being written. A file carrying it after an
/// interrupted unpack is incomplete.
pub const PARTIAL_SUFFIX: &str = ".wpack-partial";

/// Options that control unpacking and verification.
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// Worker threads. 0 means one per CPU.
    pub threads: usize,
    pub max_threads: usize,
    /// Blocks in flight between read and write. 0 means twice the thread count.
    pub window: usize,
    /// What to do when an entry fails its integrity check.
    pub on_mismatch: ErrorPolicy,
    /// Apply recorded permission bits (best effort).
    pub restore_permissions: bool,
    /// Refuse to inflate any single entry beyond this many bytes.
    pub max_entry_size: u64,
    pub cancel: CancelToken,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            max_threads: DEFAULT_MAX_THREADS,
            window: 0,
            on_mismatch: ErrorPolicy::SkipAndReport,
            restore_permissions: true,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            cancel: CancelToken::new(),
        }
    }
}

impl UnpackOptions {
    fn pool(&self) -> Result<WorkerPool, ArchiverError> {
        let threads = resolve_threads(self.threads, self.max_threads);
        WorkerPool::new(threads, self.window, self.cancel.clone())
    }
}

/// Result of [`verify`].
#[derive(Debug, Clone)]
pub struct Verification {
    /// Whether the whole-container CRC-32 in the footer matches the file.
    pub container_checksum_ok: bool,
    pub summary: Summary,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.container_checksum_ok && self.summary.is_clean()
    }
}

/// Returns every entry of the archive without touching payload blocks.
pub fn list(archive: impl AsRef<Path>) -> Result<Vec<Entry>, ArchiverError> {
    Ok(ArchiveReader::open(archive)?.list())
}

/// Returns `(path, sha256 hex)` for every file entry, straight from the index.
pub fn digests(archive: impl AsRef<Path>) -> Result<Vec<(String, String)>, ArchiverError> {
    let reader = ArchiveReader::open(archive)?;
    Ok(reader
        .entries()
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| (e.path.clone(), e.digest_hex()))
        .collect())
}

/// Checks the whole-container checksum, then decompresses and checks every entry.
///
/// Entries that fail are counted in the summary; with [`ErrorPolicy::Abort`] the
/// first failure is returned as `Err` instead.
pub fn verify(archive: impl AsRef<Path>, options: &UnpackOptions) -> Result<Verification, ArchiverError> {
    let started = Instant::now();
    let mut reader = ArchiveReader::open(archive.as_ref())?.with_max_entry_size(options.max_entry_size);

    let container_checksum_ok = reader.container_checksum()? == reader.footer().container_crc32;
    if !container_checksum_ok {
        tracing::warn!(archive = %reader.path().display(), "container checksum mismatch");
    }

    let mut summary = Summary::default();
    let (dirs, payload): (Vec<Entry>, Vec<Entry>) = reader.list().into_iter().partition(Entry::is_dir);
    summary.processed += dirs.len() as u64;

    let pool = options.pool()?;
    run_restore(&pool, &mut reader, payload, options.max_entry_size, |entry, restored| {
        summary.bytes_in += entry.compressed_size;
        match restored {
            Ok(bytes) => {
                summary.processed += 1;
                summary.bytes_out += bytes.len() as u64;
                Ok(())
            }
            Err(e) => on_entry_failure(&mut summary, &entry, e, options.on_mismatch),
        }
    })?;

    summary.elapsed = started.elapsed();
    tracing::info!(
        entries = summary.processed,
        failed = summary.failed,
        container_ok = container_checksum_ok,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "verify complete"
    );
    Ok(Verification { container_checksum_ok, summary })
}

/// Unpacks `selection` (everything when empty) from `archive` into `dest`.
///
/// A selected directory brings all of its descendants. Every target path and symlink
/// target is checked against `dest` before anything is written; one escape fails the
/// whole run with `PathEscape`.
pub fn unpack(
    archive: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    selection: &[String],
    options: &UnpackOptions,
) -> Result<Summary, ArchiverError> {
    let started = Instant::now();
    let dest = dest.as_ref();
    let mut reader = ArchiveReader::open(archive.as_ref())?.with_max_entry_size(options.max_entry_size);
    let mut summary = Summary::default();

    let selected = select(reader.entries(), selection)?;

    // --- Phase 1: containment ---
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut links = Vec::new();
    for entry in selected {
        let target = resolve_within(dest, &entry.path)?;
        match entry.kind {
            EntryKind::Directory => dirs.push((entry, target)),
            EntryKind::File => files.push(entry),
            EntryKind::Symlink => {
                let link = match read_link_target(&mut reader, &entry) {
                    Ok(link) => link,
                    Err(e) => {
                        on_entry_failure(&mut summary, &entry, e, options.on_mismatch)?;
                        continue;
                    }
                };
                links.push((entry, target, link));
            }
        }
    }
    // Links are checked together so that a chain through other links is resolved too.
    let link_map: HashMap<&str, &str> =
        links.iter().map(|(entry, _, link)| (entry.path.as_str(), link.as_str())).collect();
    for (entry, _, link) in &links {
        check_link_chain(&entry.path, link, |p| link_map.get(p).map(|t| t.to_string()))?;
    }
    tracing::info!(
        archive = %reader.path().display(),
        dest = %dest.display(),
        dirs = dirs.len(),
        files = files.len(),
        symlinks = links.len(),
        "unpacking"
    );

    // --- Phase 2: directories ---
    fsx::create_dir_all(dest).map_err(|e| ArchiverError::io(e, dest))?;
    for (_, target) in &dirs {
        fsx::create_dir_all(target).map_err(|e| ArchiverError::io(e, target))?;
        summary.processed += 1;
    }

    // --- Phase 3: files ---
    let pool = options.pool()?;
    run_restore(&pool, &mut reader, files, options.max_entry_size, |entry, restored| {
        summary.bytes_in += entry.compressed_size;
        match restored {
            Ok(bytes) => {
                let target = resolve_within(dest, &entry.path)?;
                write_file(&target, &bytes)?;
                if options.restore_permissions {
                    restore_mode(&target, entry.permissions);
                }
                tracing::debug!(path = %entry.path, size = bytes.len(), "restored file");
                summary.processed += 1;
                summary.bytes_out += bytes.len() as u64;
                Ok(())
            }
            Err(e) => on_entry_failure(&mut summary, &entry, e, options.on_mismatch),
        }
    })?;

    // --- Phase 4: symlinks ---
    for (entry, target, link) in &links {
        if options.cancel.is_cancelled() {
            return Err(ArchiverError::Cancelled);
        }
        if let Some(parent) = target.parent() {
            fsx::create_dir_all(parent).map_err(|e| ArchiverError::io(e, parent))?;
        }
        if let Ok(meta) = fsx::symlink_metadata(target) {
            if !meta.is_dir() {
                fsx::remove_file(target).map_err(|e| ArchiverError::io(e, target))?;
            }
        }
        match fsx::create_symlink(link, target) {
            Ok(()) => summary.processed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                tracing::warn!(path = %entry.path, "symlinks are not supported here, skipping");
                summary.record_skip(&entry.path, &e);
            }
            Err(e) => return Err(ArchiverError::io(e, target)),
        }
    }

    // --- Phase 5: directory permissions, children before parents ---
    if options.restore_permissions {
        for (entry, target) in dirs.iter().rev() {
            restore_mode(target, entry.permissions);
        }
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
        entries = summary.processed,
        failed = summary.failed,
        skipped = summary.skipped,
        written = %display_size(summary.bytes_out),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "unpack complete"
    );
    Ok(summary)
}

/// Picks the entries named by `selection`. Empty means all.
fn select(entries: &[Entry], selection: &[String]) -> Result<Vec<Entry>, ArchiverError> {
    if selection.is_empty() {
        return Ok(entries.to_vec());
    }
    let wanted = selection
        .iter()
        .map(|s| normalize_archive_path(s).map_err(|_| ArchiverError::InvalidSelection(s.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    for (raw, w) in selection.iter().zip(&wanted) {
        if !entries.iter().any(|e| is_within(&e.path, w)) {
            return Err(ArchiverError::InvalidSelection(raw.clone()));
        }
    }
    Ok(entries
        .iter()
        .filter(|e| wanted.iter().any(|w| is_within(&e.path, w)))
        .cloned()
        .collect())
}

fn read_link_target(reader: &mut ArchiveReader, entry: &Entry) -> Result<String, ArchiverError> {
    let bytes = reader.read_entry(entry)?;
    String::from_utf8(bytes).map_err(|_| ArchiverError::CorruptEntry {
        path: entry.path.clone(),
        reason: "symlink target is not UTF-8".into(),
    })
}

/// Streams `entries` through the pool: the calling side reads raw blocks in archive
/// order, workers decompress and verify, and `consume` sees the results in order.
fn run_restore<C>(
    pool: &WorkerPool,
    reader: &mut ArchiveReader,
    entries: Vec<Entry>,
    max_entry_size: u64,
    mut consume: C,
) -> Result<(), ArchiverError>
where
    C: FnMut(Entry, Result<Vec<u8>, ArchiverError>) -> Result<(), ArchiverError>,
{
    let jobs = entries.into_iter().map(move |entry| {
        let raw = reader.read_raw(&entry);
        (entry, raw)
    });
    pool.run_ordered(
        jobs,
        |_, (entry, raw)| {
            let raw = raw?;
            let restored = restore_entry(&entry, &raw, max_entry_size);
            match restored {
                Err(e) if !e.is_recoverable() => Err(e),
                restored => Ok((entry, restored)),
            }
        },
        |_, (entry, restored)| consume(entry, restored),
    )
}

fn on_entry_failure(
    summary: &mut Summary,
    entry: &Entry,
    err: ArchiverError,
    policy: ErrorPolicy,
) -> Result<(), ArchiverError> {
    match policy {
        ErrorPolicy::Abort => Err(err),
        ErrorPolicy::SkipAndReport => {
            tracing::warn!(path = %entry.path, error = %err, "entry failed integrity check");
            summary.record_failure(&entry.path, &err);
            Ok(())
        }
    }
}

/// `<target>.wpack-partial`
fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

fn write_file(target: &Path, bytes: &[u8]) -> Result<(), ArchiverError> {
    if let Some(parent) = target.parent() {
        fsx::create_dir_all(parent).map_err(|e| ArchiverError::io(e, parent))?;
    }
    let partial = partial_path(target);
    fsx::write(&partial, bytes).map_err(|e| ArchiverError::io(e, &partial))?;
    if let Ok(meta) = fsx::symlink_metadata(target) {
        if meta.file_type().is_symlink() {
            fsx::remove_file(target).map_err(|e| ArchiverError::io(e, target))?;
        }
    }
    fsx::rename(&partial, target).map_err(|e| ArchiverError::io(e, target))
}

fn restore_mode(target: &Path, mode: Option<u32>) {
    if let Some(mode) = mode {
        if let Err(e) = fsx::set_unix_permissions(target, mode) {
            tracing::debug!(path = %target.display(), error = %e, "could not restore permissions");
        }
    }
}
