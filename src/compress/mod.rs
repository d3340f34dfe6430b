//! # Pack Pipeline
//!
//! Turns a directory tree into a `.wpack` archive. The pipeline is:
//!
//! 1. **Walk**: [`Walker`] produces the manifest in canonical order. Unreadable entries
//!    are skipped or abort the run according to [`PackOptions::on_unreadable`].
//! 2. **Compress**: the [`WorkerPool`] reads and compresses one entry per job, in
//!    parallel, computing the content digest on the way.
//! 3. **Assemble**: the calling thread receives the blocks back in manifest order and
//!    hands them to the [`ArchiveWriter`], which owns the output stream.
//!
//! The archive is written into a temporary file next to the destination and only
//! renamed into place once the footer has been written and synced, so a failed or
//! cancelled run leaves nothing behind that a reader would accept.

pub mod block;

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive::ArchiveWriter;
use crate::common::{display_size, Codec, Entry, EntryKind, ErrorPolicy, Manifest, ManifestEntry, Summary, SymlinkPolicy};
use crate::fsx;
use crate::path::{compare_archive_paths, relative_archive_path};
use crate::walk::Walker;
use crate::workers::{resolve_threads, CancelToken, WorkerPool, DEFAULT_MAX_THREADS};
use crate::ArchiverError;

use block::{Block, ContentDigest};

/// Default DEFLATE level.
pub const DEFAULT_LEVEL: u32 = 6;

/// Options that control how a tree is packed.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Compression level, 0 (store) to 9.
    pub level: u32,
    /// Worker threads. 0 means one per CPU.
    pub threads: usize,
    /// Upper bound applied to `threads`.
    pub max_threads: usize,
    /// Jobs in flight between dispatch and write. 0 means twice the thread count.
    pub window: usize,
    pub symlinks: SymlinkPolicy,
    /// What to do with entries that cannot be read.
    pub on_unreadable: ErrorPolicy,
    pub cancel: CancelToken,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            threads: 0,
            max_threads: DEFAULT_MAX_THREADS,
            window: 0,
            symlinks: SymlinkPolicy::Preserve,
            on_unreadable: ErrorPolicy::SkipAndReport,
            cancel: CancelToken::new(),
        }
    }
}

/// A worker's output for one manifest entry.
struct Packed {
    entry: Entry,
    block: Result<Block, ArchiverError>,
}

/// Packs the tree under `root` into a new archive at `output`.
///
/// Returns a [`Summary`] of what was stored and skipped. Structural failures (output
/// I/O, path escapes, cancellation) are returned as `Err` and leave no output file.
pub fn pack(root: impl AsRef<Path>, output: impl AsRef<Path>, options: &PackOptions) -> Result<Summary, ArchiverError> {
    let started = Instant::now();
    let (root, output) = (root.as_ref(), output.as_ref());
    block::check_level(options.level)?;

    let root_meta = fsx::metadata(root).map_err(|e| ArchiverError::io(e, root))?;
    if !root_meta.is_dir() {
        return Err(ArchiverError::InvalidOptions(format!("{} is not a directory", root.display())));
    }
    let root = fsx::canonicalize(root).map_err(|e| ArchiverError::io(e, root))?;

    let file_name = output
        .file_name()
        .ok_or_else(|| ArchiverError::InvalidOptions(format!("{} is not a file path", output.display())))?;
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = fsx::canonicalize(&parent).map_err(|e| ArchiverError::io(e, &parent))?;
    let final_path = parent.join(file_name);

    let mut tmp = tempfile::Builder::new()
        .prefix(".wpack-")
        .suffix(".partial")
        .tempfile_in(&parent)
        .map_err(|e| ArchiverError::io(e, &parent))?;
    let tmp_path = tmp.path().to_path_buf();

    let mut summary = Summary::default();
    // The archive may live inside the tree it is packing.
    let excluded = [final_path.clone(), tmp_path.clone()];
    let manifest = build_manifest(&root, options, &excluded, &mut summary)?;

    let threads = resolve_threads(options.threads, options.max_threads);
    let pool = WorkerPool::new(threads, options.window, options.cancel.clone())?;
    tracing::info!(
        root = %root.display(),
        entries = manifest.len(),
        threads,
        level = options.level,
        "packing"
    );

    let level = options.level;
    let mut writer = ArchiveWriter::new(tmp.as_file_mut())?;
    pool.run_ordered(
        manifest.entries,
        |_, job| pack_one(job, level),
        |_, packed| {
            let Packed { mut entry, block } = packed;
            match block {
                Ok(block) => {
                    entry.codec = block.codec;
                    tracing::debug!(
                        path = %entry.path,
                        kind = ?entry.kind,
                        codec = %block.codec,
                        size = entry.size,
                        stored = block.data.len(),
                        "stored entry"
                    );
                    summary.processed += 1;
                    summary.bytes_in += entry.size;
                    writer.append(entry, &block.data)
                }
                Err(e) if options.on_unreadable == ErrorPolicy::SkipAndReport => {
                    tracing::warn!(path = %entry.path, error = %e, "skipping entry");
                    summary.record_skip(&entry.path, &e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        },
    )?;

    let (file, stats) = writer.finish()?;
    file.sync_all().map_err(|e| ArchiverError::io(e, &tmp_path))?;
    if options.cancel.is_cancelled() {
        return Err(ArchiverError::Cancelled);
    }
    tmp.persist(&final_path).map_err(|e| ArchiverError::io(e.error, &final_path))?;

    summary.bytes_out = stats.archive_size;
    summary.elapsed = started.elapsed();
    tracing::info!(
        archive = %final_path.display(),
        entries = stats.entries,
        skipped = summary.skipped,
        input = %display_size(summary.bytes_in),
        output = %display_size(summary.bytes_out),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "pack complete"
    );
    Ok(summary)
}

fn build_manifest(
    root: &Path,
    options: &PackOptions,
    excluded: &[PathBuf],
    summary: &mut Summary,
) -> Result<Manifest, ArchiverError> {
    let walker = Walker::new(root).symlinks(options.symlinks).cancel_token(options.cancel.clone());
    let mut entries: Vec<ManifestEntry> = Vec::new();
    for item in walker.iter() {
        match item {
            Ok(found) if excluded.contains(&found.source) => {
                tracing::debug!(path = %found.entry.path, "leaving the archive itself out");
            }
            Ok(found) => entries.push(found),
            Err(ArchiverError::EntryUnreadable { path, source })
                if options.on_unreadable == ErrorPolicy::SkipAndReport =>
            {
                let shown = relative_archive_path(root, &path).unwrap_or_else(|_| path.display().to_string());
                tracing::warn!(path = %shown, error = %source, "skipping unreadable entry");
                summary.record_skip(&shown, &source);
            }
            Err(e) => return Err(e),
        }
    }
    // walkdir already sorts siblings; following links can still reorder names.
    entries.sort_by(|a, b| compare_archive_paths(&a.entry.path, &b.entry.path));
    Ok(Manifest { root: root.to_path_buf(), entries })
}

/// Reads, digests and compresses one entry. Runs on a worker thread.
///
/// Unreadable files come back inside [`Packed::block`]; anything else is fatal.
fn pack_one(job: ManifestEntry, level: u32) -> Result<Packed, ArchiverError> {
    let ManifestEntry { mut entry, source, link_target } = job;
    let block = match entry.kind {
        EntryKind::Directory => Ok(Block { codec: Codec::Store, data: Vec::new() }),
        EntryKind::Symlink => {
            let data = link_target.unwrap_or_default().into_bytes();
            set_digest(&mut entry, &data);
            Ok(Block { codec: Codec::Store, data })
        }
        EntryKind::File => match fsx::read(&source) {
            Ok(data) => {
                set_digest(&mut entry, &data);
                block::compress(data, level)
            }
            Err(e) => Err(ArchiverError::EntryUnreadable { path: source, source: e }),
        },
    };
    match block {
        Err(e) if !e.is_recoverable() => Err(e),
        block => Ok(Packed { entry, block }),
    }
}

fn set_digest(entry: &mut Entry, data: &[u8]) {
    let digest = ContentDigest::of(data);
    // The file may have changed since it was walked; record what was actually read.
    entry.size = data.len() as u64;
    entry.crc32 = digest.crc32;
    entry.sha256 = digest.sha256;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::reader::ArchiveReader;
    use tempfile::tempdir;

    #[test]
    fn pack_records_directories_and_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("world");
        fsx::create_dir_all(root.join("region")).unwrap();
        fsx::write(root.join("level.dat"), b"level level level level level").unwrap();
        fsx::write(root.join("region/r.0.0.mca"), vec![7u8; 10_000]).unwrap();

        let out = dir.path().join("world.wpack");
        let summary = pack(&root, &out, &PackOptions { threads: 2, ..Default::default() }).unwrap();
        assert_eq!(summary.processed, 3);
        assert!(summary.is_clean());

        let reader = ArchiveReader::open(&out).unwrap();
        let paths: Vec<_> = reader.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["level.dat", "region", "region/r.0.0.mca"]);
        let region = reader.find("region/r.0.0.mca").unwrap();
        assert_eq!(region.codec, Codec::Deflate);
        assert_eq!(region.size, 10_000);
    }

    #[test]
    fn archive_inside_the_tree_is_not_packed_into_itself() {
        let dir = tempdir().unwrap();
        fsx::write(dir.path().join("a.txt"), b"hello").unwrap();
        let out = dir.path().join("self.wpack");
        pack(dir.path(), &out, &PackOptions::default()).unwrap();
        // Second run sees the first archive in the tree and must leave it out.
        pack(dir.path(), &out, &PackOptions::default()).unwrap();
        let reader = ArchiveReader::open(&out).unwrap();
        assert_eq!(reader.entries().len(), 1);
    }

    #[test]
    fn bad_level_and_missing_root_are_rejected() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("x.wpack");
        let opts = PackOptions { level: 10, ..Default::default() };
        assert!(matches!(pack(dir.path(), &out, &opts), Err(ArchiverError::InvalidOptions(_))));
        assert!(pack(dir.path().join("missing"), &out, &PackOptions::default()).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn cancelled_pack_leaves_no_output() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tree");
        fsx::create_dir(&root).unwrap();
        for i in 0..32 {
            fsx::write(root.join(format!("f{i:02}")), vec![i as u8; 4096]).unwrap();
        }
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = dir.path().join("t.wpack");
        let res = pack(&root, &out, &PackOptions { cancel, ..Default::default() });
        assert!(matches!(res, Err(ArchiverError::Cancelled)));
        assert!(!out.exists());
        let leftovers: Vec<_> = fsx::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "only the source tree should remain");
    }

    /// A tree holding one regular file and a FIFO, which cannot be archived.
    #[cfg(unix)]
    fn tree_with_fifo(dir: &Path) -> Option<PathBuf> {
        let root = dir.join("tree");
        fsx::create_dir(&root).unwrap();
        fsx::write(root.join("a.txt"), b"kept").unwrap();
        let made = std::process::Command::new("mkfifo").arg(root.join("pipe")).status();
        made.map_or(false, |s| s.success()).then_some(root)
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entry_is_skipped_and_reported() {
        let dir = tempdir().unwrap();
        let Some(root) = tree_with_fifo(dir.path()) else { return };
        let out = dir.path().join("t.wpack");
        let opts = PackOptions { on_unreadable: ErrorPolicy::SkipAndReport, ..Default::default() };
        let summary = pack(&root, &out, &opts).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.problems[0].path, "pipe");

        let reader = ArchiveReader::open(&out).unwrap();
        let paths: Vec<_> = reader.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["a.txt"]);
        assert!(crate::extract::verify(&out, &Default::default()).unwrap().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entry_aborts_under_abort_policy() {
        let dir = tempdir().unwrap();
        let Some(root) = tree_with_fifo(dir.path()) else { return };
        let out = dir.path().join("t.wpack");
        let opts = PackOptions { on_unreadable: ErrorPolicy::Abort, ..Default::default() };
        let res = pack(&root, &out, &opts);
        assert!(matches!(res, Err(ArchiverError::EntryUnreadable { .. })));
        assert!(!out.exists());
        let leftovers: Vec<_> = fsx::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "only the source tree should remain");
    }
}
