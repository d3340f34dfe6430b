//! Deterministic directory traversal.
//!
//! The walker turns a root directory into a sequence of [`ManifestEntry`] values in
//! canonical order: a directory comes before its children and siblings are sorted by
//! name. Walking is lazy; calling [`Walker::iter`] again starts a fresh traversal, and
//! re-walking an unchanged tree yields the same sequence.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::common::{Entry, EntryKind, ManifestEntry, SymlinkPolicy};
use crate::fsx;
use crate::path::{check_link_chain, relative_archive_path};
use crate::workers::CancelToken;
use crate::ArchiverError;

/// A restartable traversal of one root directory.
#[derive(Debug, Clone)]
pub struct Walker {
    root: PathBuf,
    symlinks: SymlinkPolicy,
    cancel: CancelToken,
}

impl Walker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            symlinks: SymlinkPolicy::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn symlinks(mut self, policy: SymlinkPolicy) -> Self {
        self.symlinks = policy;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts a new traversal.
    ///
    /// Per-entry problems come out as `Err(EntryUnreadable)` items and the walk goes on;
    /// the caller decides whether to skip or abort. `PathEscape` and `Cancelled` end
    /// the sequence.
    pub fn iter(&self) -> WalkIter<'_> {
        let inner = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(self.symlinks == SymlinkPolicy::Follow)
            .sort_by_file_name()
            .into_iter();
        WalkIter { walker: self, inner, done: false }
    }

    fn describe(&self, de: &walkdir::DirEntry) -> Result<ManifestEntry, ArchiverError> {
        let path = de.path();
        let rel = relative_archive_path(&self.root, path)?;
        let unreadable = |source: io::Error| ArchiverError::EntryUnreadable {
            path: path.to_path_buf(),
            source,
        };

        let meta = de.metadata().map_err(|e| unreadable(e.into()))?;
        let file_type = de.file_type();

        if de.path_is_symlink() && self.symlinks == SymlinkPolicy::Follow {
            // Whatever a followed link lands on must still be part of the tree.
            let landed = fsx::canonicalize(path).map_err(unreadable)?;
            let root = fsx::canonicalize(&self.root).map_err(unreadable)?;
            if !landed.starts_with(&root) {
                return Err(ArchiverError::PathEscape { path: format!("{rel} -> {}", landed.display()) });
            }
        }

        let (kind, size, link_target) = if file_type.is_dir() {
            (EntryKind::Directory, 0, None)
        } else if file_type.is_file() {
            (EntryKind::File, meta.len(), None)
        } else if file_type.is_symlink() {
            let target = fsx::read_link(path).map_err(unreadable)?;
            let target = target.to_str().map(str::to_owned).ok_or_else(|| {
                unreadable(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "symlink target is not valid UTF-8",
                ))
            })?;
            check_link_chain(&rel, &target, |p| self.link_on_disk(p))?;
            (EntryKind::Symlink, target.len() as u64, Some(target))
        } else {
            return Err(unreadable(io::Error::new(
                io::ErrorKind::Unsupported,
                "special files cannot be archived",
            )));
        };

        let mut entry = Entry::new(rel, kind);
        entry.size = size;
        entry.permissions = if kind == EntryKind::Symlink { None } else { fsx::maybe_unix_mode(&meta) };

        Ok(ManifestEntry { entry, source: path.to_path_buf(), link_target })
    }

    /// Target of the symlink at archive path `rel`, if there is one.
    fn link_on_disk(&self, rel: &str) -> Option<String> {
        let mut disk = self.root.clone();
        disk.extend(rel.split('/'));
        let meta = fsx::symlink_metadata(&disk).ok()?;
        if !meta.file_type().is_symlink() {
            return None;
        }
        // A non-UTF-8 target is treated as absolute so the chain is refused.
        Some(fsx::read_link(&disk).ok()?.to_str().unwrap_or("/").to_owned())
    }
}

/// Iterator returned by [`Walker::iter`].
pub struct WalkIter<'a> {
    walker: &'a Walker,
    inner: walkdir::IntoIter,
    done: bool,
}

impl Iterator for WalkIter<'_> {
    type Item = Result<ManifestEntry, ArchiverError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.walker.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(ArchiverError::Cancelled));
        }

        let item = match self.inner.next()? {
            Ok(de) => self.walker.describe(&de),
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.walker.root.clone());
                let source = err
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop detected"));
                Err(ArchiverError::EntryUnreadable { path, source })
            }
        };
        if matches!(item, Err(ref e) if !e.is_recoverable()) {
            self.done = true;
        }
        Some(item)
    }
}
