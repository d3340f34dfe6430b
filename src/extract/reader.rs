//! Random-access reader for `.wpack` archives.
//!
//! Opening an archive reads the header, the footer and the index, and nothing else.
//! Payload blocks are only touched by [`ArchiveReader::read_raw`] and friends, one
//! seek and one read per entry.

use std::cmp::Ordering;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;

use crate::archive::{check_header, decode_index, Footer, FOOTER_SIZE, HEADER_SIZE};
use crate::common::{Entry, EntryKind};
use crate::compress::block::{self, ContentDigest, DEFAULT_MAX_ENTRY_SIZE};
use crate::fsx::File;
use crate::path::{compare_archive_paths, normalize_archive_path};
use crate::ArchiverError;

/// A parsed archive: validated footer plus the in-memory index.
pub struct ArchiveReader {
    file: File,
    path: PathBuf,
    footer: Footer,
    entries: Vec<Entry>,
    total_uncompressed: u64,
    max_entry_size: u64,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ArchiveReader {
    /// Opens and validates an archive.
    ///
    /// Fails with `InvalidArchive` when the header or footer is missing or damaged,
    /// the format version is unknown, the index checksum does not match, or the index
    /// describes blocks that do not fit the file. Entry paths are not judged here;
    /// extraction applies the containment checks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiverError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| ArchiverError::io(e, path))?;
        let len = file.metadata().map_err(|e| ArchiverError::io(e, path))?.len();
        if len < HEADER_SIZE + FOOTER_SIZE {
            return Err(ArchiverError::InvalidArchive(format!(
                "{} is too short to be an archive ({len} bytes)",
                path.display()
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|e| ArchiverError::io(e, path))?;
        check_header(&header)?;

        let mut raw_footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::Start(len - FOOTER_SIZE)).map_err(|e| ArchiverError::io(e, path))?;
        file.read_exact(&mut raw_footer).map_err(|e| ArchiverError::io(e, path))?;
        let footer = Footer::parse(&raw_footer)?;

        let index_end = footer.index_offset.checked_add(footer.index_length);
        if footer.index_offset < HEADER_SIZE || index_end != Some(len - FOOTER_SIZE) {
            return Err(ArchiverError::InvalidArchive("index location does not match file size".into()));
        }

        let mut index = vec![0u8; footer.index_length as usize];
        file.seek(SeekFrom::Start(footer.index_offset)).map_err(|e| ArchiverError::io(e, path))?;
        file.read_exact(&mut index).map_err(|e| ArchiverError::io(e, path))?;
        if crc32fast::hash(&index) != footer.index_crc32 {
            return Err(ArchiverError::InvalidArchive("index checksum mismatch".into()));
        }

        let (total_uncompressed, entries) = decode_index(&index)?;
        if entries.len() as u64 != footer.entry_count {
            return Err(ArchiverError::InvalidArchive(format!(
                "footer announces {} entries, index holds {}",
                footer.entry_count,
                entries.len()
            )));
        }
        for pair in entries.windows(2) {
            if compare_archive_paths(&pair[0].path, &pair[1].path) != Ordering::Less {
                return Err(ArchiverError::InvalidArchive(format!(
                    "index is not in canonical order at '{}'",
                    pair[1].path
                )));
            }
        }
        for e in &entries {
            // Escapes are left to extraction, which refuses them before writing anything.
            if matches!(normalize_archive_path(&e.path), Ok(ref n) if *n != e.path) {
                return Err(ArchiverError::InvalidArchive(format!("path '{}' is not normalized", e.path)));
            }
            let end = e.offset.checked_add(e.compressed_size);
            if e.offset < HEADER_SIZE || end.map_or(true, |end| end > footer.index_offset) {
                return Err(ArchiverError::InvalidArchive(format!(
                    "block of '{}' lies outside the payload region",
                    e.path
                )));
            }
        }

        tracing::debug!(archive = %path.display(), entries = entries.len(), "opened archive");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            footer,
            entries,
            total_uncompressed,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
        })
    }

    /// Changes the decompression safety bound used by [`read_entry`](Self::read_entry).
    pub fn with_max_entry_size(mut self, max: u64) -> Self {
        self.max_entry_size = max;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn total_uncompressed(&self) -> u64 {
        self.total_uncompressed
    }

    /// All entries in canonical order. Never touches payload.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn list(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    /// Binary search over the index.
    pub fn find(&self, path: &str) -> Option<&Entry> {
        self.entries
            .binary_search_by(|e| compare_archive_paths(&e.path, path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Reads the stored (still compressed) block of `entry`.
    pub fn read_raw(&mut self, entry: &Entry) -> Result<Vec<u8>, ArchiverError> {
        if entry.kind == EntryKind::Directory || entry.compressed_size == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; entry.compressed_size as usize];
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .and_then(|_| self.file.read_exact(&mut buf))
            .map_err(|e| ArchiverError::io(e, &self.path))?;
        Ok(buf)
    }

    /// Reads, decompresses and verifies one entry.
    pub fn read_entry(&mut self, entry: &Entry) -> Result<Vec<u8>, ArchiverError> {
        let raw = self.read_raw(entry)?;
        restore_entry(entry, &raw, self.max_entry_size)
    }

    /// Recomputes the CRC-32 of everything before the footer, streaming 1 MiB at a time.
    pub fn container_checksum(&mut self) -> Result<u32, ArchiverError> {
        let mut remaining = self.footer.index_offset + self.footer.index_length;
        let mut crc = Crc32Hasher::new();
        let mut buf = vec![0u8; 1 << 20];
        self.file.seek(SeekFrom::Start(0)).map_err(|e| ArchiverError::io(e, &self.path))?;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..n]).map_err(|e| ArchiverError::io(e, &self.path))?;
            crc.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(crc.finalize())
    }
}

/// Decompresses a raw block and checks it against the entry's recorded digest.
///
/// Decoder failures and checksum mismatches both come back as `CorruptEntry`
/// naming the entry.
pub fn restore_entry(entry: &Entry, raw: &[u8], max_entry_size: u64) -> Result<Vec<u8>, ArchiverError> {
    let corrupt = |reason: String| ArchiverError::CorruptEntry { path: entry.path.clone(), reason };
    if entry.kind == EntryKind::Directory {
        return Ok(Vec::new());
    }
    let bytes = block::decompress(entry.codec, raw, entry.size, max_entry_size).map_err(|e| match e {
        ArchiverError::CorruptBlock(reason) => corrupt(reason),
        other => other,
    })?;
    let digest = ContentDigest::of(&bytes);
    if digest.crc32 != entry.crc32 || digest.sha256 != entry.sha256 {
        return Err(corrupt("content checksum mismatch".into()));
    }
    Ok(bytes)
}
