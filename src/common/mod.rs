//! Common utilities and types module.
// Shared structs, policies, summaries and size formatting.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What kind of filesystem object an entry records.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn id(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Directory => 1,
            EntryKind::Symlink => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(EntryKind::File),
            1 => Some(EntryKind::Directory),
            2 => Some(EntryKind::Symlink),
            _ => None,
        }
    }
}

/// How a block is stored inside the container.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Raw bytes, no compression. Used for level 0 and for blocks that do not shrink.
    #[default]
    Store,
    /// Raw DEFLATE.
    Deflate,
}

impl Codec {
    pub fn id(self) -> u8 {
        match self {
            Codec::Store => 0,
            Codec::Deflate => 1,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Codec::Store),
            1 => Some(Codec::Deflate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Store => "store",
            Codec::Deflate => "deflate",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One filesystem object captured in the archive.
///
/// Created by the walker; `codec`, `compressed_size`, `offset` and the checksums are
/// filled in by the archive writer once the block has been placed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Relative, '/'-separated path inside the archive.
    pub path: String,
    pub kind: EntryKind,
    /// Original (uncompressed) payload size. For symlinks, the length of the target string.
    pub size: u64,
    pub compressed_size: u64,
    pub codec: Codec,
    /// CRC-32 of the uncompressed payload.
    pub crc32: u32,
    /// SHA-256 of the uncompressed payload.
    #[serde(with = "hex::serde")]
    pub sha256: [u8; 32],
    /// Absolute byte offset of the block within the archive file.
    pub offset: u64,
    /// POSIX permission bits, when the platform exposes them.
    pub permissions: Option<u32>,
}

impl Entry {
    pub fn new(path: String, kind: EntryKind) -> Self {
        Self {
            path,
            kind,
            size: 0,
            compressed_size: 0,
            codec: Codec::Store,
            crc32: 0,
            sha256: [0u8; 32],
            offset: 0,
            permissions: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Hex form of the content digest, as printed by `sha256sum`.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// An entry as discovered by the walker, still tied to its source on disk.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub entry: Entry,
    /// Absolute path of the object being archived.
    pub source: PathBuf,
    /// Target string of a preserved symlink.
    pub link_target: Option<String>,
}

/// The ordered result of one traversal.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub root: PathBuf,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do with a per-entry failure.
#[derive(ValueEnum, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Stop at the first failing entry.
    Abort,
    /// Leave the entry out, remember it in the summary and keep going.
    #[default]
    SkipAndReport,
}

/// How symlinks found while walking are captured.
#[derive(ValueEnum, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkPolicy {
    /// Record the link itself with its target string as payload.
    #[default]
    Preserve,
    /// Record whatever the link points at, as if it lived at the link's path.
    Follow,
}

/// A single entry that did not make it through an operation.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub path: String,
    pub reason: String,
}

/// Outcome of a pack, unpack or verify run.
#[derive(Serialize, Debug, Clone, Default)]
pub struct Summary {
    /// Entries that went through successfully.
    pub processed: u64,
    /// Entries left out because they could not be read.
    pub skipped: u64,
    /// Entries that failed an integrity check.
    pub failed: u64,
    /// Details for every skipped or failed entry, in archive order.
    pub problems: Vec<FailedEntry>,
    /// Bytes read: tree content when packing, stored blocks when unpacking.
    pub bytes_in: u64,
    /// Bytes produced: archive size when packing, file content when unpacking.
    pub bytes_out: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl Summary {
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.failed == 0
    }

    pub(crate) fn record_skip(&mut self, path: &str, reason: impl fmt::Display) {
        self.skipped += 1;
        self.problems.push(FailedEntry { path: path.to_string(), reason: reason.to_string() });
    }

    pub(crate) fn record_failure(&mut self, path: &str, reason: impl fmt::Display) {
        self.failed += 1;
        self.problems.push(FailedEntry { path: path.to_string(), reason: reason.to_string() });
    }
}

const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Formats a byte count with binary units, keeping up to three significant decimals.
///
/// `1536` becomes `"1.5 KiB"`, `2 MiB` becomes `"2.0 MiB"`, anything under a KiB is
/// printed as plain bytes.
pub fn display_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} bytes");
    }
    // `scaled` stays in [1024, 1024²) of the chosen unit's 1/1024 fractions.
    let mut unit = 0usize;
    let mut scaled = bytes;
    while unit + 1 < UNITS.len() && scaled >= 1024 * 1024 {
        scaled /= 1024;
        unit += 1;
    }
    let milli = scaled as u128 * 1000 / 1024;
    let whole = milli / 1000;
    let mut frac = milli % 1000;
    if frac == 0 {
        return format!("{whole}.0 {}", UNITS[unit]);
    }
    let mut width = 3usize;
    while frac % 10 == 0 {
        frac /= 10;
        width -= 1;
    }
    format!("{whole}.{frac:0width$} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_size_small_values_are_bytes() {
        assert_eq!(display_size(0), "0 bytes");
        assert_eq!(display_size(1023), "1023 bytes");
    }

    #[test]
    fn display_size_trims_trailing_zeros() {
        assert_eq!(display_size(1024), "1.0 KiB");
        assert_eq!(display_size(1536), "1.5 KiB");
        assert_eq!(display_size(1024 + 256), "1.25 KiB");
        assert_eq!(display_size(2 * 1024 * 1024), "2.0 MiB");
        assert_eq!(display_size(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn display_size_keeps_leading_zero_decimals() {
        // 1034 bytes ≈ 1.009 KiB after truncation
        assert_eq!(display_size(1034), "1.009 KiB");
    }

    #[test]
    fn codec_and_kind_ids_are_stable() {
        assert_eq!(Codec::from_id(Codec::Deflate.id()), Some(Codec::Deflate));
        assert_eq!(Codec::from_id(9), None);
        assert_eq!(EntryKind::from_id(2), Some(EntryKind::Symlink));
        assert_eq!(EntryKind::Directory.id(), 1);
    }
}
