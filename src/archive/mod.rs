//! # Container Format
//!
//! Byte layout of a `.wpack` archive and the writer that produces it. All integers
//! are little-endian.
//!
//! 1. **Header** (16 bytes): magic `b"WRLDPAK\0"`, format version `u32`, reserved `u32`.
//! 2. **Blocks**: one payload per file or symlink entry, in canonical entry order,
//!    back to back with no framing.
//! 3. **Index**: total uncompressed size `u64`, entry count `u64`, then one record per
//!    entry (see [`encode_index`]).
//! 4. **Footer** (48 bytes): locates and checksums the index, carries the CRC-32 of
//!    everything before it, and ends with its own CRC-32 and the magic `b"WPAKEND\0"`.
//!
//! Because every record stores the absolute offset of its block, a reader can seek to
//! any entry after parsing only the footer and the index.

use std::io::{BufWriter, Write};

use crc32fast::Hasher as Crc32Hasher;

use crate::common::{Codec, Entry, EntryKind};
use crate::path::compare_archive_paths;
use crate::ArchiverError;

pub const MAGIC_BYTES: &[u8; 8] = b"WRLDPAK\0";
pub const FOOTER_MAGIC: &[u8; 8] = b"WPAKEND\0";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 16;
pub const FOOTER_SIZE: u64 = 48;

/// Marks an entry without recorded permission bits.
const NO_MODE: u32 = u32::MAX;
/// Length of the footer prefix covered by the footer's own checksum.
const FOOTER_CHECKED: usize = 36;

pub fn encode_header() -> [u8; HEADER_SIZE as usize] {
    let mut out = [0u8; HEADER_SIZE as usize];
    out[..8].copy_from_slice(MAGIC_BYTES);
    out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    out
}

/// Checks magic and version of the first [`HEADER_SIZE`] bytes of an archive.
pub fn check_header(bytes: &[u8]) -> Result<(), ArchiverError> {
    let mut cur = ByteCursor::new(bytes);
    if cur.take(8)? != MAGIC_BYTES {
        return Err(ArchiverError::InvalidArchive("not a world archive (bad magic)".into()));
    }
    let version = cur.u32()?;
    if version != FORMAT_VERSION {
        return Err(ArchiverError::InvalidArchive(format!("unsupported format version {version}")));
    }
    Ok(())
}

/// Trailing fixed-size record locating and checksumming the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub index_length: u64,
    pub entry_count: u64,
    pub index_crc32: u32,
    /// CRC-32 of every byte before the footer.
    pub container_crc32: u32,
    pub version: u32,
}

impl Footer {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut out = [0u8; FOOTER_SIZE as usize];
        out[0..8].copy_from_slice(&self.index_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.index_length.to_le_bytes());
        out[16..24].copy_from_slice(&self.entry_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.index_crc32.to_le_bytes());
        out[28..32].copy_from_slice(&self.container_crc32.to_le_bytes());
        out[32..36].copy_from_slice(&self.version.to_le_bytes());
        let own = crc32fast::hash(&out[..FOOTER_CHECKED]);
        out[36..40].copy_from_slice(&own.to_le_bytes());
        out[40..48].copy_from_slice(FOOTER_MAGIC);
        out
    }

    /// Parses and validates a footer: magic, its own checksum and the format version.
    pub fn parse(bytes: &[u8]) -> Result<Self, ArchiverError> {
        if bytes.len() != FOOTER_SIZE as usize {
            return Err(ArchiverError::InvalidArchive("footer is missing".into()));
        }
        if &bytes[40..48] != FOOTER_MAGIC {
            return Err(ArchiverError::InvalidArchive(
                "footer is missing (archive incomplete or not a world archive)".into(),
            ));
        }
        let mut cur = ByteCursor::new(bytes);
        let footer = Footer {
            index_offset: cur.u64()?,
            index_length: cur.u64()?,
            entry_count: cur.u64()?,
            index_crc32: cur.u32()?,
            container_crc32: cur.u32()?,
            version: cur.u32()?,
        };
        let stored = cur.u32()?;
        if stored != crc32fast::hash(&bytes[..FOOTER_CHECKED]) {
            return Err(ArchiverError::InvalidArchive("footer checksum mismatch".into()));
        }
        if footer.version != FORMAT_VERSION {
            return Err(ArchiverError::InvalidArchive(format!(
                "unsupported format version {}",
                footer.version
            )));
        }
        Ok(footer)
    }
}

/// Serializes the index.
///
/// Record layout: `path_len u32 | path | kind u8 | codec u8 | mode u32 | size u64 |
/// compressed_size u64 | offset u64 | crc32 u32 | sha256 [32]`.
pub fn encode_index(entries: &[Entry], total_uncompressed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + entries.len() * 96);
    out.extend_from_slice(&total_uncompressed.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&(e.path.len() as u32).to_le_bytes());
        out.extend_from_slice(e.path.as_bytes());
        out.push(e.kind.id());
        out.push(e.codec.id());
        out.extend_from_slice(&e.permissions.unwrap_or(NO_MODE).to_le_bytes());
        out.extend_from_slice(&e.size.to_le_bytes());
        out.extend_from_slice(&e.compressed_size.to_le_bytes());
        out.extend_from_slice(&e.offset.to_le_bytes());
        out.extend_from_slice(&e.crc32.to_le_bytes());
        out.extend_from_slice(&e.sha256);
    }
    out
}

/// Parses an index produced by [`encode_index`]. Returns the total uncompressed size
/// and the entries in stored order.
pub fn decode_index(bytes: &[u8]) -> Result<(u64, Vec<Entry>), ArchiverError> {
    let mut cur = ByteCursor::new(bytes);
    let total = cur.u64()?;
    let count = cur.u64()?;
    // Each record takes at least 70 bytes; refuse counts the buffer cannot hold.
    if count > (bytes.len() as u64) / 70 {
        return Err(ArchiverError::InvalidArchive(format!("index claims {count} entries")));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let path_len = cur.u32()? as usize;
        let path = std::str::from_utf8(cur.take(path_len)?)
            .map_err(|_| ArchiverError::InvalidArchive("index path is not UTF-8".into()))?
            .to_string();
        let kind = EntryKind::from_id(cur.u8()?)
            .ok_or_else(|| ArchiverError::InvalidArchive(format!("unknown entry kind for '{path}'")))?;
        let codec = Codec::from_id(cur.u8()?)
            .ok_or_else(|| ArchiverError::InvalidArchive(format!("unknown codec for '{path}'")))?;
        let mode = cur.u32()?;
        let mut entry = Entry::new(path, kind);
        entry.codec = codec;
        entry.permissions = (mode != NO_MODE).then_some(mode);
        entry.size = cur.u64()?;
        entry.compressed_size = cur.u64()?;
        entry.offset = cur.u64()?;
        entry.crc32 = cur.u32()?;
        entry.sha256.copy_from_slice(cur.take(32)?);
        entries.push(entry);
    }
    if !cur.is_empty() {
        return Err(ArchiverError::InvalidArchive("trailing bytes after index".into()));
    }
    Ok((total, entries))
}

/// Bounds-checked little-endian reader over a byte slice.
struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ArchiverError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| ArchiverError::InvalidArchive("unexpected end of index".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ArchiverError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ArchiverError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, ArchiverError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// Totals reported once an archive has been finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: u64,
    pub total_uncompressed: u64,
    pub archive_size: u64,
    pub footer: Footer,
}

/// A writer responsible for constructing an archive.
///
/// Blocks must be appended in canonical order; the writer assigns offsets as it goes
/// and keeps a running CRC-32 of everything it has written. The index and footer are
/// only produced by [`ArchiveWriter::finish`], so an abandoned writer never leaves a
/// stream that a reader would accept.
pub struct ArchiveWriter<W: Write> {
    writer: BufWriter<W>,
    position: u64,
    crc: Crc32Hasher,
    entries: Vec<Entry>,
    total_uncompressed: u64,
}

impl<W: Write> ArchiveWriter<W> {
    /// Wraps `inner` and writes the archive header.
    pub fn new(inner: W) -> Result<Self, ArchiverError> {
        let mut this = Self {
            writer: BufWriter::with_capacity(1 << 20, inner),
            position: 0,
            crc: Crc32Hasher::new(),
            entries: Vec::new(),
            total_uncompressed: 0,
        };
        this.write_raw(&encode_header())?;
        Ok(this)
    }

    /// Byte offset the next block will land at.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ArchiverError> {
        self.writer.write_all(bytes)?;
        self.crc.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Places `payload` (already compressed according to `entry.codec`) and records the
    /// entry with its final offset and compressed size. Directories pass an empty payload.
    pub fn append(&mut self, mut entry: Entry, payload: &[u8]) -> Result<(), ArchiverError> {
        if let Some(last) = self.entries.last() {
            if compare_archive_paths(&last.path, &entry.path) != std::cmp::Ordering::Less {
                return Err(ArchiverError::InvalidOptions(format!(
                    "entry '{}' is out of order or duplicated after '{}'",
                    entry.path, last.path
                )));
            }
        }
        if entry.kind == EntryKind::Directory && !payload.is_empty() {
            return Err(ArchiverError::InvalidOptions(format!(
                "directory '{}' cannot carry a payload",
                entry.path
            )));
        }

        entry.offset = self.position;
        entry.compressed_size = payload.len() as u64;
        self.write_raw(payload)?;
        self.total_uncompressed += entry.size;
        self.entries.push(entry);
        Ok(())
    }

    /// Writes the index and the footer, flushes, and hands back the inner writer.
    pub fn finish(mut self) -> Result<(W, ArchiveStats), ArchiverError> {
        let index_offset = self.position;
        let index = encode_index(&self.entries, self.total_uncompressed);
        let index_crc32 = crc32fast::hash(&index);
        self.write_raw(&index)?;

        let footer = Footer {
            index_offset,
            index_length: index.len() as u64,
            entry_count: self.entries.len() as u64,
            index_crc32,
            container_crc32: self.crc.clone().finalize(),
            version: FORMAT_VERSION,
        };
        self.writer.write_all(&footer.to_bytes())?;
        self.writer.flush()?;

        let stats = ArchiveStats {
            entries: footer.entry_count,
            total_uncompressed: self.total_uncompressed,
            archive_size: self.position + FOOTER_SIZE,
            footer,
        };
        let inner = self.writer.into_inner().map_err(|e| e.into_error())?;
        Ok((inner, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(path: &str, size: u64) -> Entry {
        let mut e = Entry::new(path.to_string(), EntryKind::File);
        e.size = size;
        e.crc32 = 0xDEAD_BEEF;
        e.sha256 = [7u8; 32];
        e.permissions = Some(0o644);
        e
    }

    #[test]
    fn empty_archive_has_header_index_and_footer() -> Result<(), Box<dyn std::error::Error>> {
        let (bytes, stats) = ArchiveWriter::new(Vec::new())?.finish()?;
        assert_eq!(stats.entries, 0);
        assert_eq!(bytes.len() as u64, HEADER_SIZE + 16 + FOOTER_SIZE);
        assert_eq!(&bytes[..8], MAGIC_BYTES);
        assert_eq!(&bytes[bytes.len() - 8..], FOOTER_MAGIC);

        let footer = Footer::parse(&bytes[bytes.len() - FOOTER_SIZE as usize..])?;
        assert_eq!(footer.index_offset, HEADER_SIZE);
        assert_eq!(footer.container_crc32, crc32fast::hash(&bytes[..bytes.len() - FOOTER_SIZE as usize]));
        Ok(())
    }

    #[test]
    fn offsets_are_assigned_in_write_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = ArchiveWriter::new(Vec::new())?;
        writer.append(file_entry("a.txt", 10), b"12345")?;
        writer.append(Entry::new("b".into(), EntryKind::Directory), &[])?;
        writer.append(file_entry("b/c.bin", 3), b"xyz")?;
        let (bytes, stats) = writer.finish()?;

        let footer = Footer::parse(&bytes[bytes.len() - FOOTER_SIZE as usize..])?;
        let start = footer.index_offset as usize;
        let index = &bytes[start..start + footer.index_length as usize];
        assert_eq!(crc32fast::hash(index), footer.index_crc32);

        let (total, entries) = decode_index(index)?;
        assert_eq!(total, 13);
        assert_eq!(stats.total_uncompressed, 13);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, HEADER_SIZE);
        assert_eq!(entries[0].compressed_size, 5);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].compressed_size, 0);
        assert_eq!(entries[2].offset, HEADER_SIZE + 5);
        assert_eq!(entries[2].permissions, Some(0o644));
        assert_eq!(entries[1].permissions, None);
        assert_eq!(&bytes[entries[2].offset as usize..][..3], b"xyz");
        Ok(())
    }

    #[test]
    fn out_of_order_entries_are_refused() -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = ArchiveWriter::new(Vec::new())?;
        writer.append(file_entry("b", 0), &[])?;
        assert!(writer.append(file_entry("a", 0), &[]).is_err());
        assert!(writer.append(file_entry("b", 0), &[]).is_err());
        Ok(())
    }

    #[test]
    fn damaged_footer_is_rejected() {
        let footer = Footer {
            index_offset: 16,
            index_length: 16,
            entry_count: 0,
            index_crc32: 1,
            container_crc32: 2,
            version: FORMAT_VERSION,
        };
        let mut bytes = footer.to_bytes();
        assert_eq!(Footer::parse(&bytes).unwrap(), footer);
        bytes[3] ^= 1;
        assert!(matches!(Footer::parse(&bytes), Err(ArchiverError::InvalidArchive(_))));
    }

    #[test]
    fn truncated_index_is_rejected() {
        let index = encode_index(&[file_entry("a", 1)], 1);
        assert!(decode_index(&index[..index.len() - 1]).is_err());
        assert!(check_header(b"WRLDPAK\0\x02\0\0\0\0\0\0\0").is_err());
        assert!(check_header(&encode_header()).is_ok());
    }
}
