//! Cross-platform filesystem wrapper.
//!
//! On Unix we transparently re-export std::fs and expose POSIX permission bits and
//! symlinks. Elsewhere permissions are neither captured nor restored, and symlink
//! creation reports `Unsupported` so the caller can skip the entry.

use std::io;
use std::path::Path;

pub use std::fs::*;

#[cfg(unix)]
/// POSIX permission bits (including setuid/setgid/sticky) of a file.
pub fn maybe_unix_mode(meta: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn maybe_unix_mode(_meta: &Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
/// Set POSIX permission bits on Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
/// No-op: POSIX permission bits are not preserved.
pub fn set_unix_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
pub fn create_symlink(_target: &str, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are only restored on Unix",
    ))
}
