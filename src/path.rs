//! Path normalization.
//!
//! Archive paths are relative, '/'-separated UTF-8 strings with no `.`/`..`
//! segments. Every path that crosses the archive boundary, in either direction,
//! goes through this module so that nothing can be written outside the root it
//! belongs to.

use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::ArchiverError;

/// Produces the archive path of `child` relative to `root`.
///
/// `child` must live under `root`. `.` segments are dropped and `..` segments are
/// resolved lexically; climbing above `root` is a `PathEscape`. Components that are
/// not valid UTF-8 or contain a backslash cannot be represented portably and are
/// reported as `EntryUnreadable`.
pub fn relative_archive_path(root: &Path, child: &Path) -> Result<String, ArchiverError> {
    let rel = child.strip_prefix(root).map_err(|_| ArchiverError::PathEscape {
        path: child.display().to_string(),
    })?;

    let mut parts: Vec<&str> = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ArchiverError::PathEscape { path: child.display().to_string() });
                }
            }
            Component::Normal(name) => {
                let name = name.to_str().filter(|s| !s.contains('\\')).ok_or_else(|| {
                    ArchiverError::EntryUnreadable {
                        path: child.to_path_buf(),
                        source: io::Error::new(
                            io::ErrorKind::InvalidData,
                            "file name cannot be stored portably",
                        ),
                    }
                })?;
                parts.push(name);
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiverError::PathEscape { path: child.display().to_string() });
            }
        }
    }
    Ok(parts.join("/"))
}

/// Normalizes a path read from an archive index or typed by a user.
///
/// Both `/` and `\` separate components. Absolute paths, drive prefixes and `..`
/// segments that climb above the root are rejected with `PathEscape`, as is a path
/// that resolves to the root itself.
pub fn normalize_archive_path(raw: &str) -> Result<String, ArchiverError> {
    let escape = || ArchiverError::PathEscape { path: raw.to_string() };

    if raw.starts_with('/') || raw.starts_with('\\') || has_drive_prefix(raw) {
        return Err(escape());
    }
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop().ok_or_else(escape)?;
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(escape());
    }
    Ok(parts.join("/"))
}

/// Resolves an archive path to a location under `dest`, refusing anything that would
/// land outside it.
pub fn resolve_within(dest: &Path, archive_path: &str) -> Result<PathBuf, ArchiverError> {
    let normalized = normalize_archive_path(archive_path)?;
    let mut out = dest.to_path_buf();
    for seg in normalized.split('/') {
        out.push(seg);
    }
    Ok(out)
}

/// Symlinks substituted while resolving one target before giving up.
pub const MAX_LINK_HOPS: usize = 40;

/// Checks that a symlink stored at `link_path` (an archive path) with the given
/// `target` string resolves, lexically, to somewhere inside the root.
///
/// No other links are taken into account; see [`check_link_chain`].
pub fn check_link_target(link_path: &str, target: &str) -> Result<(), ArchiverError> {
    check_link_chain(link_path, target, |_| None)
}

/// Resolves `target` relative to the directory of `link_path` one component at a
/// time. Whenever the path resolved so far names another symlink (as reported by
/// `lookup`), that link's target is substituted, so `..` after it climbs from where
/// the link really points. Climbing above the root at any point is a `PathEscape`,
/// and so is a chain longer than [`MAX_LINK_HOPS`].
pub fn check_link_chain<F>(link_path: &str, target: &str, mut lookup: F) -> Result<(), ArchiverError>
where
    F: FnMut(&str) -> Option<String>,
{
    let escape = || ArchiverError::PathEscape { path: format!("{link_path} -> {target}") };
    if target.is_empty() || is_absolute_target(target) {
        return Err(escape());
    }

    let mut resolved: Vec<String> = link_path.split('/').filter(|s| !s.is_empty()).map(str::to_owned).collect();
    // The target is relative to the directory holding the link.
    resolved.pop();
    let mut pending: Vec<String> = target.split(['/', '\\']).rev().map(str::to_owned).collect();
    let mut hops = 0usize;

    while let Some(seg) = pending.pop() {
        match seg.as_str() {
            "" | "." => {}
            ".." => {
                resolved.pop().ok_or_else(escape)?;
            }
            name => {
                resolved.push(name.to_owned());
                let Some(next) = lookup(&resolved.join("/")) else {
                    continue;
                };
                hops += 1;
                if hops > MAX_LINK_HOPS || next.is_empty() || is_absolute_target(&next) {
                    return Err(escape());
                }
                resolved.pop();
                pending.extend(next.split(['/', '\\']).rev().map(str::to_owned));
            }
        }
    }
    Ok(())
}

fn is_absolute_target(target: &str) -> bool {
    target.starts_with('/') || target.starts_with('\\') || has_drive_prefix(target) || Path::new(target).is_absolute()
}

/// Canonical archive order: lexicographic over path components.
///
/// This is the order a depth-first walk with name-sorted siblings produces, so a
/// directory always sorts before its children.
pub fn compare_archive_paths(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

/// True when `path` is `ancestor` itself or lies beneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

fn has_drive_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_is_slash_joined() {
        let root = Path::new("/world");
        let child = Path::new("/world/region/./r.0.0.mca");
        assert_eq!(relative_archive_path(root, child).unwrap(), "region/r.0.0.mca");
    }

    #[test]
    fn relative_path_rejects_climbing_out() {
        let root = Path::new("/world");
        let child = Path::new("/world/region/../../etc/passwd");
        assert!(matches!(
            relative_archive_path(root, child),
            Err(ArchiverError::PathEscape { .. })
        ));
        assert!(matches!(
            relative_archive_path(root, Path::new("/elsewhere/file")),
            Err(ArchiverError::PathEscape { .. })
        ));
    }

    #[test]
    fn archive_paths_are_normalized() {
        assert_eq!(normalize_archive_path("./a//b\\c").unwrap(), "a/b/c");
        assert_eq!(normalize_archive_path("a/x/../b").unwrap(), "a/b");
    }

    #[test]
    fn archive_paths_cannot_escape() {
        for bad in ["../x", "a/../../x", "/etc/passwd", "\\share", "C:/x", ".", "a/.."] {
            assert!(
                matches!(normalize_archive_path(bad), Err(ArchiverError::PathEscape { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn resolve_within_stays_under_dest() {
        let dest = Path::new("/out");
        assert_eq!(resolve_within(dest, "a/b.txt").unwrap(), Path::new("/out/a/b.txt"));
        assert!(resolve_within(dest, "../b.txt").is_err());
    }

    #[test]
    fn link_targets_are_checked_relative_to_link_dir() {
        assert!(check_link_target("a/b/link", "../c").is_ok());
        assert!(check_link_target("a/b/link", "../../c").is_ok());
        assert!(check_link_target("a/b/link", "../../../c").is_err());
        assert!(check_link_target("link", "/etc/passwd").is_err());
        assert!(check_link_target("link", "sub/../..").is_err());
    }

    #[test]
    fn link_chains_are_followed_through_other_links() {
        let links = |p: &str| match p {
            "a/l1" => Some("..".to_string()),
            "loop" => Some("loop".to_string()),
            _ => None,
        };
        // Each looks contained on its own, but `a/l1` already points at the root.
        assert!(check_link_target("l2", "a/l1/..").is_ok());
        assert!(matches!(
            check_link_chain("l2", "a/l1/..", links),
            Err(ArchiverError::PathEscape { .. })
        ));
        assert!(check_link_chain("l3", "a/l1/b", links).is_ok());
        assert!(check_link_chain("a/l1", "..", links).is_ok());
        assert!(check_link_chain("l4", "loop", links).is_err());
    }

    #[test]
    fn canonical_order_is_component_wise() {
        // A plain string compare would put "a-c" first because '-' < '/'.
        assert_eq!(compare_archive_paths("a/b", "a-c"), Ordering::Less);
        assert_eq!(compare_archive_paths("a", "a/b"), Ordering::Less);
        assert_eq!(compare_archive_paths("b", "a/z"), Ordering::Greater);
    }

    #[test]
    fn within_respects_component_boundaries() {
        assert!(is_within("b/c.bin", "b"));
        assert!(is_within("b", "b"));
        assert!(!is_within("bc", "b"));
    }
}
