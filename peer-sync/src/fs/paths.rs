//! Relative path handling shared by the builder, the archive code and the peer.
//!
//! Manifest keys and remote names are always forward-slash separated,
//! whatever the host separator is.

use std::path::{Component, Path, PathBuf};

/// Convert a path relative to a tree root into its manifest key.
///
/// Returns `None` for paths that are not valid UTF-8, since such a key could
/// not be mapped back onto the same file.
pub fn to_slash_path(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Validate a client- or archive-supplied relative path.
///
/// Only `/` separates segments. Rejects empty paths, absolute paths and
/// any `..` segment, as well as segments the host would split further or
/// treat as a prefix. A `\\` inside a segment is part of the name on Unix.
/// The returned path uses host separators.
pub fn safe_relative_path(relative: &str) -> Option<PathBuf> {
    if relative.is_empty() || relative.contains('\0') || relative.starts_with('/') {
        return None;
    }

    let mut clean = PathBuf::new();
    for segment in relative.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == segment => clean.push(part),
            _ => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Join a validated relative path under `root`.
pub fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    safe_relative_path(relative).map(|rel| root.join(rel))
}

/// A single path segment such as an origin server or share name.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}
