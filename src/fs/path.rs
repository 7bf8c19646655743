//! Path splitting.
//!
//! A path names a chain of directory components separated by `/`, with the
//! last component naming the leaf. Consecutive slashes collapse; `.` and
//! `..` are resolved during traversal, not here.

/// Splits `path` into `(parent_path, leaf_name)`.
///
/// Returns `None` for the empty string and for paths ending in `/` (other
/// than the bare root, which callers special-case before splitting). A leaf
/// with no `/` before it resolves relative to the current working
/// directory, so its parent path is the empty string.
///
/// # Examples
///
/// * `"/a"` → `("/", "a")`
/// * `"/a/b"` → `("/a", "b")`
/// * `"a"` → `("", "a")`
/// * `"a/"` → `None`
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    if path.len() > 1 && path.ends_with('/') {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(("/", &path[1..])),
        Some(pos) => Some((&path[..pos], &path[pos + 1..])),
        None => Some(("", path)),
    }
}

/// Iterates over the non-empty components of `path`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
