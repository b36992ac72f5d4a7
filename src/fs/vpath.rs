//! POSIX path helpers for virtual paths
//!
//! Virtual paths are always absolute. `..` at the root stays at the root, so a
//! script can never name a file outside the filesystem it was given.

/// Normalize a virtual path: resolves `.` and `..`, collapses separators and
/// always returns an absolute path without a trailing slash.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(path.matches('/').count() + 1);

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    let mut result = String::with_capacity(path.len() + 1);
    for part in &parts {
        result.push('/');
        result.push_str(part);
    }

    if result.is_empty() {
        result.push('/');
    }
    result
}

/// Resolve `path` against `base`. Absolute paths ignore the base.
pub fn join(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        return clean(path);
    }
    let mut joined = String::with_capacity(base.len() + path.len() + 1);
    joined.push_str(base);
    joined.push('/');
    joined.push_str(path);
    clean(&joined)
}

/// Parent directory of a virtual path (`/` for top-level entries)
pub fn dirname(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
    }
}

/// Last path component
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Extension of the last component including the dot, or an empty string
pub fn extname(path: &str) -> &str {
    let base = basename(path);
    match base.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &base[idx..],
    }
}

/// Host-relative form of a virtual path (no leading slash)
pub fn relative(path: &str) -> String {
    clean(path).trim_start_matches('/').to_string()
}
