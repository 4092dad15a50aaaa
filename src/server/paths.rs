/*!
Path safety for group operations.

All checks run on the lexically normalized form of a path (no filesystem access, no
symlink resolution), so `a/../../etc` and `/data/groups/../other` are judged by what they
collapse to rather than by their raw spelling.
*/

/// Lexically normalize a POSIX path: collapse repeated separators, drop `.` segments and
/// resolve `..` against preceding segments. Leading `..` survive on relative paths; on
/// absolute paths they are clamped at `/`. An empty result becomes `.`.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// True when normalized `path` equals `base` or lies below it (component-wise, so
/// `/data/groups2` is not under `/data/groups`).
pub fn is_within(path: &str, base: &str) -> bool {
    let path = normalize_path(path);
    let base = normalize_path(base);
    if base == "/" {
        return path.starts_with('/');
    }
    path == base || path.starts_with(&format!("{base}/"))
}

/// Normalized upload filename, or `None` when it would escape the group directory
/// (normalized form starting with `..` or `/`).
pub fn safe_upload_name(name: &str) -> Option<String> {
    let norm = normalize_path(name);
    if norm.starts_with("..") || norm.starts_with('/') {
        None
    } else {
        Some(norm)
    }
}

/// Normalized group path when it is the base itself or one of its descendants.
pub fn group_path_under(path: &str, base: &str) -> Option<String> {
    let norm = normalize_path(path);
    is_within(&norm, base).then_some(norm)
}

/// Normalized group path when it is a proper descendant of the base (never the base itself).
pub fn group_path_strictly_under(path: &str, base: &str) -> Option<String> {
    let norm = normalize_path(path);
    (is_within(&norm, base) && norm != normalize_path(base)).then_some(norm)
}
