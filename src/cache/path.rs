//! Directory path helpers
//!
//! Paths name directories only. The root is the empty string and every other
//! directory is `/` followed by its `/`-separated segments, e.g. `/Music/Scores`.

/// Root directory path
pub const ROOT: &str = "";

/// Normalize a caller-supplied directory path (`"Music/"` -> `"/Music"`, `"/"` -> `""`)
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .fold(String::new(), |mut acc, segment| {
            acc.push('/');
            acc.push_str(segment);
            acc
        })
}

/// Whether `name` can be used as a single path segment
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

/// Path of the directory `name` inside `path`
pub fn child_path(path: &str, name: &str) -> String {
    format!("{}/{}", path, name)
}

/// Parent of a directory path, `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    path.rfind('/').map(|idx| &path[..idx])
}

/// Last segment of a directory path (empty for the root)
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every directory from the root down to `path`, inclusive
pub fn ancestors(path: &str) -> Vec<String> {
    let mut chain = vec![ROOT.to_string()];
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        chain.push(current.clone());
    }
    chain
}

/// Whether `path` is `root` itself or lies below it
pub fn is_within(path: &str, root: &str) -> bool {
    path == root
        || (path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/')
}
