//! POSIX-style path normalization.

/// Splits `path` into its components, resolving `.` and `..` and dropping
/// empty segments, so leading, trailing and repeated separators are ignored.
/// `..` at the top stays at the top.
pub fn split_path(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name.to_string()),
        }
    }
    parts
}

/// Canonical absolute form of a list of components.
pub fn join_path(parts: &[String]) -> String {
    format!("/{}", parts.join("/"))
}

/// Canonical absolute form of `path`.
pub fn normalize(path: &str) -> String {
    join_path(&split_path(path))
}
