//! Archive path handling
//!
//! Archive paths are always `/`-separated regardless of host platform.
//! Normalization collapses `.` and `..`, strips duplicate separators and
//! roots the result, so `a//b/./c/../d` becomes `/a/b/d`. A `..` above the
//! root stays at the root.

pub const SEPARATOR: char = '/';
pub const ROOT: &str = "/";

/// Split a path into its normalized segments
pub fn segments(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in path.split(SEPARATOR) {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            part => out.push(part.to_string()),
        }
    }
    out
}

pub fn normalize(path: &str) -> String {
    join(&segments(path))
}

/// Join segments back into a rooted path
pub fn join<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push(SEPARATOR);
        out.push_str(segment.as_ref());
    }
    out
}

/// Whether `path` is `ancestor` itself or lies beneath it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = segments(path);
    let ancestor = segments(ancestor);
    path.len() >= ancestor.len() && path[..ancestor.len()] == ancestor[..]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a//b/./c/../d"), "/a/b/d");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("../../x"), "/x");
        assert_eq!(normalize("/docs/"), "/docs");
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("/a/b"), vec!["a", "b"]);
        assert!(segments("/").is_empty());
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b/c", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/anything", "/"));
    }
}
