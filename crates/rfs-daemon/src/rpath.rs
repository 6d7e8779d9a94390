//! Remote path manipulation.
//!
//! Remote paths are plain `/`-separated strings; they never touch the local
//! `Path` machinery, which would apply host-specific rules. `clean` follows
//! the usual lexical rules: collapse `//` and `.`, resolve `..` without
//! consulting the remote filesystem, never escape `/`.

/// Lexically clean a remote path.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if out.last().map_or(false, |p| *p != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            _ => out.push(part),
        }
    }

    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join two remote path fragments and clean the result.
pub fn join(base: &str, rest: &str) -> String {
    if base.is_empty() {
        return clean(rest);
    }
    if rest.is_empty() {
        return clean(base);
    }
    clean(&format!("{base}/{rest}"))
}

/// Parent directory of a remote path, `/` for the root itself.
pub fn parent(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Final component of a remote path.
pub fn base(path: &str) -> String {
    let cleaned = clean(path);
    if cleaned == "/" {
        return "/".to_string();
    }
    cleaned
        .rsplit('/')
        .next()
        .unwrap_or(cleaned.as_str())
        .to_string()
}

pub fn is_abs(path: &str) -> bool {
    path.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean(""), ".");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("//a//b/"), "/a/b");
        assert_eq!(clean("/a/./b"), "/a/b");
        assert_eq!(clean("/a/b/.."), "/a");
        assert_eq!(clean("/.."), "/");
        assert_eq!(clean("a/../.."), "..");
        assert_eq!(clean("a/b/../c"), "a/c");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/a/", "/b"), "/a/b");
        assert_eq!(join("", "b"), "b");
        assert_eq!(join("/a", ""), "/a");
        assert_eq!(join("/", "etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn test_parent_and_base() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(base("/a/b"), "b");
        assert_eq!(base("/"), "/");
        assert_eq!(base("b"), "b");
    }
}
