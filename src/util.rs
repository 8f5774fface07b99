use std::{
    io::{ErrorKind, Read, Result},
    path::{Component, Path, PathBuf},
};

/// Lexically cleans a '/'-separated path, in the manner of a shell `cd`: repeated separators are
/// collapsed, `.` components are dropped and `..` components remove the preceding component.
///
/// Absolute paths never climb above `/`.  Relative paths keep leading `..` components.  The
/// empty path cleans to `.`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = vec![];

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&"..") | None if !rooted => parts.push(".."),
                Some(&"..") | None => {}
                Some(_) => {
                    parts.pop();
                }
            },
            part => parts.push(part),
        }
    }

    match (rooted, parts.is_empty()) {
        (true, _) => format!("/{}", parts.join("/")),
        (false, true) => ".".into(),
        (false, false) => parts.join("/"),
    }
}

/// Joins '/'-separated path segments and cleans the result.  Unlike [`Path::join`], an absolute
/// segment does not replace what came before it.
pub fn join_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let joined: Vec<&str> = segments.into_iter().filter(|s| !s.is_empty()).collect();
    clean_path(&joined.join("/"))
}

/// Returns the directory part of a clean absolute path ("/a/b" -> "/a", "/a" -> "/").
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The lexical equivalent of [`clean_path`] for native paths.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match result.components().next_back() {
                Some(Component::Normal(_)) => {
                    result.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => result.push(".."),
            },
            other => result.push(other),
        }
    }

    if result.as_os_str().is_empty() {
        result.push(".");
    }
    result
}

/// Reads from `reader` until `buf` is full or EOF is reached, retrying on EINTR.  Returns the
/// number of bytes read, which is only smaller than the buffer at EOF.
pub(crate) fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}
