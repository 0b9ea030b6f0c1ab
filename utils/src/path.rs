use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Normalize a path for comparison inside a tar stream: drop a leading
/// `./`, collapse `.` components and redundant separators. `..` components
/// are retained verbatim (tar link targets may legitimately contain them).
pub fn clean(path: &Utf8Path) -> Utf8PathBuf {
    let mut ret = Utf8PathBuf::new();
    for part in path.components() {
        match part {
            Utf8Component::CurDir => {}
            other => ret.push(other),
        }
    }
    ret
}

/// Compute the target of a symlink placed at `location` which should
/// resolve to `dest`, where both paths are relative to the same (archive)
/// root. The result is the shortest relative path: one `..` segment per
/// non-shared component of `location`'s parent directory, followed by the
/// non-shared tail of `dest`.
pub fn relative_link_target(location: &Utf8Path, dest: &Utf8Path) -> Utf8PathBuf {
    let location = clean(location);
    let dest = clean(dest);
    let from_dir: Vec<_> = location
        .parent()
        .unwrap_or(Utf8Path::new(""))
        .components()
        .collect();
    let to: Vec<_> = dest.components().collect();

    let shared = from_dir
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut ret = Utf8PathBuf::new();
    for _ in shared..from_dir.len() {
        ret.push("..");
    }
    for part in &to[shared..] {
        ret.push(part);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        let cases = [
            ("./foo/bar", "foo/bar"),
            ("foo//bar/./baz", "foo/bar/baz"),
            ("./", ""),
            ("../x", "../x"),
        ];
        for (input, expected) in cases {
            similar_asserts::assert_eq!(clean(input.into()).as_str(), expected);
        }
    }

    #[test]
    fn test_relative_link_target() {
        let cases = [
            // Symlink at the archive root.
            ("data", ".cas/tree/abcd", ".cas/tree/abcd"),
            // One level down.
            ("app/data", ".cas/tree/abcd", "../.cas/tree/abcd"),
            // Deeper nesting.
            ("a/b/c/data", ".cas/tree/abcd", "../../../.cas/tree/abcd"),
            // Shared prefix collapses to fewer `..` segments.
            ("a/b/c", "a/d", "../d"),
            ("a/b/c/d", "a/b/x/y", "../../x/y"),
            // Leading ./ is irrelevant.
            ("./app/data", "./.cas/tree/abcd", "../.cas/tree/abcd"),
        ];
        for (location, dest, expected) in cases {
            similar_asserts::assert_eq!(
                relative_link_target(location.into(), dest.into()).as_str(),
                expected,
                "location={location} dest={dest}"
            );
        }
    }
}
