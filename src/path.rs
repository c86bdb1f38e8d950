//! Relative-path helpers shared by [`crate::virtual_directory`]'s import,
//! export and symlink-resolution code (spec §4.4).

use std::collections::BTreeMap;

/// Splits `path` on `/` into its first segment and, if more than one
/// non-empty segment remains, the joined tail.
pub(crate) fn split_first(path: &str) -> (&str, Option<&str>) {
    match path.split_once('/') {
        Some((head, rest)) if !rest.is_empty() => (head, Some(rest)),
        Some((head, _)) => (head, None),
        None => (path, None),
    }
}

/// Splits a symlink target into whether it is root-relative (begins with
/// `/`) and its non-empty path segments (spec §4.4, symlink resolution).
pub(crate) fn symlink_segments(target: &str) -> (bool, Vec<&str>) {
    let absolute = target.starts_with('/');
    let segments = target.split('/').filter(|s| !s.is_empty()).collect();
    (absolute, segments)
}

/// Groups a flat filter of relative paths by first path segment. An empty
/// sub-filter for a given head means "import everything under it" (spec
/// §4.4, CAS-to-CAS partial import).
pub(crate) fn group_by_first_segment(paths: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for p in paths {
        let (head, rest) = split_first(p);
        let entry = out.entry(head.to_string()).or_default();
        if let Some(rest) = rest {
            entry.push(rest.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_first_single_segment() {
        assert_eq!(split_first("a"), ("a", None));
    }

    #[test]
    fn split_first_multi_segment() {
        assert_eq!(split_first("a/b/c"), ("a", Some("b/c")));
    }

    #[test]
    fn symlink_segments_absolute() {
        assert_eq!(symlink_segments("/a/b"), (true, vec!["a", "b"]));
    }

    #[test]
    fn symlink_segments_relative() {
        assert_eq!(symlink_segments("a/../b"), (false, vec!["a", "..", "b"]));
    }

    #[test]
    fn group_by_first_segment_splits_whole_subtree_imports() {
        let paths = vec!["a/b".to_string(), "a/c".to_string(), "d".to_string()];
        let groups = group_by_first_segment(&paths);
        assert_eq!(groups["a"], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(groups["d"], Vec::<String>::new());
    }
}
