//! Lexical resolution of guest paths beneath a preopen.
//!
//! Every path a guest hands to an `*_at` operation is resolved here before
//! the OS sees it. Resolution is purely lexical: `.` and empty segments are
//! dropped and `..` removes the previous segment. Absolute paths, and any
//! `..` that would climb above the preopen root, are rejected with
//! `not-permitted`.

use super::{ErrorCode, FsResult};
use std::path::PathBuf;

/// A descriptor's position beneath its preopen root, as a list of
/// already-normalized segments. Empty for the preopen itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct GuestPath {
    segments: Vec<String>,
}

impl GuestPath {
    /// The preopen root.
    pub(crate) fn root() -> Self {
        GuestPath::default()
    }

    /// Resolves `subpath` relative to `self`.
    pub(crate) fn join(&self, subpath: &str) -> FsResult<GuestPath> {
        if is_absolute(subpath) {
            return Err(ErrorCode::NotPermitted.into());
        }
        let mut segments = self.segments.clone();
        for segment in subpath.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(ErrorCode::NotPermitted.into());
                    }
                }
                s => segments.push(s.to_string()),
            }
        }
        Ok(GuestPath { segments })
    }

    /// The path to hand to the preopen's `cap_std::fs::Dir`.
    pub(crate) fn to_host_path(&self) -> PathBuf {
        if self.segments.is_empty() {
            return PathBuf::from(".");
        }
        self.segments.iter().collect()
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || std::path::Path::new(path).has_root()
}

/// Whether the guest asked for `path` to name a directory.
pub(crate) fn has_trailing_separator(path: &str) -> bool {
    path.ends_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(base: &str, sub: &str) -> FsResult<PathBuf> {
        Ok(GuestPath::root().join(base)?.join(sub)?.to_host_path())
    }

    #[test]
    fn dot_and_empty_segments_collapse() {
        assert_eq!(resolve("", "a//./b/").unwrap(), PathBuf::from("a/b"));
        assert_eq!(resolve("", ".").unwrap(), PathBuf::from("."));
        assert_eq!(resolve("", "").unwrap(), PathBuf::from("."));
    }

    #[test]
    fn parent_segments_stay_below_the_root() {
        assert_eq!(resolve("a/b", "../c").unwrap(), PathBuf::from("a/c"));
        assert_eq!(resolve("a", "..").unwrap(), PathBuf::from("."));
        assert_eq!(resolve("a", "b/../../c").unwrap(), PathBuf::from("c"));
    }

    #[test]
    fn escaping_the_root_is_not_permitted() {
        for (base, sub) in [("", "../x"), ("a", "../../x"), ("", "a/../../x"), ("", "..")] {
            let err = resolve(base, sub).unwrap_err();
            assert_eq!(*err.code(), ErrorCode::NotPermitted, "{base:?} + {sub:?}");
        }
    }

    #[test]
    fn absolute_paths_are_not_permitted() {
        for path in ["/etc/passwd", "//x"] {
            let err = GuestPath::root().join(path).unwrap_err();
            assert_eq!(*err.code(), ErrorCode::NotPermitted);
        }
    }

    #[test]
    fn trailing_separator() {
        assert!(has_trailing_separator("dir/"));
        assert!(!has_trailing_separator("dir"));
    }
}
