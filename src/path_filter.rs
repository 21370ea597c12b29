//! Path resolution and filtering.
//!
//! Maps absolute filesystem paths to [`RelativePath`]s under the watched
//! root, and decides which paths are even eligible to sync. Kept free of
//! I/O beyond the symlink check so it can be unit tested against plain
//! strings.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A path under the watched root, normalized to forward slashes.
///
/// Invariants: never empty, never absolute, never contains a `..`
/// component. Equal to the server-side path the uploader sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(String);

impl RelativePath {
    /// Builds a `RelativePath` from path components relative to the
    /// watched root. Returns `None` if the result would violate an
    /// invariant (this should not happen for paths that passed
    /// `Filter::resolve`, but callers that build paths by hand should
    /// still check).
    pub fn new(path: &Path) -> Option<Self> {
        if path.is_absolute() {
            return None;
        }
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host-native relative path, for joining against the watched root.
    pub fn to_local_path(&self) -> PathBuf {
        let mut buf = PathBuf::new();
        for part in self.0.split('/') {
            buf.push(part);
        }
        buf
    }

    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a candidate path was rejected by the [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OutsideRoot,
    IsDirectory,
    ExcludedName,
    ExcludedExtension,
    SymlinkEscape,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OutsideRoot => "outside-root",
            Self::IsDirectory => "is-directory",
            Self::ExcludedName => "excluded-name",
            Self::ExcludedExtension => "excluded-extension",
            Self::SymlinkEscape => "symlink-escape",
        };
        f.write_str(s)
    }
}

const EXCLUDED_COMPONENTS: &[&str] = &[".git", "node_modules"];
const EXCLUDED_EXACT_NAMES: &[&str] = &[".DS_Store", "Thumbs.db"];
const EXCLUDED_SUFFIXES: &[&str] = &[".tmp", ".swp"];

/// Decides which files under the watched root are eligible to sync.
///
/// Built-in exclusions always apply; `file_extensions`, if non-empty,
/// narrows eligibility further.
#[derive(Debug, Clone)]
pub struct Filter {
    root: PathBuf,
    /// Lower-cased, dot-prefixed extensions (e.g. `.pdf`). Empty means
    /// "all extensions eligible".
    allowed_extensions: Vec<String>,
}

impl Filter {
    pub fn new(root: PathBuf, file_extensions: &[String]) -> Self {
        let allowed_extensions = file_extensions
            .iter()
            .map(|ext| ext.to_lowercase())
            .collect();
        Self {
            root,
            allowed_extensions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an absolute local path to a `RelativePath`, or a rejection
    /// reason. Does not touch the filesystem except for the symlink check.
    pub fn resolve(&self, absolute_path: &Path) -> Result<RelativePath, RejectReason> {
        let relative = absolute_path
            .strip_prefix(&self.root)
            .map_err(|_| RejectReason::OutsideRoot)?;

        if relative.as_os_str().is_empty() {
            return Err(RejectReason::OutsideRoot);
        }

        for component in relative.components() {
            if let Component::Normal(part) = component {
                let name = part.to_string_lossy();
                if EXCLUDED_COMPONENTS.iter().any(|excl| name == *excl) {
                    return Err(RejectReason::ExcludedName);
                }
            }
        }

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(RejectReason::OutsideRoot)?;

        if self.is_excluded_name(&file_name) {
            return Err(RejectReason::ExcludedName);
        }

        if !self.allowed_extensions.is_empty() && !self.has_allowed_extension(&file_name) {
            return Err(RejectReason::ExcludedExtension);
        }

        match std::fs::symlink_metadata(absolute_path) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                match std::fs::canonicalize(absolute_path) {
                    Ok(target) if target.starts_with(&self.root) => {}
                    _ => return Err(RejectReason::SymlinkEscape),
                }
                // Symlinks are never followed for content, even if the
                // target is inside the root: treat as not-a-file.
                return Err(RejectReason::IsDirectory);
            }
            Ok(metadata) if metadata.is_dir() => return Err(RejectReason::IsDirectory),
            _ => {}
        }

        RelativePath::new(relative).ok_or(RejectReason::OutsideRoot)
    }

    fn is_excluded_name(&self, file_name: &str) -> bool {
        if file_name.starts_with('.') || file_name.starts_with("~$") {
            return true;
        }
        if EXCLUDED_EXACT_NAMES.iter().any(|excl| file_name == *excl) {
            return true;
        }
        let lower = file_name.to_lowercase();
        EXCLUDED_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
    }

    fn has_allowed_extension(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.allowed_extensions
            .iter()
            .any(|ext| lower.ends_with(ext.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(exts: &[&str]) -> Filter {
        Filter::new(
            PathBuf::from("/watched"),
            &exts.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn rejects_paths_outside_root() {
        let f = filter(&[]);
        assert_eq!(
            f.resolve(Path::new("/other/file.txt")),
            Err(RejectReason::OutsideRoot)
        );
    }

    #[test]
    fn rejects_dotfiles_and_lock_files() {
        let f = filter(&[]);
        assert_eq!(
            f.resolve(Path::new("/watched/.DS_Store")),
            Err(RejectReason::ExcludedName)
        );
        assert_eq!(
            f.resolve(Path::new("/watched/.hidden")),
            Err(RejectReason::ExcludedName)
        );
        assert_eq!(
            f.resolve(Path::new("/watched/~$notes.docx")),
            Err(RejectReason::ExcludedName)
        );
    }

    #[test]
    fn rejects_git_and_node_modules_components() {
        let f = filter(&[]);
        assert_eq!(
            f.resolve(Path::new("/watched/.git/HEAD")),
            Err(RejectReason::ExcludedName)
        );
        assert_eq!(
            f.resolve(Path::new("/watched/vendor/node_modules/pkg/index.js")),
            Err(RejectReason::ExcludedName)
        );
    }

    #[test]
    fn empty_extension_list_means_all_eligible() {
        let f = filter(&[]);
        assert_eq!(
            f.resolve(Path::new("/watched/case_A/notes.txt")).unwrap(),
            RelativePath::new(Path::new("case_A/notes.txt")).unwrap()
        );
    }

    #[test]
    fn narrows_to_allowed_extensions_case_insensitively() {
        let f = filter(&[".pdf", ".docx"]);
        assert_eq!(
            f.resolve(Path::new("/watched/case_A/brief.PDF")).unwrap(),
            RelativePath::new(Path::new("case_A/brief.PDF")).unwrap()
        );
        assert_eq!(
            f.resolve(Path::new("/watched/case_A/notes.txt")),
            Err(RejectReason::ExcludedExtension)
        );
    }

    #[test]
    fn relative_path_round_trips_wire_and_local_forms() {
        let rp = RelativePath::new(Path::new("case_A/notes.txt")).unwrap();
        assert_eq!(rp.as_str(), "case_A/notes.txt");
        assert_eq!(rp.basename(), "notes.txt");
        assert_eq!(rp.to_local_path(), PathBuf::from("case_A").join("notes.txt"));
    }

    #[test]
    fn relative_path_rejects_dotdot_and_absolute() {
        assert!(RelativePath::new(Path::new("../escape.txt")).is_none());
        assert!(RelativePath::new(Path::new("/abs/path")).is_none());
        assert!(RelativePath::new(Path::new("")).is_none());
    }

    #[test]
    fn filter_is_idempotent() {
        let f = filter(&[]);
        let path = Path::new("/watched/case_A/notes.txt");
        let once = f.resolve(path).unwrap();
        // Re-resolving the relative path joined back onto the root must
        // yield the same RelativePath.
        let rejoined = f.root().join(once.to_local_path());
        let twice = f.resolve(&rejoined).unwrap();
        assert_eq!(once, twice);
    }
}
