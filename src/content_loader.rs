//! Content Loader & Path Safety (spec §4.8).
//!
//! Resolves a request source — inline `content` or a workspace-relative
//! `path` — into text plus a base path, rejecting anything that would read
//! outside the workspace root.

use std::path::{Component, Path, PathBuf};

use crate::error::ApiError;

/// `isPathSafe(root, candidate)`: true iff, after normalization, the real
/// path of the deepest *existing* ancestor of `root/candidate` resolves
/// strictly inside the real path of `root`. Absolute paths, embedded NUL, and
/// `..` components are rejected before touching the filesystem (spec §4.8,
/// testable property 5).
pub fn is_path_safe(root: &Path, candidate: &Path) -> bool {
    if candidate.as_os_str().is_empty() {
        return false;
    }
    if has_nul_byte(candidate) {
        return false;
    }
    if candidate.is_absolute() {
        return false;
    }
    if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }

    let joined = root.join(candidate);
    let real_root = match std::fs::canonicalize(root) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let real_ancestor = match deepest_existing_ancestor(&joined) {
        Some(p) => p,
        None => return false,
    };

    real_ancestor.starts_with(&real_root)
}

fn has_nul_byte(path: &Path) -> bool {
    path.to_string_lossy().contains('\0')
}

fn deepest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    loop {
        if let Ok(real) = std::fs::canonicalize(&current) {
            return Some(real);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// A loaded request document: the raw text plus the directory it should be
/// treated as relative-to for any further (e.g. `bodyFile`) resolution.
pub struct LoadedContent {
    pub text: String,
    pub base_path: PathBuf,
}

pub struct ContentLoader {
    workspace_root: PathBuf,
}

impl ContentLoader {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Spec §4.3 step 3: if `path` is given, assert workspace-safety and read
    /// it; if `content` is given with a relative `base_path`, validate that
    /// base path too. Exactly one of `content`/`path` must be supplied by the
    /// caller (enforced one level up, `ContentOrPathRequired`/`ValidationError`).
    pub async fn load(&self, content: Option<&str>, path: Option<&str>, base_path: Option<&str>) -> Result<LoadedContent, ApiError> {
        if let Some(path) = path {
            let candidate = PathBuf::from(path);
            if !is_path_safe(&self.workspace_root, &candidate) {
                return Err(ApiError::PathOutsideWorkspace(path.to_string()));
            }
            let full = self.workspace_root.join(&candidate);
            let text = tokio::fs::read_to_string(&full)
                .await
                .map_err(|_| ApiError::FileNotFound(path.to_string()))?;
            let base_path = full.parent().map(Path::to_path_buf).unwrap_or_else(|| self.workspace_root.clone());
            return Ok(LoadedContent { text, base_path });
        }

        if let Some(content) = content {
            let base_path = match base_path {
                Some(base_path) => {
                    let candidate = PathBuf::from(base_path);
                    if !is_path_safe(&self.workspace_root, &candidate) {
                        return Err(ApiError::PathOutsideWorkspace(base_path.to_string()));
                    }
                    self.workspace_root.join(&candidate)
                }
                None => self.workspace_root.clone(),
            };
            return Ok(LoadedContent {
                text: content.to_string(),
                base_path,
            });
        }

        Err(ApiError::ContentOrPathRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rejects_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_path_safe(dir.path(), Path::new("/etc/passwd")));
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_path_safe(dir.path(), Path::new("../../etc/passwd")));
    }

    #[test]
    fn rejects_embedded_nul() {
        let dir = tempfile::tempdir().unwrap();
        let bad = unsafe { String::from_utf8_unchecked(vec![b'a', 0, b'b']) };
        assert!(!is_path_safe(dir.path(), Path::new(&bad)));
    }

    #[test]
    fn accepts_existing_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("req.http"), "GET http://example.com").unwrap();
        assert!(is_path_safe(dir.path(), Path::new("req.http")));
    }

    #[test]
    fn accepts_nonexistent_file_under_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("requests")).unwrap();
        assert!(is_path_safe(dir.path(), Path::new("requests/new.http")));
    }

    #[test]
    fn rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "nope").unwrap();

        #[cfg(unix)]
        {
            let link = dir.path().join("escape");
            std::os::unix::fs::symlink(outside.path(), &link).unwrap();
            assert!(!is_path_safe(dir.path(), Path::new("escape/secret.txt")));
        }
    }

    #[tokio::test]
    async fn loader_rejects_escaping_path() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ContentLoader::new(dir.path().to_path_buf());
        let err = loader.load(None, Some("../../etc/passwd"), None).await.unwrap_err();
        assert!(matches!(err, ApiError::PathOutsideWorkspace(_)));
    }

    #[tokio::test]
    async fn loader_rejects_escaping_base_path_with_inline_content() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ContentLoader::new(dir.path().to_path_buf());
        let err = loader.load(Some("GET http://example.com"), None, Some("../../etc")).await.unwrap_err();
        assert!(matches!(err, ApiError::PathOutsideWorkspace(_)));
    }

    #[tokio::test]
    async fn loader_resolves_base_path_under_workspace_for_inline_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("fixtures")).unwrap();
        let loader = ContentLoader::new(dir.path().to_path_buf());
        let loaded = loader.load(Some("GET http://example.com"), None, Some("fixtures")).await.unwrap();
        assert_eq!(loaded.base_path, dir.path().join("fixtures"));
    }

    #[tokio::test]
    async fn loader_requires_content_or_path() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ContentLoader::new(dir.path().to_path_buf());
        let err = loader.load(None, None, None).await.unwrap_err();
        assert!(matches!(err, ApiError::ContentOrPathRequired));
    }
}
