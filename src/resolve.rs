//! Mapping request paths onto the document root

use crate::error::{Result, ServeError};
use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A request path resolved to a file inside the document root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Normalized URL path used as the cache key, e.g. `/docs/index.html`
    pub key_path: String,
    /// Location on disk
    pub fs_path: PathBuf,
}

/// Resolves request paths against a fixed document root
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    index_file: String,
}

impl PathResolver {
    /// Create a resolver; the root is canonicalized when it exists so that
    /// symlink escapes can be detected later
    pub fn new(root: impl AsRef<Path>, index_file: impl Into<String>) -> Self {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        PathResolver {
            root,
            index_file: index_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a request path (query already removed)
    ///
    /// Percent-decodes, collapses empty and `.` segments and appends the
    /// index file to directory paths. Any `..` segment, NUL byte or
    /// backslash is `Forbidden`; errors never mention filesystem paths.
    pub fn resolve(&self, request_path: &str) -> Result<ResolvedPath> {
        let decoded = percent_decode_str(request_path)
            .decode_utf8()
            .map_err(|_| ServeError::NotFound(request_path.to_string()))?;

        if decoded.contains('\0') || decoded.contains('\\') {
            return Err(ServeError::Forbidden(request_path.to_string()));
        }

        let mut segments = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(ServeError::Forbidden(request_path.to_string())),
                other => segments.push(other),
            }
        }

        if decoded.ends_with('/') || segments.is_empty() {
            segments.push(&self.index_file);
        }

        let mut fs_path = self.root.clone();
        for segment in &segments {
            // Segments cannot hold separators here, but a drive prefix or
            // root component would still replace the whole path on push
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => fs_path.push(segment),
                _ => return Err(ServeError::Forbidden(request_path.to_string())),
            }
        }

        Ok(ResolvedPath {
            key_path: format!("/{}", segments.join("/")),
            fs_path,
        })
    }

    /// Confirm that an existing file is still inside the root once symlinks
    /// are followed
    pub async fn confine(&self, resolved: &ResolvedPath) -> Result<PathBuf> {
        match tokio::fs::canonicalize(&resolved.fs_path).await {
            Ok(real) if real.starts_with(&self.root) => Ok(real),
            Ok(_) => {
                debug!("Path escapes document root: {}", resolved.key_path);
                Err(ServeError::Forbidden(resolved.key_path.clone()))
            }
            Err(_) => Err(ServeError::NotFound(resolved.key_path.clone())),
        }
    }
}
