//! File identity
//!
//! Wraps `url::Url` so the rest of the engine can treat file identities as a
//! cheap, hashable value and convert to/from filesystem paths in one place.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, Result};

/// A normalized `file://` URI identifying one file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Parse a URI string. Only `file` scheme URIs identify workspace files;
    /// other schemes are preserved but `to_path` will fail for them.
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|_| EngineError::InvalidUri { uri: s.to_string() })?;
        Ok(Self(url.into()))
    }

    /// Build a URI from an absolute filesystem path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let url = Url::from_file_path(path).map_err(|()| EngineError::InvalidUri {
            uri: path.display().to_string(),
        })?;
        Ok(Self(url.into()))
    }

    /// True if this is a `file://` URI.
    pub fn is_file(&self) -> bool {
        self.0.starts_with("file://")
    }

    /// Convert back to a filesystem path.
    pub fn to_path(&self) -> Result<PathBuf> {
        let url = Url::parse(&self.0).map_err(|_| EngineError::InvalidUri {
            uri: self.0.clone(),
        })?;
        url.to_file_path().map_err(|()| EngineError::InvalidUri {
            uri: self.0.clone(),
        })
    }

    /// True if `self` identifies a path inside (or equal to) `root`.
    pub fn is_within(&self, root: &Uri) -> bool {
        match (self.to_path(), root.to_path()) {
            (Ok(p), Ok(r)) => p.starts_with(&r),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_round_trip() {
        let uri = Uri::from_path(Path::new("/tmp/project/src/lib.rs")).unwrap();
        assert!(uri.is_file());
        assert_eq!(uri.to_path().unwrap(), PathBuf::from("/tmp/project/src/lib.rs"));
    }

    #[test]
    fn test_is_within() {
        let root = Uri::from_path(Path::new("/tmp/project")).unwrap();
        let inside = Uri::from_path(Path::new("/tmp/project/src/main.rs")).unwrap();
        let outside = Uri::from_path(Path::new("/tmp/other/main.rs")).unwrap();
        assert!(inside.is_within(&root));
        assert!(!outside.is_within(&root));
    }

    #[test]
    fn test_non_file_scheme() {
        let uri = Uri::parse("untitled:Untitled-1").unwrap();
        assert!(!uri.is_file());
        assert!(uri.to_path().is_err());
    }
}
