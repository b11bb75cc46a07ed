//! Remote file source: the historian export directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to list remote directory {dir}: {source}")]
    List {
        dir: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to fetch {name} from {dir}: {source}")]
    Fetch {
        dir: String,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Rejected remote file name: {0}")]
    InvalidName(String),
}

/// Lists and downloads files from a remote directory.
///
/// Calls block until the transfer finishes.
pub trait RemoteSource {
    /// Names of the files in `dir`, without any directory part.
    fn list(&self, dir: &str) -> Result<Vec<String>, RemoteError>;

    /// Copy `dir/name` to the local path `dest`.
    fn fetch(&self, dir: &str, name: &str, dest: &Path) -> Result<(), RemoteError>;
}

impl<T: RemoteSource + ?Sized> RemoteSource for &T {
    fn list(&self, dir: &str) -> Result<Vec<String>, RemoteError> {
        (**self).list(dir)
    }

    fn fetch(&self, dir: &str, name: &str, dest: &Path) -> Result<(), RemoteError> {
        (**self).fetch(dir, name, dest)
    }
}

impl<T: RemoteSource + ?Sized> RemoteSource for Box<T> {
    fn list(&self, dir: &str) -> Result<Vec<String>, RemoteError> {
        (**self).list(dir)
    }

    fn fetch(&self, dir: &str, name: &str, dest: &Path) -> Result<(), RemoteError> {
        (**self).fetch(dir, name, dest)
    }
}

/// Historian export directory reachable as a local path (mount or share).
///
/// Remote directory names are resolved against `root`; an absolute remote
/// directory replaces it.
#[derive(Debug, Clone, Default)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, dir: &str) -> PathBuf {
        self.root.join(dir)
    }
}

impl RemoteSource for LocalDirSource {
    fn list(&self, dir: &str) -> Result<Vec<String>, RemoteError> {
        let path = self.resolve(dir);
        let list_err = |source| RemoteError::List {
            dir: dir.to_string(),
            source,
        };

        let mut names = Vec::new();
        for entry in fs::read_dir(&path).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            if !entry.file_type().map_err(list_err)?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(name = ?raw, "Skipping non UTF-8 remote file name"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn fetch(&self, dir: &str, name: &str, dest: &Path) -> Result<(), RemoteError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(RemoteError::InvalidName(name.to_string()));
        }
        let src = self.resolve(dir).join(name);
        let bytes = fs::copy(&src, dest).map_err(|source| RemoteError::Fetch {
            dir: dir.to_string(),
            name: name.to_string(),
            source,
        })?;
        debug!(file = %src.display(), bytes, "Fetched remote file");
        Ok(())
    }
}
