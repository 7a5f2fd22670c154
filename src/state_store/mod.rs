//! Persistence of the last observed instance representation.
//!
//! The store holds at most one representation. A missing file means the
//! instance has not been created yet (or was destroyed).

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::remote::InstanceRepresentation;

/// Errors raised while reading or writing observed state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when stored content is not a valid representation.
    #[error("failed to parse {path}: {message}")]
    Decode {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// Raised when a representation cannot be serialised.
    #[error("failed to encode observed state: {message}")]
    Encode {
        /// Serialiser message.
        message: String,
    },
}

/// Abstraction over observed-state persistence for dependency injection.
pub trait StateStore {
    /// Returns the stored representation, or `None` when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the store cannot be read or parsed.
    fn load(&self) -> Result<Option<InstanceRepresentation>, StateStoreError>;

    /// Replaces the stored representation.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when encoding or writing fails.
    fn save(&self, representation: &InstanceRepresentation) -> Result<(), StateStoreError>;

    /// Removes the stored representation. Clearing an empty store succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the file exists but cannot be removed.
    fn clear(&self) -> Result<(), StateStoreError>;
}

/// Stores the representation as pretty-printed JSON at a fixed path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileStateStore {
    path: Utf8PathBuf,
}

impl FileStateStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File the store reads and writes.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn parent(&self) -> &Utf8Path {
        match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        }
    }

    fn file_name(&self) -> Result<&str, StateStoreError> {
        self.path.file_name().ok_or_else(|| StateStoreError::Io {
            path: self.path.clone(),
            message: String::from("state file path is missing a filename"),
        })
    }

    fn io_error(path: &Utf8Path, err: &io::Error) -> StateStoreError {
        StateStoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// Opens the parent directory, or `None` when it does not exist.
    fn open_parent(&self) -> Result<Option<Dir>, StateStoreError> {
        let parent = self.parent();
        match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(parent, &err)),
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<InstanceRepresentation>, StateStoreError> {
        let file_name = self.file_name()?;
        let Some(dir) = self.open_parent()? else {
            return Ok(None);
        };
        if !dir
            .try_exists(file_name)
            .map_err(|err| Self::io_error(&self.path, &err))?
        {
            return Ok(None);
        }
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| Self::io_error(&self.path, &err))?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StateStoreError::Decode {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }

    fn save(&self, representation: &InstanceRepresentation) -> Result<(), StateStoreError> {
        let file_name = self.file_name()?;
        let parent = self.parent();
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| Self::io_error(parent, &err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| Self::io_error(parent, &err))?;

        let mut contents =
            serde_json::to_string_pretty(representation).map_err(|err| StateStoreError::Encode {
                message: err.to_string(),
            })?;
        contents.push('\n');
        dir.write(file_name, contents)
            .map_err(|err| Self::io_error(&self.path, &err))
    }

    fn clear(&self) -> Result<(), StateStoreError> {
        let file_name = self.file_name()?;
        let Some(dir) = self.open_parent()? else {
            return Ok(());
        };
        match dir.remove_file(file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&self.path, &err)),
        }
    }
}
