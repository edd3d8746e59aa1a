//! Stable client identity presented to the relay as `auth_token`.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use uuid::Uuid;

use crate::Result;
use crate::error::Error;

/// Source of the client's identity token.
///
/// `get_or_create_token` must be idempotent: the first call may create and persist a
/// token, every later call returns the same one.
pub trait TokenStore: Send + Sync {
    fn get_or_create_token(&self) -> Result<Uuid>;
}

/// Token kept in a single-line text file, created on first use.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Conventional file name inside an application data directory.
    pub const FILE_NAME: &'static str = "auth.token";

    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Store the token as [`FILE_NAME`](Self::FILE_NAME) inside `dir`.
    #[must_use]
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self) -> Result<Uuid> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| self.failure(e))?;
        }

        let token = Uuid::new_v4();
        fs::write(&self.path, token.to_string()).map_err(|e| self.failure(e))?;

        #[cfg(feature = "tracing")]
        tracing::info!(path = %self.path.display(), "Created new identity token");

        Ok(token)
    }

    fn failure<E: fmt::Display>(&self, cause: E) -> Error {
        Error::identity(TokenFileError {
            path: self.path.clone(),
            cause: cause.to_string(),
        })
    }
}

impl TokenStore for FileTokenStore {
    fn get_or_create_token(&self) -> Result<Uuid> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Uuid::parse_str(contents.trim()).map_err(|e| self.failure(e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.create(),
            Err(e) => Err(self.failure(e)),
        }
    }
}

/// A token supplied by the host, never persisted.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct StaticTokenStore(pub Uuid);

impl StaticTokenStore {
    #[must_use]
    pub const fn new(token: Uuid) -> Self {
        Self(token)
    }
}

impl TokenStore for StaticTokenStore {
    fn get_or_create_token(&self) -> Result<Uuid> {
        Ok(self.0)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct TokenFileError {
    pub path: PathBuf,
    pub cause: String,
}

impl fmt::Display for TokenFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "identity token at {} unavailable: {}",
            self.path.display(),
            self.cause
        )
    }
}

impl std::error::Error for TokenFileError {}
