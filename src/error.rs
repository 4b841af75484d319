//! Crate-wide error type.
//!
//! One variant per error kind distinguished by callers: a *format* error means
//! the archive itself is structurally wrong (bad trailer, bad gzip member, bad
//! TAR header); a *slice* error means the sliced byte stream could not satisfy
//! a read or write (missing slice, failed lock, hook failure); a *filesystem*
//! error is scoped to one catalog entry during extraction or walking and is
//! reported rather than propagated by the caller; *usage* covers malformed
//! CLI invocations recognized outside of `clap`'s own parser.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("format error: {0}")]
    Format(String),

    #[error("slice error: {0}")]
    Slice(String),

    #[error("filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("usage error: {0}")]
    Usage(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[cfg(unix)]
    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn slice(msg: impl Into<String>) -> Self {
        Error::Slice(msg.into())
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Filesystem { path: path.into(), source }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    /// True for the error kinds that must abort the whole run rather than
    /// being logged and skipped for a single catalog entry (see §7 of the
    /// design: filesystem errors during extraction are the only recoverable
    /// kind from the outer loop's point of view).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Filesystem { .. })
    }
}
