//! # Build Errors
//!
//! Every failure the build can hit is one of these variants. Nothing is retried:
//! an error travels up to `main`, is printed once, and the process exits with 1.
//! The only non-error outcome that looks like one is a skipped PE patch, which is
//! modelled in [`crate::pe::PatchOutcome`] instead.

use std::path::PathBuf;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    /// The Program Files lookup failed, including after the fallback folder was tried.
    #[error("Failed to resolve the {folder} directory (status 0x{status:08X})")]
    PlatformQuery { folder: String, status: u32 },

    /// An external tool ran but returned a non-zero exit code.
    #[error("{program} {arguments} returned {code}")]
    ToolFailed {
        program: String,
        arguments: String,
        code: i32,
    },

    /// An external tool could not be started at all.
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// `run` was called again on a pipeline that already failed.
    #[error("The build already failed and cannot be run again")]
    AlreadyFailed,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn platform_query(folder: impl ToString, status: i32) -> Self {
        Self::PlatformQuery {
            folder: folder.to_string(),
            status: status as u32,
        }
    }
}
