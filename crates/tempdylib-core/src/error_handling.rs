//! Error types for materializing and loading library images.
//!
//! Every error is `Clone`: when several threads wait on the same first load,
//! each of them receives the failure of that single attempt.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Opaque failure reported by a [`crate::loader::ModuleLoader`].
pub type LoaderError = Arc<dyn Error + Send + Sync + 'static>;

/// Failure of the verify-then-write loop.
#[derive(Debug, Clone)]
pub enum MaterializeError {
    /// Rounds ran out and the final one could not open the file for reading,
    /// so there were no contents left to compare. Every other way of running
    /// out of rounds is `ContentMismatchExhausted`.
    ReadOpenFailed {
        path: PathBuf,
        attempts: u32,
        read: Arc<io::Error>,
        write: Option<Arc<io::Error>>,
    },
    /// The file could not be opened for writing in the final round.
    WriteOpenFailed {
        path: PathBuf,
        attempts: u32,
        read: Option<Arc<io::Error>>,
        write: Arc<io::Error>,
    },
    /// Rounds ran out without reading back the image. `read` holds the last
    /// failure to read an opened file, if the final round had one.
    ContentMismatchExhausted {
        path: PathBuf,
        attempts: u32,
        read: Option<Arc<io::Error>>,
        write: Option<Arc<io::Error>>,
    },
}

impl MaterializeError {
    pub fn path(&self) -> &PathBuf {
        match self {
            MaterializeError::ReadOpenFailed { path, .. }
            | MaterializeError::WriteOpenFailed { path, .. }
            | MaterializeError::ContentMismatchExhausted { path, .. } => path,
        }
    }

    /// Number of rounds run before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            MaterializeError::ReadOpenFailed { attempts, .. }
            | MaterializeError::WriteOpenFailed { attempts, .. }
            | MaterializeError::ContentMismatchExhausted { attempts, .. } => *attempts,
        }
    }

    pub fn last_read_error(&self) -> Option<&io::Error> {
        match self {
            MaterializeError::ReadOpenFailed { read, .. } => Some(&**read),
            MaterializeError::WriteOpenFailed { read, .. }
            | MaterializeError::ContentMismatchExhausted { read, .. } => read.as_deref(),
        }
    }

    pub fn last_write_error(&self) -> Option<&io::Error> {
        match self {
            MaterializeError::WriteOpenFailed { write, .. } => Some(&**write),
            MaterializeError::ReadOpenFailed { write, .. }
            | MaterializeError::ContentMismatchExhausted { write, .. } => write.as_deref(),
        }
    }
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::ReadOpenFailed { path, attempts, read, write } => {
                write!(
                    f,
                    "cannot open {} for reading after {} attempts: {}",
                    path.display(),
                    attempts,
                    read
                )?;
                if let Some(w) = write {
                    write!(f, " (last write error: {})", w)?;
                }
                Ok(())
            }
            MaterializeError::WriteOpenFailed { path, attempts, read, write } => {
                write!(
                    f,
                    "cannot open {} for writing after {} attempts: {}",
                    path.display(),
                    attempts,
                    write
                )?;
                if let Some(r) = read {
                    write!(f, " (last read error: {})", r)?;
                }
                Ok(())
            }
            MaterializeError::ContentMismatchExhausted { path, attempts, read, write } => {
                write!(
                    f,
                    "contents of {} still differ from the image after {} attempts",
                    path.display(),
                    attempts
                )?;
                if let Some(r) = read {
                    write!(f, " (last read error: {})", r)?;
                }
                if let Some(w) = write {
                    write!(f, " (last write error: {})", w)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for MaterializeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MaterializeError::ReadOpenFailed { read, .. } => Some(&**read),
            MaterializeError::WriteOpenFailed { write, .. } => Some(&**write),
            MaterializeError::ContentMismatchExhausted { read, write, .. } => read
                .as_deref()
                .or(write.as_deref())
                .map(|e| e as &(dyn Error + 'static)),
        }
    }
}

/// Any failure on the way from an image to a resolved routine.
#[derive(Debug, Clone)]
pub enum LoadError {
    /// The logical name is not a single file name component.
    InvalidName { name: String },
    /// Buffering the image source failed.
    ImageReadFailed { name: String, source: Arc<io::Error> },
    /// The buffered image does not match the pinned integrity hash.
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    Materialize { name: String, source: MaterializeError },
    ModuleLoadFailed { path: PathBuf, source: LoaderError },
    SymbolResolveFailed {
        library: String,
        symbol: String,
        source: LoaderError,
    },
    TooManyArguments {
        symbol: String,
        given: usize,
        max: usize,
    },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::InvalidName { name } => {
                write!(f, "invalid library name {:?}: must be a plain file name", name)
            }
            LoadError::ImageReadFailed { name, source } => {
                write!(f, "failed to read image for {}: {}", name, source)
            }
            LoadError::IntegrityMismatch { name, expected, actual } => write!(
                f,
                "image for {} failed integrity check (expected {}, got {})",
                name, expected, actual
            ),
            LoadError::Materialize { name, source } => {
                write!(f, "failed to write {} to disk: {}", name, source)
            }
            LoadError::ModuleLoadFailed { path, source } => {
                write!(f, "failed to load {}: {}", path.display(), source)
            }
            LoadError::SymbolResolveFailed { library, symbol, source } => {
                write!(f, "failed to find {} in {}: {}", symbol, library, source)
            }
            LoadError::TooManyArguments { symbol, given, max } => write!(
                f,
                "{} called with {} arguments, at most {} are supported",
                symbol, given, max
            ),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoadError::ImageReadFailed { source, .. } => Some(&**source),
            LoadError::Materialize { source, .. } => Some(source),
            LoadError::ModuleLoadFailed { source, .. }
            | LoadError::SymbolResolveFailed { source, .. } => Some(&**source),
            LoadError::InvalidName { .. }
            | LoadError::IntegrityMismatch { .. }
            | LoadError::TooManyArguments { .. } => None,
        }
    }
}

impl From<LoadError> for String {
    fn from(e: LoadError) -> Self {
        e.to_string()
    }
}
