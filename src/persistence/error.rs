//! Store failures.
//!
//! `MemoryBackend` never fails; every variant comes from `FjallBackend`.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum PersistenceError {
    /// The keyspace or one of its partitions could not be opened
    Open {
        path: PathBuf,
        source: fjall::Error,
    },
    /// A read, write or batch commit failed
    Store(fjall::Error),
    /// A record could not be encoded for storage
    Encode(bincode::error::EncodeError),
    /// A stored record no longer decodes
    Decode(bincode::error::DecodeError),
    /// A key in `partition` does not have the expected layout
    CorruptKey { partition: &'static str },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "cannot open store at {}: {}", path.display(), source)
            }
            Self::Store(e) => write!(f, "store error: {}", e),
            Self::Encode(e) => write!(f, "cannot encode record: {}", e),
            Self::Decode(e) => write!(f, "cannot decode record: {}", e),
            Self::CorruptKey { partition } => write!(f, "malformed key in '{}'", partition),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Store(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::CorruptKey { .. } => None,
        }
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Store(err)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
