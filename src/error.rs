use crate::volume::FileSystemType;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HFSPError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid partition offset or length")]
    InvalidFileView,

    #[error("Corrupt structure: {0}")]
    CorruptStructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Inconsistent volume: {0}")]
    Inconsistent(String),

    #[error("No HFS, HFS+ or HFSX file system found")]
    NoFileSystem,

    #[error("Unsupported file system: {0}")]
    UnsupportedFileSystem(FileSystemType),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Not a file: {0}")]
    NotAFile(String),
}

impl HFSPError {
    pub(crate) fn corrupt<S: Into<String>>(message: S) -> Self {
        HFSPError::CorruptStructure(message.into())
    }

    pub(crate) fn inconsistent<S: Into<String>>(message: S) -> Self {
        HFSPError::Inconsistent(message.into())
    }

    pub(crate) fn io_context(context: &str, error: io::Error) -> Self {
        HFSPError::Io(io::Error::new(error.kind(), format!("{}: {}", context, error)))
    }
}

impl From<HFSPError> for io::Error {
    fn from(error: HFSPError) -> Self {
        match error {
            HFSPError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
