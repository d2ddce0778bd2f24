use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path is outside root directory")]
    PathTraversal,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Directory operation not allowed on file")]
    NotADirectory,

    #[error("File operation not allowed on directory")]
    NotAFile,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl From<zip::result::ZipError> for FileError {
    fn from(error: zip::result::ZipError) -> Self {
        match error {
            zip::result::ZipError::Io(err) => FileError::Io(err),
            other => FileError::Archive(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for FileError {
    fn from(error: tokio::task::JoinError) -> Self {
        FileError::Io(std::io::Error::other(error.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, FileError>;
