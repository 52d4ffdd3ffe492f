use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to read {name}: {source}")]
    FileIo {
        name: String,
        source: std::io::Error,
    },

    #[error("file modified while reading: {0}")]
    Modified(String),

    #[error("unsupported file path: {0:?}")]
    InvalidPath(String),

    #[error("not a regular file or directory: {0}")]
    IrregularEntry(String),

    #[error("walk error: {name}: {source}")]
    Walk {
        name: String,
        source: std::io::Error,
    },

    #[error("scan cancelled")]
    Cancelled,

    #[error("invalid index on line {line}: {reason}")]
    Format { line: u64, reason: String },

    #[error("cannot back up irregular file: {0}")]
    IrregularBackup(String),

    #[error("no such file or directory in index: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error aborts the whole scan rather than a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Format { .. })
    }
}
