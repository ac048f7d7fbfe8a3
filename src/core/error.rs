use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZFileError {
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    #[error("Corrupt entry '{name}': {reason}")]
    CorruptEntry { name: String, reason: String },

    #[error("Name conflict: a live entry named '{0}' already exists")]
    NameConflict(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid entry '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signing failed for {entry} ({algorithm}): {reason}")]
    SigningFailure {
        entry: String,
        algorithm: String,
        reason: String,
    },

    #[error("Unsupported archive feature: {0}")]
    Unsupported(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Container is closed")]
    Closed,

    #[error("Extensions did not reach a fixpoint after {0} passes")]
    FixpointDivergence(usize),
}

impl ZFileError {
    pub(crate) fn corrupt_entry(name: &str, reason: impl Into<String>) -> Self {
        ZFileError::CorruptEntry {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn signing(
        entry: impl Into<String>,
        algorithm: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ZFileError::SigningFailure {
            entry: entry.into(),
            algorithm: algorithm.into(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for ZFileError {
    fn from(err: toml::de::Error) -> Self {
        ZFileError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ZFileError>;
