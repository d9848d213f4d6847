use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocStoreError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("Unknown view: {0}")]
    UnknownView(String),

    #[error("Unknown column '{column}' in view '{view}'")]
    UnknownColumn { view: String, column: String },

    #[error("Invalid value for column '{column}': {reason}")]
    InvalidValue { column: String, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DocStoreError>;
