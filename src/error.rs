use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection not initialized")]
    NotConfigured,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Connection error: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("{0}")]
    Sql(#[from] sqlx::Error),

    #[error("Query timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection already released")]
    Released,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set when connecting at startup")]
    MissingCredential(&'static str),
}

/// Failures that end the process with a non-zero status.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup connection failed: {0}")]
    Startup(#[source] DbError),

    #[error("I/O error on stdio: {0}")]
    Io(#[from] std::io::Error),
}
