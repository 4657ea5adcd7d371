//! Unified error handling for catalog construction, ingestion and queries.

/// Application error type.
///
/// Per-line ingestion failures are reported as `Rejected`; a line that no
/// pattern matches is not an error at all (the parser returns `None`).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Line rejected: {0}")]
    Rejected(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Check if this error represents a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error represents a per-line rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}
