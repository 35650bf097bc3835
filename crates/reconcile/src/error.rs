//! Error types for the reconciliation core

/// Failures surfaced by the workflow store.
///
/// `Conflict` is not fatal: it is how a lost insert race reports itself,
/// and the engine answers it by reloading the winner's row.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint rejected the write: {0}")]
    Conflict(String),
    /// The store did not answer within the configured timeout.
    #[error("store operation timed out: {0}")]
    Timeout(String),
    /// Any other database-level failure.
    #[error("database error: {0}")]
    Database(String),
    /// A row held data outside the expected domain (e.g. unknown status).
    #[error("unexpected row data: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => StoreError::Timeout(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Failures at the Event Receiver boundary. Anything here is reported to
/// the webhook caller; nothing here ever reaches the engine.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook signature verification failed")]
    SignatureInvalid,
    #[error("webhook payload could not be parsed: {0}")]
    MalformedPayload(String),
}
