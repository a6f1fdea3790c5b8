//! Error types shared across the dispatcher, matcher, and store.

use thiserror::Error;

/// Errors the core distinguishes.
///
/// A request-level error is replied to the client and logged; the connection
/// stays open. Store failures are logged and the operation fails best-effort.
/// `SessionShutdown` is treated as a connection close.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Error: {0}")]
    InvalidInput(String),

    #[error("Error: Client {0} does not exist")]
    UnknownClient(i64),

    #[error("Error: Action {0} does not exist")]
    UnknownAction(i64),

    #[error("Error: Insufficient balance for buying")]
    InsufficientFunds,

    #[error("Error: Failed to sell action, client does not have enough shares")]
    InsufficientShares,

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("market session closed")]
    SessionShutdown,
}

impl ExchangeError {
    /// Whether the error should be replied to the client verbatim.
    pub fn is_client_facing(&self) -> bool {
        !matches!(self, ExchangeError::Store(_) | ExchangeError::SessionShutdown)
    }
}
