use thiserror::Error;

/// Main error type for the agent fleet
#[derive(Error, Debug)]
pub enum FleetError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Secret error: {0}")]
    Secret(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Admission failures
    #[error("Gas too high: {0}")]
    GasTooHigh(String),

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    // Validation failures
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Unsupported symbol: {0}")]
    UnsupportedSymbol(String),

    // Chain/wallet errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Chain RPC error: {0}")]
    Chain(String),

    #[error("Transaction submission failed: {0}")]
    Submission(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for FleetError
pub type Result<T> = std::result::Result<T, FleetError>;
