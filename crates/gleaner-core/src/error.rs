use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents all possible errors that can occur while harvesting,
/// enriching, versioning and publishing. It uses the `thiserror` crate for
/// ergonomic error handling and automatic conversion from underlying library
/// errors.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use gleaner_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::Generic("Something went wrong".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// Wraps all errors from SQLx database operations, including connection
    /// failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client request failed.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Dataset not found in the store.
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    /// Source not found in the store.
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// No connector is registered for a source.
    #[error("No connector registered for source: {0}")]
    ConnectorNotFound(String),

    /// Dataset version not found.
    #[error("Dataset version not found: {0}")]
    VersionNotFound(String),

    /// A promotion target matched more than one dataset version.
    #[error("Ambiguous dataset version {version}: {matches} versions match")]
    AmbiguousVersion { version: String, matches: usize },

    /// A version string is not of the form `major.minor.patch`.
    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    /// A stored value could not be mapped to a domain state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A connector fetch reported record errors.
    ///
    /// Any error count above zero fails the fetch for that source; the
    /// harvest watermark is not advanced.
    #[error("Fetch for source {source_name} reported {errors} errors")]
    FetchFailed { source_name: String, errors: usize },

    /// A harvest is already being synchronized by another worker.
    #[error("Harvest is already syncing: {0}")]
    HarvestBusy(String),

    /// Rows could not be locked because another writer holds them.
    #[error("Lock contention on {0} rows")]
    LockContention(usize),

    /// The enrichment resource backend failed for a whole batch.
    #[error("Resource backend unavailable during {phase}: {failures} calls failed")]
    ResourceUnavailable { phase: String, failures: usize },

    /// The search engine rejected an operation.
    #[error("Search engine error: {0}")]
    SearchEngineError(String),

    /// A remote index or alias does not exist.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// API response contained no data.
    #[error("Empty response from API")]
    EmptyResponse,

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ClientError(msg) => {
                if msg.contains("timeout") || msg.contains("timed out") {
                    "Request timed out. The source may be slow or unreachable.\n   Try again later or check the endpoint.".to_string()
                } else if msg.contains("connect") {
                    format!(
                        "Cannot connect to endpoint: {}\n   Check your network connection and the endpoint URL.",
                        msg
                    )
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::ConfigError(msg) => {
                format!(
                    "Invalid configuration: {}\n   Check your gleaner.toml or pass --config.",
                    msg
                )
            }
            AppError::FetchFailed {
                source_name,
                errors,
            } => {
                format!(
                    "Harvest of source '{}' failed with {} record errors.\n   The watermark was not advanced; the next run retries.",
                    source_name, errors
                )
            }
            AppError::AmbiguousVersion { version, matches } => {
                format!(
                    "Version {} matches {} dataset versions.\n   Nothing was promoted.",
                    version, matches
                )
            }
            AppError::ResourceUnavailable { phase, failures } => {
                format!(
                    "Enrichment backend unavailable during '{}' ({} failed calls).\n   Check RESOURCE_SERVICE_URL.",
                    phase, failures
                )
            }
            AppError::SearchEngineError(msg) => {
                format!(
                    "Search engine error: {}\n   Check ELASTICSEARCH_URL and credentials.",
                    msg
                )
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The server may be overloaded. Try again later.",
                    secs
                )
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::EmptyResponse => {
                "The API returned no data. The source may be temporarily unavailable.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_core::error::AppError;
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::LockContention(3);
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::DatasetNotFound("test".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ClientError(_)
                | AppError::LockContention(_)
        )
    }

    /// Returns true if the error means the remote backend could not be reached
    /// at all, as opposed to rejecting one particular request.
    ///
    /// Timeouts are excluded: a slow call says something about the document,
    /// not about the backend.
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::NetworkError(_))
    }
}
