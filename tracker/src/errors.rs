use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Deliberately carries no detail: unknown and malformed credentials
    /// must look the same to the caller.
    #[error("Invalid API key")]
    Unauthorized,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Caller-facing failure classes of an ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Unauthorized => ErrorKind::Authorization,
            Error::Database(_) | Error::Migration(_) | Error::Storage(_) => ErrorKind::Storage,
            Error::Mqtt(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::Validation("lat".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::Unauthorized.kind(), ErrorKind::Authorization);
        assert_eq!(
            Error::Storage("down".to_string()).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            Error::Database(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_unauthorized_message_is_generic() {
        assert_eq!(Error::Unauthorized.to_string(), "Invalid API key");
    }
}
