use minbar_core::MinbarError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for MinbarError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => MinbarError::NotFound(what),
            other => MinbarError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found() {
        let err: MinbarError = StoreError::NotFound("session".into()).into();
        assert_eq!(err.kind(), "not_found");
        assert!(err.is_fatal());
    }

    #[test]
    fn database_failure_maps_to_internal() {
        let err: MinbarError = StoreError::Database(rusqlite::Error::InvalidQuery).into();
        assert_eq!(err.kind(), "internal");
        assert!(err.is_retryable());
    }
}
