use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Document with id '{0}' not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// Whether the underlying storage engine reported a transient condition
    /// worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Storage(msg) if msg.contains("Busy") || msg.contains("TryAgain"))
    }
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for DbError {
    fn from(err: rocksdb::Error) -> Self {
        DbError::Storage(err.into_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::CorruptData(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbError::NotFound("doc123".to_string());
        assert_eq!(err.to_string(), "Document with id 'doc123' not found");

        let err = DbError::Conflict("revision 2-abc has moved on".to_string());
        assert_eq!(err.to_string(), "Conflict: revision 2-abc has moved on");

        let err = DbError::InvalidValue("unsupported property type".to_string());
        assert_eq!(err.to_string(), "Invalid value: unsupported property type");

        let err = DbError::InvalidState("database is closed".to_string());
        assert_eq!(err.to_string(), "Invalid state: database is closed");

        let err = DbError::Storage("write stalled".to_string());
        assert_eq!(err.to_string(), "Storage error: write stalled");
    }

    #[test]
    fn test_transient_detection() {
        assert!(DbError::Storage("Busy: write lock held".to_string()).is_transient());
        assert!(DbError::Storage("TryAgain".to_string()).is_transient());
        assert!(!DbError::Storage("corruption".to_string()).is_transient());
        assert!(!DbError::Conflict("x".to_string()).is_transient());
    }

    #[test]
    fn test_db_result_type() {
        let ok_result: DbResult<i32> = Ok(42);
        assert_eq!(ok_result.unwrap(), 42);

        let err_result: DbResult<i32> = Err(DbError::Storage("test".to_string()));
        assert!(err_result.is_err());
    }
}
