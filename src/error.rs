use axum::http::StatusCode;
use std::fmt::Display;

/// Errors surfaced by the record, task, alert and configuration stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Maps a unique violation to `Conflict`, everything else to `Database`.
    pub fn from_db(err: sqlx::Error, what: &str) -> Self {
        if is_unique_violation(&err) {
            return StoreError::Conflict(what.to_string());
        }
        StoreError::Database(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

pub fn map_store_error(err: StoreError) -> (StatusCode, String) {
    match err {
        StoreError::Conflict(what) => {
            tracing::warn!(what = %what, "store conflict");
            (StatusCode::CONFLICT, "Resource already exists".to_string())
        }
        StoreError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
        StoreError::Database(err) => {
            tracing::error!(error = %err, "database error");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
        }
    }
}

/// Maps a service-layer error onto an HTTP status by looking at its root cause.
pub fn map_service_error(err: anyhow::Error) -> (StatusCode, String) {
    if let Some(validation) = err.downcast_ref::<ValidationError>() {
        return (StatusCode::BAD_REQUEST, validation.to_string());
    }
    match err.downcast::<StoreError>() {
        Ok(store) => map_store_error(store),
        Err(other) => internal_error(format!("{other:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err = anyhow::Error::new(ValidationError::new("end", "must be after start"));
        let (status, message) = map_service_error(err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message, "invalid end: must be after start");
    }

    #[test]
    fn store_errors_keep_their_status() {
        let err = anyhow::Error::new(StoreError::NotFound("task".to_string()));
        assert_eq!(map_service_error(err).0, StatusCode::NOT_FOUND);

        let err = anyhow::Error::new(StoreError::Conflict("alert".to_string()));
        assert_eq!(map_service_error(err).0, StatusCode::CONFLICT);
    }

    #[test]
    fn other_errors_are_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(map_service_error(err).0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
