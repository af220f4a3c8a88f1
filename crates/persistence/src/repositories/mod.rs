//! Repository implementations.
//!
//! Repositories provide data access operations for entities and implement the
//! domain store traits on top of PostgreSQL.

pub mod reading;
pub mod submission;

pub use reading::ReadingRepository;
pub use submission::SubmissionRepository;

use domain::StoreError;

/// Map a database error onto the domain store error.
pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23505") => StoreError::Duplicate(db_err.message().to_string()),
            _ => StoreError::Unavailable(format!("Database error: {}", db_err)),
        },
        other => StoreError::Unavailable(format!("Database error: {}", other)),
    }
}
