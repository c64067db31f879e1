//! Diesel async connection handling for SQLite.
//!
//! Uses diesel-async's SyncConnectionWrapper to provide an async interface
//! for SQLite. Since SQLite connections are lightweight, we create new
//! connections per request rather than pooling.

use std::path::Path;

use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind};
use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::AsyncConnection;

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// Async SQLite connection using SyncConnectionWrapper.
pub type AsyncSqliteConnection = SyncConnectionWrapper<SqliteConnection>;

/// Simple error info wrapper for connection errors.
#[derive(Debug)]
struct DbErrorInfo(String);

impl DatabaseErrorInformation for DbErrorInfo {
    fn message(&self) -> &str {
        &self.0
    }
    fn details(&self) -> Option<&str> {
        None
    }
    fn hint(&self) -> Option<&str> {
        None
    }
    fn table_name(&self) -> Option<&str> {
        None
    }
    fn column_name(&self) -> Option<&str> {
        None
    }
    fn constraint_name(&self) -> Option<&str> {
        None
    }
    fn statement_position(&self) -> Option<i32> {
        None
    }
}

/// Convert any displayable error to a diesel error with its message intact.
pub fn to_diesel_error(e: impl std::fmt::Display) -> DieselError {
    DieselError::DatabaseError(DatabaseErrorKind::Unknown, Box::new(DbErrorInfo(e.to_string())))
}

/// A simple async connection factory for SQLite.
///
/// The SyncConnectionWrapper internally uses spawn_blocking for async
/// operation.
#[derive(Clone)]
pub struct AsyncSqlitePool {
    database_url: String,
}

impl AsyncSqlitePool {
    /// Create a new async SQLite pool.
    pub fn new(database_url: &str) -> Self {
        // Strip sqlite: prefix if present for diesel
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            database_url: url.to_string(),
        }
    }

    /// Create pool from a file path.
    pub fn from_path(db_path: &Path) -> Self {
        Self::new(&db_path.display().to_string())
    }

    /// Get a new connection.
    pub async fn get(&self) -> Result<AsyncSqliteConnection, DieselError> {
        AsyncSqliteConnection::establish(&self.database_url)
            .await
            .map_err(to_diesel_error)
    }

    /// Get the database URL.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}
