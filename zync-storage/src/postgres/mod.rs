//! # Postgres based CVR storage backend
//!
//! This backend persists client view records across the two logical
//! groups described by the data model:
//!
//! * metadata (`cvr.instances`, `cvr.clients`, `cvr.queries`,
//!   `cvr.desires`), committed synchronously with every CVR transaction;
//! * row records (`cvr.rows` plus the `cvr.rows_version` consistency
//!   marker), committed either write-through or write-back via the
//!   row-record cache.
//!
//! ## Design Decisions
//!
//! ### Versions as cookies
//!
//! CVR versions are stored in their cookie rendition (`state[:minor]`
//! with lexi-encoded components). Cookies compare correctly as plain
//! strings, so version-range scans (catch-up) are ordinary text
//! comparisons and need no composite columns.
//!
//! ### Ownership
//!
//! Every metadata commit is guarded by a compare-and-set on
//! `cvr.instances.version`. When the update matches zero rows, the
//! instance row is re-read and the commit fails with an ownership error
//! carrying the current `owner` token: another view-syncer has taken over
//! the group and this instance must drain and stop.
//!
//! ### Consistency marker
//!
//! `cvr.rows_version.version` trails `cvr.instances.version` while row
//! commits are deferred. The flusher commits pending batches in version
//! order and moves the marker atomically with each batch, so
//! `instances.version >= rows_version.version` holds at all times and
//! equality signals a fully consistent persisted state.
//!
//! ### Timestamps
//!
//! We use naive timestamps and assume the server's local time is UTC.
//! Tests that compare timestamps should construct them timezone-aware and
//! convert to the naive UTC value.
//!
//! ### Atomic Transactions
//!
//! Operations receive a connection reference which can be a plain
//! connection or one inside a transactional context, so multiple CRUD
//! operations chain into a single transaction where required.

use diesel::prelude::*;
use diesel_async::pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;
use zync_core::storage::StorageError;

mod cvr;
mod orm;
pub mod rows;
mod schema;
mod store;

pub use cvr::delete_inactive_groups;
pub use rows::PgRowsGateway;
pub use store::{PgCvrStore, PgCvrStoreConfig};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/");

pub(crate) struct PostgresError(pub StorageError);

impl From<diesel::result::Error> for PostgresError {
    fn from(value: diesel::result::Error) -> Self {
        PostgresError(StorageError::Unexpected(format!("DieselError: {}", value)))
    }
}

impl From<PostgresError> for StorageError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<StorageError> for PostgresError {
    fn from(value: StorageError) -> Self {
        PostgresError(value)
    }
}

pub(crate) fn storage_error_from_diesel(
    err: diesel::result::Error,
    entity: &str,
    id: &str,
) -> PostgresError {
    let err_string = err.to_string();
    match err {
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        ) => PostgresError(StorageError::DuplicateEntry(entity.to_owned(), id.to_owned())),
        diesel::result::Error::NotFound => {
            PostgresError(StorageError::NotFound(entity.to_owned(), id.to_owned()))
        }
        _ => PostgresError(StorageError::Unexpected(err_string)),
    }
}

/// Builds a connection pool against `database_url` with at most
/// `max_size` connections.
pub fn connection_pool(
    database_url: &str,
    max_size: usize,
) -> Result<Pool<AsyncPgConnection>, StorageError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|err| StorageError::Unexpected(format!("Failed to build pool: {}", err)))
}

/// Applies the embedded migrations. Uses a synchronous connection; the
/// migration harness is not async and this runs once at startup.
pub fn run_migrations(database_url: &str) -> Result<(), StorageError> {
    let mut conn = PgConnection::establish(database_url)
        .map_err(|err| StorageError::Unexpected(format!("Failed to connect: {}", err)))?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| StorageError::Unexpected(format!("Migration failure: {}", err)))?;
    if !applied.is_empty() {
        info!(count = applied.len(), "applied pending CVR migrations");
    }
    Ok(())
}
