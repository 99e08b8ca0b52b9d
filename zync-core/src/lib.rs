//! Shared data model of the zync view-syncer.
//!
//! This crate defines the language of the system: versions and cookies,
//! row identities and records, the query AST, permission policies, the
//! client wire protocol and the storage traits the persistence layer
//! implements. It contains no IO of its own.

pub mod json;
pub mod models;
pub mod protocol;
pub mod storage;

pub use models::{ClientGroupId, ClientId, ColumnName, QueryHash, SchemaName, TableName};
