//! The zync view-syncer service.
//!
//! For each group of related clients this crate maintains a durable
//! client view record, drives incremental view maintenance pipelines
//! against a replica snapshot, applies row-level read authorization and
//! emits ordered, resumable pokes over per-client channels.

pub mod auth;
pub mod client;
pub mod config;
pub mod cvr;
pub mod ivm;
pub mod keys;
pub mod metrics;
pub mod pipelines;
pub mod poke;
pub mod replica;
pub mod snapshot;
pub mod view_syncer;
