//! Core model types shared across the view-syncer.

pub mod cvr;
pub mod permissions;
pub mod query;
pub mod row;
pub mod schema;
pub mod version;

/// Identifies a group of related clients (e.g. all tabs of one browser
/// profile) that share a single CVR.
pub type ClientGroupId = String;
/// Identifies a single client within its group.
pub type ClientId = String;
/// Content hash of a (transformed) query AST, base16.
pub type QueryHash = String;
pub type TableName = String;
pub type SchemaName = String;
pub type ColumnName = String;

/// Hashes canonical bytes down to a 128-bit hex digest.
///
/// Used for the content-addressed permissions hash and for query
/// transformation hashes, so replicas and caches can detect changes by
/// comparing digests.
pub fn content_hash(bytes: &[u8]) -> String {
    use tiny_keccak::{Hasher, Keccak};

    let mut hasher = Keccak::v256();
    hasher.update(bytes);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    hex::encode(&output[..16])
}
