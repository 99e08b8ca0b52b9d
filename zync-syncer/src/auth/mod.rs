//! Read authorization.
//!
//! Before an AST reaches the pipeline driver it is rewritten to enforce
//! the deployed row-level `select` policies, including inside nested
//! `related` and `exists` subqueries, so existence can never leak what
//! selection would hide. Transformed ASTs keep auth-data references as
//! parameter nodes and are cached per (query hash, permissions hash);
//! binding happens just before pipeline execution.

use crate::auth::transform::transform_query;
use lru::LruCache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;
use zync_core::models::permissions::{policy_condition, PermissionsError};
use zync_core::models::query::{query_hash, Ast, Condition};
use zync_core::models::row::RowValue;
use zync_core::models::schema::{ClientSchema, TableSpec};
use zync_core::storage::StoredPermissions;
use zync_core::{ColumnName, QueryHash, TableName};

pub mod transform;

const TRANSFORMED_AST_CACHE_SIZE: usize = 256;

/// A query rewritten for permissions, addressed by the hash of its
/// transformed AST.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformedQuery {
    pub ast: Ast,
    pub transformation_hash: String,
}

/// Guard on reading one cell: the column is stripped from emitted rows
/// unless the condition holds.
#[derive(Clone, Debug, PartialEq)]
pub struct CellGuard {
    pub table: TableName,
    pub column: ColumnName,
    pub condition: Condition,
}

pub struct Authorizer {
    permissions: Option<StoredPermissions>,
    cache: Mutex<LruCache<(QueryHash, String), TransformedQuery>>,
}

impl Authorizer {
    pub fn new(permissions: Option<StoredPermissions>) -> Self {
        Self {
            permissions,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(TRANSFORMED_AST_CACHE_SIZE).expect("non-zero cache size"),
            )),
        }
    }

    pub fn permissions_hash(&self) -> Option<&str> {
        self.permissions.as_ref().map(|p| p.hash.as_str())
    }

    /// Replaces the deployed policies. Cached transformations keyed by
    /// the old hash fall out of use with the key change.
    pub fn set_permissions(&mut self, permissions: Option<StoredPermissions>) {
        self.permissions = permissions;
    }

    /// Compile-time policy validation against the replicated tables.
    pub fn validate(
        &self,
        replicated: &BTreeMap<TableName, TableSpec>,
    ) -> Result<(), PermissionsError> {
        match &self.permissions {
            Some(stored) => stored.config.validate(replicated),
            None => Ok(()),
        }
    }

    /// Rewrites `ast` with the select policies and name mappings.
    pub fn transform(
        &self,
        hash: &QueryHash,
        ast: &Ast,
        schema: &ClientSchema,
    ) -> TransformedQuery {
        let permissions_hash = self
            .permissions_hash()
            .unwrap_or("unrestricted")
            .to_string();
        let cache_key = (hash.clone(), permissions_hash);
        if let Some(cached) = self
            .cache
            .lock()
            .expect("authorizer cache poisoned")
            .get(&cache_key)
        {
            return cached.clone();
        }

        let config = self.permissions.as_ref().map(|p| &p.config);
        let transformed = transform_query(ast, config, schema);
        let transformation_hash = query_hash(&transformed);
        let result = TransformedQuery { ast: transformed, transformation_hash };
        debug!(%hash, transformation = %result.transformation_hash, "transformed query");
        self.cache
            .lock()
            .expect("authorizer cache poisoned")
            .put(cache_key, result.clone());
        result
    }

    /// Cell-level select guards of all tables, conditions unbound.
    pub fn cell_guards(&self) -> Vec<CellGuard> {
        let Some(stored) = &self.permissions else {
            return Vec::new();
        };
        let mut guards = Vec::new();
        for (table, policies) in &stored.config.tables {
            for (column, asset) in &policies.cell {
                if let Some(select) = &asset.select {
                    guards.push(CellGuard {
                        table: table.clone(),
                        column: column.clone(),
                        condition: policy_condition(select),
                    });
                }
            }
        }
        guards
    }
}

/// Applies bound cell guards to a row, stripping denied columns.
///
/// Correlated conditions inside cell rules cannot be resolved here and
/// deny by default.
pub fn project_row(
    guards: &[CellGuard],
    table: &TableName,
    row: &RowValue,
    auth_data: &Value,
) -> RowValue {
    use crate::ivm::expr::{bind_condition, eval_condition};

    let mut projected = row.clone();
    for guard in guards.iter().filter(|g| &g.table == table) {
        let bound = bind_condition(&guard.condition, auth_data);
        let allowed = eval_condition(&bound, row, &mut |_, _| false);
        if !allowed {
            projected.remove(&guard.column);
        }
    }
    projected
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use zync_core::models::permissions::{
        anyone_can, AllowRule, AssetPolicies, PermissionsConfig, TablePolicies,
    };
    use zync_core::models::query::{SimpleCondition, SimpleOperator, ValuePosition};

    fn admin_only_cell_config() -> PermissionsConfig {
        let mut tables = BTreeMap::new();
        tables.insert(
            "users".to_string(),
            TablePolicies {
                row: Some(AssetPolicies { select: Some(anyone_can()), ..Default::default() }),
                cell: [(
                    "email".to_string(),
                    AssetPolicies {
                        select: Some(vec![AllowRule(Condition::Simple(SimpleCondition {
                            op: SimpleOperator::Eq,
                            left: ValuePosition::auth_param(["role"]),
                            right: ValuePosition::literal("admin"),
                        }))]),
                        ..Default::default()
                    },
                )]
                .into_iter()
                .collect(),
            },
        );
        PermissionsConfig { tables }
    }

    fn stored(config: PermissionsConfig) -> StoredPermissions {
        let hash = config.hash();
        StoredPermissions { config, hash }
    }

    #[test]
    fn test_transform_is_cached_per_permissions_hash() {
        let authorizer = Authorizer::new(Some(stored(admin_only_cell_config())));
        let ast = Ast::table("users");
        let hash = query_hash(&ast);
        let schema = ClientSchema::default();

        let first = authorizer.transform(&hash, &ast, &schema);
        let second = authorizer.transform(&hash, &ast, &schema);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cell_guard_projection() {
        let authorizer = Authorizer::new(Some(stored(admin_only_cell_config())));
        let guards = authorizer.cell_guards();
        assert_eq!(guards.len(), 1);

        let row = json!({"id": "u1", "email": "a@example.com"})
            .as_object()
            .unwrap()
            .clone();
        let admin = project_row(&guards, &"users".to_string(), &row, &json!({"role": "admin"}));
        assert!(admin.contains_key("email"));
        let viewer = project_row(&guards, &"users".to_string(), &row, &json!({"role": "viewer"}));
        assert!(!viewer.contains_key("email"));
    }
}
