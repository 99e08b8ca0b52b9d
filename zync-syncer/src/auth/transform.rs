//! The permission AST transform.
//!
//! For every table a query touches, the table's `select` policy
//! disjunction is conjoined with the existing `where`, then the rewrite
//! descends into each `related` and `exists` subquery. Client-side table
//! and column names are rewritten to their server names along the way.
//! Subqueries originating from policy rules are tagged as `permissions`
//! pipelines so their rows are never reported to clients.

use zync_core::models::permissions::{policy_condition, PermissionsConfig};
use zync_core::models::query::{
    Ast, Condition, Correlation, CorrelatedSubquery, OrderPart, QuerySystem, SimpleCondition,
    ValuePosition,
};
use zync_core::models::schema::ClientSchema;

/// Rewrites a client query for execution: name mapping plus row-level
/// `select` authorization. With no deployed permissions only the name
/// mapping applies.
pub fn transform_query(
    ast: &Ast,
    permissions: Option<&PermissionsConfig>,
    schema: &ClientSchema,
) -> Ast {
    transform_node(ast, permissions, schema)
}

fn transform_node(ast: &Ast, permissions: Option<&PermissionsConfig>, schema: &ClientSchema) -> Ast {
    let client_table = ast.table.clone();
    let server_table = schema.server_table_name(&client_table).to_string();
    let map_column =
        |name: &str| schema.server_column_name(&client_table, name).to_string();

    let mapped_where = ast
        .where_
        .as_ref()
        .map(|cond| transform_condition(cond, permissions, schema, &map_column));

    let select_policy = permissions.map(|config| {
        let policy = config
            .tables
            .get(&server_table)
            .and_then(|t| t.row.as_ref())
            .and_then(|row| row.select.as_ref());
        match policy {
            // No policy at all means the table is not exposed.
            None => Condition::Literal { value: false },
            Some(rules) => tag_permissions_system(policy_condition(rules)),
        }
    });

    let where_ = match (mapped_where, select_policy) {
        (None, None) => None,
        (Some(cond), None) => Some(cond),
        (None, Some(policy)) => Some(policy),
        (Some(cond), Some(policy)) => Some(Condition::and(vec![cond, policy])),
    };

    Ast {
        schema: ast.schema.clone(),
        table: server_table,
        where_,
        related: ast
            .related
            .iter()
            .map(|rel| CorrelatedSubquery {
                correlation: map_correlation(&rel.correlation, &map_column, schema, &rel.subquery),
                subquery: Box::new(transform_node(&rel.subquery, permissions, schema)),
                system: rel.system,
            })
            .collect(),
        order_by: ast
            .order_by
            .iter()
            .map(|OrderPart(column, dir)| OrderPart(map_column(column), *dir))
            .collect(),
        limit: ast.limit,
    }
}

fn transform_condition(
    condition: &Condition,
    permissions: Option<&PermissionsConfig>,
    schema: &ClientSchema,
    map_column: &dyn Fn(&str) -> String,
) -> Condition {
    match condition {
        Condition::Literal { value } => Condition::Literal { value: *value },
        Condition::And { conditions } => Condition::And {
            conditions: conditions
                .iter()
                .map(|c| transform_condition(c, permissions, schema, map_column))
                .collect(),
        },
        Condition::Or { conditions } => Condition::Or {
            conditions: conditions
                .iter()
                .map(|c| transform_condition(c, permissions, schema, map_column))
                .collect(),
        },
        Condition::Simple(simple) => Condition::Simple(SimpleCondition {
            op: simple.op,
            left: map_position(&simple.left, map_column),
            right: map_position(&simple.right, map_column),
        }),
        // An exists subquery is itself authorized, so existence cannot
        // reveal rows the user could not select.
        Condition::Correlated { related, op } => Condition::Correlated {
            related: CorrelatedSubquery {
                correlation: map_correlation(
                    &related.correlation,
                    map_column,
                    schema,
                    &related.subquery,
                ),
                subquery: Box::new(transform_node(&related.subquery, permissions, schema)),
                system: related.system,
            },
            op: *op,
        },
    }
}

fn map_position(position: &ValuePosition, map_column: &dyn Fn(&str) -> String) -> ValuePosition {
    match position {
        ValuePosition::Column { name } => ValuePosition::Column { name: map_column(name) },
        other => other.clone(),
    }
}

fn map_correlation(
    correlation: &Correlation,
    map_parent_column: &dyn Fn(&str) -> String,
    schema: &ClientSchema,
    subquery: &Ast,
) -> Correlation {
    Correlation {
        parent_field: correlation
            .parent_field
            .iter()
            .map(|c| map_parent_column(c))
            .collect(),
        child_field: correlation
            .child_field
            .iter()
            .map(|c| schema.server_column_name(&subquery.table, c).to_string())
            .collect(),
    }
}

/// Marks every correlated subquery inside a policy condition as a
/// permissions pipeline.
fn tag_permissions_system(condition: Condition) -> Condition {
    match condition {
        Condition::Correlated { related, op } => Condition::Correlated {
            related: CorrelatedSubquery {
                correlation: related.correlation,
                subquery: related.subquery,
                system: QuerySystem::Permissions,
            },
            op,
        },
        Condition::And { conditions } => Condition::And {
            conditions: conditions.into_iter().map(tag_permissions_system).collect(),
        },
        Condition::Or { conditions } => Condition::Or {
            conditions: conditions.into_iter().map(tag_permissions_system).collect(),
        },
        other => other,
    }
}
