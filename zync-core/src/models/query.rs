//! The query AST.
//!
//! Queries arrive from clients as JSON and are kept as plain data: tagged
//! unions with explicit constructors. Relationship subqueries store the
//! destination table by name; cycles in the schema graph are resolved by
//! lookup, never by holding references.

use crate::json::canonical_string;
use crate::models::{content_hash, ColumnName, QueryHash, SchemaName, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub fn default_schema() -> SchemaName {
    "public".to_string()
}

fn is_default_schema(s: &SchemaName) -> bool {
    s == "public"
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    #[serde(default = "default_schema", skip_serializing_if = "is_default_schema")]
    pub schema: SchemaName,
    pub table: TableName,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<CorrelatedSubquery>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Ast {
    pub fn table(table: impl Into<TableName>) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            where_: None,
            related: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// All table names referenced by this query, including nested
    /// relationships and exists subqueries.
    pub fn referenced_tables(&self) -> BTreeSet<TableName> {
        let mut tables = BTreeSet::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, into: &mut BTreeSet<TableName>) {
        into.insert(self.table.clone());
        for related in &self.related {
            related.subquery.collect_tables(into);
        }
        if let Some(cond) = &self.where_ {
            cond.collect_tables(into);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderPart(pub ColumnName, pub SortDirection);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    Simple(SimpleCondition),
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    #[serde(rename = "correlatedSubquery")]
    Correlated { related: CorrelatedSubquery, op: ExistsOp },
    /// Constant condition; unsatisfiable permission policies collapse to
    /// `Literal { value: false }` and still execute.
    Literal { value: bool },
}

impl Condition {
    /// Conjunction that flattens nested `and`s, drops constant-true terms
    /// and collapses to constant-false when any term is constant-false.
    pub fn and(conditions: Vec<Condition>) -> Condition {
        let mut flat = Vec::new();
        for cond in conditions {
            match cond {
                Condition::Literal { value: true } => {}
                Condition::Literal { value: false } => {
                    return Condition::Literal { value: false };
                }
                Condition::And { conditions } => flat.extend(conditions),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Condition::Literal { value: true },
            1 => flat.into_iter().next().expect("len checked"),
            _ => Condition::And { conditions: flat },
        }
    }

    /// Disjunction, dual of [`Condition::and`].
    pub fn or(conditions: Vec<Condition>) -> Condition {
        let mut flat = Vec::new();
        for cond in conditions {
            match cond {
                Condition::Literal { value: false } => {}
                Condition::Literal { value: true } => {
                    return Condition::Literal { value: true };
                }
                Condition::Or { conditions } => flat.extend(conditions),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Condition::Literal { value: false },
            1 => flat.into_iter().next().expect("len checked"),
            _ => Condition::Or { conditions: flat },
        }
    }

    fn collect_tables(&self, into: &mut BTreeSet<TableName>) {
        match self {
            Condition::Simple(_) | Condition::Literal { .. } => {}
            Condition::And { conditions } | Condition::Or { conditions } => {
                for cond in conditions {
                    cond.collect_tables(into);
                }
            }
            Condition::Correlated { related, .. } => {
                related.subquery.collect_tables(into);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimpleCondition {
    pub op: SimpleOperator,
    pub left: ValuePosition,
    pub right: ValuePosition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimpleOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "NOT LIKE")]
    NotLike,
    #[serde(rename = "ILIKE")]
    ILike,
    #[serde(rename = "NOT ILIKE")]
    NotILike,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    #[serde(rename = "IS")]
    Is,
    #[serde(rename = "IS NOT")]
    IsNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistsOp {
    #[serde(rename = "EXISTS")]
    Exists,
    #[serde(rename = "NOT EXISTS")]
    NotExists,
}

/// A value position inside a condition: a column of the row under test, a
/// literal, or a parameter resolved from bound data (auth data or the
/// pre-mutation row) by dotted path just before pipeline execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValuePosition {
    Column { name: ColumnName },
    Literal { value: Value },
    Parameter { anchor: ParameterAnchor, path: Vec<String> },
}

impl ValuePosition {
    pub fn column(name: impl Into<ColumnName>) -> Self {
        ValuePosition::Column { name: name.into() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ValuePosition::Literal { value: value.into() }
    }

    pub fn auth_param<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        ValuePosition::Parameter {
            anchor: ParameterAnchor::AuthData,
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterAnchor {
    AuthData,
    PreMutationRow,
}

/// Which part of the system a subquery's rows belong to. Rows of
/// `Permissions` pipelines are consumed by filtering only and are never
/// reported to clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuerySystem {
    #[default]
    Client,
    Permissions,
}

fn is_client(system: &QuerySystem) -> bool {
    *system == QuerySystem::Client
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedSubquery {
    pub correlation: Correlation,
    pub subquery: Box<Ast>,
    #[serde(default, skip_serializing_if = "is_client")]
    pub system: QuerySystem,
}

/// Field correlation between a parent row and rows of a subquery. The
/// field lists are positional pairs: `parent_field[i]` must equal
/// `child_field[i]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub parent_field: Vec<ColumnName>,
    pub child_field: Vec<ColumnName>,
}

/// Content hash of an AST, used as the pipeline and CVR query identity.
pub fn query_hash(ast: &Ast) -> QueryHash {
    let value = serde_json::to_value(ast).expect("ASTs are plain data");
    let canonical = match &value {
        Value::Object(map) => canonical_string(map).expect("AST objects are finite"),
        _ => value.to_string(),
    };
    content_hash(canonical.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn issues_of_project() -> Ast {
        Ast {
            where_: Some(Condition::Simple(SimpleCondition {
                op: SimpleOperator::Eq,
                left: ValuePosition::column("project_id"),
                right: ValuePosition::literal("p1"),
            })),
            related: vec![CorrelatedSubquery {
                correlation: Correlation {
                    parent_field: vec!["id".to_string()],
                    child_field: vec!["issue_id".to_string()],
                },
                subquery: Box::new(Ast::table("comments")),
                system: QuerySystem::Client,
            }],
            ..Ast::table("issues")
        }
    }

    #[test]
    fn test_ast_serde_round_trip() {
        let ast = issues_of_project();
        let encoded = serde_json::to_value(&ast).unwrap();
        assert_eq!(
            encoded,
            json!({
                "table": "issues",
                "where": {
                    "type": "simple",
                    "op": "=",
                    "left": {"type": "column", "name": "project_id"},
                    "right": {"type": "literal", "value": "p1"},
                },
                "related": [{
                    "correlation": {
                        "parentField": ["id"],
                        "childField": ["issue_id"],
                    },
                    "subquery": {"table": "comments"},
                }],
            })
        );
        let back: Ast = serde_json::from_value(encoded).unwrap();
        assert_eq!(back, ast);
    }

    #[test]
    fn test_query_hash_ignores_nothing_and_is_stable() {
        let a = issues_of_project();
        let b = issues_of_project();
        assert_eq!(query_hash(&a), query_hash(&b));

        let mut c = issues_of_project();
        c.limit = Some(10);
        assert_ne!(query_hash(&a), query_hash(&c));
    }

    #[test]
    fn test_referenced_tables_recurses() {
        let mut ast = issues_of_project();
        ast.where_ = Some(Condition::and(vec![
            ast.where_.take().unwrap(),
            Condition::Correlated {
                related: CorrelatedSubquery {
                    correlation: Correlation {
                        parent_field: vec!["project_id".to_string()],
                        child_field: vec!["project_id".to_string()],
                    },
                    subquery: Box::new(Ast::table("project_members")),
                    system: QuerySystem::Permissions,
                },
                op: ExistsOp::Exists,
            },
        ]));
        let tables: Vec<_> = ast.referenced_tables().into_iter().collect();
        assert_eq!(tables, vec!["comments", "issues", "project_members"]);
    }

    #[test]
    fn test_condition_constructors_collapse_constants() {
        let t = Condition::Literal { value: true };
        let f = Condition::Literal { value: false };
        let simple = Condition::Simple(SimpleCondition {
            op: SimpleOperator::Eq,
            left: ValuePosition::column("a"),
            right: ValuePosition::literal(1),
        });

        assert_eq!(Condition::and(vec![t.clone(), simple.clone()]), simple);
        assert_eq!(Condition::and(vec![f.clone(), simple.clone()]), f);
        assert_eq!(Condition::or(vec![f.clone(), simple.clone()]), simple);
        assert_eq!(Condition::or(vec![t.clone(), simple.clone()]), t);
        assert_eq!(Condition::and(vec![]), t);
        assert_eq!(Condition::or(vec![]), f);
    }
}
