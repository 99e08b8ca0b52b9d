//! Condition binding and evaluation over rows.
//!
//! Values follow a SQL-ish collation: NULL < booleans < numbers < strings
//! < arrays < objects, with numbers compared exactly when both sides are
//! integers. Comparisons against NULL are false except for `IS`/`IS NOT`.

use serde_json::Value;
use std::cmp::Ordering;
use zync_core::json::resolve_path;
use zync_core::models::query::{
    Condition, CorrelatedSubquery, ExistsOp, OrderPart, ParameterAnchor, SimpleCondition,
    SimpleOperator, SortDirection, ValuePosition,
};
use zync_core::models::row::RowValue;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                i.cmp(&j)
            } else {
                let i = x.as_f64().unwrap_or(f64::NAN);
                let j = y.as_f64().unwrap_or(f64::NAN);
                i.total_cmp(&j)
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                match cmp_values(i, j) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // Objects rarely participate in ordering; canonical text is a
            // stable tiebreak.
            Value::Object(x.clone())
                .to_string()
                .cmp(&Value::Object(y.clone()).to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sort key of a row under an `order by` specification, with the
/// canonical primary key as the final tiebreak. All keys in one ordered
/// collection share the same direction vector.
#[derive(Clone, Debug)]
pub struct SortKey {
    values: Vec<Value>,
    directions: Vec<SortDirection>,
    tiebreak: String,
}

impl SortKey {
    pub fn new(row: &RowValue, order_by: &[OrderPart], tiebreak: String) -> Self {
        let values = order_by
            .iter()
            .map(|OrderPart(column, _)| row.get(column).cloned().unwrap_or(Value::Null))
            .collect();
        let directions = order_by.iter().map(|OrderPart(_, dir)| *dir).collect();
        Self { values, directions, tiebreak }
    }

    pub fn tiebreak(&self) -> &str {
        &self.tiebreak
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (i, (a, b)) in self.values.iter().zip(other.values.iter()).enumerate() {
            let ordering = cmp_values(a, b);
            let ordering = match self.directions.get(i) {
                Some(SortDirection::Desc) => ordering.reverse(),
                _ => ordering,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.tiebreak.cmp(&other.tiebreak)
    }
}

/// Replaces parameter positions with literals resolved from the bound
/// auth data. The transformed AST stays reusable; binding happens just
/// before pipeline execution.
pub fn bind_condition(condition: &Condition, auth_data: &Value) -> Condition {
    match condition {
        Condition::Simple(simple) => Condition::Simple(SimpleCondition {
            op: simple.op,
            left: bind_position(&simple.left, auth_data),
            right: bind_position(&simple.right, auth_data),
        }),
        Condition::And { conditions } => Condition::And {
            conditions: conditions
                .iter()
                .map(|c| bind_condition(c, auth_data))
                .collect(),
        },
        Condition::Or { conditions } => Condition::Or {
            conditions: conditions
                .iter()
                .map(|c| bind_condition(c, auth_data))
                .collect(),
        },
        Condition::Correlated { related, op } => Condition::Correlated {
            related: bind_subquery(related, auth_data),
            op: *op,
        },
        Condition::Literal { value } => Condition::Literal { value: *value },
    }
}

fn bind_position(position: &ValuePosition, auth_data: &Value) -> ValuePosition {
    match position {
        ValuePosition::Parameter { anchor: ParameterAnchor::AuthData, path } => {
            ValuePosition::Literal { value: resolve_path(auth_data, path).clone() }
        }
        // The pre-mutation row only exists on the write path.
        ValuePosition::Parameter { anchor: ParameterAnchor::PreMutationRow, .. } => {
            ValuePosition::Literal { value: Value::Null }
        }
        other => other.clone(),
    }
}

/// Binds a whole AST: every condition in the tree, including those of
/// `related` subqueries, has its parameters resolved.
pub fn bind_ast(ast: &zync_core::models::query::Ast, auth_data: &Value) -> zync_core::models::query::Ast {
    let mut bound = ast.clone();
    if let Some(cond) = &ast.where_ {
        bound.where_ = Some(bind_condition(cond, auth_data));
    }
    bound.related = ast
        .related
        .iter()
        .map(|r| bind_subquery(r, auth_data))
        .collect();
    bound
}

pub fn bind_subquery(subquery: &CorrelatedSubquery, auth_data: &Value) -> CorrelatedSubquery {
    let mut bound = subquery.clone();
    if let Some(cond) = &subquery.subquery.where_ {
        bound.subquery.where_ = Some(bind_condition(cond, auth_data));
    }
    bound.subquery.related = subquery
        .subquery
        .related
        .iter()
        .map(|r| bind_subquery(r, auth_data))
        .collect();
    bound
}

/// Evaluates a bound condition against a row. Correlated subqueries are
/// delegated to `exists`, which the pipeline resolves against its
/// snapshot.
pub fn eval_condition(
    condition: &Condition,
    row: &RowValue,
    exists: &mut dyn FnMut(&CorrelatedSubquery, &RowValue) -> bool,
) -> bool {
    match condition {
        Condition::Literal { value } => *value,
        Condition::And { conditions } => conditions
            .iter()
            .all(|c| eval_condition(c, row, exists)),
        Condition::Or { conditions } => conditions
            .iter()
            .any(|c| eval_condition(c, row, exists)),
        Condition::Correlated { related, op } => {
            let present = exists(related, row);
            match op {
                ExistsOp::Exists => present,
                ExistsOp::NotExists => !present,
            }
        }
        Condition::Simple(simple) => eval_simple(simple, row),
    }
}

fn position_value(position: &ValuePosition, row: &RowValue) -> Value {
    match position {
        ValuePosition::Column { name } => row.get(name).cloned().unwrap_or(Value::Null),
        ValuePosition::Literal { value } => value.clone(),
        // Unbound parameters evaluate as NULL.
        ValuePosition::Parameter { .. } => Value::Null,
    }
}

fn eval_simple(simple: &SimpleCondition, row: &RowValue) -> bool {
    let left = position_value(&simple.left, row);
    let right = position_value(&simple.right, row);

    match simple.op {
        SimpleOperator::Is => return cmp_values(&left, &right) == Ordering::Equal,
        SimpleOperator::IsNot => return cmp_values(&left, &right) != Ordering::Equal,
        _ => {}
    }
    if left.is_null() || right.is_null() {
        return false;
    }

    match simple.op {
        SimpleOperator::Eq => cmp_values(&left, &right) == Ordering::Equal,
        SimpleOperator::Neq => cmp_values(&left, &right) != Ordering::Equal,
        SimpleOperator::Lt => cmp_values(&left, &right) == Ordering::Less,
        SimpleOperator::Lte => cmp_values(&left, &right) != Ordering::Greater,
        SimpleOperator::Gt => cmp_values(&left, &right) == Ordering::Greater,
        SimpleOperator::Gte => cmp_values(&left, &right) != Ordering::Less,
        SimpleOperator::In => match &right {
            Value::Array(values) => values
                .iter()
                .any(|v| cmp_values(&left, v) == Ordering::Equal),
            _ => false,
        },
        SimpleOperator::NotIn => match &right {
            Value::Array(values) => !values
                .iter()
                .any(|v| cmp_values(&left, v) == Ordering::Equal),
            _ => false,
        },
        SimpleOperator::Like => like_match(&right, &left, false),
        SimpleOperator::NotLike => !like_match(&right, &left, false),
        SimpleOperator::ILike => like_match(&right, &left, true),
        SimpleOperator::NotILike => !like_match(&right, &left, true),
        SimpleOperator::Is | SimpleOperator::IsNot => unreachable!("handled above"),
    }
}

/// SQL `LIKE` with `%` and `_` wildcards and `\` escapes.
fn like_match(pattern: &Value, text: &Value, case_insensitive: bool) -> bool {
    let (Value::String(pattern), Value::String(text)) = (pattern, text) else {
        return false;
    };
    let (pattern, text) = if case_insensitive {
        (pattern.to_lowercase(), text.to_lowercase())
    } else {
        (pattern.clone(), text.clone())
    };
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    like_inner(&pattern, &text)
}

fn like_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|skip| like_inner(rest, &text[skip..])),
        Some(('_', rest)) => !text.is_empty() && like_inner(rest, &text[1..]),
        Some(('\\', rest)) => match (rest.split_first(), text.split_first()) {
            (Some((escaped, rest)), Some((c, text_rest))) => {
                escaped == c && like_inner(rest, text_rest)
            }
            _ => false,
        },
        Some((c, rest)) => match text.split_first() {
            Some((t, text_rest)) => c == t && like_inner(rest, text_rest),
            None => false,
        },
    }
}
