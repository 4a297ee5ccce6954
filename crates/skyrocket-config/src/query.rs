//! A small subset of the mongo query language evaluated against JSON
//! documents. Field paths use `->` as separator, like modification
//! documents.
//!
//! Supported: field equality, `$exists`, `$ne`, `$in`, `$nin`, `$gt`, `$gte`,
//! `$lt`, `$lte`, and top-level or nested `$and`/`$or`. Unknown `$`
//! operators never match.

use serde_json::{Map, Value};

const PATH_SEPARATOR: &str = "->";

/// Evaluate `query` against `doc`.
pub fn matches_query(query: &Map<String, Value>, doc: &Value) -> bool {
  query.iter().all(|(key, condition)| match key.as_str() {
    "$and" => clauses(condition).all(|clause| matches_query(clause, doc)),
    "$or" => {
      let mut any = clauses(condition).peekable();
      any.peek().is_some() && any.any(|clause| matches_query(clause, doc))
    }
    _ => matches_field(lookup(doc, key), condition),
  })
}

fn clauses(condition: &Value) -> impl Iterator<Item = &Map<String, Value>> {
  condition
    .as_array()
    .into_iter()
    .flatten()
    .filter_map(Value::as_object)
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
  path
    .split(PATH_SEPARATOR)
    .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

fn is_operator_document(condition: &Value) -> bool {
  condition
    .as_object()
    .is_some_and(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn matches_field(value: Option<&Value>, condition: &Value) -> bool {
  if !is_operator_document(condition) {
    return match (value, condition) {
      (None, Value::Null) => true,
      (Some(value), condition) => value == condition,
      (None, _) => false,
    };
  }

  let Some(operators) = condition.as_object() else {
    return false;
  };
  operators.iter().all(|(op, arg)| match op.as_str() {
    "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
    "$ne" => !matches_field(value, arg),
    "$in" => arg
      .as_array()
      .is_some_and(|options| options.iter().any(|option| matches_field(value, option))),
    "$nin" => arg
      .as_array()
      .is_some_and(|options| !options.iter().any(|option| matches_field(value, option))),
    "$gt" => compare(value, arg).is_some_and(|o| o.is_gt()),
    "$gte" => compare(value, arg).is_some_and(|o| o.is_ge()),
    "$lt" => compare(value, arg).is_some_and(|o| o.is_lt()),
    "$lte" => compare(value, arg).is_some_and(|o| o.is_le()),
    _ => false,
  })
}

fn compare(value: Option<&Value>, arg: &Value) -> Option<std::cmp::Ordering> {
  match (value?, arg) {
    (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
    _ => None,
  }
}
