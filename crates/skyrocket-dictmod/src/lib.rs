//! Skyrocket DictMod
//!
//! Applies mongo-style modification documents to nested JSON mappings in
//! place. A modification document maps an operator keyword to its settings:
//!
//! ```ignore
//! {"_push": {"log": "hello"}, "_set": {"params->ecut": 520}}
//! ```
//!
//! Operator keywords are prefixed with `_` so they can live inside stored
//! documents, and nested paths use `->` because `.` is not allowed in stored
//! keys.
//!
//! Application is not transactional: when an operator fails, the operators
//! before it have already been applied. Callers that need all-or-nothing
//! semantics apply to a copy.

mod error;

pub use error::DictModError;

use serde_json::{Map, Number, Value};

/// Separator for nested keys.
pub const PATH_SEPARATOR: &str = "->";

/// How unknown operator keywords are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
  /// Unknown operators fail with [`DictModError::UnsupportedOperator`].
  #[default]
  Strict,
  /// Unknown operators are skipped.
  Lenient,
}

/// A supported modification operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
  Set,
  Unset,
  Inc,
  Push,
  PushAll,
  Pull,
  PullAll,
  AddToSet,
  Pop,
  Rename,
}

impl Operator {
  pub const ALL: [Operator; 10] = [
    Operator::Set,
    Operator::Unset,
    Operator::Inc,
    Operator::Push,
    Operator::PushAll,
    Operator::Pull,
    Operator::PullAll,
    Operator::AddToSet,
    Operator::Pop,
    Operator::Rename,
  ];

  /// Look up an operator by its document keyword (e.g. `_push_all`).
  pub fn from_keyword(keyword: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|op| op.keyword() == keyword)
  }

  pub fn keyword(self) -> &'static str {
    match self {
      Operator::Set => "_set",
      Operator::Unset => "_unset",
      Operator::Inc => "_inc",
      Operator::Push => "_push",
      Operator::PushAll => "_push_all",
      Operator::Pull => "_pull",
      Operator::PullAll => "_pull_all",
      Operator::AddToSet => "_add_to_set",
      Operator::Pop => "_pop",
      Operator::Rename => "_rename",
    }
  }

  fn apply(self, obj: &mut Map<String, Value>, settings: &Map<String, Value>) -> Result<(), DictModError> {
    for (key, value) in settings {
      match self {
        Operator::Set => {
          let (parent, leaf) = nested_parent(obj, key)?;
          parent.insert(leaf.to_string(), value.clone());
        }
        Operator::Unset => {
          let (parent, leaf) = nested_parent(obj, key)?;
          parent.remove(leaf);
        }
        Operator::Inc => inc(obj, key, value)?,
        Operator::Push => {
          let (parent, leaf) = nested_parent(obj, key)?;
          match parent.get_mut(leaf) {
            Some(Value::Array(items)) => items.push(value.clone()),
            Some(_) => return Err(not_a_list(key)),
            None => {
              parent.insert(leaf.to_string(), Value::Array(vec![value.clone()]));
            }
          }
        }
        Operator::PushAll => {
          let Value::Array(extra) = value else {
            return Err(not_a_list(key));
          };
          let (parent, leaf) = nested_parent(obj, key)?;
          match parent.get_mut(leaf) {
            Some(Value::Array(items)) => items.extend(extra.iter().cloned()),
            Some(_) => return Err(not_a_list(key)),
            None => {
              parent.insert(leaf.to_string(), value.clone());
            }
          }
        }
        Operator::Pull => pull(obj, key, value)?,
        Operator::PullAll => {
          let Value::Array(values) = value else {
            return Err(not_a_list(key));
          };
          for item in values {
            pull(obj, key, item)?;
          }
        }
        Operator::AddToSet => {
          let (parent, leaf) = nested_parent(obj, key)?;
          match parent.get_mut(leaf) {
            Some(Value::Array(items)) => {
              if !items.contains(value) {
                items.push(value.clone());
              }
            }
            Some(_) => return Err(not_a_list(key)),
            None => {
              parent.insert(leaf.to_string(), value.clone());
            }
          }
        }
        Operator::Pop => pop(obj, key, value)?,
        Operator::Rename => {
          let target = value
            .as_str()
            .ok_or_else(|| DictModError::InvalidRenameTarget { key: key.clone() })?;
          if let Some(moved) = obj.remove(key) {
            obj.insert(target.to_string(), moved);
          }
        }
      }
    }
    Ok(())
  }
}

/// Apply a modification document in strict mode.
pub fn apply_mod(modification: &Map<String, Value>, obj: &mut Map<String, Value>) -> Result<(), DictModError> {
  apply_mod_with(modification, obj, Mode::Strict)
}

/// Apply a modification document with an explicit [`Mode`].
pub fn apply_mod_with(
  modification: &Map<String, Value>,
  obj: &mut Map<String, Value>,
  mode: Mode,
) -> Result<(), DictModError> {
  for (keyword, settings) in modification {
    let Some(op) = Operator::from_keyword(keyword) else {
      match mode {
        Mode::Strict => return Err(DictModError::UnsupportedOperator(keyword.clone())),
        Mode::Lenient => continue,
      }
    };
    let settings = settings
      .as_object()
      .ok_or_else(|| DictModError::InvalidSettings { op: keyword.clone() })?;
    op.apply(obj, settings)?;
  }
  Ok(())
}

/// Walk `key` down to the mapping that holds its last segment, creating
/// missing intermediate mappings on the way.
fn nested_parent<'a, 'k>(
  obj: &'a mut Map<String, Value>,
  key: &'k str,
) -> Result<(&'a mut Map<String, Value>, &'k str), DictModError> {
  let mut segments: Vec<&str> = key.split(PATH_SEPARATOR).collect();
  let leaf = segments.pop().unwrap_or(key);

  let mut current = obj;
  for segment in segments {
    let next = current
      .entry(segment.to_string())
      .or_insert_with(|| Value::Object(Map::new()));
    current = match next {
      Value::Object(map) => map,
      _ => {
        return Err(DictModError::NotAMapping {
          key: key.to_string(),
          segment: segment.to_string(),
        });
      }
    };
  }
  Ok((current, leaf))
}

fn not_a_list(key: &str) -> DictModError {
  DictModError::NotAList { key: key.to_string() }
}

fn inc(obj: &mut Map<String, Value>, key: &str, delta: &Value) -> Result<(), DictModError> {
  let not_a_number = || DictModError::NotANumber { key: key.to_string() };
  let Value::Number(delta) = delta else {
    return Err(not_a_number());
  };

  let (parent, leaf) = nested_parent(obj, key)?;
  let sum = match parent.get(leaf) {
    None => Number::clone(delta),
    Some(Value::Number(current)) => match (current.as_i64(), delta.as_i64()) {
      (Some(a), Some(b)) => a.checked_add(b).map(Number::from).ok_or_else(not_a_number)?,
      _ => {
        let a = current.as_f64().ok_or_else(not_a_number)?;
        let b = delta.as_f64().ok_or_else(not_a_number)?;
        Number::from_f64(a + b).ok_or_else(not_a_number)?
      }
    },
    Some(_) => return Err(not_a_number()),
  };
  parent.insert(leaf.to_string(), Value::Number(sum));
  Ok(())
}

fn pull(obj: &mut Map<String, Value>, key: &str, value: &Value) -> Result<(), DictModError> {
  let (parent, leaf) = nested_parent(obj, key)?;
  match parent.get_mut(leaf) {
    Some(Value::Array(items)) => {
      items.retain(|item| item != value);
      Ok(())
    }
    Some(_) => Err(not_a_list(key)),
    None => Ok(()),
  }
}

fn pop(obj: &mut Map<String, Value>, key: &str, direction: &Value) -> Result<(), DictModError> {
  let (parent, leaf) = nested_parent(obj, key)?;
  let items = match parent.get_mut(leaf) {
    Some(Value::Array(items)) => items,
    Some(_) => return Err(not_a_list(key)),
    None => return Err(DictModError::MissingKey { key: key.to_string() }),
  };
  if items.is_empty() {
    return Err(DictModError::EmptyList { key: key.to_string() });
  }
  match direction.as_i64() {
    Some(1) => {
      items.pop();
    }
    Some(-1) => {
      items.remove(0);
    }
    _ => {
      return Err(DictModError::InvalidPopDirection {
        key: key.to_string(),
        value: direction.to_string(),
      });
    }
  }
  Ok(())
}
