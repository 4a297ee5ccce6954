use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::query::matches_query;

pub const DEFAULT_FWORKER_NAME: &str = "Automatically generated Worker";

/// Category value that only matches fireworks without a `_category`.
pub const NO_CATEGORY: &str = "__none__";

/// Which firework categories a worker pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Category {
  One(String),
  Many(Vec<String>),
}

impl Default for Category {
  fn default() -> Self {
    Category::One(String::new())
  }
}

/// Identity and capability set of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FWorker {
  #[serde(default = "default_name")]
  pub name: String,
  #[serde(default)]
  pub category: Category,
  /// Query ANDed into every reservation lookup made by this worker.
  #[serde(default)]
  pub query: Map<String, Value>,
  /// Passed to tasks as `_fw_env` in the spec.
  #[serde(default)]
  pub env: Map<String, Value>,
}

fn default_name() -> String {
  DEFAULT_FWORKER_NAME.to_string()
}

impl Default for FWorker {
  fn default() -> Self {
    Self::named(DEFAULT_FWORKER_NAME)
  }
}

impl FWorker {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      category: Category::default(),
      query: Map::new(),
      env: Map::new(),
    }
  }

  pub fn with_category(mut self, category: Category) -> Self {
    self.category = category;
    self
  }

  pub fn with_query(mut self, query: Map<String, Value>) -> Self {
    self.query = query;
    self
  }

  /// The full query for this worker: the user query, `_fworker` pinning and
  /// the category restriction.
  pub fn effective_query(&self) -> Map<String, Value> {
    let mut query = self.query.clone();
    let pinning = json!([
      {"spec->_fworker": {"$exists": false}},
      {"spec->_fworker": null},
      {"spec->_fworker": self.name},
    ]);

    match query.remove("$or") {
      Some(user_or) => {
        let mut and = match query.remove("$and") {
          Some(Value::Array(clauses)) => clauses,
          Some(other) => vec![other],
          None => Vec::new(),
        };
        and.push(json!({"$or": user_or}));
        and.push(json!({"$or": pinning}));
        query.insert("$and".to_string(), Value::Array(and));
      }
      None => {
        query.insert("$or".to_string(), pinning);
      }
    }

    match &self.category {
      Category::One(category) if category == NO_CATEGORY => {
        query.insert("spec->_category".to_string(), json!({"$exists": false}));
      }
      Category::One(category) if !category.is_empty() => {
        query.insert("spec->_category".to_string(), json!(category));
      }
      Category::Many(categories) if !categories.is_empty() => {
        query.insert("spec->_category".to_string(), json!({"$in": categories}));
      }
      _ => {}
    }
    query
  }

  /// Whether this worker may run a firework. `doc` is the firework as a
  /// JSON document (`fw_id`, `name`, `spec`, ...).
  pub fn matches(&self, doc: &Value) -> bool {
    matches_query(&self.effective_query(), doc)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fw(spec: Value) -> Value {
    json!({"fw_id": 1, "name": "fw", "spec": spec})
  }

  #[test]
  fn test_default_worker_matches_unpinned() {
    let worker = FWorker::default();
    assert!(worker.matches(&fw(json!({}))));
    assert!(worker.matches(&fw(json!({"_category": "gpu"}))));
    assert!(!worker.matches(&fw(json!({"_fworker": "other"}))));
  }

  #[test]
  fn test_pinned_to_name() {
    let worker = FWorker::named("alpha");
    assert!(worker.matches(&fw(json!({"_fworker": "alpha"}))));
    assert!(worker.matches(&fw(json!({"_fworker": null}))));
  }

  #[test]
  fn test_category_variants() {
    let gpu = FWorker::named("w").with_category(Category::One("gpu".to_string()));
    assert!(gpu.matches(&fw(json!({"_category": "gpu"}))));
    assert!(!gpu.matches(&fw(json!({}))));

    let none = FWorker::named("w").with_category(Category::One(NO_CATEGORY.to_string()));
    assert!(none.matches(&fw(json!({}))));
    assert!(!none.matches(&fw(json!({"_category": "gpu"}))));

    let many = FWorker::named("w").with_category(Category::Many(vec!["a".into(), "b".into()]));
    assert!(many.matches(&fw(json!({"_category": "b"}))));
    assert!(!many.matches(&fw(json!({"_category": "c"}))));
  }

  #[test]
  fn test_user_or_is_combined_with_pinning() {
    let query = json!({"$or": [{"spec->size": "small"}, {"spec->size": "tiny"}]});
    let worker = FWorker::named("w").with_query(query.as_object().cloned().unwrap());
    assert!(worker.matches(&fw(json!({"size": "tiny"}))));
    assert!(!worker.matches(&fw(json!({"size": "huge"}))));
    assert!(!worker.matches(&fw(json!({"size": "tiny", "_fworker": "x"}))));
  }

  #[test]
  fn test_deserialize_from_yaml() {
    let worker: FWorker = serde_yaml::from_str(
      "name: cluster\ncategory: [gpu, cpu]\nenv:\n  vasp_cmd: mpirun vasp\n",
    )
    .unwrap();
    assert_eq!(worker.name, "cluster");
    assert_eq!(worker.category, Category::Many(vec!["gpu".into(), "cpu".into()]));
    assert_eq!(worker.env["vasp_cmd"], json!("mpirun vasp"));
    assert!(worker.query.is_empty());
  }
}
