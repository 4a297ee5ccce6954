use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, json};
use skyrocket_config::FWorker;
use skyrocket_store::{MemoryStore, SqliteStore, Store, StoreError};
use skyrocket_workflow::{Firework, Launch, Mode, State, Workflow};
use sqlx::sqlite::SqlitePoolOptions;

async fn sqlite() -> SqliteStore {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .unwrap();
  let store = SqliteStore::new(pool);
  store.migrate().await.unwrap();
  store
}

fn fw(id: i64, priority: Option<f64>) -> Firework {
  let mut spec = Map::new();
  if let Some(priority) = priority {
    spec.insert("_priority".into(), json!(priority));
  }
  Firework::new(id, vec![], spec).with_name(format!("fw{id}"))
}

fn chain(ids: [i64; 3]) -> Workflow {
  let mut wf = Workflow::new(
    vec![fw(ids[0], None), fw(ids[1], Some(5.0)), fw(ids[2], None)],
    BTreeMap::from([(ids[0], vec![ids[1]]), (ids[1], vec![ids[2]])]),
    "chain",
  )
  .unwrap();
  wf.refresh(ids[0], Mode::Strict).unwrap();
  wf
}

async fn exercise(store: &dyn Store) {
  let wf = chain([1, 2, 3]);
  store.insert_workflow(&wf).await.unwrap();
  assert!(matches!(
    store.insert_workflow(&wf).await,
    Err(StoreError::AlreadyExists(_))
  ));

  let stored = store.get_workflow(&wf.wf_id).await.unwrap();
  assert_eq!(stored.version, 1);
  assert_eq!(stored.workflow.fw_states(), wf.fw_states());
  assert_eq!(store.wf_id_for_fw(2).await.unwrap(), wf.wf_id);
  assert!(matches!(store.wf_id_for_fw(99).await, Err(StoreError::NotFound(_))));

  let ready = store.find_fireworks(&[State::Ready]).await.unwrap();
  assert_eq!(ready.iter().map(|r| r.fw_id).collect::<Vec<_>>(), vec![1]);

  // A committed launch becomes visible in the launch index.
  let mut next = stored.workflow.clone();
  let launch = Launch::new(10, 1, State::Running, "/tmp", FWorker::default(), "h", "i", Utc::now());
  next.start_launch(1, launch, Utc::now(), Mode::Strict).unwrap();
  assert_eq!(store.commit_workflow(&next, 1).await.unwrap(), 2);
  assert_eq!(store.wf_id_for_launch(10).await.unwrap(), wf.wf_id);
  let running = store.find_launches(&[State::Running]).await.unwrap();
  assert_eq!(running.len(), 1);
  assert_eq!(running[0].fw_id, 1);

  // A stale writer loses.
  let err = store.commit_workflow(&stored.workflow, 1).await.unwrap_err();
  assert!(matches!(err, StoreError::ConcurrentConflict { expected: 1, .. }));
  assert_eq!(store.get_workflow(&wf.wf_id).await.unwrap().version, 2);

  // Dispatch order: priority first, then the smaller id.
  let mut other = chain([4, 5, 6]);
  for id in [5, 6] {
    other.firework_mut(id).unwrap().state = State::Ready;
  }
  store.insert_workflow(&other).await.unwrap();
  let ready = store.find_fireworks(&[State::Ready]).await.unwrap();
  assert_eq!(ready.iter().map(|r| r.fw_id).collect::<Vec<_>>(), vec![5, 4, 6]);
  assert_eq!(ready[0].query_document()["spec"]["_priority"], json!(5.0));
  assert_eq!(store.find_fireworks(&[]).await.unwrap().len(), 6);
  assert_eq!(store.wf_ids().await.unwrap(), vec![wf.wf_id.clone(), other.wf_id.clone()]);

  assert_eq!(store.allocate_fw_ids(3).await.unwrap(), vec![1, 2, 3]);
  assert_eq!(store.allocate_fw_ids(1).await.unwrap(), vec![4]);
  assert_eq!(store.allocate_launch_id().await.unwrap(), 1);
  assert_eq!(store.allocate_launch_id().await.unwrap(), 2);

  store.reset().await.unwrap();
  assert!(store.wf_ids().await.unwrap().is_empty());
  assert!(store.find_launches(&[]).await.unwrap().is_empty());
  assert_eq!(store.allocate_launch_id().await.unwrap(), 1);
}

#[tokio::test]
async fn test_memory_store() {
  exercise(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_store() {
  exercise(&sqlite().await).await;
}

#[tokio::test]
async fn test_sqlite_document_round_trip() {
  let store = sqlite().await;
  let mut wf = chain([1, 2, 3]);
  wf.metadata.insert("project".into(), json!("demo"));
  store.insert_workflow(&wf).await.unwrap();
  let stored = store.get_workflow(&wf.wf_id).await.unwrap();
  assert_eq!(stored.workflow, wf);
}
