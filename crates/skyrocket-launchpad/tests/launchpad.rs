use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use skyrocket_config::{Category, FWorker, LaunchPadConfig};
use skyrocket_launchpad::{LaunchPad, LaunchPadClient, LaunchPadError, ManualClock};
use skyrocket_store::{MemoryStore, SqliteStore};
use skyrocket_workflow::{Firework, FwAction, FwId, State, Workflow, WorkflowError};
use sqlx::sqlite::SqlitePoolOptions;

fn spec(value: Value) -> Map<String, Value> {
  value.as_object().cloned().unwrap()
}

fn fw(id: FwId, spec: Map<String, Value>) -> Firework {
  Firework::new(id, vec![], spec).with_name(format!("fw{id}"))
}

fn chain(n: FwId) -> Workflow {
  let fws = (1..=n).map(|id| fw(-id, Map::new())).collect();
  let links = (1..n).map(|id| (-id, vec![-id - 1])).collect::<BTreeMap<_, _>>();
  Workflow::new(fws, links, "chain").unwrap()
}

fn launchpad() -> LaunchPad {
  LaunchPad::new(Arc::new(MemoryStore::new()), LaunchPadConfig::in_memory())
}

fn launchpad_with_clock() -> (LaunchPad, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::new(Utc::now()));
  let mut config = LaunchPadConfig::in_memory();
  config.timings.ping_interval_secs = 1;
  config.timings.run_expiration_secs = Some(4);
  config.timings.reservation_expiration_secs = 60;
  let lp = LaunchPad::new(Arc::new(MemoryStore::new()), config).with_clock(clock.clone());
  (lp, clock)
}

async fn checkout(lp: &LaunchPad) -> Option<(Firework, i64)> {
  lp.checkout_fw(&FWorker::default(), "host", "127.0.0.1", "/tmp", None)
    .await
    .unwrap()
}

async fn states(lp: &LaunchPad, fw_id: FwId) -> Vec<State> {
  lp.get_wf_by_fw_id(fw_id).await.unwrap().fw_states().into_values().collect()
}

#[tokio::test]
async fn test_add_wf_assigns_ids_and_states() {
  let lp = launchpad();
  let old_new = lp.add_wf(chain(3)).await.unwrap();
  assert_eq!(old_new, BTreeMap::from([(-3, 1), (-2, 2), (-1, 3)]));

  let wf = lp.get_wf_by_fw_id(3).await.unwrap();
  assert_eq!(wf.links().children(3), &[2]);
  assert_eq!(wf.firework(3).unwrap().state, State::Ready);
  assert_eq!(lp.get_fw_ids(&[State::Ready]).await.unwrap(), vec![3]);

  // Re-submitting the same document creates a second workflow.
  lp.add_wf(chain(3)).await.unwrap();
  assert_eq!(lp.get_wf_ids().await.unwrap().len(), 2);
  assert_eq!(lp.get_fw_ids(&[]).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_add_wf_rejects_invalid_dataflow() {
  let lp = launchpad();
  let task = |outputs: Value, inputs: Value| {
    skyrocket_workflow::TaskDef::new("StoreDataTask", spec(json!({"inputs": inputs, "outputs": outputs})))
  };
  let fws = vec![
    Firework::new(-1, vec![task(json!(["x"]), json!([]))], Map::new()),
    Firework::new(-2, vec![task(json!(["y"]), json!(["x"]))], Map::new()),
    Firework::new(-3, vec![task(json!(["y"]), json!(["x"]))], Map::new()),
    Firework::new(-4, vec![task(json!([]), json!(["y"]))], Map::new()),
  ];
  let links = BTreeMap::from([(-1, vec![-2, -3]), (-2, vec![-4]), (-3, vec![-4])]);
  let err = lp.add_wf(Workflow::new(fws, links, "diamond").unwrap()).await.unwrap_err();
  assert_eq!(err.to_string(), "Every input must have exactly one source (entity: y)");
  assert!(lp.get_wf_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_linear_chain_runs_in_order() {
  use State::*;
  let lp = launchpad();
  lp.add_wf(chain(3)).await.unwrap();
  assert_eq!(states(&lp, 1).await, vec![Waiting, Waiting, Ready]);

  for (expected, fw_id) in [(vec![Waiting, Ready, Completed], 3), (vec![Ready, Completed, Completed], 2)] {
    let (fw, launch_id) = checkout(&lp).await.unwrap();
    assert_eq!(fw.fw_id, fw_id);
    let action = FwAction::new().with_stored_data("fw_id", json!(fw.fw_id));
    lp.complete_launch(launch_id, Some(action), Completed).await.unwrap();
    assert_eq!(states(&lp, 1).await, expected);
  }
  let (_, launch_id) = checkout(&lp).await.unwrap();
  lp.complete_launch(launch_id, None, Completed).await.unwrap();
  assert_eq!(states(&lp, 1).await, vec![Completed, Completed, Completed]);
  assert!(checkout(&lp).await.is_none());

  let wf = lp.get_wf_by_fw_id(1).await.unwrap();
  assert_eq!(wf.state(), Completed);
  assert_eq!(wf.launch_ids().len(), 3);
  let launch = lp.get_launch_by_id(1).await.unwrap();
  assert_eq!(launch.action.unwrap().stored_data["fw_id"], json!(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_checkout_hands_out_each_firework_once() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}?mode=rwc", dir.path().join("launchpad.db").display());
  let store = SqliteStore::connect(&url).await.unwrap();
  let lp = LaunchPad::new(Arc::new(store), LaunchPadConfig::default());

  let children = 16;
  let workers = 20;
  for round in 0..3 {
    let fws = (1..=children + 1).map(|id| fw(-id, Map::new())).collect();
    let links = BTreeMap::from([(-1, (2..=children + 1).map(|id| -id).collect::<Vec<_>>())]);
    let old_new = lp.add_wf(Workflow::new(fws, links, format!("fan{round}")).unwrap()).await.unwrap();
    let root = old_new[&-1];
    let (fw, launch_id) = checkout(&lp).await.unwrap();
    assert_eq!(fw.fw_id, root);
    lp.complete_launch(launch_id, None, State::Completed).await.unwrap();

    let handles: Vec<_> = (0..workers)
      .map(|i| {
        let lp = lp.clone();
        tokio::spawn(async move {
          let worker = FWorker::named(format!("w{i}"));
          let claimed = lp.checkout_fw(&worker, "host", "ip", "/tmp", None).await.unwrap();
          if let Some((fw, launch_id)) = &claimed {
            lp.ping_launch(*launch_id, None).await.unwrap();
            lp.complete_launch(*launch_id, None, State::Completed).await.unwrap();
            Some(fw.fw_id)
          } else {
            None
          }
        })
      })
      .collect();

    let mut claimed = Vec::new();
    for handle in handles {
      if let Some(fw_id) = handle.await.unwrap() {
        claimed.push(fw_id);
      }
    }
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), children as usize);
    assert!(!claimed.contains(&root));

    let wf = lp.get_wf_by_fw_id(root).await.unwrap();
    assert_eq!(wf.state(), State::Completed);
    for fw in wf.fireworks() {
      assert_eq!(fw.launches.len(), 1);
      assert_eq!(fw.launches[0].state, State::Completed);
    }
  }
  assert!(lp.get_fw_ids(&[State::Running, State::Ready]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fizzle_and_rerun() {
  let lp = launchpad();
  let fw_id = lp.add_fw(fw(-1, Map::new())).await.unwrap();

  let (_, first) = checkout(&lp).await.unwrap();
  let failure = FwAction::new().with_stored_data(
    "_exception",
    json!({"_stacktrace": "RuntimeError: boom", "_details": null}),
  );
  lp.complete_launch(first, Some(failure), State::Fizzled).await.unwrap();
  let launch = lp.get_launch_by_id(first).await.unwrap();
  assert_eq!(launch.state, State::Fizzled);
  let trace = launch.action.unwrap().stored_data["_exception"]["_stacktrace"].clone();
  assert!(trace.as_str().unwrap().contains("boom"));

  lp.rerun_fw(fw_id).await.unwrap();
  let fw = lp.get_fw_by_id(fw_id).await.unwrap();
  assert_eq!(fw.state, State::Ready);
  assert_eq!(fw.archived_launches.len(), 1);
  // Archived launches stay reachable.
  assert_eq!(lp.get_launch_by_id(first).await.unwrap().launch_id, first);

  let (_, second) = checkout(&lp).await.unwrap();
  assert_ne!(first, second);
  lp.complete_launch(second, None, State::Completed).await.unwrap();
  assert_eq!(lp.get_fw_by_id(fw_id).await.unwrap().state, State::Completed);
}

#[tokio::test]
async fn test_lost_run_is_fizzled_and_rerun() {
  let (lp, clock) = launchpad_with_clock();
  let fw_id = lp.add_fw(fw(-1, Map::new())).await.unwrap();
  let (_, launch_id) = checkout(&lp).await.unwrap();

  clock.advance(chrono::Duration::seconds(3));
  assert!(lp.detect_lostruns(None, false, false).await.unwrap().launch_ids.is_empty());

  clock.advance(chrono::Duration::seconds(2));
  let lost = lp.detect_lostruns(None, true, false).await.unwrap();
  assert_eq!(lost.launch_ids, vec![launch_id]);
  assert_eq!(lost.fw_ids, vec![fw_id]);
  assert_eq!(lp.get_fw_by_id(fw_id).await.unwrap().state, State::Fizzled);

  lp.rerun_fw(fw_id).await.unwrap();
  let (_, again) = checkout(&lp).await.unwrap();
  lp.complete_launch(again, None, State::Completed).await.unwrap();
  assert_eq!(lp.get_fw_by_id(fw_id).await.unwrap().state, State::Completed);
}

#[tokio::test]
async fn test_ping_keeps_run_alive() {
  let (lp, clock) = launchpad_with_clock();
  lp.add_fw(fw(-1, Map::new())).await.unwrap();
  let (_, launch_id) = checkout(&lp).await.unwrap();

  clock.advance(chrono::Duration::seconds(3));
  lp.ping_launch(launch_id, Some(json!({"step": 2}))).await.unwrap();
  clock.advance(chrono::Duration::seconds(3));
  assert!(lp.detect_lostruns(None, true, false).await.unwrap().launch_ids.is_empty());

  let launch = lp.get_launch_by_id(launch_id).await.unwrap();
  assert_eq!(launch.state_history.last().unwrap().checkpoint, Some(json!({"step": 2})));
}

#[tokio::test]
async fn test_ping_after_completion_is_ignored() {
  let (lp, clock) = launchpad_with_clock();
  lp.add_fw(fw(-1, Map::new())).await.unwrap();
  let (_, launch_id) = checkout(&lp).await.unwrap();
  lp.complete_launch(launch_id, None, State::Completed).await.unwrap();
  let before = lp.get_launch_by_id(launch_id).await.unwrap();

  clock.advance(chrono::Duration::seconds(30));
  lp.ping_launch(launch_id, Some(json!({"late": true}))).await.unwrap();
  assert_eq!(lp.get_launch_by_id(launch_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_failed_action_fizzles_launch() {
  let lp = launchpad();
  let mut wf = chain(2);
  wf.firework_mut(-2).unwrap().spec.insert("log".into(), json!("not a list"));
  lp.add_wf(wf).await.unwrap();

  let (_, launch_id) = checkout(&lp).await.unwrap();
  let action = FwAction::new().with_mod_spec(vec![spec(json!({"_pop": {"log": 1}}))]);
  lp.complete_launch(launch_id, Some(action), State::Completed).await.unwrap();

  let launch = lp.get_launch_by_id(launch_id).await.unwrap();
  assert_eq!(launch.state, State::Fizzled);
  let exception = &launch.action.unwrap().stored_data["_exception"];
  assert!(exception["_stacktrace"].as_str().unwrap().contains("mod_spec"));
  // Ids follow placeholder order: the child -2 became 1.
  let child = lp.get_fw_by_id(1).await.unwrap();
  assert_eq!(child.spec["log"], json!("not a list"));
  assert_eq!(child.state, State::Waiting);
}

#[tokio::test]
async fn test_repeated_completion_is_ignored() {
  let lp = launchpad();
  lp.add_wf(chain(2)).await.unwrap();
  let (_, launch_id) = checkout(&lp).await.unwrap();
  let action = FwAction::new().with_mod_spec(vec![spec(json!({"_push": {"log": "hello"}}))]);
  lp.complete_launch(launch_id, Some(action.clone()), State::Completed).await.unwrap();
  lp.complete_launch(launch_id, Some(action), State::Completed).await.unwrap();
  assert_eq!(lp.get_fw_by_id(1).await.unwrap().spec["log"], json!(["hello"]));
}

#[tokio::test]
async fn test_additions_get_permanent_ids() {
  let lp = launchpad();
  let fw_id = lp.add_fw(fw(-1, Map::new())).await.unwrap();
  let (_, launch_id) = checkout(&lp).await.unwrap();
  let addition = Workflow::from_firework(fw(-1, spec(json!({"extra": true}))));
  lp.complete_launch(launch_id, Some(FwAction::new().with_addition(addition)), State::Completed)
    .await
    .unwrap();

  let wf = lp.get_wf_by_fw_id(fw_id).await.unwrap();
  assert!(wf.placeholder_ids().is_empty());
  let child = wf.links().children(fw_id)[0];
  assert!(child > fw_id);
  assert_eq!(lp.get_fw_by_id(child).await.unwrap().state, State::Ready);

  let detour = Workflow::from_firework(fw(-7, Map::new()));
  lp.append_wf(detour, &[child], false, false).await.unwrap();
  assert_eq!(lp.get_fw_ids(&[]).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_reservation_lifecycle() {
  let (lp, clock) = launchpad_with_clock();
  let fw_id = lp.add_fw(fw(-1, Map::new())).await.unwrap();

  let (fw, launch_id) = lp
    .reserve_fw(&FWorker::default(), "host", "ip", "/queue")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(fw.state, State::Reserved);
  lp.set_reservation_id(launch_id, "job-42").await.unwrap();
  assert_eq!(
    lp.get_reservation_id_from_fw_id(fw_id).await.unwrap().as_deref(),
    Some("job-42")
  );
  assert!(checkout(&lp).await.is_none());

  clock.advance(chrono::Duration::seconds(61));
  let stale = lp.detect_unreserved(None, true).await.unwrap();
  assert_eq!(stale, vec![launch_id]);
  assert_eq!(lp.get_fw_by_id(fw_id).await.unwrap().state, State::Ready);

  // A queue job picks up its own reservation by id.
  let (_, reserved) = lp
    .reserve_fw(&FWorker::default(), "host", "ip", "/queue")
    .await
    .unwrap()
    .unwrap();
  let (_, running) = lp
    .checkout_fw(&FWorker::default(), "node", "ip", "/run", Some(fw_id))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reserved, running);
  let launch = lp.get_launch_by_id(running).await.unwrap();
  assert_eq!(launch.state, State::Running);
  assert_eq!(launch.host, "node");
}

#[tokio::test]
async fn test_worker_matching_and_priority() {
  let lp = launchpad();
  lp.add_fw(fw(-1, spec(json!({"_category": "gpu"})))).await.unwrap();
  lp.add_fw(fw(-1, spec(json!({"_priority": 10})))).await.unwrap();
  lp.add_fw(fw(-1, spec(json!({"_fworker": "special"})))).await.unwrap();

  let cpu = FWorker::named("cpu").with_category(Category::One("__none__".into()));
  let (first, _) = lp.checkout_fw(&cpu, "h", "i", "/", None).await.unwrap().unwrap();
  assert_eq!(first.fw_id, 2);
  assert!(lp.checkout_fw(&cpu, "h", "i", "/", None).await.unwrap().is_none());
  assert!(lp.run_exists(&FWorker::named("special")).await.unwrap());

  let gpu = FWorker::named("gpu").with_category(Category::One("gpu".into()));
  let (next, _) = lp.checkout_fw(&gpu, "h", "i", "/", None).await.unwrap().unwrap();
  assert_eq!(next.fw_id, 1);
  let (last, _) = lp
    .checkout_fw(&FWorker::named("special"), "h", "i", "/", None)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(last.fw_id, 3);
}

#[tokio::test]
async fn test_future_run_exists() {
  let lp = launchpad();
  let worker = FWorker::default();
  lp.add_wf(chain(2)).await.unwrap();

  let (_, launch_id) = checkout(&lp).await.unwrap();
  assert!(!lp.run_exists(&worker).await.unwrap());
  assert!(lp.future_run_exists(&worker).await.unwrap());

  lp.complete_launch(launch_id, None, State::Fizzled).await.unwrap();
  assert!(!lp.future_run_exists(&worker).await.unwrap());
}

#[tokio::test]
async fn test_admin_operations() {
  let lp = launchpad();
  lp.add_wf(chain(2)).await.unwrap();

  lp.pause_fw(2).await.unwrap();
  assert!(checkout(&lp).await.is_none());
  lp.reignite_fw(2).await.unwrap();

  lp.defuse_wf(2).await.unwrap();
  assert_eq!(lp.get_wf_by_fw_id(2).await.unwrap().state(), State::Defused);
  let err = lp.rerun_fw(2).await.unwrap_err();
  assert!(matches!(
    err,
    LaunchPadError::Workflow(WorkflowError::InvalidTransition { from: State::Defused, .. })
  ));
  lp.reignite_wf(2).await.unwrap();
  assert_eq!(states(&lp, 2).await, vec![State::Waiting, State::Ready]);

  lp.update_spec(&[1, 2], &spec(json!({"note": "edited"}))).await.unwrap();
  assert_eq!(lp.get_fw_by_id(1).await.unwrap().spec["note"], json!("edited"));

  lp.archive_wf(1).await.unwrap();
  assert_eq!(lp.get_wf_by_fw_id(1).await.unwrap().state(), State::Archived);
  assert!(lp.pause_fw(1).await.is_err());
}

#[tokio::test]
async fn test_reset_requires_password() {
  let lp = launchpad();
  lp.add_wf(chain(1)).await.unwrap();
  assert!(matches!(
    lp.reset(Some("nope"), true).await,
    Err(LaunchPadError::ResetRefused(_))
  ));
  let today = Utc::now().format("%Y-%m-%d").to_string();
  lp.reset(Some(&today), true).await.unwrap();
  assert!(lp.get_wf_ids().await.unwrap().is_empty());

  lp.add_wf(chain(1)).await.unwrap();
  lp.reset(None, false).await.unwrap();
  assert!(lp.get_wf_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_maintain_stops_on_cancel() {
  let lp = launchpad();
  let cancel = tokio_util::sync::CancellationToken::new();
  let handle = tokio::spawn({
    let lp = lp.clone();
    let cancel = cancel.clone();
    async move { lp.maintain(cancel).await }
  });
  cancel.cancel();
  tokio::time::timeout(Duration::from_secs(5), handle)
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_sqlite_backend_chain() {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .unwrap();
  let store = SqliteStore::new(pool);
  store.migrate().await.unwrap();
  let lp = LaunchPad::new(Arc::new(store), LaunchPadConfig::default());

  lp.add_wf(chain(2)).await.unwrap();
  for _ in 0..2 {
    let (_, launch_id) = checkout(&lp).await.unwrap();
    lp.complete_launch(launch_id, None, State::Completed).await.unwrap();
  }
  assert_eq!(lp.get_wf_by_fw_id(1).await.unwrap().state(), State::Completed);
}
