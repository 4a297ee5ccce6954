use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use serde_json::{Map, Value, json};
use skyrocket_config::FWorker;
use skyrocket_workflow::{Firework, FwAction, FwId, Launch, LaunchId, Mode, State, Workflow, WorkflowError};

fn fw(id: FwId) -> Firework {
  Firework::new(id, vec![], Map::new()).with_name(format!("fw{id}"))
}

fn spec(value: Value) -> Map<String, Value> {
  value.as_object().cloned().unwrap()
}

fn workflow(ids: &[FwId], links: &[(FwId, Vec<FwId>)]) -> Workflow {
  let mut wf = Workflow::new(
    ids.iter().map(|id| fw(*id)).collect(),
    links.iter().cloned().collect::<BTreeMap<_, _>>(),
    "test",
  )
  .unwrap();
  for root in wf.root_fw_ids() {
    wf.refresh(root, Mode::Strict).unwrap();
  }
  wf
}

fn states(wf: &Workflow) -> Vec<State> {
  wf.fw_states().into_values().collect()
}

/// Check out and finish `fw_id` in one go.
fn run(wf: &mut Workflow, fw_id: FwId, launch_id: LaunchId, action: FwAction, state: State) {
  let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(launch_id);
  let launch = Launch::new(launch_id, fw_id, State::Running, "/tmp", FWorker::default(), "host", "127.0.0.1", now);
  wf.start_launch(fw_id, launch, now, Mode::Strict).unwrap();
  wf.complete_launch(launch_id, Some(action), state, now + Duration::seconds(1), Mode::Strict)
    .unwrap();
}

#[test]
fn test_linear_chain_state_sequence() {
  use State::*;
  let mut wf = workflow(&[1, 2, 3], &[(1, vec![2]), (2, vec![3])]);
  assert_eq!(states(&wf), vec![Ready, Waiting, Waiting]);

  run(&mut wf, 1, 1, FwAction::new().with_stored_data("fw_id", json!(1)), Completed);
  assert_eq!(states(&wf), vec![Completed, Ready, Waiting]);
  run(&mut wf, 2, 2, FwAction::new(), Completed);
  assert_eq!(states(&wf), vec![Completed, Completed, Ready]);
  run(&mut wf, 3, 3, FwAction::new(), Completed);
  assert_eq!(states(&wf), vec![Completed, Completed, Completed]);

  assert_eq!(wf.state(), Completed);
  assert_eq!(wf.launch_ids().len(), 3);
}

#[test]
fn test_start_launch_requires_ready() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  let now = Utc::now();
  let launch = Launch::new(1, 2, State::Running, "", FWorker::default(), "", "", now);
  let err = wf.start_launch(2, launch, now, Mode::Strict).unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { fw_id: 2, from: State::Waiting, .. }));
}

#[test]
fn test_reserved_launch_is_reused() {
  let mut wf = workflow(&[1], &[]);
  let now = Utc::now();
  let reserved = Launch::new(7, 1, State::Reserved, "", FWorker::default(), "", "", now);
  wf.start_launch(1, reserved, now, Mode::Strict).unwrap();
  assert_eq!(wf.firework(1).unwrap().state, State::Reserved);

  let running = Launch::new(8, 1, State::Running, "/run", FWorker::named("w"), "node1", "10.0.0.1", now);
  let (launch_id, _) = wf.start_launch(1, running, now, Mode::Strict).unwrap();
  assert_eq!(launch_id, 7);
  let fw = wf.firework(1).unwrap();
  assert_eq!(fw.state, State::Running);
  assert_eq!(fw.launches.len(), 1);
  assert_eq!(fw.launches[0].host, "node1");
}

#[test]
fn test_cancel_reservation_returns_to_ready() {
  let mut wf = workflow(&[1], &[]);
  let now = Utc::now();
  let reserved = Launch::new(3, 1, State::Reserved, "", FWorker::default(), "", "", now);
  wf.start_launch(1, reserved, now, Mode::Strict).unwrap();
  wf.cancel_reservation(3, now, Mode::Strict).unwrap();
  let fw = wf.firework(1).unwrap();
  assert_eq!(fw.state, State::Ready);
  assert_eq!(fw.launches[0].state, State::Archived);
}

#[test]
fn test_ping_touches_only_running_launches() {
  let mut wf = workflow(&[1, 2], &[]);
  let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
  let later = start + Duration::minutes(5);

  let reserved = Launch::new(1, 1, State::Reserved, "", FWorker::default(), "", "", start);
  wf.start_launch(1, reserved, start, Mode::Strict).unwrap();
  assert!(!wf.ping_launch(1, later, Some(json!({"step": 1}))).unwrap());
  let entry = wf.launch(1).unwrap().state_history.last().unwrap().clone();
  assert_eq!(entry.updated_on, Some(start));
  assert_eq!(entry.checkpoint, None);

  let running = Launch::new(2, 2, State::Running, "", FWorker::default(), "", "", start);
  wf.start_launch(2, running, start, Mode::Strict).unwrap();
  assert!(wf.ping_launch(2, later, Some(json!({"step": 1}))).unwrap());
  let entry = wf.launch(2).unwrap().state_history.last().unwrap().clone();
  assert_eq!(entry.updated_on, Some(later));
  assert_eq!(entry.checkpoint, Some(json!({"step": 1})));

  wf.complete_launch(2, None, State::Completed, later, Mode::Strict).unwrap();
  let done = later + Duration::minutes(5);
  assert!(!wf.ping_launch(2, done, None).unwrap());
  let entry = wf.launch(2).unwrap().state_history.last().unwrap().clone();
  assert_eq!(entry.state, State::Completed);
  assert_eq!(entry.updated_on, None);
}

#[test]
fn test_detour_moves_children_below_leaves() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  let detour = Workflow::new(vec![fw(-1), fw(-2)], BTreeMap::from([(-1, vec![-2])]), "detour").unwrap();
  run(&mut wf, 1, 1, FwAction::new().with_detour(detour), State::Completed);

  assert_eq!(wf.links().children(1), &[-1]);
  assert_eq!(wf.links().children(-1), &[-2]);
  assert_eq!(wf.links().children(-2), &[2]);
  assert_eq!(wf.links().parents(2), &[-2]);
  assert_eq!(wf.firework(-1).unwrap().state, State::Ready);
  assert_eq!(wf.firework(-2).unwrap().state, State::Waiting);
  assert_eq!(wf.firework(2).unwrap().state, State::Waiting);
  skyrocket_workflow::validate(&wf).unwrap();
}

#[test]
fn test_detour_rejected_once_children_started() {
  let mut wf = workflow(&[1, 2, 3], &[(1, vec![2, 3])]);
  run(&mut wf, 1, 1, FwAction::new(), State::Completed);
  let detour = Workflow::from_firework(fw(-1));
  let err = wf.append_wf(detour, &[1], true, false, Mode::Strict).unwrap_err();
  assert!(matches!(err, WorkflowError::DetourOnStartedChildren { fw_id: 1 }));
}

#[test]
fn test_additions_need_placeholder_ids() {
  let mut wf = workflow(&[1], &[]);
  let err = wf
    .append_wf(Workflow::from_firework(fw(5)), &[1], false, false, Mode::Strict)
    .unwrap_err();
  assert!(matches!(err, WorkflowError::PlaceholderIdRequired(5)));

  wf.append_wf(Workflow::from_firework(fw(-1)), &[1], false, false, Mode::Strict)
    .unwrap();
  let err = wf
    .append_wf(Workflow::from_firework(fw(-1)), &[1], false, false, Mode::Strict)
    .unwrap_err();
  assert!(matches!(err, WorkflowError::DuplicateUpdate(ids) if ids == vec![-1]));
}

#[test]
fn test_mod_spec_push_accumulates() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  let action = FwAction::new().with_mod_spec(vec![spec(json!({"_push": {"log": "hello"}}))]);
  run(&mut wf, 1, 1, action.clone(), State::Completed);
  assert_eq!(wf.firework(2).unwrap().spec["log"], json!(["hello"]));

  wf.apply_action(&action, 1, Mode::Strict).unwrap();
  assert_eq!(wf.firework(2).unwrap().spec["log"], json!(["hello", "hello"]));
}

#[test]
fn test_update_spec_propagates_to_descendants() {
  let mut wf = workflow(&[1, 2, 3], &[(1, vec![2]), (2, vec![3])]);
  let mut action = FwAction::new().with_update_spec(spec(json!({"x": 1})));
  wf.apply_action(&action, 1, Mode::Strict).unwrap();
  assert_eq!(wf.firework(2).unwrap().spec["x"], json!(1));
  assert!(!wf.firework(3).unwrap().spec.contains_key("x"));

  action.propagate = true;
  let updated = wf.apply_action(&action, 1, Mode::Strict).unwrap();
  assert_eq!(wf.firework(3).unwrap().spec["x"], json!(1));
  assert_eq!(updated.into_iter().collect::<Vec<_>>(), vec![2, 3]);
}

#[test]
fn test_bad_mod_spec_reports_target() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  let action = FwAction::new().with_mod_spec(vec![spec(json!({"_frobnicate": {"x": 1}}))]);
  let err = wf.apply_action(&action, 1, Mode::Strict).unwrap_err();
  assert!(matches!(err, WorkflowError::ModSpec { fw_id: 2, .. }));
  wf.apply_action(&action, 1, Mode::Lenient).unwrap();
}

#[test]
fn test_defuse_children_and_workflow() {
  let mut wf = workflow(&[1, 2, 3, 4], &[(1, vec![2, 3]), (3, vec![4])]);
  run(
    &mut wf,
    1,
    1,
    FwAction {
      defuse_children: true,
      ..FwAction::default()
    },
    State::Completed,
  );
  assert_eq!(wf.firework(2).unwrap().state, State::Defused);
  assert_eq!(wf.firework(3).unwrap().state, State::Defused);
  assert_eq!(wf.firework(4).unwrap().state, State::Waiting);
  assert_eq!(wf.state(), State::Defused);

  let mut wf = workflow(&[1, 2, 3], &[(1, vec![2, 3])]);
  run(
    &mut wf,
    1,
    1,
    FwAction {
      defuse_workflow: true,
      ..FwAction::default()
    },
    State::Completed,
  );
  assert_eq!(states(&wf), vec![State::Completed, State::Defused, State::Defused]);
}

#[test]
fn test_fizzle_then_rerun() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  let failure = FwAction::new().with_stored_data("_exception", json!({"_stacktrace": "boom", "_details": null}));
  run(&mut wf, 1, 1, failure, State::Fizzled);
  assert_eq!(wf.firework(1).unwrap().state, State::Fizzled);
  assert_eq!(wf.state(), State::Fizzled);

  wf.rerun_fw(1, Mode::Strict).unwrap();
  let fw = wf.firework(1).unwrap();
  assert_eq!(fw.state, State::Ready);
  assert!(fw.launches.is_empty());
  assert_eq!(fw.archived_launches.len(), 1);

  run(&mut wf, 1, 2, FwAction::new(), State::Completed);
  assert_eq!(wf.firework(2).unwrap().state, State::Ready);
}

#[test]
fn test_rerun_resets_started_descendants() {
  let mut wf = workflow(&[1, 2, 3], &[(1, vec![2]), (2, vec![3])]);
  run(&mut wf, 1, 1, FwAction::new(), State::Completed);
  run(&mut wf, 2, 2, FwAction::new(), State::Completed);

  let updated = wf.rerun_fw(1, Mode::Strict).unwrap();
  assert_eq!(states(&wf), vec![State::Ready, State::Waiting, State::Waiting]);
  assert!(updated.contains(&3));
  assert_eq!(wf.firework(2).unwrap().archived_launches.len(), 1);
}

#[test]
fn test_fizzled_parent_allowed() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  wf.firework_mut(2)
    .unwrap()
    .spec
    .insert("_allow_fizzled_parents".into(), json!(true));
  run(&mut wf, 1, 1, FwAction::new(), State::Fizzled);

  let child = wf.firework(2).unwrap();
  assert_eq!(child.state, State::Ready);
  assert_eq!(child.spec["_fizzled_parents"][0]["fw_id"], json!(1));
  assert_eq!(wf.state(), State::Running);
}

#[test]
fn test_pull_spec_mods_into_new_roots() {
  let mut wf = workflow(&[1], &[]);
  let action = FwAction::new()
    .with_update_spec(spec(json!({"a": 1})))
    .with_mod_spec(vec![spec(json!({"_inc": {"n": 2}}))]);
  run(&mut wf, 1, 1, action, State::Completed);

  wf.append_wf(Workflow::from_firework(fw(-1)), &[1], false, true, Mode::Strict)
    .unwrap();
  let added = wf.firework(-1).unwrap();
  assert_eq!(added.spec["a"], json!(1));
  assert_eq!(added.spec["n"], json!(2));
  assert_eq!(added.state, State::Ready);
}

#[test]
fn test_admin_transitions() {
  let mut wf = workflow(&[1, 2], &[(1, vec![2])]);
  wf.pause_fw(1).unwrap();
  assert_eq!(wf.state(), State::Paused);
  wf.reignite_fw(1, Mode::Strict).unwrap();
  assert_eq!(wf.firework(1).unwrap().state, State::Ready);

  run(&mut wf, 1, 1, FwAction::new(), State::Completed);
  assert!(wf.pause_fw(1).is_err());
  wf.defuse_fw(1, Mode::Strict).unwrap();
  assert_eq!(states(&wf), vec![State::Defused, State::Waiting]);

  wf.reignite_all(Mode::Strict).unwrap();
  assert_eq!(states(&wf), vec![State::Ready, State::Waiting]);

  wf.pause_all().unwrap();
  assert_eq!(states(&wf), vec![State::Paused, State::Paused]);
  wf.reignite_all(Mode::Strict).unwrap();
  wf.defuse_all(Mode::Strict).unwrap();
  assert_eq!(wf.state(), State::Defused);

  wf.archive(Mode::Strict).unwrap();
  assert_eq!(wf.state(), State::Archived);
}
