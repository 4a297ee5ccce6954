//! Structural and dataflow checks over a workflow graph.
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. every edge endpoint is a firework of the workflow
//! 2. the graph has no cycles
//! 3. the graph is weakly connected
//! 4. firework ids are unique
//! 5. task outputs are unique per firework and every declared input has
//!    exactly one source

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{Firework, FwId, State, Workflow, WorkflowError};

pub const ERR_UNKNOWN_ENDPOINT: &str = "Every link must connect fireworks of the workflow";
pub const ERR_CYCLE: &str = "The workflow graph must be a DAG";
pub const ERR_DISCONNECTED: &str = "The workflow graph must be connected";
pub const ERR_DUPLICATE_ID: &str = "Workflow steps must have unique IDs";
pub const ERR_DUPLICATE_OUTPUT: &str = "Several tasks may not use the same name in outputs list";
pub const ERR_INPUT_SOURCES: &str = "Every input must have exactly one source";

/// Validate a workflow.
pub fn validate(wf: &Workflow) -> Result<(), WorkflowError> {
  let fws: Vec<&Firework> = wf.fireworks().collect();
  validate_parts(&fws, wf.links().as_map())
}

/// Validate raw parts, before they are assembled into a [`Workflow`].
pub fn validate_parts(fws: &[&Firework], links: &BTreeMap<FwId, Vec<FwId>>) -> Result<(), WorkflowError> {
  let ids: BTreeSet<FwId> = fws.iter().map(|fw| fw.fw_id).collect();

  check_endpoints(&ids, links)?;
  check_acyclic(&ids, links)?;
  check_connected(&ids, links)?;
  check_unique_ids(fws)?;
  check_dataflow(fws, links)
}

fn check_endpoints(ids: &BTreeSet<FwId>, links: &BTreeMap<FwId, Vec<FwId>>) -> Result<(), WorkflowError> {
  for (parent, children) in links {
    for id in std::iter::once(parent).chain(children) {
      if !ids.contains(id) {
        return Err(WorkflowError::validation(ERR_UNKNOWN_ENDPOINT, id));
      }
    }
  }
  Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
  White,
  Gray,
  Black,
}

/// Depth-first search with an explicit stack, so depth is bounded by the
/// heap rather than the thread stack.
fn check_acyclic(ids: &BTreeSet<FwId>, links: &BTreeMap<FwId, Vec<FwId>>) -> Result<(), WorkflowError> {
  let mut color: HashMap<FwId, Color> = ids.iter().map(|id| (*id, Color::White)).collect();

  for &root in ids {
    if color.get(&root) != Some(&Color::White) {
      continue;
    }
    color.insert(root, Color::Gray);
    // Each frame is a node and the index of its next child.
    let mut stack = vec![(root, 0usize)];
    while let Some(frame) = stack.last_mut() {
      let (node, next) = *frame;
      let Some(&child) = links.get(&node).and_then(|children| children.get(next)) else {
        color.insert(node, Color::Black);
        stack.pop();
        continue;
      };
      frame.1 += 1;
      match color.get(&child) {
        Some(Color::Gray) => return Err(WorkflowError::validation(ERR_CYCLE, child)),
        Some(Color::White) => {
          color.insert(child, Color::Gray);
          stack.push((child, 0));
        }
        _ => {}
      }
    }
  }
  Ok(())
}

fn check_connected(ids: &BTreeSet<FwId>, links: &BTreeMap<FwId, Vec<FwId>>) -> Result<(), WorkflowError> {
  let Some(&start) = ids.iter().next() else {
    return Ok(());
  };

  let mut undirected: HashMap<FwId, Vec<FwId>> = HashMap::new();
  for (parent, children) in links {
    for child in children {
      undirected.entry(*parent).or_default().push(*child);
      undirected.entry(*child).or_default().push(*parent);
    }
  }

  let mut seen = BTreeSet::from([start]);
  let mut stack = vec![start];
  while let Some(node) = stack.pop() {
    for next in undirected.get(&node).into_iter().flatten() {
      if seen.insert(*next) {
        stack.push(*next);
      }
    }
  }

  match ids.iter().find(|id| !seen.contains(*id)) {
    Some(unreached) => Err(WorkflowError::validation(ERR_DISCONNECTED, unreached)),
    None => Ok(()),
  }
}

fn check_unique_ids(fws: &[&Firework]) -> Result<(), WorkflowError> {
  let mut seen = BTreeSet::new();
  for fw in fws {
    if !seen.insert(fw.fw_id) {
      return Err(WorkflowError::validation(ERR_DUPLICATE_ID, fw.fw_id));
    }
  }
  Ok(())
}

fn check_dataflow(fws: &[&Firework], links: &BTreeMap<FwId, Vec<FwId>>) -> Result<(), WorkflowError> {
  let by_id: HashMap<FwId, &Firework> = fws.iter().map(|fw| (fw.fw_id, *fw)).collect();

  let mut outputs: HashMap<FwId, Vec<String>> = HashMap::new();
  for fw in fws {
    let mut declared = Vec::new();
    for task in fw.tasks()? {
      for output in task.outputs(fw.fw_id)? {
        if declared.contains(&output) {
          return Err(WorkflowError::validation(ERR_DUPLICATE_OUTPUT, output));
        }
        declared.push(output);
      }
    }
    outputs.insert(fw.fw_id, declared);
  }

  let mut parents: HashMap<FwId, Vec<FwId>> = HashMap::new();
  for (parent, children) in links {
    for child in children {
      parents.entry(*child).or_default().push(*parent);
    }
  }

  for fw in fws {
    let fw_parents = parents.get(&fw.fw_id).map(Vec::as_slice).unwrap_or(&[]);
    // Outputs of completed parents have already been delivered into the spec.
    let delivered: BTreeSet<&str> = fw_parents
      .iter()
      .filter(|p| by_id.get(*p).is_some_and(|pfw| pfw.state == State::Completed))
      .flat_map(|p| outputs.get(p).into_iter().flatten().map(String::as_str))
      .collect();

    let mut produced_here: BTreeSet<String> = BTreeSet::new();
    for task in fw.tasks()? {
      for input in task.inputs(fw.fw_id)? {
        let mut sources: BTreeSet<FwId> = fw_parents
          .iter()
          .copied()
          .filter(|p| outputs.get(p).is_some_and(|out| out.contains(&input)))
          .collect();
        let in_spec = fw.spec.contains_key(&input) && !delivered.contains(input.as_str());
        if in_spec || produced_here.contains(&input) {
          sources.insert(fw.fw_id);
        }
        if sources.len() != 1 {
          return Err(WorkflowError::validation(ERR_INPUT_SOURCES, input));
        }
      }
      produced_here.extend(task.outputs(fw.fw_id)?);
    }
  }
  Ok(())
}
