use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::FwId;

/// Parent/child adjacency tables keyed by firework id.
///
/// Every node has an entry in both tables, possibly empty. The parent table
/// is always the transpose of the child table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
  /// Adjacency list: fw_id -> downstream fw_ids.
  children: BTreeMap<FwId, Vec<FwId>>,
  /// Reverse adjacency: fw_id -> upstream fw_ids.
  parents: BTreeMap<FwId, Vec<FwId>>,
}

impl Links {
  /// Build from a child adjacency mapping. Ids that appear only as children
  /// become nodes too.
  pub fn new(children: BTreeMap<FwId, Vec<FwId>>) -> Self {
    let mut links = Self::default();
    for (parent, kids) in children {
      links.add_node(parent);
      for child in kids {
        links.add_edge(parent, child);
      }
    }
    links
  }

  pub fn add_node(&mut self, fw_id: FwId) {
    self.children.entry(fw_id).or_default();
    self.parents.entry(fw_id).or_default();
  }

  /// Add an edge; duplicate edges are ignored.
  pub fn add_edge(&mut self, parent: FwId, child: FwId) {
    self.add_node(parent);
    self.add_node(child);
    let kids = self.children.entry(parent).or_default();
    if !kids.contains(&child) {
      kids.push(child);
      self.parents.entry(child).or_default().push(parent);
    }
  }

  pub fn remove_edge(&mut self, parent: FwId, child: FwId) {
    if let Some(kids) = self.children.get_mut(&parent) {
      kids.retain(|k| *k != child);
    }
    if let Some(ups) = self.parents.get_mut(&child) {
      ups.retain(|p| *p != parent);
    }
  }

  pub fn contains(&self, fw_id: FwId) -> bool {
    self.children.contains_key(&fw_id)
  }

  pub fn nodes(&self) -> impl Iterator<Item = FwId> + '_ {
    self.children.keys().copied()
  }

  pub fn len(&self) -> usize {
    self.children.len()
  }

  pub fn is_empty(&self) -> bool {
    self.children.is_empty()
  }

  /// Get downstream nodes for a given node.
  pub fn children(&self, fw_id: FwId) -> &[FwId] {
    self.children.get(&fw_id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn parents(&self, fw_id: FwId) -> &[FwId] {
    self.parents.get(&fw_id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Nodes with no incoming edges.
  pub fn roots(&self) -> Vec<FwId> {
    self
      .parents
      .iter()
      .filter(|(_, ups)| ups.is_empty())
      .map(|(id, _)| *id)
      .collect()
  }

  /// Nodes with no outgoing edges.
  pub fn leaves(&self) -> Vec<FwId> {
    self
      .children
      .iter()
      .filter(|(_, kids)| kids.is_empty())
      .map(|(id, _)| *id)
      .collect()
  }

  /// All nodes reachable from `fw_id`, excluding itself, in breadth-first
  /// order.
  pub fn descendants(&self, fw_id: FwId) -> Vec<FwId> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<FwId> = self.children(fw_id).iter().copied().collect();
    while let Some(next) = queue.pop_front() {
      if seen.insert(next) {
        order.push(next);
        queue.extend(self.children(next).iter().copied());
      }
    }
    order
  }

  /// Rename nodes according to `old_new`; ids not in the map keep their id.
  pub fn reassign(&self, old_new: &BTreeMap<FwId, FwId>) -> Self {
    let map = |id: FwId| old_new.get(&id).copied().unwrap_or(id);
    let children = self
      .children
      .iter()
      .map(|(parent, kids)| (map(*parent), kids.iter().map(|k| map(*k)).collect()))
      .collect();
    Self::new(children)
  }

  /// The child adjacency mapping.
  pub fn as_map(&self) -> &BTreeMap<FwId, Vec<FwId>> {
    &self.children
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn diamond() -> Links {
    Links::new(BTreeMap::from([(1, vec![2, 3]), (2, vec![4]), (3, vec![4])]))
  }

  #[test]
  fn test_transpose_and_endpoints() {
    let links = diamond();
    assert_eq!(links.len(), 4);
    assert_eq!(links.parents(4), &[2, 3]);
    assert_eq!(links.roots(), vec![1]);
    assert_eq!(links.leaves(), vec![4]);
    assert!(links.children(99).is_empty());
  }

  #[test]
  fn test_descendants_visit_once() {
    assert_eq!(diamond().descendants(1), vec![2, 3, 4]);
    assert!(diamond().descendants(4).is_empty());
  }

  #[test]
  fn test_edges_are_deduplicated_and_removable() {
    let mut links = diamond();
    links.add_edge(1, 2);
    assert_eq!(links.children(1), &[2, 3]);
    links.remove_edge(1, 2);
    assert_eq!(links.children(1), &[3]);
    assert_eq!(links.parents(2), &[] as &[FwId]);
  }

  #[test]
  fn test_reassign() {
    let links = Links::new(BTreeMap::from([(-1, vec![-2])]));
    let renamed = links.reassign(&BTreeMap::from([(-1, 10), (-2, 11)]));
    assert_eq!(renamed.children(10), &[11]);
    assert_eq!(renamed.parents(11), &[10]);
  }
}
