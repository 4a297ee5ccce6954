use std::path::Path;

use crate::PackingError;

/// Share of the allocation given to one packed worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubJob {
  /// Empty when the allocation came without a node list.
  pub nodes: Vec<String>,
  pub sub_nproc: usize,
}

/// Split `nodes` evenly over `num_jobs` workers.
///
/// Duplicates (a nodefile lists a node once per core) are collapsed and the
/// nodes sorted before splitting. Without a node list every worker gets
/// `ppn` processors and no nodes.
pub fn split_node_lists(num_jobs: usize, nodes: Option<&[String]>, ppn: usize) -> Result<Vec<SubJob>, PackingError> {
  let mut unique: Vec<String> = nodes.map(<[String]>::to_vec).unwrap_or_default();
  unique.sort();
  unique.dedup();

  if unique.is_empty() {
    return Ok(vec![
      SubJob {
        nodes: Vec::new(),
        sub_nproc: ppn,
      };
      num_jobs
    ]);
  }

  let nnodes = unique.len();
  if num_jobs == 0 || nnodes % num_jobs != 0 {
    return Err(PackingError::NodeSplit { nnodes, num_jobs });
  }
  let sub_nnodes = nnodes / num_jobs;
  Ok(
    unique
      .chunks(sub_nnodes)
      .map(|chunk| SubJob {
        nodes: chunk.to_vec(),
        sub_nproc: sub_nnodes * ppn,
      })
      .collect(),
  )
}

/// Remove every occurrence of `host`. Returns whether it was present.
pub fn exclude_node(nodes: &mut Vec<String>, host: &str) -> bool {
  let before = nodes.len();
  nodes.retain(|n| n != host);
  nodes.len() != before
}

/// Read a whitespace-separated nodefile as written by batch schedulers.
pub async fn read_nodefile(path: &Path) -> Result<Vec<String>, PackingError> {
  let contents = tokio::fs::read_to_string(path)
    .await
    .map_err(|source| PackingError::File {
      path: path.to_path_buf(),
      source,
    })?;
  Ok(contents.split_whitespace().map(str::to_string).collect())
}
