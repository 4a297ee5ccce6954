use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skyrocket_config::QueueAdapterConfig;
use tokio::process::Command;
use tracing::{debug, info};

use crate::QueueError;

/// The batch queue, as far as the queue launcher needs it.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
  /// Write a job script that runs `rocket_cmd` in `script_dir`, submit it
  /// and return the queue's job id.
  async fn submit_to_queue(&self, script_dir: &Path, rocket_cmd: &str) -> Result<String, QueueError>;

  /// Jobs of this user currently in the queue.
  async fn get_njobs_in_queue(&self) -> Result<usize, QueueError>;
}

/// Drives a queue through shell commands from `my_qadapter.yaml`.
#[derive(Debug, Clone)]
pub struct CommandQueueAdapter {
  config: QueueAdapterConfig,
}

impl CommandQueueAdapter {
  pub fn new(config: QueueAdapterConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &QueueAdapterConfig {
    &self.config
  }

  fn script(&self, script_dir: &Path, rocket_cmd: &str) -> String {
    let mut lines = vec!["#!/bin/sh".to_string()];
    lines.extend(self.config.preamble.iter().cloned());
    lines.push(format!("cd '{}'", script_dir.display()));
    lines.push(rocket_cmd.to_string());
    lines.join("\n") + "\n"
  }

  async fn write_script(&self, script_dir: &Path, rocket_cmd: &str) -> Result<PathBuf, QueueError> {
    let path = script_dir.join(&self.config.script_name);
    let io = |source| QueueError::Io {
      path: path.clone(),
      source,
    };
    tokio::fs::write(&path, self.script(script_dir, rocket_cmd))
      .await
      .map_err(io)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(io)?;
    }
    Ok(path)
  }
}

async fn shell(cmd: &str, dir: Option<&Path>) -> Result<String, QueueError> {
  let mut command = Command::new("/bin/sh");
  command.arg("-c").arg(cmd);
  if let Some(dir) = dir {
    command.current_dir(dir);
  }
  let output = command.output().await.map_err(|e| QueueError::Command {
    cmd: cmd.to_string(),
    message: e.to_string(),
  })?;
  if !output.status.success() {
    return Err(QueueError::Command {
      cmd: cmd.to_string(),
      message: format!(
        "{}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      ),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl QueueAdapter for CommandQueueAdapter {
  async fn submit_to_queue(&self, script_dir: &Path, rocket_cmd: &str) -> Result<String, QueueError> {
    let script = self.write_script(script_dir, rocket_cmd).await?;
    let cmd = format!("{} '{}'", self.config.submit_cmd, script.display());
    let stdout = shell(&cmd, Some(script_dir)).await?;

    // Schedulers print the id last, e.g. "Submitted batch job 1234".
    let job_id = stdout
      .lines()
      .rev()
      .find_map(|line| line.split_whitespace().last())
      .map(str::to_string)
      .ok_or_else(|| QueueError::Parse {
        cmd: cmd.clone(),
        output: stdout.clone(),
      })?;
    info!(job_id = %job_id, script = %script.display(), "submitted job");
    Ok(job_id)
  }

  async fn get_njobs_in_queue(&self) -> Result<usize, QueueError> {
    let stdout = shell(&self.config.njobs_cmd, None).await?;
    let njobs = stdout.trim().parse().map_err(|_| QueueError::Parse {
      cmd: self.config.njobs_cmd.clone(),
      output: stdout.clone(),
    })?;
    debug!(njobs, "jobs in queue");
    Ok(njobs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn adapter(submit_cmd: &str, njobs_cmd: &str) -> CommandQueueAdapter {
    CommandQueueAdapter::new(QueueAdapterConfig {
      submit_cmd: submit_cmd.to_string(),
      njobs_cmd: njobs_cmd.to_string(),
      rocket_cmd: "skyrocket rlaunch singleshot".to_string(),
      preamble: vec!["#SBATCH -N 1".to_string()],
      script_name: "job.sh".to_string(),
      max_jobs: 0,
    })
  }

  #[tokio::test]
  async fn test_submit_parses_job_id() {
    let dir = tempfile::tempdir().unwrap();
    let qa = adapter("printf 'Submitted batch job 42\\n'; true", "echo 0");
    let job = qa.submit_to_queue(dir.path(), "skyrocket rlaunch singleshot --fw-id 7").await.unwrap();
    assert_eq!(job, "42");

    let script = std::fs::read_to_string(dir.path().join("job.sh")).unwrap();
    assert!(script.starts_with("#!/bin/sh\n#SBATCH -N 1\n"));
    assert!(script.ends_with("skyrocket rlaunch singleshot --fw-id 7\n"));
  }

  #[tokio::test]
  async fn test_submit_failure() {
    let dir = tempfile::tempdir().unwrap();
    let err = adapter("false", "echo 0").submit_to_queue(dir.path(), "x").await.unwrap_err();
    assert!(matches!(err, QueueError::Command { .. }));
  }

  #[tokio::test]
  async fn test_njobs() {
    assert_eq!(adapter("true", "echo ' 3 '").get_njobs_in_queue().await.unwrap(), 3);
    let err = adapter("true", "echo many").get_njobs_in_queue().await.unwrap_err();
    assert!(matches!(err, QueueError::Parse { .. }));
  }
}
