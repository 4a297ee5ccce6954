use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use skyrocket_workflow::FwAction;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{RocketError, Task, TaskContext};

const TASK_NAME: &str = "ScriptTask";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Script {
  One(String),
  Many(Vec<String>),
}

/// Runs one or more shell commands in the launch directory.
///
/// Commands run in order and stop at the first non-zero exit code. The
/// return codes always land in `stored_data`; stdout and stderr only when
/// asked for. A bad return code fizzles the launch unless `defuse_bad_rc`
/// is set, in which case the children are defused instead.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptTask {
  script: Script,
  #[serde(default = "default_true")]
  use_shell: bool,
  #[serde(default)]
  shell_exe: Option<String>,
  #[serde(default)]
  stdout_file: Option<String>,
  #[serde(default)]
  stderr_file: Option<String>,
  #[serde(default)]
  store_stdout: bool,
  #[serde(default)]
  store_stderr: bool,
  #[serde(default)]
  defuse_bad_rc: bool,
  #[serde(default)]
  fizzle_bad_rc: Option<bool>,
}

fn default_true() -> bool {
  true
}

struct Captured {
  stdout: String,
  stderr: String,
  returncodes: Vec<i32>,
}

impl ScriptTask {
  fn commands(&self) -> Vec<String> {
    match &self.script {
      Script::One(s) => vec![s.clone()],
      Script::Many(all) => all.clone(),
    }
  }

  fn command(&self, line: &str) -> Result<Command, RocketError> {
    if self.use_shell {
      let mut cmd = Command::new(self.shell_exe.as_deref().unwrap_or("/bin/sh"));
      cmd.arg("-c").arg(line);
      return Ok(cmd);
    }
    let mut words = line.split_whitespace();
    let program = words.next().ok_or_else(|| RocketError::InvalidParams {
      task: TASK_NAME.to_string(),
      message: "empty script".to_string(),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(words);
    Ok(cmd)
  }

  async fn execute(&self, ctx: &TaskContext) -> Result<Captured, RocketError> {
    let capture_out = self.store_stdout || self.stdout_file.is_some();
    let capture_err = self.store_stderr || self.stderr_file.is_some();
    let mut captured = Captured {
      stdout: String::new(),
      stderr: String::new(),
      returncodes: Vec::new(),
    };

    for line in self.commands() {
      debug!(script = %line, "running script");
      let output = self
        .command(&line)?
        .current_dir(&ctx.launch_dir)
        .stdin(Stdio::null())
        .stdout(if capture_out { Stdio::piped() } else { Stdio::inherit() })
        .stderr(if capture_err { Stdio::piped() } else { Stdio::inherit() })
        .output()
        .await
        .map_err(|e| RocketError::TaskFailed {
          task: TASK_NAME.to_string(),
          message: format!("could not start `{line}`: {e}"),
        })?;

      captured.stdout.push_str(&String::from_utf8_lossy(&output.stdout));
      captured.stderr.push_str(&String::from_utf8_lossy(&output.stderr));
      // Killed by a signal.
      let rc = output.status.code().unwrap_or(-1);
      captured.returncodes.push(rc);
      if rc != 0 {
        break;
      }
    }
    Ok(captured)
  }

  async fn append(ctx: &TaskContext, name: &str, text: &str) -> Result<(), RocketError> {
    let path = ctx.launch_dir.join(name);
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .await
      .map_err(|e| RocketError::io(&path, e))?;
    file
      .write_all(text.as_bytes())
      .await
      .map_err(|e| RocketError::io(&path, e))
  }
}

#[async_trait]
impl Task for ScriptTask {
  async fn run(&self, _spec: &Map<String, Value>, ctx: &TaskContext) -> Result<FwAction, RocketError> {
    let fizzle_bad_rc = self.fizzle_bad_rc.unwrap_or(!self.defuse_bad_rc);
    if self.defuse_bad_rc && fizzle_bad_rc {
      return Err(RocketError::InvalidParams {
        task: TASK_NAME.to_string(),
        message: "cannot both fizzle and defuse on a bad return code".to_string(),
      });
    }

    let captured = self.execute(ctx).await?;
    if let Some(name) = &self.stdout_file {
      Self::append(ctx, name, &captured.stdout).await?;
    }
    if let Some(name) = &self.stderr_file {
      Self::append(ctx, name, &captured.stderr).await?;
    }

    let mut stored = Map::new();
    if self.store_stdout {
      stored.insert("stdout".to_string(), json!(captured.stdout));
    }
    if self.store_stderr {
      stored.insert("stderr".to_string(), json!(captured.stderr));
    }
    let last = captured.returncodes.last().copied().unwrap_or(0);
    stored.insert("returncode".to_string(), json!(last));
    stored.insert("all_returncodes".to_string(), json!(captured.returncodes));

    let action = FwAction {
      stored_data: stored,
      ..FwAction::default()
    };
    if last == 0 {
      return Ok(action);
    }
    if self.defuse_bad_rc {
      warn!(returncode = last, "script failed; defusing children");
      return Ok(FwAction {
        defuse_children: true,
        ..action
      });
    }
    if fizzle_bad_rc {
      return Err(RocketError::TaskFailed {
        task: TASK_NAME.to_string(),
        message: format!("return code {:?}", captured.returncodes),
      });
    }
    Ok(action)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ctx(dir: &std::path::Path) -> TaskContext {
    TaskContext {
      fw_id: 1,
      launch_id: 1,
      launch_dir: dir.to_path_buf(),
      nodes: Vec::new(),
      sub_nproc: None,
    }
  }

  fn task(params: Value) -> ScriptTask {
    serde_json::from_value(params).unwrap()
  }

  #[tokio::test]
  async fn test_stores_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let t = task(json!({"script": "echo hello", "store_stdout": true}));
    let action = t.run(&Map::new(), &ctx(dir.path())).await.unwrap();
    assert_eq!(action.stored_data["stdout"], json!("hello\n"));
    assert_eq!(action.stored_data["returncode"], json!(0));
  }

  #[tokio::test]
  async fn test_runs_in_launch_dir() {
    let dir = tempfile::tempdir().unwrap();
    let t = task(json!({"script": ["echo a > out.txt", "echo b >> out.txt"]}));
    t.run(&Map::new(), &ctx(dir.path())).await.unwrap();
    let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(written, "a\nb\n");
  }

  #[tokio::test]
  async fn test_bad_rc_fizzles_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let err = task(json!({"script": ["exit 3", "echo never"]}))
      .run(&Map::new(), &ctx(dir.path()))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("[3]"), "{err}");
  }

  #[tokio::test]
  async fn test_bad_rc_defuses() {
    let dir = tempfile::tempdir().unwrap();
    let action = task(json!({"script": "exit 1", "defuse_bad_rc": true}))
      .run(&Map::new(), &ctx(dir.path()))
      .await
      .unwrap();
    assert!(action.defuse_children);
    assert_eq!(action.stored_data["all_returncodes"], json!([1]));
  }

  #[tokio::test]
  async fn test_without_shell() {
    let dir = tempfile::tempdir().unwrap();
    let action = task(json!({"script": "echo plain words", "use_shell": false, "store_stdout": true}))
      .run(&Map::new(), &ctx(dir.path()))
      .await
      .unwrap();
    assert_eq!(action.stored_data["stdout"], json!("plain words\n"));
  }
}
