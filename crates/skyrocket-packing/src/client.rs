use std::net::SocketAddr;

use async_trait::async_trait;
use serde_json::Value;
use skyrocket_config::FWorker;
use skyrocket_launchpad::{LaunchPadClient, LaunchPadError};
use skyrocket_workflow::{Firework, FwAction, FwId, Launch, LaunchId, State};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::protocol::{self, Connection, Request, Response};
use crate::{PackingError, WorkerId};

/// A launchpad reached through the coordinator of a packed allocation.
///
/// Heartbeats are left to the coordinator: the rocket only reports which
/// launch it is running.
pub struct PackedLaunchPad {
  worker_id: WorkerId,
  conn: Mutex<Connection>,
}

impl PackedLaunchPad {
  pub async fn connect(addr: SocketAddr, password: &str, worker_id: WorkerId) -> Result<Self, PackingError> {
    let mut conn = protocol::framed(TcpStream::connect(addr).await?);
    protocol::send(
      &mut conn,
      &Request::Hello {
        password: password.to_string(),
        worker_id,
      },
    )
    .await?;
    match protocol::recv::<Response>(&mut conn).await? {
      Some(Response::Done) => Ok(Self {
        worker_id,
        conn: Mutex::new(conn),
      }),
      Some(Response::Error { .. }) | None => Err(PackingError::AuthenticationFailed),
      Some(other) => Err(PackingError::UnexpectedResponse(format!("{other:?}"))),
    }
  }

  pub fn worker_id(&self) -> WorkerId {
    self.worker_id
  }

  /// Whether any worker of the allocation is still running a launch.
  pub async fn any_running(&self) -> Result<bool, PackingError> {
    match self.call(Request::AnyRunning).await? {
      Response::Flag(flag) => Ok(flag),
      other => Err(unexpected(other)),
    }
  }

  async fn call(&self, request: Request) -> Result<Response, PackingError> {
    let mut conn = self.conn.lock().await;
    protocol::send(&mut conn, &request).await?;
    match protocol::recv::<Response>(&mut conn).await? {
      Some(Response::Error { message }) => Err(LaunchPadError::Remote(message).into()),
      Some(response) => Ok(response),
      None => Err(PackingError::ConnectionClosed),
    }
  }

  async fn call_done(&self, request: Request) -> Result<(), LaunchPadError> {
    match self.call(request).await? {
      Response::Done => Ok(()),
      other => Err(unexpected(other).into()),
    }
  }

  async fn call_flag(&self, request: Request) -> Result<bool, LaunchPadError> {
    match self.call(request).await? {
      Response::Flag(flag) => Ok(flag),
      other => Err(unexpected(other).into()),
    }
  }
}

fn unexpected(response: Response) -> PackingError {
  PackingError::UnexpectedResponse(format!("{response:?}"))
}

#[async_trait]
impl LaunchPadClient for PackedLaunchPad {
  async fn checkout_fw(
    &self,
    worker: &FWorker,
    host: &str,
    ip: &str,
    launch_dir: &str,
    fw_id: Option<FwId>,
  ) -> Result<Option<(Firework, LaunchId)>, LaunchPadError> {
    let request = Request::CheckoutFw {
      worker: worker.clone(),
      host: host.to_string(),
      ip: ip.to_string(),
      launch_dir: launch_dir.to_string(),
      fw_id,
    };
    match self.call(request).await? {
      Response::CheckedOut(checked_out) => Ok(checked_out),
      other => Err(unexpected(other).into()),
    }
  }

  async fn complete_launch(
    &self,
    launch_id: LaunchId,
    action: Option<FwAction>,
    state: State,
  ) -> Result<(), LaunchPadError> {
    self
      .call_done(Request::CompleteLaunch {
        launch_id,
        action,
        state,
      })
      .await
  }

  async fn ping_launch(&self, launch_id: LaunchId, checkpoint: Option<Value>) -> Result<(), LaunchPadError> {
    self.call_done(Request::PingLaunch { launch_id, checkpoint }).await
  }

  async fn change_launch_dir(&self, launch_id: LaunchId, launch_dir: &str) -> Result<(), LaunchPadError> {
    self
      .call_done(Request::ChangeLaunchDir {
        launch_id,
        launch_dir: launch_dir.to_string(),
      })
      .await
  }

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, LaunchPadError> {
    match self.call(Request::GetLaunch { launch_id }).await? {
      Response::Launch(launch) => Ok(*launch),
      other => Err(unexpected(other).into()),
    }
  }

  async fn run_exists(&self, worker: &FWorker) -> Result<bool, LaunchPadError> {
    self.call_flag(Request::RunExists { worker: worker.clone() }).await
  }

  async fn future_run_exists(&self, worker: &FWorker) -> Result<bool, LaunchPadError> {
    self
      .call_flag(Request::FutureRunExists { worker: worker.clone() })
      .await
  }

  async fn track_running(&self, launch_id: Option<LaunchId>) -> Result<(), LaunchPadError> {
    let worker_id = self.worker_id;
    let request = match launch_id {
      Some(launch_id) => Request::SetRunning { worker_id, launch_id },
      None => Request::ClearRunning { worker_id },
    };
    self.call_done(request).await
  }

  fn heartbeat_locally(&self) -> bool {
    false
  }
}
