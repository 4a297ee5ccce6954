use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use skyrocket_config::PackingConfig;
use skyrocket_launchpad::{LaunchPad, LaunchPadClient, LaunchPadError};
use skyrocket_workflow::LaunchId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{self, Connection, Request, Response};
use crate::{PackingError, WorkerId};

#[derive(Default)]
struct Workers {
  /// Launch each worker is currently running.
  running: HashMap<WorkerId, LaunchId>,
  /// Open connections per worker. A worker without one is gone.
  connections: HashMap<WorkerId, usize>,
}

/// Owns the launchpad on behalf of the packed workers of one allocation.
///
/// Workers reach it over loopback TCP. Writes are serialized through one
/// lock, and the coordinator sends the heartbeats of every running launch
/// so that the workers don't have to.
pub struct Coordinator {
  listener: TcpListener,
  launchpad: Arc<LaunchPad>,
  password: String,
  ping_interval: Duration,
  write_lock: Mutex<()>,
  workers: Mutex<Workers>,
}

impl Coordinator {
  /// Listen on `127.0.0.1:<port>`; port `0` lets the OS choose.
  pub async fn bind(launchpad: Arc<LaunchPad>, config: &PackingConfig) -> Result<Self, PackingError> {
    let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
    let ping_interval = launchpad.config().timings.ping_interval();
    Ok(Self {
      listener,
      launchpad,
      password: config.password.clone(),
      ping_interval,
      write_lock: Mutex::new(()),
      workers: Mutex::new(Workers::default()),
    })
  }

  pub fn with_ping_interval(mut self, interval: Duration) -> Self {
    self.ping_interval = interval;
    self
  }

  pub fn local_addr(&self) -> Result<SocketAddr, PackingError> {
    Ok(self.listener.local_addr()?)
  }

  /// Snapshot of the worker → launch map.
  pub async fn running_ids(&self) -> HashMap<WorkerId, LaunchId> {
    self.workers.lock().await.running.clone()
  }

  /// Accept workers and ping their launches until `cancel` fires.
  #[instrument(skip_all)]
  pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<(), PackingError> {
    info!(addr = %self.local_addr()?, "coordinator listening");
    let mut heartbeat = tokio::time::interval(self.ping_interval.max(Duration::from_millis(1)));
    heartbeat.tick().await;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = heartbeat.tick() => self.ping_running().await,
        accepted = self.listener.accept() => {
          let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
              warn!(error = %e, "accept failed");
              continue;
            }
          };
          debug!(%peer, "worker connected");
          let (this, token) = (self.clone(), cancel.clone());
          tokio::spawn(async move {
            if let Err(e) = this.handle_connection(stream, token).await {
              warn!(%peer, error = %e, "worker connection ended with an error");
            }
          });
        }
      }
    }

    info!("coordinator stopped");
    Ok(())
  }

  /// Ping every launch whose worker is still connected and forget the others.
  async fn ping_running(&self) {
    let targets: Vec<(WorkerId, LaunchId)> = {
      let mut workers = self.workers.lock().await;
      let Workers { running, connections } = &mut *workers;
      running.retain(|worker_id, launch_id| {
        let alive = connections.contains_key(worker_id);
        if !alive {
          warn!(worker_id, launch_id = *launch_id, "worker is gone; dropping its running launch");
        }
        alive
      });
      running.iter().map(|(w, l)| (*w, *l)).collect()
    };

    for (worker_id, launch_id) in targets {
      let _guard = self.write_lock.lock().await;
      match self.launchpad.ping_launch(launch_id, None).await {
        Ok(()) => debug!(worker_id, launch_id, "pinged"),
        Err(e) => warn!(worker_id, launch_id, error = %e, "ping failed"),
      }
    }
  }

  async fn handle_connection(&self, stream: TcpStream, cancel: CancellationToken) -> Result<(), PackingError> {
    let mut conn = protocol::framed(stream);
    let worker_id = match protocol::recv::<Request>(&mut conn).await? {
      Some(Request::Hello { password, worker_id }) if password == self.password => worker_id,
      Some(_) => {
        protocol::send(
          &mut conn,
          &Response::Error {
            message: "authentication failed".to_string(),
          },
        )
        .await?;
        return Err(PackingError::AuthenticationFailed);
      }
      None => return Ok(()),
    };
    protocol::send(&mut conn, &Response::Done).await?;

    *self.workers.lock().await.connections.entry(worker_id).or_default() += 1;
    let result = self.serve_requests(&mut conn, cancel).await;
    let mut workers = self.workers.lock().await;
    if let Some(count) = workers.connections.get_mut(&worker_id) {
      *count -= 1;
      if *count == 0 {
        workers.connections.remove(&worker_id);
        debug!(worker_id, "worker disconnected");
      }
    }
    result
  }

  async fn serve_requests(&self, conn: &mut Connection, cancel: CancellationToken) -> Result<(), PackingError> {
    loop {
      let request = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        request = protocol::recv::<Request>(conn) => request?,
      };
      let Some(request) = request else {
        return Ok(());
      };
      let response = self.dispatch(request).await.unwrap_or_else(|e| Response::Error {
        message: e.to_string(),
      });
      protocol::send(conn, &response).await?;
    }
  }

  async fn dispatch(&self, request: Request) -> Result<Response, LaunchPadError> {
    let lp = &self.launchpad;
    let response = match request {
      Request::Hello { .. } => Response::Error {
        message: "already authenticated".to_string(),
      },
      Request::CheckoutFw {
        worker,
        host,
        ip,
        launch_dir,
        fw_id,
      } => {
        let _guard = self.write_lock.lock().await;
        Response::CheckedOut(lp.checkout_fw(&worker, &host, &ip, &launch_dir, fw_id).await?)
      }
      Request::CompleteLaunch {
        launch_id,
        action,
        state,
      } => {
        let _guard = self.write_lock.lock().await;
        lp.complete_launch(launch_id, action, state).await?;
        Response::Done
      }
      Request::PingLaunch { launch_id, checkpoint } => {
        let _guard = self.write_lock.lock().await;
        lp.ping_launch(launch_id, checkpoint).await?;
        Response::Done
      }
      Request::ChangeLaunchDir { launch_id, launch_dir } => {
        let _guard = self.write_lock.lock().await;
        lp.change_launch_dir(launch_id, &launch_dir).await?;
        Response::Done
      }
      Request::GetLaunch { launch_id } => Response::Launch(Box::new(lp.get_launch(launch_id).await?)),
      Request::RunExists { worker } => Response::Flag(lp.run_exists(&worker).await?),
      Request::FutureRunExists { worker } => Response::Flag(lp.future_run_exists(&worker).await?),
      Request::SetRunning { worker_id, launch_id } => {
        self.workers.lock().await.running.insert(worker_id, launch_id);
        Response::Done
      }
      Request::ClearRunning { worker_id } => {
        self.workers.lock().await.running.remove(&worker_id);
        Response::Done
      }
      Request::AnyRunning => Response::Flag(!self.workers.lock().await.running.is_empty()),
    };
    Ok(response)
  }
}
