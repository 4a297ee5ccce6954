//! Messages exchanged between packed workers and the coordinator.
//!
//! Every message is one JSON document in a frame prefixed with its 4-byte
//! big-endian length. A connection starts with [`Request::Hello`]; anything
//! else, or a wrong password, gets an error response and the connection is
//! closed.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skyrocket_config::FWorker;
use skyrocket_workflow::{Firework, FwAction, FwId, Launch, LaunchId, State};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{PackingError, WorkerId};

pub(crate) type Connection = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
  Hello {
    password: String,
    worker_id: WorkerId,
  },
  CheckoutFw {
    worker: FWorker,
    host: String,
    ip: String,
    launch_dir: String,
    fw_id: Option<FwId>,
  },
  CompleteLaunch {
    launch_id: LaunchId,
    action: Option<FwAction>,
    state: State,
  },
  PingLaunch {
    launch_id: LaunchId,
    checkpoint: Option<Value>,
  },
  ChangeLaunchDir {
    launch_id: LaunchId,
    launch_dir: String,
  },
  GetLaunch {
    launch_id: LaunchId,
  },
  RunExists {
    worker: FWorker,
  },
  FutureRunExists {
    worker: FWorker,
  },
  SetRunning {
    worker_id: WorkerId,
    launch_id: LaunchId,
  },
  ClearRunning {
    worker_id: WorkerId,
  },
  AnyRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Response {
  Done,
  CheckedOut(Option<(Firework, LaunchId)>),
  Launch(Box<Launch>),
  Flag(bool),
  Error { message: String },
}

pub(crate) fn framed(stream: TcpStream) -> Connection {
  Framed::new(stream, LengthDelimitedCodec::new())
}

pub(crate) async fn send<T: Serialize>(conn: &mut Connection, message: &T) -> Result<(), PackingError> {
  let frame = serde_json::to_vec(message)?;
  conn.send(Bytes::from(frame)).await?;
  Ok(())
}

/// `None` once the peer closed the connection.
pub(crate) async fn recv<T: DeserializeOwned>(conn: &mut Connection) -> Result<Option<T>, PackingError> {
  match conn.next().await {
    Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
    None => Ok(None),
  }
}
