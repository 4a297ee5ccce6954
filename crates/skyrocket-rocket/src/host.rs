use std::net::UdpSocket;

use sysinfo::System;

/// Where a rocket runs, as recorded on its launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
  pub host: String,
  pub ip: String,
}

impl HostInfo {
  pub fn new(host: impl Into<String>, ip: impl Into<String>) -> Self {
    Self {
      host: host.into(),
      ip: ip.into(),
    }
  }

  /// The local host name and the address of the outbound interface.
  pub fn detect() -> Self {
    let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
    Self::new(host, outbound_ip().unwrap_or_else(|| "127.0.0.1".to_string()))
  }
}

// Connecting a UDP socket sends nothing; it only selects a route.
fn outbound_ip() -> Option<String> {
  let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
  socket.connect("8.8.8.8:80").ok()?;
  socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
