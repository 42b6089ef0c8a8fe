//! Alpaca discovery responder
//!
//! Answers the UDP datagram `alpacadiscovery1` with the HTTP port of this
//! server, so clients can find it with a broadcast.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// Discovery request, protocol version 1
pub const DISCOVERY_MESSAGE: &[u8] = b"alpacadiscovery1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryResponse {
    pub alpaca_port: u16,
}

pub struct DiscoveryResponder {
    socket: UdpSocket,
    reply: Vec<u8>,
}

impl DiscoveryResponder {
    /// Bind the responder; `alpaca_port` is what it advertises
    pub async fn bind(addr: SocketAddr, alpaca_port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let reply = serde_json::to_vec(&DiscoveryResponse { alpaca_port }).map_err(io::Error::other)?;
        info!(
            "Discovery responder on {} advertising port {}",
            socket.local_addr()?,
            alpaca_port
        );
        Ok(Self { socket, reply })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answer discovery requests until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);
        let mut buf = [0u8; 1024];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Discovery responder stopped");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            continue;
                        }
                    };
                    if &buf[..len] != DISCOVERY_MESSAGE {
                        trace!("Ignoring {} byte datagram from {}", len, peer);
                        continue;
                    }
                    match self.socket.send_to(&self.reply, peer).await {
                        Ok(_) => debug!("Answered discovery from {}", peer),
                        Err(e) => warn!("Failed to answer discovery from {}: {}", peer, e),
                    }
                }
            }
        }
    }
}

/// Send one discovery request to `target` and return the advertised port
pub async fn probe(target: SocketAddr, timeout: Duration) -> io::Result<Option<u16>> {
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_MESSAGE, target).await?;

    let mut buf = [0u8; 1024];
    match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => match serde_json::from_slice::<DiscoveryResponse>(&buf[..len]) {
            Ok(response) => Ok(Some(response.alpaca_port)),
            Err(e) => {
                warn!("Malformed discovery response: {}", e);
                Ok(None)
            }
        },
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}
