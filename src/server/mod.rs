// ============================================================================
// SECTION 15: RPC SERVERS
// ============================================================================
// One accept loop serves every omega protocol. A connection carries a
// sequence of request frames; each request gets at most one response frame
// back on the same connection. Push-style protocols answer nothing.
// ============================================================================

pub mod agent;
pub mod collector;
pub mod watchdog;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RpcError, RpcResult};
use crate::wire::{framed, read_frame, write_frame};

pub use agent::AgentService;
pub use collector::CollectorService;
pub use watchdog::WatchdogService;

// ----------------------------------------------------------------------------
// 15.1 Service Trait
// ----------------------------------------------------------------------------

/// A request/response protocol.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send + Sync;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Answer one request; `None` sends nothing back.
    async fn handle(&self, request: Self::Request, peer: SocketAddr) -> Option<Self::Response>;
}

// ----------------------------------------------------------------------------
// 15.2 Server
// ----------------------------------------------------------------------------

/// A bound listener serving one [`Service`] until shut down.
#[derive(Debug)]
pub struct RpcServer {
    name: &'static str,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RpcServer {
    pub async fn bind<S: Service>(addr: &str, service: Arc<S>) -> RpcResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| RpcError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| RpcError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let name = service.name();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(listener, service, cancel.clone()));
        info!(target: "omega::server", service = name, addr = %local_addr, "RPC server listening");

        Ok(Self {
            name,
            local_addr,
            cancel,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(target: "omega::server", service = self.name, error = %e, "Accept loop panicked");
        }
        info!(target: "omega::server", service = self.name, "RPC server stopped");
    }
}

async fn accept_loop<S: Service>(listener: TcpListener, service: Arc<S>, cancel: CancellationToken) {
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.retain(|h: &JoinHandle<()>| !h.is_finished());
                    connections.push(tokio::spawn(serve_connection(
                        stream,
                        peer,
                        service.clone(),
                        cancel.child_token(),
                    )));
                }
                Err(e) => {
                    error!(target: "omega::server", service = service.name(), error = %e, "Accept failure");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    for handle in connections {
        let _ = handle.await;
    }
}

async fn serve_connection<S: Service>(stream: TcpStream, peer: SocketAddr, service: Arc<S>, cancel: CancellationToken) {
    stream.set_nodelay(true).ok();
    debug!(target: "omega::server", service = service.name(), peer = %peer, "Connection opened");
    let mut io = framed(stream);

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = read_frame::<_, S::Request>(&mut io) => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "omega::server", service = service.name(), peer = %peer, error = %e, "Read request failure");
                break;
            }
        };

        if let Some(response) = service.handle(request, peer).await {
            if let Err(e) = write_frame(&mut io, &response).await {
                warn!(target: "omega::server", service = service.name(), peer = %peer, error = %e, "Write response failure");
                break;
            }
        }
    }
    debug!(target: "omega::server", service = service.name(), peer = %peer, "Connection closed");
}

// ----------------------------------------------------------------------------
// 15.3 Advertised Addresses
// ----------------------------------------------------------------------------

/// First IPv4 address of an up, non-loopback interface.
pub fn local_ip() -> io::Result<Ipv4Addr> {
    let addrs = getifaddrs()?;
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Ok(*SocketAddrV4::from(*sin).ip());
        }
    }
    Err(io::Error::new(io::ErrorKind::NotFound, "no non-loopback ipv4 address"))
}

/// Inner and outer IPs to bind and advertise. A missing inner IP is
/// detected from the interfaces; a missing outer IP equals the inner one.
pub fn advertised_ips(inner: Option<&str>, outer: Option<&str>) -> io::Result<(String, String)> {
    let inner = match inner {
        Some(ip) => ip.to_string(),
        None => local_ip()?.to_string(),
    };
    let outer = outer.map(str::to_string).unwrap_or_else(|| inner.clone());
    Ok((inner, outer))
}
