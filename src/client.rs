// ============================================================================
// SECTION 16: RPC CLIENTS
// ============================================================================
// Thin typed clients over the framed protocol, used by omega-ctl and tests.
// Every call is bounded by the client's timeout.
// ============================================================================

use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{RpcError, RpcResult};
use crate::supervisor::ProcessState;
use crate::wire::{
    framed, read_frame, write_frame, AgentRequest, AgentResponse, ControlSignal, FramedIo, MetricSet, SystemInfo,
    WatchdogRequest, WatchdogResponse,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// 16.1 Connection
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Connection {
    addr: String,
    io: FramedIo<TcpStream>,
    timeout: Duration,
}

impl Connection {
    async fn open(addr: &str, timeout: Duration) -> RpcResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout {
                operation: format!("connect {}", addr),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| RpcError::Connect {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();
        debug!(target: "omega::client", addr = %addr, "Connected");
        Ok(Self {
            addr: addr.to_string(),
            io: framed(stream),
            timeout,
        })
    }

    async fn call<Req, Resp>(&mut self, operation: &str, request: &Req) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let timeout = self.timeout;
        let io = &mut self.io;
        let exchange = async move {
            write_frame(io, request).await?;
            read_frame::<_, Resp>(io).await?.ok_or(RpcError::ConnectionClosed)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

// ----------------------------------------------------------------------------
// 16.2 Watchdog Client
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct WatchdogClient {
    conn: Connection,
}

impl WatchdogClient {
    pub async fn connect(addr: &str, timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            conn: Connection::open(addr, timeout).await?,
        })
    }

    pub fn addr(&self) -> &str {
        &self.conn.addr
    }

    /// Send UP or QUIT; the pid of the started or stopped child on success.
    pub async fn notify(&mut self, signal: ControlSignal) -> RpcResult<i32> {
        let response = self
            .conn
            .call("notify", &WatchdogRequest::Notify { signal })
            .await?;
        match response {
            WatchdogResponse::Pid { pid } => Ok(pid),
            WatchdogResponse::Error { message } => Err(RpcError::Remote { message }),
            WatchdogResponse::Status { .. } => Err(RpcError::UnexpectedResponse { expected: "Pid" }),
        }
    }

    pub async fn status(&mut self) -> RpcResult<ProcessState> {
        match self.conn.call("status", &WatchdogRequest::Status).await? {
            WatchdogResponse::Status { state } => Ok(state),
            WatchdogResponse::Error { message } => Err(RpcError::Remote { message }),
            WatchdogResponse::Pid { .. } => Err(RpcError::UnexpectedResponse { expected: "Status" }),
        }
    }
}

// ----------------------------------------------------------------------------
// 16.3 Agent Client
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct AgentClient {
    conn: Connection,
}

impl AgentClient {
    pub async fn connect(addr: &str, timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            conn: Connection::open(addr, timeout).await?,
        })
    }

    pub async fn ping(&mut self) -> RpcResult<String> {
        match self.conn.call("ping", &AgentRequest::Ping).await? {
            AgentResponse::Pong { message } => Ok(message),
            other => Err(unexpected(other, "Pong")),
        }
    }

    pub async fn version(&mut self) -> RpcResult<String> {
        match self.conn.call("version", &AgentRequest::Version).await? {
            AgentResponse::Version { version } => Ok(version),
            other => Err(unexpected(other, "Version")),
        }
    }

    pub async fn system(&mut self) -> RpcResult<SystemInfo> {
        match self.conn.call("system", &AgentRequest::System).await? {
            AgentResponse::System { info } => Ok(info),
            other => Err(unexpected(other, "System")),
        }
    }
}

fn unexpected(response: AgentResponse, expected: &'static str) -> RpcError {
    match response {
        AgentResponse::Error { message } => RpcError::Remote { message },
        _ => RpcError::UnexpectedResponse { expected },
    }
}

// ----------------------------------------------------------------------------
// 16.4 Push Client
// ----------------------------------------------------------------------------

/// One-way metric stream to a collector.
#[derive(Debug)]
pub struct PushClient {
    conn: Connection,
}

impl PushClient {
    pub async fn connect(addr: &str, timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            conn: Connection::open(addr, timeout).await?,
        })
    }

    pub async fn push(&mut self, set: &MetricSet) -> RpcResult<()> {
        let timeout = self.conn.timeout;
        tokio::time::timeout(timeout, write_frame(&mut self.conn.io, set))
            .await
            .map_err(|_| RpcError::Timeout {
                operation: "push".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Flush and close the stream.
    pub async fn close(mut self) -> RpcResult<()> {
        SinkExt::<Bytes>::close(&mut self.conn.io).await.map_err(RpcError::codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AgentService, CollectorService, RpcServer, WatchdogService};
    use crate::supervisor::{CommandSpawner, Supervisor, SupervisorConfig};
    use crate::wire::to_metric_set;
    use crate::OMEGA_VERSION;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_agent_client_round_trip() {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(AgentService::new())).await.unwrap();
        let addr = server.local_addr().to_string();

        let mut client = AgentClient::connect(&addr, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(client.ping().await.unwrap(), "pong");
        assert_eq!(client.version().await.unwrap(), OMEGA_VERSION);
        assert_eq!(client.system().await.unwrap().pid, std::process::id());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_watchdog_client_maps_remote_errors() {
        let spawner = Arc::new(CommandSpawner::new("/bin/true", Vec::new()));
        let supervisor = Supervisor::new(SupervisorConfig::default(), spawner);
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(WatchdogService::new(supervisor)))
            .await
            .unwrap();
        let addr = server.local_addr().to_string();

        let mut client = WatchdogClient::connect(&addr, DEFAULT_TIMEOUT).await.unwrap();
        match client.notify(ControlSignal::Quit).await {
            Err(RpcError::Remote { message }) => assert_eq!(message, "omega is stopped"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.status().await.unwrap(), ProcessState::Idle);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut client = AgentClient::connect(&addr, Duration::from_millis(200)).await.unwrap();
        let _peer = accept.await.unwrap();
        assert!(matches!(client.ping().await, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            AgentClient::connect(&addr, DEFAULT_TIMEOUT).await,
            Err(RpcError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_push_client() {
        let (tx, rx) = flume::unbounded();
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(CollectorService::new().with_sink(tx)))
            .await
            .unwrap();
        let addr = server.local_addr().to_string();

        let set = to_metric_set(&[crate::metric::Metric::new(
            "system",
            crate::metric::ValueType::Gauge,
            chrono::Utc::now(),
        )
        .with_field("load1", 0.5)])
        .unwrap();
        let mut client = PushClient::connect(&addr, DEFAULT_TIMEOUT).await.unwrap();
        client.push(&set).await.unwrap();
        client.close().await.unwrap();

        let (_, got) = rx.recv_async().await.unwrap();
        assert_eq!(got, set);
        server.shutdown().await;
    }
}
