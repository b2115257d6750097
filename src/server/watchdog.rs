// ----------------------------------------------------------------------------
// 15.4 Watchdog Control Service
// ----------------------------------------------------------------------------

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Service;
use crate::supervisor::Supervisor;
use crate::wire::{WatchdogRequest, WatchdogResponse};

/// Exposes `Notify` and `Status` of a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct WatchdogService {
    supervisor: Arc<Supervisor>,
}

impl WatchdogService {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Service for WatchdogService {
    type Request = WatchdogRequest;
    type Response = WatchdogResponse;

    fn name(&self) -> &'static str {
        "watchdog"
    }

    async fn handle(&self, request: WatchdogRequest, peer: SocketAddr) -> Option<WatchdogResponse> {
        let response = match request {
            WatchdogRequest::Notify { signal } => {
                info!(target: "omega::server", peer = %peer, signal = %signal, "Notify received");
                match self.supervisor.notify(signal).await {
                    Ok(pid) => WatchdogResponse::Pid { pid: pid as i32 },
                    Err(e) => {
                        warn!(target: "omega::server", peer = %peer, signal = %signal, error = %e, hint = ?e.recovery_hint(), "Notify failure");
                        WatchdogResponse::Error { message: e.to_string() }
                    }
                }
            }
            WatchdogRequest::Status => WatchdogResponse::Status {
                state: self.supervisor.state(),
            },
        };
        Some(response)
    }
}
