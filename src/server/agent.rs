// ----------------------------------------------------------------------------
// 15.5 Agent Service
// ----------------------------------------------------------------------------

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::Service;
use crate::plugins::{read_system_info, DEFAULT_PROC_ROOT};
use crate::wire::{AgentRequest, AgentResponse};
use crate::OMEGA_VERSION;

#[derive(Debug, Clone)]
pub struct AgentService {
    proc_root: PathBuf,
}

impl AgentService {
    pub fn new() -> Self {
        Self::with_proc_root(DEFAULT_PROC_ROOT)
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for AgentService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for AgentService {
    type Request = AgentRequest;
    type Response = AgentResponse;

    fn name(&self) -> &'static str {
        "agent"
    }

    async fn handle(&self, request: AgentRequest, peer: SocketAddr) -> Option<AgentResponse> {
        debug!(target: "omega::server", peer = %peer, request = ?request, "Agent request");
        let response = match request {
            AgentRequest::Ping => AgentResponse::Pong {
                message: "pong".to_string(),
            },
            AgentRequest::Version => AgentResponse::Version {
                version: OMEGA_VERSION.to_string(),
            },
            AgentRequest::System => AgentResponse::System {
                info: read_system_info(&self.proc_root),
            },
        };
        Some(response)
    }
}
