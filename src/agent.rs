// src/agent.rs
//
// =============================================================================
// TASKGRID: AGENT CONTROL-PLANE CLIENT (v 0.3)
// =============================================================================
//
// The Nervous System.
//
// Everything a worker says to the controller goes through the `ControlPlane`
// trait: register, heartbeat, nothing else. Agents never touch the store.
// Test doubles substitute an in-memory implementation.

use crate::core::{
    AgentRecord, ApiEnvelope, HeartbeatRequest, HeartbeatResponse, RegisterMainRequest,
    RegisterSubRequest,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

pub mod main_agent;
pub mod sub_agent;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register_main(&self, req: &RegisterMainRequest) -> Result<AgentRecord>;
    async fn register_sub(&self, req: &RegisterSubRequest) -> Result<AgentRecord>;
    async fn heartbeat(&self, agent_id: &str, req: &HeartbeatRequest) -> Result<HeartbeatResponse>;
}

// ============================================================================
// HTTP IMPLEMENTATION
// ============================================================================

pub struct HttpControlPlane {
    base_url: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Unwrap the `{success, data, message}` envelope into data-or-error.
    fn unpack<T>(envelope: ApiEnvelope<T>) -> Result<T> {
        if !envelope.success {
            return Err(anyhow!(
                "controller rejected request: {}",
                envelope.message.unwrap_or_else(|| "unknown error".into())
            ));
        }
        envelope.data.ok_or_else(|| anyhow!("controller returned empty data"))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register_main(&self, req: &RegisterMainRequest) -> Result<AgentRecord> {
        let url = format!("{}/api/agents/main", self.base_url);
        let envelope = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("main agent registration request failed")?
            .json::<ApiEnvelope<AgentRecord>>()
            .await
            .context("main agent registration returned invalid JSON")?;
        Self::unpack(envelope)
    }

    async fn register_sub(&self, req: &RegisterSubRequest) -> Result<AgentRecord> {
        let url = format!("{}/api/agents/sub", self.base_url);
        let envelope = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("sub agent registration request failed")?
            .json::<ApiEnvelope<AgentRecord>>()
            .await
            .context("sub agent registration returned invalid JSON")?;
        Self::unpack(envelope)
    }

    async fn heartbeat(&self, agent_id: &str, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = format!("{}/api/agents/{}/heartbeat", self.base_url, agent_id);
        let envelope = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("heartbeat request failed")?
            .json::<ApiEnvelope<HeartbeatResponse>>()
            .await
            .context("heartbeat returned invalid JSON")?;
        Self::unpack(envelope)
    }
}
