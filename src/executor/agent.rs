//! Remote execution through the update agent running on each server.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info};

use super::{Executor, PhaseContext};
use crate::cluster::Server;
use crate::error::CuoError;
use crate::plan::{PhaseData, PhaseKind};

/// Default port of the update agent.
pub const DEFAULT_AGENT_PORT: u16 = 3012;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request body accepted by the agent's `/v1/phases` endpoint.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRequest<'a> {
    pub operation_id: &'a str,
    pub phase: &'a str,
    pub kind: PhaseKind,
    pub data: &'a PhaseData,
    pub rollback: bool,
}

/// Executes phases by posting them to the agent of the execution server.
pub struct AgentExecutor {
    client: reqwest::Client,
    port: u16,
}

impl AgentExecutor {
    pub fn new(port: u16) -> Result<Self, CuoError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| CuoError::Agent("client".to_string(), e.to_string()))?;
        Ok(Self { client, port })
    }

    async fn dispatch(&self, ctx: &PhaseContext, rollback: bool) -> Result<(), CuoError> {
        let server = ctx.exec_server().ok_or_else(|| {
            CuoError::Executor(ctx.path.clone(), "no server to execute on".to_string())
        })?;
        let url = agent_url(server, self.port);
        let request = PhaseRequest {
            operation_id: &ctx.operation_id,
            phase: &ctx.path,
            kind: ctx.kind,
            data: &ctx.data,
            rollback,
        };

        debug!(
            phase = %ctx.path,
            server = %server.hostname,
            url = %url,
            rollback,
            "Dispatching phase to agent"
        );

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CuoError::agent(&server.hostname, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CuoError::agent(
                &server.hostname,
                format!("{status}: {}", body.trim()),
            ));
        }

        info!(phase = %ctx.path, server = %server.hostname, rollback, "Agent completed phase");
        Ok(())
    }
}

impl Executor for AgentExecutor {
    fn name(&self) -> &'static str {
        "agent"
    }

    fn execute<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        self.dispatch(ctx, false).boxed()
    }

    fn rollback<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        self.dispatch(ctx, true).boxed()
    }
}

/// Phase endpoint of the agent on `server`.
pub fn agent_url(server: &Server, port: u16) -> String {
    format!("http://{}:{port}/v1/phases", server.advertise_ip)
}
