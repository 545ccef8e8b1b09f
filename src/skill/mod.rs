/// Skill subsystem boundary
///
/// A skill invocation is fire-and-forget: the invoker only has to hand the
/// request over. The skill subsystem reports the node's outcome later through
/// the node completion callback.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Everything a skill needs to run one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillInvocation {
    pub execution_id: String,
    pub node_execution_id: String,
    pub node_id: String,
    /// Canvas the result is written to
    pub canvas_id: String,
    /// Query after variable substitution
    pub query: String,
    /// Resolved context items (`metadata.contextItems`)
    pub context: Value,
    /// `metadata.modelInfo`
    pub model_selection: Value,
    /// `metadata.selectedToolsets`
    pub tool_selection: Value,
    pub result_history: Vec<Value>,
}

/// Hands a node over to the skill subsystem
#[async_trait]
pub trait SkillInvoker: Send + Sync {
    async fn invoke(&self, invocation: SkillInvocation) -> Result<()>;
}

/// Posts invocations to the skill service over HTTP
#[derive(Debug, Clone)]
pub struct HttpSkillInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSkillInvoker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build skill HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SkillInvoker for HttpSkillInvoker {
    async fn invoke(&self, invocation: SkillInvocation) -> Result<()> {
        tracing::debug!(
            "🌐 Invoking skill for node {} ({}) at {}",
            invocation.node_id,
            invocation.execution_id,
            self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&invocation)
            .send()
            .await
            .map_err(|e| anyhow!("Skill request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Skill service returned {}: {}", status.as_u16(), body));
        }

        tracing::debug!("📡 Skill accepted node {} ({})", invocation.node_id, status);
        Ok(())
    }
}
