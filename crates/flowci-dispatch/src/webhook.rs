//! Webhook URLs handed to the agent, and parsing of their `identifier`.
//!
//! Session commands carry the raw job id; run commands carry a JSON object
//! naming the job and the node path.

use serde::{Deserialize, Serialize};

use flowci_core::error::{FlowError, Result};
use flowci_core::types::JobId;

pub const HOOK_PATH: &str = "/hooks/cmd";

/// Identifier of a node-level webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHookIdentifier {
    pub path: String,
    pub job_id: String,
}

impl NodeHookIdentifier {
    pub fn new(path: impl Into<String>, job_id: &JobId) -> Self {
        Self {
            path: path.into(),
            job_id: job_id.0.clone(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(identifier: &str) -> Result<Self> {
        let parsed: NodeHookIdentifier = serde_json::from_str(identifier)
            .map_err(|e| FlowError::InvalidIdentifier(format!("{}: {}", identifier, e)))?;
        if parsed.path.is_empty() || parsed.job_id.is_empty() {
            return Err(FlowError::InvalidIdentifier(identifier.to_string()));
        }
        Ok(parsed)
    }

    pub fn job_id(&self) -> JobId {
        JobId::from_string(&self.job_id)
    }
}

/// `{domain}/hooks/cmd?identifier={urlencoded identifier}`
pub fn hook_url(domain: &str, identifier: &str) -> String {
    format!(
        "{}{}?identifier={}",
        domain.trim_end_matches('/'),
        HOOK_PATH,
        urlencoding::encode(identifier)
    )
}

pub fn job_hook(domain: &str, job_id: &JobId) -> String {
    hook_url(domain, job_id.as_str())
}

pub fn node_hook(domain: &str, path: &str, job_id: &JobId) -> Result<String> {
    let identifier = NodeHookIdentifier::new(path, job_id).encode()?;
    Ok(hook_url(domain, &identifier))
}

/// Raw job id of a session-level webhook identifier.
pub fn parse_job_identifier(identifier: &str) -> Result<JobId> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(FlowError::InvalidIdentifier("empty job identifier".into()));
    }
    Ok(JobId::from_string(trimmed))
}
