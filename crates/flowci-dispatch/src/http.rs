use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use flowci_core::cmd::{Cmd, CmdInfo};
use flowci_core::error::{FlowError, Result};
use flowci_core::traits::CommandTransport;

/// reqwest-backed transport posting JSON commands to the agent side.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("flowci/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FlowError::Dispatch(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl CommandTransport for HttpTransport {
    fn post(&self, url: &str, info: &CmdInfo) -> BoxFuture<'_, Result<Option<Cmd>>> {
        let url = url.to_string();
        let info = info.clone();

        Box::pin(async move {
            debug!(url = %url, cmd_type = %info.cmd_type, "Posting command");

            let resp = self
                .client
                .post(&url)
                .json(&info)
                .send()
                .await
                .map_err(|e| FlowError::Dispatch(format!("Request to {} failed: {}", url, e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FlowError::Dispatch(format!(
                    "HTTP {} {} from {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown"),
                    url
                )));
            }

            let body = resp
                .text()
                .await
                .map_err(|e| FlowError::Dispatch(format!("Failed to read response: {}", e)))?;

            parse_cmd_body(&body)
        })
    }
}

/// An empty or `null` body means the endpoint returned no command.
fn parse_cmd_body(body: &str) -> Result<Option<Cmd>> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| FlowError::Dispatch(format!("Invalid command response: {}", e)))
}
