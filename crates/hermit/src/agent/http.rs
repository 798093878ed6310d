use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::decision::{Decision, DecisionCollaborator};
use super::transcript::Transcript;
use crate::error::{DecisionError, log_safe};

#[derive(Debug, Serialize)]
struct DecisionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    transcript: String,
    messages: Vec<serde_json::Value>,
}

/// Asks a remote endpoint for the next decision.
///
/// POSTs `{model, transcript, messages}` and expects a reply body of
/// `{"type": "tool_call", ...}` or `{"type": "final_answer", ...}`.
#[derive(Debug, Clone)]
pub struct HttpDecider {
    url: String,
    model: Option<String>,
    client: Client,
}

impl HttpDecider {
    /// Post to `url`, giving up on a single request after `timeout`.
    pub fn new(url: impl Into<String>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            model,
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl DecisionCollaborator for HttpDecider {
    async fn next_action(&self, transcript: &Transcript) -> Result<Decision, DecisionError> {
        let request = DecisionRequest {
            model: self.model.as_deref(),
            transcript: transcript.render(),
            messages: transcript.to_messages(),
        };
        tracing::debug!(
            url = %self.url,
            entries = transcript.len(),
            "requesting decision"
        );

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DecisionError::Timeout
                } else {
                    DecisionError::Request(e.to_string())
                }
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DecisionError::Request(e.to_string()))?;

        if !status.is_success() {
            tracing::warn!(status = %status, body = %log_safe(&body), "decision endpoint error");
            return Err(DecisionError::Request(format!("endpoint returned {status}")));
        }
        Ok(Decision::from_json(&body))
    }
}
