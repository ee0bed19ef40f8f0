//! Slack Incoming Webhook delivery.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

/// Slack allows at most 10 fields per section block.
const MAX_SECTION_FIELDS: usize = 10;

/// Slack rejects section text longer than 3000 characters.
const MAX_DETAIL_CHARS: usize = 2900;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Structured Slack message for Block Kit rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    /// Preformatted text shown below the fields, e.g. an error message.
    pub detail: Option<String>,
    pub context: String,
}

impl SlackMessage {
    /// Value of the field with the given label.
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    /// Block Kit payload with a plain-text fallback.
    pub fn to_payload(&self) -> Value {
        let mut blocks = vec![json!({
            "type": "header",
            "text": {"type": "plain_text", "text": self.header, "emoji": true}
        })];

        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|(label, value)| json!({"type": "mrkdwn", "text": format!("*{label}*\n{value}")}))
            .collect();
        blocks.extend(
            fields
                .chunks(MAX_SECTION_FIELDS)
                .map(|chunk| json!({"type": "section", "fields": chunk})),
        );

        if let Some(detail) = &self.detail {
            let detail: String = detail.chars().take(MAX_DETAIL_CHARS).collect();
            blocks.push(json!({
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("```{detail}```")}
            }));
        }

        blocks.push(json!({"type": "divider"}));
        blocks.push(json!({
            "type": "context",
            "elements": [{"type": "mrkdwn", "text": self.context}]
        }));

        json!({
            "text": format!("{}\n{}", self.header, self.context),
            "blocks": blocks
        })
    }
}

/// Slack webhook client.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Deliver a message. Failures are logged, never returned: a lost
    /// notification must not fail the operation.
    pub async fn send(&self, operation_id: &str, message: &SlackMessage) {
        let result = self
            .client
            .post(&self.webhook_url)
            .timeout(SEND_TIMEOUT)
            .json(&message.to_payload())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    operation = operation_id,
                    header = message.header.as_str(),
                    "Slack notification sent"
                );
            }
            Ok(resp) => {
                warn!(
                    operation = operation_id,
                    status = %resp.status(),
                    "Slack webhook returned non-success status"
                );
            }
            Err(e) => {
                warn!(
                    operation = operation_id,
                    error = %e,
                    "Failed to send Slack notification"
                );
            }
        }
    }
}
