//! Responder client - turns a visitor utterance plus trailing history into
//! reply text via the configured external brain endpoint.
//!
//! Never returns an error to its caller: every failure (timeout, network,
//! non-2xx, malformed body) degrades to a canned apology, so the protocol
//! always has a BOT turn to persist and broadcast.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use chatdock_protocol::ChatMessage;

/// Reply used whenever the responder endpoint cannot produce one.
pub const FALLBACK_REPLY: &str =
    "Sorry, I'm having trouble answering right now. Please try again in a moment.";

/// Ordered conventional reply fields tried against the responder payload.
const REPLY_FIELDS: [&str; 4] = ["reply", "response", "message", "text"];

pub struct ResponderClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ResponderClient {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    /// Produce a reply for a visitor turn. Always returns text; failures
    /// are logged and masked with [`FALLBACK_REPLY`].
    pub async fn reply(
        &self,
        session_id: &str,
        content: &str,
        history: &[ChatMessage],
        metadata: Option<&Value>,
    ) -> String {
        let turns: Vec<Value> = history
            .iter()
            .map(|m| json!({"sender": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "session_id": session_id,
            "message": content,
            "history": turns,
        });
        if let Some(meta) = metadata {
            body["metadata"] = meta.clone();
        }

        match self.call(&body).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    component = "responder",
                    event = "responder.call_failed",
                    session_id = %session_id,
                    error = %e,
                    "Responder call failed, using fallback reply"
                );
                FALLBACK_REPLY.to_string()
            }
        }
    }

    async fn call(&self, body: &Value) -> Result<String, anyhow::Error> {
        let resp = self.client.post(&self.endpoint).json(body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("responder error {}: {}", status, text);
        }

        let json: Value = resp.json().await?;
        Ok(extract_reply(&json))
    }
}

/// Pull a textual reply out of a responder payload, trying the conventional
/// field names in order, then falling back to a literal rendering of the
/// whole body.
fn extract_reply(value: &Value) -> String {
    for field in REPLY_FIELDS {
        if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
            return text.to_string();
        }
    }
    if let Some(text) = value.as_str() {
        return text.to_string();
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_conventional_field() {
        let value = json!({"response": "later", "reply": "first"});
        assert_eq!(extract_reply(&value), "first");
    }

    #[test]
    fn skips_non_string_fields() {
        let value = json!({"reply": 42, "text": "fallback field"});
        assert_eq!(extract_reply(&value), "fallback field");
    }

    #[test]
    fn bare_string_body_is_used_directly() {
        let value = json!("just text");
        assert_eq!(extract_reply(&value), "just text");
    }

    #[test]
    fn unknown_shape_renders_literally() {
        let value = json!({"choices": ["a", "b"]});
        assert_eq!(extract_reply(&value), r#"{"choices":["a","b"]}"#);
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_apology() {
        let client = ResponderClient::new(
            "http://127.0.0.1:9/reply".to_string(),
            Duration::from_secs(1),
        )
        .expect("client");

        let reply = client.reply("sess-1", "hello", &[], None).await;
        assert_eq!(reply, FALLBACK_REPLY);
    }
}
