//! Webhook forwarder — the escalation engine's one-way message to the
//! webhook receiver, per SPEC_FULL.md §4.7.
//!
//! Fire-and-forget: a non-2xx response or transport error increments
//! `webhook_errors_request` and is otherwise swallowed. No retry — the spec
//! is explicit that this loss is tolerable, since the next offending request
//! re-triggers escalation.

use chrono::Utc;
use serde_json::json;

use crate::metrics::Metrics;
use crate::model::RequestMetadata;

const FORWARD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct WebhookForwarder {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookForwarder {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Serialize `{event_type, reason, timestamp_utc, details}` and POST it.
    pub async fn forward(&self, meta: &RequestMetadata, reason: &str, metrics: &Metrics) {
        let Some(url) = self.url.as_deref() else {
            return;
        };
        metrics.incr("webhooks_sent");

        let payload = json!({
            "event_type": "suspicious_activity_detected",
            "reason": reason,
            "timestamp_utc": Utc::now().to_rfc3339(),
            "details": meta,
        });

        match self
            .client
            .post(url)
            .json(&payload)
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(source = %meta.source_address, reason, "webhook forwarded");
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), source = %meta.source_address, "webhook forward non-2xx");
                metrics.incr("webhook_errors_request");
            }
            Err(e) => {
                tracing::warn!(error = %e, source = %meta.source_address, "webhook forward failed");
                metrics.incr("webhook_errors_request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Headers;
    use std::collections::HashMap;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta() -> RequestMetadata {
        RequestMetadata {
            source_address: "1.2.3.4".into(),
            user_agent: "python-requests".into(),
            path: "/wp-login.php".into(),
            method: "GET".into(),
            referer: String::new(),
            status_code: None,
            bytes_sent: None,
            headers: Headers(HashMap::new()),
            timestamp: "2024-01-15T10:30:00Z".into(),
            source: "escalation_engine".into(),
        }
    }

    #[tokio::test]
    async fn unconfigured_url_is_a_silent_no_op() {
        let forwarder = WebhookForwarder::new(None);
        let metrics = Metrics::new();
        forwarder.forward(&meta(), "High Combined Score (0.95)", &metrics).await;
        assert!(metrics.snapshot().counters.is_empty());
    }

    #[tokio::test]
    async fn success_increments_only_sent_counter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let forwarder = WebhookForwarder::new(Some(server.uri()));
        let metrics = Metrics::new();
        forwarder.forward(&meta(), "High Combined Score (0.95)", &metrics).await;
        let snap = metrics.snapshot();
        assert_eq!(snap.counters.get("webhooks_sent"), Some(&1));
        assert!(snap.counters.get("webhook_errors_request").is_none());
    }

    #[tokio::test]
    async fn non_2xx_increments_error_counter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let forwarder = WebhookForwarder::new(Some(server.uri()));
        let metrics = Metrics::new();
        forwarder.forward(&meta(), "High Combined Score (0.95)", &metrics).await;
        assert_eq!(metrics.snapshot().counters.get("webhook_errors_request"), Some(&1));
    }
}
