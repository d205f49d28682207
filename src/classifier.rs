//! Classifier gateway — optional medium-confidence consultation of a local
//! LLM and/or an external classification API, per SPEC_FULL.md §4.6.
//!
//! Both sinks return the same tri-state [`ClassifierVerdict`]; any error
//! (timeout, transport, unexpected response shape) collapses to
//! `Inconclusive` plus a component-specific error-counter increment, never a
//! propagated failure.

use std::time::Duration;

use serde_json::json;

use crate::config::ClassifierConfig;
use crate::metrics::Metrics;
use crate::model::{ClassifierVerdict, RequestMetadata};

/// Header names surfaced to the local LLM, mirroring the curated subset the
/// upstream prompt includes.
const CURATED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "connection",
    "host",
    "sec-ch-ua",
    "sec-fetch-site",
    "sec-fetch-mode",
    "sec-fetch-user",
    "sec-fetch-dest",
];

pub struct ClassifierGateway {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl ClassifierGateway {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Consult local LLM first; if inconclusive and an external API is
    /// configured, consult it next — per SPEC_FULL.md §4.6's ordering rule.
    pub async fn classify(&self, meta: &RequestMetadata, metrics: &Metrics) -> ClassifierVerdict {
        let local = self.classify_with_local_llm(meta, metrics).await;
        if local != ClassifierVerdict::Inconclusive {
            return local;
        }
        if self.config.external_api_url.is_some() {
            return self.classify_with_external_api(meta, metrics).await;
        }
        ClassifierVerdict::Inconclusive
    }

    pub async fn classify_with_local_llm(
        &self,
        meta: &RequestMetadata,
        metrics: &Metrics,
    ) -> ClassifierVerdict {
        let Some(url) = self.config.local_llm_api_url.as_deref() else {
            return ClassifierVerdict::Inconclusive;
        };
        metrics.incr("local_llm_checks_run");

        let selected_headers: serde_json::Map<String, serde_json::Value> = meta
            .headers
            .0
            .iter()
            .filter(|(k, _)| CURATED_HEADERS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();

        let prompt = format!(
            "Analyze the following request metadata to classify the origin as \
             MALICIOUS_BOT, BENIGN_CRAWLER, or HUMAN.\n\n\
             Address: {}\nUser-Agent: {}\nPath: {}\nReferer: {}\nTimestamp: {}\n\
             Selected Headers: {}\n\n\
             Respond ONLY with 'MALICIOUS_BOT', 'BENIGN_CRAWLER', or 'HUMAN'.",
            meta.source_address,
            if meta.user_agent.is_empty() { "N/A" } else { &meta.user_agent },
            if meta.path.is_empty() { "N/A" } else { &meta.path },
            if meta.referer.is_empty() { "N/A" } else { &meta.referer },
            meta.timestamp,
            serde_json::Value::Object(selected_headers),
        );

        let payload = json!({
            "model": self.config.local_llm_model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a security analysis assistant specializing in \
                                 bot detection. Respond ONLY with 'MALICIOUS_BOT', \
                                 'BENIGN_CRAWLER', or 'HUMAN'."
                },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.1,
            "stream": false,
        });

        let result = self
            .client
            .post(url)
            .json(&payload)
            .timeout(self.config.local_llm_timeout)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                metrics.incr("local_llm_errors_timeout");
                return ClassifierVerdict::Inconclusive;
            }
            Err(_) => {
                metrics.incr("local_llm_errors_request");
                return ClassifierVerdict::Inconclusive;
            }
        };

        if !response.status().is_success() {
            metrics.incr("local_llm_errors_request");
            return ClassifierVerdict::Inconclusive;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => {
                metrics.incr("local_llm_errors_response_decode");
                return ClassifierVerdict::Inconclusive;
            }
        };

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_ascii_uppercase();

        if content.contains("MALICIOUS_BOT") {
            ClassifierVerdict::Bot
        } else if content.contains("HUMAN") || content.contains("BENIGN_CRAWLER") {
            ClassifierVerdict::Benign
        } else {
            metrics.incr("local_llm_errors_unexpected_response");
            ClassifierVerdict::Inconclusive
        }
    }

    pub async fn classify_with_external_api(
        &self,
        meta: &RequestMetadata,
        metrics: &Metrics,
    ) -> ClassifierVerdict {
        let Some(url) = self.config.external_api_url.as_deref() else {
            return ClassifierVerdict::Inconclusive;
        };
        metrics.incr("external_api_checks_run");

        let payload = json!({
            "ipAddress": meta.source_address,
            "userAgent": meta.user_agent,
            "referer": meta.referer,
            "requestPath": meta.path,
            "headers": meta.headers.0,
        });

        let mut request = self
            .client
            .post(url)
            .json(&payload)
            .timeout(self.config.external_api_timeout);
        if let Some(key) = &self.config.external_api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                metrics.incr("external_api_errors_timeout");
                return ClassifierVerdict::Inconclusive;
            }
            Err(_) => {
                metrics.incr("external_api_errors_request");
                return ClassifierVerdict::Inconclusive;
            }
        };

        if !response.status().is_success() {
            metrics.incr("external_api_errors_request");
            return ClassifierVerdict::Inconclusive;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => {
                metrics.incr("external_api_errors_response_decode");
                return ClassifierVerdict::Inconclusive;
            }
        };

        match body.get("is_bot").and_then(|v| v.as_bool()) {
            Some(true) => {
                metrics.incr("external_api_success");
                ClassifierVerdict::Bot
            }
            Some(false) => {
                metrics.incr("external_api_success");
                ClassifierVerdict::Benign
            }
            None => {
                metrics.incr("external_api_errors_unexpected_response");
                ClassifierVerdict::Inconclusive
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Headers;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta() -> RequestMetadata {
        RequestMetadata {
            source_address: "5.6.7.8".into(),
            user_agent: "Mozilla/5.0".into(),
            path: "/".into(),
            method: "GET".into(),
            referer: String::new(),
            status_code: None,
            bytes_sent: None,
            headers: Headers(HashMap::new()),
            timestamp: "2024-01-15T10:30:00Z".into(),
            source: "proxy".into(),
        }
    }

    fn config_with_llm(url: String) -> ClassifierConfig {
        ClassifierConfig {
            local_llm_api_url: Some(url),
            local_llm_model: "llama3:latest".into(),
            local_llm_timeout: Duration::from_secs(5),
            external_api_url: None,
            external_api_key: None,
            external_api_timeout: Duration::from_secs(5),
            model_inference_url: None,
        }
    }

    #[tokio::test]
    async fn local_llm_bot_response_maps_to_bot_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "MALICIOUS_BOT"}}]
            })))
            .mount(&server)
            .await;

        let gateway = ClassifierGateway::new(config_with_llm(server.uri()));
        let metrics = Metrics::new();
        let verdict = gateway.classify_with_local_llm(&meta(), &metrics).await;
        assert_eq!(verdict, ClassifierVerdict::Bot);
    }

    #[tokio::test]
    async fn local_llm_human_response_maps_to_benign_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "HUMAN"}}]
            })))
            .mount(&server)
            .await;

        let gateway = ClassifierGateway::new(config_with_llm(server.uri()));
        let metrics = Metrics::new();
        let verdict = gateway.classify_with_local_llm(&meta(), &metrics).await;
        assert_eq!(verdict, ClassifierVerdict::Benign);
    }

    #[tokio::test]
    async fn local_llm_unexpected_content_is_inconclusive_and_counted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "I cannot decide"}}]
            })))
            .mount(&server)
            .await;

        let gateway = ClassifierGateway::new(config_with_llm(server.uri()));
        let metrics = Metrics::new();
        let verdict = gateway.classify_with_local_llm(&meta(), &metrics).await;
        assert_eq!(verdict, ClassifierVerdict::Inconclusive);
        assert_eq!(
            metrics.snapshot().counters.get("local_llm_errors_unexpected_response"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn local_llm_transport_error_is_inconclusive_and_counted() {
        let gateway = ClassifierGateway::new(config_with_llm("http://127.0.0.1:1".into()));
        let metrics = Metrics::new();
        let verdict = gateway.classify_with_local_llm(&meta(), &metrics).await;
        assert_eq!(verdict, ClassifierVerdict::Inconclusive);
        assert!(metrics.snapshot().counters.get("local_llm_errors_request").is_some());
    }

    #[tokio::test]
    async fn unconfigured_sinks_are_inconclusive_without_a_call() {
        let gateway = ClassifierGateway::new(ClassifierConfig {
            local_llm_api_url: None,
            local_llm_model: "llama3:latest".into(),
            local_llm_timeout: Duration::from_secs(5),
            external_api_url: None,
            external_api_key: None,
            external_api_timeout: Duration::from_secs(5),
            model_inference_url: None,
        });
        let metrics = Metrics::new();
        assert_eq!(gateway.classify(&meta(), &metrics).await, ClassifierVerdict::Inconclusive);
    }

    #[tokio::test]
    async fn external_api_is_bot_field_maps_to_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/check")).respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"is_bot": true})),
        ).mount(&server).await;

        let mut cfg = config_with_llm("http://127.0.0.1:1".into());
        cfg.external_api_url = Some(format!("{}/check", server.uri()));
        let gateway = ClassifierGateway::new(cfg);
        let metrics = Metrics::new();
        let verdict = gateway.classify_with_external_api(&meta(), &metrics).await;
        assert_eq!(verdict, ClassifierVerdict::Bot);
    }
}
