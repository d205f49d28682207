//! Escalation Engine service — `POST /escalate`, `GET /metrics`, `GET /healthz`.
//!
//! Orchestrates frequency read → feature extract → scoring → optional
//! classifier-gateway consultation → optional webhook forward, per
//! SPEC_FULL.md §4.8.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use ai_defense_core::api::request_id::request_id_middleware;
use ai_defense_core::classifier::ClassifierGateway;
use ai_defense_core::config::Config;
use ai_defense_core::features;
use ai_defense_core::frequency::FrequencyTracker;
use ai_defense_core::kv::FrequencyStore;
use ai_defense_core::metrics::Metrics;
use ai_defense_core::model::{ClassifierVerdict, FeatureMap, RequestMetadata};
use ai_defense_core::robots::RobotsRules;
use ai_defense_core::scorer;
use ai_defense_core::webhook::WebhookForwarder;

const MODEL_INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);

struct AppState {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    frequency: FrequencyTracker,
    robots: RobotsRules,
    classifier: ClassifierGateway,
    webhook: WebhookForwarder,
    model_client: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_defense_core=info,tower_http=warn".into()),
        )
        .init();

    let config = Config::load()?;

    // Feature key set self-check: the scorer's model half assumes the
    // extractor's key set is stable across the process lifetime. A mismatch
    // here would mean the extractor changed shape without a corresponding
    // config bump — fail fast rather than silently scoring garbage.
    let probe_features = sample_features_for_startup_check(&config);
    features::validate_key_set(&probe_features, config.scoring.frequency_window_seconds)
        .expect("feature extractor key set must match the expected training-time set");

    let robots = RobotsRules::load(&config.robots_txt_path);
    if robots.is_empty() {
        warn!(path = %config.robots_txt_path, "robots.txt not found or empty — path_disallowed will always be 0");
    }

    let port: u16 = std::env::var("ESCALATION_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8003);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    let state = Arc::new(AppState {
        frequency: FrequencyTracker::new(FrequencyStore::new(
            config.redis.frequency_url.clone(),
            config.scoring.frequency_window_seconds,
        )),
        classifier: ClassifierGateway::new(config.classifier.clone()),
        webhook: WebhookForwarder::new(config.forwarding.webhook_url.clone()),
        model_client: reqwest::Client::new(),
        metrics: Arc::new(Metrics::new()),
        robots,
        config: Arc::new(config),
    });

    info!(%addr, "escalation engine listening");
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => { result?; }
        _ = shutdown_signal() => { info!("shutdown signal received"); }
    }

    Ok(())
}

fn sample_features_for_startup_check(config: &Config) -> FeatureMap {
    let meta = RequestMetadata {
        source_address: "0.0.0.0".into(),
        user_agent: String::new(),
        path: "/".into(),
        method: "GET".into(),
        referer: String::new(),
        status_code: None,
        bytes_sent: None,
        headers: Default::default(),
        timestamp: "1970-01-01T00:00:00Z".into(),
        source: "startup_check".into(),
    };
    let freq = Default::default();
    let robots = RobotsRules::default();
    features::extract(
        &meta,
        &freq,
        &robots,
        &config.scoring.ua_lists,
        config.scoring.frequency_window_seconds,
    )
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(ai_defense_core::api::health::healthz))
        .route("/escalate", post(escalate))
        .route("/metrics", get(metrics_snapshot))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}

async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// `POST /escalate` — see SPEC_FULL.md §4.8 for the full decision table.
async fn escalate(State(state): State<Arc<AppState>>, body: Json<Value>) -> impl IntoResponse {
    let meta = match validate_request(&body.0) {
        Ok(meta) => meta,
        Err(msg) => {
            state.metrics.incr("escalation_errors_validation");
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "status": "error", "detail": msg })))
                .into_response();
        }
    };

    match run_escalation(&state, meta).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            warn!(error = %e, "unexpected error during escalation");
            state.metrics.incr("escalation_errors_unexpected");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "processed",
                    "action": "internal_server_error",
                    "is_bot_decision": Value::Null,
                    "score": -1.0,
                })),
            )
                .into_response()
        }
    }
}

fn validate_request(body: &Value) -> Result<RequestMetadata, String> {
    let obj = body.as_object().ok_or_else(|| "request body must be a JSON object".to_string())?;

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing required field: timestamp".to_string())?;
    let source_address = obj
        .get("source_address")
        .or_else(|| obj.get("ip"))
        .and_then(Value::as_str)
        .ok_or_else(|| "missing required field: source_address".to_string())?;
    let source = obj
        .get("source")
        .or_else(|| obj.get("source_label"))
        .and_then(Value::as_str)
        .ok_or_else(|| "missing required field: source_label".to_string())?;

    serde_json::from_value::<RequestMetadata>(body.clone())
        .map(|mut meta| {
            meta.timestamp = timestamp.to_string();
            meta.source_address = source_address.to_string();
            meta.source = source.to_string();
            meta
        })
        .map_err(|e| format!("malformed request body: {e}"))
}

async fn run_escalation(state: &Arc<AppState>, meta: RequestMetadata) -> anyhow::Result<Value> {
    let now_unix = chrono::Utc::now().timestamp() as f64
        + (chrono::Utc::now().timestamp_subsec_micros() as f64 / 1_000_000.0);

    let freq = state
        .frequency
        .record_and_query(&meta.source_address, now_unix, &state.metrics)
        .await;

    let robots_disallowed = state.robots.is_disallowed(&meta.path);
    let features = features::extract(
        &meta,
        &freq,
        &state.robots,
        &state.config.scoring.ua_lists,
        state.config.scoring.frequency_window_seconds,
    );

    let model_score = fetch_model_score(state, &features).await;
    let breakdown = scorer::score(&meta, &freq, &state.config.scoring, robots_disallowed, model_score);
    let combined = breakdown.combined_score;

    let thresholds = &state.config.scoring;
    let (action, is_bot_decision, reason) = if combined >= thresholds.heuristic_threshold_high {
        (
            "webhook_triggered_high_score",
            Some(true),
            Some(format!("High Combined Score ({combined:.2})")),
        )
    } else if combined >= thresholds.heuristic_threshold_low {
        classify_medium_confidence(state, &meta).await
    } else {
        ("classified_human_low_score", Some(false), None)
    };

    if let Some(reason) = &reason {
        state.webhook.forward(&meta, reason, &state.metrics).await;
    }

    state.metrics.incr(&format!("escalation_outcome_{action}"));

    Ok(json!({
        "status": "processed",
        "action": action,
        "is_bot_decision": is_bot_decision,
        "score": combined,
    }))
}

async fn classify_medium_confidence(
    state: &Arc<AppState>,
    meta: &RequestMetadata,
) -> (&'static str, Option<bool>, Option<String>) {
    let local = state.classifier.classify_with_local_llm(meta, &state.metrics).await;
    match local {
        ClassifierVerdict::Bot => {
            return ("webhook_triggered_local_llm", Some(true), Some("Local LLM Classification".to_string()));
        }
        ClassifierVerdict::Benign => return ("classified_human_local_llm", Some(false), None),
        ClassifierVerdict::Inconclusive => {}
    }

    if state.config.classifier.external_api_url.is_some() {
        match state.classifier.classify_with_external_api(meta, &state.metrics).await {
            ClassifierVerdict::Bot => {
                return (
                    "webhook_triggered_external_api",
                    Some(true),
                    Some("External API Classification".to_string()),
                )
            }
            ClassifierVerdict::Benign => return ("classified_human_external_api", Some(false), None),
            ClassifierVerdict::Inconclusive => return ("external_api_inconclusive", None, None),
        }
    }

    ("local_llm_inconclusive", None, None)
}

/// Call the out-of-process inference service at `MODEL_INFERENCE_URL`, per
/// SPEC_FULL.md §9's resolution of the classifier-artifact Open Question.
/// Any failure leaves the model score unset and increments `model_errors_*`.
async fn fetch_model_score(state: &Arc<AppState>, features: &FeatureMap) -> Option<f64> {
    let url = state.config.classifier.model_inference_url.as_deref()?;

    let result = state
        .model_client
        .post(url)
        .json(&json!({ "features": features }))
        .timeout(MODEL_INFERENCE_TIMEOUT)
        .send()
        .await;

    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            state.metrics.incr("model_errors_timeout");
            return None;
        }
        Err(_) => {
            state.metrics.incr("model_errors_request");
            return None;
        }
    };

    if !response.status().is_success() {
        state.metrics.incr("model_errors_request");
        return None;
    }

    match response.json::<Value>().await {
        Ok(body) => match body.get("p_bot").and_then(Value::as_f64) {
            Some(p_bot) => Some(p_bot.clamp(0.0, 1.0)),
            None => {
                state.metrics.incr("model_errors_unexpected_response");
                None
            }
        },
        Err(_) => {
            state.metrics.incr("model_errors_response_decode");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = terminate => {} }
}

async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("ESCALATION_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8003);
    let url = format!("http://127.0.0.1:{port}/healthz");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_request_rejects_missing_timestamp() {
        let body = json!({ "source_address": "1.2.3.4", "source": "proxy", "path": "/" });
        assert!(validate_request(&body).is_err());
    }

    #[test]
    fn validate_request_rejects_missing_source_address() {
        let body = json!({ "timestamp": "2024-01-15T10:30:00Z", "source": "proxy" });
        assert!(validate_request(&body).is_err());
    }

    #[test]
    fn validate_request_rejects_missing_source_label() {
        let body = json!({ "timestamp": "2024-01-15T10:30:00Z", "source_address": "1.2.3.4" });
        assert!(validate_request(&body).is_err());
    }

    #[test]
    fn validate_request_accepts_minimal_valid_body() {
        let body = json!({
            "timestamp": "2024-01-15T10:30:00Z",
            "source_address": "1.2.3.4",
            "source": "proxy",
        });
        let meta = validate_request(&body).expect("should validate");
        assert_eq!(meta.source_address, "1.2.3.4");
        assert_eq!(meta.source, "proxy");
        assert_eq!(meta.path, "");
    }

    #[test]
    fn validate_request_accepts_legacy_ip_and_source_label_aliases() {
        let body = json!({
            "timestamp": "2024-01-15T10:30:00Z",
            "ip": "5.6.7.8",
            "source_label": "tarpit_api",
        });
        let meta = validate_request(&body).expect("should validate");
        assert_eq!(meta.source_address, "5.6.7.8");
        assert_eq!(meta.source, "tarpit_api");
    }
}
