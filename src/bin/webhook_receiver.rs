//! Webhook Receiver service — `POST /analyze`, `GET /health`, `GET /healthz`.
//!
//! Consumes escalation verdicts, maintains the shared blocklist, and fans
//! out alerts with severity gating, per SPEC_FULL.md §4.9.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use ai_defense_core::alerts::AlertDispatcher;
use ai_defense_core::api::request_id::request_id_middleware;
use ai_defense_core::config::Config;
use ai_defense_core::eventlog::EventLog;
use ai_defense_core::kv::BlocklistStore;
use ai_defense_core::metrics::Metrics;
use ai_defense_core::model::RequestMetadata;

/// Reason substrings that qualify a source for auto-blocklisting, per
/// spec.md §4.5's exact list.
const QUALIFYING_REASONS: &[&str] = &[
    "High Combined Score",
    "Local LLM Classification",
    "External API Classification",
    "High Heuristic Score",
    "Honeypot_Hit",
];

struct AppState {
    metrics: Arc<Metrics>,
    blocklist: BlocklistStore,
    alerts: AlertDispatcher,
    block_event_log: Arc<EventLog>,
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
    let port: u16 = std::env::var("RECEIVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8000);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    let log_dir = std::env::var("EVENT_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let block_event_log = Arc::new(EventLog::new(format!("{log_dir}/block_events.log")));
    let alert_log = Arc::new(EventLog::new(format!("{log_dir}/alert_events.log")));

    let state = Arc::new(AppState {
        blocklist: BlocklistStore::new(config.redis.blocklist_url.clone()),
        alerts: AlertDispatcher::new(config.alert.clone(), alert_log),
        metrics: Arc::new(Metrics::new()),
        block_event_log,
    });

    info!(%addr, "webhook receiver listening");
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => { result?; }
        _ = shutdown_signal() => { info!("shutdown signal received"); }
    }

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(ai_defense_core::api::health::healthz))
        .route("/health", get(health))
        .route("/analyze", post(analyze))
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

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let blocklist_connected = state.blocklist.ping().await;
    let status = if blocklist_connected { "ok" } else { "error" };
    let code = if blocklist_connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "status": status, "blocklist_connected": blocklist_connected })))
}

fn qualifying_reason(reason: &str) -> bool {
    QUALIFYING_REASONS.iter().any(|needle| reason.contains(needle))
}

/// `POST /analyze` — see spec.md §4.9's state machine.
async fn analyze(State(state): State<Arc<AppState>>, body: Json<Value>) -> impl IntoResponse {
    let (reason, meta) = match parse_verdict(&body.0) {
        Ok(v) => v,
        Err(msg) => {
            state.metrics.incr("receiver_errors_validation");
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "status": "error", "detail": msg })))
                .into_response();
        }
    };

    state
        .block_event_log
        .log_event(
            "VERDICT_RECEIVED",
            json!({ "reason": reason, "ip": meta.source_address }),
        )
        .await;

    let qualifies = qualifying_reason(&reason);
    let is_unknown = meta.source_address == "unknown";

    let mut action = if !qualifies {
        "blocklist_skipped_criteria_not_met".to_string()
    } else if is_unknown {
        "blocklist_skipped_unknown_ip".to_string()
    } else {
        match state.blocklist.add(&meta.source_address).await {
            Ok(()) => {
                state
                    .block_event_log
                    .log_event("BLOCKLIST_ADD", json!({ "ip": meta.source_address, "reason": reason }))
                    .await;
                "ip_blocklisted".to_string()
            }
            Err(e) => {
                warn!(error = %e, ip = %meta.source_address, "blocklist add failed");
                state.metrics.incr(&format!("receiver_errors_blocklist_{}", e.kind()));
                "blocklist_failed".to_string()
            }
        }
    };

    state.metrics.incr(&format!("receiver_outcome_{action}"));

    match state.alerts.maybe_dispatch(&reason, &meta, &state.metrics).await {
        ai_defense_core::alerts::DispatchOutcome::NotAttempted => {}
        ai_defense_core::alerts::DispatchOutcome::Dispatched => action.push_str("_alert_checked"),
        ai_defense_core::alerts::DispatchOutcome::Failed => action.push_str("_alert_error"),
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "action_taken": action,
            "ip_processed": meta.source_address,
        })),
    )
        .into_response()
}

fn parse_verdict(body: &Value) -> Result<(String, RequestMetadata), String> {
    let obj = body.as_object().ok_or_else(|| "request body must be a JSON object".to_string())?;
    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing required field: reason".to_string())?
        .to_string();
    let details = obj.get("details").ok_or_else(|| "missing required field: details".to_string())?;
    let meta: RequestMetadata =
        serde_json::from_value(details.clone()).map_err(|e| format!("malformed details: {e}"))?;
    Ok((reason, meta))
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
    let port = std::env::var("RECEIVER_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8000);
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
    fn qualifying_reason_matches_exact_substrings() {
        assert!(qualifying_reason("High Combined Score (0.95)"));
        assert!(qualifying_reason("Honeypot_Hit"));
        assert!(!qualifying_reason("classified_human_low_score"));
    }

    #[test]
    fn parse_verdict_rejects_missing_reason() {
        let body = json!({ "details": { "timestamp": "t", "source_address": "1.2.3.4", "source": "proxy" } });
        assert!(parse_verdict(&body).is_err());
    }

    #[test]
    fn parse_verdict_rejects_missing_details() {
        let body = json!({ "reason": "High Combined Score (0.9)" });
        assert!(parse_verdict(&body).is_err());
    }

    #[test]
    fn parse_verdict_accepts_well_formed_body() {
        let body = json!({
            "reason": "High Combined Score (0.9)",
            "details": {
                "timestamp": "2024-01-15T10:30:00Z",
                "source_address": "1.2.3.4",
                "source": "escalation_engine",
            },
        });
        let (reason, meta) = parse_verdict(&body).expect("should parse");
        assert_eq!(reason, "High Combined Score (0.9)");
        assert_eq!(meta.source_address, "1.2.3.4");
    }

    #[test]
    fn severity_of_matches_honeypot_hit() {
        assert_eq!(ai_defense_core::alerts::severity_of("Honeypot_Hit"), 2);
    }
}
