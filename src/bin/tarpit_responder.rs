//! Tarpit Responder service — `GET /tarpit`, `GET /tarpit/{*path}`,
//! `GET /health`, `GET /`, per SPEC_FULL.md §4.11.
//!
//! Slow-streams a deceptive page to a source already flagged upstream,
//! re-escalates the hit, and enforces a per-source hop cap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use ai_defense_core::api::request_id::request_id_middleware;
use ai_defense_core::config::{Config, TarpitStrategy};
use ai_defense_core::eventlog::EventLog;
use ai_defense_core::kv::{BlocklistStore, HopStore, TarpitFlagStore};
use ai_defense_core::metrics::Metrics;
use ai_defense_core::model::{Headers, RequestMetadata};
use ai_defense_core::tarpit::{self, MarkovModel};

const ESCALATE_TIMEOUT: Duration = Duration::from_secs(10);

struct AppState {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    hops: HopStore,
    blocklist: BlocklistStore,
    tarpit_flags: TarpitFlagStore,
    honeypot_log: Arc<EventLog>,
    markov_model: MarkovModel,
    http_client: reqwest::Client,
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
    let port: u16 = std::env::var("TARPIT_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8001);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    let log_dir = std::env::var("EVENT_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let honeypot_log = Arc::new(EventLog::new(format!("{log_dir}/honeypot_hits.log")));

    let markov_model = match &config.tarpit.markov_corpus_path {
        Some(path) => MarkovModel::load(path),
        None => MarkovModel::default_model(),
    };

    let state = Arc::new(AppState {
        hops: HopStore::new(config.redis.hops_url.clone(), config.tarpit.hop_ttl_seconds),
        blocklist: BlocklistStore::new(config.redis.blocklist_url.clone()),
        tarpit_flags: TarpitFlagStore::new(config.redis.flags_url.clone()),
        http_client: reqwest::Client::new(),
        metrics: Arc::new(Metrics::new()),
        markov_model,
        honeypot_log,
        config: Arc::new(config),
    });

    info!(%addr, "tarpit responder listening");
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => { result?; }
        _ = shutdown_signal() => { info!("shutdown signal received"); }
    }

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/healthz", get(ai_defense_core::api::health::healthz))
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .route(
            "/tarpit",
            get(tarpit_handler).post(tarpit_handler).head(tarpit_handler),
        )
        .route(
            "/tarpit/{*path}",
            get(tarpit_handler).post(tarpit_handler).head(tarpit_handler),
        )
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

async fn landing() -> impl IntoResponse {
    (StatusCode::OK, "Service operational.")
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let redis_hops_connected = state.hops.ping().await;
    let redis_blocklist_connected = state.blocklist.ping().await;
    let markov_generator_available = true;

    let all_ok = redis_hops_connected && redis_blocklist_connected && markov_generator_available;
    let status = if all_ok { "ok" } else { "error" };
    let code = if all_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        code,
        Json(json!({
            "status": status,
            "redis_hops_connected": redis_hops_connected,
            "redis_blocklist_connected": redis_blocklist_connected,
            "markov_generator_available": markov_generator_available,
        })),
    )
}

fn extract_metadata(headers: &HeaderMap, method: &str, path: &str, addr: SocketAddr) -> RequestMetadata {
    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");

    let source_address = header_value("x-forwarded-for")
        .split(',')
        .next()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string());

    let mut header_map = std::collections::HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }

    RequestMetadata {
        source_address,
        user_agent: header_value("user-agent").to_string(),
        path: path.to_string(),
        method: method.to_string(),
        referer: header_value("referer").to_string(),
        status_code: None,
        bytes_sent: None,
        headers: Headers(header_map),
        timestamp: Utc::now().to_rfc3339(),
        source: "tarpit_api".to_string(),
    }
}

/// Per-request algorithm from spec.md §4.11.
async fn tarpit_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let meta = extract_metadata(req.headers(), req.method().as_str(), req.uri().path(), addr);

    let hop_count = match state.hops.increment(&meta.source_address).await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, source = %meta.source_address, "hop counter increment failed");
            state.metrics.incr(&format!("redis_errors_hops_{}", e.kind()));
            0
        }
    };

    if state.config.tarpit.hop_limit_enabled && hop_count > state.config.tarpit.max_hops as u64 {
        if let Err(e) = state.blocklist.add(&meta.source_address).await {
            warn!(error = %e, source = %meta.source_address, "blocklist add on hop-limit exceed failed");
        }
        state
            .honeypot_log
            .log_event(
                "HOP_LIMIT_EXCEEDED",
                json!({ "ip": meta.source_address, "hop_count": hop_count }),
            )
            .await;
        state.metrics.incr("tarpit_hop_limit_exceeded");
        return (StatusCode::FORBIDDEN, "Access Denied").into_response();
    }

    state
        .honeypot_log
        .log_event(
            "HONEYPOT_HIT",
            json!({
                "ip": meta.source_address,
                "path": meta.path,
                "user_agent": meta.user_agent,
                "hop_count": hop_count,
            }),
        )
        .await;

    if let Err(e) = state
        .tarpit_flags
        .set(&meta.source_address, &meta.timestamp, state.config.tarpit.tarpit_flag_ttl_seconds)
        .await
    {
        warn!(error = %e, source = %meta.source_address, "tarpit flag set failed");
        state.metrics.incr(&format!("redis_errors_tarpit_flag_{}", e.kind()));
    }

    re_escalate(&state, &meta).await;

    state.metrics.incr("tarpit_hits");

    let seed = format!("{}-{}", meta.source_address, meta.path);
    let html = match state.config.tarpit.content_strategy {
        TarpitStrategy::Markov => {
            tarpit::generate_markov_page(&state.markov_model, &seed, state.config.tarpit.enable_fingerprinting)
        }
        TarpitStrategy::Labyrinth => tarpit::generate_labyrinth_page(
            &seed,
            state.config.tarpit.labyrinth_depth,
            state.config.tarpit.enable_fingerprinting,
        ),
    };

    let lines: Vec<String> = html.lines().map(str::to_string).collect();
    let body = axum::body::Body::from_stream(stream_lines(
        lines,
        state.config.tarpit.min_stream_delay_sec,
        state.config.tarpit.max_stream_delay_sec,
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "stream build failed").into_response())
}

/// POST the same metadata to the Escalation Engine. Errors are logged but
/// never abort the tarpit response, per spec step 5.
async fn re_escalate(state: &Arc<AppState>, meta: &RequestMetadata) {
    let result = state
        .http_client
        .post(state.config.tarpit.escalation_endpoint.as_str())
        .json(meta)
        .timeout(ESCALATE_TIMEOUT)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => {
            warn!(status = %resp.status(), "re-escalation returned non-2xx");
            state.metrics.incr("tarpit_errors_escalation");
        }
        Err(e) => {
            warn!(error = %e, "re-escalation request failed");
            state.metrics.incr("tarpit_errors_escalation");
        }
    }
}

/// Emit `lines` one at a time, sleeping a uniformly-distributed delay in
/// `[min_delay_sec, max_delay_sec]` before every line after the first.
fn stream_lines(
    lines: Vec<String>,
    min_delay_sec: f64,
    max_delay_sec: f64,
) -> impl Stream<Item = Result<Bytes, anyhow::Error>> {
    let lines = Arc::new(lines);
    futures_util::stream::unfold(0usize, move |idx| {
        let lines = Arc::clone(&lines);
        async move {
            if idx >= lines.len() {
                return None;
            }
            if idx > 0 {
                let delay = rand::thread_rng().gen_range(min_delay_sec..=max_delay_sec);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            let mut line = lines[idx].clone();
            line.push('\n');
            Some((Ok(Bytes::from(line)), idx + 1))
        }
    })
    .boxed()
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
    let port = std::env::var("TARPIT_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8001);
    let url = format!("http://127.0.0.1:{port}/healthz");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_metadata_prefers_x_forwarded_for_over_socket_addr() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        let addr: SocketAddr = "127.0.0.1:54321".parse().unwrap();
        let meta = extract_metadata(&headers, "GET", "/tarpit/abc123", addr);
        assert_eq!(meta.source_address, "9.9.9.9");
        assert_eq!(meta.user_agent, "curl/8.0");
        assert_eq!(meta.path, "/tarpit/abc123");
        assert_eq!(meta.source, "tarpit_api");
    }

    #[test]
    fn extract_metadata_falls_back_to_socket_addr_without_forwarded_header() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "203.0.113.5:1234".parse().unwrap();
        let meta = extract_metadata(&headers, "GET", "/tarpit", addr);
        assert_eq!(meta.source_address, "203.0.113.5");
    }
}
