//! Shared library for the anti-scraping defense pipeline.
//!
//! Three binaries build on this crate: the escalation engine, the webhook
//! receiver, and the tarpit responder. Each owns its own `main.rs`-equivalent
//! under `src/bin/`, wiring together the pieces exposed here into an axum
//! `Router` bound to its own port.

pub mod alerts;
pub mod classifier;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod features;
pub mod frequency;
pub mod kv;
pub mod metrics;
pub mod model;
pub mod robots;
pub mod scorer;
pub mod tarpit;
pub mod webhook;

pub mod api {
    pub mod health;
    pub mod request_id;
}
