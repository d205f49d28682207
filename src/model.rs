//! Wire and domain types shared by all three services.
//!
//! These mirror the data model every component reads or writes: the metadata
//! a request carries through the pipeline, the verdict an escalation produces,
//! and the records persisted in the shared KV state plane.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Case-insensitive header map — keys are lower-cased on insert.
///
/// Deserializes from a plain JSON object; `Request.headers` in upstream
/// frameworks is already case-insensitive, but `HashMap<String, String>` is
/// not, so normalization happens once at construction time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Headers(pub HashMap<String, String>);

impl Headers {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: HashMap<String, String> = HashMap::deserialize(deserializer)?;
        let normalized = raw
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Ok(Headers(normalized))
    }
}

/// A single request observed anywhere in the pipeline.
///
/// Accepts the legacy `ip` field name (used throughout the upstream system
/// this was ported from) as an alias for `source_address`, so callers that
/// speak either wire shape are satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(alias = "ip")]
    pub source_address: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub referer: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub bytes_sent: Option<u64>,
    #[serde(default)]
    pub headers: Headers,
    pub timestamp: String,
    /// Which upstream produced this request (`"tarpit_api"`, `"proxy"`, ...).
    /// Mandatory per SPEC_FULL.md §4.8's validation rule; accepts the
    /// `source_label` wire name `original_source` uses in some call sites.
    #[serde(alias = "source_label")]
    pub source: String,
}

/// The sliding-window frequency facts the frequency tracker hands back to the
/// feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrequencyRecord {
    /// Requests seen in the window *before* this one was added.
    pub request_count: u64,
    /// Seconds since the previous request from this source, or `-1.0` when
    /// there is no prior request in the window.
    pub time_since_last_sec: f64,
}

/// A derived `Default` would zero `time_since_last_sec`, which collides with
/// `0.0` being a real (very-rapid-inter-arrival) value. The degrade-on-error
/// path and "no prior request" case both mean the same thing — no signal —
/// so both must produce the `-1.0` sentinel, never `0.0`.
impl Default for FrequencyRecord {
    fn default() -> Self {
        Self { request_count: 0, time_since_last_sec: -1.0 }
    }
}

/// The flat key→value feature bag the scorer and classifier gateway consume.
///
/// Values are a small closed set of JSON-representable scalars rather than an
/// open `serde_json::Value`, since every key is produced by the feature
/// extractor and consumed by name — a sum type documents the shape without
/// giving up `serde_json::Value`'s convenience for the few string/number/bool
/// cases actually needed.
pub type FeatureMap = HashMap<String, serde_json::Value>;

/// Tri-state outcome of a classifier gateway consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierVerdict {
    Bot,
    Benign,
    Inconclusive,
}
