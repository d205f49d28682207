//! Feature extractor — pure function from request metadata + frequency facts
//! to the closed [`FeatureMap`] key set the scorer's model half expects.
//!
//! Every key enumerated in SPEC_FULL.md §4.3 is populated on every call,
//! using the spec's sentinel values (`-1` for missing numerics, `0`/`1` for
//! absent booleans, `"Unknown"` for categorical strings) rather than
//! omitting a key — the key set must match training time byte-for-byte.

use chrono::DateTime;
use serde_json::json;
use woothee::parser::Parser;

use crate::config::{ScoringConfig, UaListsConfig};
use crate::model::{FeatureMap, FrequencyRecord, RequestMetadata};
use crate::robots::RobotsRules;

fn ua_matches(ua_lower: &str, list: &[String]) -> bool {
    list.iter().any(|needle| ua_lower.contains(needle.as_str()))
}

/// Extract the closed feature set for one request.
///
/// `window_seconds` names the `req_freq_{W}s` key; it must match the window
/// the frequency tracker was configured with.
pub fn extract(
    meta: &RequestMetadata,
    freq: &FrequencyRecord,
    robots: &RobotsRules,
    ua_lists: &UaListsConfig,
    window_seconds: u64,
) -> FeatureMap {
    let mut f: FeatureMap = FeatureMap::new();

    let ua = meta.user_agent.as_str();
    let ua_lower = ua.to_ascii_lowercase();
    let path = meta.path.as_str();

    // --- request shape ---
    f.insert("ua_length".into(), json!(ua.chars().count()));
    f.insert(
        "status_code".into(),
        json!(meta.status_code.unwrap_or(0)),
    );
    f.insert("bytes_sent".into(), json!(meta.bytes_sent.unwrap_or(0)));
    f.insert(
        "http_method".into(),
        json!(if meta.method.is_empty() {
            "UNKNOWN".to_string()
        } else {
            meta.method.clone()
        }),
    );
    f.insert("path_depth".into(), json!(path.matches('/').count()));
    f.insert("path_length".into(), json!(path.chars().count()));
    f.insert("path_is_root".into(), json!(if path == "/" { 1 } else { 0 }));
    f.insert(
        "path_has_docs".into(),
        json!(if path.contains("/docs") { 1 } else { 0 }),
    );
    f.insert(
        "path_is_wp".into(),
        json!(if path.contains("/wp-") || path.contains("/xmlrpc.php") {
            1
        } else {
            0
        }),
    );
    let is_known_benign = ua_matches(&ua_lower, &ua_lists.known_benign_crawlers);
    f.insert(
        "path_disallowed".into(),
        json!(if robots.is_disallowed(path) { 1 } else { 0 }),
    );

    // --- UA heuristics ---
    f.insert(
        "ua_is_known_bad".into(),
        json!(if ua_matches(&ua_lower, &ua_lists.known_bad) { 1 } else { 0 }),
    );
    f.insert("ua_is_known_benign_crawler".into(), json!(if is_known_benign { 1 } else { 0 }));
    f.insert("ua_is_empty".into(), json!(if ua.is_empty() { 1 } else { 0 }));

    insert_ua_parse_features(&mut f, ua, &ua_lower, ua_lists);

    // --- referer ---
    f.insert(
        "referer_is_empty".into(),
        json!(if meta.referer.is_empty() { 1 } else { 0 }),
    );
    let referer_has_domain = url::Url::parse(&meta.referer)
        .map(|u| !u.host_str().unwrap_or("").is_empty())
        .unwrap_or(false);
    f.insert("referer_has_domain".into(), json!(if referer_has_domain { 1 } else { 0 }));

    // --- time ---
    let (hour, dow) = parse_hour_and_dow(&meta.timestamp);
    f.insert("hour_of_day".into(), json!(hour));
    f.insert("day_of_week".into(), json!(dow));

    // --- frequency ---
    f.insert(
        format!("req_freq_{window_seconds}s"),
        json!(freq.request_count),
    );
    f.insert("time_since_last_sec".into(), json!(freq.time_since_last_sec));

    f
}

fn insert_ua_parse_features(
    f: &mut FeatureMap,
    ua: &str,
    ua_lower: &str,
    ua_lists: &UaListsConfig,
) {
    let parser = Parser::new();
    let Some(parsed) = (!ua.is_empty()).then(|| parser.parse(ua)).flatten() else {
        insert_unknown_ua_parse(f, ua_matches(ua_lower, &ua_lists.known_bad));
        return;
    };

    let is_mobile = matches!(parsed.category, "smartphone" | "mobilephone");
    let is_tablet = ua_lower.contains("ipad") || ua_lower.contains("tablet");
    let is_pc = parsed.category == "pc";
    let is_bot = parsed.category == "crawler";

    f.insert("ua_browser_family".into(), json!(non_empty_or_other(parsed.name)));
    f.insert("ua_os_family".into(), json!(non_empty_or_other(parsed.os)));
    f.insert("ua_device_family".into(), json!(non_empty_or_other(parsed.category)));
    f.insert("ua_is_mobile".into(), json!(if is_mobile { 1 } else { 0 }));
    f.insert("ua_is_tablet".into(), json!(if is_tablet { 1 } else { 0 }));
    f.insert("ua_is_pc".into(), json!(if is_pc { 1 } else { 0 }));
    f.insert(
        "ua_is_touch".into(),
        json!(if is_mobile || is_tablet { 1 } else { 0 }),
    );
    f.insert("ua_library_is_bot".into(), json!(if is_bot { 1 } else { 0 }));
}

fn non_empty_or_other(s: &str) -> &str {
    if s.is_empty() {
        "Other"
    } else {
        s
    }
}

fn insert_unknown_ua_parse(f: &mut FeatureMap, mirrors_known_bad: bool) {
    f.insert("ua_browser_family".into(), json!("Unknown"));
    f.insert("ua_os_family".into(), json!("Unknown"));
    f.insert("ua_device_family".into(), json!("Unknown"));
    f.insert("ua_is_mobile".into(), json!(0));
    f.insert("ua_is_tablet".into(), json!(0));
    f.insert("ua_is_pc".into(), json!(0));
    f.insert("ua_is_touch".into(), json!(0));
    f.insert(
        "ua_library_is_bot".into(),
        json!(if mirrors_known_bad { 1 } else { 0 }),
    );
}

fn parse_hour_and_dow(timestamp: &str) -> (i64, i64) {
    let normalized = timestamp.replace('Z', "+00:00");
    match DateTime::parse_from_rfc3339(&normalized) {
        Ok(dt) => (
            dt.format("%H").to_string().parse().unwrap_or(-1),
            dt.format("%u").to_string().parse::<i64>().map(|iso| iso % 7).unwrap_or(-1),
        ),
        Err(_) => (-1, -1),
    }
}

/// The exact feature-map key set, for the byte-for-byte training-time check
/// SPEC_FULL.md §3 requires at scorer startup.
pub fn expected_keys(window_seconds: u64) -> Vec<String> {
    vec![
        "ua_length",
        "status_code",
        "bytes_sent",
        "http_method",
        "path_depth",
        "path_length",
        "path_is_root",
        "path_has_docs",
        "path_is_wp",
        "path_disallowed",
        "ua_is_known_bad",
        "ua_is_known_benign_crawler",
        "ua_is_empty",
        "ua_browser_family",
        "ua_os_family",
        "ua_device_family",
        "ua_is_mobile",
        "ua_is_tablet",
        "ua_is_pc",
        "ua_is_touch",
        "ua_library_is_bot",
        "referer_is_empty",
        "referer_has_domain",
        "hour_of_day",
        "day_of_week",
    ]
    .into_iter()
    .map(String::from)
    .chain(std::iter::once(format!("req_freq_{window_seconds}s")))
    .chain(std::iter::once("time_since_last_sec".to_string()))
    .collect()
}

/// Validate that a feature map produced elsewhere (e.g. echoed back from a
/// model inference service) has exactly the expected key set.
pub fn validate_key_set(features: &FeatureMap, window_seconds: u64) -> Result<(), String> {
    let expected: std::collections::HashSet<String> =
        expected_keys(window_seconds).into_iter().collect();
    let actual: std::collections::HashSet<String> = features.keys().cloned().collect();
    if expected != actual {
        let missing: Vec<_> = expected.difference(&actual).cloned().collect();
        let extra: Vec<_> = actual.difference(&expected).cloned().collect();
        return Err(format!(
            "feature key set mismatch: missing={missing:?} extra={extra:?}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Headers;
    use std::collections::HashMap;

    fn meta(ua: &str, path: &str, referer: &str) -> RequestMetadata {
        RequestMetadata {
            source_address: "1.2.3.4".into(),
            user_agent: ua.into(),
            path: path.into(),
            method: "GET".into(),
            referer: referer.into(),
            status_code: Some(200),
            bytes_sent: Some(512),
            headers: Headers(HashMap::new()),
            timestamp: "2024-01-15T10:30:00Z".into(),
            source: "test".into(),
        }
    }

    #[test]
    fn produces_exactly_the_enumerated_key_set() {
        let rules = RobotsRules::default();
        let lists = crate::config::ScoringConfig {
            frequency_window_seconds: 300,
            heuristic_threshold_low: 0.3,
            heuristic_threshold_medium: 0.6,
            heuristic_threshold_high: 0.8,
            ua_lists: UaListsConfig {
                known_bad: vec!["python-requests".into()],
                known_benign_crawlers: vec!["googlebot".into()],
            },
        };
        let m = meta("python-requests/2.31", "/wp-login.php", "");
        let freq = FrequencyRecord { request_count: 3, time_since_last_sec: 1.5 };
        let features = extract(&m, &freq, &rules, &lists.ua_lists, 300);
        assert!(validate_key_set(&features, 300).is_ok());
    }

    #[test]
    fn is_deterministic() {
        let rules = RobotsRules::default();
        let lists = UaListsConfig {
            known_bad: vec![],
            known_benign_crawlers: vec![],
        };
        let m = meta("Mozilla/5.0", "/", "https://example.com/");
        let freq = FrequencyRecord::default();
        let a = extract(&m, &freq, &rules, &lists, 300);
        let b = extract(&m, &freq, &rules, &lists, 300);
        assert_eq!(a, b);
    }

    #[test]
    fn known_bad_ua_sets_flag() {
        let rules = RobotsRules::default();
        let lists = UaListsConfig {
            known_bad: vec!["python-requests".into()],
            known_benign_crawlers: vec![],
        };
        let m = meta("python-requests/2.31", "/", "");
        let freq = FrequencyRecord::default();
        let features = extract(&m, &freq, &rules, &lists, 300);
        assert_eq!(features["ua_is_known_bad"], json!(1));
    }

    #[test]
    fn empty_ua_sets_empty_flag_and_unknown_parse() {
        let rules = RobotsRules::default();
        let lists = UaListsConfig { known_bad: vec![], known_benign_crawlers: vec![] };
        let m = meta("", "/", "");
        let freq = FrequencyRecord::default();
        let features = extract(&m, &freq, &rules, &lists, 300);
        assert_eq!(features["ua_is_empty"], json!(1));
        assert_eq!(features["ua_browser_family"], json!("Unknown"));
    }

    #[test]
    fn malformed_referer_yields_zero_not_error() {
        let rules = RobotsRules::default();
        let lists = UaListsConfig { known_bad: vec![], known_benign_crawlers: vec![] };
        let m = meta("Mozilla/5.0", "/", "not a url");
        let freq = FrequencyRecord::default();
        let features = extract(&m, &freq, &rules, &lists, 300);
        assert_eq!(features["referer_has_domain"], json!(0));
    }

    #[test]
    fn unparseable_timestamp_yields_sentinel_hour_and_dow() {
        let rules = RobotsRules::default();
        let lists = UaListsConfig { known_bad: vec![], known_benign_crawlers: vec![] };
        let mut m = meta("Mozilla/5.0", "/", "");
        m.timestamp = "not-a-timestamp".into();
        let freq = FrequencyRecord::default();
        let features = extract(&m, &freq, &rules, &lists, 300);
        assert_eq!(features["hour_of_day"], json!(-1));
        assert_eq!(features["day_of_week"], json!(-1));
    }

    #[test]
    fn frequency_features_pass_through() {
        let rules = RobotsRules::default();
        let lists = UaListsConfig { known_bad: vec![], known_benign_crawlers: vec![] };
        let m = meta("Mozilla/5.0", "/", "");
        let freq = FrequencyRecord { request_count: 42, time_since_last_sec: -1.0 };
        let features = extract(&m, &freq, &rules, &lists, 300);
        assert_eq!(features["req_freq_300s"], json!(42));
        assert_eq!(features["time_since_last_sec"], json!(-1.0));
    }
}
