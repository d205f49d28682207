//! Scorer — combines the rule heuristic and the optional model probability
//! into a single composite score in `[0, 1]`, per SPEC_FULL.md §4.5.

use crate::config::{ScoringConfig, UaListsConfig};
use crate::model::{FrequencyRecord, RequestMetadata};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub rule_score: f64,
    pub model_score: Option<f64>,
    pub combined_score: f64,
}

fn ua_matches(ua_lower: &str, list: &[String]) -> bool {
    list.iter().any(|needle| ua_lower.contains(needle.as_str()))
}

/// Weighted rule score, exact weights per SPEC_FULL.md §4.5.
pub fn rule_score(meta: &RequestMetadata, freq: &FrequencyRecord, lists: &UaListsConfig, robots_disallowed: bool) -> f64 {
    let ua_lower = meta.user_agent.to_ascii_lowercase();
    let is_known_benign = ua_matches(&ua_lower, &lists.known_benign_crawlers);
    let is_known_bad = ua_matches(&ua_lower, &lists.known_bad);

    let mut score = 0.0;
    if is_known_bad && !is_known_benign {
        score += 0.7;
    }
    if meta.user_agent.is_empty() {
        score += 0.5;
    }
    if robots_disallowed && !is_known_benign {
        score += 0.6;
    }
    if freq.request_count > 60 {
        score += 0.3;
    } else if freq.request_count > 30 {
        score += 0.1;
    }
    if freq.time_since_last_sec != -1.0 && freq.time_since_last_sec < 0.3 {
        score += 0.2;
    }
    if is_known_benign {
        score -= 0.5;
    }
    score.clamp(0.0, 1.0)
}

/// Fold the rule score with an optional model probability.
pub fn combine(rule_score: f64, model_score: Option<f64>) -> f64 {
    let combined = match model_score {
        Some(model) => 0.3 * rule_score + 0.7 * model,
        None => rule_score,
    };
    combined.clamp(0.0, 1.0)
}

pub fn score(
    meta: &RequestMetadata,
    freq: &FrequencyRecord,
    config: &ScoringConfig,
    robots_disallowed: bool,
    model_score: Option<f64>,
) -> ScoreBreakdown {
    let rule = rule_score(meta, freq, &config.ua_lists, robots_disallowed);
    let combined_score = combine(rule, model_score);
    ScoreBreakdown {
        rule_score: rule,
        model_score,
        combined_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Headers;
    use std::collections::HashMap;

    fn lists() -> UaListsConfig {
        UaListsConfig {
            known_bad: vec!["python-requests".into(), "curl".into()],
            known_benign_crawlers: vec!["googlebot".into()],
        }
    }

    fn meta(ua: &str, path: &str) -> RequestMetadata {
        RequestMetadata {
            source_address: "1.2.3.4".into(),
            user_agent: ua.into(),
            path: path.into(),
            method: "GET".into(),
            referer: String::new(),
            status_code: None,
            bytes_sent: None,
            headers: Headers(HashMap::new()),
            timestamp: "2024-01-15T10:30:00Z".into(),
            source: "proxy".into(),
        }
    }

    #[test]
    fn composite_score_always_in_unit_interval() {
        let freq = FrequencyRecord { request_count: 1000, time_since_last_sec: 0.01 };
        let m = meta("python-requests/2.31 curl", "/wp-login.php");
        let breakdown = score(&m, &freq, &ScoringConfig {
            frequency_window_seconds: 300,
            heuristic_threshold_low: 0.3,
            heuristic_threshold_medium: 0.6,
            heuristic_threshold_high: 0.8,
            ua_lists: lists(),
        }, true, Some(1.5));
        assert!((0.0..=1.0).contains(&breakdown.combined_score));
    }

    #[test]
    fn known_benign_crawler_at_root_scores_below_low_threshold() {
        let freq = FrequencyRecord::default();
        let m = meta("Googlebot/2.1 (+http://www.google.com/bot.html)", "/");
        let breakdown = score(&m, &freq, &ScoringConfig {
            frequency_window_seconds: 300,
            heuristic_threshold_low: 0.3,
            heuristic_threshold_medium: 0.6,
            heuristic_threshold_high: 0.8,
            ua_lists: lists(),
        }, false, None);
        assert!(breakdown.combined_score < 0.3, "got {}", breakdown.combined_score);
    }

    #[test]
    fn obvious_bot_scores_high() {
        let freq = FrequencyRecord::default();
        let m = meta("python-requests/2.31", "/wp-login.php");
        let breakdown = score(&m, &freq, &ScoringConfig {
            frequency_window_seconds: 300,
            heuristic_threshold_low: 0.3,
            heuristic_threshold_medium: 0.6,
            heuristic_threshold_high: 0.8,
            ua_lists: lists(),
        }, true, None);
        assert!(breakdown.combined_score >= 0.8, "got {}", breakdown.combined_score);
    }

    #[test]
    fn model_absent_falls_back_to_rule_only() {
        assert_eq!(combine(0.42, None), 0.42);
    }

    #[test]
    fn model_present_weights_model_more_heavily() {
        let combined = combine(0.1, Some(0.7));
        assert!((combined - 0.52).abs() < 1e-9, "got {combined}");
    }

    #[test]
    fn empty_ua_adds_half_point() {
        let freq = FrequencyRecord::default();
        let m = meta("", "/");
        let s = rule_score(&m, &freq, &lists(), false);
        assert!((s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn high_frequency_adds_thirty_points() {
        let freq = FrequencyRecord { request_count: 61, time_since_last_sec: -1.0 };
        let m = meta("Mozilla/5.0", "/");
        let s = rule_score(&m, &freq, &lists(), false);
        assert!((s - 0.3).abs() < 1e-9);
    }

    #[test]
    fn moderate_frequency_adds_ten_points() {
        let freq = FrequencyRecord { request_count: 31, time_since_last_sec: -1.0 };
        let m = meta("Mozilla/5.0", "/");
        let s = rule_score(&m, &freq, &lists(), false);
        assert!((s - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rapid_inter_arrival_adds_two_tenths() {
        let freq = FrequencyRecord { request_count: 0, time_since_last_sec: 0.1 };
        let m = meta("Mozilla/5.0", "/");
        let s = rule_score(&m, &freq, &lists(), false);
        assert!((s - 0.2).abs() < 1e-9);
    }
}
