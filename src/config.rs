//! Process configuration, loaded once at startup from the environment.
//!
//! Every service binary calls [`Config::load`] exactly once before opening a
//! listen socket. Secrets are never embedded directly — fields that name a
//! credential store the *name* of an environment variable (or, for SMTP, an
//! optional secret-file path) and resolve it lazily, the same indirection the
//! upstream system this was ported from uses for API keys.

use std::env;
use std::time::Duration;

use serde::Deserialize;

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// User-agent substring lists the scorer and feature extractor both consult.
///
/// Defaults mirror the upstream `KNOWN_BAD_UAS` / `KNOWN_BENIGN_CRAWLERS_UAS`
/// constants; an operator can override either list wholesale via a
/// comma-separated environment variable.
#[derive(Debug, Clone)]
pub struct UaListsConfig {
    pub known_bad: Vec<String>,
    pub known_benign_crawlers: Vec<String>,
}

impl UaListsConfig {
    fn from_env() -> Self {
        let split = |key: &str, default: &[&str]| -> Vec<String> {
            env_var(key)
                .map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
                .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
        };
        Self {
            known_bad: split(
                "KNOWN_BAD_UAS",
                &[
                    "python-requests",
                    "curl",
                    "wget",
                    "scrapy",
                    "java/",
                    "ahrefsbot",
                    "semrushbot",
                    "mj12bot",
                    "dotbot",
                    "petalbot",
                    "bytespider",
                    "gptbot",
                    "ccbot",
                    "claude-web",
                    "google-extended",
                    "dataprovider",
                    "purebot",
                    "scan",
                    "masscan",
                    "zgrab",
                    "nmap",
                ],
            ),
            known_benign_crawlers: split(
                "KNOWN_BENIGN_CRAWLER_UAS",
                &[
                    "googlebot",
                    "bingbot",
                    "slurp",
                    "duckduckbot",
                    "baiduspider",
                    "yandexbot",
                    "googlebot-image",
                ],
            ),
        }
    }
}

/// Frequency-tracker and scoring thresholds shared by the escalation engine.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub frequency_window_seconds: u64,
    pub heuristic_threshold_low: f64,
    pub heuristic_threshold_medium: f64,
    pub heuristic_threshold_high: f64,
    pub ua_lists: UaListsConfig,
}

impl ScoringConfig {
    fn from_env() -> Self {
        Self {
            frequency_window_seconds: env_or("FREQUENCY_WINDOW_SECONDS", 300),
            heuristic_threshold_low: env_or("HEURISTIC_THRESHOLD_LOW", 0.3),
            heuristic_threshold_medium: env_or("HEURISTIC_THRESHOLD_MEDIUM", 0.6),
            heuristic_threshold_high: env_or("HEURISTIC_THRESHOLD_HIGH", 0.8),
            ua_lists: UaListsConfig::from_env(),
        }
    }
}

/// Where (and whether) the classifier gateway's two sinks live.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub local_llm_api_url: Option<String>,
    pub local_llm_model: String,
    pub local_llm_timeout: Duration,
    pub external_api_url: Option<String>,
    pub external_api_key: Option<String>,
    pub external_api_timeout: Duration,
    /// Out-of-process inference service for the pretrained rule+model blend.
    /// `None` means the scorer runs rule-only — see SPEC_FULL.md's
    /// resolution of the classifier-artifact-format Open Question.
    pub model_inference_url: Option<String>,
}

impl ClassifierConfig {
    fn from_env() -> Self {
        Self {
            local_llm_api_url: env_var("LOCAL_LLM_API_URL"),
            local_llm_model: env_var("LOCAL_LLM_MODEL")
                .unwrap_or_else(|| "llama3:latest".to_string()),
            local_llm_timeout: Duration::from_secs_f64(env_or("LOCAL_LLM_TIMEOUT", 45.0)),
            external_api_url: env_var("EXTERNAL_CLASSIFICATION_API_URL"),
            external_api_key: env_var("EXTERNAL_CLASSIFICATION_API_KEY"),
            external_api_timeout: Duration::from_secs_f64(env_or("EXTERNAL_API_TIMEOUT", 15.0)),
            model_inference_url: env_var("MODEL_INFERENCE_URL"),
        }
    }
}

/// Generic webhook the escalation engine forwards suspicious-activity events to.
#[derive(Debug, Clone)]
pub struct ForwardingConfig {
    pub webhook_url: Option<String>,
}

impl ForwardingConfig {
    fn from_env() -> Self {
        Self {
            webhook_url: env_var("ESCALATION_WEBHOOK_URL"),
        }
    }
}

/// How the webhook receiver dispatches alerts once a source is blocklisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertMethod {
    None,
    Webhook,
    Slack,
    Smtp,
}

impl std::str::FromStr for AlertMethod {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "webhook" => Ok(Self::Webhook),
            "slack" => Ok(Self::Slack),
            "smtp" => Ok(Self::Smtp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub method: AlertMethod,
    pub generic_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub slack_username: String,
    pub slack_icon_emoji: String,
    pub smtp: Option<SmtpConfig>,
    /// Reason-severity floor below which `send_alert` is a no-op.
    /// Resolved the same way as an event's own severity: strip the
    /// trailing `(score)` suffix, look the prefix up in the severity map,
    /// default to 1 (not 0 — see SPEC_FULL.md §4.9 asymmetry note).
    pub min_reason_severity: String,
}

impl AlertConfig {
    fn from_env() -> Self {
        let method = env_var("ALERT_METHOD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(AlertMethod::None);

        let password = env_var("ALERT_SMTP_PASSWORD_FILE")
            .and_then(|path| std::fs::read_to_string(&path).ok())
            .map(|s| s.trim().to_string())
            .or_else(|| env_var("ALERT_SMTP_PASSWORD"));

        let smtp = env_var("ALERT_SMTP_HOST").map(|host| SmtpConfig {
            host,
            port: env_or("ALERT_SMTP_PORT", 587),
            user: env_var("ALERT_SMTP_USER"),
            password,
            use_tls: env_or("ALERT_SMTP_USE_TLS", true),
            from: env_var("ALERT_EMAIL_FROM").unwrap_or_else(|| "alerts@localhost".to_string()),
            to: env_var("ALERT_EMAIL_TO").unwrap_or_else(|| "admin@localhost".to_string()),
        });

        Self {
            method,
            generic_webhook_url: env_var("ALERT_GENERIC_WEBHOOK_URL"),
            slack_webhook_url: env_var("ALERT_SLACK_WEBHOOK_URL"),
            slack_username: env_var("ALERT_SLACK_USERNAME")
                .unwrap_or_else(|| "ai-defense-bot".to_string()),
            slack_icon_emoji: env_var("ALERT_SLACK_ICON_EMOJI")
                .unwrap_or_else(|| ":shield:".to_string()),
            smtp,
            min_reason_severity: env_var("ALERT_MIN_REASON_SEVERITY")
                .unwrap_or_else(|| "Local LLM".to_string()),
        }
    }
}

/// Which of the two tarpit content generators a responder instance uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarpitStrategy {
    Markov,
    Labyrinth,
}

impl std::str::FromStr for TarpitStrategy {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markov" | "" => Ok(Self::Markov),
            "labyrinth" => Ok(Self::Labyrinth),
            _ => Err(()),
        }
    }
}

/// Tarpit hop-limit and content-generation knobs.
#[derive(Debug, Clone)]
pub struct TarpitConfig {
    pub escalation_endpoint: String,
    pub min_stream_delay_sec: f64,
    pub max_stream_delay_sec: f64,
    pub hop_limit_enabled: bool,
    pub max_hops: u32,
    pub hop_ttl_seconds: u64,
    pub tarpit_flag_ttl_seconds: u64,
    pub enable_fingerprinting: bool,
    pub content_strategy: TarpitStrategy,
    pub labyrinth_depth: usize,
    /// Optional corpus file the Markov model is trained from at startup. When
    /// unset, falls back to a small bundled default corpus — mirroring the
    /// Python generator's own fallback when its live Wikipedia scrape fails.
    pub markov_corpus_path: Option<String>,
}

impl TarpitConfig {
    fn from_env() -> Self {
        Self {
            escalation_endpoint: env_var("ESCALATION_ENDPOINT")
                .unwrap_or_else(|| "http://localhost:8003/escalate".to_string()),
            min_stream_delay_sec: env_or("MIN_STREAM_DELAY_SEC", 0.6),
            max_stream_delay_sec: env_or("MAX_STREAM_DELAY_SEC", 1.2),
            hop_limit_enabled: env_or("HOP_LIMIT_ENABLED", true),
            max_hops: env_or("TARPIT_MAX_HOPS", 250),
            hop_ttl_seconds: env_or("TARPIT_HOP_TTL_SECONDS", 3600),
            tarpit_flag_ttl_seconds: env_or("TAR_PIT_FLAG_TTL", 300),
            enable_fingerprinting: env_or("ENABLE_FINGERPRINTING", false),
            content_strategy: env_var("TARPIT_CONTENT_STRATEGY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(TarpitStrategy::Markov),
            labyrinth_depth: env_or("TARPIT_LABYRINTH_DEPTH", 5),
            markov_corpus_path: env_var("MARKOV_CORPUS_PATH"),
        }
    }
}

/// Redis connection info for the shared KV state plane.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub frequency_url: String,
    pub blocklist_url: String,
    pub hops_url: String,
    pub flags_url: String,
}

impl RedisConfig {
    fn from_env() -> Self {
        let base = env_var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
        let db = |key: &str, default: u8| -> String {
            let n: u8 = env_or(key, default);
            format!("{base}/{n}")
        };
        Self {
            frequency_url: db("REDIS_DB_FREQUENCY", 0),
            blocklist_url: db("REDIS_DB_BLOCKLIST", 2),
            hops_url: db("REDIS_DB_HOPS", 3),
            flags_url: db("REDIS_DB_TARPIT_FLAGS", 4),
        }
    }
}

/// Everything a service binary needs, assembled once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub scoring: ScoringConfig,
    pub classifier: ClassifierConfig,
    pub forwarding: ForwardingConfig,
    pub alert: AlertConfig,
    pub tarpit: TarpitConfig,
    pub robots_txt_path: String,
}

impl Config {
    /// Load and validate configuration from the process environment.
    ///
    /// Reads an optional `.env` file first (dev convenience; production
    /// deployments set real environment variables and this is a no-op).
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let config = Self {
            redis: RedisConfig::from_env(),
            scoring: ScoringConfig::from_env(),
            classifier: ClassifierConfig::from_env(),
            forwarding: ForwardingConfig::from_env(),
            alert: AlertConfig::from_env(),
            tarpit: TarpitConfig::from_env(),
            robots_txt_path: env_var("ROBOTS_TXT_PATH")
                .unwrap_or_else(|| "robots.txt.default".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.scoring.heuristic_threshold_low <= self.scoring.heuristic_threshold_medium
                && self.scoring.heuristic_threshold_medium <= self.scoring.heuristic_threshold_high,
            "HEURISTIC_THRESHOLD_LOW <= _MEDIUM <= _HIGH must hold, got {} <= {} <= {}",
            self.scoring.heuristic_threshold_low,
            self.scoring.heuristic_threshold_medium,
            self.scoring.heuristic_threshold_high
        );
        anyhow::ensure!(
            self.tarpit.min_stream_delay_sec <= self.tarpit.max_stream_delay_sec,
            "MIN_STREAM_DELAY_SEC must be <= MAX_STREAM_DELAY_SEC"
        );
        if self.alert.method == AlertMethod::Smtp {
            anyhow::ensure!(
                self.alert.smtp.is_some(),
                "ALERT_METHOD=smtp requires ALERT_SMTP_HOST"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for key in [
            "HEURISTIC_THRESHOLD_LOW",
            "HEURISTIC_THRESHOLD_MEDIUM",
            "HEURISTIC_THRESHOLD_HIGH",
            "MIN_STREAM_DELAY_SEC",
            "MAX_STREAM_DELAY_SEC",
            "ALERT_METHOD",
            "ALERT_SMTP_HOST",
        ] {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_apply_when_env_is_unset() {
        clear_env();
        let cfg = Config::load().expect("default config should validate");
        assert_eq!(cfg.scoring.frequency_window_seconds, 300);
        assert_eq!(cfg.tarpit.max_hops, 250);
        assert_eq!(cfg.alert.method, AlertMethod::None);
    }

    #[test]
    fn rejects_out_of_order_heuristic_thresholds() {
        clear_env();
        unsafe {
            env::set_var("HEURISTIC_THRESHOLD_LOW", "0.9");
            env::set_var("HEURISTIC_THRESHOLD_MEDIUM", "0.2");
        }
        let result = Config::load();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn rejects_smtp_alert_method_without_host() {
        clear_env();
        unsafe { env::set_var("ALERT_METHOD", "smtp") };
        let result = Config::load();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn alert_method_parses_case_insensitively() {
        assert_eq!("Slack".parse::<AlertMethod>(), Ok(AlertMethod::Slack));
        assert_eq!("SMTP".parse::<AlertMethod>(), Ok(AlertMethod::Smtp));
    }
}
