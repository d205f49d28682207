//! Alert dispatcher — severity gate plus pluggable sinks, per
//! SPEC_FULL.md §4.9.
//!
//! Each sink runs independently (`tokio::join!`-style fan-out at the call
//! site is the caller's job; this module exposes one function per sink so a
//! failure in one never touches another's result).

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;

use crate::config::{AlertConfig, AlertMethod, SmtpConfig};
use crate::eventlog::EventLog;
use crate::metrics::Metrics;
use crate::model::RequestMetadata;

const SINK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Map a verdict reason to its severity ordinal, per SPEC_FULL.md §4.9's
/// exact substring table — these strings are a stable interface, not
/// cosmetic.
pub fn severity_of(reason: &str) -> u8 {
    let prefix = reason.split('(').next().unwrap_or(reason).trim();
    if prefix.starts_with("High Heuristic") || prefix.starts_with("High Combined") {
        1
    } else if prefix.starts_with("Local LLM") || prefix.starts_with("Honeypot_Hit") {
        2
    } else if prefix.starts_with("External API") {
        3
    } else {
        0
    }
}

/// Outcome of a single `maybe_dispatch` call, per spec §4.9's
/// `action_taken` suffix rule: the severity gate can reject the event
/// outright (no suffix), a dispatch can succeed (`_alert_checked`), or the
/// configured sink can fail (`_alert_error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    NotAttempted,
    Dispatched,
    Failed,
}

pub struct AlertDispatcher {
    config: AlertConfig,
    client: reqwest::Client,
    alert_log: std::sync::Arc<EventLog>,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig, alert_log: std::sync::Arc<EventLog>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            alert_log,
        }
    }

    /// Evaluate the severity gate and dispatch to the configured sink if it
    /// passes.
    pub async fn maybe_dispatch(
        &self,
        reason: &str,
        meta: &RequestMetadata,
        metrics: &Metrics,
    ) -> DispatchOutcome {
        let min_severity = severity_of(&self.config.min_reason_severity).max(1);
        let event_severity = severity_of(reason);
        if event_severity < min_severity {
            tracing::debug!(reason, event_severity, min_severity, "alert severity below floor, skipping");
            return DispatchOutcome::NotAttempted;
        }

        let succeeded = match self.config.method {
            AlertMethod::None => true,
            AlertMethod::Webhook => self.send_generic_webhook(reason, meta, metrics).await,
            AlertMethod::Slack => self.send_slack(reason, meta, metrics).await,
            AlertMethod::Smtp => self.send_smtp(reason, meta, metrics).await,
        };

        if succeeded { DispatchOutcome::Dispatched } else { DispatchOutcome::Failed }
    }

    async fn send_generic_webhook(&self, reason: &str, meta: &RequestMetadata, metrics: &Metrics) -> bool {
        let Some(url) = &self.config.generic_webhook_url else {
            tracing::error!("ALERT_METHOD=webhook but ALERT_GENERIC_WEBHOOK_URL is unset");
            metrics.incr("alert_errors_webhook");
            return false;
        };
        let payload = json!({
            "alert_type": "AI_DEFENSE_BLOCK",
            "reason": reason,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "ip_address": meta.source_address,
            "user_agent": meta.user_agent,
            "details": meta,
        });

        match self.client.post(url).json(&payload).timeout(SINK_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.alert_log
                    .log_event("ALERT_SENT_WEBHOOK", json!({"reason": reason, "ip": meta.source_address}))
                    .await;
                true
            }
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "generic webhook alert failed");
                metrics.incr("alert_errors_webhook");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "generic webhook alert failed");
                metrics.incr("alert_errors_webhook");
                false
            }
        }
    }

    async fn send_slack(&self, reason: &str, meta: &RequestMetadata, metrics: &Metrics) -> bool {
        let Some(url) = &self.config.slack_webhook_url else {
            tracing::error!("ALERT_METHOD=slack but ALERT_SLACK_WEBHOOK_URL is unset");
            metrics.incr("alert_errors_slack");
            return false;
        };
        let text = format!(
            "{} *AI Defense Alert*\n> *Reason:* {}\n> *Address:* `{}`\n> *User Agent:* `{}`\n> *Timestamp (UTC):* {}",
            self.config.slack_icon_emoji,
            reason,
            meta.source_address,
            if meta.user_agent.is_empty() { "N/A" } else { &meta.user_agent },
            chrono::Utc::now().to_rfc3339(),
        );
        let color = match severity_of(reason) {
            1 => "#d9534f",
            2 => "#f0ad4e",
            3 => "#5bc0de",
            _ => "#777777",
        };
        let payload = json!({
            "text": text,
            "username": self.config.slack_username,
            "icon_emoji": self.config.slack_icon_emoji,
            "attachments": [{
                "color": color,
                "fields": [
                    {"title": "Reason", "value": reason, "short": false},
                    {"title": "Address", "value": meta.source_address, "short": true},
                    {"title": "Path", "value": meta.path, "short": true},
                ],
                "footer": "ai-defense",
                "ts": chrono::Utc::now().timestamp(),
            }],
        });

        match self.client.post(url).json(&payload).timeout(SINK_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.alert_log
                    .log_event("ALERT_SENT_SLACK", json!({"reason": reason, "ip": meta.source_address}))
                    .await;
                true
            }
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "slack alert failed");
                metrics.incr("alert_errors_slack");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "slack alert failed");
                metrics.incr("alert_errors_slack");
                false
            }
        }
    }

    async fn send_smtp(&self, reason: &str, meta: &RequestMetadata, metrics: &Metrics) -> bool {
        let Some(smtp) = &self.config.smtp else {
            tracing::error!("SMTP alert configured but missing host");
            metrics.incr("alert_errors_smtp");
            return false;
        };

        let subject = format!("[AI Defense Alert] Suspicious Activity Detected - {reason}");
        let body = format!(
            "Suspicious activity detected by the AI Defense System:\n\n\
             Reason: {reason}\n\
             Timestamp (UTC): {}\n\
             Address: {}\n\
             User Agent: {}\n\n\
             Full Details:\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            meta.source_address,
            meta.user_agent,
            serde_json::to_string_pretty(meta).unwrap_or_default(),
        );

        let result = self.send_smtp_message(smtp, &subject, &body).await;
        match result {
            Ok(()) => {
                self.alert_log
                    .log_event("ALERT_SENT_SMTP", json!({"reason": reason, "ip": meta.source_address, "to": smtp.to}))
                    .await;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "SMTP alert failed");
                metrics.incr("alert_errors_smtp");
                false
            }
        }
    }

    async fn send_smtp_message(&self, smtp: &SmtpConfig, subject: &str, body: &str) -> anyhow::Result<()> {
        let from: Mailbox = smtp.from.parse()?;
        let to: Mailbox = smtp
            .to
            .split(',')
            .next()
            .unwrap_or(&smtp.to)
            .trim()
            .parse()?;

        let mut builder = Message::builder().from(from).subject(subject);
        for recipient in smtp.to.split(',') {
            let mailbox: Mailbox = recipient.trim().parse()?;
            builder = builder.to(mailbox);
        }
        let _ = to; // first recipient kept for a clearer error message above
        let email = builder.body(body.to_string())?;

        let transport = build_transport(smtp)?;
        transport.send(email).await?;
        Ok(())
    }
}

fn build_transport(smtp: &SmtpConfig) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
    let tls_params = TlsParameters::new(smtp.host.clone())?;
    let mut builder = match smtp.port {
        465 => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(465)
            .tls(Tls::Wrapper(tls_params)),
        587 if smtp.use_tls => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(587)
            .tls(Tls::Required(tls_params)),
        port => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(port)
            .tls(Tls::None),
    };
    if let (Some(user), Some(password)) = (&smtp.user, &smtp.password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    } else {
        tracing::warn!("SMTP user/password not provided; sending unauthenticated");
    }
    Ok(builder.build())
}
