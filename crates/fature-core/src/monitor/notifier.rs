//! Alert delivery.

use std::time::Duration;

use serde::Serialize;
use ureq::{Agent, AgentBuilder};

use super::{Alert, AlertLevel, NotifyError};
use crate::config::MonitorConfig;

/// Delivers one alert. Implementations must not retry; the monitor's
/// cooldown handles repetition.
pub trait Notifier: Send {
    fn name(&self) -> &'static str;

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Pick the notifier for a monitor configuration: the webhook when a URL is
/// configured, otherwise the log.
pub fn notifier_for(config: &MonitorConfig) -> Box<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url.clone(), config.webhook_timeout())),
        None => Box::new(LogNotifier),
    }
}

/// Chat-webhook message body.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub color: &'static str,
    pub fields: Vec<Field>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Field {
    pub title: &'static str,
    pub value: String,
    pub short: bool,
}

impl WebhookPayload {
    pub fn from_alert(alert: &Alert) -> Self {
        let color = match alert.level {
            AlertLevel::Critical => "danger",
            AlertLevel::Warning => "warning",
        };
        let field = |title, value: String, short| Field { title, value, short };
        Self {
            text: format!("FATURE ALERT - {}", alert.level),
            attachments: vec![Attachment {
                color,
                fields: vec![
                    field("Type", alert.kind.to_string(), true),
                    field("Message", alert.message.clone(), false),
                    field("Observed", format!("{}", alert.observed), true),
                    field("Threshold", format!("{}", alert.threshold), true),
                ],
                timestamp: alert.raised_at.to_rfc3339(),
            }],
        }
    }
}

/// POSTs alerts as JSON to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    agent: Agent,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(&WebhookPayload::from_alert(alert))?;
        match self
            .agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_string(&payload)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, _)) => Err(NotifyError::Status { status }),
            Err(ureq::Error::Transport(err)) => Err(NotifyError::Transport(err.to_string())),
        }
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.level {
            AlertLevel::Critical => tracing::error!(
                kind = %alert.kind,
                observed = alert.observed,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
            AlertLevel::Warning => tracing::warn!(
                kind = %alert.kind,
                observed = alert.observed,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::AlertKind;
    use chrono::Utc;

    fn backlog_alert(level: AlertLevel) -> Alert {
        Alert {
            kind: AlertKind::CommissionBacklog,
            level,
            message: "12000 commissions pending".to_string(),
            observed: 12000.0,
            threshold: 1000.0,
            raised_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_shape() {
        let payload = WebhookPayload::from_alert(&backlog_alert(AlertLevel::Critical));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["text"], "FATURE ALERT - CRITICAL");
        let attachment = &json["attachments"][0];
        assert_eq!(attachment["color"], "danger");
        assert_eq!(attachment["fields"][0]["title"], "Type");
        assert_eq!(attachment["fields"][0]["value"], "commission_backlog");
        assert_eq!(attachment["fields"][1]["short"], false);
        assert_eq!(attachment["fields"][3]["value"], "1000");
    }

    #[test]
    fn test_warning_color() {
        let payload = WebhookPayload::from_alert(&backlog_alert(AlertLevel::Warning));
        assert_eq!(payload.attachments[0].color, "warning");
    }

    #[test]
    fn test_unreachable_webhook_is_transport_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200));
        let err = notifier.notify(&backlog_alert(AlertLevel::Warning)).unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)), "{err}");
    }

    #[test]
    fn test_notifier_selection() {
        let mut config = MonitorConfig::default();
        assert_eq!(notifier_for(&config).name(), "log");
        config.webhook_url = Some("http://localhost/hook".into());
        assert_eq!(notifier_for(&config).name(), "webhook");
    }
}
