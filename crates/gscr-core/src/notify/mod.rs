//! Split success/error webhook notification.
//!
//! Webhook URLs are discovered from the environment only; the config file is
//! integrity-verified and machine-readable, so it must never carry secrets.
//! Delivery runs on its own task behind a bounded channel, so a slow or
//! down endpoint never blocks an executor. Retries are limited to HTTP 5xx,
//! 429 and transport errors, with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::logging::{Level, LogHandler, Record, Value};

pub const SUCCESS_URL_ENV: &str = "GSCR_SLACK_WEBHOOK_URL_SUCCESS";
pub const ERROR_URL_ENV: &str = "GSCR_SLACK_WEBHOOK_URL_ERROR";
pub const LEGACY_URL_ENV: &str = "GSCR_SLACK_WEBHOOK_URL";

const CHANNEL_CAPACITY: usize = 256;
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(
        "{LEGACY_URL_ENV} is no longer supported; set {SUCCESS_URL_ENV} and {ERROR_URL_ENV} instead"
    )]
    LegacyUrl,

    #[error(
        "{SUCCESS_URL_ENV} is set but {ERROR_URL_ENV} is not; refusing to run without an error notification channel"
    )]
    SuccessWithoutError,

    #[error("invalid webhook URL in {var}: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
}

impl NotifyError {
    pub fn tag(&self) -> &'static str {
        "webhook_config_invalid"
    }
}

/// Webhook endpoints resolved from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlackConfig {
    pub success_url: Option<String>,
    pub error_url: Option<String>,
}

impl SlackConfig {
    pub fn from_env() -> Result<Self, NotifyError> {
        Self::from_values(
            std::env::var(LEGACY_URL_ENV).ok(),
            std::env::var(SUCCESS_URL_ENV).ok(),
            std::env::var(ERROR_URL_ENV).ok(),
        )
    }

    /// Rule set, separated from the environment for testing: the legacy
    /// variable fails with a migration message; a success channel without an
    /// error channel fails; error-only suppresses success notifications;
    /// neither disables webhooks entirely.
    pub fn from_values(
        legacy: Option<String>,
        success: Option<String>,
        error: Option<String>,
    ) -> Result<Self, NotifyError> {
        if legacy.is_some() {
            return Err(NotifyError::LegacyUrl);
        }
        if success.is_some() && error.is_none() {
            return Err(NotifyError::SuccessWithoutError);
        }
        for (var, url) in [(SUCCESS_URL_ENV, &success), (ERROR_URL_ENV, &error)] {
            if let Some(url) = url {
                reqwest::Url::parse(url).map_err(|e| NotifyError::InvalidUrl {
                    var,
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(Self {
            success_url: success,
            error_url: error,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.success_url.is_some() || self.error_url.is_some()
    }
}

#[derive(Debug)]
struct Delivery {
    url: String,
    payload: serde_json::Value,
}

/// Owns the sender task; handlers feed it through the channel.
pub struct Notifier {
    tx: mpsc::Sender<Delivery>,
    task: tokio::task::JoinHandle<()>,
}

impl Notifier {
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let client = reqwest::Client::new();
        let task = tokio::spawn(sender_loop(rx, client));
        Self { tx, task }
    }

    /// Handlers for the configured channels, to be placed behind the
    /// redacting wrapper alongside the other sinks.
    pub fn handlers(&self, config: &SlackConfig) -> Vec<Arc<dyn LogHandler>> {
        let mut handlers: Vec<Arc<dyn LogHandler>> = Vec::new();
        if let Some(url) = &config.success_url {
            handlers.push(Arc::new(WebhookHandler {
                route: Route::Success,
                url: url.clone(),
                tx: self.tx.clone(),
            }));
        }
        if let Some(url) = &config.error_url {
            handlers.push(Arc::new(WebhookHandler {
                route: Route::Error,
                url: url.clone(),
                tx: self.tx.clone(),
            }));
        }
        handlers
    }

    /// Drain pending deliveries and stop the sender task.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = tokio::time::timeout(Duration::from_secs(15), self.task).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// INFO records only, exact match.
    Success,
    /// WARN and above.
    Error,
}

impl Route {
    fn accepts(&self, level: Level) -> bool {
        match self {
            Self::Success => level == Level::Info,
            Self::Error => level >= Level::Warn,
        }
    }
}

struct WebhookHandler {
    route: Route,
    url: String,
    tx: mpsc::Sender<Delivery>,
}

impl LogHandler for WebhookHandler {
    fn enabled(&self, level: Level) -> bool {
        self.route.accepts(level)
    }

    fn handle(&self, record: &Record) {
        if !record.wants_notification() {
            return;
        }
        let delivery = Delivery {
            url: self.url.clone(),
            payload: to_payload(record),
        };
        if self.tx.try_send(delivery).is_err() {
            tracing::warn!(url = %self.url, "webhook queue full, notification dropped");
        }
    }
}

/// Slack-style payload: a single `text` field summarizing the record.
fn to_payload(record: &Record) -> serde_json::Value {
    let mut text = format!("[{}] {}", record.level.as_str().to_uppercase(), record.message);
    for (key, value) in &record.attrs {
        if key == "slack_notify" || key == "message_type" {
            continue;
        }
        match value {
            Value::Group(_) | Value::Array(_) => {
                text.push_str(&format!("\n{key}: {}", value.to_json()));
            }
            other => text.push_str(&format!("\n{key}: {}", other.to_json())),
        }
    }
    serde_json::json!({ "text": text })
}

async fn sender_loop(mut rx: mpsc::Receiver<Delivery>, client: reqwest::Client) {
    while let Some(delivery) = rx.recv().await {
        deliver(&client, &delivery).await;
    }
}

/// One initial attempt plus up to three retries on 5xx/429 or transport
/// errors; other statuses are final.
async fn deliver(client: &reqwest::Client, delivery: &Delivery) {
    let mut attempt = 0u32;
    loop {
        let outcome = client
            .post(&delivery.url)
            .json(&delivery.payload)
            .send()
            .await;
        let retriable = match outcome {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => {
                let status = resp.status();
                let retriable = status.is_server_error() || status.as_u16() == 429;
                if !retriable {
                    tracing::error!(url = %delivery.url, %status, "webhook rejected, not retrying");
                    return;
                }
                tracing::warn!(url = %delivery.url, %status, attempt, "webhook delivery failed");
                true
            }
            Err(e) => {
                tracing::warn!(url = %delivery.url, error = %e, attempt, "webhook transport error");
                true
            }
        };
        if !retriable || attempt >= MAX_RETRIES {
            tracing::error!(url = %delivery.url, attempts = attempt + 1, "webhook delivery abandoned");
            return;
        }
        tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt)).await;
        attempt += 1;
    }
}
