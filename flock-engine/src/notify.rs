//! Event notification over HTTP webhooks.
//!
//! Delivery is best-effort: the engine never blocks or fails on a
//! notification outcome, it only logs and reports per-channel success.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use flock_common::config::NotificationConfig;

/// Something that can deliver an engine event.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an event. Returns per-channel delivery success.
    async fn notify(&self, event: &str, message: &str, data: Value) -> HashMap<String, bool>;
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: &str, _message: &str, _data: Value) -> HashMap<String, bool> {
        HashMap::new()
    }
}

/// Posts events as JSON to configured webhook endpoints, with a small
/// number of retries per channel.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotificationConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    async fn deliver(&self, url: &str, payload: &Value) -> bool {
        for attempt in 0..=self.config.retry_count {
            match self.client.post(url).json(payload).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), attempt, "Webhook rejected");
                }
                Err(err) => {
                    warn!(url = %url, error = %err, attempt, "Webhook delivery failed");
                }
            }
            if attempt < self.config.retry_count {
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt + 1))).await;
            }
        }
        false
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &str, message: &str, data: Value) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        if !self.config.enabled || self.config.webhooks.is_empty() {
            return results;
        }

        let payload = json!({
            "event": event,
            "message": message,
            "data": data,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        for (channel, url) in &self.config.webhooks {
            let ok = self.deliver(url, &payload).await;
            debug!(channel = %channel, event = %event, delivered = ok, "Notification sent");
            results.insert(channel.clone(), ok);
        }
        results
    }
}

/// Records events in memory. Test double.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: std::sync::Mutex<Vec<(String, String, Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, String, Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _, _)| event.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &str, message: &str, data: Value) -> HashMap<String, bool> {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), message.to_string(), data));
        HashMap::from([("recording".to_string(), true)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_notifier_reports_nothing() {
        let results = NullNotifier.notify("event", "msg", json!({})).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_webhook_notifier_skips_delivery() {
        let config = NotificationConfig {
            enabled: false,
            webhooks: HashMap::from([("main".into(), "http://127.0.0.1:9".into())]),
            ..Default::default()
        };
        let notifier = WebhookNotifier::new(config);
        let results = notifier.notify("event", "msg", json!({})).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_recording_notifier_captures_events() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify("new_follower", "alice followed", json!({"username": "alice"}))
            .await;
        notifier.notify("milestone", "crossed 100", json!({})).await;

        assert_eq!(notifier.event_names(), vec!["new_follower", "milestone"]);
        let events = notifier.events();
        assert_eq!(events[0].2["username"], "alice");
    }
}
