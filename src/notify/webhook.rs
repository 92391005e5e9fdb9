//! Text webhook notifications (Feishu/Lark compatible payload)

use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::Notifier;

#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    msg_type: &'static str,
    content: WebhookContent<'a>,
}

#[derive(Serialize)]
struct WebhookContent<'a> {
    text: &'a str,
}

impl WebhookNotifier {
    /// Notifier from `BASTION_WEBHOOK_URL`, if set
    pub fn from_env() -> Option<Arc<Self>> {
        std::env::var("BASTION_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(Self::new)
    }

    pub fn new(webhook_url: String) -> Arc<Self> {
        info!("Webhook notifications enabled");
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Arc::new(Self {
            client,
            webhook_url,
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<(), String> {
        let message = WebhookMessage {
            msg_type: "text",
            content: WebhookContent { text },
        };

        match self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
        {
            Ok(resp) => {
                if resp.status().is_success() {
                    debug!("Webhook notification sent");
                    Ok(())
                } else {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    error!("Webhook notification failed: {} - {}", status, body);
                    Err(format!("HTTP {}: {}", status, body))
                }
            }
            Err(e) => {
                error!("Webhook request failed: {}", e);
                Err(e.to_string())
            }
        }
    }
}

impl Notifier for WebhookNotifier {
    fn send_text(&self, message: &str) {
        let notifier = self.clone();
        let text = message.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = notifier.send_message(&text).await;
                });
            }
            Err(_) => error!("No runtime for webhook notification: {}", text),
        }
    }
}
