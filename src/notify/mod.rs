//! Operator escalation hook.

mod webhook;

pub use webhook::WebhookNotifier;

/// Fire-and-forget text notifications. Implementations must never block the caller.
pub trait Notifier: Send + Sync {
    fn send_text(&self, message: &str);
}
