//! HTTP webhook delivery.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::notify::NotificationChannel;
use crate::validate::ValidatedEvent;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each event as a small JSON document. Non-2xx responses surface as
/// errors so the dispatcher's retry loop handles them.
pub struct WebhookChannel {
    url: String,
    agent: ureq::Agent,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build();
        Self { url, agent }
    }
}

impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn send(&mut self, event: &ValidatedEvent) -> Result<()> {
        let payload = json!({
            "event": "cat_detected",
            "cat_count": event.cat_count,
            "confidence": event.confidence,
            "boxes": event.boxes,
            "backend": event.backend.as_str(),
            "frame_seq": event.frame_seq,
            "timestamp_ms": event.unix_time_ms,
        });
        self.agent
            .post(&self.url)
            .send_json(payload)
            .with_context(|| format!("webhook POST to {} failed", self.url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::{BackendKind, BoundingBox};

    #[test]
    fn unreachable_endpoint_reports_an_error() {
        // Reserved TEST-NET-1 address; connect fails fast with the timeout.
        let mut channel = WebhookChannel::new("http://192.0.2.1:9/hook".to_string());
        let event = ValidatedEvent {
            boxes: vec![BoundingBox::new(10, 10, 60, 60, 0.9)],
            cat_count: 1,
            confidence: 0.9,
            backend: BackendKind::Secondary,
            frame_seq: 7,
            unix_time_ms: 1_700_000_000_000,
        };
        assert!(channel.send(&event).is_err());
    }
}
