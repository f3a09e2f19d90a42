//! Fire-and-forget "on block" webhook, rate-limited per domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

/// Minimum spacing between notifications for the same domain.
const PER_DOMAIN_INTERVAL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Option<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Arc::new(Self {
            client,
            url,
            last_fired: Mutex::new(HashMap::new()),
        }))
    }

    /// Post the block event in the background. Failures are logged, never
    /// propagated, and never add to request latency.
    pub fn notify_block(&self, domain: &str, client_ip: &str) {
        {
            let mut last = self.last_fired.lock();
            if let Some(at) = last.get(domain) {
                if at.elapsed() < PER_DOMAIN_INTERVAL {
                    return;
                }
            }
            last.insert(domain.to_string(), Instant::now());
            // Keep the rate-limit map from growing without bound.
            if last.len() > 10_000 {
                last.retain(|_, at| at.elapsed() < PER_DOMAIN_INTERVAL);
            }
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let payload = json!({
            "event": "blocked",
            "domain": domain,
            "client": client_ip,
            "ts": chrono::Utc::now().to_rfc3339(),
        });

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Block webhook delivered");
                }
                Ok(response) => warn!("Block webhook returned {}", response.status()),
                Err(err) => warn!("Block webhook failed: {}", err),
            }
        });
    }
}
