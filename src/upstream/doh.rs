//! DNS-over-HTTPS client (RFC 8484): POST of the raw wire-format query.

use std::time::Duration;

use crate::error::{Result, WardenError};

const DNS_MESSAGE_MIME: &str = "application/dns-message";

pub struct DohExchanger {
    client: reqwest::Client,
}

impl DohExchanger {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WardenError::Io(format!("failed to build DoH client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn exchange(&self, url: &str, query: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE_MIME)
            .body(query.to_vec())
            .send()
            .await
            .map_err(|e| WardenError::UpstreamTransport {
                upstream: url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(WardenError::UpstreamTransport {
                upstream: url.to_string(),
                message: format!("HTTP status {}", response.status()),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| WardenError::UpstreamTransport {
                upstream: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(body.to_vec())
    }
}
