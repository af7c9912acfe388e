//! Subscription URL fetching
//!
//! Subscriptions are plain text or base64-encoded plain text with one proxy
//! URI per line. The decoder is tolerant: decode succeeds when the body is
//! valid base64 of UTF-8, otherwise the body is used as-is.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use edgescan_core::{Error, Result};
use reqwest::Client;

/// Fetch a subscription URL and return the proxy URIs it contains
pub async fn fetch_subscription(client: &Client, url: &str) -> Result<Vec<String>> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Network(format!("subscription fetch failed: {}", e)))?;
    if !resp.status().is_success() {
        return Err(Error::Network(format!(
            "subscription returned {}",
            resp.status()
        )));
    }
    let body = resp
        .text()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    Ok(extract_proxy_uris(&body))
}

/// Decode a subscription body (base64-tolerant) into proxy URI lines
pub fn extract_proxy_uris(body: &str) -> Vec<String> {
    let decoded = BASE64
        .decode(body.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| body.to_string());

    decoded
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("vless://") || line.starts_with("trojan://"))
        .map(|line| line.to_string())
        .collect()
}
