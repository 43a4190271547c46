use dashmap::DashMap;
use reqwest::{Client, Response};
use tokio::time::Duration;

use crate::proxy::cooldown::normalize_proxy_key;

// HTTP upstream abstraction: one reqwest client per normalized proxy URL.
// Account id and concurrency travel with every call so a TLS-shaping
// transport can key on them; this implementation only logs them.
pub struct UpstreamClient {
    default_client: Client,
    client_cache: DashMap<String, Client>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let default_client =
            Self::build_client(None).expect("Failed to create default HTTP client");
        Self {
            default_client,
            client_cache: DashMap::new(),
        }
    }

    fn build_client(proxy_url: Option<&str>) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600));

        if let Some(url) = proxy_url {
            if let Ok(proxy) = reqwest::Proxy::all(url) {
                builder = builder.proxy(proxy);
                tracing::info!("UpstreamClient enabled proxy: {}", url);
            }
        }

        builder.build()
    }

    pub fn client_for(&self, proxy_url: &str) -> Result<Client, String> {
        let trimmed = proxy_url.trim();
        if trimmed.is_empty() {
            return Ok(self.default_client.clone());
        }
        let key = normalize_proxy_key(trimmed);
        if let Some(client) = self.client_cache.get(&key) {
            return Ok(client.clone());
        }
        match Self::build_client(Some(trimmed)) {
            Ok(client) => {
                self.client_cache.insert(key, client.clone());
                Ok(client)
            }
            Err(e) => Err(format!("failed to build proxied client for {}: {}", key, e)),
        }
    }

    pub async fn execute(
        &self,
        request: reqwest::Request,
        proxy_url: &str,
        account_id: i64,
        account_concurrency: i32,
    ) -> Result<Response, String> {
        let client = self.client_for(proxy_url)?;
        tracing::debug!(
            "upstream_request account_id={} concurrency={} url={}",
            account_id,
            account_concurrency,
            request.url()
        );
        client
            .execute(request)
            .await
            .map_err(|e| format!("upstream request failed: {}", e))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_calls_share_the_default_client() {
        let upstream = UpstreamClient::new();
        assert!(upstream.client_for("").is_ok());
        assert!(upstream.client_for("   ").is_ok());
        assert_eq!(upstream.client_cache.len(), 0);
    }

    #[test]
    fn proxied_clients_are_cached_by_normalized_key() {
        let upstream = UpstreamClient::new();
        upstream
            .client_for("http://proxy.example.com:8080")
            .expect("client");
        upstream
            .client_for("HTTP://PROXY.example.com:8080/")
            .expect("client");
        assert_eq!(upstream.client_cache.len(), 1);

        upstream
            .client_for("http://other.example.com:3128")
            .expect("client");
        assert_eq!(upstream.client_cache.len(), 2);
    }
}
