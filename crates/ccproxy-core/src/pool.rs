use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

/// Pool-wide settings; per-request overrides form part of the pool key.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_timeout: Duration,
    pub streaming_timeout: Duration,
    pub pool_size: usize,
    pub proxy: Option<String>,
    pub verify: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            streaming_timeout: Duration::from_secs(300),
            pool_size: 10,
            proxy: None,
            verify: true,
        }
    }
}

/// One client per configuration tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    base_url: Option<String>,
    timeout_ms: u64,
    streaming: bool,
    proxy: Option<String>,
    verify: bool,
}

/// Keyed cache of HTTP clients.
///
/// Clients keep connections alive for 30 s, follow no redirects, and cap
/// idle connections at the configured pool size. Creation is deduplicated
/// under one registry-wide lock so concurrent callers share a single client
/// per key.
pub struct ConnectionPool {
    config: PoolConfig,
    clients: Mutex<HashMap<PoolKey, wreq::Client>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub async fn get_client(
        &self,
        base_url: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<wreq::Client, wreq::Error> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        self.client_for(base_url, timeout, false).await
    }

    /// Client for streaming calls. The streaming timeout bounds the header
    /// phase and idle gaps between chunks; a stream that keeps producing is
    /// never cut off.
    pub async fn get_streaming_client(
        &self,
        base_url: Option<&str>,
    ) -> Result<wreq::Client, wreq::Error> {
        self.client_for(base_url, self.config.streaming_timeout, true)
            .await
    }

    async fn client_for(
        &self,
        base_url: Option<&str>,
        timeout: Duration,
        streaming: bool,
    ) -> Result<wreq::Client, wreq::Error> {
        let key = PoolKey {
            base_url: base_url.map(str::to_string),
            timeout_ms: timeout.as_millis() as u64,
            streaming,
            proxy: self.config.proxy.clone(),
            verify: self.config.verify,
        };

        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = self.build_client(timeout, streaming)?;
        debug!(
            event = "connection_pool_created",
            base_url = ?key.base_url,
            timeout_ms = key.timeout_ms,
            streaming,
            pool_size = self.config.pool_size
        );
        guard.insert(key, client.clone());
        Ok(client)
    }

    fn build_client(&self, timeout: Duration, streaming: bool) -> Result<wreq::Client, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(self.config.pool_size)
            .pool_idle_timeout(Duration::from_secs(30))
            .redirect(wreq::redirect::Policy::none());
        // Non-streaming requests get a whole-request bound; streaming ones
        // only a read timeout, so an active body can run indefinitely.
        builder = if streaming {
            builder.read_timeout(timeout)
        } else {
            builder.timeout(timeout)
        };
        if let Some(proxy) = self.config.proxy.as_deref() {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        if !self.config.verify {
            builder = builder.tls_cert_verification(false);
        }
        builder.build()
    }

    /// Drop every cached client. Connections close as the last clone of
    /// each client goes away.
    pub async fn close_all(&self) {
        let mut guard = self.clients.lock().await;
        let count = guard.len();
        guard.clear();
        debug!(event = "connection_pools_closed", pool_count = count);
    }

    pub async fn pool_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_reuses_one_client() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let _a = pool
            .get_client(Some("https://api.anthropic.com"), None)
            .await
            .unwrap();
        let _b = pool
            .get_client(Some("https://api.anthropic.com"), None)
            .await
            .unwrap();
        assert_eq!(pool.pool_count().await, 1);
    }

    #[tokio::test]
    async fn streaming_timeout_is_a_distinct_key() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let _a = pool.get_client(Some("https://x"), None).await.unwrap();
        let _b = pool.get_streaming_client(Some("https://x")).await.unwrap();
        assert_eq!(pool.pool_count().await, 2);
    }

    #[tokio::test]
    async fn close_all_empties_the_cache() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let _ = pool.get_client(None, None).await.unwrap();
        pool.close_all().await;
        assert_eq!(pool.pool_count().await, 0);
    }
}
