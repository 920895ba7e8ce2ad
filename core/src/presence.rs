//! Worker presence: each worker publishes its external address under
//! `worker_ip:{host}` and keeps it fresh while it runs.

use std::sync::Arc;
use std::time::Duration;

use scanfleet_common::config::WorkerConfig;
use scanfleet_common::records::WorkerAddress;
use tracing::{debug, warn};

use crate::store::{CoordinationStore, StoreError};

const UNKNOWN_ADDRESS: &str = "unknown";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// This host's address as seen from outside, or `"unknown"`.
pub async fn lookup_external_address(client: &reqwest::Client, url: &str) -> String {
    let response = match client.get(url).timeout(LOOKUP_TIMEOUT).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("External address lookup failed: {e}");
            return UNKNOWN_ADDRESS.to_string();
        }
    };

    match response.error_for_status() {
        Ok(response) => match response.text().await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => UNKNOWN_ADDRESS.to_string(),
            Err(e) => {
                warn!("External address lookup failed: {e}");
                UNKNOWN_ADDRESS.to_string()
            }
        },
        Err(e) => {
            warn!("External address lookup failed: {e}");
            UNKNOWN_ADDRESS.to_string()
        }
    }
}

pub async fn register_worker_address(
    store: &dyn CoordinationStore,
    client: &reqwest::Client,
    config: &WorkerConfig,
) -> Result<WorkerAddress, StoreError> {
    let address = WorkerAddress {
        ip: lookup_external_address(client, &config.address_lookup_url).await,
        last_updated: chrono::Utc::now().timestamp(),
    };
    store
        .register_worker_address(&config.hostname, &address, config.presence_ttl)
        .await?;
    debug!("Registered {} as {}", config.hostname, address.ip);
    Ok(address)
}

/// Re-registers every half TTL, forever.
pub async fn keep_registered(store: Arc<dyn CoordinationStore>, config: Arc<WorkerConfig>) {
    let client = reqwest::Client::new();
    let period: Duration = (config.presence_ttl / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;
        if let Err(e) = register_worker_address(store.as_ref(), &client, &config).await {
            warn!("Failed to register worker address: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn registers_looked_up_address() {
        let url = echo_server("203.0.113.7\n").await;
        let store = InMemoryStore::new("nmap");
        let config = WorkerConfig {
            hostname: "worker-a".into(),
            address_lookup_url: url,
            ..WorkerConfig::default()
        };

        let address = register_worker_address(&store, &reqwest::Client::new(), &config)
            .await
            .unwrap();

        assert_eq!(address.ip, "203.0.113.7");
        assert_eq!(store.worker_address("worker-a").await.unwrap(), Some(address));
    }

    #[tokio::test]
    async fn unreachable_lookup_is_unknown() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let ip = lookup_external_address(&reqwest::Client::new(), &url).await;
        assert_eq!(ip, "unknown");
    }
}
