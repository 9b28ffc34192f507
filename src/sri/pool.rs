use std::{collections::HashMap, time::Duration};

use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::AuthorityError;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// HTTP clients keyed by endpoint URL. Owned by the process and torn down
/// explicitly with [`SoapClientPool::shutdown`].
pub struct SoapClientPool {
    settings: ClientSettings,
    clients: RwLock<HashMap<String, Client>>,
}

impl SoapClientPool {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn client_for(&self, endpoint: &str) -> Result<Client, AuthorityError> {
        if let Some(client) = self.clients.read().await.get(endpoint) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .timeout(self.settings.request_timeout)
            .pool_idle_timeout(self.settings.idle_timeout)
            .gzip(true)
            .build()
            .map_err(|err| AuthorityError::Client(err.to_string()))?;
        debug!(%endpoint, "created authority client");
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every cached client; later calls build fresh ones.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        let released = clients.len();
        clients.clear();
        info!(released, "authority client pool shut down");
    }
}
