use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::pipeline_config::DestinationSettings},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    address: String,
    namespace: String,
    database: String,
    username: Option<String>,
}

impl ConnectionKey {
    fn for_settings(settings: &DestinationSettings) -> Self {
        Self {
            address: settings.address.clone(),
            namespace: settings.namespace.clone(),
            database: settings.database.clone(),
            username: settings.credentials.as_ref().map(|c| c.username.clone()),
        }
    }
}

/// A connected destination together with the settings it was opened for.
#[derive(Clone)]
pub struct DestinationHandle {
    pub db: Arc<SurrealDbClient>,
    pub settings: DestinationSettings,
}

/// Reuses one client per destination database across pipeline runs.
#[derive(Default)]
pub struct DestinationPool {
    clients: Mutex<HashMap<ConnectionKey, Arc<SurrealDbClient>>>,
}

impl DestinationPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected client for `settings`, opening a new connection on first use.
    pub async fn handle(&self, settings: &DestinationSettings) -> Result<DestinationHandle, AppError> {
        let key = ConnectionKey::for_settings(settings);
        let mut clients = self.clients.lock().await;

        if let Some(db) = clients.get(&key) {
            debug!(address = %key.address, namespace = %key.namespace, database = %key.database, "Reusing destination connection");
            return Ok(DestinationHandle {
                db: Arc::clone(db),
                settings: settings.clone(),
            });
        }

        let credentials = settings
            .credentials
            .as_ref()
            .map(|c| (c.username.as_str(), c.password.as_str()));

        let db = SurrealDbClient::connect_with(
            &settings.address,
            credentials,
            &settings.namespace,
            &settings.database,
        )
        .await
        .map_err(|e| {
            AppError::Connection(format!(
                "connecting to destination {} ({}/{}): {e}",
                settings.address, settings.namespace, settings.database
            ))
        })?;

        info!(address = %key.address, namespace = %key.namespace, database = %key.database, "Opened destination connection");
        let db = Arc::new(db);
        clients.insert(key, Arc::clone(&db));

        Ok(DestinationHandle {
            db,
            settings: settings.clone(),
        })
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Drop every pooled connection. Handles already given out stay usable.
    pub async fn shutdown(&self) {
        let drained = self.clients.lock().await.drain().count();
        info!(connections = drained, "Destination pool closed");
    }
}
