//! Registry of processing devices ("clients") known to the hub.

use crate::device::{BridgeError, DeviceClient, DeviceConnector};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised by client registration.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client {0} already exists")]
    Duplicate(String),

    #[error("Could not connect client {id}: {source}")]
    Connection {
        id: String,
        #[source]
        source: BridgeError,
    },
}

/// A registered processing device.
#[derive(Clone)]
pub struct Client {
    pub id: String,
    pub address: String,
    pub device: Arc<dyn DeviceClient>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Client id to connected device.
pub struct ClientRegistry {
    connector: Arc<dyn DeviceConnector>,
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientRegistry {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a client and connect to its device.
    ///
    /// Duplicate ids are rejected. The connection is opened before the
    /// client becomes visible; on failure nothing is registered.
    pub async fn add_client(&self, id: &str, address: &str) -> Result<(), ClientError> {
        if self.clients.read().contains_key(id) {
            warn!(client_id = %id, "Client already exists");
            return Err(ClientError::Duplicate(id.to_string()));
        }

        let device = self
            .connector
            .connect(address)
            .await
            .map_err(|source| ClientError::Connection {
                id: id.to_string(),
                source,
            })?;

        let mut clients = self.clients.write();
        // a concurrent add may have won while we were connecting
        if clients.contains_key(id) {
            warn!(client_id = %id, "Client already exists");
            return Err(ClientError::Duplicate(id.to_string()));
        }
        clients.insert(
            id.to_string(),
            Client {
                id: id.to_string(),
                address: address.to_string(),
                device,
            },
        );

        info!(client_id = %id, address = %address, "Client added");
        Ok(())
    }

    /// Remove a client, releasing its device connection.
    pub fn remove_client(&self, id: &str) -> Option<Client> {
        let removed = self.clients.write().remove(id);
        match &removed {
            Some(client) => info!(client_id = %id, address = %client.address, "Client removed"),
            None => warn!(client_id = %id, "Client does not exist"),
        }
        removed
    }

    /// Snapshot of registered client ids.
    pub fn list_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().get(id).cloned()
    }

    /// Device handle of a registered client.
    pub fn device(&self, id: &str) -> Option<Arc<dyn DeviceClient>> {
        self.clients.read().get(id).map(|c| c.device.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }
}
