//! Device registry: which device is reachable over which connection.
//!
//! Two indexes for fast lookups:
//! - `by_device`: device_id → connection handle ("where do I deliver to this device?")
//! - `by_connection`: connection_id → device_id ("who sent this message?")
//!
//! Both maps live behind a single lock so they are always updated together.
//! Registration is last-write-wins: registering an id that is already taken
//! silently moves it to the new connection and the old connection is not told.

use crate::connection::{ConnectionHandle, ConnectionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct RegistryMaps {
    by_device: HashMap<String, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, String>,
}

/// What a registration replaced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registration {
    /// Another connection that owned this device id until now
    pub displaced: Option<ConnectionId>,
    /// A different device id this connection owned until now
    pub released: Option<String>,
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    maps: Arc<RwLock<RegistryMaps>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `device_id` to `connection`, overwriting whatever either side was bound to.
    pub async fn register(&self, device_id: String, connection: ConnectionHandle) -> Registration {
        let mut guard = self.maps.write().await;
        let maps = &mut *guard;
        let conn_id = connection.id();

        // A connection owns at most one device id
        let released = match maps.by_connection.get(&conn_id) {
            Some(previous) if *previous != device_id => {
                let previous = previous.clone();
                maps.by_device.remove(&previous);
                Some(previous)
            }
            _ => None,
        };

        let displaced = maps
            .by_device
            .insert(device_id.clone(), connection)
            .map(|old| old.id())
            .filter(|old| *old != conn_id);

        if let Some(old) = displaced {
            maps.by_connection.remove(&old);
        }
        maps.by_connection.insert(conn_id, device_id);

        Registration {
            displaced,
            released,
        }
    }

    pub async fn lookup_by_id(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.maps.read().await.by_device.get(device_id).cloned()
    }

    pub async fn lookup_by_connection(&self, connection: ConnectionId) -> Option<String> {
        self.maps.read().await.by_connection.get(&connection).cloned()
    }

    /// Drop whatever `connection` registered. Returns the freed device id.
    pub async fn remove(&self, connection: ConnectionId) -> Option<String> {
        let mut guard = self.maps.write().await;
        let maps = &mut *guard;
        let device_id = maps.by_connection.remove(&connection)?;

        if maps
            .by_device
            .get(&device_id)
            .is_some_and(|owner| owner.id() == connection)
        {
            maps.by_device.remove(&device_id);
        }

        Some(device_id)
    }

    /// Number of registered devices.
    pub async fn count(&self) -> usize {
        self.maps.read().await.by_device.len()
    }

    #[cfg(test)]
    async fn is_consistent(&self) -> bool {
        let maps = self.maps.read().await;
        maps.by_device.len() == maps.by_connection.len()
            && maps.by_device.iter().all(|(device, handle)| {
                maps.by_connection.get(&handle.id()) == Some(device)
            })
    }
}
