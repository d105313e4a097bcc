//! Enumerates capture-capable interfaces at startup and reconciles each
//! with its persisted identity.

use crate::db::Store;
use crate::error::NetmonError;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::RwLock;

/// An interface with its store-assigned stable id.
#[derive(Debug, Clone)]
pub struct RegisteredInterface {
    pub id: i64,
    pub name: String,
    pub description: String,
}

/// Read-mostly name-to-id table. Populated once under the write lock at
/// startup; capture tasks only read afterwards.
pub struct InterfaceRegistry {
    ids: RwLock<HashMap<String, i64>>,
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        InterfaceRegistry {
            ids: RwLock::new(HashMap::new()),
        }
    }

    /// Queries the platform for capture-capable interfaces and upserts each
    /// into the store, returning the registered set with assigned ids.
    pub fn enumerate_and_register(
        &self,
        store: &Store,
    ) -> Result<Vec<RegisteredInterface>, NetmonError> {
        let devices =
            pcap::Device::list().map_err(|e| NetmonError::CaptureLibraryMissing(e.to_string()))?;
        if devices.is_empty() {
            return Err(NetmonError::NoInterfacesFound);
        }

        let pairs: Vec<(String, String)> = devices
            .into_iter()
            .map(|d| (d.name, d.desc.unwrap_or_default()))
            .collect();
        self.register_all(store, &pairs)
    }

    /// Registers a known set of (name, description) pairs. A store failure
    /// for one interface skips that interface only.
    pub fn register_all(
        &self,
        store: &Store,
        pairs: &[(String, String)],
    ) -> Result<Vec<RegisteredInterface>, NetmonError> {
        let mut registered = Vec::new();
        let mut ids = self.ids.write().unwrap();

        for (name, description) in pairs {
            match store.upsert_interface(name, description) {
                Ok(id) => {
                    ids.insert(name.clone(), id);
                    info!("found interface: {} ({})", name, description);
                    registered.push(RegisteredInterface {
                        id,
                        name: name.clone(),
                        description: description.clone(),
                    });
                }
                Err(e) => debug!("error storing interface {}: {}", name, e),
            }
        }

        if registered.is_empty() {
            return Err(NetmonError::NoInterfacesFound);
        }
        Ok(registered)
    }

    pub fn id_for(&self, name: &str) -> Option<i64> {
        self.ids.read().unwrap().get(name).copied()
    }
}
