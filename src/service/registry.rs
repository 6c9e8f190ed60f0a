use std::collections::HashMap;

use log::debug;
use tokio::sync::RwLock;

use super::connection::ControllerHandle;

/// Name-keyed index of live connection controllers, used to route outbound
/// orders. Controllers insert themselves on spawn and remove themselves on
/// termination.
#[derive(Default)]
pub struct ControllerRegistry {
    inner: RwLock<HashMap<String, Vec<ControllerHandle>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: ControllerHandle) {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entry(handle.instrument_name().to_string())
            .or_default();
        debug!(
            "Registering controller {} for {} ({} now live)",
            handle.controller_id(),
            handle.instrument_name(),
            entry.len() + 1
        );
        entry.push(handle);
    }

    pub async fn remove(&self, instrument_name: &str, controller_id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(instrument_name) {
            entry.retain(|h| h.controller_id() != controller_id);
            if entry.is_empty() {
                inner.remove(instrument_name);
            }
        }
        debug!(
            "Deregistered controller {} for {}",
            controller_id, instrument_name
        );
    }

    /// The first live controller for an instrument, if any
    pub async fn get(&self, instrument_name: &str) -> Option<ControllerHandle> {
        let inner = self.inner.read().await;
        inner
            .get(instrument_name)?
            .iter()
            .find(|h| h.is_alive())
            .cloned()
    }

    /// Number of live controllers for an instrument
    pub async fn connection_count(&self, instrument_name: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .get(instrument_name)
            .map(|entry| entry.iter().filter(|h| h.is_alive()).count())
            .unwrap_or(0)
    }

    /// All live controllers, for status snapshots
    pub async fn all(&self) -> Vec<ControllerHandle> {
        let inner = self.inner.read().await;
        inner
            .values()
            .flatten()
            .filter(|h| h.is_alive())
            .cloned()
            .collect()
    }
}
