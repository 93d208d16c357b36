use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Latest known state string of every entity seen on the bus, plus a
/// broadcast of entity ids whose state changed.
#[derive(Debug, Clone)]
pub struct EntityStates {
    states: Arc<RwLock<HashMap<String, String>>>,
    changes: broadcast::Sender<String>,
}

impl Default for EntityStates {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStates {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    pub fn read(&self, entity: &str) -> Option<String> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned()
    }

    /// Stores a new state. Returns true and notifies subscribers when the
    /// value differs from the previous one.
    pub fn update(&self, entity: &str, state: &str) -> bool {
        let changed = {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            match states.get(entity) {
                Some(previous) if previous == state => false,
                _ => {
                    states.insert(entity.to_string(), state.to_string());
                    true
                }
            }
        };

        if changed {
            // No receivers simply means nobody is watching yet.
            let _ = self.changes.send(entity.to_string());
        }
        changed
    }

    /// Forgets an entity, which makes it unavailable to readers.
    pub fn remove(&self, entity: &str) -> bool {
        let removed = self
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity)
            .is_some();
        if removed {
            let _ = self.changes.send(entity.to_string());
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_notifies_only_on_change() {
        let entities = EntityStates::new();
        let mut changes = entities.subscribe();

        assert!(entities.update("binary_sensor.window", "off"));
        assert!(!entities.update("binary_sensor.window", "off"));
        assert!(entities.update("binary_sensor.window", "on"));

        assert_eq!(changes.recv().await.unwrap(), "binary_sensor.window");
        assert_eq!(changes.recv().await.unwrap(), "binary_sensor.window");
        assert!(changes.try_recv().is_err());
        assert_eq!(entities.read("binary_sensor.window").as_deref(), Some("on"));
    }

    #[test]
    fn removed_entity_is_unavailable() {
        let entities = EntityStates::new();
        entities.update("climate.trv", "heat");

        assert!(entities.remove("climate.trv"));
        assert_eq!(entities.read("climate.trv"), None);
        assert!(!entities.remove("climate.trv"));
    }
}
