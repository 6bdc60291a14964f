//! Durable adapter declarations.
//!
//! The store records what the user asked for. What is actually fused into the
//! live runtime is tracked separately by [`crate::AdapterComposer`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AdapterSpec, ArchitectureFamily, EaselError, Result, MAX_ACTIVE_ADAPTERS};

pub const MIN_ADAPTER_WEIGHT: f64 = -1.0;
pub const MAX_ADAPTER_WEIGHT: f64 = 2.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterDeclaration {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    pub family: ArchitectureFamily,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    pub weight: f64,
    #[serde(default)]
    pub active: bool,
}

impl AdapterDeclaration {
    pub fn spec(&self) -> AdapterSpec {
        AdapterSpec {
            name: self.name.clone(),
            path: self.path.clone(),
            weight: self.weight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAdapter {
    pub name: String,
    pub path: PathBuf,
    pub family: ArchitectureFamily,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    pub weight: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterUpdate {
    pub name: Option<String>,
    pub weight: Option<f64>,
    pub trigger_words: Option<Vec<String>>,
}

fn check_weight(weight: f64) -> Result<()> {
    if !(MIN_ADAPTER_WEIGHT..=MAX_ADAPTER_WEIGHT).contains(&weight) {
        return Err(EaselError::InvalidInput(format!(
            "adapter weight {weight} is outside [{MIN_ADAPTER_WEIGHT}, {MAX_ADAPTER_WEIGHT}]"
        )));
    }
    Ok(())
}

pub trait AdapterStore: Send + Sync {
    fn list(&self) -> Vec<AdapterDeclaration>;

    fn get(&self, id: u64) -> Option<AdapterDeclaration>;

    fn add(&self, adapter: NewAdapter) -> Result<AdapterDeclaration>;

    fn update(&self, id: u64, update: AdapterUpdate) -> Result<AdapterDeclaration>;

    /// Activating a sixth adapter fails with `AdapterLimitExceeded`.
    fn set_active(&self, id: u64, active: bool) -> Result<AdapterDeclaration>;

    /// Returns how many declarations were deactivated.
    fn deactivate_all(&self) -> usize;

    fn delete(&self, id: u64) -> Result<AdapterDeclaration>;

    /// Active declarations in creation order.
    fn active(&self) -> Vec<AdapterDeclaration> {
        self.list().into_iter().filter(|a| a.active).collect()
    }
}

#[derive(Default)]
pub struct InMemoryAdapterStore {
    adapters: DashMap<u64, AdapterDeclaration>,
    next_id: AtomicU64,
    activation: Mutex<()>,
}

impl InMemoryAdapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: u64) -> EaselError {
        EaselError::InvalidInput(format!("no adapter with id {id}"))
    }
}

impl AdapterStore for InMemoryAdapterStore {
    fn list(&self) -> Vec<AdapterDeclaration> {
        let mut all: Vec<_> = self.adapters.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|a| a.id);
        all
    }

    fn get(&self, id: u64) -> Option<AdapterDeclaration> {
        self.adapters.get(&id).map(|e| e.value().clone())
    }

    fn add(&self, adapter: NewAdapter) -> Result<AdapterDeclaration> {
        check_weight(adapter.weight)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let declaration = AdapterDeclaration {
            id,
            name: adapter.name,
            path: adapter.path,
            family: adapter.family,
            trigger_words: adapter.trigger_words,
            weight: adapter.weight,
            active: false,
        };
        info!(id, name = %declaration.name, "added adapter");
        self.adapters.insert(id, declaration.clone());
        Ok(declaration)
    }

    fn update(&self, id: u64, update: AdapterUpdate) -> Result<AdapterDeclaration> {
        if let Some(weight) = update.weight {
            check_weight(weight)?;
        }
        let mut entry = self.adapters.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(weight) = update.weight {
            entry.weight = weight;
        }
        if let Some(words) = update.trigger_words {
            entry.trigger_words = words;
        }
        Ok(entry.clone())
    }

    fn set_active(&self, id: u64, active: bool) -> Result<AdapterDeclaration> {
        let _guard = self.activation.lock().unwrap_or_else(|e| e.into_inner());
        if active {
            let others = self
                .adapters
                .iter()
                .filter(|e| e.value().active && *e.key() != id)
                .count();
            if others >= MAX_ACTIVE_ADAPTERS {
                return Err(EaselError::AdapterLimitExceeded {
                    requested: others + 1,
                    max: MAX_ACTIVE_ADAPTERS,
                });
            }
        }
        let mut entry = self.adapters.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        entry.active = active;
        info!(id, name = %entry.name, active, "changed adapter activation");
        Ok(entry.clone())
    }

    fn deactivate_all(&self) -> usize {
        let _guard = self.activation.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for mut entry in self.adapters.iter_mut() {
            if entry.active {
                entry.active = false;
                changed += 1;
            }
        }
        changed
    }

    fn delete(&self, id: u64) -> Result<AdapterDeclaration> {
        self.adapters
            .remove(&id)
            .map(|(_, declaration)| declaration)
            .ok_or_else(|| Self::not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_adapter(name: &str, weight: f64) -> NewAdapter {
        NewAdapter {
            name: name.to_string(),
            path: PathBuf::from(format!("/loras/{name}.safetensors")),
            family: ArchitectureFamily::Sdxl,
            trigger_words: vec![],
            weight,
        }
    }

    #[test]
    fn sixth_activation_is_refused() {
        let store = InMemoryAdapterStore::new();
        let ids: Vec<u64> = (0..6)
            .map(|i| store.add(new_adapter(&format!("a{i}"), 1.0)).unwrap().id)
            .collect();
        for id in &ids[..5] {
            store.set_active(*id, true).unwrap();
        }
        let err = store.set_active(ids[5], true).unwrap_err();
        assert!(matches!(
            err,
            EaselError::AdapterLimitExceeded { requested: 6, max: 5 }
        ));
        assert_eq!(store.active().len(), 5);

        // re-activating an already active adapter does not count twice
        store.set_active(ids[0], true).unwrap();
        store.set_active(ids[0], false).unwrap();
        store.set_active(ids[5], true).unwrap();
        assert_eq!(store.deactivate_all(), 5);
        assert!(store.active().is_empty());
    }

    #[test]
    fn weight_bounds_are_enforced() {
        let store = InMemoryAdapterStore::new();
        assert!(store.add(new_adapter("hot", 2.5)).is_err());
        let a = store.add(new_adapter("neg", -1.0)).unwrap();
        assert!(store
            .update(a.id, AdapterUpdate { weight: Some(-1.5), ..Default::default() })
            .is_err());
        let updated = store
            .update(a.id, AdapterUpdate { weight: Some(0.5), name: Some("soft".into()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.weight, 0.5);
        assert_eq!(store.get(a.id).unwrap().name, "soft");
    }

    #[test]
    fn active_keeps_creation_order_and_delete_removes() {
        let store = InMemoryAdapterStore::new();
        let x = store.add(new_adapter("x", 1.0)).unwrap();
        let y = store.add(new_adapter("y", 0.5)).unwrap();
        store.set_active(y.id, true).unwrap();
        store.set_active(x.id, true).unwrap();
        let names: Vec<_> = store.active().into_iter().map(|a| a.name).collect();
        assert_eq!(names, ["x", "y"]);
        store.delete(x.id).unwrap();
        assert!(store.delete(x.id).is_err());
        assert_eq!(store.list().len(), 1);
    }
}
