//! Process-wide lookup of pool managers by identity

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::manager::PoolManager;

static GLOBAL: LazyLock<PoolRegistry> = LazyLock::new(PoolRegistry::new);

/// Registry of live [`PoolManager`]s keyed by their identity token
///
/// Holds weak references only; a manager dropped without being
/// unregistered disappears from lookups.
#[derive(Default)]
pub struct PoolRegistry {
    managers: RwLock<HashMap<Uuid, Weak<PoolManager>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static PoolRegistry {
        &GLOBAL
    }

    pub fn register(&self, manager: &Arc<PoolManager>) {
        tracing::debug!(manager_id = %manager.id(), "registering pool manager");
        self.managers
            .write()
            .insert(manager.id(), Arc::downgrade(manager));
    }

    /// Returns whether the id was registered
    pub fn unregister(&self, id: Uuid) -> bool {
        self.managers.write().remove(&id).is_some()
    }

    pub fn lookup(&self, id: Uuid) -> Option<Arc<PoolManager>> {
        let found = self.managers.read().get(&id).map(Weak::upgrade);
        match found {
            Some(Some(manager)) => Some(manager),
            Some(None) => {
                self.managers.write().remove(&id);
                None
            }
            None => None,
        }
    }

    /// Ids of every registered manager still alive
    pub fn ids(&self) -> Vec<Uuid> {
        let mut managers = self.managers.write();
        managers.retain(|_, manager| manager.strong_count() > 0);
        managers.keys().copied().collect()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("managers", &self.managers.read().len())
            .finish()
    }
}
