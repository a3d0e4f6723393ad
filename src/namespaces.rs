//! Namespace registry seam.
//!
//! The matching layer needs two facts about a namespace: its display
//! name and whether it is active on this cluster. Standby namespaces
//! skip sync match entirely (tasks spill straight to the store) and
//! their pollers are served queries only.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::MatchingError;

#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub name: String,
    pub active: bool,
}

pub trait NamespaceRegistry: Send + Sync {
    fn get(&self, namespace_id: &str) -> Result<NamespaceInfo, MatchingError>;
}

/// Registry backed by a fixed map, for single-cluster deployments and
/// tests.
#[derive(Default)]
pub struct StaticNamespaceRegistry {
    entries: RwLock<HashMap<String, NamespaceInfo>>,
}

impl StaticNamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(self, id: impl Into<String>, name: impl Into<String>, active: bool) -> Self {
        self.insert(id, name, active);
        self
    }

    pub fn insert(&self, id: impl Into<String>, name: impl Into<String>, active: bool) {
        self.entries.write().unwrap().insert(
            id.into(),
            NamespaceInfo {
                name: name.into(),
                active,
            },
        );
    }

    pub fn set_active(&self, id: &str, active: bool) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(id) {
            entry.active = active;
        }
    }
}

impl NamespaceRegistry for StaticNamespaceRegistry {
    fn get(&self, namespace_id: &str) -> Result<NamespaceInfo, MatchingError> {
        self.entries
            .read()
            .unwrap()
            .get(namespace_id)
            .cloned()
            .ok_or_else(|| MatchingError::NamespaceNotFound(namespace_id.to_string()))
    }
}
