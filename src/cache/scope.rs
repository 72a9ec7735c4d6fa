//! Per-index cache enablement.

use dashmap::DashMap;
use tracing::info;

/// Resolves whether a scope exists and has caching switched on.
///
/// Consulted on every cacheability check, so answers always reflect the
/// current settings rather than a copy taken at startup.
pub trait ScopeSettings: Send + Sync {
    fn exists(&self, scope: &str) -> bool;

    fn is_enabled_for(&self, scope: &str) -> bool;
}

/// In-process index registry. Indices are registered with caching disabled
/// unless stated otherwise.
#[derive(Debug, Default)]
pub struct IndexSettingsRegistry {
    indices: DashMap<String, bool>,
}

impl IndexSettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every listed index present and enabled.
    pub fn with_enabled<I, S>(indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for index in indices {
            registry.register(index, true);
        }
        registry
    }

    pub fn register(&self, index: impl Into<String>, enabled: bool) {
        self.indices.insert(index.into(), enabled);
    }

    pub fn set_enabled(&self, index: &str, enabled: bool) -> bool {
        match self.indices.get_mut(index) {
            Some(mut flag) => {
                *flag = enabled;
                info!(index, enabled, "Query result cache setting changed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl ScopeSettings for IndexSettingsRegistry {
    fn exists(&self, scope: &str) -> bool {
        self.indices.contains_key(scope)
    }

    fn is_enabled_for(&self, scope: &str) -> bool {
        self.indices.get(scope).is_some_and(|flag| *flag)
    }
}
