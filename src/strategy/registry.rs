//! Process-wide registry of named strategy factories.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::strategy::{
    GeoTargeted, LeastUsed, PerformanceBased, Random, RotationStrategy, RoundRobin,
    SessionPersistence, ViewFilter, Weighted,
};

type StrategyFactory = Box<dyn Fn() -> Arc<dyn RotationStrategy> + Send + Sync>;
type FilterFactory = Box<dyn Fn() -> Arc<dyn ViewFilter> + Send + Sync>;

static REGISTRY: OnceLock<StrategyRegistry> = OnceLock::new();

/// Map from name to strategy factory, so strategies can be chosen from
/// configuration and plugins can hook in at runtime.
///
/// Registration replaces silently; state is append-mostly, so a `RwLock`
/// over the map keeps lookups cheap while registration stays rare.
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<String, StrategyFactory>>,
    filters: RwLock<HashMap<String, FilterFactory>>,
}

impl StrategyRegistry {
    /// Empty registry, mainly for tests and embedders that want full
    /// control over the name space.
    pub fn new() -> Self {
        StrategyRegistry {
            strategies: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide singleton, with all built-ins pre-registered on
    /// first access.
    pub fn global() -> &'static StrategyRegistry {
        REGISTRY.get_or_init(StrategyRegistry::with_builtins)
    }

    fn with_builtins() -> Self {
        let registry = StrategyRegistry::new();
        registry.register(RoundRobin::NAME, || Arc::new(RoundRobin::new()));
        registry.register(Random::NAME, || Arc::new(Random::new()));
        registry.register(Weighted::NAME, || Arc::new(Weighted::default()));
        registry.register(LeastUsed::NAME, || Arc::new(LeastUsed::new()));
        registry.register(PerformanceBased::NAME, || {
            Arc::new(PerformanceBased::default())
        });
        registry.register(SessionPersistence::NAME, || {
            Arc::new(SessionPersistence::new())
        });
        registry.register(GeoTargeted::NAME, || Arc::new(GeoTargeted::new()));
        registry.register_filter(GeoTargeted::NAME, || Arc::new(GeoTargeted::new()));
        registry
    }

    /// Register (or replace) a strategy factory under `name`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn RotationStrategy> + Send + Sync + 'static,
    {
        self.strategies.write().insert(name.into(), Box::new(factory));
    }

    /// Register (or replace) a view-filter factory under `name`.
    pub fn register_filter<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ViewFilter> + Send + Sync + 'static,
    {
        self.filters.write().insert(name.into(), Box::new(factory));
    }

    /// Instantiate the strategy registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn RotationStrategy>> {
        self.strategies
            .read()
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::InvalidStrategy(name.to_string()))
    }

    /// Instantiate the filter registered under `name`.
    pub fn get_filter(&self, name: &str) -> Result<Arc<dyn ViewFilter>> {
        self.filters
            .read()
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::InvalidStrategy(name.to_string()))
    }

    /// Currently registered strategy names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
