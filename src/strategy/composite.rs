//! Filter→select composition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proxy::Proxy;
use crate::strategy::{
    Outcome, RotationStrategy, SelectionContext, StrategyRegistry, ViewFilter,
};

/// String-named description of a composite, as carried in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeConfig {
    /// Filter names, applied in order.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Selector name, run on the final narrowed view.
    pub selector: String,
}

/// Applies each filter in order, each narrowing the view, then delegates
/// the pick to the selector. The composite owns its parts; it is the only
/// strategy holding references to other strategies.
#[derive(Debug)]
pub struct CompositeStrategy {
    filters: Vec<Arc<dyn ViewFilter>>,
    selector: Arc<dyn RotationStrategy>,
}

impl CompositeStrategy {
    pub fn new(filters: Vec<Arc<dyn ViewFilter>>, selector: Arc<dyn RotationStrategy>) -> Self {
        CompositeStrategy { filters, selector }
    }

    /// Resolve a configuration map against the registry.
    pub fn from_config(config: &CompositeConfig, registry: &StrategyRegistry) -> Result<Self> {
        let filters = config
            .filters
            .iter()
            .map(|name| registry.get_filter(name))
            .collect::<Result<Vec<_>>>()?;
        let selector = registry.get(&config.selector)?;
        Ok(CompositeStrategy { filters, selector })
    }
}

impl RotationStrategy for CompositeStrategy {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let mut narrowed: Vec<Proxy> = view.to_vec();
        for filter in &self.filters {
            narrowed = filter.filter(&narrowed, ctx);
        }
        self.selector.select(&narrowed, ctx)
    }

    fn record_result(&self, proxy: &Proxy, outcome: &Outcome) {
        self.selector.record_result(proxy, outcome);
    }
}
