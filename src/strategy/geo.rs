//! Geo-targeted filter-then-select.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::strategy::{Outcome, RotationStrategy, RoundRobin, SelectionContext, ViewFilter};

/// Narrows the view to the requested country (or, failing that, region)
/// and delegates the final pick to a secondary strategy.
///
/// Country takes precedence over region. With neither set, no filter is
/// applied. When the filter leaves nothing, the default is to fall back to
/// the full view; `strict()` fails with `NoProxiesAvailable` instead.
pub struct GeoTargeted {
    selector: Arc<dyn RotationStrategy>,
    fallback_to_full: bool,
}

impl GeoTargeted {
    pub const NAME: &'static str = "geo-targeted";

    pub fn new() -> Self {
        GeoTargeted {
            selector: Arc::new(RoundRobin::new()),
            fallback_to_full: true,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn RotationStrategy>) -> Self {
        self.selector = selector;
        self
    }

    /// Fail instead of falling back when no proxy matches the geo target.
    pub fn strict(mut self) -> Self {
        self.fallback_to_full = false;
        self
    }

    fn narrow(view: &[Proxy], ctx: &SelectionContext) -> Vec<Proxy> {
        if let Some(country) = &ctx.target_country {
            return view
                .iter()
                .filter(|p| p.country_code.as_deref() == Some(country.as_str()))
                .cloned()
                .collect();
        }
        if let Some(region) = &ctx.target_region {
            return view
                .iter()
                .filter(|p| p.region.as_deref() == Some(region.as_str()))
                .cloned()
                .collect();
        }
        view.to_vec()
    }
}

impl Default for GeoTargeted {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for GeoTargeted {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let narrowed = Self::narrow(view, ctx);
        if !narrowed.is_empty() {
            return self.selector.select(&narrowed, ctx);
        }
        if self.fallback_to_full {
            self.selector.select(view, ctx)
        } else {
            Err(Error::NoProxiesAvailable)
        }
    }

    fn record_result(&self, proxy: &Proxy, outcome: &Outcome) {
        self.selector.record_result(proxy, outcome);
    }
}

impl ViewFilter for GeoTargeted {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn filter(&self, view: &[Proxy], ctx: &SelectionContext) -> Vec<Proxy> {
        let narrowed = Self::narrow(view, ctx);
        if narrowed.is_empty() && self.fallback_to_full {
            view.to_vec()
        } else {
            narrowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::make_proxy;

    fn geo_view() -> Vec<Proxy> {
        vec![
            make_proxy(0).with_country("US").with_region("NA"),
            make_proxy(1).with_country("US").with_region("NA"),
            make_proxy(2).with_country("DE").with_region("EU"),
            make_proxy(3).with_country("JP").with_region("APAC"),
        ]
    }

    #[test]
    fn country_filter_is_exact() {
        let view = geo_view();
        let strategy = GeoTargeted::new();
        let ctx = SelectionContext::new().with_target_country("US");

        for _ in 0..100 {
            let picked = strategy.select(&view, &ctx).unwrap();
            assert_eq!(picked.country_code.as_deref(), Some("US"));
        }
    }

    #[test]
    fn country_takes_precedence_over_region() {
        let view = geo_view();
        let strategy = GeoTargeted::new();
        let ctx = SelectionContext::new()
            .with_target_country("JP")
            .with_target_region("EU");

        let picked = strategy.select(&view, &ctx).unwrap();
        assert_eq!(picked.country_code.as_deref(), Some("JP"));
    }

    #[test]
    fn region_filter_applies_without_country() {
        let view = geo_view();
        let strategy = GeoTargeted::new();
        let ctx = SelectionContext::new().with_target_region("EU");

        let picked = strategy.select(&view, &ctx).unwrap();
        assert_eq!(picked.region.as_deref(), Some("EU"));
    }

    #[test]
    fn no_targets_means_no_filter() {
        let view = geo_view();
        let strategy = GeoTargeted::new();
        let ctx = SelectionContext::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(strategy.select(&view, &ctx).unwrap().id);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn empty_match_falls_back_by_default() {
        let view = geo_view();
        let strategy = GeoTargeted::new();
        let ctx = SelectionContext::new().with_target_country("BR");

        assert!(strategy.select(&view, &ctx).is_ok());
    }

    #[test]
    fn strict_mode_fails_on_empty_match() {
        let view = geo_view();
        let strategy = GeoTargeted::new().strict();
        let ctx = SelectionContext::new().with_target_country("BR");

        assert!(matches!(
            strategy.select(&view, &ctx),
            Err(Error::NoProxiesAvailable)
        ));
    }

    #[test]
    fn filter_view_narrows_for_composition() {
        let view = geo_view();
        let filter = GeoTargeted::new();
        let ctx = SelectionContext::new().with_target_country("US");

        let narrowed = filter.filter(&view, &ctx);
        assert_eq!(narrowed.len(), 2);
        assert!(narrowed
            .iter()
            .all(|p| p.country_code.as_deref() == Some("US")));
    }
}
