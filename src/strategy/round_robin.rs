//! Round-robin selection.

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};

/// Cycles through the view in order. The cursor advances exactly once per
/// `select` call; skipping failed proxies scans forward without consuming
/// extra cursor positions, so a stable view of N proxies sees each of them
/// exactly k times over k·N selections.
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub const NAME: &'static str = "round-robin";

    pub fn new() -> Self {
        RoundRobin {
            cursor: Mutex::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        if view.is_empty() {
            return Err(Error::NoProxiesAvailable);
        }

        let start = {
            let mut cursor = self.cursor.lock();
            let start = *cursor;
            *cursor = cursor.wrapping_add(1);
            start
        };

        for offset in 0..view.len() {
            let candidate = &view[(start + offset) % view.len()];
            if !ctx.is_failed(candidate.id) {
                return Ok(candidate.clone());
            }
        }
        Err(Error::NoProxiesAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::make_view;

    #[test]
    fn each_proxy_chosen_exactly_k_times() {
        let view = make_view(4);
        let strategy = RoundRobin::new();
        let ctx = SelectionContext::new();

        let mut counts = std::collections::HashMap::new();
        for _ in 0..(4 * 25) {
            let picked = strategy.select(&view, &ctx).unwrap();
            *counts.entry(picked.id).or_insert(0u32) += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 25));
    }

    #[test]
    fn skips_failed_without_consuming_cursor_positions() {
        let view = make_view(3);
        let strategy = RoundRobin::new();

        let mut ctx = SelectionContext::new();
        ctx.mark_failed(view[0].id);

        // Cursor at 0 points at the failed proxy; the scan lands on view[1].
        assert_eq!(strategy.select(&view, &ctx).unwrap().id, view[1].id);
        // Next call starts from cursor position 1.
        assert_eq!(strategy.select(&view, &ctx).unwrap().id, view[1].id);
        assert_eq!(strategy.select(&view, &ctx).unwrap().id, view[2].id);
    }

    #[test]
    fn fails_when_everything_is_excluded() {
        let view = make_view(2);
        let strategy = RoundRobin::new();

        let mut ctx = SelectionContext::new();
        ctx.mark_failed(view[0].id);
        ctx.mark_failed(view[1].id);

        assert!(matches!(
            strategy.select(&view, &ctx),
            Err(Error::NoProxiesAvailable)
        ));
        assert!(matches!(
            strategy.select(&[], &ctx),
            Err(Error::NoProxiesAvailable)
        ));
    }
}
