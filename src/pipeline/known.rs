//! Read-through cache of values known to be stored
//!
//! Owned by a `Pipeline` instance and handed to whoever needs it, so two
//! pipelines (or two tests) never share it.

use super::indicator::Indicator;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
struct KnownInner {
    by_value: HashMap<String, Indicator>,
    /// Insertion order, for paged display
    order: Vec<String>,
}

#[derive(Default)]
pub struct KnownValues {
    inner: RwLock<KnownInner>,
}

impl KnownValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh; returns true if the value was new
    pub fn insert(&self, indicator: Indicator) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let value = indicator.value().to_string();
        match inner.by_value.insert(value.clone(), indicator) {
            Some(_) => false,
            None => {
                inner.order.push(value);
                true
            }
        }
    }

    /// Bulk insert; returns how many values were new
    pub fn extend<I: IntoIterator<Item = Indicator>>(&self, indicators: I) -> usize {
        indicators
            .into_iter()
            .map(|indicator| self.insert(indicator))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn get(&self, value: &str) -> Option<Indicator> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_value
            .get(value)
            .cloned()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.get(value).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values in insertion order within `[start, end)`, clamped to bounds
    pub fn page(&self, start: usize, end: usize) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let end = end.min(inner.order.len());
        let start = start.min(end);
        inner.order[start..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::indicator::IndicatorKind;

    fn ip(value: &str) -> Indicator {
        Indicator::new(IndicatorKind::Ip4, value).unwrap()
    }

    #[test]
    fn test_insert_tracks_novelty() {
        let known = KnownValues::new();
        assert!(known.insert(ip("8.8.8.8")));
        assert!(!known.insert(ip("8.8.8.8")));
        assert_eq!(known.len(), 1);
        assert!(known.contains("8.8.8.8"));
    }

    #[test]
    fn test_page_clamps() {
        let known = KnownValues::new();
        assert_eq!(known.extend(["1.1.1.1", "2.2.2.2", "3.3.3.3"].map(ip)), 3);

        assert_eq!(known.page(0, 2), vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(known.page(1, 100), vec!["2.2.2.2", "3.3.3.3"]);
        assert!(known.page(5, 10).is_empty());
        assert!(known.page(2, 1).is_empty());
    }
}
