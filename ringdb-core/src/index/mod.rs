//! Series index
//!
//! Maps canonical series names to dense ids and answers the metadata
//! questions behind `meta:names`, suggest and search.

use crate::{Result, RingError, SeriesId, SeriesKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Tag filter: a series matches when, for every listed tag, it carries
/// that tag with one of the listed values
pub type TagFilter = BTreeMap<String, Vec<String>>;

/// Series index shared by the ingestion and query paths
pub struct SeriesIndex {
    inner: RwLock<IndexInner>,
}

#[derive(Default)]
struct IndexInner {
    by_name: HashMap<String, SeriesId>,
    by_id: BTreeMap<SeriesId, SeriesKey>,
    by_metric: BTreeMap<String, BTreeSet<SeriesId>>,
    next_id: SeriesId,
}

impl IndexInner {
    fn insert(&mut self, id: SeriesId, key: SeriesKey) {
        self.by_name.insert(key.canonical(), id);
        self.by_metric
            .entry(key.metric.clone())
            .or_default()
            .insert(id);
        self.by_id.insert(id, key);
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }
}

fn matches(key: &SeriesKey, filter: &TagFilter) -> bool {
    filter.iter().all(|(tag, values)| match key.tags.get(tag) {
        Some(v) => values.iter().any(|allowed| allowed == v),
        None => false,
    })
}

impl SeriesIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Return the id for `key`, creating it if needed.
    /// The flag is true when the series was created by this call.
    pub fn create(&self, key: &SeriesKey) -> (SeriesId, bool) {
        let name = key.canonical();
        if let Some(id) = self.inner.read().by_name.get(&name) {
            return (*id, false);
        }

        let mut inner = self.inner.write();
        if let Some(id) = inner.by_name.get(&name) {
            return (*id, false);
        }
        let id = inner.next_id;
        inner.insert(id, key.clone());
        (id, true)
    }

    /// Re-insert a persisted mapping, keeping its id
    pub fn restore(&self, id: SeriesId, key: SeriesKey) {
        self.inner.write().insert(id, key);
    }

    /// Look up a series by canonical name
    pub fn get(&self, name: &str) -> Option<SeriesId> {
        self.inner.read().by_name.get(name).copied()
    }

    pub fn key(&self, id: SeriesId) -> Option<SeriesKey> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Number of known series
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the metric's series that pass `filter`, ascending.
    ///
    /// Fails with `NotFound` when the metric has no series at all; an
    /// empty vector means the filter excluded everything.
    pub fn resolve(&self, metric: &str, filter: &TagFilter) -> Result<Vec<SeriesId>> {
        let inner = self.inner.read();
        let ids = inner
            .by_metric
            .get(metric)
            .ok_or_else(|| RingError::NotFound(metric.to_string()))?;

        Ok(ids
            .iter()
            .filter(|id| {
                inner
                    .by_id
                    .get(id)
                    .map(|key| matches(key, filter))
                    .unwrap_or(false)
            })
            .copied()
            .collect())
    }

    /// Metric names starting with `prefix`
    pub fn suggest_metrics(&self, prefix: &str) -> Vec<String> {
        self.inner
            .read()
            .by_metric
            .keys()
            .filter(|m| m.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Tag names used by `metric` starting with `prefix`
    pub fn suggest_tags(&self, metric: &str, prefix: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut out = BTreeSet::new();
        if let Some(ids) = inner.by_metric.get(metric) {
            for id in ids {
                if let Some(key) = inner.by_id.get(id) {
                    out.extend(key.tags.keys().filter(|t| t.starts_with(prefix)).cloned());
                }
            }
        }
        out.into_iter().collect()
    }

    /// Values of `tag` under `metric` starting with `prefix`
    pub fn suggest_tag_values(&self, metric: &str, tag: &str, prefix: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut out = BTreeSet::new();
        if let Some(ids) = inner.by_metric.get(metric) {
            for id in ids {
                if let Some(v) = inner.by_id.get(id).and_then(|key| key.tags.get(tag)) {
                    if v.starts_with(prefix) {
                        out.insert(v.clone());
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    /// Full names of series matching `metric` (all metrics when `None`)
    /// and `filter`, sorted
    pub fn search(&self, metric: Option<&str>, filter: &TagFilter) -> Vec<String> {
        let inner = self.inner.read();
        let mut out: Vec<String> = inner
            .by_id
            .values()
            .filter(|key| metric.map_or(true, |m| key.metric == m))
            .filter(|key| matches(key, filter))
            .map(|key| key.canonical())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// All canonical names, optionally limited to one metric
    pub fn names(&self, metric: Option<&str>) -> Vec<String> {
        self.search(metric, &TagFilter::new())
    }
}

impl Default for SeriesIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SeriesKey {
        SeriesKey::parse(s).unwrap()
    }

    #[test]
    fn test_create_is_idempotent() {
        let index = SeriesIndex::new();
        let (a, created) = index.create(&key("cpu host=A region=eu"));
        assert!(created);
        assert_eq!(a, 1);
        let (b, created) = index.create(&key("cpu region=eu host=A"));
        assert!(!created);
        assert_eq!(a, b);
        let (c, _) = index.create(&key("cpu host=B region=eu"));
        assert_eq!(c, 2);
    }

    #[test]
    fn test_restore_continues_allocation() {
        let index = SeriesIndex::new();
        index.restore(7, key("mem host=A"));
        let (id, _) = index.create(&key("mem host=B"));
        assert_eq!(id, 8);
        assert_eq!(index.get("mem host=A"), Some(7));
    }

    #[test]
    fn test_resolve_with_filter() {
        let index = SeriesIndex::new();
        for host in ["A", "B", "C"] {
            index.create(&key(&format!("cpu host={} dc=1", host)));
        }

        let mut filter = TagFilter::new();
        filter.insert("host".into(), vec!["A".into(), "C".into()]);
        assert_eq!(index.resolve("cpu", &filter).unwrap(), vec![1, 3]);

        filter.insert("dc".into(), vec!["2".into()]);
        assert!(index.resolve("cpu", &filter).unwrap().is_empty());

        assert!(matches!(
            index.resolve("disk", &TagFilter::new()),
            Err(RingError::NotFound(_))
        ));
    }

    #[test]
    fn test_suggest_and_search() {
        let index = SeriesIndex::new();
        index.create(&key("net.in host=A iface=eth0"));
        index.create(&key("net.out host=A iface=eth1"));
        index.create(&key("cpu.user host=B arch=x86"));
        index.create(&key("cpu.user host=A arch=arm"));

        assert_eq!(index.suggest_metrics("net"), vec!["net.in", "net.out"]);
        assert_eq!(index.suggest_tags("cpu.user", ""), vec!["arch", "host"]);
        assert_eq!(index.suggest_tag_values("cpu.user", "host", ""), vec!["A", "B"]);
        assert_eq!(
            index.search(Some("cpu.user"), &TagFilter::new()),
            vec!["cpu.user arch=arm host=A", "cpu.user arch=x86 host=B"]
        );

        let mut filter = TagFilter::new();
        filter.insert("host".into(), vec!["A".into()]);
        assert_eq!(index.search(None, &filter).len(), 3);
    }

    #[test]
    fn test_names_cartesian_product() {
        let index = SeriesIndex::new();
        for a in ["x", "y", "z"] {
            for b in ["1", "2"] {
                index.create(&key(&format!("m a={} b={}", a, b)));
            }
        }
        let names = index.names(Some("m"));
        assert_eq!(names.len(), 6);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
