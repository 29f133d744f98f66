//! Series index: series keys to ids, and tag predicates to series.
//!
//! Every series is registered in one posting list for its measurement and
//! one per `(tag key, tag value)` pair. A predicate is answered by combining
//! those lists; the series keys themselves are only consulted for output.
//!
//! Ids are shard-local and never persisted. On open the shard rebuilds the
//! index from the keys found in its files and WAL.

pub mod key;
pub mod predicate;
pub mod tag;

use crate::error::Result;
use crate::tsm::SeriesId;
use predicate::{compile_rules, CompiledRule, Matcher, RegexCache};
use roaring::RoaringTreemap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

pub use key::SeriesKey;
pub use predicate::Predicate;
pub use tag::{Operator, Tag, TagRule};

struct IndexEntry {
    key: SeriesKey,
    canonical: Arc<str>,
}

struct IndexState {
    next_id: SeriesId,
    ids: HashMap<Arc<str>, SeriesId>,
    entries: HashMap<SeriesId, IndexEntry>,
    measurements: BTreeMap<String, RoaringTreemap>,
    postings: BTreeMap<String, BTreeMap<String, RoaringTreemap>>,
    live: RoaringTreemap,
    deleted: RoaringTreemap,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            next_id: 1,
            ids: HashMap::new(),
            entries: HashMap::new(),
            measurements: BTreeMap::new(),
            postings: BTreeMap::new(),
            live: RoaringTreemap::new(),
            deleted: RoaringTreemap::new(),
        }
    }
}

impl IndexState {
    fn lookup(&self, series_key: &str) -> Option<SeriesId> {
        if let Some(id) = self.ids.get(series_key) {
            return Some(*id);
        }
        // Not canonical text; normalize and retry.
        let canonical = SeriesKey::parse(series_key).ok()?.to_string();
        self.ids.get(canonical.as_str()).copied()
    }

    fn insert(&mut self, key: &SeriesKey, canonical: Arc<str>) -> SeriesId {
        let id = self.next_id;
        self.next_id += 1;
        self.measurements
            .entry(key.measurement().to_string())
            .or_default()
            .insert(id);
        for (k, v) in key.tags() {
            self.postings
                .entry(k.clone())
                .or_default()
                .entry(v.clone())
                .or_default()
                .insert(id);
        }
        self.live.insert(id);
        self.ids.insert(Arc::clone(&canonical), id);
        self.entries.insert(
            id,
            IndexEntry {
                key: key.clone(),
                canonical,
            },
        );
        id
    }

    fn remove_posting(&mut self, key: &SeriesKey, id: SeriesId) {
        if let Some(ids) = self.measurements.get_mut(key.measurement()) {
            ids.remove(id);
            if ids.is_empty() {
                self.measurements.remove(key.measurement());
            }
        }
        for (k, v) in key.tags() {
            let Some(values) = self.postings.get_mut(k) else {
                continue;
            };
            if let Some(ids) = values.get_mut(v) {
                ids.remove(id);
                if ids.is_empty() {
                    values.remove(v);
                }
            }
            if values.is_empty() {
                self.postings.remove(k);
            }
        }
    }

    fn canonical_keys(&self, ids: &RoaringTreemap) -> Vec<(SeriesId, Arc<str>)> {
        ids.iter()
            .filter_map(|id| {
                self.entries
                    .get(&id)
                    .map(|entry| (id, Arc::clone(&entry.canonical)))
            })
            .collect()
    }

    fn candidates(&self, measurement: Option<&str>) -> RoaringTreemap {
        match measurement {
            Some(m) => match self.measurements.get(m) {
                Some(ids) => ids & &self.live,
                None => RoaringTreemap::new(),
            },
            None => self.live.clone(),
        }
    }

    fn apply_rule(&self, result: &mut RoaringTreemap, rule: &CompiledRule) {
        let values = self.postings.get(&rule.key);

        if let Matcher::Equal(expected) = &rule.matcher {
            match values.and_then(|v| v.get(expected)) {
                Some(ids) => *result &= ids,
                None => result.clear(),
            }
            return;
        }

        let mut matched = RoaringTreemap::new();
        let mut tagged = RoaringTreemap::new();
        if let Some(values) = values {
            for (value, ids) in values {
                tagged |= ids;
                if rule.matcher.matches(value) {
                    matched |= ids;
                }
            }
        }
        if rule.matcher.matches_absent() {
            let mut absent = result.clone();
            absent -= &tagged;
            matched |= absent;
        }
        *result &= &matched;
    }
}

/// Shard-local mapping between series keys, ids and tags.
pub struct SeriesIndex {
    state: RwLock<IndexState>,
    regexes: RegexCache,
}

impl Default for SeriesIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            regexes: RegexCache::default(),
        }
    }

    /// Returns the id of `key`, registering it on first sight.
    ///
    /// A soft-deleted key is revived with its old id. The returned string is
    /// the canonical text form used as the storage key.
    pub fn resolve(&self, key: &SeriesKey) -> (SeriesId, Arc<str>) {
        let canonical = key.to_string();
        {
            let state = self.state.read().unwrap_or_else(|err| err.into_inner());
            if let Some(&id) = state.ids.get(canonical.as_str()) {
                if !state.deleted.contains(id) {
                    if let Some(entry) = state.entries.get(&id) {
                        return (id, Arc::clone(&entry.canonical));
                    }
                }
            }
        }

        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        // Another writer may have registered the key in between.
        if let Some(&id) = state.ids.get(canonical.as_str()) {
            if state.deleted.remove(id) {
                state.live.insert(id);
                debug!(series_id = id, series_key = %canonical, "Revived deleted series");
            }
            if let Some(entry) = state.entries.get(&id) {
                return (id, Arc::clone(&entry.canonical));
            }
        }
        let canonical: Arc<str> = Arc::from(canonical);
        let id = state.insert(key, Arc::clone(&canonical));
        (id, canonical)
    }

    /// Parses `series_key` and resolves it.
    pub fn resolve_str(&self, series_key: &str) -> Result<(SeriesId, Arc<str>)> {
        let key = SeriesKey::parse(series_key)?;
        Ok(self.resolve(&key))
    }

    /// Id of a live series. Accepts canonical or unsorted key text.
    pub fn get(&self, series_key: &str) -> Option<SeriesId> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state
            .lookup(series_key)
            .filter(|id| !state.deleted.contains(*id))
    }

    /// Key of a registered series, live or deleted.
    pub fn key(&self, id: SeriesId) -> Option<SeriesKey> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state.entries.get(&id).map(|entry| entry.key.clone())
    }

    /// Canonical storage key of a registered series.
    pub fn canonical_key(&self, id: SeriesId) -> Option<Arc<str>> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state
            .entries
            .get(&id)
            .map(|entry| Arc::clone(&entry.canonical))
    }

    /// Live series of `measurement` (or of every measurement) satisfying
    /// all `rules`, in id order.
    ///
    /// # Errors
    ///
    /// Fails before evaluating anything if a rule has an invalid tag or an
    /// uncompilable pattern.
    pub fn match_rules(
        &self,
        measurement: Option<&str>,
        rules: &[TagRule],
    ) -> Result<Vec<SeriesId>> {
        let compiled = compile_rules(rules, &self.regexes)?;
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        Ok(Self::evaluate(&state, measurement, &compiled).iter().collect())
    }

    /// Like [`match_rules`](Self::match_rules), returning canonical keys.
    pub fn match_keys(
        &self,
        measurement: Option<&str>,
        rules: &[TagRule],
    ) -> Result<Vec<(SeriesId, Arc<str>)>> {
        let compiled = compile_rules(rules, &self.regexes)?;
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        let ids = Self::evaluate(&state, measurement, &compiled);
        Ok(state.canonical_keys(&ids))
    }

    fn evaluate(
        state: &IndexState,
        measurement: Option<&str>,
        rules: &[CompiledRule],
    ) -> RoaringTreemap {
        let mut result = state.candidates(measurement);
        for rule in rules {
            if result.is_empty() {
                break;
            }
            state.apply_rule(&mut result, rule);
        }
        result
    }

    /// Soft-deletes a series: it stops matching but keeps its id until
    /// [`purge`](Self::purge). Returns the id if the series was live.
    pub fn delete_series(&self, series_key: &str) -> Option<SeriesId> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        let id = state.lookup(series_key)?;
        if !state.live.remove(id) {
            return None;
        }
        state.deleted.insert(id);
        Some(id)
    }

    /// Soft-deleted series that have not been purged yet.
    pub fn deleted_series(&self) -> Vec<(SeriesId, Arc<str>)> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state.canonical_keys(&state.deleted)
    }

    /// Permanently forgets a soft-deleted series. Live series are left alone.
    pub fn purge(&self, id: SeriesId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        if !state.deleted.remove(id) {
            return false;
        }
        let Some(entry) = state.entries.remove(&id) else {
            return false;
        };
        state.ids.remove(&entry.canonical);
        state.remove_posting(&entry.key, id);
        debug!(series_id = id, series_key = %entry.canonical, "Purged series from index");
        true
    }

    /// Measurements with at least one live series.
    pub fn measurements(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state
            .measurements
            .iter()
            .filter(|(_, ids)| !ids.is_disjoint(&state.live))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Distinct values of tag `key` among live series, optionally within one
    /// measurement.
    pub fn tag_values(&self, measurement: Option<&str>, key: &str) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        let candidates = state.candidates(measurement);
        state
            .postings
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|(_, ids)| !ids.is_disjoint(&candidates))
                    .map(|(value, _)| value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live series.
    pub fn series_count(&self) -> u64 {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        state.live.len()
    }
}

impl std::fmt::Debug for SeriesIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        f.debug_struct("SeriesIndex")
            .field("live", &state.live.len())
            .field("deleted", &state.deleted.len())
            .finish()
    }
}
