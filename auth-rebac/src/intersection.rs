//! Best-effort fast path for checks.
//!
//! For each subject the cache remembers the sets it belongs to ("parents"),
//! and for each checked relation the stored sets that make it up
//! ("subsets"). A non-empty intersection of fresh entries proves membership.
//! An empty intersection only proves non-membership when both entries are
//! fresh and exhaustive; anything else is [`CacheOutcome::Unknown`] and the
//! caller must fall back to the evaluator.

use crate::{
    counters,
    error::{RebacError, Result},
    models::*,
    schema::SetExpr,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tracing::debug;

/// Result of a cache lookup. `Unknown` is never a negative answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Allowed,
    Denied,
    Unknown,
}

impl CacheOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    sets: BTreeSet<SetHandle>,
    stale: bool,
    complete: bool,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        !self.stale
    }
}

/// Marks the cache state a populate was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEpoch(u64);

pub struct IntersectionCache {
    namespace: String,
    capacity: usize,
    parents: DashMap<Object, CacheEntry>,
    subsets: DashMap<SetHandle, CacheEntry>,
    epoch: RwLock<u64>,
}

impl IntersectionCache {
    /// `namespace` should identify the schema the subsets were derived from.
    pub fn new(namespace: impl Into<String>, capacity: usize) -> Self {
        Self {
            namespace: namespace.into(),
            capacity,
            parents: DashMap::new(),
            subsets: DashMap::new(),
            epoch: RwLock::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn epoch(&self) -> CacheEpoch {
        CacheEpoch(*self.epoch.read())
    }

    pub fn lookup(&self, subject: &Object, target: &SetHandle, expr: &SetExpr) -> CacheOutcome {
        let outcome = self.evaluate(subject, target, expr);
        counters::intersection_lookup(outcome.label());
        outcome
    }

    /// Like [`Self::lookup`], but reports `Unknown` as [`RebacError::StaleCache`].
    pub fn decide(&self, subject: &Object, target: &SetHandle, expr: &SetExpr) -> Result<bool> {
        match self.lookup(subject, target, expr) {
            CacheOutcome::Allowed => Ok(true),
            CacheOutcome::Denied => Ok(false),
            CacheOutcome::Unknown => Err(RebacError::StaleCache(format!("{} in {}", subject, target))),
        }
    }

    fn evaluate(&self, subject: &Object, target: &SetHandle, expr: &SetExpr) -> CacheOutcome {
        let parents = match self.parents.get(subject) {
            Some(entry) if entry.is_fresh() => entry,
            _ => return CacheOutcome::Unknown,
        };

        // Subsets only depend on the schema and can always be rebuilt.
        if !self.subsets.get(target).is_some_and(|entry| entry.is_fresh()) {
            let (sets, complete) = expr.static_sets(&target.object);
            self.remember_subsets(target.clone(), sets, complete);
        }
        let subsets = match self.subsets.get(target) {
            Some(entry) if entry.is_fresh() => entry,
            _ => return CacheOutcome::Unknown,
        };

        if parents.sets.intersection(&subsets.sets).next().is_some() {
            CacheOutcome::Allowed
        } else if parents.complete && subsets.complete {
            CacheOutcome::Denied
        } else {
            CacheOutcome::Unknown
        }
    }

    /// Store the sets `subject` belongs to, as read from the closure after
    /// `epoch` was taken. Dropped if the graph changed in between.
    pub fn populate_parents(&self, subject: Object, records: &[ClosureRecord], epoch: CacheEpoch) {
        let sets = records
            .iter()
            .filter_map(|record| {
                record
                    .name
                    .as_deref()
                    .map(|name| SetHandle::new(record.to.clone(), name))
            })
            .collect();

        // Holding the read lock keeps invalidation out until the insert lands.
        let current = self.epoch.read();
        if *current != epoch.0 {
            debug!(%subject, "Skipping intersection cache populate after concurrent mutation");
            return;
        }
        if !self.has_room(self.parents.len()) && !self.parents.contains_key(&subject) {
            self.parents.retain(|_, entry| entry.is_fresh());
            if !self.has_room(self.parents.len()) {
                return;
            }
        }
        self.parents.insert(
            subject,
            CacheEntry {
                sets,
                stale: false,
                complete: true,
            },
        );
    }

    fn remember_subsets(&self, target: SetHandle, sets: BTreeSet<SetHandle>, complete: bool) {
        if !self.has_room(self.subsets.len()) && !self.subsets.contains_key(&target) {
            return;
        }
        self.subsets.insert(
            target,
            CacheEntry {
                sets,
                stale: false,
                complete,
            },
        );
    }

    fn has_room(&self, len: usize) -> bool {
        len < self.capacity
    }

    /// Mark the parent entries of `objects` stale.
    pub fn invalidate<'a, I>(&self, objects: I)
    where
        I: IntoIterator<Item = &'a Object>,
    {
        let mut epoch = self.epoch.write();
        *epoch += 1;
        let mut marked = 0usize;
        for object in objects {
            if let Some(mut entry) = self.parents.get_mut(object) {
                entry.stale = true;
                marked += 1;
            }
        }
        debug!(namespace = %self.namespace, marked, "Intersection cache entries marked stale");
    }

    pub fn invalidate_all(&self) {
        let mut epoch = self.epoch.write();
        *epoch += 1;
        self.parents.iter_mut().for_each(|mut entry| entry.stale = true);
        self.subsets.iter_mut().for_each(|mut entry| entry.stale = true);
    }

    pub fn len(&self) -> usize {
        self.parents.len() + self.subsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(from: &Object, to: &Object, name: &str) -> ClosureRecord {
        ClosureRecord {
            id: Uuid::new_v4(),
            from: from.clone(),
            to: to.clone(),
            name: Some(name.to_string()),
            path: vec![],
        }
    }

    fn fixture() -> (IntersectionCache, Object, Object) {
        (
            IntersectionCache::new("test", 1024),
            Object::new("user", "alice"),
            Object::new("doc", "1"),
        )
    }

    #[test]
    fn test_missing_entry_is_unknown() {
        let (cache, alice, doc) = fixture();
        let target = SetHandle::new(doc, "viewer");
        let outcome = cache.lookup(&alice, &target, &SetExpr::relative("viewer"));
        assert_eq!(outcome, CacheOutcome::Unknown);
        assert!(matches!(
            cache.decide(&alice, &target, &SetExpr::relative("viewer")),
            Err(RebacError::StaleCache(_))
        ));
    }

    #[test]
    fn test_fresh_intersection_allows() {
        let (cache, alice, doc) = fixture();
        cache.populate_parents(alice.clone(), &[record(&alice, &doc, "editor")], cache.epoch());

        let expr = SetExpr::union(vec![SetExpr::relative("viewer"), SetExpr::relative("editor")]);
        let outcome = cache.lookup(&alice, &SetHandle::new(doc, "viewer"), &expr);
        assert_eq!(outcome, CacheOutcome::Allowed);
    }

    #[test]
    fn test_denied_requires_complete_subsets() {
        let (cache, alice, doc) = fixture();
        cache.populate_parents(alice.clone(), &[], cache.epoch());

        let plain = SetExpr::relative("viewer");
        assert_eq!(
            cache.lookup(&alice, &SetHandle::new(doc.clone(), "viewer"), &plain),
            CacheOutcome::Denied
        );

        let computed = SetExpr::union(vec![plain, SetExpr::relative2("parent", "viewer")]);
        assert_eq!(
            cache.lookup(&alice, &SetHandle::new(doc, "reader"), &computed),
            CacheOutcome::Unknown
        );
    }

    #[test]
    fn test_invalidated_entry_is_unknown() {
        let (cache, alice, doc) = fixture();
        cache.populate_parents(alice.clone(), &[record(&alice, &doc, "viewer")], cache.epoch());
        cache.invalidate([&alice]);

        let outcome = cache.lookup(&alice, &SetHandle::new(doc, "viewer"), &SetExpr::relative("viewer"));
        assert_eq!(outcome, CacheOutcome::Unknown);
    }

    #[test]
    fn test_invalidate_all_rebuilds_subsets() {
        let (cache, alice, doc) = fixture();
        cache.populate_parents(alice.clone(), &[record(&alice, &doc, "viewer")], cache.epoch());
        let target = SetHandle::new(doc, "viewer");
        let expr = SetExpr::relative("viewer");
        assert_eq!(cache.lookup(&alice, &target, &expr), CacheOutcome::Allowed);

        cache.invalidate_all();
        assert_eq!(cache.lookup(&alice, &target, &expr), CacheOutcome::Unknown);

        cache.populate_parents(alice.clone(), &[], cache.epoch());
        assert_eq!(cache.lookup(&alice, &target, &expr), CacheOutcome::Denied);
    }

    #[test]
    fn test_populate_after_concurrent_invalidation_is_dropped() {
        let (cache, alice, doc) = fixture();
        let before = cache.epoch();
        cache.invalidate(std::iter::empty());
        cache.populate_parents(alice.clone(), &[record(&alice, &doc, "viewer")], before);

        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_is_respected() {
        let cache = IntersectionCache::new("tiny", 1);
        let doc = Object::new("doc", "1");
        for name in ["a", "b", "c"] {
            cache.populate_parents(Object::new("user", name), &[], cache.epoch());
        }
        cache.lookup(&Object::new("user", "a"), &SetHandle::new(doc, "viewer"), &SetExpr::relative("viewer"));
        assert_eq!(cache.len(), 2);
    }
}
