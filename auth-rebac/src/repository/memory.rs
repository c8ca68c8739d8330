//! In-memory relation store for tests and embedded use.
//!
//! The graph is kept as an explicit adjacency index whose edge-ID sets are
//! ordered, so breadth-first traversal yields paths in a reproducible order.
//! A single `RwLock` plays the role of the relation-table lock: mutation
//! transactions hold the write half for their whole lifetime, apply changes
//! in place and undo them if dropped uncommitted.

use crate::{
    error::Result,
    models::*,
    repository::{GraphTransaction, RelationStore},
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Default)]
struct GraphState {
    edges: BTreeMap<Uuid, Edge>,
    outgoing: HashMap<Object, BTreeSet<Uuid>>,
    incoming: HashMap<Object, BTreeSet<Uuid>>,
    closure: HashMap<Uuid, ClosureRecord>,
    closure_from: HashMap<Object, BTreeSet<Uuid>>,
}

impl GraphState {
    fn find_edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.outgoing
            .get(&key.from)?
            .iter()
            .filter_map(|id| self.edges.get(id))
            .find(|edge| edge.matches(key))
    }

    fn insert_edge(&mut self, edge: Edge) {
        self.outgoing.entry(edge.from.clone()).or_default().insert(edge.id);
        self.incoming.entry(edge.to.clone()).or_default().insert(edge.id);
        self.edges.insert(edge.id, edge);
    }

    fn remove_edge(&mut self, id: Uuid) -> Option<Edge> {
        let edge = self.edges.remove(&id)?;
        if let Some(ids) = self.outgoing.get_mut(&edge.from) {
            ids.remove(&id);
        }
        if let Some(ids) = self.incoming.get_mut(&edge.to) {
            ids.remove(&id);
        }
        Some(edge)
    }

    fn traverse(&self, root: &Object, direction: Direction) -> Vec<TraversalPath> {
        let index = match direction {
            Direction::Up => &self.incoming,
            Direction::Down => &self.outgoing,
        };

        let mut paths = Vec::new();
        // (node, via, whether every hop so far is a membership hop)
        let mut queue = VecDeque::from([(root.clone(), Vec::<Uuid>::new(), true)]);

        while let Some((node, via, members)) = queue.pop_front() {
            let Some(ids) = index.get(&node) else {
                continue;
            };
            for id in ids {
                let Some(edge) = self.edges.get(id) else {
                    continue;
                };
                let next = match direction {
                    Direction::Up => &edge.from,
                    Direction::Down => &edge.to,
                };
                if next == root || via.contains(id) {
                    continue;
                }

                let mut next_via = via.clone();
                next_via.push(*id);
                paths.push(TraversalPath {
                    endpoint: next.clone(),
                    via: next_via.clone(),
                    far_name: edge.name.clone(),
                    through_members: members,
                });
                let next_members = members && edge.name.as_deref() == Some(MEMBERSHIP_LABEL);
                queue.push_back((next.clone(), next_via, next_members));
            }
        }

        paths
    }

    fn upsert_closure(&mut self, record: &ClosureRecord) -> bool {
        if self.closure.contains_key(&record.id) {
            return false;
        }
        self.closure_from
            .entry(record.from.clone())
            .or_default()
            .insert(record.id);
        self.closure.insert(record.id, record.clone());
        true
    }

    fn remove_closure(&mut self, id: &Uuid) -> Option<ClosureRecord> {
        let record = self.closure.remove(id)?;
        if let Some(ids) = self.closure_from.get_mut(&record.from) {
            ids.remove(id);
        }
        Some(record)
    }

    fn closure_from<'a>(&'a self, from: &Object) -> impl Iterator<Item = &'a ClosureRecord> + 'a {
        self.closure_from
            .get(from)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.closure.get(id))
    }
}

/// In-memory relation store
pub struct InMemoryRelationStore {
    graph: Arc<RwLock<GraphState>>,
    roles: Arc<DashMap<String, Role>>,
}

impl InMemoryRelationStore {
    pub fn new() -> Self {
        Self {
            graph: Arc::new(RwLock::new(GraphState::default())),
            roles: Arc::new(DashMap::new()),
        }
    }

    /// Number of materialized closure records.
    pub async fn closure_len(&self) -> usize {
        self.graph.read().await.closure.len()
    }

    /// Number of direct edges.
    pub async fn edge_len(&self) -> usize {
        self.graph.read().await.edges.len()
    }
}

impl Default for InMemoryRelationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationStore for InMemoryRelationStore {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>> {
        let guard = Arc::clone(&self.graph).write_owned().await;
        Ok(Box::new(InMemoryTransaction::new(guard)))
    }

    async fn list_edges(
        &self,
        filter: &RelationFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Edge>> {
        let graph = self.graph.read().await;
        let edges = match after {
            Some(after) => graph
                .edges
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .map(|(_, edge)| edge)
                .filter(|edge| filter.matches(edge))
                .take(limit)
                .cloned()
                .collect(),
            None => graph
                .edges
                .values()
                .filter(|edge| filter.matches(edge))
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(edges)
    }

    async fn list_ancestors(&self, object: &Object) -> Result<Vec<TraversalPath>> {
        Ok(self.graph.read().await.traverse(object, Direction::Up))
    }

    async fn list_descendants(&self, object: &Object) -> Result<Vec<TraversalPath>> {
        Ok(self.graph.read().await.traverse(object, Direction::Down))
    }

    async fn closure_exists(&self, from: &Object, to: &Object, name: Option<&str>) -> Result<bool> {
        let graph = self.graph.read().await;
        let found = graph.closure_from(from).any(|record| {
            record.to == *to && name.map_or(true, |name| record.name.as_deref() == Some(name))
        });
        Ok(found)
    }

    async fn list_closure(&self, from: &Object, to: Option<&Object>) -> Result<Vec<ClosureRecord>> {
        let graph = self.graph.read().await;
        let mut records: Vec<ClosureRecord> = graph
            .closure_from(from)
            .filter(|record| to.map_or(true, |to| record.to == *to))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.to.cmp(&b.to).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn direct_targets(&self, from: &Object, name: &str) -> Result<Vec<Object>> {
        let graph = self.graph.read().await;
        let targets: BTreeSet<Object> = graph
            .outgoing
            .get(from)
            .into_iter()
            .flatten()
            .filter_map(|id| graph.edges.get(id))
            .filter(|edge| edge.name.as_deref() == Some(name))
            .map(|edge| edge.to.clone())
            .collect();
        Ok(targets.into_iter().collect())
    }

    async fn upsert_role(&self, role: &Role) -> Result<Role> {
        self.roles.insert(role.id.clone(), role.clone());
        Ok(role.clone())
    }

    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        Ok(self.roles.get(id).map(|entry| entry.value().clone()))
    }

    async fn delete_role(&self, id: &str) -> Result<bool> {
        Ok(self.roles.remove(id).is_some())
    }
}

/// A change applied to the shared state, recorded so it can be reversed.
#[derive(Debug)]
enum Undo {
    InsertedEdge(Uuid),
    RemovedEdge(Edge),
    InsertedClosure(Uuid),
    RemovedClosure(ClosureRecord),
}

/// Applies changes in place under the write lock. Readers cannot observe them
/// before the lock is released, and dropping without commit replays the undo
/// log in reverse.
struct InMemoryTransaction {
    guard: OwnedRwLockWriteGuard<GraphState>,
    undo: Vec<Undo>,
    committed: bool,
}

impl InMemoryTransaction {
    fn new(guard: OwnedRwLockWriteGuard<GraphState>) -> Self {
        Self {
            guard,
            undo: Vec::new(),
            committed: false,
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.committed || self.undo.is_empty() {
            return;
        }
        debug!(changes = self.undo.len(), "Rolling back in-memory graph transaction");
        while let Some(change) = self.undo.pop() {
            match change {
                Undo::InsertedEdge(id) => {
                    self.guard.remove_edge(id);
                }
                Undo::RemovedEdge(edge) => self.guard.insert_edge(edge),
                Undo::InsertedClosure(id) => {
                    self.guard.remove_closure(&id);
                }
                Undo::RemovedClosure(record) => {
                    self.guard.upsert_closure(&record);
                }
            }
        }
    }
}

#[async_trait]
impl GraphTransaction for InMemoryTransaction {
    async fn find_edge(&mut self, key: &EdgeKey) -> Result<Option<Edge>> {
        Ok(self.guard.find_edge(key).cloned())
    }

    async fn insert_edge(&mut self, edge: &Edge) -> Result<()> {
        self.guard.insert_edge(edge.clone());
        self.undo.push(Undo::InsertedEdge(edge.id));
        Ok(())
    }

    async fn delete_edge(&mut self, id: Uuid) -> Result<bool> {
        match self.guard.remove_edge(id) {
            Some(edge) => {
                self.undo.push(Undo::RemovedEdge(edge));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_ancestors(&mut self, object: &Object) -> Result<Vec<TraversalPath>> {
        Ok(self.guard.traverse(object, Direction::Up))
    }

    async fn list_descendants(&mut self, object: &Object) -> Result<Vec<TraversalPath>> {
        Ok(self.guard.traverse(object, Direction::Down))
    }

    async fn upsert_closure(&mut self, records: &[ClosureRecord]) -> Result<u64> {
        let mut inserted = 0;
        for record in records {
            if self.guard.upsert_closure(record) {
                self.undo.push(Undo::InsertedClosure(record.id));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_closure(&mut self, ids: &[Uuid]) -> Result<u64> {
        let mut removed = 0;
        for id in ids {
            if let Some(record) = self.guard.remove_closure(id) {
                self.undo.push(Undo::RemovedClosure(record));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        debug!(
            changes = tx.undo.len(),
            edges = tx.guard.edges.len(),
            closure = tx.guard.closure.len(),
            "Committing in-memory graph transaction"
        );
        tx.committed = true;
        Ok(())
    }
}
