use crate::{
    closure::{ClosureDelta, ClosureMaintainer},
    counters,
    error::{RebacError, Result},
    models::*,
    repository::RelationStore,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a committed graph mutation.
#[derive(Debug, Clone, Default)]
pub struct GraphMutation {
    /// Edges created, already present (idempotent creates), or deleted.
    pub edges: Vec<Edge>,
    /// Number of edges actually inserted or removed.
    pub changed: usize,
    /// Objects whose outgoing reachability changed: the source of every
    /// changed edge and all of its ancestors.
    pub affected: BTreeSet<Object>,
    pub closure: ClosureDelta,
}

impl GraphMutation {
    fn record(&mut self, edge: Edge, ancestors: &[TraversalPath], delta: ClosureDelta) {
        self.affected.insert(edge.from.clone());
        self.affected
            .extend(ancestors.iter().map(|path| path.endpoint.clone()));
        self.closure.absorb(delta);
        self.changed += 1;
        self.edges.push(edge);
    }
}

/// Reject `key` when its target already reaches its source.
///
/// Checking the ancestors of `key.from` is sufficient: `key.to` reaches
/// `key.from` exactly when some ancestor path of `key.from` starts at
/// `key.to`, whatever the labels or multiplicity of the edges involved.
pub fn ensure_acyclic(key: &EdgeKey, ancestors_of_from: &[TraversalPath]) -> Result<()> {
    if ancestors_of_from.iter().any(|path| path.endpoint == key.to) {
        return Err(RebacError::Cycle {
            from: key.from.clone(),
            to: key.to.clone(),
        });
    }
    Ok(())
}

fn rejection_reason(err: &RebacError) -> &'static str {
    match err {
        RebacError::Validation(_) => "validation",
        RebacError::Cycle { .. } => "cycle",
        RebacError::NotFound(_) => "not_found",
        RebacError::AlreadyExists(_) => "already_exists",
        _ => "store",
    }
}

/// The relation graph store: point mutations with cycle prevention and
/// closure maintenance, each batch in a single locked transaction.
pub struct RelationGraph {
    store: Arc<dyn RelationStore>,
    maintainer: ClosureMaintainer,
}

impl RelationGraph {
    pub fn new(store: Arc<dyn RelationStore>) -> Self {
        Self {
            store,
            maintainer: ClosureMaintainer::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RelationStore> {
        &self.store
    }

    /// Create one edge. Creating an existing edge returns it unchanged.
    pub async fn create(&self, key: EdgeKey) -> Result<GraphMutation> {
        self.create_all(vec![key]).await
    }

    /// Create several edges atomically: either all are present afterwards or
    /// nothing changed.
    pub async fn create_all(&self, keys: Vec<EdgeKey>) -> Result<GraphMutation> {
        let result = self.try_create_all(keys).await;
        if let Err(ref err) = result {
            counters::mutation_rejected(rejection_reason(err));
            warn!(error = %err, "Relation create rejected");
        }
        result
    }

    async fn try_create_all(&self, keys: Vec<EdgeKey>) -> Result<GraphMutation> {
        for key in &keys {
            key.validate()?;
        }

        let mut tx = self.store.begin().await?;
        let mut mutation = GraphMutation::default();

        for key in keys {
            if let Some(existing) = tx.find_edge(&key).await? {
                debug!(edge = %existing, "Relation already present");
                mutation.edges.push(existing);
                continue;
            }

            let ancestors = tx.list_ancestors(&key.from).await?;
            ensure_acyclic(&key, &ancestors)?;

            let edge = Edge::new(key);
            tx.insert_edge(&edge).await?;
            let delta = self
                .maintainer
                .on_insert(tx.as_mut(), &edge, &ancestors)
                .await?;
            mutation.record(edge, &ancestors, delta);
        }

        tx.commit().await?;
        info!(
            created = mutation.changed,
            closure_written = mutation.closure.written,
            "Relations created"
        );
        Ok(mutation)
    }

    /// Delete one edge together with every closure record derived through it.
    pub async fn delete(&self, key: EdgeKey) -> Result<GraphMutation> {
        self.delete_all(vec![key]).await
    }

    /// Delete several edges atomically. A missing edge fails the whole batch.
    pub async fn delete_all(&self, keys: Vec<EdgeKey>) -> Result<GraphMutation> {
        let result = self.try_delete_all(keys).await;
        if let Err(ref err) = result {
            counters::mutation_rejected(rejection_reason(err));
            warn!(error = %err, "Relation delete rejected");
        }
        result
    }

    async fn try_delete_all(&self, keys: Vec<EdgeKey>) -> Result<GraphMutation> {
        for key in &keys {
            key.validate()?;
        }

        let mut tx = self.store.begin().await?;
        let mut mutation = GraphMutation::default();

        for key in keys {
            let edge = tx
                .find_edge(&key)
                .await?
                .ok_or_else(|| RebacError::NotFound(format!("Relation {}", key)))?;

            tx.delete_edge(edge.id).await?;
            let ancestors = tx.list_ancestors(&edge.from).await?;
            let delta = self
                .maintainer
                .on_delete(tx.as_mut(), &edge, &ancestors)
                .await?;
            mutation.record(edge, &ancestors, delta);
        }

        tx.commit().await?;
        info!(
            deleted = mutation.changed,
            closure_removed = mutation.closure.removed,
            "Relations deleted"
        );
        Ok(mutation)
    }

    pub async fn list_ancestors(&self, object: &Object) -> Result<Vec<TraversalPath>> {
        object.validate()?;
        self.store.list_ancestors(object).await
    }

    pub async fn list_descendants(&self, object: &Object) -> Result<Vec<TraversalPath>> {
        object.validate()?;
        self.store.list_descendants(object).await
    }
}
