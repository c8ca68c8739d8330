//! Incremental maintenance of the materialized transitive closure.
//!
//! Inserting `e: A -> B` connects every node already reaching `A` to every
//! node `B` already reaches. Each such connection is stored as its own
//! record whose ID is derived from the full edge path, so re-deriving the
//! same path is a no-op and deleting `e` can regenerate exactly the IDs it
//! produced.

use crate::{
    error::Result,
    counters,
    models::*,
    repository::GraphTransaction,
};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Counts of closure rows touched by one maintenance step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClosureDelta {
    pub written: u64,
    pub removed: u64,
}

impl ClosureDelta {
    pub fn absorb(&mut self, other: ClosureDelta) {
        self.written += other.written;
        self.removed += other.removed;
    }
}

/// Deterministic ID of a closure record, computed over edge IDs in path order.
pub fn derive_closure_id(path: &[Uuid]) -> Uuid {
    let mut hasher = Sha256::new();
    for id in path {
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    for (dst, src) in bytes.iter_mut().zip(digest.iter()) {
        *dst = *src;
    }
    Uuid::from_bytes(bytes)
}

/// Records implied by `edge` given the ancestor paths of `edge.from` and the
/// descendant paths of `edge.to`. Both lists are extended with the zero-hop
/// entries standing for `edge` itself, so the result always contains the
/// one-hop record of the edge.
pub fn plan_records(
    edge: &Edge,
    ancestors: &[TraversalPath],
    descendants: &[TraversalPath],
) -> Vec<ClosureRecord> {
    let own_source = TraversalPath::zero_hop(edge.from.clone(), None);
    let own_target = TraversalPath::zero_hop(edge.to.clone(), edge.name.clone());

    let sources: Vec<&TraversalPath> = std::iter::once(&own_source).chain(ancestors).collect();
    let targets: Vec<&TraversalPath> = std::iter::once(&own_target).chain(descendants).collect();

    let mut records = Vec::with_capacity(sources.len() * targets.len());
    for source in &sources {
        for target in &targets {
            // Ancestor vias list the hop nearest to `edge.from` first.
            let path: Vec<Uuid> = source
                .via
                .iter()
                .rev()
                .copied()
                .chain(std::iter::once(edge.id))
                .chain(target.via.iter().copied())
                .collect();

            records.push(ClosureRecord {
                id: derive_closure_id(&path),
                from: source.endpoint.clone(),
                to: target.endpoint.clone(),
                name: record_label(edge, source, target),
                path,
            });
        }
    }
    records
}

/// The final hop's label, kept only when every earlier hop is a membership
/// hop. Any other path still proves reachability but confers no relation.
fn record_label(edge: &Edge, source: &TraversalPath, target: &TraversalPath) -> Option<String> {
    if !source.is_membership_chain() {
        return None;
    }
    if target.via.is_empty() {
        return edge.name.clone();
    }
    let edge_is_membership = edge.name.as_deref() == Some(MEMBERSHIP_LABEL);
    if edge_is_membership && target.through_members {
        target.far_name.clone()
    } else {
        None
    }
}

/// Keeps the closure table in step with edge inserts and deletes. Every method
/// runs inside the caller's transaction, so a failure rolls back the edge
/// change together with its closure changes.
#[derive(Debug, Clone, Default)]
pub struct ClosureMaintainer;

impl ClosureMaintainer {
    pub fn new() -> Self {
        Self
    }

    /// Materialize every path through a freshly inserted edge.
    /// `ancestors` must be the ancestor paths of `edge.from` as read inside the
    /// same transaction.
    pub async fn on_insert(
        &self,
        tx: &mut dyn GraphTransaction,
        edge: &Edge,
        ancestors: &[TraversalPath],
    ) -> Result<ClosureDelta> {
        let descendants = tx.list_descendants(&edge.to).await?;
        let records = plan_records(edge, ancestors, &descendants);
        let written = tx.upsert_closure(&records).await?;

        debug!(
            edge = %edge,
            planned = records.len(),
            written,
            "Closure materialized for inserted relation"
        );
        counters::closure_written(written);

        Ok(ClosureDelta {
            written,
            removed: 0,
        })
    }

    /// Remove every record derived through `edge`. The edge row must already be
    /// deleted; paths are recomputed from the in-memory edge so the derived IDs
    /// match those produced at insertion time. In an acyclic graph no path into
    /// `edge.from` or out of `edge.to` runs through `edge`, so the traversals
    /// are unaffected by the deletion.
    pub async fn on_delete(
        &self,
        tx: &mut dyn GraphTransaction,
        edge: &Edge,
        ancestors: &[TraversalPath],
    ) -> Result<ClosureDelta> {
        let descendants = tx.list_descendants(&edge.to).await?;
        let ids: Vec<Uuid> = plan_records(edge, ancestors, &descendants)
            .iter()
            .map(|record| record.id)
            .collect();
        let removed = tx.delete_closure(&ids).await?;

        debug!(edge = %edge, planned = ids.len(), removed, "Closure removed for deleted relation");
        counters::closure_removed(removed);

        Ok(ClosureDelta {
            written: 0,
            removed,
        })
    }
}
