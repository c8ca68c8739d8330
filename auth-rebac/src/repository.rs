use crate::{error::Result, models::*};
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRelationStore;
pub use postgres::PostgresRelationStore;

/// Storage collaborator for the relation graph, its closure and roles.
///
/// Reads run outside any transaction and observe either the state before or
/// after a committed mutation, never an intermediate one. Mutations go
/// through [`RelationStore::begin`].
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Start a mutation transaction holding the exclusive relation lock.
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>>;

    /// Direct relations matching `filter`, ordered by edge ID, strictly after
    /// `after` when given.
    async fn list_edges(
        &self,
        filter: &RelationFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Edge>>;

    async fn list_ancestors(&self, object: &Object) -> Result<Vec<TraversalPath>>;

    async fn list_descendants(&self, object: &Object) -> Result<Vec<TraversalPath>>;

    /// Whether any closure record connects `from` to `to`. `None` matches any
    /// label.
    async fn closure_exists(&self, from: &Object, to: &Object, name: Option<&str>) -> Result<bool>;

    /// Closure records starting at `from`, optionally restricted to one target.
    async fn list_closure(&self, from: &Object, to: Option<&Object>) -> Result<Vec<ClosureRecord>>;

    /// Distinct targets of direct relations `from -name-> _`.
    async fn direct_targets(&self, from: &Object, name: &str) -> Result<Vec<Object>>;

    async fn upsert_role(&self, role: &Role) -> Result<Role>;

    async fn get_role(&self, id: &str) -> Result<Option<Role>>;

    /// Returns false when the role did not exist.
    async fn delete_role(&self, id: &str) -> Result<bool>;
}

/// A mutation transaction. Dropping it without [`GraphTransaction::commit`]
/// discards every change made through it.
#[async_trait]
pub trait GraphTransaction: Send {
    async fn find_edge(&mut self, key: &EdgeKey) -> Result<Option<Edge>>;

    async fn insert_edge(&mut self, edge: &Edge) -> Result<()>;

    async fn delete_edge(&mut self, id: Uuid) -> Result<bool>;

    /// Every path of length >= 1 ending at `object`.
    async fn list_ancestors(&mut self, object: &Object) -> Result<Vec<TraversalPath>>;

    /// Every path of length >= 1 starting at `object`.
    async fn list_descendants(&mut self, object: &Object) -> Result<Vec<TraversalPath>>;

    /// Insert records, ignoring IDs that already exist. Returns the number of
    /// records actually inserted.
    async fn upsert_closure(&mut self, records: &[ClosureRecord]) -> Result<u64>;

    /// Returns the number of records removed.
    async fn delete_closure(&mut self, ids: &[Uuid]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
