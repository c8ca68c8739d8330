use crate::{
    check::CheckResolver,
    error::{RebacError, Result},
    evaluator::SetEvaluator,
    graph::{GraphMutation, RelationGraph},
    intersection::IntersectionCache,
    models::*,
    repository::{InMemoryRelationStore, PostgresRelationStore, RelationStore},
    schema::Schema,
};
use config_engine::{EngineSettings, RebacConfig};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Relationship-based access control engine.
///
/// Every operation takes an optional deadline as its last argument; `None`
/// applies the configured default. On expiry the operation is abandoned and
/// [`RebacError::DeadlineExceeded`] is returned. Abandoned mutations roll
/// back.
pub struct RebacEngine {
    /// Relation storage shared by the graph and the resolver
    store: Arc<dyn RelationStore>,

    /// Edge mutations with closure maintenance
    graph: RelationGraph,

    /// Check resolution against the current schema
    resolver: CheckResolver,

    /// Present when the intersection cache is enabled
    cache: Option<Arc<IntersectionCache>>,

    settings: EngineSettings,
}

impl RebacEngine {
    /// Create an engine over `store` with a validated schema
    pub fn new(store: Arc<dyn RelationStore>, schema: Schema, settings: EngineSettings) -> Result<Self> {
        schema.validate()?;
        let (resolver, cache) = Self::build_resolver(&store, Arc::new(schema), &settings);

        Ok(Self {
            graph: RelationGraph::new(store.clone()),
            store,
            resolver,
            cache,
            settings,
        })
    }

    /// Create an engine backed by the in-memory store
    pub fn in_memory(schema: Schema) -> Result<Self> {
        Self::new(
            Arc::new(InMemoryRelationStore::new()),
            schema,
            EngineSettings::default(),
        )
    }

    /// Build from configuration: PostgreSQL when `database.url` is set,
    /// the in-memory store otherwise
    pub async fn from_config(config: &RebacConfig) -> Result<Self> {
        let schema = match config.engine.schema_path {
            Some(ref path) => load_schema(path).await?,
            None => Schema::new(),
        };

        let store: Arc<dyn RelationStore> = if config.database.url.is_some() {
            let store = PostgresRelationStore::connect(&config.database).await?;
            store.ensure_schema().await?;
            Arc::new(store)
        } else {
            info!("No database configured, using the in-memory relation store");
            Arc::new(InMemoryRelationStore::new())
        };

        Self::new(store, schema, config.engine.clone())
    }

    fn build_resolver(
        store: &Arc<dyn RelationStore>,
        schema: Arc<Schema>,
        settings: &EngineSettings,
    ) -> (CheckResolver, Option<Arc<IntersectionCache>>) {
        let cache = settings.intersection_cache.then(|| {
            Arc::new(IntersectionCache::new(
                schema.fingerprint(),
                settings.intersection_cache_capacity,
            ))
        });
        let evaluator = SetEvaluator::new(
            store.clone(),
            schema,
            settings.max_schema_depth,
            settings.parallel_union,
        );
        (CheckResolver::new(store.clone(), evaluator, cache.clone()), cache)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.resolver.schema()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn RelationStore> {
        &self.store
    }

    pub fn intersection_cache(&self) -> Option<&Arc<IntersectionCache>> {
        self.cache.as_ref()
    }

    /// Replace the schema. Cached subsets belong to the old schema, so the
    /// intersection cache starts over under the new fingerprint.
    pub fn update_schema(&mut self, schema: Schema) -> Result<()> {
        schema.validate()?;
        let fingerprint = schema.fingerprint();
        let (resolver, cache) = Self::build_resolver(&self.store, Arc::new(schema), &self.settings);
        self.resolver = resolver;
        self.cache = cache;
        info!(%fingerprint, "Schema updated");
        Ok(())
    }

    // =============================================================================
    // Checks
    // =============================================================================

    /// Whether `subject` holds `relation` on `object`
    #[instrument(skip(self), fields(subject = %subject, object = %object))]
    pub async fn check(
        &self,
        subject: &Object,
        relation: &str,
        object: &Object,
        deadline: Option<Duration>,
    ) -> Result<bool> {
        self.within(deadline, self.resolver.check(subject, relation, object))
            .await
    }

    /// Check several requests under one deadline. Results keep request order.
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub async fn batch_check(
        &self,
        requests: &[CheckRequest],
        deadline: Option<Duration>,
    ) -> Result<Vec<bool>> {
        let checks = requests.iter().map(|request| {
            self.resolver
                .check(&request.subject, &request.relation, &request.object)
        });
        self.within(deadline, futures::future::try_join_all(checks))
            .await
    }

    /// Whether any path leads from `from` to `to`, optionally ending in `name`
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn reachable(
        &self,
        from: &Object,
        name: Option<&str>,
        to: &Object,
        deadline: Option<Duration>,
    ) -> Result<bool> {
        from.validate()?;
        to.validate()?;
        self.within(deadline, self.store.closure_exists(from, to, name))
            .await
    }

    /// Every materialized path from `from` to `to`
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn explain(
        &self,
        from: &Object,
        to: &Object,
        deadline: Option<Duration>,
    ) -> Result<Vec<ClosureRecord>> {
        from.validate()?;
        to.validate()?;
        self.within(deadline, self.store.list_closure(from, Some(to)))
            .await
    }

    // =============================================================================
    // Role grants
    // =============================================================================

    /// Grant every verb of `role_id` on `object` to `subject`. Granting an
    /// already held role changes nothing.
    #[instrument(skip(self), fields(subject = %subject, object = %object))]
    pub async fn grant(
        &self,
        subject: &Object,
        role_id: &str,
        object: &Object,
        deadline: Option<Duration>,
    ) -> Result<GraphMutation> {
        let mutation = self
            .mutate(deadline, async {
                let role = self.require_role(role_id).await?;
                self.graph.create_all(role.expand(subject, object)).await
            })
            .await?;
        info!(role = role_id, created = mutation.changed, "Role granted");
        Ok(mutation)
    }

    /// Remove the edges a grant of `role_id` created. Fails with
    /// [`RebacError::NotFound`] and changes nothing if any of them is missing.
    #[instrument(skip(self), fields(subject = %subject, object = %object))]
    pub async fn revoke(
        &self,
        subject: &Object,
        role_id: &str,
        object: &Object,
        deadline: Option<Duration>,
    ) -> Result<GraphMutation> {
        let mutation = self
            .mutate(deadline, async {
                let role = self.require_role(role_id).await?;
                self.graph.delete_all(role.expand(subject, object)).await
            })
            .await?;
        info!(role = role_id, deleted = mutation.changed, "Role revoked");
        Ok(mutation)
    }

    // =============================================================================
    // Direct relations
    // =============================================================================

    /// Create a direct relation, returning the stored edge
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn connect(
        &self,
        from: &Object,
        name: Option<&str>,
        to: &Object,
        deadline: Option<Duration>,
    ) -> Result<Edge> {
        let key = EdgeKey::new(from.clone(), name, to.clone());
        let mutation = self.mutate(deadline, self.graph.create(key.clone())).await?;
        single_edge(mutation, &key)
    }

    /// Delete a direct relation, returning the removed edge
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn disconnect(
        &self,
        from: &Object,
        name: Option<&str>,
        to: &Object,
        deadline: Option<Duration>,
    ) -> Result<Edge> {
        let key = EdgeKey::new(from.clone(), name, to.clone());
        let mutation = self.mutate(deadline, self.graph.delete(key.clone())).await?;
        single_edge(mutation, &key)
    }

    /// One page of direct relations matching `filter`, in edge-ID order
    #[instrument(skip_all)]
    pub async fn list_relations(
        &self,
        filter: &RelationFilter,
        deadline: Option<Duration>,
    ) -> Result<RelationPage> {
        if let Some(ref from) = filter.from {
            from.validate()?;
        }
        if let Some(ref to) = filter.to {
            to.validate()?;
        }
        let limit = self.page_size(filter.limit);
        let after = filter.after.as_ref().map(PageToken::edge_id).transpose()?;

        self.within(deadline, async {
            let mut edges = self.store.list_edges(filter, after, limit + 1).await?;
            let next_page = if edges.len() > limit {
                edges.truncate(limit);
                edges.last().map(|edge| PageToken::after_edge(edge.id))
            } else {
                None
            };
            Ok(RelationPage { edges, next_page })
        })
        .await
    }

    pub async fn list_ancestors(
        &self,
        object: &Object,
        deadline: Option<Duration>,
    ) -> Result<Vec<TraversalPath>> {
        self.within(deadline, self.graph.list_ancestors(object)).await
    }

    pub async fn list_descendants(
        &self,
        object: &Object,
        deadline: Option<Duration>,
    ) -> Result<Vec<TraversalPath>> {
        self.within(deadline, self.graph.list_descendants(object)).await
    }

    // =============================================================================
    // Role definitions
    // =============================================================================

    #[instrument(skip(self), fields(role = %role.id))]
    pub async fn upsert_role(&self, role: Role, deadline: Option<Duration>) -> Result<Role> {
        role.validate()?;
        let stored = self.within(deadline, self.store.upsert_role(&role)).await?;
        info!(verbs = stored.verbs.len(), "Role stored");
        Ok(stored)
    }

    #[instrument(skip(self))]
    pub async fn remove_role(&self, role_id: &str, deadline: Option<Duration>) -> Result<()> {
        let removed = self.within(deadline, self.store.delete_role(role_id)).await?;
        if !removed {
            return Err(RebacError::NotFound(format!("Role '{}'", role_id)));
        }
        info!("Role removed");
        Ok(())
    }

    pub async fn get_role(&self, role_id: &str, deadline: Option<Duration>) -> Result<Role> {
        self.within(deadline, self.require_role(role_id)).await
    }

    async fn require_role(&self, role_id: &str) -> Result<Role> {
        self.store
            .get_role(role_id)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("Role '{}'", role_id)))
    }

    // =============================================================================
    // Helpers
    // =============================================================================

    /// Run a graph mutation and invalidate the cache entries it affected.
    /// After a deadline, storage or internal failure the commit outcome is
    /// unknown, so every entry is invalidated.
    async fn mutate<F>(&self, deadline: Option<Duration>, operation: F) -> Result<GraphMutation>
    where
        F: Future<Output = Result<GraphMutation>>,
    {
        let result = self.within(deadline, operation).await;
        if let Some(ref cache) = self.cache {
            match result {
                Ok(ref mutation) if mutation.changed > 0 => cache.invalidate(&mutation.affected),
                Err(RebacError::DeadlineExceeded(_) | RebacError::Store(_) | RebacError::Internal(_)) => {
                    cache.invalidate_all()
                }
                _ => {}
            }
        }
        result
    }

    fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.settings.default_page_size)
            .clamp(1, self.settings.max_page_size.max(1))
    }

    async fn within<T, F>(&self, deadline: Option<Duration>, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match deadline.or_else(|| self.settings.default_deadline()) {
            Some(limit) => tokio::time::timeout(limit, operation).await.map_err(|_| {
                warn!(?limit, "Deadline exceeded, operation abandoned");
                RebacError::DeadlineExceeded(limit)
            })?,
            None => operation.await,
        }
    }
}

fn single_edge(mutation: GraphMutation, key: &EdgeKey) -> Result<Edge> {
    mutation
        .edges
        .into_iter()
        .next()
        .ok_or_else(|| RebacError::Internal(anyhow::anyhow!("mutation of {} returned no edge", key)))
}

/// Read a schema file, picking the format by extension
pub async fn load_schema(path: &Path) -> Result<Schema> {
    let source = tokio::fs::read_to_string(path).await.map_err(|e| {
        RebacError::Validation(format!("Cannot read schema {}: {}", path.display(), e))
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Schema::from_json(&source),
        _ => Schema::from_yaml(&source),
    }
}
