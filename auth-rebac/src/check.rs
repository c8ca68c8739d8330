use crate::{
    counters,
    error::{RebacError, Result},
    evaluator::SetEvaluator,
    intersection::{CacheEpoch, IntersectionCache},
    models::*,
    repository::RelationStore,
    schema::{Schema, SetExpr},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers `Check(subject, relation, object)`.
///
/// The intersection cache is consulted first when present; anything it
/// cannot decide goes through the [`SetEvaluator`], which reads the closure
/// store directly. Successful authoritative checks refresh the subject's
/// cache entry.
pub struct CheckResolver {
    store: Arc<dyn RelationStore>,
    evaluator: SetEvaluator,
    cache: Option<Arc<IntersectionCache>>,
}

impl CheckResolver {
    pub fn new(
        store: Arc<dyn RelationStore>,
        evaluator: SetEvaluator,
        cache: Option<Arc<IntersectionCache>>,
    ) -> Self {
        Self {
            store,
            evaluator,
            cache,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.evaluator.schema()
    }

    /// The definition of `relation` for the type of `object`.
    pub fn resolve_relation(&self, relation: &str, object: &Object) -> Result<&SetExpr> {
        let object_type = object.object_type();
        let definition = self.schema().types.get(object_type).ok_or_else(|| {
            RebacError::Validation(format!("Type '{}' is not defined in the schema", object_type))
        })?;
        definition.relations.get(relation).ok_or_else(|| {
            RebacError::NotFound(format!(
                "Relation '{}' on type '{}'",
                relation, object_type
            ))
        })
    }

    pub async fn check(&self, subject: &Object, relation: &str, object: &Object) -> Result<bool> {
        let result = self.try_check(subject, relation, object).await;
        match result {
            Ok(allowed) => counters::check_completed(allowed),
            Err(ref err) => {
                counters::check_failed();
                warn!(%subject, relation, %object, error = %err, "Check failed");
            }
        }
        result
    }

    async fn try_check(&self, subject: &Object, relation: &str, object: &Object) -> Result<bool> {
        subject.validate()?;
        object.validate()?;
        let expr = self.resolve_relation(relation, object)?;

        let Some(cache) = self.cache.as_ref() else {
            return self.evaluator.contains(expr, object, subject).await;
        };

        let target = SetHandle::new(object.clone(), relation);
        match cache.decide(subject, &target, expr) {
            Ok(allowed) => {
                debug!(%subject, %target, allowed, "Check answered from intersection cache");
                return Ok(allowed);
            }
            Err(RebacError::StaleCache(reason)) => {
                debug!(reason = %reason, "Intersection cache miss, falling back to evaluator");
            }
            Err(err) => return Err(err),
        }

        let epoch = cache.epoch();
        let allowed = self.evaluator.contains(expr, object, subject).await?;
        self.refresh(cache, subject, epoch).await;
        Ok(allowed)
    }

    /// Failures only cost a future cache miss.
    async fn refresh(&self, cache: &IntersectionCache, subject: &Object, epoch: CacheEpoch) {
        match self.store.list_closure(subject, None).await {
            Ok(records) => cache.populate_parents(subject.clone(), &records, epoch),
            Err(err) => debug!(%subject, error = %err, "Skipping intersection cache refresh"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RelationGraph;
    use crate::repository::InMemoryRelationStore;
    use crate::schema::TypeDefinition;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new().with_type(
            "doc",
            TypeDefinition::new()
                .relation("editor", SetExpr::relative("editor"))
                .relation(
                    "viewer",
                    SetExpr::union(vec![SetExpr::relative("viewer"), SetExpr::relative("editor")]),
                ),
        ))
    }

    fn resolver(with_cache: bool) -> (RelationGraph, CheckResolver, Option<Arc<IntersectionCache>>) {
        let store = Arc::new(InMemoryRelationStore::new());
        let graph = RelationGraph::new(store.clone());
        let schema = schema();
        let cache = with_cache.then(|| Arc::new(IntersectionCache::new(schema.fingerprint(), 128)));
        let evaluator = SetEvaluator::new(store.clone(), schema, 16, true);
        (graph, CheckResolver::new(store, evaluator, cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_undefined_relation_is_not_found() {
        let (_, resolver, _) = resolver(false);
        let err = resolver
            .check(&Object::new("user", "a"), "owner", &Object::new("doc", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_type_is_validation_error() {
        let (_, resolver, _) = resolver(false);
        let err = resolver
            .check(&Object::new("user", "a"), "viewer", &Object::new("folder", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cache_never_hides_a_revocation() {
        let (graph, resolver, cache) = resolver(true);
        let cache = cache.unwrap();
        let alice = Object::new("user", "alice");
        let doc = Object::new("doc", "1");
        let key = EdgeKey::new(alice.clone(), Some("editor"), doc.clone());

        let mutation = graph.create(key.clone()).await.unwrap();
        cache.invalidate(&mutation.affected);
        assert!(resolver.check(&alice, "viewer", &doc).await.unwrap());
        // Second check is served by the populated entry.
        assert!(resolver.check(&alice, "viewer", &doc).await.unwrap());

        let mutation = graph.delete(key).await.unwrap();
        cache.invalidate(&mutation.affected);
        assert!(!resolver.check(&alice, "viewer", &doc).await.unwrap());
        assert!(!resolver.check(&alice, "editor", &doc).await.unwrap());
    }
}
