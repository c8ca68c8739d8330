use crate::{
    error::{RebacError, Result},
    models::*,
    repository::RelationStore,
    schema::{Schema, SetExpr},
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Resolve to `true` as soon as any branch does.
///
/// In parallel mode every branch is polled concurrently and the rest are
/// dropped on the first `true`. Sequential mode evaluates branches in order.
/// Either way `false` needs every branch to finish. Configuration errors
/// ([`RebacError::is_validation`]) are returned as soon as they are observed;
/// any other error is only returned when no branch produced `true`.
pub async fn any_of<'a, I>(branches: I, parallel: bool) -> Result<bool>
where
    I: IntoIterator<Item = BoxFuture<'a, Result<bool>>>,
{
    let mut first_error = None;

    if parallel {
        let mut pending: FuturesUnordered<_> = branches.into_iter().collect();
        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) if err.is_validation() => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
    } else {
        for branch in branches {
            match branch.await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) if err.is_validation() => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(false),
    }
}

/// (object, relation) pairs already claimed by one evaluation.
type Visited = Mutex<HashSet<(Object, String)>>;

/// Recursive interpreter for [`SetExpr`] against the closure store.
///
/// `Relative2` follows direct edges only and evaluates the named relation on
/// each target, so transitivity over hierarchies comes from the schema. Each
/// `(object, relation)` pair is evaluated at most once per call, and the
/// depth bound counts `Relative2` hops.
pub struct SetEvaluator {
    store: Arc<dyn RelationStore>,
    schema: Arc<Schema>,
    max_depth: u32,
    parallel_union: bool,
}

impl SetEvaluator {
    pub fn new(
        store: Arc<dyn RelationStore>,
        schema: Arc<Schema>,
        max_depth: u32,
        parallel_union: bool,
    ) -> Self {
        Self {
            store,
            schema,
            max_depth,
            parallel_union,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Whether `candidate` belongs to `expr` evaluated on `contextual`.
    pub async fn contains(
        &self,
        expr: &SetExpr,
        contextual: &Object,
        candidate: &Object,
    ) -> Result<bool> {
        let visited = Visited::default();
        self.eval(expr, contextual, candidate, 0, &visited).await
    }

    fn eval<'a>(
        &'a self,
        expr: &'a SetExpr,
        contextual: &'a Object,
        candidate: &'a Object,
        depth: u32,
        visited: &'a Visited,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            trace!(depth, %contextual, %candidate, "Evaluating set expression");

            match expr {
                SetExpr::Absolute { set } => {
                    self.store
                        .closure_exists(candidate, &set.object, Some(&set.label))
                        .await
                }
                SetExpr::Relative { label } => {
                    self.store
                        .closure_exists(candidate, contextual, Some(label))
                        .await
                }
                SetExpr::Relative2 {
                    from_label,
                    relation,
                } => {
                    let targets = self.store.direct_targets(contextual, from_label).await?;
                    if !targets.is_empty() && depth >= self.max_depth {
                        return Err(RebacError::SchemaDepthExceeded(self.max_depth));
                    }
                    let mut branches = Vec::with_capacity(targets.len());
                    for target in targets {
                        let nested = self.schema.lookup(target.object_type(), relation).ok_or_else(|| {
                            RebacError::Validation(format!(
                                "Relation '{}' is not defined for type '{}'",
                                relation,
                                target.object_type()
                            ))
                        })?;
                        let first_visit = visited.lock().insert((target.clone(), relation.clone()));
                        if !first_visit {
                            continue;
                        }
                        branches.push(self.eval_owned(nested, target, candidate, depth + 1, visited));
                    }
                    any_of(branches, self.parallel_union).await
                }
                SetExpr::Union { exprs } => {
                    let branches: Vec<_> = exprs
                        .iter()
                        .map(|branch| self.eval(branch, contextual, candidate, depth, visited))
                        .collect();
                    any_of(branches, self.parallel_union).await
                }
            }
        }
        .boxed()
    }

    fn eval_owned<'a>(
        &'a self,
        expr: &'a SetExpr,
        contextual: Object,
        candidate: &'a Object,
        depth: u32,
        visited: &'a Visited,
    ) -> BoxFuture<'a, Result<bool>> {
        async move { self.eval(expr, &contextual, candidate, depth, visited).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RelationGraph;
    use crate::repository::InMemoryRelationStore;
    use crate::schema::TypeDefinition;
    use std::time::Duration;

    fn user(id: &str) -> Object {
        Object::new("user", id)
    }

    fn schema() -> Schema {
        Schema::new()
            .with_type(
                "folder",
                TypeDefinition::new().relation("viewer", SetExpr::relative("viewer")),
            )
            .with_type(
                "doc",
                TypeDefinition::new()
                    .relation("editor", SetExpr::relative("editor"))
                    .relation(
                        "viewer",
                        SetExpr::union(vec![
                            SetExpr::relative("viewer"),
                            SetExpr::relative("editor"),
                            SetExpr::relative2("parent", "viewer"),
                        ]),
                    )
                    .relation("auditor", SetExpr::absolute(Object::new("team", "audit"), "member"))
                    .relation("broken", SetExpr::relative2("parent", "owner")),
            )
    }

    async fn setup(parallel: bool) -> (RelationGraph, SetEvaluator) {
        let store = Arc::new(InMemoryRelationStore::new());
        let graph = RelationGraph::new(store.clone());
        let evaluator = SetEvaluator::new(store, Arc::new(schema()), 16, parallel);
        (graph, evaluator)
    }

    fn edge(from: Object, name: &str, to: Object) -> EdgeKey {
        EdgeKey::new(from, Some(name), to)
    }

    #[tokio::test]
    async fn test_relative_and_union() {
        let (graph, evaluator) = setup(true).await;
        let doc = Object::new("doc", "1");
        graph.create(edge(user("alice"), "editor", doc.clone())).await.unwrap();

        let schema = evaluator.schema().clone();
        let viewer = schema.lookup("doc", "viewer").unwrap();
        let editor = schema.lookup("doc", "editor").unwrap();

        assert!(evaluator.contains(editor, &doc, &user("alice")).await.unwrap());
        assert!(evaluator.contains(viewer, &doc, &user("alice")).await.unwrap());
        assert!(!evaluator.contains(viewer, &doc, &user("bob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_relative2_follows_parent() {
        for parallel in [true, false] {
            let (graph, evaluator) = setup(parallel).await;
            let doc = Object::new("doc", "1");
            let folder = Object::new("folder", "f");
            graph.create(edge(doc.clone(), "parent", folder.clone())).await.unwrap();
            graph.create(edge(user("carol"), "viewer", folder.clone())).await.unwrap();

            let viewer = evaluator.schema().lookup("doc", "viewer").unwrap().clone();
            assert!(evaluator.contains(&viewer, &doc, &user("carol")).await.unwrap());
            assert!(!evaluator.contains(&viewer, &doc, &user("dave")).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_absolute_ignores_context() {
        let (graph, evaluator) = setup(true).await;
        graph
            .create(edge(user("erin"), "member", Object::new("team", "audit")))
            .await
            .unwrap();

        let auditor = evaluator.schema().lookup("doc", "auditor").unwrap().clone();
        assert!(evaluator
            .contains(&auditor, &Object::new("doc", "anything"), &user("erin"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_undefined_nested_relation_is_validation_error() {
        let (graph, evaluator) = setup(true).await;
        let doc = Object::new("doc", "1");
        graph
            .create(edge(doc.clone(), "parent", Object::new("folder", "f")))
            .await
            .unwrap();

        let broken = evaluator.schema().lookup("doc", "broken").unwrap().clone();
        let err = evaluator.contains(&broken, &doc, &user("alice")).await.unwrap_err();
        assert!(matches!(err, RebacError::Validation(_)));
    }

    fn folder_schema() -> Schema {
        Schema::new().with_type(
            "folder",
            TypeDefinition::new().relation(
                "viewer",
                SetExpr::union(vec![
                    SetExpr::relative("viewer"),
                    SetExpr::relative2("parent", "viewer"),
                ]),
            ),
        )
    }

    async fn folder_chain(graph: &RelationGraph, levels: usize) -> Vec<Object> {
        let folders: Vec<Object> = (0..levels).map(|i| Object::new("folder", &i.to_string())).collect();
        for pair in folders.windows(2) {
            graph.create(edge(pair[0].clone(), "parent", pair[1].clone())).await.unwrap();
        }
        folders
    }

    #[tokio::test]
    async fn test_deep_hierarchy_within_depth() {
        for parallel in [true, false] {
            let store = Arc::new(InMemoryRelationStore::new());
            let graph = RelationGraph::new(store.clone());
            let evaluator = SetEvaluator::new(store, Arc::new(folder_schema()), 16, parallel);
            let folders = folder_chain(&graph, 14).await;
            let root = folders.last().unwrap().clone();
            graph.create(edge(user("root_viewer"), "viewer", root)).await.unwrap();

            let viewer = evaluator.schema().lookup("folder", "viewer").unwrap().clone();
            let leaf = &folders[0];
            assert!(evaluator.contains(&viewer, leaf, &user("root_viewer")).await.unwrap());
            assert!(!evaluator.contains(&viewer, leaf, &user("nobody")).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_shared_ancestors_in_diamonds() {
        // Two parents per level, so every folder is reachable along many paths.
        for parallel in [true, false] {
            let store = Arc::new(InMemoryRelationStore::new());
            let graph = RelationGraph::new(store.clone());
            let evaluator = SetEvaluator::new(store, Arc::new(folder_schema()), 16, parallel);
            let levels = 8;
            for i in 0..levels {
                for side in ["l", "r"] {
                    let node = Object::new("folder", &format!("{}{}", side, i));
                    for next in ["l", "r"] {
                        let parent = Object::new("folder", &format!("{}{}", next, i + 1));
                        graph.create(edge(node.clone(), "parent", parent)).await.unwrap();
                    }
                }
            }
            let top = Object::new("folder", &format!("r{}", levels));
            graph.create(edge(user("owner"), "viewer", top)).await.unwrap();

            let viewer = evaluator.schema().lookup("folder", "viewer").unwrap().clone();
            let bottom = Object::new("folder", "l0");
            assert!(evaluator.contains(&viewer, &bottom, &user("owner")).await.unwrap());
            assert!(!evaluator.contains(&viewer, &bottom, &user("nobody")).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_hops_beyond_depth_fail() {
        let store = Arc::new(InMemoryRelationStore::new());
        let graph = RelationGraph::new(store.clone());
        let evaluator = SetEvaluator::new(store, Arc::new(folder_schema()), 3, false);
        let folders = folder_chain(&graph, 6).await;

        let viewer = evaluator.schema().lookup("folder", "viewer").unwrap().clone();
        let err = evaluator
            .contains(&viewer, &folders[0], &user("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::SchemaDepthExceeded(3)));

        // Within the bound a miss is a plain `false`.
        assert!(!evaluator.contains(&viewer, &folders[3], &user("alice")).await.unwrap());
    }

    #[tokio::test]
    async fn test_any_of_short_circuits_on_true() {
        let slow: BoxFuture<'static, Result<bool>> = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(false)
        }
        .boxed();
        let fast: BoxFuture<'static, Result<bool>> = async { Ok(true) }.boxed();

        let decided = tokio::time::timeout(Duration::from_secs(5), any_of(vec![slow, fast], true))
            .await
            .expect("parallel union must not wait for the slow branch");
        assert!(decided.unwrap());
    }

    #[tokio::test]
    async fn test_any_of_prefers_true_over_error() {
        let failing: BoxFuture<'static, Result<bool>> =
            async { Err(RebacError::Store("boom".into())) }.boxed();
        let ok: BoxFuture<'static, Result<bool>> = async { Ok(true) }.boxed();
        assert!(any_of(vec![failing, ok], false).await.unwrap());

        let failing: BoxFuture<'static, Result<bool>> =
            async { Err(RebacError::Store("boom".into())) }.boxed();
        let no: BoxFuture<'static, Result<bool>> = async { Ok(false) }.boxed();
        assert!(any_of(vec![failing, no], true).await.is_err());
    }

    #[tokio::test]
    async fn test_any_of_surfaces_configuration_errors() {
        let broken: BoxFuture<'static, Result<bool>> =
            async { Err(RebacError::Validation("undefined relation".into())) }.boxed();
        let ok: BoxFuture<'static, Result<bool>> = async { Ok(true) }.boxed();
        let err = any_of(vec![broken, ok], false).await.unwrap_err();
        assert!(err.is_validation());

        let slow: BoxFuture<'static, Result<bool>> = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }
        .boxed();
        let broken: BoxFuture<'static, Result<bool>> =
            async { Err(RebacError::SchemaDepthExceeded(4)) }.boxed();
        let err = tokio::time::timeout(Duration::from_secs(5), any_of(vec![slow, broken], true))
            .await
            .expect("configuration errors must not wait for other branches")
            .unwrap_err();
        assert!(matches!(err, RebacError::SchemaDepthExceeded(4)));
    }
}
