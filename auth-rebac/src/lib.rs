//! Relationship-based access control engine
//!
//! Access decisions are answered from a directed, labelled relation graph:
//! - Direct relations between typed objects (`"type:value"`), kept acyclic
//! - A materialized transitive closure, maintained incrementally on every
//!   mutation inside the same locked transaction
//! - Schema-defined computed relations (absolute sets, relative sets,
//!   two-hop rewrites and unions) evaluated against the closure
//! - An optional intersection cache that answers repeat checks without
//!   touching the store, and says so when it cannot
//!
//! # Core Concepts
//!
//! - **Object**: a typed node, e.g. `user:alice` or `doc:readme`
//! - **Edge**: a stored relation `from -name-> to`
//! - **Closure record**: one materialized path between two objects
//! - **Role**: a bundle of verbs; granting it creates one edge per verb
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{Object, RebacEngine, Role, Schema, SetExpr, TypeDefinition};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::new().with_type(
//!         "doc",
//!         TypeDefinition::new().relation("read", SetExpr::relative("read")),
//!     );
//!     let engine = RebacEngine::in_memory(schema)?;
//!     engine.upsert_role(Role::new("reader", ["read"]), None).await?;
//!
//!     let alice = Object::new("user", "alice");
//!     let doc = Object::new("doc", "readme");
//!     engine.grant(&alice, "reader", &doc, None).await?;
//!
//!     assert!(engine.check(&alice, "read", &doc, None).await?);
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod closure;
pub mod counters;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod intersection;
pub mod models;
pub mod repository;
pub mod schema;

pub use check::CheckResolver;
pub use closure::{ClosureDelta, ClosureMaintainer};
pub use engine::*;
pub use error::*;
pub use evaluator::SetEvaluator;
pub use graph::{GraphMutation, RelationGraph};
pub use intersection::{CacheOutcome, IntersectionCache};
pub use models::*;
pub use repository::{InMemoryRelationStore, PostgresRelationStore, RelationStore};
pub use schema::*;
