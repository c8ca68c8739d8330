//! PostgreSQL-backed relation store
//!
//! This implementation stores the relation graph in PostgreSQL with:
//! - One row per direct relation (`rebac_relations`)
//! - One row per derivation path of the transitive closure (`rebac_closure`)
//! - Roles as verb arrays (`rebac_roles`)
//! - Recursive CTE traversal accumulating the traversed edge IDs
//! - A table-level EXCLUSIVE lock for the duration of every mutation, which
//!   serializes writers while letting plain reads proceed

use crate::{
    error::{RebacError, Result},
    models::*,
    repository::{GraphTransaction, RelationStore},
};
use async_trait::async_trait;
use config_engine::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rebac_relations (
        id          UUID PRIMARY KEY,
        from_object TEXT NOT NULL,
        to_object   TEXT NOT NULL,
        name        TEXT,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CHECK (from_object <> to_object)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS rebac_relations_key_idx
        ON rebac_relations (from_object, to_object, COALESCE(name, ''))
    "#,
    "CREATE INDEX IF NOT EXISTS rebac_relations_to_idx ON rebac_relations (to_object)",
    r#"
    CREATE TABLE IF NOT EXISTS rebac_closure (
        id          UUID PRIMARY KEY,
        from_object TEXT NOT NULL,
        to_object   TEXT NOT NULL,
        name        TEXT,
        path        UUID[] NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS rebac_closure_lookup_idx
        ON rebac_closure (from_object, to_object, name)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rebac_roles (
        id         TEXT PRIMARY KEY,
        verbs      TEXT[] NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

const ANCESTORS_QUERY: &str = r#"
    WITH RECURSIVE ancestors (endpoint, via, far_name, through_members) AS (
        SELECT r.from_object, ARRAY[r.id], r.name, TRUE
        FROM rebac_relations r
        WHERE r.to_object = $1
      UNION ALL
        SELECT r.from_object, a.via || r.id, r.name,
               a.through_members AND COALESCE(a.far_name = $2, FALSE)
        FROM rebac_relations r
        JOIN ancestors a ON r.to_object = a.endpoint
        WHERE r.from_object <> $1
          AND NOT (r.id = ANY(a.via))
    )
    SELECT endpoint, via, far_name, through_members FROM ancestors
    ORDER BY cardinality(via), via
"#;

const DESCENDANTS_QUERY: &str = r#"
    WITH RECURSIVE descendants (endpoint, via, far_name, through_members) AS (
        SELECT r.to_object, ARRAY[r.id], r.name, TRUE
        FROM rebac_relations r
        WHERE r.from_object = $1
      UNION ALL
        SELECT r.to_object, d.via || r.id, r.name,
               d.through_members AND COALESCE(d.far_name = $2, FALSE)
        FROM rebac_relations r
        JOIN descendants d ON r.from_object = d.endpoint
        WHERE r.to_object <> $1
          AND NOT (r.id = ANY(d.via))
    )
    SELECT endpoint, via, far_name, through_members FROM descendants
    ORDER BY cardinality(via), via
"#;

/// PostgreSQL-backed relation store
#[derive(Clone)]
pub struct PostgresRelationStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresRelationStore {
    /// Create a new PostgreSQL store
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Bound how long a mutation waits for the relation lock
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Create with connection string
    pub async fn from_connection_string(connection_string: &str) -> Result<Self> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| RebacError::Store(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Create a pooled store from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| RebacError::Validation("database.url is not configured".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(url)
            .await
            .map_err(|e| RebacError::Store(format!("Failed to connect: {}", e)))?;

        info!("PostgreSQL relation store connected");
        Ok(Self::new(pool).with_lock_timeout(Duration::from_millis(config.lock_timeout_ms)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Relation store schema ensured");
        Ok(())
    }
}

fn object_column(row: &PgRow, column: &str) -> Result<Object> {
    let raw: String = row.try_get(column)?;
    Object::try_from(raw)
}

fn edge_from_row(row: &PgRow) -> Result<Edge> {
    Ok(Edge {
        id: row.try_get("id")?,
        from: object_column(row, "from_object")?,
        to: object_column(row, "to_object")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn path_from_row(row: &PgRow) -> Result<TraversalPath> {
    Ok(TraversalPath {
        endpoint: object_column(row, "endpoint")?,
        via: row.try_get("via")?,
        far_name: row.try_get("far_name")?,
        through_members: row.try_get("through_members")?,
    })
}

fn closure_from_row(row: &PgRow) -> Result<ClosureRecord> {
    Ok(ClosureRecord {
        id: row.try_get("id")?,
        from: object_column(row, "from_object")?,
        to: object_column(row, "to_object")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role> {
    let id: String = row.try_get("id")?;
    let verbs: Vec<String> = row.try_get("verbs")?;
    Ok(Role::new(&id, verbs))
}

#[async_trait]
impl RelationStore for PostgresRelationStore {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>> {
        let mut tx = self.pool.begin().await?;

        // SET does not accept bind parameters; the value is an integer.
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&lock_timeout).execute(&mut *tx).await?;
        sqlx::query("LOCK TABLE rebac_relations IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn list_edges(
        &self,
        filter: &RelationFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Edge>> {
        debug!("Listing relations: filter={:?}, after={:?}", filter, after);

        let mut query = String::from(
            "SELECT id, from_object, to_object, name, created_at FROM rebac_relations WHERE TRUE",
        );
        let mut param_num = 1;

        if filter.from.is_some() {
            query.push_str(&format!(" AND from_object = ${}", param_num));
            param_num += 1;
        }
        if filter.to.is_some() {
            query.push_str(&format!(" AND to_object = ${}", param_num));
            param_num += 1;
        }
        if filter.name.is_some() {
            query.push_str(&format!(" AND name = ${}", param_num));
            param_num += 1;
        }
        if after.is_some() {
            query.push_str(&format!(" AND id > ${}", param_num));
            param_num += 1;
        }
        query.push_str(&format!(" ORDER BY id LIMIT ${}", param_num));

        let mut sqlx_query = sqlx::query(&query);
        if let Some(ref from) = filter.from {
            sqlx_query = sqlx_query.bind(from.as_str());
        }
        if let Some(ref to) = filter.to {
            sqlx_query = sqlx_query.bind(to.as_str());
        }
        if let Some(ref name) = filter.name {
            sqlx_query = sqlx_query.bind(name.as_str());
        }
        if let Some(after) = after {
            sqlx_query = sqlx_query.bind(after);
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx_query = sqlx_query.bind(limit);

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn list_ancestors(&self, object: &Object) -> Result<Vec<TraversalPath>> {
        let rows = sqlx::query(ANCESTORS_QUERY)
            .bind(object.as_str())
            .bind(MEMBERSHIP_LABEL)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(path_from_row).collect()
    }

    async fn list_descendants(&self, object: &Object) -> Result<Vec<TraversalPath>> {
        let rows = sqlx::query(DESCENDANTS_QUERY)
            .bind(object.as_str())
            .bind(MEMBERSHIP_LABEL)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(path_from_row).collect()
    }

    async fn closure_exists(&self, from: &Object, to: &Object, name: Option<&str>) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM rebac_closure
                WHERE from_object = $1
                  AND to_object = $2
                  AND ($3::TEXT IS NULL OR name = $3)
            )
            "#,
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn list_closure(&self, from: &Object, to: Option<&Object>) -> Result<Vec<ClosureRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_object, to_object, name, path FROM rebac_closure
            WHERE from_object = $1
              AND ($2::TEXT IS NULL OR to_object = $2)
            ORDER BY to_object, id
            "#,
        )
        .bind(from.as_str())
        .bind(to.map(Object::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(closure_from_row).collect()
    }

    async fn direct_targets(&self, from: &Object, name: &str) -> Result<Vec<Object>> {
        let targets = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT to_object FROM rebac_relations
            WHERE from_object = $1 AND name = $2
            ORDER BY to_object
            "#,
        )
        .bind(from.as_str())
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        targets.into_iter().map(Object::try_from).collect()
    }

    async fn upsert_role(&self, role: &Role) -> Result<Role> {
        let verbs: Vec<String> = role.verbs.iter().cloned().collect();
        let row = sqlx::query(
            r#"
            INSERT INTO rebac_roles (id, verbs, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET verbs = EXCLUDED.verbs, updated_at = NOW()
            RETURNING id, verbs
            "#,
        )
        .bind(&role.id)
        .bind(&verbs)
        .fetch_one(&self.pool)
        .await?;

        role_from_row(&row)
    }

    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT id, verbs FROM rebac_roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(role_from_row).transpose()
    }

    async fn delete_role(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rebac_roles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GraphTransaction for PostgresTransaction {
    async fn find_edge(&mut self, key: &EdgeKey) -> Result<Option<Edge>> {
        let row = sqlx::query(
            r#"
            SELECT id, from_object, to_object, name, created_at FROM rebac_relations
            WHERE from_object = $1
              AND to_object = $2
              AND name IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.from.as_str())
        .bind(key.to.as_str())
        .bind(key.name.as_deref())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(edge_from_row).transpose()
    }

    async fn insert_edge(&mut self, edge: &Edge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rebac_relations (id, from_object, to_object, name, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(edge.id)
        .bind(edge.from.as_str())
        .bind(edge.to.as_str())
        .bind(edge.name.as_deref())
        .bind(edge.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn delete_edge(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rebac_relations WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_ancestors(&mut self, object: &Object) -> Result<Vec<TraversalPath>> {
        let rows = sqlx::query(ANCESTORS_QUERY)
            .bind(object.as_str())
            .bind(MEMBERSHIP_LABEL)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(path_from_row).collect()
    }

    async fn list_descendants(&mut self, object: &Object) -> Result<Vec<TraversalPath>> {
        let rows = sqlx::query(DESCENDANTS_QUERY)
            .bind(object.as_str())
            .bind(MEMBERSHIP_LABEL)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(path_from_row).collect()
    }

    async fn upsert_closure(&mut self, records: &[ClosureRecord]) -> Result<u64> {
        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO rebac_closure (id, from_object, to_object, name, path)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(record.from.as_str())
            .bind(record.to.as_str())
            .bind(record.name.as_deref())
            .bind(&record.path)
            .execute(&mut *self.tx)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn delete_closure(&mut self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM rebac_closure WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| RebacError::Store(format!("Failed to commit transaction: {}", e)))
    }
}
