//! Postgres-backed progress counters and artifact store.
//!
//! ## Error Mapping
//!
//! SQLx errors are flattened to strings carrying the failing operation; every
//! storage failure is transient from the engine's point of view.
//!
//! ## Tenant Isolation
//!
//! Every key starts with `tenant_id`; no query reads across tenants.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use backfill_core::{ProgressCounter, ProgressSnapshot, RunId, TenantId};
use backfill_orchestrator::{Artifact, ArtifactStore, ProgressError, ProgressStore, StorageError};

/// Rows per upsert statement (4 bind parameters each).
const UPSERT_CHUNK: usize = 1000;

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS backfill_progress (
        tenant_id  UUID        NOT NULL,
        run_id     UUID        NOT NULL,
        counter    TEXT        NOT NULL,
        value      BIGINT      NOT NULL DEFAULT 0 CHECK (value >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (tenant_id, run_id, counter)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backfill_artifacts (
        tenant_id   UUID        NOT NULL,
        entity_id   TEXT        NOT NULL,
        source_type TEXT        NOT NULL,
        content     JSONB       NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (tenant_id, entity_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS backfill_artifacts_source_type
        ON backfill_artifacts (tenant_id, source_type)
    "#,
];

/// Create tables and indexes if missing. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error in {operation} ({code}): {}", db_err.message()),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

#[derive(Debug, Clone)]
pub struct PostgresProgressStore {
    pool: Arc<PgPool>,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    #[instrument(
        skip_all,
        fields(tenant_id = %tenant_id, run_id = %run_id, counter = counter.as_str(), by = by),
        err
    )]
    async fn increment(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        counter: ProgressCounter,
        by: u64,
    ) -> Result<u64, ProgressError> {
        let by = i64::try_from(by)
            .map_err(|_| ProgressError::Store(format!("increment too large: {by}")))?;

        let row = sqlx::query(
            r#"
            INSERT INTO backfill_progress (tenant_id, run_id, counter, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, run_id, counter)
            DO UPDATE SET value = backfill_progress.value + EXCLUDED.value, updated_at = now()
            RETURNING value
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*run_id.as_uuid())
        .bind(counter.as_str())
        .bind(by)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| ProgressError::Store(map_sqlx_error("increment", e)))?;

        let value: i64 = row
            .try_get("value")
            .map_err(|e| ProgressError::Store(map_sqlx_error("increment", e)))?;
        Ok(value.max(0) as u64)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, run_id = %run_id), err)]
    async fn snapshot(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<ProgressSnapshot, ProgressError> {
        let rows = sqlx::query(
            r#"
            SELECT counter, value
            FROM backfill_progress
            WHERE tenant_id = $1 AND run_id = $2
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*run_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| ProgressError::Store(map_sqlx_error("snapshot", e)))?;

        let mut snapshot = ProgressSnapshot::default();
        for row in rows {
            let name: String = row
                .try_get("counter")
                .map_err(|e| ProgressError::Store(map_sqlx_error("snapshot", e)))?;
            let value: i64 = row
                .try_get("value")
                .map_err(|e| ProgressError::Store(map_sqlx_error("snapshot", e)))?;
            if let Some(counter) = ProgressCounter::parse(&name) {
                snapshot.set(counter, value.max(0) as u64);
            }
        }
        Ok(snapshot)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresArtifactStore {
    pool: Arc<PgPool>,
}

impl PostgresArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

/// Last write wins per (tenant, entity); one statement cannot upsert a key twice.
fn dedupe_by_identity(artifacts: &[Artifact]) -> Vec<&Artifact> {
    let mut position: HashMap<(TenantId, &str), usize> = HashMap::new();
    let mut out: Vec<&Artifact> = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        match position.get(&(artifact.tenant_id, artifact.entity_id.as_str())) {
            Some(&i) => out[i] = artifact,
            None => {
                position.insert((artifact.tenant_id, artifact.entity_id.as_str()), out.len());
                out.push(artifact);
            }
        }
    }
    out
}

#[async_trait]
impl ArtifactStore for PostgresArtifactStore {
    #[instrument(skip_all, fields(artifacts = artifacts.len()), err)]
    async fn store_artifact_batch(&self, artifacts: &[Artifact]) -> Result<(), StorageError> {
        let rows = dedupe_by_identity(artifacts);
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Database(map_sqlx_error("begin_transaction", e)))?;

        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO backfill_artifacts (tenant_id, entity_id, source_type, content) ",
            );
            query.push_values(chunk, |mut b, artifact| {
                b.push_bind(*artifact.tenant_id.as_uuid())
                    .push_bind(artifact.entity_id.as_str())
                    .push_bind(artifact.source_type.as_str())
                    .push_bind(Json(&artifact.content));
            });
            query.push(
                " ON CONFLICT (tenant_id, entity_id) DO UPDATE SET \
                 source_type = EXCLUDED.source_type, \
                 content = EXCLUDED.content, \
                 updated_at = now()",
            );
            query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Database(map_sqlx_error("store_artifact_batch", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Database(map_sqlx_error("commit", e)))?;
        debug!(stored = rows.len(), "artifact batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_orchestrator::SourceType;
    use serde_json::json;

    fn artifact(tenant: TenantId, id: &str, v: i32) -> Artifact {
        Artifact {
            entity_id: id.to_string(),
            source_type: SourceType::GithubFile,
            tenant_id: tenant,
            content: json!({ "v": v }),
        }
    }

    #[test]
    fn duplicate_identities_keep_the_last_write_in_first_position() {
        let (t1, t2) = (TenantId::new(), TenantId::new());
        let batch = vec![
            artifact(t1, "a", 1),
            artifact(t1, "b", 1),
            artifact(t1, "a", 2),
            artifact(t2, "a", 3),
        ];
        let rows = dedupe_by_identity(&batch);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].content, json!({ "v": 2 }));
        assert_eq!(rows[1].entity_id, "b");
        assert_eq!(rows[2].tenant_id, t2);
    }

    #[test]
    fn schema_statements_are_idempotent() {
        assert!(SCHEMA.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
