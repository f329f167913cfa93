//! Index trigger publishing to a Redis stream consumed by the indexing service.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use backfill_core::{RunId, TenantId};
use backfill_orchestrator::{IndexError, IndexRequest, IndexTrigger, SourceType};

#[derive(Clone)]
pub struct RedisIndexTrigger {
    conn: MultiplexedConnection,
    stream: String,
}

impl RedisIndexTrigger {
    pub async fn connect(
        redis_url: impl AsRef<str>,
        stream: impl Into<String>,
    ) -> Result<Self, IndexError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| IndexError(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| IndexError(e.to_string()))?;
        Ok(Self {
            conn,
            stream: stream.into(),
        })
    }
}

#[async_trait]
impl IndexTrigger for RedisIndexTrigger {
    #[instrument(
        skip_all,
        fields(stream = %self.stream, tenant_id = %tenant_id, source_type = %source_type, entities = entity_ids.len()),
        err
    )]
    async fn trigger_indexing(
        &self,
        entity_ids: &[String],
        source_type: SourceType,
        tenant_id: TenantId,
        run_id: Option<RunId>,
        suppress_notification: bool,
    ) -> Result<(), IndexError> {
        let request = IndexRequest {
            entity_ids: entity_ids.to_vec(),
            source_type,
            tenant_id,
            run_id,
            suppress_notification,
        };
        let payload = serde_json::to_string(&request).map_err(|e| IndexError(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("tenant_id")
            .arg(tenant_id.to_string())
            .arg("source_type")
            .arg(source_type.as_str())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| IndexError(format!("XADD failed: {e}")))?;
        Ok(())
    }
}
