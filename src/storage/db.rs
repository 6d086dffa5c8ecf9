//! Durable storage backend over sea-orm.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait,
    Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use sea_orm_migration::MigratorTrait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::types::{ChangeRecord, ExecutionResult, MonitoringSample, Plan};

use super::entities::{
    change_detections, execution_plans, execution_results, monitoring_data, plan_cache,
};
use super::migrations::Migrator;
use super::{CacheEntry, CacheStats, CacheTopEntry, MonitoringStore, PlanStore, ResultStore};

pub struct DbStore {
    conn: DatabaseConnection,
}

impl DbStore {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        info!(url = %redact_url(database_url), "connecting to database");
        let mut options = ConnectOptions::new(database_url);
        options
            .max_connections(10)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .sqlx_logging(false);
        let conn = Database::connect(options)
            .await
            .map_err(|err| EngineError::cache(format!("database connect failed: {err}")))?;
        Migrator::up(&conn, None)
            .await
            .map_err(|err| EngineError::cache(format!("migration failed: {err}")))?;
        debug!("database migrations applied");
        Ok(Self { conn })
    }
}

fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

fn cache_err(err: sea_orm::DbErr) -> EngineError {
    EngineError::cache(err.to_string())
}

#[async_trait]
impl PlanStore for DbStore {
    async fn upsert_plan(&self, plan: &Plan) -> EngineResult<i32> {
        let plan_json = serde_json::to_value(plan)?;
        let existing = execution_plans::Entity::find()
            .filter(execution_plans::Column::TaskSignature.eq(plan.task_signature.clone()))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;

        match existing {
            Some(row) => {
                let version = row.version + 1;
                let mut active: execution_plans::ActiveModel = row.into();
                active.id = Set(plan.id.clone());
                active.instruction = Set(plan.instruction.clone());
                active.url = Set(plan.url.clone());
                active.plan = Set(plan_json);
                active.updated_at = Set(Utc::now());
                active.version = Set(version);
                active.is_active = Set(true);
                active.update(&self.conn).await.map_err(cache_err)?;
                Ok(version)
            }
            None => {
                let now = Utc::now();
                execution_plans::ActiveModel {
                    id: Set(plan.id.clone()),
                    task_signature: Set(plan.task_signature.clone()),
                    instruction: Set(plan.instruction.clone()),
                    url: Set(plan.url.clone()),
                    plan: Set(plan_json),
                    created_at: Set(now),
                    updated_at: Set(now),
                    version: Set(1),
                    is_active: Set(true),
                }
                .insert(&self.conn)
                .await
                .map_err(cache_err)?;
                Ok(1)
            }
        }
    }

    async fn plan_by_signature(&self, task_signature: &str) -> EngineResult<Option<Plan>> {
        let row = execution_plans::Entity::find()
            .filter(execution_plans::Column::TaskSignature.eq(task_signature))
            .filter(execution_plans::Column::IsActive.eq(true))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        row.map(|row| serde_json::from_value(row.plan).map_err(EngineError::from))
            .transpose()
    }

    async fn plan_by_id(&self, plan_id: &str) -> EngineResult<Option<Plan>> {
        let row = execution_plans::Entity::find_by_id(plan_id.to_string())
            .filter(execution_plans::Column::IsActive.eq(true))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        row.map(|row| serde_json::from_value(row.plan).map_err(EngineError::from))
            .transpose()
    }

    async fn deactivate_plan(&self, task_signature: &str) -> EngineResult<()> {
        let row = execution_plans::Entity::find()
            .filter(execution_plans::Column::TaskSignature.eq(task_signature))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        if let Some(row) = row {
            let mut active: execution_plans::ActiveModel = row.into();
            active.is_active = Set(false);
            active.updated_at = Set(Utc::now());
            active.update(&self.conn).await.map_err(cache_err)?;
        }
        Ok(())
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> EngineResult<()> {
        let existing = plan_cache::Entity::find()
            .filter(plan_cache::Column::CacheKey.eq(entry.cache_key.clone()))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        match existing {
            Some(row) => {
                let mut active: plan_cache::ActiveModel = row.into();
                active.plan_id = Set(entry.plan_id.clone());
                active.hit_count = Set(entry.hit_count);
                active.last_used_at = Set(entry.last_used_at);
                active.expires_at = Set(entry.expires_at);
                active.update(&self.conn).await.map_err(cache_err)?;
            }
            None => {
                plan_cache::ActiveModel {
                    cache_key: Set(entry.cache_key.clone()),
                    plan_id: Set(entry.plan_id.clone()),
                    hit_count: Set(entry.hit_count),
                    last_used_at: Set(entry.last_used_at),
                    expires_at: Set(entry.expires_at),
                    created_at: Set(Utc::now()),
                    ..Default::default()
                }
                .insert(&self.conn)
                .await
                .map_err(cache_err)?;
            }
        }
        Ok(())
    }

    async fn cache_entry(&self, cache_key: &str) -> EngineResult<Option<CacheEntry>> {
        let row = plan_cache::Entity::find()
            .filter(plan_cache::Column::CacheKey.eq(cache_key))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        Ok(row.map(|row| CacheEntry {
            cache_key: row.cache_key,
            plan_id: row.plan_id,
            hit_count: row.hit_count,
            last_used_at: row.last_used_at,
            expires_at: row.expires_at,
        }))
    }

    async fn record_cache_hit(&self, cache_key: &str) -> EngineResult<()> {
        // Read-modify-write; increments are advisory and may race.
        let row = plan_cache::Entity::find()
            .filter(plan_cache::Column::CacheKey.eq(cache_key))
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        if let Some(row) = row {
            let hits = row.hit_count + 1;
            let mut active: plan_cache::ActiveModel = row.into();
            active.hit_count = Set(hits);
            active.last_used_at = Set(Utc::now());
            active.update(&self.conn).await.map_err(cache_err)?;
        }
        Ok(())
    }

    async fn delete_cache_entry(&self, cache_key: &str) -> EngineResult<()> {
        plan_cache::Entity::delete_many()
            .filter(plan_cache::Column::CacheKey.eq(cache_key))
            .exec(&self.conn)
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let outcome = plan_cache::Entity::delete_many()
            .filter(plan_cache::Column::ExpiresAt.lte(now))
            .exec(&self.conn)
            .await
            .map_err(cache_err)?;
        Ok(outcome.rows_affected)
    }

    async fn cache_stats(&self, now: DateTime<Utc>) -> EngineResult<CacheStats> {
        let total = plan_cache::Entity::find()
            .count(&self.conn)
            .await
            .map_err(cache_err)?;
        let expired = plan_cache::Entity::find()
            .filter(plan_cache::Column::ExpiresAt.lte(now))
            .count(&self.conn)
            .await
            .map_err(cache_err)?;
        let top_rows = plan_cache::Entity::find()
            .order_by(plan_cache::Column::HitCount, Order::Desc)
            .limit(5)
            .all(&self.conn)
            .await
            .map_err(cache_err)?;
        let hits: i64 = top_rows.iter().map(|row| row.hit_count).sum();
        Ok(CacheStats {
            total,
            expired,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            top: top_rows
                .into_iter()
                .map(|row| CacheTopEntry {
                    plan_id: row.plan_id,
                    hit_count: row.hit_count,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl ResultStore for DbStore {
    async fn append_result(&self, result: &ExecutionResult) -> EngineResult<String> {
        let execution_id = Uuid::new_v4().to_string();
        execution_results::ActiveModel {
            id: Set(execution_id.clone()),
            task_id: Set(result.task_id.clone()),
            plan_id: Set(Some(result.plan_id.clone())),
            status: Set(result.status.as_str().to_string()),
            result: Set(result
                .extracted_data
                .as_ref()
                .map(|data| serde_json::Value::Object(data.clone()))),
            logs: Set(Some(serde_json::to_value(&result.logs)?)),
            error_message: Set(result.error.as_ref().map(|err| err.message.clone())),
            execution_time_ms: Set(result.metrics.execution_time_ms as i64),
            created_at: Set(result.created_at),
        }
        .insert(&self.conn)
        .await
        .map_err(cache_err)?;
        Ok(execution_id)
    }
}

#[async_trait]
impl MonitoringStore for DbStore {
    async fn append_sample(&self, sample: &MonitoringSample) -> EngineResult<()> {
        monitoring_data::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            task_id: Set(sample.task_id.clone()),
            url: Set(sample.url.clone()),
            extracted_data: Set(serde_json::Value::Object(sample.extracted_data.clone())),
            execution_id: Set(sample.execution_id.clone()),
            timestamp: Set(sample.captured_at),
        }
        .insert(&self.conn)
        .await
        .map_err(cache_err)?;
        Ok(())
    }

    async fn latest_sample(&self, task_id: &str) -> EngineResult<Option<MonitoringSample>> {
        let row = monitoring_data::Entity::find()
            .filter(monitoring_data::Column::TaskId.eq(task_id))
            .order_by(monitoring_data::Column::Timestamp, Order::Desc)
            .one(&self.conn)
            .await
            .map_err(cache_err)?;
        Ok(row.map(|row| MonitoringSample {
            task_id: row.task_id,
            url: row.url,
            extracted_data: row
                .extracted_data
                .as_object()
                .cloned()
                .unwrap_or_default(),
            execution_id: row.execution_id,
            captured_at: row.timestamp,
        }))
    }

    async fn append_change(&self, record: &ChangeRecord) -> EngineResult<()> {
        change_detections::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            task_id: Set(record.task_id.clone()),
            execution_id: Set(record.execution_id.clone()),
            changed_fields: Set(serde_json::to_value(&record.changed_fields)?),
            is_restock: Set(record.is_restock),
            change_details: Set(record.change_details.clone()),
            detected_at: Set(record.detected_at),
        }
        .insert(&self.conn)
        .await
        .map_err(cache_err)?;
        Ok(())
    }
}
