//! Persistence behind trait seams.
//!
//! All mutable cross-invocation state (plans, cache entries, execution
//! results, monitoring samples) lives behind these traits. A durable sea-orm
//! backend activates when `DATABASE_URL` is configured; the in-memory
//! fallback serves everything else. Callers never branch on which is active.

pub mod db;
pub mod entities;
pub mod memory;
pub mod migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::EngineResult;
use crate::types::{ChangeRecord, ExecutionResult, MonitoringSample, Plan};

/// One cache row; at most one active entry exists per task signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub cache_key: String,
    pub plan_id: String,
    pub hit_count: i64,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total: u64,
    pub expired: u64,
    pub hit_rate: f64,
    pub top: Vec<CacheTopEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheTopEntry {
    pub plan_id: String,
    pub hit_count: i64,
}

/// Plan rows plus their cache entries.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Insert or replace the plan for its task signature; replacing
    /// increments the stored version. Returns the resulting version.
    async fn upsert_plan(&self, plan: &Plan) -> EngineResult<i32>;

    async fn plan_by_signature(&self, task_signature: &str) -> EngineResult<Option<Plan>>;

    async fn plan_by_id(&self, plan_id: &str) -> EngineResult<Option<Plan>>;

    /// Soft-delete: the row is kept for audit with `is_active = false`.
    async fn deactivate_plan(&self, task_signature: &str) -> EngineResult<()>;

    async fn put_cache_entry(&self, entry: &CacheEntry) -> EngineResult<()>;

    async fn cache_entry(&self, cache_key: &str) -> EngineResult<Option<CacheEntry>>;

    /// Bump `hit_count` and refresh `last_used_at`. Advisory; increments may
    /// race under concurrent invocations.
    async fn record_cache_hit(&self, cache_key: &str) -> EngineResult<()>;

    async fn delete_cache_entry(&self, cache_key: &str) -> EngineResult<()>;

    /// Remove entries whose `expires_at` is in the past; returns the count.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> EngineResult<u64>;

    async fn cache_stats(&self, now: DateTime<Utc>) -> EngineResult<CacheStats>;
}

/// Append-only execution results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist one result row; returns the generated execution id.
    async fn append_result(&self, result: &ExecutionResult) -> EngineResult<String>;
}

/// Append-only monitoring samples and change records.
#[async_trait]
pub trait MonitoringStore: Send + Sync {
    async fn append_sample(&self, sample: &MonitoringSample) -> EngineResult<()>;

    /// Most recent sample per task id; the canonical baseline for the next diff.
    async fn latest_sample(&self, task_id: &str) -> EngineResult<Option<MonitoringSample>>;

    async fn append_change(&self, record: &ChangeRecord) -> EngineResult<()>;
}

/// Bundles the three stores and remembers which backend family is active.
#[derive(Clone)]
pub struct StorageManager {
    plans: Arc<dyn PlanStore>,
    results: Arc<dyn ResultStore>,
    monitoring: Arc<dyn MonitoringStore>,
    durable: bool,
}

impl StorageManager {
    pub fn in_memory() -> Self {
        let backend = Arc::new(memory::MemoryStore::new());
        Self {
            plans: backend.clone(),
            results: backend.clone(),
            monitoring: backend,
            durable: false,
        }
    }

    /// Connect to the durable backend and run migrations.
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let backend = Arc::new(db::DbStore::connect(database_url).await?);
        Ok(Self {
            plans: backend.clone(),
            results: backend.clone(),
            monitoring: backend,
            durable: true,
        })
    }

    /// `DATABASE_URL` selects the durable backend; its absence means memory.
    pub async fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        match &config.database_url {
            Some(url) => Self::connect(url).await,
            None => Ok(Self::in_memory()),
        }
    }

    pub fn plans(&self) -> Arc<dyn PlanStore> {
        self.plans.clone()
    }

    pub fn results(&self) -> Arc<dyn ResultStore> {
        self.results.clone()
    }

    pub fn monitoring(&self) -> Arc<dyn MonitoringStore> {
        self.monitoring.clone()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
