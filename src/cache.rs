//! Content-addressed plan cache.
//!
//! Thin policy layer over the plan store: computes cache keys, enforces TTL
//! on read, counts hits, and applies the error policy (reads degrade to a
//! miss, writes log and continue, `refresh` surfaces failures).

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::errors::EngineResult;
use crate::storage::{CacheEntry, CacheStats, PlanStore};
use crate::types::{cache_key, Plan};

pub const DEFAULT_TTL_DAYS: i64 = 7;

#[derive(Clone)]
pub struct PlanCache {
    store: Arc<dyn PlanStore>,
    ttl: Duration,
}

impl PlanCache {
    pub fn new(store: Arc<dyn PlanStore>, ttl_days: i64) -> Self {
        Self {
            store,
            ttl: Duration::days(if ttl_days > 0 { ttl_days } else { DEFAULT_TTL_DAYS }),
        }
    }

    /// Cache lookup by task signature. Backend failures and expired entries
    /// both degrade to a miss; a hit bumps the counter.
    pub async fn get(&self, task_signature: &str) -> Option<Plan> {
        let key = cache_key(task_signature);
        let entry = match self.store.cache_entry(&key).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(%err, "plan cache read failed; treating as miss");
                return None;
            }
        };
        if entry.expires_at <= Utc::now() {
            debug!(task_signature, "cache entry expired");
            return None;
        }
        let plan = match self.store.plan_by_id(&entry.plan_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                // Entry outlived its plan row; drop it.
                let _ = self.store.delete_cache_entry(&key).await;
                return None;
            }
            Err(err) => {
                warn!(%err, "plan lookup failed; treating as miss");
                return None;
            }
        };
        if let Err(err) = self.store.record_cache_hit(&key).await {
            warn!(%err, "failed to record cache hit");
        }
        Some(plan)
    }

    pub async fn get_by_id(&self, plan_id: &str) -> Option<Plan> {
        match self.store.plan_by_id(plan_id).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, plan_id, "plan lookup by id failed");
                None
            }
        }
    }

    /// Upsert the plan and its cache entry. A failed write costs a future
    /// cache miss, nothing more, so errors are logged and swallowed.
    pub async fn put(&self, plan: &Plan, ttl_days: Option<i64>) {
        if let Err(err) = self.write(plan, ttl_days).await {
            warn!(%err, task_signature = %plan.task_signature, "plan cache write failed");
        }
    }

    /// Same write path as `put`, but failures surface to the caller. Used
    /// after successful regeneration where a stale cache must not survive.
    pub async fn refresh(&self, plan: &Plan) -> EngineResult<()> {
        self.write(plan, None).await
    }

    async fn write(&self, plan: &Plan, ttl_days: Option<i64>) -> EngineResult<()> {
        let version = self.store.upsert_plan(plan).await?;
        let ttl = ttl_days.map(Duration::days).unwrap_or(self.ttl);
        let now = Utc::now();
        self.store
            .put_cache_entry(&CacheEntry {
                cache_key: cache_key(&plan.task_signature),
                plan_id: plan.id.clone(),
                hit_count: 0,
                last_used_at: now,
                expires_at: now + ttl,
            })
            .await?;
        debug!(task_signature = %plan.task_signature, version, "plan cached");
        Ok(())
    }

    /// Delete the cache entry but keep the plan row for audit.
    pub async fn invalidate(&self, task_signature: &str) -> EngineResult<()> {
        self.store
            .delete_cache_entry(&cache_key(task_signature))
            .await
    }

    pub async fn cleanup_expired(&self) -> EngineResult<u64> {
        self.store.cleanup_expired(Utc::now()).await
    }

    pub async fn stats(&self) -> EngineResult<CacheStats> {
        self.store.cache_stats(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::types::{
        task_signature, ErrorHandling, PlanMetadata, PlanValidation, Step, StepAction,
    };

    fn sample_plan(instruction: &str) -> Plan {
        let signature = task_signature(instruction, "https://example.com/shop");
        Plan {
            id: Plan::new_id(),
            task_signature: signature,
            instruction: instruction.into(),
            url: "https://example.com/shop".into(),
            steps: vec![Step::new(
                "step-1",
                "open",
                StepAction::Navigate { url: None },
            )],
            expected_results: Vec::new(),
            error_handling: ErrorHandling::default(),
            validation: PlanValidation::default(),
            metadata: PlanMetadata {
                created_at: Utc::now(),
                model_id: "test-model".into(),
                confidence: 0.9,
                estimated_duration_ms: 3_000,
            },
        }
    }

    fn cache() -> PlanCache {
        PlanCache::new(Arc::new(MemoryStore::new()), DEFAULT_TTL_DAYS)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_within_ttl() {
        let cache = cache();
        let plan = sample_plan("check the price");
        cache.put(&plan, None).await;
        let fetched = cache.get(&plan.task_signature).await.expect("hit");
        assert_eq!(fetched, plan);
    }

    #[tokio::test]
    async fn hits_strictly_increase_the_counter() {
        let cache = cache();
        let plan = sample_plan("check the price");
        cache.put(&plan, None).await;
        for _ in 0..3 {
            assert!(cache.get(&plan.task_signature).await.is_some());
        }
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.top[0].hit_count, 3);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = cache();
        let plan = sample_plan("check the price");
        cache.put(&plan, Some(-1)).await;
        assert!(cache.get(&plan.task_signature).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_keeps_the_plan_row() {
        let cache = cache();
        let plan = sample_plan("check the price");
        cache.put(&plan, None).await;
        cache.invalidate(&plan.task_signature).await.unwrap();
        assert!(cache.get(&plan.task_signature).await.is_none());
        assert!(cache.get_by_id(&plan.id).await.is_some());
    }

    #[tokio::test]
    async fn equivalent_inputs_share_one_entry() {
        let cache = cache();
        let plan = sample_plan("Check  The Price ");
        cache.put(&plan, None).await;
        let signature = task_signature("check the price", "https://EXAMPLE.com/shop/");
        assert!(cache.get(&signature).await.is_some());
    }
}
