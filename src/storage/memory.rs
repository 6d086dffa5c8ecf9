//! In-memory storage backend.
//!
//! Serves single-process runs and tests; same interface as the durable
//! backend, minus background TTL enforcement (expiry is checked on read).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::EngineResult;
use crate::types::{ChangeRecord, ExecutionResult, MonitoringSample, Plan};

use super::{CacheEntry, CacheStats, CacheTopEntry, MonitoringStore, PlanStore, ResultStore};

#[derive(Clone)]
struct PlanRow {
    plan: Plan,
    version: i32,
    is_active: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    plans: DashMap<String, PlanRow>,
    signature_by_plan_id: DashMap<String, String>,
    cache_entries: DashMap<String, CacheEntry>,
    results: RwLock<Vec<(String, ExecutionResult)>>,
    samples: RwLock<Vec<MonitoringSample>>,
    changes: RwLock<Vec<ChangeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn result_count(&self) -> usize {
        self.results.read().len()
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn upsert_plan(&self, plan: &Plan) -> EngineResult<i32> {
        let signature = plan.task_signature.clone();
        let mut version = 1;
        self.plans
            .entry(signature.clone())
            .and_modify(|row| {
                version = row.version + 1;
                self.signature_by_plan_id.remove(&row.plan.id);
                *row = PlanRow {
                    plan: plan.clone(),
                    version,
                    is_active: true,
                };
            })
            .or_insert_with(|| PlanRow {
                plan: plan.clone(),
                version: 1,
                is_active: true,
            });
        self.signature_by_plan_id.insert(plan.id.clone(), signature);
        Ok(version)
    }

    async fn plan_by_signature(&self, task_signature: &str) -> EngineResult<Option<Plan>> {
        Ok(self
            .plans
            .get(task_signature)
            .filter(|row| row.is_active)
            .map(|row| row.plan.clone()))
    }

    async fn plan_by_id(&self, plan_id: &str) -> EngineResult<Option<Plan>> {
        let Some(signature) = self.signature_by_plan_id.get(plan_id) else {
            return Ok(None);
        };
        self.plan_by_signature(signature.value()).await
    }

    async fn deactivate_plan(&self, task_signature: &str) -> EngineResult<()> {
        if let Some(mut row) = self.plans.get_mut(task_signature) {
            row.is_active = false;
        }
        Ok(())
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> EngineResult<()> {
        self.cache_entries
            .insert(entry.cache_key.clone(), entry.clone());
        Ok(())
    }

    async fn cache_entry(&self, cache_key: &str) -> EngineResult<Option<CacheEntry>> {
        Ok(self.cache_entries.get(cache_key).map(|e| e.clone()))
    }

    async fn record_cache_hit(&self, cache_key: &str) -> EngineResult<()> {
        if let Some(mut entry) = self.cache_entries.get_mut(cache_key) {
            entry.hit_count += 1;
            entry.last_used_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_cache_entry(&self, cache_key: &str) -> EngineResult<()> {
        self.cache_entries.remove(cache_key);
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let expired: Vec<String> = self
            .cache_entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.cache_key.clone())
            .collect();
        for key in &expired {
            self.cache_entries.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn cache_stats(&self, now: DateTime<Utc>) -> EngineResult<CacheStats> {
        let total = self.cache_entries.len() as u64;
        let expired = self
            .cache_entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .count() as u64;
        let hits: i64 = self
            .cache_entries
            .iter()
            .map(|entry| entry.hit_count)
            .sum();
        let mut top: Vec<CacheTopEntry> = self
            .cache_entries
            .iter()
            .map(|entry| CacheTopEntry {
                plan_id: entry.plan_id.clone(),
                hit_count: entry.hit_count,
            })
            .collect();
        top.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        top.truncate(5);
        Ok(CacheStats {
            total,
            expired,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            top,
        })
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append_result(&self, result: &ExecutionResult) -> EngineResult<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.results
            .write()
            .push((execution_id.clone(), result.clone()));
        Ok(execution_id)
    }
}

#[async_trait]
impl MonitoringStore for MemoryStore {
    async fn append_sample(&self, sample: &MonitoringSample) -> EngineResult<()> {
        self.samples.write().push(sample.clone());
        Ok(())
    }

    async fn latest_sample(&self, task_id: &str) -> EngineResult<Option<MonitoringSample>> {
        let samples = self.samples.read();
        Ok(samples
            .iter()
            .filter(|sample| sample.task_id == task_id)
            .max_by_key(|sample| sample.captured_at)
            .cloned())
    }

    async fn append_change(&self, record: &ChangeRecord) -> EngineResult<()> {
        self.changes.write().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{task_signature, ErrorHandling, PlanMetadata, PlanValidation, Step, StepAction};
    use chrono::Duration;
    use serde_json::Map;

    fn sample_plan(instruction: &str) -> Plan {
        Plan {
            id: Plan::new_id(),
            task_signature: task_signature(instruction, "https://example.com"),
            instruction: instruction.into(),
            url: "https://example.com".into(),
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
                model_id: "test".into(),
                confidence: 0.9,
                estimated_duration_ms: 3_000,
            },
        }
    }

    #[tokio::test]
    async fn upsert_increments_version_and_reindexes_ids() {
        let store = MemoryStore::new();
        let first = sample_plan("get title");
        assert_eq!(store.upsert_plan(&first).await.unwrap(), 1);

        let mut second = sample_plan("get title");
        second.id = Plan::new_id();
        assert_eq!(store.upsert_plan(&second).await.unwrap(), 2);

        assert!(store.plan_by_id(&first.id).await.unwrap().is_none());
        assert!(store.plan_by_id(&second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deactivated_plans_disappear_from_lookups() {
        let store = MemoryStore::new();
        let plan = sample_plan("get title");
        store.upsert_plan(&plan).await.unwrap();
        store.deactivate_plan(&plan.task_signature).await.unwrap();
        assert!(store
            .plan_by_signature(&plan.task_signature)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (key, offset) in [("a", -1i64), ("b", 1)] {
            store
                .put_cache_entry(&CacheEntry {
                    cache_key: key.into(),
                    plan_id: "p".into(),
                    hit_count: 0,
                    last_used_at: now,
                    expires_at: now + Duration::hours(offset),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.cleanup_expired(now).await.unwrap(), 1);
        assert!(store.cache_entry("a").await.unwrap().is_none());
        assert!(store.cache_entry("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn latest_sample_is_most_recent_per_task() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for (minutes, price) in [(0i64, 100), (5, 200)] {
            let mut data = Map::new();
            data.insert("price".into(), price.into());
            store
                .append_sample(&MonitoringSample {
                    task_id: "task-1".into(),
                    url: "https://example.com".into(),
                    extracted_data: data,
                    execution_id: None,
                    captured_at: base + Duration::minutes(minutes),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_sample("task-1").await.unwrap().unwrap();
        assert_eq!(latest.extracted_data["price"], 200);
        assert!(store.latest_sample("task-2").await.unwrap().is_none());
    }
}
