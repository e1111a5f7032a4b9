//! Anti-Greylisting Store (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use common::{now, AppError, GreylistEntry, Store};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::CoreConfig;

pub struct AntiGreylistStore {
    store: Arc<dyn Store>,
    config: CoreConfig,
    entries: Mutex<HashMap<String, GreylistEntry>>,
}

impl AntiGreylistStore {
    pub fn new(store: Arc<dyn Store>, config: CoreConfig) -> Self {
        Self { store, config, entries: Mutex::new(HashMap::new()) }
    }

    pub async fn restore(&self) -> Result<(), AppError> {
        let rows = self.store.greylist_load_all().await?;
        let mut entries = self.entries.lock().await;
        for row in rows {
            entries.insert(row.request_id.clone(), row);
        }
        info!(restored = entries.len(), "anti-greylist store restored");
        Ok(())
    }

    /// §4.4 `push`. Creates the entry for `request_id` on its first
    /// greylist detection. If a request is greylisted again after a
    /// round-trip through the retry schedule (the worker reports the same
    /// addresses as still greylisted), the existing `retry_count` and
    /// `max_retries_reached` are preserved rather than reset — otherwise
    /// the retry budget in §3 ("max-retry budget") would never bind.
    pub async fn push(&self, request_id: &str, emails: Vec<String>) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        let entry = match entries.get(request_id) {
            Some(existing) => GreylistEntry {
                request_id: request_id.to_string(),
                emails,
                retry_count: existing.retry_count,
                last_tried_at: existing.last_tried_at,
                max_retries_reached: existing.max_retries_reached,
                returned: false,
            },
            None => GreylistEntry {
                request_id: request_id.to_string(),
                emails,
                retry_count: 0,
                last_tried_at: now(),
                max_retries_reached: false,
                returned: false,
            },
        };
        self.store.greylist_upsert(&entry).await?;
        entries.insert(request_id.to_string(), entry);
        Ok(())
    }

    /// §4.4 `snapshot`.
    pub async fn snapshot(&self, request_id: &str) -> Option<GreylistEntry> {
        self.entries.lock().await.get(request_id).cloned()
    }

    pub async fn remove(&self, request_id: &str) -> Result<(), AppError> {
        self.store.greylist_delete(request_id).await?;
        self.entries.lock().await.remove(request_id);
        Ok(())
    }

    /// §4.4 `tick`. Returns the batches that became ripe this round, each
    /// already flipped to `returned=true` in the database and in memory.
    pub async fn tick(&self) -> Result<Vec<GreylistEntry>, AppError> {
        let backoff_secs = self.config.greylist_backoff.as_secs() as i64;
        let max_retries = self.config.greylist_max_retries as i64;
        let current = now();

        let candidates: Vec<GreylistEntry> = {
            let entries = self.entries.lock().await;
            entries
                .values()
                .filter(|e| {
                    !e.max_retries_reached
                        && !e.returned
                        && e.last_tried_at + backoff_secs <= current
                })
                .cloned()
                .collect()
        };

        let mut ripe = Vec::new();
        for mut entry in candidates {
            entry.returned = true;
            entry.retry_count += 1;
            entry.last_tried_at = current;
            if entry.retry_count >= max_retries {
                entry.max_retries_reached = true;
            }
            self.store.greylist_upsert(&entry).await?;
            self.entries.lock().await.insert(entry.request_id.clone(), entry.clone());
            ripe.push(entry);
        }
        Ok(ripe)
    }

    /// Marks an entry's batch as handed back and no longer in flight, e.g.
    /// after the Controller has reassigned it to a worker and the worker
    /// has acknowledged. Leaves retry bookkeeping as-is.
    pub async fn mark_in_flight_done(&self, request_id: &str) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(request_id) {
            entry.returned = false;
            let updated = entry.clone();
            drop(entries);
            self.store.greylist_upsert(&updated).await?;
            self.entries.lock().await.insert(request_id.to_string(), updated);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::SqliteStore;
    use std::time::Duration;

    async fn new_store_and_config() -> (Arc<SqliteStore>, CoreConfig) {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let config = CoreConfig {
            greylist_backoff: Duration::from_secs(0),
            greylist_max_retries: 2,
            ..CoreConfig::default()
        };
        (store, config)
    }

    #[tokio::test]
    async fn tick_returns_ripe_entries_and_flips_returned() {
        let (store, config) = new_store_and_config().await;
        let ag = AntiGreylistStore::new(store, config);
        ag.push("r1", vec!["a@b.com".into()]).await.unwrap();

        let ripe = ag.tick().await.unwrap();
        assert_eq!(ripe.len(), 1);
        assert!(ripe[0].returned);

        let snap = ag.snapshot("r1").await.unwrap();
        assert!(snap.returned);
        assert_eq!(snap.retry_count, 1);
    }

    #[tokio::test]
    async fn max_retries_reached_stops_future_ticks() {
        let (store, config) = new_store_and_config().await;
        let ag = AntiGreylistStore::new(store, config);
        ag.push("r1", vec!["a@b.com".into()]).await.unwrap();

        ag.tick().await.unwrap();
        ag.mark_in_flight_done("r1").await.unwrap();
        let second = ag.tick().await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0].max_retries_reached);

        ag.mark_in_flight_done("r1").await.unwrap();
        let third = ag.tick().await.unwrap();
        assert!(third.is_empty());
    }
}
