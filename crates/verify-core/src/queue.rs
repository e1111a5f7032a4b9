//! The persistent request FIFO (§4.1).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use common::{AppError, Request, Store};
use tokio::sync::{watch, Mutex};
use tracing::info;

struct QueueState {
    order: VecDeque<String>,
    ids: HashSet<String>,
    emails: HashMap<String, Vec<String>>,
    response_urls: HashMap<String, String>,
}

impl QueueState {
    fn empty() -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            emails: HashMap::new(),
            response_urls: HashMap::new(),
        }
    }
}

/// Ordered, durable FIFO of pending requests. The queue table is the
/// source of truth; in-memory structures are rebuilt from it at startup
/// once Startup Recovery has signalled completion.
pub struct Queue {
    store: Arc<dyn Store>,
    state: Mutex<QueueState>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self { store, state: Mutex::new(QueueState::empty()), ready_tx, ready_rx }
    }

    /// Rebuilds in-memory structures from the queue table, then signals
    /// `ready`. Called once, after Startup Recovery has finished (§4.1,
    /// §4.6 step 8).
    pub async fn restore(&self) -> Result<(), AppError> {
        let rows = self.store.queue_load_all().await?;
        let mut state = self.state.lock().await;
        for request in rows {
            if request.request_id.trim().is_empty() || request.emails.is_empty() {
                self.store.queue_delete(&request.request_id).await?;
                continue;
            }
            state.ids.insert(request.request_id.clone());
            state.emails.insert(request.request_id.clone(), request.emails.clone());
            state
                .response_urls
                .insert(request.request_id.clone(), request.response_url.clone());
            state.order.push_back(request.request_id);
        }
        info!(restored = state.order.len(), "queue restored from disk");
        drop(state);
        self.mark_ready();
        Ok(())
    }

    fn mark_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// §4.1 `add`. Fails if `request_id` already present; blocks until
    /// `ready` otherwise.
    pub async fn add(&self, request: Request) -> Result<(), AppError> {
        self.wait_ready().await;
        request.validate()?;

        let mut state = self.state.lock().await;
        if state.ids.contains(&request.request_id) {
            return Err(AppError::Validation(format!(
                "request_id {} already queued",
                request.request_id
            )));
        }

        self.store.queue_insert(&request).await?;
        state.ids.insert(request.request_id.clone());
        state.emails.insert(request.request_id.clone(), request.emails.clone());
        state
            .response_urls
            .insert(request.request_id.clone(), request.response_url.clone());
        state.order.push_back(request.request_id);
        Ok(())
    }

    /// §4.1 `done`. Idempotent.
    pub async fn done(&self, request_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.order.retain(|id| id != request_id);
        state.ids.remove(request_id);
        state.emails.remove(request_id);
        state.response_urls.remove(request_id);
        self.store.queue_delete(request_id).await
    }

    pub async fn current(&self) -> Option<Request> {
        let state = self.state.lock().await;
        let id = state.order.front()?.clone();
        Some(Request {
            request_id: id.clone(),
            emails: state.emails.get(&id).cloned().unwrap_or_default(),
            response_url: state.response_urls.get(&id).cloned().unwrap_or_default(),
        })
    }

    pub async fn has_next(&self) -> bool {
        !self.state.lock().await.order.is_empty()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.order.is_empty()
    }

    pub async fn has_request_id(&self, request_id: &str) -> bool {
        self.state.lock().await.ids.contains(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::SqliteStore;

    async fn store() -> Arc<SqliteStore> {
        let store = SqliteStore::new_in_memory().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn add_blocks_until_ready_then_persists() {
        let store = store().await;
        let queue = Arc::new(Queue::new(store.clone()));

        let q = queue.clone();
        let handle = tokio::spawn(async move {
            q.add(Request {
                request_id: "r1".into(),
                emails: vec!["a@example.com".into()],
                response_url: String::new(),
            })
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.restore().await.unwrap();
        handle.await.unwrap().unwrap();

        assert!(queue.has_request_id("r1").await);
        assert_eq!(store.queue_load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_request_id() {
        let store = store().await;
        let queue = Queue::new(store);
        queue.restore().await.unwrap();
        let req = Request { request_id: "dup".into(), emails: vec!["a@b.com".into()], response_url: String::new() };
        queue.add(req.clone()).await.unwrap();
        assert!(queue.add(req).await.is_err());
    }

    #[tokio::test]
    async fn done_is_idempotent() {
        let store = store().await;
        let queue = Queue::new(store);
        queue.restore().await.unwrap();
        queue.done("missing").await.unwrap();
    }
}
