//! Process-entry-point library (SPEC_FULL.md §0): wires an already-open
//! `Store` up to the Queue, Controller, Archive, and Anti-Greylisting
//! subsystems, drives Startup Recovery before the Queue opens, and
//! exposes the inbound operations of spec.md §6 as plain async methods.
//!
//! No HTTP, CSV, auth, or billing layer lives here — per spec.md §1 those
//! are external collaborators this crate stops short of. A caller layer
//! (out of scope) would sit in front of `VerifyService` and translate its
//! own wire protocol into these calls.

use std::sync::Arc;

use common::{db::Store, AppError, Request, ResultsRecord, VerificationRecord};
use tracing::info;
use verify_core::recovery;
use verify_core::{
    AntiGreylistStore, ArchiveStore, Controller, CoreConfig, DnsResolver, Prober, Queue,
    TrustDnsResolver,
};

pub struct VerifyService {
    controller: Arc<Controller>,
    queue: Arc<Queue>,
}

impl VerifyService {
    /// Boots the pipeline against an already-open `store`: runs Startup
    /// Recovery (§4.6), then restores the Queue — only once recovery has
    /// finished, matching §5 ("the Queue's init awaits recovery before
    /// opening") — then spawns the Controller's orchestration loop, which
    /// itself drives worker assignment, the Anti-Greylisting tick, and
    /// webhook delivery.
    pub async fn start(store: Arc<dyn Store>, config: CoreConfig) -> Result<Arc<Self>, AppError> {
        let archive = Arc::new(ArchiveStore::new(store.clone()));
        let antigreylist = Arc::new(AntiGreylistStore::new(store.clone(), config.clone()));
        let http = reqwest::Client::new();

        let stats = recovery::recover(store.clone(), &archive, &antigreylist, &http, &config).await?;
        info!(
            archives_restored = stats.archives_restored,
            orphans_found = stats.orphans_found,
            requeued = stats.requeued,
            completed = stats.completed,
            waiting_greylist = stats.waiting_greylist,
            failed = stats.failed,
            errors = stats.errors,
            "startup recovery finished"
        );

        let queue = Arc::new(Queue::new(store.clone()));
        queue.restore().await?;

        let dns: Arc<dyn DnsResolver> = Arc::new(
            TrustDnsResolver::new()
                .await
                .map_err(|e| AppError::Internal(format!("failed to build DNS resolver: {e}")))?,
        );
        let prober = Arc::new(Prober::new(dns, config.clone()));

        let (controller, rx) =
            Controller::new(store, queue.clone(), archive, antigreylist, prober, config);
        tokio::spawn(controller.clone().run(rx));

        Ok(Arc::new(Self { controller, queue }))
    }

    /// Builds a `VerifyService` with a caller-supplied DNS resolver and
    /// worker-pool `Controller`/`Queue` wiring, for tests that need a
    /// `MockDnsResolver` instead of real DNS. Runs the same recovery and
    /// queue-restore sequence as [`start`](Self::start).
    pub async fn start_with_resolver(
        store: Arc<dyn Store>,
        config: CoreConfig,
        dns: Arc<dyn DnsResolver>,
    ) -> Result<Arc<Self>, AppError> {
        let archive = Arc::new(ArchiveStore::new(store.clone()));
        let antigreylist = Arc::new(AntiGreylistStore::new(store.clone(), config.clone()));
        let http = reqwest::Client::new();

        recovery::recover(store.clone(), &archive, &antigreylist, &http, &config).await?;

        let queue = Arc::new(Queue::new(store.clone()));
        queue.restore().await?;

        let prober = Arc::new(Prober::new(dns, config.clone()));
        let (controller, rx) =
            Controller::new(store, queue.clone(), archive, antigreylist, prober, config);
        tokio::spawn(controller.clone().run(rx));

        Ok(Arc::new(Self { controller, queue }))
    }

    /// §6 `enqueue(request_id, emails, response_url)`.
    pub async fn enqueue(
        &self,
        request_id: String,
        emails: Vec<String>,
        response_url: String,
    ) -> Result<(), AppError> {
        self.controller
            .enqueue(Request { request_id, emails, response_url })
            .await
    }

    /// §6 `status(request_id)`.
    pub async fn status(&self, request_id: &str) -> Result<Option<ResultsRecord>, AppError> {
        self.controller.status(request_id).await
    }

    /// §6 `results(request_id, page, per_page)`.
    pub async fn results(
        &self,
        request_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Option<Vec<VerificationRecord>>, AppError> {
        self.controller.results(request_id, page, per_page).await
    }

    /// Waits for the Queue to have finished restoring from disk. Exposed
    /// so a caller layer's readiness probe can block on it the same way
    /// `Queue::add` internally does.
    pub async fn wait_ready(&self) {
        self.queue.wait_ready().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::SqliteStore;
    use std::time::Duration;
    use verify_core::dns::MockDnsResolver;

    async fn service() -> Arc<VerifyService> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let config = CoreConfig { worker_count: 2, ..CoreConfig::default() };
        let dns: Arc<dyn DnsResolver> = Arc::new(MockDnsResolver::new(vec![]));
        VerifyService::start_with_resolver(store, config, dns).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_poll_reaches_completed() {
        let service = service().await;
        service.wait_ready().await;
        service
            .enqueue("r1".into(), vec!["not-an-email".into()], String::new())
            .await
            .unwrap();

        for _ in 0..100 {
            if let Some(record) = service.status("r1").await.unwrap() {
                if record.status == common::RequestStatus::Completed {
                    let results = service.results("r1", 0, 10).await.unwrap().unwrap();
                    assert_eq!(results.len(), 1);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("request never completed");
    }

    #[tokio::test]
    async fn unknown_request_id_status_is_none() {
        let service = service().await;
        service.wait_ready().await;
        assert!(service.status("missing").await.unwrap().is_none());
    }
}
