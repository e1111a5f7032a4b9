//! The Controller (§4.2): owns the fixed worker-slot array, the Archive,
//! and drives the assignment/completion/partial-completion/greylist-return
//! protocols. It is the sole writer of the Results table and the
//! worker-slot table — every other component hands work to it through
//! explicit messages rather than shared mutable state (§9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{
    now, AppError, GreylistEntry, Request, RequestStatus, ResultsRecord, Store, VerificationRecord,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::antigreylist::AntiGreylistStore;
use crate::archive::{self, ArchiveStore};
use crate::config::CoreConfig;
use crate::queue::Queue;
use crate::smtp::Prober;
use crate::webhook::{send_webhook, WebhookPayload};
use crate::worker::{Worker, WorkerMessage};

pub struct Controller {
    store: Arc<dyn Store>,
    queue: Arc<Queue>,
    archive: Arc<ArchiveStore>,
    antigreylist: Arc<AntiGreylistStore>,
    prober: Arc<Prober>,
    http: reqwest::Client,
    config: CoreConfig,
    tx: mpsc::Sender<WorkerMessage>,
}

/// A slot's assignment while it waits for the worker's `Ack` (§4.2 step 4,
/// §5). Tracked only in `run()`'s local loop state, not persisted — a crash
/// before the Ack arrives is Startup Recovery's problem on the next boot,
/// same as a worker that never reports at all.
struct PendingAssignment {
    request: Request,
    assigned_at: tokio::time::Instant,
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<Queue>,
        archive: Arc<ArchiveStore>,
        antigreylist: Arc<AntiGreylistStore>,
        prober: Arc<Prober>,
        config: CoreConfig,
    ) -> (Arc<Self>, mpsc::Receiver<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(1024);
        let controller = Arc::new(Self {
            store,
            queue,
            archive,
            antigreylist,
            prober,
            http: reqwest::Client::new(),
            config,
            tx,
        });
        (controller, rx)
    }

    // ---- §6 inbound operations ----------------------------------------

    /// `enqueue(request_id, emails, response_url)` (§6). Creates the
    /// Results row (`status=queued`) before handing the request to the
    /// Queue, so a poller immediately sees a row even if assignment hasn't
    /// run yet.
    pub async fn enqueue(&self, request: Request) -> Result<(), AppError> {
        request.validate()?;
        let timestamp = now();
        let record = ResultsRecord {
            request_id: request.request_id.clone(),
            status: RequestStatus::Queued,
            verifying: false,
            total_emails: request.emails.len() as i64,
            completed_emails: 0,
            results: Vec::new(),
            greylist_found: false,
            blacklist_found: false,
            webhook_sent: false,
            webhook_attempts: 0,
            response_url: request.response_url.clone(),
            created_at: timestamp,
            updated_at: timestamp,
            completed_at: None,
        };
        self.store.results_insert(&record).await?;
        self.queue.add(request).await
    }

    pub async fn status(&self, request_id: &str) -> Result<Option<ResultsRecord>, AppError> {
        self.store.results_get(request_id).await
    }

    /// `results(request_id, page, per_page)` (§6). Clamps out-of-range
    /// pages to an empty slice rather than failing (SPEC_FULL.md §2).
    pub async fn results(
        &self,
        request_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Option<Vec<VerificationRecord>>, AppError> {
        let Some(record) = self.store.results_get(request_id).await? else {
            return Ok(None);
        };
        if record.status != RequestStatus::Completed {
            return Ok(Some(Vec::new()));
        }
        let start = page.saturating_mul(per_page);
        if start >= record.results.len() || per_page == 0 {
            return Ok(Some(Vec::new()));
        }
        let end = (start + per_page).min(record.results.len());
        Ok(Some(record.results[start..end].to_vec()))
    }

    // ---- main orchestration loop ---------------------------------------

    /// Drives the Controller for the lifetime of the process: assigns
    /// queued work to free slots, dispatches worker reports, and drains
    /// ripe Anti-Greylisting batches back into assignment. Slot state is a
    /// plain local `Vec` — the loop is the single writer, so no lock is
    /// needed (§9 "single-writer per table").
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WorkerMessage>) {
        let mut slots: Vec<Option<String>> = vec![None; self.config.worker_count];
        let mut pending: HashMap<usize, PendingAssignment> = HashMap::new();
        let mut assign_tick = tokio::time::interval(Duration::from_millis(50));
        let mut greylist_tick =
            tokio::time::interval(self.config.greylist_backoff.max(Duration::from_secs(1)));

        self.queue.wait_ready().await;

        loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    self.dispatch(&mut slots, &mut pending, message).await;
                }
                _ = assign_tick.tick() => {
                    self.retry_timed_out_acks(&mut pending).await;
                    self.try_assign_free_slot(&mut slots, &mut pending).await;
                }
                _ = greylist_tick.tick() => {
                    self.drain_greylist_tick(&mut slots, &mut pending).await;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        slots: &mut [Option<String>],
        pending: &mut HashMap<usize, PendingAssignment>,
        message: WorkerMessage,
    ) {
        match message {
            WorkerMessage::Ack { slot_index, request_id } => {
                info!(request_id = %request_id, "worker acknowledged assignment");
                if pending.get(&slot_index).is_some_and(|p| p.request.request_id == request_id) {
                    pending.remove(&slot_index);
                    if let Err(e) = self.queue.done(&request_id).await {
                        warn!(request_id = %request_id, error = %e, "failed to remove request from queue");
                    }
                }
            }
            WorkerMessage::Ping { request_id, .. } => {
                info!(request_id = %request_id, "worker progress ping");
            }
            WorkerMessage::Complete { slot_index, request_id, verified } => {
                self.settle_pending(pending, slot_index, &request_id).await;
                if let Err(e) = self.complete(&request_id, verified, Some(slot_index)).await {
                    error!(request_id = %request_id, error = %e, "completion protocol failed");
                }
                slots[slot_index] = None;
            }
            WorkerMessage::Partial { slot_index, request_id, verified, greylisted } => {
                self.settle_pending(pending, slot_index, &request_id).await;
                if let Err(e) = self.partial(&request_id, verified, greylisted, Some(slot_index)).await {
                    error!(request_id = %request_id, error = %e, "partial-completion protocol failed");
                }
                slots[slot_index] = None;
            }
        }
    }

    /// Defensive fallback for `Complete`/`Partial` arriving before the
    /// `Ack` the worker sends ahead of them ever got dispatched — clears
    /// the same `pending` entry `Ack` would have, so the request still
    /// leaves the Queue rather than getting stuck there.
    async fn settle_pending(
        &self,
        pending: &mut HashMap<usize, PendingAssignment>,
        slot_index: usize,
        request_id: &str,
    ) {
        if pending.get(&slot_index).is_some_and(|p| p.request.request_id == request_id) {
            pending.remove(&slot_index);
            if let Err(e) = self.queue.done(request_id).await {
                warn!(request_id = %request_id, error = %e, "failed to remove request from queue");
            }
        }
    }

    fn free_slot(&self, slots: &[Option<String>]) -> Option<usize> {
        slots.iter().position(|s| s.is_none())
    }

    async fn try_assign_free_slot(
        &self,
        slots: &mut Vec<Option<String>>,
        pending: &mut HashMap<usize, PendingAssignment>,
    ) {
        if self.queue.is_empty().await {
            return;
        }
        let Some(slot_index) = self.free_slot(slots) else { return };
        let Some(request) = self.queue.current().await else { return };
        // The front request stays in the Queue until its worker Acks
        // (`done` is deferred — see `assign`), so a request already
        // awaiting its Ack must not be handed to a second slot.
        if pending.values().any(|p| p.request.request_id == request.request_id) {
            return;
        }
        self.assign(slots, pending, slot_index, request).await;
    }

    /// §4.2 "Assignment protocol": persist the slot assignment, mark the
    /// Results row `processing`, hand the request to a worker, then call
    /// `Queue.done` only once the worker acknowledges the handoff (§4.2
    /// step 4, §5). Until the Ack arrives the slot's assignment is tracked
    /// in `pending`; `retry_timed_out_acks` re-spawns it for the same slot
    /// if nothing shows up within `ack_timeout`.
    async fn assign(
        &self,
        slots: &mut Vec<Option<String>>,
        pending: &mut HashMap<usize, PendingAssignment>,
        slot_index: usize,
        request: Request,
    ) {
        if let Err(e) = self
            .store
            .slot_assign(slot_index as i64, &request.request_id, &request.emails)
            .await
        {
            error!(request_id = %request.request_id, error = %e, "failed to persist slot assignment");
            return;
        }

        if let Ok(Some(mut record)) = self.store.results_get(&request.request_id).await {
            record.status = RequestStatus::Processing;
            record.verifying = true;
            record.updated_at = now();
            if let Err(e) = self.store.results_update(&record).await {
                error!(request_id = %request.request_id, error = %e, "failed to persist processing state");
            }
        }

        slots[slot_index] = Some(request.request_id.clone());
        self.spawn_worker(pending, slot_index, request);
    }

    /// Spawns the worker task for `request` in `slot_index` and records
    /// the assignment as pending an `Ack`. Shared by a fresh assignment and
    /// an ack-timeout retry of the same slot.
    fn spawn_worker(
        &self,
        pending: &mut HashMap<usize, PendingAssignment>,
        slot_index: usize,
        request: Request,
    ) {
        let worker = Worker::new(self.prober.clone(), self.config.ping_freq);
        let tx = self.tx.clone();
        let request_id = request.request_id.clone();
        let emails = request.emails.clone();
        pending.insert(slot_index, PendingAssignment { request, assigned_at: tokio::time::Instant::now() });
        tokio::spawn(async move {
            worker.run(slot_index, request_id, emails, tx).await;
        });
    }

    /// §5 "ack_timeout": a slot whose worker hasn't Ack'd within
    /// `ack_timeout` is re-spawned for the same request in the same slot.
    /// The stale worker task (if it eventually does report) is harmless:
    /// it targets the same `slot_index`/`request_id` the retry also uses,
    /// so a late report still resolves the right Results row.
    async fn retry_timed_out_acks(&self, pending: &mut HashMap<usize, PendingAssignment>) {
        let timed_out: Vec<usize> = pending
            .iter()
            .filter(|(_, p)| p.assigned_at.elapsed() >= self.config.ack_timeout)
            .map(|(slot_index, _)| *slot_index)
            .collect();
        for slot_index in timed_out {
            let Some(assignment) = pending.remove(&slot_index) else { continue };
            warn!(
                request_id = %assignment.request.request_id,
                slot_index,
                "worker ack timed out; retrying assignment"
            );
            self.spawn_worker(pending, slot_index, assignment.request);
        }
    }

    /// §4.2 "Greylist return-path": a ripe batch is assigned like a fresh
    /// request, bound to its existing `request_id`.
    async fn drain_greylist_tick(
        &self,
        slots: &mut Vec<Option<String>>,
        pending: &mut HashMap<usize, PendingAssignment>,
    ) {
        let ripe = match self.antigreylist.tick().await {
            Ok(ripe) => ripe,
            Err(e) => {
                error!(error = %e, "anti-greylist tick failed");
                return;
            }
        };
        for entry in ripe {
            if entry.max_retries_reached {
                self.finalize_exhausted(&entry).await;
                continue;
            }
            let Some(slot_index) = self.free_slot(slots) else {
                // No free slot this tick. `tick()` only re-offers entries
                // with `returned=false`, so leaving this one `returned=true`
                // with nothing to flip it back would strand it forever.
                // Flip it back so the next tick reconsiders it once its
                // (now-elapsed) backoff comes around again.
                if let Err(e) = self.antigreylist.mark_in_flight_done(&entry.request_id).await {
                    error!(request_id = %entry.request_id, error = %e, "failed to release unassigned greylist entry");
                }
                continue;
            };
            let response_url = self
                .archive
                .get(&entry.request_id)
                .map(|a| a.response_url)
                .unwrap_or_default();
            let request = Request {
                request_id: entry.request_id.clone(),
                emails: entry.emails.clone(),
                response_url,
            };
            self.assign(slots, pending, slot_index, request).await;
        }
    }

    /// A greylist entry that exhausted its retry budget is finalized
    /// directly, without another worker pass: its emails are recorded as
    /// `reachable=unknown` (§4.2 "Persistent SMTP ... exhausted", §4.4).
    async fn finalize_exhausted(&self, entry: &GreylistEntry) {
        if let Err(e) = self.complete(&entry.request_id, HashMap::new(), None).await {
            error!(request_id = %entry.request_id, error = %e, "failed to finalize exhausted-greylist request");
        }
    }

    /// §4.2 "Completion protocol". `verified` is the worker's fresh batch;
    /// it is merged against any existing Archive entry (including an
    /// exhausted Anti-Greylisting entry's emails, which resolve to
    /// placeholders via `archive::finalize`). `slot_index` is `None` when
    /// completing a request with no worker slot to release (an
    /// exhausted-greylist finalization never held one).
    pub async fn complete(
        &self,
        request_id: &str,
        verified: HashMap<String, VerificationRecord>,
        slot_index: Option<usize>,
    ) -> Result<(), AppError> {
        let Some(mut record) = self.store.results_get(request_id).await? else {
            return Err(AppError::Internal(format!("no results row for {request_id}")));
        };

        let archived = self.archive.get(request_id);
        let emails: Vec<String> = archived
            .as_ref()
            .map(|a| a.emails.clone())
            .unwrap_or_else(|| verified.keys().cloned().collect());

        let mut merged: HashMap<String, VerificationRecord> =
            archived.map(|a| a.result).unwrap_or_default();
        merged.extend(verified);

        let greylist = self.antigreylist.snapshot(request_id).await;
        let final_results = archive::finalize(&emails, &merged);

        record.status = RequestStatus::Completed;
        record.verifying = false;
        record.completed_emails = final_results.len() as i64;
        record.results = final_results;
        record.updated_at = now();
        record.completed_at = Some(record.updated_at);
        if greylist.map(|g| g.max_retries_reached).unwrap_or(false) {
            record.greylist_found = true;
        }
        if archive::any_blocked(&merged) {
            record.blacklist_found = true;
        }

        if !record.response_url.is_empty()
            && !record.webhook_sent
            && record.webhook_attempts < self.config.webhook_max_attempts as i64
        {
            let payload = WebhookPayload {
                request_id,
                total: record.results.len(),
                results: &record.results,
            };
            let delivered = send_webhook(&self.http, &record.response_url, &payload).await;
            record.webhook_attempts += 1;
            if delivered {
                record.webhook_sent = true;
            }
        }

        self.store.results_update(&record).await?;
        self.archive.remove(request_id).await?;
        self.antigreylist.remove(request_id).await?;
        if let Some(slot_index) = slot_index {
            self.store.slot_clear(slot_index as i64).await?;
        }
        info!(request_id, "request completed");
        Ok(())
    }

    /// §4.2 "Partial-completion protocol". Merges fresh verifications into
    /// the Archive (creating it if absent) and moves greylisted addresses
    /// into Anti-Greylisting, then marks Results `processing` with
    /// `greylist_found=true`.
    pub async fn partial(
        &self,
        request_id: &str,
        verified: HashMap<String, VerificationRecord>,
        greylisted: Vec<String>,
        slot_index: Option<usize>,
    ) -> Result<(), AppError> {
        let Some(mut record) = self.store.results_get(request_id).await? else {
            return Err(AppError::Internal(format!("no results row for {request_id}")));
        };

        let (emails, response_url) = match self.archive.get(request_id) {
            Some(entry) => (entry.emails, entry.response_url),
            None => {
                let emails: Vec<String> = verified
                    .keys()
                    .cloned()
                    .chain(greylisted.iter().cloned())
                    .collect();
                (emails, record.response_url.clone())
            }
        };

        let archived = self.archive.merge(request_id, &emails, &response_url, verified).await?;
        self.antigreylist.push(request_id, greylisted).await?;

        record.status = RequestStatus::Processing;
        record.verifying = false;
        record.greylist_found = true;
        if archive::any_blocked(&archived.result) {
            record.blacklist_found = true;
        }
        record.updated_at = now();
        self.store.results_update(&record).await?;

        if let Some(slot_index) = slot_index {
            self.store.slot_clear(slot_index as i64).await?;
        }
        info!(request_id, "request partially completed; remainder handed to anti-greylisting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigreylist::AntiGreylistStore;
    use crate::archive::ArchiveStore;
    use crate::dns::MockDnsResolver;
    use crate::queue::Queue;
    use crate::smtp::Prober;
    use common::db::SqliteStore;
    use common::{Reachable, SmtpInfo, SyntaxInfo};

    fn record(email: &str) -> VerificationRecord {
        VerificationRecord {
            email: email.to_string(),
            reachable: Reachable::Yes,
            syntax: SyntaxInfo { username: "a".into(), domain: "b.com".into(), valid: true },
            smtp: SmtpInfo { deliverable: true, ..Default::default() },
            has_mx_records: true,
            mx: vec![],
            disposable: false,
            role_account: false,
            free: false,
            gravatar: None,
            suggestion: None,
            error: false,
            error_msg: None,
        }
    }

    async fn new_controller() -> (Arc<Controller>, mpsc::Receiver<WorkerMessage>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let queue = Arc::new(Queue::new(store.clone()));
        queue.restore().await.unwrap();
        let archive = Arc::new(ArchiveStore::new(store.clone()));
        let config = CoreConfig::default();
        let antigreylist = Arc::new(AntiGreylistStore::new(store.clone(), config.clone()));
        let dns = Arc::new(MockDnsResolver::new(vec![]));
        let prober = Arc::new(Prober::new(dns, config.clone()));
        let (controller, rx) = Controller::new(store.clone(), queue, archive, antigreylist, prober, config);
        (controller, rx, store)
    }

    #[tokio::test]
    async fn enqueue_creates_queued_results_row() {
        let (controller, _rx, _store) = new_controller().await;
        controller
            .enqueue(Request { request_id: "r1".into(), emails: vec!["a@b.com".into()], response_url: String::new() })
            .await
            .unwrap();

        let status = controller.status("r1").await.unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Queued);
        assert_eq!(status.total_emails, 1);
    }

    #[tokio::test]
    async fn complete_with_no_archive_persists_results_and_clears_slot() {
        let (controller, _rx, store) = new_controller().await;
        controller
            .enqueue(Request { request_id: "r1".into(), emails: vec!["a@b.com".into()], response_url: String::new() })
            .await
            .unwrap();
        store.slot_assign(0, "r1", &["a@b.com".to_string()]).await.unwrap();

        let mut verified = HashMap::new();
        verified.insert("a@b.com".to_string(), record("a@b.com"));
        controller.complete("r1", verified, Some(0)).await.unwrap();

        let status = controller.status("r1").await.unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Completed);
        assert_eq!(status.results.len(), 1);
        assert!(status.completed_at.is_some());

        let slots = store.slots_load_all(4).await.unwrap();
        assert!(slots[0].request_id.is_none());
    }

    #[tokio::test]
    async fn partial_then_complete_merges_archive_in_original_order() {
        let (controller, _rx, store) = new_controller().await;
        let emails = vec!["a@b.com".to_string(), "b@b.com".to_string(), "c@b.com".to_string()];
        controller
            .enqueue(Request { request_id: "r1".into(), emails: emails.clone(), response_url: String::new() })
            .await
            .unwrap();
        store.slot_assign(0, "r1", &emails).await.unwrap();

        let mut verified = HashMap::new();
        verified.insert("a@b.com".to_string(), record("a@b.com"));
        verified.insert("b@b.com".to_string(), record("b@b.com"));
        controller
            .partial("r1", verified, vec!["c@b.com".to_string()], Some(0))
            .await
            .unwrap();

        let status = controller.status("r1").await.unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Processing);
        assert!(status.greylist_found);

        store.slot_assign(1, "r1", &["c@b.com".to_string()]).await.unwrap();
        let mut second = HashMap::new();
        second.insert("c@b.com".to_string(), record("c@b.com"));
        controller.complete("r1", second, Some(1)).await.unwrap();

        let status = controller.status("r1").await.unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Completed);
        let got_emails: Vec<String> = status.results.iter().map(|r| r.email.clone()).collect();
        assert_eq!(got_emails, emails);
    }

    #[tokio::test]
    async fn results_clamps_out_of_range_page_to_empty() {
        let (controller, _rx, store) = new_controller().await;
        controller
            .enqueue(Request { request_id: "r1".into(), emails: vec!["a@b.com".into()], response_url: String::new() })
            .await
            .unwrap();
        store.slot_assign(0, "r1", &["a@b.com".to_string()]).await.unwrap();
        let mut verified = HashMap::new();
        verified.insert("a@b.com".to_string(), record("a@b.com"));
        controller.complete("r1", verified, Some(0)).await.unwrap();

        let page = controller.results("r1", 5, 10).await.unwrap().unwrap();
        assert!(page.is_empty());

        let page = controller.results("r1", 0, 10).await.unwrap().unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn ack_timeout_retries_assignment_on_same_slot() {
        let (controller, _rx, _store) = new_controller().await;
        let request = Request { request_id: "r1".into(), emails: vec!["a@b.com".into()], response_url: String::new() };

        let mut pending: HashMap<usize, PendingAssignment> = HashMap::new();
        pending.insert(
            0,
            PendingAssignment {
                request: request.clone(),
                assigned_at: tokio::time::Instant::now() - Duration::from_secs(3600),
            },
        );

        controller.retry_timed_out_acks(&mut pending).await;

        // The stale entry is gone and a fresh one for the same slot/request
        // took its place, reset to "just assigned".
        assert!(pending.contains_key(&0));
        assert_eq!(pending[&0].request.request_id, "r1");
        assert!(pending[&0].assigned_at.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn ack_clears_pending_and_removes_from_queue() {
        let (controller, _rx, store) = new_controller().await;
        controller
            .enqueue(Request { request_id: "r1".into(), emails: vec!["a@b.com".into()], response_url: String::new() })
            .await
            .unwrap();

        let mut slots: Vec<Option<String>> = vec![None];
        let mut pending: HashMap<usize, PendingAssignment> = HashMap::new();
        controller.try_assign_free_slot(&mut slots, &mut pending).await;
        assert!(pending.contains_key(&0), "assignment should be pending an ack");

        controller
            .dispatch(
                &mut slots,
                &mut pending,
                WorkerMessage::Ack { slot_index: 0, request_id: "r1".into() },
            )
            .await;

        assert!(pending.is_empty(), "ack should clear the pending entry");
        assert!(store.queue_load_all().await.unwrap().is_empty(), "ack should release the queue row");
    }

    #[tokio::test]
    async fn complete_sets_blacklist_found_when_a_record_was_blocked() {
        let (controller, _rx, store) = new_controller().await;
        controller
            .enqueue(Request { request_id: "r1".into(), emails: vec!["a@b.com".into()], response_url: String::new() })
            .await
            .unwrap();
        store.slot_assign(0, "r1", &["a@b.com".to_string()]).await.unwrap();

        let mut blocked = record("a@b.com");
        blocked.reachable = Reachable::No;
        blocked.error = true;
        blocked.error_msg = Some("blocked".to_string());
        let mut verified = HashMap::new();
        verified.insert("a@b.com".to_string(), blocked);
        controller.complete("r1", verified, Some(0)).await.unwrap();

        let status = controller.status("r1").await.unwrap().unwrap();
        assert!(status.blacklist_found);
    }
}
