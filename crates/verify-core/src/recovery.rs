//! Startup Recovery (§4.6): reconciles on-disk tables with in-memory
//! state before the Queue opens. Runs once at boot; the Queue's own
//! restore must not begin until this returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{now, AppError, Request, RequestStatus, ResultsRecord, Store, VerificationRecord};
use tracing::{info, warn};

use crate::antigreylist::AntiGreylistStore;
use crate::archive::{self, finalize, ArchiveStore};
use crate::config::CoreConfig;
use crate::webhook::{send_webhook, WebhookPayload};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub archives_restored: usize,
    pub orphans_found: usize,
    pub requeued: usize,
    pub completed: usize,
    pub waiting_greylist: usize,
    pub failed: usize,
    pub errors: usize,
}

struct Candidate {
    record: ResultsRecord,
    /// True when no Results row existed at all and this was synthesized
    /// from an orphaned Archive entry — such a row must be `results_insert`ed
    /// rather than `results_update`d once classified.
    synthesized: bool,
}

/// Runs the full recovery procedure. The caller must call this before
/// restoring the Queue, so the Queue's restore sees a reconciled table
/// set rather than racing the classification below.
pub async fn recover(
    store: Arc<dyn Store>,
    archive: &ArchiveStore,
    antigreylist: &AntiGreylistStore,
    http: &reqwest::Client,
    config: &CoreConfig,
) -> Result<RecoveryStats, AppError> {
    let mut stats = RecoveryStats::default();

    archive.restore().await?;
    stats.archives_restored = archive.all().len();

    // Entries left `returned=true` are not reset here; the periodic tick
    // is the authoritative driver for them going forward.
    antigreylist.restore().await?;

    expire_zombies(&store, archive, antigreylist, config, &mut stats).await?;

    let candidates = collect_candidates(&store, archive).await?;
    for candidate in candidates {
        process_candidate(&store, archive, antigreylist, http, config, candidate, &mut stats).await;
    }

    info!(
        archives_restored = stats.archives_restored,
        orphans_found = stats.orphans_found,
        requeued = stats.requeued,
        completed = stats.completed,
        waiting_greylist = stats.waiting_greylist,
        failed = stats.failed,
        errors = stats.errors,
        "startup recovery complete"
    );
    Ok(stats)
}

/// A request still `processing`/`queued` when its age exceeds
/// `zombie_ttl` is abandoned outright rather than classified — it is old
/// enough that resuming it would surface stale results to whatever
/// polled `status` long ago. Applies regardless of the `verifying` flag:
/// a worker that crashed mid-probe leaves `verifying=true` forever, and
/// that case is exactly the one this expiry must still catch.
async fn expire_zombies(
    store: &Arc<dyn Store>,
    archive: &ArchiveStore,
    antigreylist: &AntiGreylistStore,
    config: &CoreConfig,
    stats: &mut RecoveryStats,
) -> Result<(), AppError> {
    let cutoff = now() - config.zombie_ttl.as_secs() as i64;
    for mut record in store.results_list_non_terminal().await? {
        if record.created_at > cutoff {
            continue;
        }
        record.status = RequestStatus::Failed;
        record.verifying = false;
        record.updated_at = now();
        store.results_update(&record).await?;
        archive.remove(&record.request_id).await?;
        antigreylist.remove(&record.request_id).await?;
        warn!(request_id = %record.request_id, "zombie request expired");
        stats.failed += 1;
    }
    Ok(())
}

async fn collect_candidates(
    store: &Arc<dyn Store>,
    archive: &ArchiveStore,
) -> Result<Vec<Candidate>, AppError> {
    let mut candidates: Vec<Candidate> = store
        .results_list_non_terminal()
        .await?
        .into_iter()
        .map(|record| Candidate { record, synthesized: false })
        .collect();

    let known: HashSet<String> = candidates.iter().map(|c| c.record.request_id.clone()).collect();
    for entry in archive.all() {
        if known.contains(&entry.request_id) {
            continue;
        }
        if !entry.is_valid() {
            warn!(request_id = %entry.request_id, "dropping invalid archive row found during recovery");
            continue;
        }
        let timestamp = now();
        candidates.push(Candidate {
            record: ResultsRecord {
                request_id: entry.request_id.clone(),
                status: RequestStatus::Processing,
                verifying: false,
                total_emails: entry.emails.len() as i64,
                completed_emails: entry.result.len() as i64,
                results: Vec::new(),
                greylist_found: false,
                blacklist_found: false,
                webhook_sent: false,
                webhook_attempts: 0,
                response_url: entry.response_url.clone(),
                created_at: timestamp,
                updated_at: timestamp,
                completed_at: None,
            },
            synthesized: true,
        });
    }
    Ok(candidates)
}

async fn process_candidate(
    store: &Arc<dyn Store>,
    archive: &ArchiveStore,
    antigreylist: &AntiGreylistStore,
    http: &reqwest::Client,
    config: &CoreConfig,
    candidate: Candidate,
    stats: &mut RecoveryStats,
) {
    let Candidate { record, synthesized } = candidate;
    let request_id = record.request_id.clone();

    match store.queue_contains(&request_id).await {
        Ok(true) => return, // already queued; the Queue's own restore will pick it up
        Ok(false) => {}
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "queue lookup failed during recovery");
            stats.errors += 1;
            return;
        }
    }

    let slots = match store.slots_load_all(config.worker_count).await {
        Ok(slots) => slots,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "worker-slot lookup failed during recovery");
            stats.errors += 1;
            return;
        }
    };
    let stale_slot = slots
        .into_iter()
        .find(|s| s.request_id.as_deref() == Some(request_id.as_str()));
    if let Some(slot) = &stale_slot {
        if let Err(e) = store.slot_clear(slot.slot_index).await {
            warn!(request_id = %request_id, error = %e, "failed to clear stale worker slot");
            stats.errors += 1;
            return;
        }
    }

    let greylist = antigreylist.snapshot(&request_id).await;
    if let Some(entry) = &greylist {
        if !entry.returned {
            // Greylisting is authoritative while in flight; the periodic
            // tick drives this request forward, not recovery.
            return;
        }
        let archived_len = archive.get(&request_id).map(|a| a.result.len()).unwrap_or(0);
        let accounted = (archived_len + entry.emails.len()) as i64;
        if accounted < record.total_emails {
            return;
        }
    }

    stats.orphans_found += 1;

    // The full original batch lives in the Archive entry once any partial
    // completion has happened; a request that crashed before its first
    // worker report has no Archive entry yet, so the stale worker-slot
    // row (which always carries its own `emails`) is the fallback source.
    let archived = archive.get(&request_id);
    let full_emails: Vec<String> = archived
        .as_ref()
        .map(|a| a.emails.clone())
        .or_else(|| stale_slot.as_ref().map(|s| s.emails.clone()))
        .unwrap_or_default();

    if full_emails.is_empty() {
        warn!(request_id = %request_id, "no recoverable email batch for orphan; marking failed");
        fail_candidate(store, archive, antigreylist, record, synthesized, stats).await;
        return;
    }

    let verified: HashMap<String, VerificationRecord> = archived.map(|a| a.result).unwrap_or_default();
    let greylisted_emails: Vec<String> = greylist.as_ref().map(|g| g.emails.clone()).unwrap_or_default();
    let remaining: Vec<String> = full_emails
        .iter()
        .filter(|e| !verified.contains_key(*e) && !greylisted_emails.contains(e))
        .cloned()
        .collect();

    if remaining.is_empty() && greylisted_emails.is_empty() {
        complete_candidate(store, archive, antigreylist, http, config, record, full_emails, verified, stats).await;
    } else if remaining.is_empty() {
        // Case C: waiting_greylist. Archive and Anti-Greylisting are left
        // untouched; the periodic tick finishes the job.
        if synthesized {
            if let Err(e) = store.results_insert(&record).await {
                warn!(request_id = %request_id, error = %e, "failed to persist synthesized results row");
                stats.errors += 1;
                return;
            }
        }
        stats.waiting_greylist += 1;
    } else {
        requeue_candidate(store, record, synthesized, remaining, stats).await;
    }
}

/// Case B: insert directly into the Queue table, bypassing `Queue::add`
/// since the Queue has not opened yet. An existing Archive entry (partial
/// results already merged for other emails in the batch) is left in
/// place — the eventual completion pass reads it the same way a live
/// worker's partial/complete report would.
async fn requeue_candidate(
    store: &Arc<dyn Store>,
    mut record: ResultsRecord,
    synthesized: bool,
    remaining: Vec<String>,
    stats: &mut RecoveryStats,
) {
    let request_id = record.request_id.clone();
    let request = Request {
        request_id: request_id.clone(),
        emails: remaining,
        response_url: record.response_url.clone(),
    };
    if let Err(e) = store.queue_insert(&request).await {
        warn!(request_id = %request_id, error = %e, "failed to requeue orphaned request");
        stats.errors += 1;
        return;
    }

    record.status = RequestStatus::Queued;
    record.verifying = false;
    record.updated_at = now();
    let persisted = if synthesized {
        store.results_insert(&record).await
    } else {
        store.results_update(&record).await
    };
    if let Err(e) = persisted {
        warn!(request_id = %request_id, error = %e, "failed to persist requeued results row");
        stats.errors += 1;
        return;
    }
    stats.requeued += 1;
}

/// Case A: publish final results, attempt the webhook within its
/// remaining budget, then delete the Archive entry.
#[allow(clippy::too_many_arguments)]
async fn complete_candidate(
    store: &Arc<dyn Store>,
    archive: &ArchiveStore,
    antigreylist: &AntiGreylistStore,
    http: &reqwest::Client,
    config: &CoreConfig,
    mut record: ResultsRecord,
    full_emails: Vec<String>,
    verified: HashMap<String, VerificationRecord>,
    stats: &mut RecoveryStats,
) {
    let request_id = record.request_id.clone();
    let final_results = finalize(&full_emails, &verified);

    record.status = RequestStatus::Completed;
    record.verifying = false;
    if archive::any_blocked(&verified) {
        record.blacklist_found = true;
    }
    record.completed_emails = final_results.len() as i64;
    record.results = final_results;
    record.updated_at = now();
    record.completed_at = Some(record.updated_at);

    if !record.response_url.is_empty()
        && !record.webhook_sent
        && record.webhook_attempts < config.webhook_max_attempts as i64
    {
        let payload = WebhookPayload {
            request_id: &request_id,
            total: record.results.len(),
            results: &record.results,
        };
        let delivered = send_webhook(http, &record.response_url, &payload).await;
        record.webhook_attempts += 1;
        if delivered {
            record.webhook_sent = true;
        }
    }

    let write_result = if store.results_get(&request_id).await.ok().flatten().is_none() {
        store.results_insert(&record).await
    } else {
        store.results_update(&record).await
    };
    if let Err(e) = write_result {
        warn!(request_id = %request_id, error = %e, "failed to persist completed results row");
        stats.errors += 1;
        return;
    }

    if let Err(e) = archive.remove(&request_id).await {
        warn!(request_id = %request_id, error = %e, "failed to clear archive after completion");
    }
    if let Err(e) = antigreylist.remove(&request_id).await {
        warn!(request_id = %request_id, error = %e, "failed to clear anti-greylist entry after completion");
    }
    stats.completed += 1;
}

async fn fail_candidate(
    store: &Arc<dyn Store>,
    archive: &ArchiveStore,
    antigreylist: &AntiGreylistStore,
    mut record: ResultsRecord,
    synthesized: bool,
    stats: &mut RecoveryStats,
) {
    let request_id = record.request_id.clone();
    record.status = RequestStatus::Failed;
    record.verifying = false;
    record.updated_at = now();
    let persisted = if synthesized {
        store.results_insert(&record).await
    } else {
        store.results_update(&record).await
    };
    if let Err(e) = persisted {
        warn!(request_id = %request_id, error = %e, "failed to persist failed results row");
        stats.errors += 1;
        return;
    }
    let _ = archive.remove(&request_id).await;
    let _ = antigreylist.remove(&request_id).await;
    stats.failed += 1;
}
