//! Archive & merge logic for partial results (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use common::{
    AppError, ArchiveEntry, Reachable, SmtpInfo, Store, SyntaxInfo, VerificationRecord,
};
use dashmap::DashMap;
use tracing::warn;

pub struct ArchiveStore {
    store: Arc<dyn Store>,
    entries: DashMap<String, ArchiveEntry>,
}

impl ArchiveStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, entries: DashMap::new() }
    }

    /// Restores valid archive rows into memory (§4.6 step 1). Rows that
    /// fail the validity check are skipped and logged, not propagated —
    /// an unparseable archive row must not abort the whole restore.
    pub async fn restore(&self) -> Result<(), AppError> {
        let rows = self.store.archive_load_all().await?;
        let mut skipped = 0;
        for row in rows {
            if !row.is_valid() {
                warn!(request_id = %row.request_id, "dropping invalid archive row");
                skipped += 1;
                continue;
            }
            self.entries.insert(row.request_id.clone(), row);
        }
        if skipped > 0 {
            warn!(skipped, "archive restore skipped invalid rows");
        }
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Option<ArchiveEntry> {
        self.entries.get(request_id).map(|e| e.clone())
    }

    /// Snapshot of every entry currently in memory, used by recovery to
    /// find archive rows with no matching Results row.
    pub fn all(&self) -> Vec<ArchiveEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// Merges `new_results` into the archive entry for `request_id`,
    /// creating it (with `emails`/`response_url`) if absent. New results
    /// always win on key conflict — they are the freshest probe for that
    /// email. Persists before updating memory.
    pub async fn merge(
        &self,
        request_id: &str,
        emails: &[String],
        response_url: &str,
        new_results: HashMap<String, VerificationRecord>,
    ) -> Result<ArchiveEntry, AppError> {
        let mut entry = self.get(request_id).unwrap_or_else(|| ArchiveEntry {
            request_id: request_id.to_string(),
            emails: emails.to_vec(),
            response_url: response_url.to_string(),
            result: HashMap::new(),
        });
        entry.result.extend(new_results);

        self.store.archive_upsert(&entry).await?;
        self.entries.insert(request_id.to_string(), entry.clone());
        Ok(entry)
    }

    pub async fn remove(&self, request_id: &str) -> Result<(), AppError> {
        self.store.archive_delete(request_id).await?;
        self.entries.remove(request_id);
        Ok(())
    }

    /// `all - verified - greylisted`, per §4.5.
    pub fn remaining(&self, request_id: &str, greylisted: &[String]) -> Vec<String> {
        self.get(request_id)
            .map(|e| e.remaining(greylisted))
            .unwrap_or_default()
    }
}

/// Per-email record for an address that exhausted its greylist retry
/// budget (§4.2 "Persistent SMTP 'try again later' after retry budget
/// exhausted", §8 P4 completeness).
pub fn exhausted_record(email: &str) -> VerificationRecord {
    VerificationRecord {
        email: email.to_string(),
        reachable: Reachable::Unknown,
        syntax: SyntaxInfo::default(),
        smtp: SmtpInfo::default(),
        has_mx_records: false,
        mx: Vec::new(),
        disposable: false,
        role_account: false,
        free: false,
        gravatar: None,
        suggestion: None,
        error: true,
        error_msg: Some("greylist retry budget exhausted".to_string()),
    }
}

/// True if any record in `result` was rejected with the "blocked"
/// error kind (§3 `blacklist_found`, §7 "Permanent SMTP: ... blocked").
/// Mirrors `greylist_found`'s request-level "ever seen" semantics: once
/// set, a caller should keep it set across subsequent merges.
pub fn any_blocked(result: &HashMap<String, VerificationRecord>) -> bool {
    result.values().any(|r| r.error_msg.as_deref() == Some("blocked"))
}

/// Assembles the final, order-preserving results array for a request
/// (§4.5, §5 "per-email order is preserved"). Every email in `emails`
/// gets exactly one record: from `result` if present, otherwise an
/// exhausted-greylist placeholder (§8 P4).
pub fn finalize(emails: &[String], result: &HashMap<String, VerificationRecord>) -> Vec<VerificationRecord> {
    emails
        .iter()
        .map(|email| result.get(email).cloned().unwrap_or_else(|| exhausted_record(email)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[tokio::test]
    async fn merge_creates_then_accumulates() {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let archive = ArchiveStore::new(store);

        let emails = vec!["a@b.com".to_string(), "c@b.com".to_string()];
        let mut first = HashMap::new();
        first.insert("a@b.com".to_string(), record("a@b.com"));
        archive.merge("r1", &emails, "", first).await.unwrap();

        assert_eq!(archive.remaining("r1", &[]), vec!["c@b.com".to_string()]);

        let mut second = HashMap::new();
        second.insert("c@b.com".to_string(), record("c@b.com"));
        archive.merge("r1", &emails, "", second).await.unwrap();

        assert!(archive.remaining("r1", &[]).is_empty());
    }
}
