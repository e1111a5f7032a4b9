use crate::{
    AppError, ArchiveEntry, GreylistEntry, Request, RequestStatus, ResultsRecord, WorkerSlot,
};
use async_trait::async_trait;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePool, Row, Sqlite};
use std::{future::Future, sync::Arc};
use tracing::info;

/// Single-writer-per-table persistence, one table per owning component
/// (§3 "Ownership", §9 "Cyclic/shared state"). The Queue, Controller, and
/// Anti-Greylisting store each mutate exactly the tables they own; nothing
/// here enforces that at the type level, it's a calling-convention
/// invariant upheld by `verify-core`.
#[async_trait]
pub trait Store: Send + Sync {
    fn pool(&self) -> &SqlitePool;

    async fn init(&self) -> Result<(), AppError>;

    // --- Queue table ---
    async fn queue_insert(&self, request: &Request) -> Result<(), AppError>;
    async fn queue_delete(&self, request_id: &str) -> Result<(), AppError>;
    async fn queue_contains(&self, request_id: &str) -> Result<bool, AppError>;
    /// Ordered by insertion id, oldest first (§4.1 Durability (b)).
    async fn queue_load_all(&self) -> Result<Vec<Request>, AppError>;

    // --- Results table ---
    async fn results_insert(&self, record: &ResultsRecord) -> Result<(), AppError>;
    async fn results_get(&self, request_id: &str) -> Result<Option<ResultsRecord>, AppError>;
    async fn results_update(&self, record: &ResultsRecord) -> Result<(), AppError>;
    /// Non-terminal rows (`status in {processing, queued}`), used by
    /// Startup Recovery (§4.6 steps 3-4).
    async fn results_list_non_terminal(&self) -> Result<Vec<ResultsRecord>, AppError>;

    // --- Worker-slot table ---
    async fn slot_assign(
        &self,
        slot_index: i64,
        request_id: &str,
        emails: &[String],
    ) -> Result<(), AppError>;
    async fn slot_clear(&self, slot_index: i64) -> Result<(), AppError>;
    async fn slots_load_all(&self, count: usize) -> Result<Vec<WorkerSlot>, AppError>;

    // --- Archive table ---
    async fn archive_upsert(&self, entry: &ArchiveEntry) -> Result<(), AppError>;
    async fn archive_get(&self, request_id: &str) -> Result<Option<ArchiveEntry>, AppError>;
    async fn archive_delete(&self, request_id: &str) -> Result<(), AppError>;
    async fn archive_load_all(&self) -> Result<Vec<ArchiveEntry>, AppError>;

    // --- Anti-Greylisting table ---
    async fn greylist_upsert(&self, entry: &GreylistEntry) -> Result<(), AppError>;
    async fn greylist_get(&self, request_id: &str) -> Result<Option<GreylistEntry>, AppError>;
    async fn greylist_delete(&self, request_id: &str) -> Result<(), AppError>;
    async fn greylist_set_returned(&self, request_id: &str, returned: bool) -> Result<(), AppError>;
    async fn greylist_load_all(&self) -> Result<Vec<GreylistEntry>, AppError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new_in_memory() -> impl Future<Output = Result<SqliteStore, AppError>> {
        Self::new("sqlite::memory:")
    }

    pub async fn new(database_url: &str) -> Result<Self, AppError> {
        let trimmed_db_url = database_url.trim();
        let filename = trimmed_db_url.trim_start_matches("sqlite:").to_string();
        let in_memory = filename == ":memory:";

        if filename != ":memory:" && !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            info!("Creating database {}", filename);
            Sqlite::create_database(&filename)
                .await
                .map_err(|e| AppError::Database(format!("failed to create database: {e}")))?;
        } else if filename == ":memory:" {
            info!("using in-memory database");
        }

        let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(filename)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        // A single connection for in-memory databases, otherwise each
        // pooled connection would see its own independent database.
        let max_connections = if in_memory { 1 } else { 10 };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .map_err(|e| AppError::Database(format!("failed to connect to database: {e}")))?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> Result<Request, AppError> {
    let emails: String = row.get("emails");
    Ok(Request {
        request_id: row.get("request_id"),
        emails: serde_json::from_str(&emails)
            .map_err(|e| AppError::Database(format!("corrupt emails column: {e}")))?,
        response_url: row.get("response_url"),
    })
}

fn row_to_results(row: &sqlx::sqlite::SqliteRow) -> Result<ResultsRecord, AppError> {
    let status_str: String = row.get("status");
    let results_json: String = row.get("results");
    Ok(ResultsRecord {
        request_id: row.get("request_id"),
        status: status_str
            .parse()
            .map_err(|_| AppError::Database(format!("invalid status: {status_str}")))?,
        verifying: row.get::<i64, _>("verifying") != 0,
        total_emails: row.get("total_emails"),
        completed_emails: row.get("completed_emails"),
        results: serde_json::from_str(&results_json)
            .map_err(|e| AppError::Database(format!("corrupt results column: {e}")))?,
        greylist_found: row.get::<i64, _>("greylist_found") != 0,
        blacklist_found: row.get::<i64, _>("blacklist_found") != 0,
        webhook_sent: row.get::<i64, _>("webhook_sent") != 0,
        webhook_attempts: row.get("webhook_attempts"),
        response_url: row.get("response_url"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_archive(row: &sqlx::sqlite::SqliteRow) -> Result<ArchiveEntry, AppError> {
    let emails: String = row.get("emails");
    let result: String = row.get("result");
    Ok(ArchiveEntry {
        request_id: row.get("request_id"),
        emails: serde_json::from_str(&emails)
            .map_err(|e| AppError::Database(format!("corrupt archive emails: {e}")))?,
        response_url: row.get("response_url"),
        result: serde_json::from_str(&result)
            .map_err(|e| AppError::Database(format!("corrupt archive result: {e}")))?,
    })
}

fn row_to_greylist(row: &sqlx::sqlite::SqliteRow) -> Result<GreylistEntry, AppError> {
    let emails: String = row.get("emails");
    Ok(GreylistEntry {
        request_id: row.get("request_id"),
        emails: serde_json::from_str(&emails)
            .map_err(|e| AppError::Database(format!("corrupt greylist emails: {e}")))?,
        retry_count: row.get("retry_count"),
        last_tried_at: row.get("last_tried_at"),
        max_retries_reached: row.get::<i64, _>("max_retries_reached") != 0,
        returned: row.get::<i64, _>("returned") != 0,
    })
}

#[async_trait]
impl Store for SqliteStore {
    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init(&self) -> Result<(), AppError> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("failed to enable foreign keys: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("failed to run migrations: {e}")))?;

        Ok(())
    }

    async fn queue_insert(&self, request: &Request) -> Result<(), AppError> {
        let emails = serde_json::to_string(&request.emails)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO queue (request_id, emails, response_url) VALUES (?, ?, ?)")
            .bind(&request.request_id)
            .bind(emails)
            .bind(&request.response_url)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn queue_delete(&self, request_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM queue WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn queue_contains(&self, request_id: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM queue WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn queue_load_all(&self) -> Result<Vec<Request>, AppError> {
        let rows = sqlx::query(
            "SELECT request_id, emails, response_url FROM queue \
             WHERE request_id IS NOT NULL AND request_id != '' \
             ORDER BY insertion_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        rows.iter().map(row_to_request).collect()
    }

    async fn results_insert(&self, record: &ResultsRecord) -> Result<(), AppError> {
        let results = serde_json::to_string(&record.results)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO results (request_id, status, verifying, total_emails, completed_emails, \
             results, greylist_found, blacklist_found, webhook_sent, webhook_attempts, \
             response_url, created_at, updated_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.request_id)
        .bind(record.status.as_str())
        .bind(record.verifying as i64)
        .bind(record.total_emails)
        .bind(record.completed_emails)
        .bind(results)
        .bind(record.greylist_found as i64)
        .bind(record.blacklist_found as i64)
        .bind(record.webhook_sent as i64)
        .bind(record.webhook_attempts)
        .bind(&record.response_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn results_get(&self, request_id: &str) -> Result<Option<ResultsRecord>, AppError> {
        let row = sqlx::query("SELECT * FROM results WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        row.as_ref().map(row_to_results).transpose()
    }

    async fn results_update(&self, record: &ResultsRecord) -> Result<(), AppError> {
        let results = serde_json::to_string(&record.results)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query(
            "UPDATE results SET status = ?, verifying = ?, total_emails = ?, completed_emails = ?, \
             results = ?, greylist_found = ?, blacklist_found = ?, webhook_sent = ?, \
             webhook_attempts = ?, response_url = ?, updated_at = ?, completed_at = ? \
             WHERE request_id = ?",
        )
        .bind(record.status.as_str())
        .bind(record.verifying as i64)
        .bind(record.total_emails)
        .bind(record.completed_emails)
        .bind(results)
        .bind(record.greylist_found as i64)
        .bind(record.blacklist_found as i64)
        .bind(record.webhook_sent as i64)
        .bind(record.webhook_attempts)
        .bind(&record.response_url)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .bind(&record.request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn results_list_non_terminal(&self) -> Result<Vec<ResultsRecord>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM results WHERE status IN ('processing', 'queued') AND verifying = 0",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        rows.iter().map(row_to_results).collect()
    }

    async fn slot_assign(
        &self,
        slot_index: i64,
        request_id: &str,
        emails: &[String],
    ) -> Result<(), AppError> {
        let emails_json =
            serde_json::to_string(emails).map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO worker_slots (slot_index, request_id, emails) VALUES (?, ?, ?) \
             ON CONFLICT(slot_index) DO UPDATE SET request_id = excluded.request_id, \
             emails = excluded.emails",
        )
        .bind(slot_index)
        .bind(request_id)
        .bind(emails_json)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn slot_clear(&self, slot_index: i64) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO worker_slots (slot_index, request_id, emails) VALUES (?, NULL, NULL) \
             ON CONFLICT(slot_index) DO UPDATE SET request_id = NULL, emails = NULL",
        )
        .bind(slot_index)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn slots_load_all(&self, count: usize) -> Result<Vec<WorkerSlot>, AppError> {
        let rows = sqlx::query("SELECT slot_index, request_id, emails FROM worker_slots")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut slots: Vec<WorkerSlot> = (0..count as i64)
            .map(|slot_index| WorkerSlot {
                slot_index,
                request_id: None,
                emails: Vec::new(),
            })
            .collect();

        for row in rows {
            let slot_index: i64 = row.get("slot_index");
            if slot_index < 0 || slot_index as usize >= slots.len() {
                continue;
            }
            let request_id: Option<String> = row.get("request_id");
            let emails: Option<String> = row.get("emails");
            let emails = match emails {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| AppError::Database(format!("corrupt slot emails: {e}")))?,
                None => Vec::new(),
            };
            slots[slot_index as usize] = WorkerSlot {
                slot_index,
                request_id,
                emails,
            };
        }

        Ok(slots)
    }

    async fn archive_upsert(&self, entry: &ArchiveEntry) -> Result<(), AppError> {
        let emails =
            serde_json::to_string(&entry.emails).map_err(|e| AppError::Internal(e.to_string()))?;
        let result =
            serde_json::to_string(&entry.result).map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO archive (request_id, emails, response_url, result) VALUES (?, ?, ?, ?) \
             ON CONFLICT(request_id) DO UPDATE SET emails = excluded.emails, \
             response_url = excluded.response_url, result = excluded.result",
        )
        .bind(&entry.request_id)
        .bind(emails)
        .bind(&entry.response_url)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn archive_get(&self, request_id: &str) -> Result<Option<ArchiveEntry>, AppError> {
        let row = sqlx::query("SELECT * FROM archive WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        row.as_ref().map(row_to_archive).transpose()
    }

    async fn archive_delete(&self, request_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM archive WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn archive_load_all(&self) -> Result<Vec<ArchiveEntry>, AppError> {
        let rows = sqlx::query("SELECT * FROM archive")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        // Unparseable rows are skipped, not fatal (§4.6, "Archive validity check").
        Ok(rows.iter().filter_map(|r| row_to_archive(r).ok()).collect())
    }

    async fn greylist_upsert(&self, entry: &GreylistEntry) -> Result<(), AppError> {
        let emails =
            serde_json::to_string(&entry.emails).map_err(|e| AppError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO antigreylist (request_id, emails, retry_count, last_tried_at, \
             max_retries_reached, returned) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(request_id) DO UPDATE SET emails = excluded.emails, \
             retry_count = excluded.retry_count, last_tried_at = excluded.last_tried_at, \
             max_retries_reached = excluded.max_retries_reached, returned = excluded.returned",
        )
        .bind(&entry.request_id)
        .bind(emails)
        .bind(entry.retry_count)
        .bind(entry.last_tried_at)
        .bind(entry.max_retries_reached as i64)
        .bind(entry.returned as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn greylist_get(&self, request_id: &str) -> Result<Option<GreylistEntry>, AppError> {
        let row = sqlx::query("SELECT * FROM antigreylist WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        row.as_ref().map(row_to_greylist).transpose()
    }

    async fn greylist_delete(&self, request_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM antigreylist WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn greylist_set_returned(&self, request_id: &str, returned: bool) -> Result<(), AppError> {
        sqlx::query("UPDATE antigreylist SET returned = ? WHERE request_id = ?")
            .bind(returned as i64)
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn greylist_load_all(&self) -> Result<Vec<GreylistEntry>, AppError> {
        let rows = sqlx::query("SELECT * FROM antigreylist")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        rows.iter().map(row_to_greylist).collect()
    }
}

#[async_trait]
impl<D: Store + ?Sized> Store for Arc<D> {
    fn pool(&self) -> &SqlitePool {
        (**self).pool()
    }

    async fn init(&self) -> Result<(), AppError> {
        (**self).init().await
    }

    async fn queue_insert(&self, request: &Request) -> Result<(), AppError> {
        (**self).queue_insert(request).await
    }

    async fn queue_delete(&self, request_id: &str) -> Result<(), AppError> {
        (**self).queue_delete(request_id).await
    }

    async fn queue_contains(&self, request_id: &str) -> Result<bool, AppError> {
        (**self).queue_contains(request_id).await
    }

    async fn queue_load_all(&self) -> Result<Vec<Request>, AppError> {
        (**self).queue_load_all().await
    }

    async fn results_insert(&self, record: &ResultsRecord) -> Result<(), AppError> {
        (**self).results_insert(record).await
    }

    async fn results_get(&self, request_id: &str) -> Result<Option<ResultsRecord>, AppError> {
        (**self).results_get(request_id).await
    }

    async fn results_update(&self, record: &ResultsRecord) -> Result<(), AppError> {
        (**self).results_update(record).await
    }

    async fn results_list_non_terminal(&self) -> Result<Vec<ResultsRecord>, AppError> {
        (**self).results_list_non_terminal().await
    }

    async fn slot_assign(
        &self,
        slot_index: i64,
        request_id: &str,
        emails: &[String],
    ) -> Result<(), AppError> {
        (**self).slot_assign(slot_index, request_id, emails).await
    }

    async fn slot_clear(&self, slot_index: i64) -> Result<(), AppError> {
        (**self).slot_clear(slot_index).await
    }

    async fn slots_load_all(&self, count: usize) -> Result<Vec<WorkerSlot>, AppError> {
        (**self).slots_load_all(count).await
    }

    async fn archive_upsert(&self, entry: &ArchiveEntry) -> Result<(), AppError> {
        (**self).archive_upsert(entry).await
    }

    async fn archive_get(&self, request_id: &str) -> Result<Option<ArchiveEntry>, AppError> {
        (**self).archive_get(request_id).await
    }

    async fn archive_delete(&self, request_id: &str) -> Result<(), AppError> {
        (**self).archive_delete(request_id).await
    }

    async fn archive_load_all(&self) -> Result<Vec<ArchiveEntry>, AppError> {
        (**self).archive_load_all().await
    }

    async fn greylist_upsert(&self, entry: &GreylistEntry) -> Result<(), AppError> {
        (**self).greylist_upsert(entry).await
    }

    async fn greylist_get(&self, request_id: &str) -> Result<Option<GreylistEntry>, AppError> {
        (**self).greylist_get(request_id).await
    }

    async fn greylist_delete(&self, request_id: &str) -> Result<(), AppError> {
        (**self).greylist_delete(request_id).await
    }

    async fn greylist_set_returned(&self, request_id: &str, returned: bool) -> Result<(), AppError> {
        (**self).greylist_set_returned(request_id, returned).await
    }

    async fn greylist_load_all(&self) -> Result<Vec<GreylistEntry>, AppError> {
        (**self).greylist_load_all().await
    }
}
