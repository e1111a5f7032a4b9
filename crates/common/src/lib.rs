use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod db;

/// Errors surfaced across the queue/controller/worker/recovery pipeline.
///
/// Validation errors are synchronous and surface directly to the caller
/// layer; the rest are embedded in per-email records or logged, per the
/// error taxonomy.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("smtp error: {0}")]
    Smtp(String),
    #[error("webhook error: {0}")]
    Webhook(String),
    #[error("recovery error: {0}")]
    Recovery(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Lifecycle status of a Results record (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::Database(format!("invalid status: {other}"))),
        }
    }
}

/// `progress_step` surfaced to pollers by `status()` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressStep {
    Received,
    Processing,
    AntiGreyListing,
    Complete,
    Failed,
}

/// A request as held by the Queue (§3, "Request (in Queue)").
///
/// `emails` order is preserved end to end; `request_id` carries no
/// semantics of its own beyond uniqueness (the caller-side "single-"/
/// "csv-"/"api-" prefixing convention has no effect on core behavior).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub emails: Vec<String>,
    pub response_url: String,
}

impl Request {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.request_id.trim().is_empty() {
            return Err(AppError::Validation("request_id must not be empty".into()));
        }
        if self.emails.is_empty() {
            return Err(AppError::Validation("emails must not be empty".into()));
        }
        Ok(())
    }
}

/// Per-email verification outcome (§3, `VerificationRecord`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationRecord {
    pub email: String,
    pub reachable: Reachable,
    pub syntax: SyntaxInfo,
    pub smtp: SmtpInfo,
    pub has_mx_records: bool,
    pub mx: Vec<MxRecord>,
    pub disposable: bool,
    pub role_account: bool,
    pub free: bool,
    pub gravatar: Option<String>,
    pub suggestion: Option<String>,
    pub error: bool,
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachable {
    Yes,
    No,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyntaxInfo {
    pub username: String,
    pub domain: String,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SmtpInfo {
    pub host_exists: bool,
    pub full_inbox: bool,
    pub catch_all: bool,
    pub deliverable: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MxRecord {
    pub host: String,
    pub pref: u16,
}

/// The Results record keyed by request_id (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsRecord {
    pub request_id: String,
    pub status: RequestStatus,
    pub verifying: bool,
    pub total_emails: i64,
    pub completed_emails: i64,
    pub results: Vec<VerificationRecord>,
    pub greylist_found: bool,
    pub blacklist_found: bool,
    pub webhook_sent: bool,
    pub webhook_attempts: i64,
    pub response_url: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl ResultsRecord {
    pub fn progress_step(&self) -> ProgressStep {
        match self.status {
            RequestStatus::Completed => ProgressStep::Complete,
            RequestStatus::Failed => ProgressStep::Failed,
            _ if self.greylist_found => ProgressStep::AntiGreyListing,
            RequestStatus::Queued => ProgressStep::Received,
            RequestStatus::Processing => ProgressStep::Processing,
        }
    }
}

/// Worker-slot assignment row (§3, "Worker-slot assignment").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub slot_index: i64,
    pub request_id: Option<String>,
    pub emails: Vec<String>,
}

/// Archive entry (§3, "Archive entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub request_id: String,
    pub emails: Vec<String>,
    pub response_url: String,
    pub result: std::collections::HashMap<String, VerificationRecord>,
}

impl ArchiveEntry {
    /// `all - verified - greylisted`, per §4.5.
    pub fn remaining(&self, greylisted: &[String]) -> Vec<String> {
        self.emails
            .iter()
            .filter(|e| !self.result.contains_key(*e) && !greylisted.contains(e))
            .cloned()
            .collect()
    }

    /// Rejects archive rows with empty `emails` (§4.6, "Archive validity check").
    pub fn is_valid(&self) -> bool {
        !self.emails.is_empty()
    }
}

/// Anti-Greylisting entry (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreylistEntry {
    pub request_id: String,
    pub emails: Vec<String>,
    pub retry_count: i64,
    pub last_tried_at: i64,
    pub max_retries_reached: bool,
    pub returned: bool,
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
