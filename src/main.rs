use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use common::db::SqliteStore;
use tracing::{error, info};
use verify_core::CoreConfig;

/// Process configuration (spec.md §6 "Configuration"). A caller layer
/// (HTTP/CSV/auth — out of scope per spec.md §1) would sit in front of
/// `verify-service::VerifyService` and drive `enqueue`/`status`/`results`;
/// this binary only brings the pipeline up and keeps it running.
#[derive(Parser)]
pub struct Config {
    /// SQLite database path (e.g. 'data.db' or ':memory:' for in-memory database)
    #[arg(long, env = "DATABASE_PATH", default_value = "data.db")]
    pub database_path: String,

    /// Number of worker slots (§4.2).
    #[arg(long, env = "WORKER_COUNT", default_value = "4")]
    pub worker_count: usize,

    /// SMTP connect timeout, in seconds (§4.3 step 3, §5).
    #[arg(long, env = "SMTP_CONNECT_TIMEOUT", default_value = "30")]
    pub smtp_connect_timeout: u64,

    /// SMTP per-RCPT dialogue timeout, in seconds (§5).
    #[arg(long, env = "SMTP_RCPT_TIMEOUT", default_value = "60")]
    pub smtp_rcpt_timeout: u64,

    /// Anti-Greylisting retry backoff, in seconds (§3, §6).
    #[arg(long, env = "GREYLIST_BACKOFF", default_value = "60")]
    pub greylist_backoff: u64,

    /// Anti-Greylisting max retries before exhaustion (§3, §6).
    #[arg(long, env = "GREYLIST_MAX_RETRIES", default_value = "5")]
    pub greylist_max_retries: u32,

    /// Maximum webhook delivery attempts (§4.2, §6).
    #[arg(long, env = "WEBHOOK_MAX_ATTEMPTS", default_value = "5")]
    pub webhook_max_attempts: u32,

    /// Zombie expiry TTL, in seconds (§4.6 step 3, §6).
    #[arg(long, env = "ZOMBIE_TTL_SECS", default_value = "604800")]
    pub zombie_ttl_secs: u64,

    /// Worker ACK timeout, in seconds (§5, §6).
    #[arg(long, env = "ACK_TIMEOUT", default_value = "30")]
    pub ack_timeout: u64,

    /// Worker progress-ping frequency, in seconds (§4.3, §6).
    #[arg(long, env = "PING_FREQ", default_value = "5")]
    pub ping_freq: u64,

    /// Envelope sender used for the probe's MAIL FROM (§4.3 step 4).
    #[arg(long, env = "PROBE_SENDER", default_value = "verify-probe@localhost")]
    pub probe_sender: String,

    /// SMTP port to dial on the recipient's MX (§4.3 step 3).
    #[arg(long, env = "SMTP_PORT", default_value = "25")]
    pub smtp_port: u16,
}

impl From<Config> for CoreConfig {
    fn from(config: Config) -> Self {
        Self {
            worker_count: config.worker_count,
            smtp_connect_timeout: Duration::from_secs(config.smtp_connect_timeout),
            smtp_rcpt_timeout: Duration::from_secs(config.smtp_rcpt_timeout),
            greylist_backoff: Duration::from_secs(config.greylist_backoff),
            greylist_max_retries: config.greylist_max_retries,
            webhook_max_attempts: config.webhook_max_attempts,
            zombie_ttl: Duration::from_secs(config.zombie_ttl_secs),
            ack_timeout: Duration::from_secs(config.ack_timeout),
            ping_freq: Duration::from_secs(config.ping_freq),
            probe_sender: config.probe_sender,
            smtp_port: config.smtp_port,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    let database_path = config.database_path.clone();
    let core_config: CoreConfig = config.into();

    info!(database_path = %database_path, worker_count = core_config.worker_count, "starting smtp-verify");

    if let Err(e) = run(database_path, core_config).await {
        error!("fatal startup error: {e}");
        std::process::exit(1);
    }
}

async fn run(database_path: String, config: CoreConfig) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(&database_path).await?);
    let service = verify_service::VerifyService::start(store, config).await?;
    service.wait_ready().await;
    info!("queue ready; verification pipeline running");

    // No in-scope caller layer exists yet (spec.md §1 "out of scope"), so
    // the process simply keeps the Controller's orchestration loop alive
    // until signalled to stop.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}
