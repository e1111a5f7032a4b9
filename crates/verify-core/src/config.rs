use std::time::Duration;

/// Configuration for the verification pipeline (§6 "Configuration").
///
/// Plain struct rather than a `clap::Parser` — the process entry point owns
/// argument parsing and env handling and builds one of these; the core
/// itself has no opinion on where its numbers come from.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub worker_count: usize,
    pub smtp_connect_timeout: Duration,
    pub smtp_rcpt_timeout: Duration,
    pub greylist_backoff: Duration,
    pub greylist_max_retries: u32,
    pub webhook_max_attempts: u32,
    pub zombie_ttl: Duration,
    /// Worker ACK timeout (§4.2 step 4, §5 "Failure semantics"): how long
    /// the Controller waits for a spawned worker's `Ack` before retrying
    /// the same assignment on the same slot (`Controller::retry_timed_out_acks`).
    pub ack_timeout: Duration,
    pub ping_freq: Duration,
    pub probe_sender: String,
    /// SMTP port to dial (§4.3 step 3, "port 25"). Configurable rather
    /// than hardcoded so tests can point the Prober at a loopback server.
    pub smtp_port: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            smtp_connect_timeout: Duration::from_secs(30),
            smtp_rcpt_timeout: Duration::from_secs(60),
            greylist_backoff: Duration::from_secs(60),
            greylist_max_retries: 5,
            webhook_max_attempts: 5,
            zombie_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            ack_timeout: Duration::from_secs(30),
            ping_freq: Duration::from_secs(5),
            probe_sender: "verify-probe@localhost".to_string(),
            smtp_port: 25,
        }
    }
}
