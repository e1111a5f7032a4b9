//! Worker: consumes one request at a time, probes each email, reports
//! progress and completion to the Controller (§4.3, §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::VerificationRecord;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::smtp::{ProbeOutcome, Prober};

/// Messages a Worker reports to the Controller. `Partial` folds the
/// spec's "partial"/"greylist_split" event into a single variant — both
/// names describe the same report, a batch finished with some emails
/// deferred to greylisting.
#[derive(Debug)]
pub enum WorkerMessage {
    Ack { slot_index: usize, request_id: String },
    Ping { slot_index: usize, request_id: String },
    Complete { slot_index: usize, request_id: String, verified: HashMap<String, VerificationRecord> },
    Partial {
        slot_index: usize,
        request_id: String,
        verified: HashMap<String, VerificationRecord>,
        greylisted: Vec<String>,
    },
}

pub struct Worker {
    prober: Arc<Prober>,
    ping_freq: Duration,
}

impl Worker {
    pub fn new(prober: Arc<Prober>, ping_freq: Duration) -> Self {
        Self { prober, ping_freq }
    }

    /// Runs the probe loop for one assigned batch and reports results via
    /// `tx`. Sends `Ack` immediately, then `Ping` at `ping_freq` while
    /// working, then exactly one of `Complete`/`Partial`.
    pub async fn run(
        &self,
        slot_index: usize,
        request_id: String,
        emails: Vec<String>,
        tx: mpsc::Sender<WorkerMessage>,
    ) {
        let _ = tx
            .send(WorkerMessage::Ack { slot_index, request_id: request_id.clone() })
            .await;

        let mut verified = HashMap::new();
        let mut greylisted = Vec::new();
        let mut last_ping = Instant::now();

        for email in &emails {
            match self.prober.probe(email).await {
                ProbeOutcome::Record(record) => {
                    verified.insert(email.clone(), record);
                }
                ProbeOutcome::Greylisted => {
                    greylisted.push(email.clone());
                }
            }

            if last_ping.elapsed() >= self.ping_freq {
                let _ = tx
                    .send(WorkerMessage::Ping { slot_index, request_id: request_id.clone() })
                    .await;
                last_ping = Instant::now();
            }
        }

        let message = if greylisted.is_empty() {
            WorkerMessage::Complete { slot_index, request_id, verified }
        } else {
            WorkerMessage::Partial { slot_index, request_id, verified, greylisted }
        };
        let _ = tx.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::dns::MockDnsResolver;
    use common::MxRecord;

    #[tokio::test]
    async fn reports_ack_then_complete_for_clean_batch() {
        let dns = Arc::new(
            MockDnsResolver::new(vec![MxRecord { host: "mx.example.com".into(), pref: 10 }])
                .with_address_fallback(true),
        );
        let config = CoreConfig { smtp_connect_timeout: Duration::from_millis(50), ..CoreConfig::default() };
        let prober = Arc::new(Prober::new(dns, config));
        let worker = Worker::new(prober, Duration::from_secs(60));

        let (tx, mut rx) = mpsc::channel(16);
        worker
            .run(0, "r1".into(), vec!["not-an-email".into()], tx)
            .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, WorkerMessage::Ack { .. }));
        let second = rx.recv().await.unwrap();
        match second {
            WorkerMessage::Complete { verified, .. } => {
                assert_eq!(verified.len(), 1);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }
}
