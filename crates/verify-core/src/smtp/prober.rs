//! The per-worker SMTP probe state machine (§4.3).

use std::sync::Arc;

use common::{AppError, MxRecord, Reachable, SmtpInfo, SyntaxInfo, VerificationRecord};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::dns::DnsResolver;
use crate::enrich;

use super::classify::{classify_mail_from, classify_rcpt, is_disabled, ErrorKind, RcptOutcome};
use super::dialogue::converse;

/// Either a finished record, or a signal that the email hit a transient
/// "try again later" response and belongs with Anti-Greylisting instead
/// of the results table (§4.3 step 4, greylist signal).
#[derive(Debug)]
pub enum ProbeOutcome {
    Record(VerificationRecord),
    Greylisted,
}

pub struct Prober {
    dns: Arc<dyn DnsResolver>,
    config: CoreConfig,
}

impl Prober {
    pub fn new(dns: Arc<dyn DnsResolver>, config: CoreConfig) -> Self {
        Self { dns, config }
    }

    pub async fn probe(&self, email: &str) -> ProbeOutcome {
        let (username, domain) = match split_email(email) {
            Some(parts) => parts,
            None => {
                return ProbeOutcome::Record(invalid_syntax_record(email));
            }
        };

        let syntax = SyntaxInfo { username: username.clone(), domain: domain.clone(), valid: true };

        let mx = match self.dns.mx_lookup(&domain).await {
            Ok(records) => records,
            Err(e) => {
                warn!(domain = %domain, error = %e, "mx lookup failed");
                Vec::new()
            }
        };

        let has_mx_records = !mx.is_empty();
        let target_host = if let Some(best) = mx.first() {
            Some(best.host.clone())
        } else {
            match self.dns.has_address_record(&domain).await {
                Ok(true) => Some(domain.clone()),
                _ => None,
            }
        };

        let Some(host) = target_host else {
            return ProbeOutcome::Record(VerificationRecord {
                email: email.to_string(),
                reachable: Reachable::No,
                syntax,
                smtp: SmtpInfo::default(),
                has_mx_records,
                mx,
                disposable: enrich::is_disposable(&domain),
                role_account: enrich::is_role_account(&username),
                free: enrich::is_free_provider(&domain),
                gravatar: Some(enrich::gravatar_url(email)),
                suggestion: enrich::suggestion(&username, &domain),
                error: true,
                error_msg: Some(ErrorKind::NoSuchHost.to_string()),
            });
        };

        match self.dialogue(&host, &username, &domain, email).await {
            Ok(DialogueVerdict::Deliverable { catch_all }) => {
                ProbeOutcome::Record(VerificationRecord {
                    email: email.to_string(),
                    reachable: Reachable::Yes,
                    syntax,
                    smtp: SmtpInfo {
                        host_exists: true,
                        full_inbox: false,
                        catch_all,
                        deliverable: true,
                        disabled: false,
                    },
                    has_mx_records,
                    mx,
                    disposable: enrich::is_disposable(&domain),
                    role_account: enrich::is_role_account(&username),
                    free: enrich::is_free_provider(&domain),
                    gravatar: Some(enrich::gravatar_url(email)),
                    suggestion: enrich::suggestion(&username, &domain),
                    error: false,
                    error_msg: None,
                })
            }
            Ok(DialogueVerdict::Permanent { kind, disabled }) => {
                ProbeOutcome::Record(VerificationRecord {
                    email: email.to_string(),
                    reachable: Reachable::No,
                    syntax,
                    smtp: SmtpInfo {
                        host_exists: true,
                        full_inbox: kind == ErrorKind::FullInbox,
                        catch_all: false,
                        deliverable: false,
                        disabled,
                    },
                    has_mx_records,
                    mx,
                    disposable: enrich::is_disposable(&domain),
                    role_account: enrich::is_role_account(&username),
                    free: enrich::is_free_provider(&domain),
                    gravatar: Some(enrich::gravatar_url(email)),
                    suggestion: enrich::suggestion(&username, &domain),
                    error: true,
                    error_msg: Some(kind.to_string()),
                })
            }
            Ok(DialogueVerdict::Greylisted) => ProbeOutcome::Greylisted,
            Err(kind) => ProbeOutcome::Record(VerificationRecord {
                email: email.to_string(),
                reachable: Reachable::Unknown,
                syntax,
                smtp: SmtpInfo::default(),
                has_mx_records,
                mx,
                disposable: enrich::is_disposable(&domain),
                role_account: enrich::is_role_account(&username),
                free: enrich::is_free_provider(&domain),
                gravatar: Some(enrich::gravatar_url(email)),
                suggestion: enrich::suggestion(&username, &domain),
                error: true,
                error_msg: Some(kind.to_string()),
            }),
        }
    }

    async fn dialogue(
        &self,
        host: &str,
        _username: &str,
        domain: &str,
        email: &str,
    ) -> Result<DialogueVerdict, ErrorKind> {
        let addr = format!("{host}:{}", self.config.smtp_port);
        let stream = tokio::time::timeout(
            self.config.smtp_connect_timeout,
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| ErrorKind::Timeout)?
        .map_err(|e| {
            debug!(host = %host, error = %e, "connect failed");
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ErrorKind::ServerUnavailable
            } else {
                ErrorKind::NoSuchHost
            }
        })?;

        let result = tokio::time::timeout(
            self.config.smtp_rcpt_timeout,
            converse(stream, "verify.local", &self.config.probe_sender, email),
        )
        .await
        .map_err(|_| ErrorKind::Timeout)?
        .map_err(|e: AppError| {
            debug!(domain = %domain, error = %e, "dialogue failed");
            ErrorKind::ServerUnavailable
        })?;

        if !result.greeting.is_success() {
            return Ok(DialogueVerdict::Permanent { kind: ErrorKind::ServerUnavailable, disabled: false });
        }

        match classify_mail_from(&result.mail_from) {
            RcptOutcome::Deliverable => {}
            RcptOutcome::Greylisted => return Ok(DialogueVerdict::Greylisted),
            RcptOutcome::Permanent(_) => {
                return Ok(DialogueVerdict::Permanent {
                    kind: ErrorKind::NeedMailBeforeRcpt,
                    disabled: false,
                })
            }
        }

        match classify_rcpt(&result.rcpt_primary) {
            RcptOutcome::Deliverable => {
                let catch_all = result
                    .rcpt_catch_all
                    .as_ref()
                    .map(|r| matches!(classify_rcpt(r), RcptOutcome::Deliverable))
                    .unwrap_or(false);
                Ok(DialogueVerdict::Deliverable { catch_all })
            }
            RcptOutcome::Greylisted => Ok(DialogueVerdict::Greylisted),
            RcptOutcome::Permanent(kind) => Ok(DialogueVerdict::Permanent {
                kind,
                disabled: is_disabled(&result.rcpt_primary),
            }),
        }
    }
}

enum DialogueVerdict {
    Deliverable { catch_all: bool },
    Permanent { kind: ErrorKind, disabled: bool },
    Greylisted,
}

fn split_email(email: &str) -> Option<(String, String)> {
    let (username, domain) = email.rsplit_once('@')?;
    if username.is_empty() || domain.is_empty() || !domain.contains('.') || email.contains(' ') {
        return None;
    }
    Some((username.to_string(), domain.to_string()))
}

fn invalid_syntax_record(email: &str) -> VerificationRecord {
    VerificationRecord {
        email: email.to_string(),
        reachable: Reachable::No,
        syntax: SyntaxInfo { username: String::new(), domain: String::new(), valid: false },
        smtp: SmtpInfo::default(),
        has_mx_records: false,
        mx: Vec::<MxRecord>::new(),
        disposable: false,
        role_account: false,
        free: false,
        gravatar: None,
        suggestion: None,
        error: true,
        error_msg: Some("invalid syntax".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockDnsResolver;

    fn config() -> CoreConfig {
        CoreConfig {
            smtp_connect_timeout: std::time::Duration::from_millis(200),
            smtp_rcpt_timeout: std::time::Duration::from_millis(200),
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn rejects_bad_syntax_without_touching_dns() {
        let dns = Arc::new(MockDnsResolver::new(vec![]));
        let prober = Prober::new(dns, config());
        let outcome = prober.probe("not-an-email").await;
        match outcome {
            ProbeOutcome::Record(r) => {
                assert!(!r.syntax.valid);
                assert_eq!(r.reachable, Reachable::No);
            }
            ProbeOutcome::Greylisted => panic!("expected a record"),
        }
    }

    #[tokio::test]
    async fn no_mx_and_no_address_record_is_no_such_host() {
        let dns = Arc::new(MockDnsResolver::new(vec![]).with_address_fallback(false));
        let prober = Prober::new(dns, config());
        let outcome = prober.probe("user@noddomain.invalid").await;
        match outcome {
            ProbeOutcome::Record(r) => {
                assert!(!r.has_mx_records);
                assert_eq!(r.error_msg.as_deref(), Some("no such host"));
            }
            ProbeOutcome::Greylisted => panic!("expected a record"),
        }
    }

    /// A generic "no such user" rejection must not be reported as a
    /// disabled mailbox (§4.3 step 5 distinguishes the two cases).
    #[tokio::test]
    async fn no_such_user_rejection_does_not_set_disabled() {
        let port = spawn_scripted_smtp(vec![
            "220 mx.example.com ESMTP",
            "250 mx.example.com Hello",
            "250 2.1.0 Sender OK",
            "550 5.1.1 no such user here",
        ])
        .await;
        let dns = Arc::new(
            MockDnsResolver::new(vec![common::MxRecord { host: "127.0.0.1".into(), pref: 10 }]),
        );
        let prober = Prober::new(dns, CoreConfig { smtp_port: port, ..config() });
        let outcome = prober.probe("nobody@example.com").await;
        match outcome {
            ProbeOutcome::Record(r) => {
                assert_eq!(r.reachable, Reachable::No);
                assert!(!r.smtp.disabled);
            }
            ProbeOutcome::Greylisted => panic!("expected a record"),
        }
    }

    /// A rejection that explicitly says the mailbox is disabled/inactive
    /// sets `smtp.disabled=true` (§4.3 step 5).
    #[tokio::test]
    async fn disabled_mailbox_rejection_sets_disabled() {
        let port = spawn_scripted_smtp(vec![
            "220 mx.example.com ESMTP",
            "250 mx.example.com Hello",
            "250 2.1.0 Sender OK",
            "550 5.2.1 mailbox disabled by administrator",
        ])
        .await;
        let dns = Arc::new(
            MockDnsResolver::new(vec![common::MxRecord { host: "127.0.0.1".into(), pref: 10 }]),
        );
        let prober = Prober::new(dns, CoreConfig { smtp_port: port, ..config() });
        let outcome = prober.probe("nobody@example.com").await;
        match outcome {
            ProbeOutcome::Record(r) => {
                assert_eq!(r.reachable, Reachable::No);
                assert!(r.smtp.disabled);
            }
            ProbeOutcome::Greylisted => panic!("expected a record"),
        }
    }

    /// Binds a one-shot loopback SMTP server that plays back a fixed
    /// script of response lines, returning the port it listens on.
    async fn spawn_scripted_smtp(lines: Vec<&'static str>) -> u16 {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                for line in lines {
                    let _ = sock.write_all(format!("{line}\r\n").as_bytes()).await;
                }
            }
        });
        port
    }
}
