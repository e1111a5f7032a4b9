//! Response classification into the fixed error taxonomy (spec §4.3 step 4).

use std::fmt;

/// Raw line(s) read back from the SMTP server for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

/// The fixed error taxonomy named verbatim in spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    NoSuchHost,
    ServerUnavailable,
    Blocked,
    TryAgainLater,
    FullInbox,
    TooManyRcpt,
    NoRelay,
    MailboxBusy,
    ExceededMessagingLimits,
    NotAllowed,
    NeedMailBeforeRcpt,
    RecipientHasMoved,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::NoSuchHost => "no such host",
            Self::ServerUnavailable => "server unavailable",
            Self::Blocked => "blocked",
            Self::TryAgainLater => "try again later",
            Self::FullInbox => "full inbox",
            Self::TooManyRcpt => "too many rcpt",
            Self::NoRelay => "no relay",
            Self::MailboxBusy => "mailbox busy",
            Self::ExceededMessagingLimits => "exceeded messaging limits",
            Self::NotAllowed => "not allowed",
            Self::NeedMailBeforeRcpt => "need mail before rcpt",
            Self::RecipientHasMoved => "recipient has moved",
        };
        f.write_str(s)
    }
}

/// What an RCPT TO response means for the email under probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcptOutcome {
    Deliverable,
    Greylisted,
    Permanent(ErrorKind),
}

/// Whether a rejection's text specifically indicates the mailbox exists
/// but has been deactivated (spec §4.3 step 5, "5xx 'disabled/inactive'")
/// rather than the more general "no such user"/unrecognized-5xx cases
/// `classify_rcpt` also folds into `ErrorKind::NotAllowed`. Checked
/// independently of `ErrorKind` so an ordinary "no such user" rejection
/// doesn't get mislabeled as a disabled account.
pub fn is_disabled(resp: &SmtpResponse) -> bool {
    if !resp.is_permanent() {
        return false;
    }
    let text = resp.message.to_ascii_lowercase();
    text.contains("disabled") || text.contains("inactive") || text.contains("suspended")
        || text.contains("deactivated")
}

/// Classifies a RCPT TO response per spec §4.3 step 4.
///
/// 2xx is always deliverable. Every 4xx greylists, regardless of wording —
/// that is the general meaning of a temporary SMTP refusal, and spec §4.3
/// step 5 gives it no exceptions. 5xx falls back to "not allowed" when no
/// keyword matches, since the mailbox exists enough to be rejected
/// explicitly rather than simply absent.
pub fn classify_rcpt(resp: &SmtpResponse) -> RcptOutcome {
    if resp.is_success() {
        return RcptOutcome::Deliverable;
    }

    let text = resp.message.to_ascii_lowercase();

    if resp.is_transient() {
        // Every 4xx is a temporary refusal, including throttles like "too
        // many recipients" or "mailbox busy" — spec §4.3 step 5 classes all
        // of these as the greylist signal, never a permanent verdict.
        return RcptOutcome::Greylisted;
    }

    let kind = if text.contains("mailbox full")
        || text.contains("over quota")
        || text.contains("quota exceeded")
        || text.contains("insufficient storage")
    {
        ErrorKind::FullInbox
    } else if text.contains("mailbox busy") || text.contains("user busy") {
        ErrorKind::MailboxBusy
    } else if text.contains("no such user")
        || text.contains("user unknown")
        || text.contains("does not exist")
        || text.contains("recipient rejected")
        || text.contains("unknown recipient")
        || text.contains("no mailbox")
    {
        ErrorKind::NotAllowed
    } else if text.contains("has moved") || text.contains("user has moved") {
        ErrorKind::RecipientHasMoved
    } else if text.contains("blocked")
        || text.contains("blacklist")
        || text.contains("spamhaus")
        || text.contains("reputation")
    {
        ErrorKind::Blocked
    } else if text.contains("relay") && (text.contains("not allowed") || text.contains("denied")) {
        ErrorKind::NoRelay
    } else if text.contains("too many recipient") || text.contains("too many rcpt") {
        ErrorKind::TooManyRcpt
    } else if text.contains("exceeded") && text.contains("limit") {
        ErrorKind::ExceededMessagingLimits
    } else if text.contains("need mail") || text.contains("mail from first") {
        ErrorKind::NeedMailBeforeRcpt
    } else {
        ErrorKind::NotAllowed
    };

    RcptOutcome::Permanent(kind)
}

/// Classifies a MAIL FROM response. Only used to detect a server refusing
/// the envelope sender outright, which leaves RCPT TO meaningless.
pub fn classify_mail_from(resp: &SmtpResponse) -> RcptOutcome {
    if resp.is_success() {
        RcptOutcome::Deliverable
    } else if resp.is_transient() {
        RcptOutcome::Greylisted
    } else {
        RcptOutcome::Permanent(ErrorKind::NotAllowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(code: u16, message: &str) -> SmtpResponse {
        SmtpResponse { code, message: message.to_string() }
    }

    #[test]
    fn accepts_2xx() {
        assert_eq!(classify_rcpt(&resp(250, "OK")), RcptOutcome::Deliverable);
    }

    #[test]
    fn classifies_greylist() {
        assert_eq!(
            classify_rcpt(&resp(450, "try again later")),
            RcptOutcome::Greylisted
        );
    }

    #[test]
    fn classifies_4xx_too_many_recipients_as_greylist_not_permanent() {
        assert_eq!(
            classify_rcpt(&resp(452, "too many recipients")),
            RcptOutcome::Greylisted
        );
    }

    #[test]
    fn classifies_4xx_mailbox_busy_as_greylist_not_permanent() {
        assert_eq!(
            classify_rcpt(&resp(450, "mailbox busy, try again")),
            RcptOutcome::Greylisted
        );
    }

    #[test]
    fn classifies_5xx_mailbox_busy_as_permanent() {
        assert_eq!(
            classify_rcpt(&resp(550, "mailbox busy")),
            RcptOutcome::Permanent(ErrorKind::MailboxBusy)
        );
    }

    #[test]
    fn classifies_full_inbox() {
        assert_eq!(
            classify_rcpt(&resp(552, "mailbox full")),
            RcptOutcome::Permanent(ErrorKind::FullInbox)
        );
    }

    #[test]
    fn classifies_no_such_user() {
        assert_eq!(
            classify_rcpt(&resp(550, "no such user here")),
            RcptOutcome::Permanent(ErrorKind::NotAllowed)
        );
    }

    #[test]
    fn classifies_blocked() {
        assert_eq!(
            classify_rcpt(&resp(554, "blocked by spamhaus")),
            RcptOutcome::Permanent(ErrorKind::Blocked)
        );
    }

    #[test]
    fn defaults_unrecognized_5xx_to_not_allowed() {
        assert_eq!(
            classify_rcpt(&resp(553, "something unexpected")),
            RcptOutcome::Permanent(ErrorKind::NotAllowed)
        );
    }

    #[test]
    fn is_disabled_matches_only_deactivation_wording() {
        assert!(is_disabled(&resp(550, "mailbox disabled by administrator")));
        assert!(is_disabled(&resp(550, "account inactive")));
        assert!(!is_disabled(&resp(550, "no such user here")));
        assert!(!is_disabled(&resp(450, "mailbox temporarily disabled")));
    }
}
