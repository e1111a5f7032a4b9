//! Deterministic per-email enrichment: disposable/role_account/free/
//! gravatar/suggestion (§3 `VerificationRecord`, supplemented per
//! SPEC_FULL.md §2 — no network calls, no live lookups).

const ROLE_ACCOUNT_LOCALS: &[&str] = &[
    "admin", "postmaster", "webmaster", "info", "support", "sales", "contact", "abuse",
    "noreply", "no-reply",
];

const DISPOSABLE_DOMAINS: &[&str] = &[
    "mailinator.com",
    "10minutemail.com",
    "guerrillamail.com",
    "tempmail.com",
    "yopmail.com",
];

const FREE_PROVIDER_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "aol.com",
    "icloud.com",
];

const DOMAIN_TYPOS: &[(&str, &str)] = &[
    ("gmial.com", "gmail.com"),
    ("gmal.com", "gmail.com"),
    ("gmail.co", "gmail.com"),
    ("gamil.com", "gmail.com"),
    ("yaho.com", "yahoo.com"),
    ("yahooo.com", "yahoo.com"),
    ("hotmal.com", "hotmail.com"),
    ("hotmial.com", "hotmail.com"),
    ("outlok.com", "outlook.com"),
    ("outloo.com", "outlook.com"),
];

pub fn is_role_account(local_part: &str) -> bool {
    ROLE_ACCOUNT_LOCALS.contains(&local_part.to_ascii_lowercase().as_str())
}

pub fn is_disposable(domain: &str) -> bool {
    DISPOSABLE_DOMAINS.contains(&domain.to_ascii_lowercase().as_str())
}

pub fn is_free_provider(domain: &str) -> bool {
    FREE_PROVIDER_DOMAINS.contains(&domain.to_ascii_lowercase().as_str())
}

/// Well-known gravatar URL: MD5 of the lowercased, trimmed email.
pub fn gravatar_url(email: &str) -> String {
    let normalized = email.trim().to_ascii_lowercase();
    let digest = md5::compute(normalized.as_bytes());
    format!("https://www.gravatar.com/avatar/{digest:x}")
}

/// Single-edit-distance check against a short table of common domain
/// typos. Returns a full corrected email address when `domain` is exactly
/// one edit away from a known-good domain in the table.
pub fn suggestion(username: &str, domain: &str) -> Option<String> {
    let domain = domain.to_ascii_lowercase();
    for (typo, correct) in DOMAIN_TYPOS {
        if *typo == domain {
            return Some(format!("{username}@{correct}"));
        }
        if edit_distance_one(&domain, typo) {
            return Some(format!("{username}@{correct}"));
        }
    }
    None
}

/// True if `a` and `b` differ by exactly one character insertion,
/// deletion, or substitution.
fn edit_distance_one(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if longer.len() - shorter.len() > 1 {
        return false;
    }
    if longer.len() == shorter.len() {
        return shorter.iter().zip(longer).filter(|(x, y)| x != y).count() == 1;
    }
    let mut i = 0;
    let mut j = 0;
    let mut skipped = false;
    while i < shorter.len() && j < longer.len() {
        if shorter[i] == longer[j] {
            i += 1;
            j += 1;
        } else if !skipped {
            skipped = true;
            j += 1;
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_role_accounts() {
        assert!(is_role_account("admin"));
        assert!(is_role_account("No-Reply"));
        assert!(!is_role_account("jane.doe"));
    }

    #[test]
    fn recognizes_disposable_and_free_domains() {
        assert!(is_disposable("mailinator.com"));
        assert!(!is_disposable("gmail.com"));
        assert!(is_free_provider("Gmail.com"));
    }

    #[test]
    fn gravatar_is_deterministic() {
        let a = gravatar_url("Jane.Doe@Example.com ");
        let b = gravatar_url("jane.doe@example.com");
        assert_eq!(a, b);
        assert!(a.starts_with("https://www.gravatar.com/avatar/"));
    }

    #[test]
    fn suggests_known_typo() {
        assert_eq!(
            suggestion("jane", "gmial.com"),
            Some("jane@gmail.com".to_string())
        );
    }

    #[test]
    fn no_suggestion_for_unrelated_domain() {
        assert_eq!(suggestion("jane", "example.com"), None);
    }
}
