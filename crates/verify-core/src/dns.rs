use anyhow::Result;
use common::{AppError, MxRecord};
use trust_dns_resolver::TokioAsyncResolver;

/// DNS surface the Prober needs: MX records (ordered by preference) and an
/// A/AAAA fallback check for domains with no explicit MX (§4.3 step 2).
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, AppError>;
    async fn has_address_record(&self, domain: &str) -> Result<bool, AppError>;
}

pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    pub async fn new() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }
}

#[async_trait::async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn mx_lookup(&self, domain: &str) -> Result<Vec<MxRecord>, AppError> {
        let mx_lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| AppError::Smtp(format!("failed to look up MX records: {e}")))?;

        let mut records: Vec<MxRecord> = mx_lookup
            .iter()
            .map(|mx| MxRecord {
                host: mx.exchange().to_string(),
                pref: mx.preference(),
            })
            .collect();
        records.sort_by_key(|r| r.pref);
        Ok(records)
    }

    async fn has_address_record(&self, domain: &str) -> Result<bool, AppError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => Ok(lookup.iter().next().is_some()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(any(test, feature = "test"))]
pub struct MockDnsResolver {
    mx_records: Vec<MxRecord>,
    has_address: bool,
}

#[cfg(any(test, feature = "test"))]
impl MockDnsResolver {
    pub fn new(mx_records: Vec<MxRecord>) -> Self {
        Self {
            mx_records,
            has_address: false,
        }
    }

    pub fn with_address_fallback(mut self, has_address: bool) -> Self {
        self.has_address = has_address;
        self
    }
}

#[cfg(any(test, feature = "test"))]
#[async_trait::async_trait]
impl DnsResolver for MockDnsResolver {
    async fn mx_lookup(&self, _domain: &str) -> Result<Vec<MxRecord>, AppError> {
        Ok(self.mx_records.clone())
    }

    async fn has_address_record(&self, _domain: &str) -> Result<bool, AppError> {
        Ok(self.has_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_resolver_returns_sorted_mx() {
        let records = vec![
            MxRecord { host: "mx2.example.com".into(), pref: 20 },
            MxRecord { host: "mx1.example.com".into(), pref: 10 },
        ];
        let resolver = MockDnsResolver::new(records.clone());
        let result = resolver.mx_lookup("example.com").await.unwrap();
        assert_eq!(result, records);
    }

    #[tokio::test]
    async fn test_mock_resolver_address_fallback() {
        let resolver = MockDnsResolver::new(vec![]).with_address_fallback(true);
        assert!(resolver.has_address_record("example.com").await.unwrap());
    }
}
