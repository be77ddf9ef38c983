use anyhow::{Context, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

/// DNS label prefix external domains publish their proof under
pub const VERIFY_PREFIX: &str = "_zeitwork-verify-token";

/// Resolves TXT proofs for external domain claims
pub struct DomainVerifier {
    resolver: TokioAsyncResolver,
}

impl DomainVerifier {
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = std::time::Duration::from_secs(5);
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        }
    }

    /// Look up `_zeitwork-verify-token.<name>` and check whether any TXT
    /// string contains the token. DNS errors bubble up; the caller retries
    /// on the next scan.
    pub async fn check(&self, domain_name: &str, token: &str) -> Result<bool> {
        let query = format!("{}.{}.", VERIFY_PREFIX, domain_name);
        debug!("Resolving TXT {}", query);

        let response = self
            .resolver
            .txt_lookup(query)
            .await
            .context("TXT lookup failed")?;

        let records: Vec<String> = response
            .iter()
            .flat_map(|txt| txt.iter().map(|data| String::from_utf8_lossy(data).to_string()))
            .collect();

        Ok(any_record_matches(&records, token))
    }
}

impl Default for DomainVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Token match over the returned TXT strings. Substring match, so quoting
/// or concatenation quirks in the published record do not break proofs.
fn any_record_matches(records: &[String], token: &str) -> bool {
    !token.is_empty() && records.iter().any(|r| r.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_record_matches() {
        let records = vec!["tok-xyz".to_string()];
        assert!(any_record_matches(&records, "tok-xyz"));
    }

    #[test]
    fn test_substring_match_tolerates_decoration() {
        let records = vec!["\"tok-xyz\"".to_string()];
        assert!(any_record_matches(&records, "tok-xyz"));
    }

    #[test]
    fn test_unrelated_records_do_not_match() {
        let records = vec!["v=spf1 -all".to_string(), "tok-abc".to_string()];
        assert!(!any_record_matches(&records, "tok-xyz"));
    }

    #[test]
    fn test_empty_token_never_matches() {
        let records = vec!["anything".to_string()];
        assert!(!any_record_matches(&records, ""));
    }
}
