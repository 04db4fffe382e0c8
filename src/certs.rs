//! Certificate lifecycle: per-domain chains, SNI selection, renewal loop.
//!
//! One chain is held per configured domain (covering the apex and a
//! one-label wildcard); the first configured domain is the default when a
//! client offers no SNI or an unknown name. Renewal re-fetches every chain,
//! rebuilds the rustls configuration, and installs it with an atomic swap so
//! new accepts pick it up while in-flight sessions are untouched. Any fetch
//! failure is fatal; a supervised restart with stale certificates beats
//! silently serving a broken configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::issuer::{CertificateIssuer, IssuedChain};

/// Renew this many days before the earliest leaf expiry.
const RENEWAL_LEAD_DAYS: i64 = 7;

/// Lower bound on the renewal sleep so a near-expiry or failed renewal
/// cannot hot-spin.
const MIN_RENEWAL_SLEEP: Duration = Duration::from_secs(3600);

/// A provisioned chain for one configured domain.
pub struct DomainCerts {
    /// The apex domain the chain was requested for.
    pub domain: String,
    pub chain: IssuedChain,
}

/// Certificate selection by SNI: exact name, then one-label wildcard, then
/// the default (first configured) chain.
#[derive(Debug)]
pub struct SniResolver {
    default_chain: Arc<CertifiedKey>,
    domains: Vec<(String, Arc<CertifiedKey>)>,
}

impl SniResolver {
    fn lookup(&self, name: &str) -> Arc<CertifiedKey> {
        for (domain, key) in &self.domains {
            if name == domain {
                return key.clone();
            }
            // One-label wildcard: `sub.example.org` matches the chain for
            // `example.org` (issued with `*.example.org`).
            if let Some((_, parent)) = name.split_once('.') {
                if parent == domain {
                    return key.clone();
                }
            }
        }
        self.default_chain.clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => Some(self.lookup(name)),
            None => Some(self.default_chain.clone()),
        }
    }
}

/// Assemble a rustls server configuration from provisioned chains.
///
/// Returns the configuration and the earliest leaf `not_after` still in
/// the future, which drives the renewal schedule; leaves already expired
/// do not participate, and when every leaf has expired the current time
/// is returned so [`renewal_delay`] schedules the clamped minimum retry.
/// The chain list must be non-empty; its first element is the default.
pub fn build_tls_config(bundles: &[DomainCerts]) -> Result<(ServerConfig, DateTime<Utc>)> {
    if bundles.is_empty() {
        return Err(anyhow!("empty certificate list"));
    }

    let now = Utc::now();
    let mut domains = Vec::with_capacity(bundles.len());
    let mut earliest: Option<DateTime<Utc>> = None;

    for bundle in bundles {
        let expiry = leaf_not_after(&bundle.chain)
            .with_context(|| format!("reading expiry of chain for {}", bundle.domain))?;
        // Only a remaining span that is still positive drives the schedule.
        if expiry > now && earliest.map(|e| expiry < e).unwrap_or(true) {
            earliest = Some(expiry);
        }

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&bundle.chain.key)
            .map_err(|e| anyhow!("unsupported private key for {}: {}", bundle.domain, e))?;
        let certified = Arc::new(CertifiedKey::new(bundle.chain.chain.clone(), signing_key));

        debug!(domain = %bundle.domain, expiry = %expiry.to_rfc3339(), "Chain loaded");
        domains.push((bundle.domain.clone(), certified));
    }

    let default_chain = domains[0].1.clone();
    let resolver = SniResolver {
        default_chain,
        domains,
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    let earliest = earliest.unwrap_or(now);
    Ok((config, earliest))
}

/// Extract `not_after` from the leaf certificate of a chain.
fn leaf_not_after(chain: &IssuedChain) -> Result<DateTime<Utc>> {
    let leaf = chain
        .chain
        .first()
        .ok_or_else(|| anyhow!("empty certificate chain"))?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| anyhow!("failed to parse leaf certificate: {:?}", e))?;

    let timestamp = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| anyhow!("leaf not_after out of range"))
}

/// How long to sleep before the next renewal cycle: the remaining lifetime
/// of the earliest-expiring leaf minus the renewal lead, clamped to at
/// least one hour.
pub fn renewal_delay(earliest_not_after: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let remaining = earliest_not_after - now;
    let sleep = remaining - chrono::Duration::days(RENEWAL_LEAD_DAYS);
    match sleep.to_std() {
        Ok(duration) => duration.max(MIN_RENEWAL_SLEEP),
        // Already within the lead window (or past expiry).
        Err(_) => MIN_RENEWAL_SLEEP,
    }
}

/// The certificate manager: fetches one chain per configured domain and
/// keeps the TLS listener's configuration fresh.
pub struct CertManager<I> {
    issuer: I,
    domains: Vec<String>,
    key_seed: String,
}

impl<I: CertificateIssuer> CertManager<I> {
    pub fn new(issuer: I, domains: Vec<String>, key_seed: String) -> Self {
        Self {
            issuer,
            domains,
            key_seed,
        }
    }

    /// Fetch a chain for every configured domain, in configuration order.
    /// Any single failure fails the whole provision; there is no partial
    /// rotation.
    pub async fn provision(&self) -> Result<(ServerConfig, DateTime<Utc>)> {
        if self.domains.is_empty() {
            return Err(anyhow!("no domains configured"));
        }

        let mut bundles = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let additional = format!("*.{}", domain);
            let key_seed = format!("{}:{}", domain, self.key_seed);

            let chain = self
                .issuer
                .fetch_chain(domain, &additional, &key_seed)
                .await
                .with_context(|| format!("retrieving certificate chain for {}", domain))?;

            info!(domain = %domain, "Certificate chain retrieved");
            bundles.push(DomainCerts {
                domain: domain.clone(),
                chain,
            });
        }

        build_tls_config(&bundles)
    }

    /// Renewal loop. `earliest` is the expiry horizon of the configuration
    /// already installed; each cycle sleeps until seven days before it
    /// (clamped), re-provisions, and swaps the new configuration in.
    /// Returns (fatally) on the first failed provision.
    pub async fn run(
        self,
        tls_config: Arc<ArcSwap<ServerConfig>>,
        mut earliest: DateTime<Utc>,
    ) -> Result<()> {
        loop {
            let delay = renewal_delay(earliest, Utc::now());
            info!(
                sleep_secs = delay.as_secs(),
                earliest_expiry = %earliest.to_rfc3339(),
                "Next certificate renewal scheduled"
            );
            tokio::time::sleep(delay).await;

            let (config, next_earliest) = self.provision().await?;
            tls_config.store(Arc::new(config));
            earliest = next_earliest;
            info!("TLS configuration rotated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_delay_clamps_to_one_hour() {
        let now = Utc::now();
        // Expiring in 2 days: inside the 7-day lead, clamp applies.
        let soon = now + chrono::Duration::days(2);
        assert_eq!(renewal_delay(soon, now), MIN_RENEWAL_SLEEP);

        // Already expired: clamp applies.
        let past = now - chrono::Duration::days(1);
        assert_eq!(renewal_delay(past, now), MIN_RENEWAL_SLEEP);
    }

    #[test]
    fn test_renewal_delay_subtracts_lead() {
        let now = Utc::now();
        let expiry = now + chrono::Duration::days(90);
        let delay = renewal_delay(expiry, now);
        let expected = (chrono::Duration::days(83)).to_std().unwrap();
        // Within a second of the exact value.
        assert!(delay >= expected - Duration::from_secs(1));
        assert!(delay <= expected + Duration::from_secs(1));
    }

    #[test]
    fn test_renewal_delay_never_below_floor() {
        let now = Utc::now();
        let expiry = now + chrono::Duration::days(7) + chrono::Duration::minutes(5);
        assert_eq!(renewal_delay(expiry, now), MIN_RENEWAL_SLEEP);
    }

    #[test]
    fn test_empty_bundle_list_rejected() {
        assert!(build_tls_config(&[]).is_err());
    }
}
