//! Certificate issuance: the external "give me a chain for these names"
//! collaborator behind a trait.
//!
//! The production implementation drives an ACME order and satisfies its
//! DNS-01 challenges by TSIG-signed dynamic updates against the configured
//! DNS server, then finalizes with an rcgen CSR and returns the issued
//! chain. Tests substitute their own issuer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::udp::UdpClientStream;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// TTL for published challenge records.
const CHALLENGE_TTL: u32 = 60;

/// How long to wait between polls of an in-flight order.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Give up on an order after this many polls.
const MAX_POLL_ATTEMPTS: u32 = 30;

/// An issued certificate chain with its private key, leaf first.
pub struct IssuedChain {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// The issuance collaborator: produce a chain covering `hostname` and the
/// `additional` name, using `key_seed` to namespace issuer-side material.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn fetch_chain(
        &self,
        hostname: &str,
        additional: &str,
        key_seed: &str,
    ) -> Result<IssuedChain>;
}

/// A TSIG update key for the issuance DNS server, parsed from
/// `[algorithm:]name:base64-secret` (algorithm defaults to hmac-sha256).
#[derive(Clone)]
pub struct DnsUpdateKey {
    pub name: String,
    pub algorithm: TsigAlgorithm,
    secret: Vec<u8>,
}

impl DnsUpdateKey {
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (algorithm, name, secret_b64) = match parts.as_slice() {
            [name, secret] => (TsigAlgorithm::HmacSha256, *name, *secret),
            [algorithm, name, secret] => {
                let algorithm = match algorithm.to_lowercase().as_str() {
                    "hmac-sha256" => TsigAlgorithm::HmacSha256,
                    "hmac-sha384" => TsigAlgorithm::HmacSha384,
                    "hmac-sha512" => TsigAlgorithm::HmacSha512,
                    other => bail!("unsupported TSIG algorithm: {}", other),
                };
                (algorithm, *name, *secret)
            }
            _ => bail!("DNS key must be [algorithm:]name:base64-secret"),
        };

        let secret = base64::engine::general_purpose::STANDARD
            .decode(secret_b64)
            .context("DNS key secret is not valid base64")?;

        Ok(Self {
            name: name.to_string(),
            algorithm,
            secret,
        })
    }
}

impl std::fmt::Debug for DnsUpdateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsUpdateKey")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// ACME issuer answering DNS-01 challenges via dynamic update.
pub struct DnsAcmeIssuer {
    directory_url: String,
    contact: Option<String>,
    dns_server: SocketAddr,
    update_key: DnsUpdateKey,
    /// ACME accounts keyed by the per-domain key seed.
    accounts: Mutex<HashMap<String, Account>>,
}

impl DnsAcmeIssuer {
    pub fn new(
        directory_url: String,
        contact: Option<String>,
        dns_server: SocketAddr,
        update_key: DnsUpdateKey,
    ) -> Self {
        Self {
            directory_url,
            contact,
            dns_server,
            update_key,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    async fn account(&self, key_seed: &str) -> Result<Account> {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(key_seed) {
            return Ok(account.clone());
        }

        info!(directory = %self.directory_url, "Creating ACME account");
        let contact: Vec<String> = self
            .contact
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();

        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .context("creating ACME account")?;

        accounts.insert(key_seed.to_string(), account.clone());
        Ok(account)
    }

    async fn dns_client(&self) -> Result<AsyncClient> {
        let signer = TSigner::new(
            self.update_key.secret.clone(),
            self.update_key.algorithm.clone(),
            Name::from_ascii(&self.update_key.name)
                .map_err(|e| anyhow!("invalid TSIG key name: {}", e))?,
            300,
        )
        .map_err(|e| anyhow!("building TSIG signer: {}", e))?;

        let stream = UdpClientStream::<UdpSocket, TSigner>::with_timeout_and_signer(
            self.dns_server,
            Duration::from_secs(5),
            Some(Arc::new(signer)),
        );
        let (client, background) = AsyncClient::connect(stream)
            .await
            .map_err(|e| anyhow!("connecting to DNS server {}: {}", self.dns_server, e))?;
        tokio::spawn(background);
        Ok(client)
    }

    /// Publish a `_acme-challenge` TXT record in the zone of `domain`.
    async fn publish_txt(&self, domain: &str, value: &str) -> Result<()> {
        let mut client = self.dns_client().await?;

        let zone = Name::from_ascii(format!("{}.", domain))
            .map_err(|e| anyhow!("invalid zone name {}: {}", domain, e))?;
        let record_name = Name::from_ascii(format!("_acme-challenge.{}.", domain))
            .map_err(|e| anyhow!("invalid record name: {}", e))?;

        let record = Record::from_rdata(
            record_name,
            CHALLENGE_TTL,
            RData::TXT(TXT::new(vec![value.to_string()])),
        );

        let response = client
            .append(record, zone, false)
            .await
            .map_err(|e| anyhow!("DNS update to {} failed: {}", self.dns_server, e))?;
        debug!(domain = %domain, rcode = ?response.response_code(), "Challenge record published");
        Ok(())
    }

    /// Remove all `_acme-challenge` TXT records for `domain`.
    async fn clear_txt(&self, domain: &str) -> Result<()> {
        let mut client = self.dns_client().await?;

        let zone = Name::from_ascii(format!("{}.", domain))
            .map_err(|e| anyhow!("invalid zone name {}: {}", domain, e))?;
        let record_name = Name::from_ascii(format!("_acme-challenge.{}.", domain))
            .map_err(|e| anyhow!("invalid record name: {}", e))?;

        let record = Record::from_rdata(record_name, 0, RData::TXT(TXT::new(Vec::new())));
        client
            .delete_rrset(record, zone)
            .await
            .map_err(|e| anyhow!("DNS cleanup failed: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl CertificateIssuer for DnsAcmeIssuer {
    async fn fetch_chain(
        &self,
        hostname: &str,
        additional: &str,
        key_seed: &str,
    ) -> Result<IssuedChain> {
        info!(hostname = %hostname, additional = %additional, "Requesting certificate chain");

        let account = self.account(key_seed).await?;

        let identifiers = [
            Identifier::Dns(hostname.to_string()),
            Identifier::Dns(additional.to_string()),
        ];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("creating ACME order")?;

        let authorizations = order.authorizations().await.context("fetching authorizations")?;
        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => bail!("unexpected authorization status: {:?}", status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| anyhow!("no DNS-01 challenge offered for {}", hostname))?;

            let value = order.key_authorization(challenge).dns_value();
            // Wildcard identifiers authorize against the apex zone.
            self.publish_txt(hostname, &value).await?;

            order
                .set_challenge_ready(&challenge.url)
                .await
                .context("marking challenge ready")?;
        }

        // Poll until the order leaves the pending states.
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let state = order.refresh().await.context("refreshing order")?;
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    let _ = self.clear_txt(hostname).await;
                    bail!("order for {} became invalid", hostname);
                }
                _ => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        let _ = self.clear_txt(hostname).await;
                        bail!("order for {} timed out awaiting validation", hostname);
                    }
                }
            }
        }

        if let Err(e) = self.clear_txt(hostname).await {
            warn!(hostname = %hostname, error = %e, "Challenge record cleanup failed");
        }

        // Finalize with a fresh key and CSR covering both names.
        let key_pair =
            KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).context("generating key pair")?;
        let mut params =
            CertificateParams::new(vec![hostname.to_string(), additional.to_string()])
                .context("building CSR parameters")?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .context("serializing CSR")?;

        order
            .finalize(csr.der())
            .await
            .context("finalizing order")?;

        let mut attempts = 0;
        let cert_chain_pem = loop {
            match order
                .certificate()
                .await
                .context("downloading certificate")?
            {
                Some(pem) => break pem,
                None => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        bail!("certificate issuance for {} timed out", hostname);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await.context("refreshing order")?;
                }
            }
        };

        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("parsing issued certificate chain")?;
        if chain.is_empty() {
            bail!("issuer returned an empty chain for {}", hostname);
        }

        info!(hostname = %hostname, chain_len = chain.len(), "Certificate issued");

        Ok(IssuedChain {
            chain,
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }
}
