//! snigate - SNI-routing TLS-terminating reverse proxy
//!
//! A reverse proxy that:
//! - Terminates TLS and routes connections to TCP backends by SNI hostname
//! - Redirects plaintext HTTP requests to the equivalent HTTPS URL
//! - Provisions and renews its own certificates via DNS-validated ACME orders
//! - Persists the routing table on a small block device with crash-safe
//!   double-slot superblock replacement
//! - Accepts live reconfiguration over an HMAC-authenticated control channel

pub mod certs;
pub mod codec;
pub mod config;
pub mod control;
pub mod issuer;
pub mod proxy;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use certs::{build_tls_config, renewal_delay, CertManager, DomainCerts, SniResolver};
pub use codec::{BackendAddr, Command, Reply, SniEntry, SniMap};
pub use config::ProxyConfig;
pub use control::{run_control_listener, seal};
pub use issuer::{CertificateIssuer, DnsAcmeIssuer, IssuedChain};
pub use proxy::{run_redirect_listener, run_tls_listener};
pub use state::SharedState;
pub use store::{BlobStore, StoreError, Superblock};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
