//! Shared routing state: the persistent config and its lock-free snapshot.
//!
//! The persistent side (blob store handle, current superblock, canonical
//! map) sits behind an async mutex so a control-channel mutation holds the
//! lock from map update through device flush; nothing interleaves. The
//! proxy's hot path reads an [`ArcSwap`] snapshot that is replaced on every
//! mutation, so lookups never block on the device.
//!
//! The canonical map is updated before the device flush and is not rolled
//! back when the flush fails; the caller sees the error and a restart
//! reverts to the last durable table.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::codec::{self, BackendAddr, SniEntry, SniMap, DEFAULT_KEY};
use crate::store::{BlobStore, StoreError, Superblock};

struct PersistentConfig {
    store: BlobStore,
    superblock: Superblock,
    map: SniMap,
}

/// Handle owned by the startup task and shared with the listeners.
pub struct SharedState {
    inner: Mutex<PersistentConfig>,
    snapshot: ArcSwap<SniMap>,
}

impl SharedState {
    /// Open the device and load the routing table, initializing a fresh
    /// superblock when no slot verifies.
    pub fn load(device_path: &Path) -> Result<Self> {
        let mut store = BlobStore::open(device_path)
            .with_context(|| format!("opening state device {}", device_path.display()))?;

        let (superblock, payload) = match store.read_data() {
            Ok(found) => found,
            Err(StoreError::BadChecksum) => {
                info!("State device uninitialized, writing fresh superblock");
                let sb = store.init().context("initializing state device")?;
                (sb, Vec::new())
            }
            Err(e) => return Err(e).context("reading state device"),
        };

        let map = codec::decode_data(&payload).context("decoding persisted SNI map")?;
        info!(
            super_counter = superblock.super_counter,
            entries = map.len(),
            "Routing table loaded"
        );

        Ok(Self {
            snapshot: ArcSwap::from_pointee(map.clone()),
            inner: Mutex::new(PersistentConfig {
                store,
                superblock,
                map,
            }),
        })
    }

    /// Current routing-table snapshot for the proxy hot path.
    pub fn snapshot(&self) -> Arc<SniMap> {
        self.snapshot.load_full()
    }

    /// Resolve a backend for a negotiated SNI, falling back to the
    /// `"default"` entry when the name is absent or unknown.
    pub fn resolve(&self, sni: Option<&str>) -> Option<BackendAddr> {
        let map = self.snapshot.load();
        if let Some(name) = sni {
            if let Some(backend) = map.get(&codec::normalize_sni(name)) {
                return Some(*backend);
            }
        }
        map.get(DEFAULT_KEY).copied()
    }

    /// Insert or overwrite a routing entry and flush the table.
    pub async fn add(&self, sni: &str, host: std::net::IpAddr, port: u16) -> Result<()> {
        let key = codec::normalize_sni(sni);
        let mut guard = self.inner.lock().await;
        guard.map.insert(key, BackendAddr { host, port });
        self.publish_and_persist(&mut guard)
    }

    /// Delete a routing entry (no-op when absent) and flush the table.
    pub async fn remove(&self, sni: &str) -> Result<()> {
        let key = codec::normalize_sni(sni);
        let mut guard = self.inner.lock().await;
        guard.map.remove(&key);
        self.publish_and_persist(&mut guard)
    }

    /// Current table as reply rows.
    pub async fn list(&self) -> Vec<SniEntry> {
        let guard = self.inner.lock().await;
        guard
            .map
            .iter()
            .map(|(sni, backend)| SniEntry {
                sni: sni.clone(),
                host: backend.host,
                port: backend.port,
            })
            .collect()
    }

    fn publish_and_persist(&self, guard: &mut PersistentConfig) -> Result<()> {
        // New snapshot becomes visible to the proxy before the flush; a
        // crash between the two reverts only the map, not connections
        // already in flight.
        self.snapshot.store(Arc::new(guard.map.clone()));

        let payload = codec::encode_data(&guard.map).context("encoding SNI map")?;
        match guard.store.write_data(&guard.superblock, &payload) {
            Ok(sb) => {
                guard.superblock = sb;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist routing table");
                Err(e).context("persisting SNI map")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(s: &str) -> std::net::IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_remove_list() {
        let dir = TempDir::new().unwrap();
        let state = SharedState::load(&dir.path().join("state.img")).unwrap();

        state.add("A.Example", addr("10.0.0.1"), 4443).await.unwrap();
        state.add("b.example", addr("10.0.0.2"), 4444).await.unwrap();

        let entries = state.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sni, "a.example");

        state.remove("a.example").await.unwrap();
        assert_eq!(state.list().await.len(), 1);

        // Removing an absent entry is a no-op that still succeeds.
        state.remove("missing.example").await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_after_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.img");

        {
            let state = SharedState::load(&path).unwrap();
            state.add("b.example", addr("10.0.0.9"), 4443).await.unwrap();
        }

        let state = SharedState::load(&path).unwrap();
        let entries = state.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sni, "b.example");
        assert_eq!(entries[0].port, 4443);
    }

    #[tokio::test]
    async fn test_resolve_prefers_exact_then_default() {
        let dir = TempDir::new().unwrap();
        let state = SharedState::load(&dir.path().join("state.img")).unwrap();

        state.add("a.example", addr("10.0.0.1"), 4443).await.unwrap();
        state.add("default", addr("10.0.0.9"), 9999).await.unwrap();

        let exact = state.resolve(Some("A.EXAMPLE")).unwrap();
        assert_eq!(exact.port, 4443);

        let fallback = state.resolve(Some("unknown.example")).unwrap();
        assert_eq!(fallback.port, 9999);

        let no_sni = state.resolve(None).unwrap();
        assert_eq!(no_sni.port, 9999);
    }

    #[tokio::test]
    async fn test_resolve_without_default_is_none() {
        let dir = TempDir::new().unwrap();
        let state = SharedState::load(&dir.path().join("state.img")).unwrap();
        assert!(state.resolve(Some("x.example")).is_none());
        assert!(state.resolve(None).is_none());
    }
}
