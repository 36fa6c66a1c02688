//! # Rendezvous Service
//!
//! Name publication and discovery. The Server publishes the address of its
//! control socket under a well-known name; the Controller waits for that name
//! before it does anything else.
//!
//! Two registries are provided:
//!
//! - [`FileRendezvous`]: one file per name inside a shared directory. Works
//!   across processes on a host, or across hosts when the directory lives on
//!   shared storage.
//! - [`MemoryRendezvous`]: an in-process map, used when the Controller and
//!   Server run inside the same process (tests, single-node runs).

use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Make `addr` discoverable under `name`, replacing any earlier entry.
    async fn publish(&self, name: &str, addr: SocketAddr) -> BenchResult<()>;

    /// Remove the entry for `name`. Removing an absent name is not an error.
    async fn withdraw(&self, name: &str) -> BenchResult<()>;

    /// Wait until `name` is published, failing with [`BenchError::Discovery`]
    /// once `limit` has elapsed.
    async fn wait_for(&self, name: &str, limit: Duration) -> BenchResult<SocketAddr>;
}

/// Directory-backed registry.
pub struct FileRendezvous {
    dir: PathBuf,
}

impl FileRendezvous {
    /// How often a waiting party re-checks the directory.
    const POLL_INTERVAL: Duration = Duration::from_millis(200);

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.addr", name))
    }

    async fn lookup(&self, name: &str) -> BenchResult<Option<SocketAddr>> {
        let path = self.entry_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match contents.trim().parse() {
                Ok(addr) => Ok(Some(addr)),
                Err(_) => {
                    // A half-written or foreign file; keep polling.
                    warn!("ignoring malformed rendezvous entry {:?}", path);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BenchError::io(
                format!("failed to read rendezvous entry {:?}", path),
                e,
            )),
        }
    }
}

#[async_trait]
impl Rendezvous for FileRendezvous {
    async fn publish(&self, name: &str, addr: SocketAddr) -> BenchResult<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            BenchError::io(
                format!("failed to create rendezvous directory {:?}", self.dir),
                e,
            )
        })?;

        // Write then rename so readers never observe a partial entry.
        let path = self.entry_path(name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", name, std::process::id()));
        tokio::fs::write(&tmp, addr.to_string())
            .await
            .map_err(|e| BenchError::io(format!("failed to write {:?}", tmp), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BenchError::io(format!("failed to publish {:?}", path), e))?;

        debug!("published '{}' at {} ({:?})", name, addr, path);
        Ok(())
    }

    async fn withdraw(&self, name: &str) -> BenchResult<()> {
        let path = self.entry_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("withdrew '{}'", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BenchError::io(format!("failed to withdraw {:?}", path), e)),
        }
    }

    async fn wait_for(&self, name: &str, limit: Duration) -> BenchResult<SocketAddr> {
        let deadline = tokio::time::Instant::now() + limit;
        debug!("waiting for '{}' in {:?}", name, self.dir);
        loop {
            if let Some(addr) = self.lookup(name).await? {
                return Ok(addr);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(BenchError::Discovery {
                    name: name.to_string(),
                    limit,
                });
            }
            tokio::time::sleep(Self::POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// In-process registry. Clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    entries: Arc<Mutex<HashMap<String, watch::Sender<Option<SocketAddr>>>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, name: &str) -> watch::Receiver<Option<SocketAddr>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn set(&self, name: &str, value: Option<SocketAddr>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = entries
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(value);
    }
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn publish(&self, name: &str, addr: SocketAddr) -> BenchResult<()> {
        self.set(name, Some(addr));
        debug!("published '{}' at {}", name, addr);
        Ok(())
    }

    async fn withdraw(&self, name: &str) -> BenchResult<()> {
        self.set(name, None);
        Ok(())
    }

    async fn wait_for(&self, name: &str, limit: Duration) -> BenchResult<SocketAddr> {
        let mut rx = self.subscribe(name);
        let discovered = tokio::time::timeout(limit, async move {
            loop {
                if let Some(addr) = *rx.borrow_and_update() {
                    return Some(addr);
                }
                // The sender lives in the shared table, so this only fails
                // if the table itself is gone.
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        match discovered {
            Ok(Some(addr)) => Ok(addr),
            _ => Err(BenchError::Discovery {
                name: name.to_string(),
                limit,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_file_publish_then_discover() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRendezvous::new(dir.path());

        registry.publish("bench-server-ctrl", addr(17777)).await.unwrap();
        let found = registry
            .wait_for("bench-server-ctrl", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(found, addr(17777));
    }

    #[tokio::test]
    async fn test_file_discovery_waits_for_late_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let publisher = tokio::spawn(async move {
            // Justification: publish only after the waiter has polled at least once.
            tokio::time::sleep(Duration::from_millis(300)).await;
            FileRendezvous::new(path)
                .publish("late", addr(4000))
                .await
                .unwrap();
        });

        let found = FileRendezvous::new(dir.path())
            .wait_for("late", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, addr(4000));
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_discovery_timeout_names_service() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRendezvous::new(dir.path());

        let err = registry
            .wait_for("missing-server", Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Discovery { .. }));
        assert!(err.to_string().contains("missing-server"));
    }

    #[tokio::test]
    async fn test_file_withdraw() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRendezvous::new(dir.path());

        registry.publish("svc", addr(1)).await.unwrap();
        registry.withdraw("svc").await.unwrap();
        // Withdrawing twice is harmless.
        registry.withdraw("svc").await.unwrap();
        assert!(registry
            .wait_for("svc", Duration::from_millis(50))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_rendezvous() {
        let registry = MemoryRendezvous::new();
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for("svc", Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.publish("svc", addr(9)).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), addr(9));

        registry.withdraw("svc").await.unwrap();
        let err = registry
            .wait_for("svc", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("svc"));
    }
}
