//! Document mounted into the agent's container as a file
//!
//! Kubelet refreshes ConfigMap volumes in place, so the agent polls the file
//! and publishes each distinct content on a watch channel. The version token
//! is the CRC32C of the bytes.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::StoredDocument;
use crate::runtime::ShutdownSignal;

/// Polled document file
#[derive(Debug, Clone)]
pub struct MountedDocument {
    path: PathBuf,
    interval: Duration,
}

impl MountedDocument {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    /// Read the file once; `None` if absent or empty
    pub async fn read(&self) -> Option<StoredDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => None,
            Ok(bytes) => Some(StoredDocument {
                version: format!("{:08x}", crc32c::crc32c(&bytes)),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Cannot read {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Poll until shutdown, publishing changed content
    ///
    /// A missing file keeps the last published document.
    pub fn spawn(self, shutdown: ShutdownSignal) -> watch::Receiver<Option<StoredDocument>> {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            info!("Polling {} every {:?}", self.path.display(), self.interval);
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut stop = shutdown.subscribe();

            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {}
                }
                if shutdown.is_shutdown() {
                    break;
                }

                let Some(latest) = self.read().await else {
                    continue;
                };
                let changed = tx.send_if_modified(|current| {
                    if current
                        .as_ref()
                        .is_some_and(|d: &StoredDocument| d.version == latest.version)
                    {
                        return false;
                    }
                    *current = Some(latest.clone());
                    true
                });
                if changed {
                    debug!("{} changed (version {})", self.path.display(), latest.version);
                }
                if tx.is_closed() {
                    break;
                }
            }
            debug!("Stopped polling {}", self.path.display());
        });
        rx
    }
}
