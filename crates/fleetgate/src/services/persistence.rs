//! Best-effort state persistence with a debounced writer.
//!
//! Each concern (servers, breakers, metrics, bans, timeouts, history) lives
//! in its own JSON file under the configured persistence directory. Callers
//! snapshot their state into an owned JSON value and hand it to
//! [`PersistenceManager::schedule`]; the writer task coalesces bursts and
//! performs the disk I/O, so no in-memory lock is ever held across a write.
//! A corrupt or missing file at load time is logged and ignored.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Which persisted file a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistKind {
    Servers,
    Breakers,
    Metrics,
    Bans,
    Timeouts,
    History,
}

impl PersistKind {
    fn file_name(&self) -> &'static str {
        match self {
            PersistKind::Servers => "servers.json",
            PersistKind::Breakers => "breakers.json",
            PersistKind::Metrics => "metrics.json",
            PersistKind::Bans => "bans.json",
            PersistKind::Timeouts => "timeouts.json",
            PersistKind::History => "history.json",
        }
    }
}

const DEBOUNCE: Duration = Duration::from_millis(2_000);

enum WriterMessage {
    Write(PersistKind, serde_json::Value),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Debounced snapshot writer.
pub struct PersistenceManager {
    path: PathBuf,
    enabled: bool,
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl PersistenceManager {
    /// Creates the manager and spawns its writer task. With persistence
    /// disabled all operations become no-ops.
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> std::sync::Arc<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = std::sync::Arc::new(Self {
            path: path.clone(),
            enabled,
            tx,
        });
        if enabled {
            tokio::spawn(writer_loop(path, rx));
        }
        manager
    }

    /// Queues a snapshot for writing. Multiple schedules of the same kind
    /// within the debounce window collapse into one write of the latest
    /// snapshot.
    pub fn schedule<T: Serialize>(&self, kind: PersistKind, snapshot: &T) {
        if !self.enabled {
            return;
        }
        match serde_json::to_value(snapshot) {
            Ok(value) => {
                let _ = self.tx.send(WriterMessage::Write(kind, value));
            }
            Err(e) => warn!("failed to serialize {:?} snapshot: {}", kind, e),
        }
    }

    /// Forces all pending snapshots to disk. Used on shutdown.
    pub async fn flush(&self) {
        if !self.enabled {
            return;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(WriterMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Loads one persisted file. Missing or corrupt files yield `None`.
    pub async fn load<T: DeserializeOwned>(&self, kind: PersistKind) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let path = self.path.join(kind.file_name());
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => {
                info!("recovered state from {}", path.display());
                Some(value)
            }
            Err(e) => {
                warn!("ignoring corrupt state file {}: {}", path.display(), e);
                None
            }
        }
    }
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterMessage>) {
    if let Err(e) = tokio::fs::create_dir_all(&path).await {
        warn!("cannot create persistence directory {}: {}", path.display(), e);
    }
    let mut pending: HashMap<PersistKind, serde_json::Value> = HashMap::new();
    loop {
        // Block until something arrives, then absorb the burst.
        let first = match rx.recv().await {
            Some(message) => message,
            None => break,
        };
        let mut flush_ack = None;
        match first {
            WriterMessage::Write(kind, value) => {
                pending.insert(kind, value);
            }
            WriterMessage::Flush(ack) => flush_ack = Some(ack),
        }
        if flush_ack.is_none() {
            let deadline = tokio::time::sleep(DEBOUNCE);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    message = rx.recv() => match message {
                        Some(WriterMessage::Write(kind, value)) => {
                            pending.insert(kind, value);
                        }
                        Some(WriterMessage::Flush(ack)) => {
                            flush_ack = Some(ack);
                            break;
                        }
                        None => break,
                    },
                }
            }
        }
        for (kind, value) in pending.drain() {
            let file = path.join(kind.file_name());
            match serde_json::to_vec_pretty(&value) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&file, bytes).await {
                        warn!("failed to write {}: {}", file.display(), e);
                    } else {
                        debug!("persisted {}", file.display());
                    }
                }
                Err(e) => warn!("failed to encode {:?}: {}", kind, e),
            }
        }
        if let Some(ack) = flush_ack {
            let _ = ack.send(());
        }
    }
}
