//! Remote file watching by polling.
//!
//! Each watcher polls one remote file's size and mtime over the owning
//! connection's SFTP subsystem and re-downloads it when either changes.
//! Watchers are keyed by local path: a second start against the same
//! local file returns the existing watcher instead of stacking a
//! duplicate poll loop.

use crate::error::{AppError, AppResult};
use crate::events::{Event, EventBus};
use crate::sftp::RemoteStat;
use crate::ssh::connection::{Connection, ConnectionStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Consecutive poll failures before a watcher shuts itself down
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// A registered watcher
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherInfo {
    pub id: String,
    pub connection_id: String,
    pub remote_path: String,
    pub local_path: String,
}

struct WatcherEntry {
    info: WatcherInfo,
    stop_tx: mpsc::Sender<()>,
}

/// Registry of active watchers, keyed by local path
pub struct FileWatcherManager {
    watchers: Arc<DashMap<String, WatcherEntry>>,
}

impl FileWatcherManager {
    pub fn new() -> Self {
        Self {
            watchers: Arc::new(DashMap::new()),
        }
    }

    /// Start watching a remote file. Starting an already-watched local
    /// path is a no-op returning the existing watcher.
    pub fn start(
        &self,
        conn: Arc<Connection>,
        events: Arc<EventBus>,
        remote_path: &str,
        local_path: &str,
        interval: Duration,
    ) -> AppResult<WatcherInfo> {
        if let Some(existing) = self.watchers.get(local_path) {
            if existing.info.remote_path != remote_path {
                tracing::warn!(
                    "Watcher for {} already tracks {}, ignoring request for {}",
                    local_path,
                    existing.info.remote_path,
                    remote_path
                );
            }
            return Ok(existing.info.clone());
        }

        if conn.status() != ConnectionStatus::Connected {
            return Err(AppError::NotConnected(format!(
                "Connection {} is not connected",
                conn.id
            )));
        }

        let info = WatcherInfo {
            id: Uuid::new_v4().to_string(),
            connection_id: conn.id.clone(),
            remote_path: remote_path.to_string(),
            local_path: local_path.to_string(),
        };

        let (stop_tx, stop_rx) = mpsc::channel(1);

        let stat_conn = Arc::clone(&conn);
        let stat_remote = info.remote_path.clone();
        let stat = move || {
            let conn = Arc::clone(&stat_conn);
            let remote = stat_remote.clone();
            async move { conn.stat_remote(&remote).await }
        };

        let refresh_remote = info.remote_path.clone();
        let refresh_local = PathBuf::from(local_path);
        let event_local = local_path.to_string();
        let refresh = move || {
            let conn = Arc::clone(&conn);
            let remote = refresh_remote.clone();
            let local = refresh_local.clone();
            let events = Arc::clone(&events);
            let event_local = event_local.clone();
            async move {
                conn.download(&remote, &local).await?;
                tracing::info!("Watched file {} changed, refreshed {}", remote, event_local);
                events.emit(Event::FileChanged {
                    local_path: event_local,
                    remote_path: remote,
                });
                Ok(())
            }
        };

        let watchers = Arc::clone(&self.watchers);
        let key = local_path.to_string();
        spawn_poll_loop(interval, stop_rx, stat, refresh, move || {
            watchers.remove(&key);
        });

        tracing::info!(
            "Watching {} on {} (local: {})",
            remote_path,
            info.connection_id,
            local_path
        );

        let returned = info.clone();
        self.watchers
            .insert(local_path.to_string(), WatcherEntry { info, stop_tx });
        Ok(returned)
    }

    /// Stop the watcher for a local path. Returns whether one was running.
    pub async fn stop(&self, local_path: &str) -> bool {
        match self.watchers.remove(local_path) {
            Some((_, entry)) => {
                let _ = entry.stop_tx.send(()).await;
                tracing::info!("Stopped watcher for {}", local_path);
                true
            }
            None => false,
        }
    }

    /// Stop every watcher bound to a connection
    pub async fn stop_for_connection(&self, connection_id: &str) {
        let paths: Vec<String> = self
            .watchers
            .iter()
            .filter(|e| e.info.connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();
        for path in paths {
            self.stop(&path).await;
        }
    }

    pub fn list(&self) -> Vec<WatcherInfo> {
        self.watchers.iter().map(|e| e.info.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.watchers.len()
    }
}

impl Default for FileWatcherManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The poll loop, with the remote operations injected.
///
/// `stat` reads the watched file's change signal; when it differs from
/// the previous poll, `refresh` re-fetches the file and announces the
/// change. The first stat only records the baseline. The loop exits on
/// stop, on too many consecutive failures, or when the connection behind
/// the callbacks reports itself gone; `on_exit` runs in every case.
fn spawn_poll_loop<S, SFut, R, RFut>(
    interval: Duration,
    mut stop_rx: mpsc::Receiver<()>,
    stat: S,
    refresh: R,
    on_exit: impl FnOnce() + Send + 'static,
) where
    S: Fn() -> SFut + Send + 'static,
    SFut: Future<Output = AppResult<RemoteStat>> + Send,
    R: Fn() -> RFut + Send + 'static,
    RFut: Future<Output = AppResult<()>> + Send,
{
    tokio::spawn(async move {
        let mut last_seen: Option<RemoteStat> = None;
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = ticker.tick() => {
                    match stat().await {
                        Ok(current) => {
                            failures = 0;
                            match last_seen {
                                None => last_seen = Some(current),
                                Some(prev) if prev != current => {
                                    // the baseline only advances once the
                                    // mirror is refreshed, so a failed
                                    // download is retried on the next tick
                                    match refresh().await {
                                        Ok(()) => last_seen = Some(current),
                                        Err(e) => {
                                            tracing::warn!(
                                                "Refresh of watched file failed: {}",
                                                e
                                            );
                                            failures += 1;
                                        }
                                    }
                                }
                                Some(_) => {}
                            }
                        }
                        Err(AppError::NotConnected(_)) => {
                            tracing::debug!("Connection gone, watcher exiting");
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::debug!(
                                "Watch poll failed ({}/{}): {}",
                                failures, MAX_CONSECUTIVE_FAILURES, e
                            );
                        }
                    }

                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::warn!("Watcher giving up after {} failures", failures);
                        break;
                    }
                }
            }
        }

        on_exit();
    });
}
