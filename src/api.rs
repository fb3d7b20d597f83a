//! The caller-facing facade.
//!
//! Every operation returns an [`Envelope`]: failures travel as data, not
//! as exceptions, so a UI layer can bind the result directly. Push
//! traffic (terminal output, watched-file changes) flows through the
//! [`EventBus`] instead of return values.

use crate::ai::{self, AiConnectionConfig};
use crate::config::{get_config_dir, AppConfig, SessionData, SessionStore};
use crate::error::{AppResult, SerializableError};
use crate::events::{Event, EventBus, EventChannel};
use crate::monitor::SystemInfo;
use crate::sftp::{FileNode, UploadSource};
use crate::ssh::{
    read_ssh_key, CommandOutput, ConnectionConfig, ConnectionInfo, ConnectionManager, ShellOptions,
};
use crate::watcher::{FileWatcherManager, WatcherInfo};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Uniform operation result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializableError>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Into<SerializableError>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn from_result(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                tracing::debug!(
                    "Operation failed: {}",
                    crate::logging::sanitize(&e.to_string())
                );
                Self::err(&e)
            }
        }
    }
}

/// Result of a connect attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOutcome {
    pub connection_id: String,
}

/// Result of a download
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub local_path: String,
    pub bytes: u64,
}

/// The backend entry point. One instance serves any number of
/// connections; all methods take `&self` and may run concurrently.
pub struct Backend {
    config_dir: PathBuf,
    settings: Arc<RwLock<AppConfig>>,
    store: Mutex<SessionStore>,
    events: Arc<EventBus>,
    connections: ConnectionManager,
    watchers: FileWatcherManager,
}

impl Backend {
    pub fn new() -> AppResult<Self> {
        Self::with_config_dir(get_config_dir()?)
    }

    /// Build against an explicit config directory; tests point this at a
    /// temp dir
    pub fn with_config_dir(config_dir: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&config_dir)?;
        let settings = Arc::new(RwLock::new(AppConfig::load(&config_dir)?));
        let store = Mutex::new(SessionStore::load(&config_dir)?);
        let events = Arc::new(EventBus::new());
        let connections = ConnectionManager::new(Arc::clone(&settings), Arc::clone(&events));

        Ok(Self {
            config_dir,
            settings,
            store,
            events,
            connections,
            watchers: FileWatcherManager::new(),
        })
    }

    // ---- configuration ---------------------------------------------------

    pub fn get_config(&self) -> Envelope<AppConfig> {
        Envelope::ok(self.settings.read().clone())
    }

    pub fn save_config(&self, config: AppConfig) -> Envelope<()> {
        let result = config.save(&self.config_dir).map(|()| {
            *self.settings.write() = config;
        });
        Envelope::from_result(result)
    }

    // ---- saved sessions --------------------------------------------------

    pub fn get_sessions(&self) -> Envelope<Vec<SessionData>> {
        Envelope::ok(self.store.lock().list())
    }

    pub fn save_session(&self, data: SessionData) -> Envelope<()> {
        Envelope::from_result(self.store.lock().save(data))
    }

    pub fn delete_session(&self, id: &str) -> Envelope<()> {
        Envelope::from_result(self.store.lock().delete(id))
    }

    // ---- connections -----------------------------------------------------

    pub async fn ssh_connect(&self, config: ConnectionConfig) -> Envelope<ConnectOutcome> {
        Envelope::from_result(
            self.connections
                .connect(config)
                .await
                .map(|connection_id| ConnectOutcome { connection_id }),
        )
    }

    pub fn ssh_cancel_connect(&self, connection_id: &str) -> Envelope<()> {
        Envelope::from_result(self.connections.cancel_connect(connection_id))
    }

    pub async fn ssh_disconnect(&self, connection_id: &str) -> Envelope<()> {
        Envelope::from_result(
            self.connections
                .disconnect(connection_id, &self.watchers)
                .await,
        )
    }

    pub async fn ssh_execute(&self, connection_id: &str, command: &str) -> Envelope<CommandOutput> {
        Envelope::from_result(self.connections.execute(connection_id, command).await)
    }

    pub fn list_connections(&self) -> Envelope<Vec<ConnectionInfo>> {
        Envelope::ok(self.connections.list())
    }

    pub fn get_connection_info(&self, connection_id: &str) -> Envelope<ConnectionInfo> {
        Envelope::from_result(self.connections.get(connection_id).map(|c| c.info()))
    }

    pub fn get_system_info(&self, connection_id: &str) -> Envelope<SystemInfo> {
        Envelope::from_result(self.connections.get(connection_id).map(|c| c.system_info()))
    }

    pub fn read_key_file(&self, path: &str) -> Envelope<String> {
        Envelope::from_result(read_ssh_key(path))
    }

    // ---- shell -----------------------------------------------------------

    pub async fn create_shell(
        &self,
        connection_id: &str,
        options: ShellOptions,
    ) -> Envelope<()> {
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.open_shell(options).await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    pub async fn shell_write(&self, connection_id: &str, data: Vec<u8>) -> Envelope<()> {
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.shell_write(data).await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    pub async fn shell_resize(&self, connection_id: &str, rows: u32, cols: u32) -> Envelope<()> {
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.shell_resize(rows, cols).await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    pub async fn shell_close(&self, connection_id: &str) -> Envelope<()> {
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.close_shell().await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    /// Buffered output replay for a caller re-attaching to a shell
    pub fn shell_scrollback(&self, connection_id: &str) -> Envelope<Vec<u8>> {
        Envelope::from_result(
            self.connections
                .get(connection_id)
                .map(|c| c.terminal_scrollback()),
        )
    }

    // ---- files -----------------------------------------------------------

    pub async fn get_file_list(&self, connection_id: &str, path: &str) -> Envelope<Vec<FileNode>> {
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.file_list(path).await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    /// Upload a local file to the remote path
    pub async fn upload_file(
        &self,
        connection_id: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Envelope<u64> {
        let source = UploadSource::LocalPath(PathBuf::from(local_path));
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.upload(source, remote_path).await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    /// Upload bytes handed over directly (drag-and-drop)
    pub async fn upload_dropped_file(
        &self,
        connection_id: &str,
        data: Vec<u8>,
        remote_path: &str,
    ) -> Envelope<u64> {
        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.upload(UploadSource::Blob(data), remote_path).await,
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    /// Upload a file the caller already picked. The picker dialog itself
    /// lives in the caller; this backend only receives the chosen path.
    pub async fn select_and_upload_file(
        &self,
        connection_id: &str,
        picked_path: &str,
        remote_dir: &str,
    ) -> Envelope<u64> {
        let file_name = Path::new(picked_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| picked_path.to_string());
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), file_name);
        self.upload_file(connection_id, picked_path, &remote_path)
            .await
    }

    /// Download a remote file into a per-download staging directory and
    /// return where it landed
    pub async fn download_file(
        &self,
        connection_id: &str,
        remote_path: &str,
    ) -> Envelope<DownloadOutcome> {
        let file_name = Path::new(remote_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let local_path = std::env::temp_dir()
            .join("seamux-downloads")
            .join(Uuid::new_v4().simple().to_string())
            .join(file_name);

        let result = match self.connections.get(connection_id) {
            Ok(conn) => conn.download(remote_path, &local_path).await.map(|bytes| {
                DownloadOutcome {
                    local_path: local_path.to_string_lossy().to_string(),
                    bytes,
                }
            }),
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    /// Download and hand the file to the platform's default opener
    pub async fn download_and_open_file(
        &self,
        connection_id: &str,
        remote_path: &str,
    ) -> Envelope<DownloadOutcome> {
        let envelope = self.download_file(connection_id, remote_path).await;
        if let Some(outcome) = &envelope.data {
            if let Err(e) = open::that(&outcome.local_path) {
                tracing::warn!("Opening {} failed: {}", outcome.local_path, e);
                return Envelope::err(&crate::error::AppError::Unknown(format!(
                    "Downloaded to {} but opening it failed: {}",
                    outcome.local_path, e
                )));
            }
        }
        envelope
    }

    // ---- watchers --------------------------------------------------------

    pub fn start_file_watcher(
        &self,
        connection_id: &str,
        remote_path: &str,
        local_path: &str,
    ) -> Envelope<WatcherInfo> {
        let interval = Duration::from_secs(self.settings.read().watch_interval_secs);
        let result = match self.connections.get(connection_id) {
            Ok(conn) => self.watchers.start(
                conn,
                Arc::clone(&self.events),
                remote_path,
                local_path,
                interval,
            ),
            Err(e) => Err(e),
        };
        Envelope::from_result(result)
    }

    pub async fn stop_file_watcher(&self, local_path: &str) -> Envelope<bool> {
        Envelope::ok(self.watchers.stop(local_path).await)
    }

    pub fn list_file_watchers(&self) -> Envelope<Vec<WatcherInfo>> {
        Envelope::ok(self.watchers.list())
    }

    // ---- AI probe --------------------------------------------------------

    pub async fn test_ai_connection(&self, config: AiConnectionConfig) -> Envelope<()> {
        Envelope::from_result(ai::test_connection(&config).await)
    }

    // ---- events ----------------------------------------------------------

    pub fn subscribe(&self, channel: EventChannel) -> (String, mpsc::Receiver<Event>) {
        self.events.subscribe(channel)
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.events.unsubscribe(subscription_id);
    }

    pub fn unsubscribe_all(&self, channel: EventChannel) {
        self.events.unsubscribe_all(channel);
    }

    /// Shut everything down; used when the host application exits
    pub async fn shutdown(&self) {
        self.connections.disconnect_all(&self.watchers).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::AuthMethod;

    fn backend() -> (Backend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::with_config_dir(dir.path().to_path_buf()).unwrap();
        (backend, dir)
    }

    #[test]
    fn test_envelope_shapes() {
        let ok = Envelope::ok(42);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json.get("error").is_none());

        let err: Envelope<i32> =
            Envelope::from_result(Err(crate::error::AppError::NotConnected("c1".into())));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
        assert_eq!(json["error"]["code"], "NOT_CONNECTED");
    }

    #[test]
    fn test_config_roundtrip_through_backend() {
        let (backend, _dir) = backend();

        let mut config = backend.get_config().data.unwrap();
        config.monitor_interval_secs = 9;
        assert!(backend.save_config(config).success);

        assert_eq!(backend.get_config().data.unwrap().monitor_interval_secs, 9);
    }

    #[test]
    fn test_session_crud() {
        let (backend, _dir) = backend();

        let data = SessionData::new(
            "prod".to_string(),
            "example.com".to_string(),
            "deploy".to_string(),
            AuthMethod::Password {
                password: "hunter2".to_string(),
            },
        );
        let id = data.id.clone();

        assert!(backend.save_session(data).success);
        assert_eq!(backend.get_sessions().data.unwrap().len(), 1);

        assert!(backend.delete_session(&id).success);
        assert!(backend.get_sessions().data.unwrap().is_empty());

        // deleting again reports the failure in the envelope
        let envelope = backend.delete_session(&id);
        assert!(!envelope.success);
        assert!(envelope.error.is_some());
    }

    #[tokio::test]
    async fn test_operations_on_unknown_connection_fail_cleanly() {
        let (backend, _dir) = backend();

        assert!(!backend.ssh_execute("nope", "ls").await.success);
        assert!(!backend.create_shell("nope", ShellOptions::default()).await.success);
        assert!(!backend.get_file_list("nope", "/").await.success);
        assert!(!backend.upload_file("nope", "/tmp/a", "/srv/a").await.success);
        assert!(!backend.download_file("nope", "/srv/a").await.success);
        assert!(!backend.start_file_watcher("nope", "/srv/a", "/tmp/a").success);
        assert!(!backend.ssh_cancel_connect("nope").success);

        // disconnect stays idempotent even for unknown ids
        assert!(backend.ssh_disconnect("nope").await.success);
    }

    #[tokio::test]
    async fn test_connect_failure_lands_in_envelope() {
        let (backend, _dir) = backend();

        let config = ConnectionConfig {
            id: None,
            name: "bad".to_string(),
            host: String::new(),
            port: 22,
            username: "root".to_string(),
            auth: AuthMethod::Password {
                password: "x".to_string(),
            },
        };
        let envelope = backend.ssh_connect(config).await;
        assert!(!envelope.success);
        assert_eq!(envelope.error.unwrap().code, "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_event_subscription_through_backend() {
        let (backend, _dir) = backend();

        let (id, mut rx) = backend.subscribe(EventChannel::TerminalData);
        backend.events.emit(Event::TerminalData {
            connection_id: "c1".to_string(),
            data: b"hi".to_vec(),
        });
        assert!(rx.recv().await.is_some());

        backend.unsubscribe(&id);
        assert_eq!(backend.events.subscriber_count(EventChannel::TerminalData), 0);
    }

    #[test]
    fn test_list_connections_empty() {
        let (backend, _dir) = backend();
        assert!(backend.list_connections().data.unwrap().is_empty());
    }
}
