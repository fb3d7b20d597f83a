//! A single SSH connection and its transport worker.
//!
//! The libssh2 session is owned by exactly one OS thread for its whole
//! life. Callers never touch it: they send [`TransportRequest`]s down a
//! bounded queue and await a reply. The queue doubles as the serialization
//! point for channel opens, so concurrent callers line up FIFO instead of
//! racing the server's channel limit.

use crate::error::{AppError, AppResult};
use crate::events::{Event, EventBus};
use crate::monitor::{MonitorHandle, NetworkHistory, SystemInfo};
use crate::sftp::{self, FileNode, RemoteStat, UploadSource};
use crate::ssh::exec::{self, CommandOutput};
use crate::ssh::shell::{self, PumpOutcome, ShellOptions, ShellState};
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::Session;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Depth of the transport request queue
const REQUEST_QUEUE_DEPTH: usize = 256;

/// Requests drained per worker loop iteration, so a burst cannot starve
/// the shell pump
const MAX_REQUESTS_PER_ITERATION: usize = 32;

/// Worker idle sleep when no shell is open
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Worker sleep between iterations while a shell is live
const SHELL_SLEEP: Duration = Duration::from_millis(2);

/// Blocking-call timeout set on the libssh2 session
const SESSION_OP_TIMEOUT_MS: u32 = 30_000;

/// How a connection authenticates. The shape makes an inconsistent
/// credential set unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum AuthMethod {
    Password { password: String },
    Key { key: KeySource },
}

/// Where key material comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeySource {
    /// Path to a private key file on the local machine
    Path(String),
    /// Key material passed directly
    Content(String),
}

/// Parameters for establishing a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Caller-supplied id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

fn default_port() -> u16 {
    22
}

impl ConnectionConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::Config("Host must not be empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::Config("Username must not be empty".into()));
        }
        match &self.auth {
            AuthMethod::Password { password } if password.is_empty() => {
                Err(AppError::Config("Password must not be empty".into()))
            }
            AuthMethod::Key { key: KeySource::Path(p) } if p.trim().is_empty() => {
                Err(AppError::Config("Key path must not be empty".into()))
            }
            AuthMethod::Key { key: KeySource::Content(c) } if c.trim().is_empty() => {
                Err(AppError::Config("Key content must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Cancelled,
}

impl ConnectionStatus {
    /// Legal transitions: connecting may resolve to connected, failed, or
    /// cancelled; an established connection may only disconnect or fail.
    /// Terminal states never change.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Cancelled)
                | (Connected, Disconnected)
                | (Connected, Failed)
        )
    }
}

/// Progress of an in-flight connect, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectStep {
    Idle,
    Tcp,
    Handshake,
    Auth,
    Ready,
}

impl ConnectStep {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectStep::Tcp,
            2 => ConnectStep::Handshake,
            3 => ConnectStep::Auth,
            4 => ConnectStep::Ready,
            _ => ConnectStep::Idle,
        }
    }
}

/// Serializable snapshot of a connection's state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub status: ConnectionStatus,
    pub connect_step: ConnectStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    pub system_info: SystemInfo,
    pub shell_open: bool,
}

/// A request executed on the transport worker thread. Replies travel back
/// over oneshot channels; requests without a reply channel are
/// fire-and-forget.
pub(crate) enum TransportRequest {
    Exec {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<AppResult<CommandOutput>>,
    },
    OpenShell {
        options: ShellOptions,
        reply: oneshot::Sender<AppResult<()>>,
    },
    ShellWrite {
        data: Vec<u8>,
        reply: oneshot::Sender<AppResult<()>>,
    },
    ShellResize {
        rows: u32,
        cols: u32,
    },
    CloseShell {
        reply: oneshot::Sender<()>,
    },
    FileList {
        path: String,
        reply: oneshot::Sender<AppResult<Vec<FileNode>>>,
    },
    Upload {
        source: UploadSource,
        remote_path: String,
        reply: oneshot::Sender<AppResult<u64>>,
    },
    Download {
        remote_path: String,
        local_path: PathBuf,
        reply: oneshot::Sender<AppResult<u64>>,
    },
    StatRemote {
        path: String,
        reply: oneshot::Sender<AppResult<RemoteStat>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Flow {
    Continue,
    Shutdown,
}

/// Shared handle to one connection. Cheap to clone behind an [`Arc`];
/// everything mutable is interior and lock-ordered (no lock is held
/// across an await).
pub struct Connection {
    pub id: String,
    pub config: ConnectionConfig,
    status: RwLock<ConnectionStatus>,
    connect_step: AtomicU8,
    cancel_requested: AtomicBool,
    shell_open: AtomicBool,
    error_message: RwLock<Option<String>>,
    fingerprint: RwLock<Option<String>>,
    connected_at: RwLock<Option<i64>>,
    last_activity: RwLock<Option<i64>>,
    cwd: RwLock<Option<String>>,
    current_command: RwLock<Option<String>>,
    system_info: RwLock<SystemInfo>,
    network_history: RwLock<NetworkHistory>,
    terminal_scrollback: Mutex<Vec<u8>>,
    scrollback_limit: usize,
    keepalive_interval: Duration,
    request_tx: RwLock<Option<mpsc::Sender<TransportRequest>>>,
    monitor: Mutex<Option<MonitorHandle>>,
    events: Arc<EventBus>,
}

impl Connection {
    pub(crate) fn new(
        id: String,
        config: ConnectionConfig,
        events: Arc<EventBus>,
        keepalive_interval: Duration,
        scrollback_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            status: RwLock::new(ConnectionStatus::Connecting),
            connect_step: AtomicU8::new(0),
            cancel_requested: AtomicBool::new(false),
            shell_open: AtomicBool::new(false),
            error_message: RwLock::new(None),
            fingerprint: RwLock::new(None),
            connected_at: RwLock::new(None),
            last_activity: RwLock::new(None),
            cwd: RwLock::new(None),
            current_command: RwLock::new(None),
            system_info: RwLock::new(SystemInfo::default()),
            network_history: RwLock::new(NetworkHistory::default()),
            terminal_scrollback: Mutex::new(Vec::new()),
            scrollback_limit,
            keepalive_interval,
            request_tx: RwLock::new(None),
            monitor: Mutex::new(None),
            events,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Apply a status transition; illegal transitions are ignored and
    /// logged. Returns whether the transition was applied.
    pub(crate) fn transition(&self, next: ConnectionStatus) -> bool {
        let mut status = self.status.write();
        if status.can_transition_to(next) {
            tracing::debug!("Connection {}: {:?} -> {:?}", self.id, *status, next);
            *status = next;
            true
        } else {
            tracing::debug!(
                "Connection {}: ignoring transition {:?} -> {:?}",
                self.id,
                *status,
                next
            );
            false
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failure(&self, message: String) {
        *self.error_message.write() = Some(message);
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            status: self.status(),
            connect_step: ConnectStep::from_u8(self.connect_step.load(Ordering::SeqCst)),
            error_message: self.error_message.read().clone(),
            fingerprint: self.fingerprint.read().clone(),
            connected_at: *self.connected_at.read(),
            last_activity: *self.last_activity.read(),
            current_working_directory: self.cwd.read().clone(),
            current_command: self.current_command.read().clone(),
            system_info: self.system_info.read().clone(),
            shell_open: self.shell_open.load(Ordering::SeqCst),
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        self.system_info.read().clone()
    }

    pub fn network_history(&self) -> NetworkHistory {
        *self.network_history.read()
    }

    pub(crate) fn set_telemetry(&self, info: SystemInfo, history: NetworkHistory) {
        *self.system_info.write() = info;
        *self.network_history.write() = history;
    }

    pub(crate) fn set_monitor(&self, handle: MonitorHandle) {
        *self.monitor.lock() = Some(handle);
    }

    pub(crate) async fn stop_monitor(&self) {
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Scrollback replay for a caller attaching to an existing shell
    pub fn terminal_scrollback(&self) -> Vec<u8> {
        self.terminal_scrollback.lock().clone()
    }

    fn push_scrollback(&self, data: &[u8]) {
        let mut buf = self.terminal_scrollback.lock();
        buf.extend_from_slice(data);
        if buf.len() > self.scrollback_limit {
            let excess = buf.len() - self.scrollback_limit;
            buf.drain(..excess);
        }
    }

    fn touch(&self) {
        *self.last_activity.write() = Some(chrono::Utc::now().timestamp());
    }

    // ---- async request surface -------------------------------------------

    fn sender(&self) -> AppResult<mpsc::Sender<TransportRequest>> {
        if self.status() != ConnectionStatus::Connected {
            return Err(AppError::NotConnected(format!(
                "Connection {} is not connected",
                self.id
            )));
        }
        self.request_tx
            .read()
            .clone()
            .ok_or_else(|| AppError::NotConnected(format!("Connection {} has no transport", self.id)))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> TransportRequest,
    ) -> AppResult<T> {
        let tx = self.sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(build(reply_tx))
            .await
            .map_err(|_| AppError::NotConnected(format!("Connection {} transport closed", self.id)))?;
        reply_rx
            .await
            .map_err(|_| AppError::NotConnected(format!("Connection {} transport closed", self.id)))?
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> AppResult<CommandOutput> {
        let command = command.to_string();
        self.request(move |reply| TransportRequest::Exec {
            command,
            timeout,
            reply,
        })
        .await
    }

    pub async fn open_shell(&self, options: ShellOptions) -> AppResult<()> {
        self.request(move |reply| TransportRequest::OpenShell { options, reply })
            .await
    }

    pub async fn shell_write(&self, data: Vec<u8>) -> AppResult<()> {
        self.request(move |reply| TransportRequest::ShellWrite { data, reply })
            .await
    }

    pub async fn shell_resize(&self, rows: u32, cols: u32) -> AppResult<()> {
        let tx = self.sender()?;
        tx.send(TransportRequest::ShellResize { rows, cols })
            .await
            .map_err(|_| AppError::NotConnected(format!("Connection {} transport closed", self.id)))
    }

    pub async fn close_shell(&self) -> AppResult<()> {
        let tx = self.sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(TransportRequest::CloseShell { reply: reply_tx })
            .await
            .map_err(|_| AppError::NotConnected(format!("Connection {} transport closed", self.id)))?;
        let _ = reply_rx.await;
        Ok(())
    }

    pub async fn file_list(&self, path: &str) -> AppResult<Vec<FileNode>> {
        let path = path.to_string();
        self.request(move |reply| TransportRequest::FileList { path, reply })
            .await
    }

    pub async fn upload(&self, source: UploadSource, remote_path: &str) -> AppResult<u64> {
        let remote_path = remote_path.to_string();
        self.request(move |reply| TransportRequest::Upload {
            source,
            remote_path,
            reply,
        })
        .await
    }

    pub async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<u64> {
        let remote_path = remote_path.to_string();
        let local_path = local_path.to_path_buf();
        self.request(move |reply| TransportRequest::Download {
            remote_path,
            local_path,
            reply,
        })
        .await
    }

    pub async fn stat_remote(&self, path: &str) -> AppResult<RemoteStat> {
        let path = path.to_string();
        self.request(move |reply| TransportRequest::StatRemote { path, reply })
            .await
    }

    /// Ask the worker to tear down and wait for it to finish. Safe to call
    /// in any state; a worker that never reached its serve loop simply
    /// drops the request.
    pub(crate) async fn shutdown_transport(&self) {
        let tx = self.request_tx.write().take();
        let Some(tx) = tx else { return };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(TransportRequest::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(Duration::from_secs(5), reply_rx).await;
        }
    }

    // ---- worker thread ---------------------------------------------------

    /// Spawn the transport worker. `ready` resolves once the session is
    /// authenticated (or with the failure that stopped it).
    pub(crate) fn spawn_worker(
        self: &Arc<Self>,
        ready: oneshot::Sender<AppResult<()>>,
    ) -> AppResult<()> {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        *self.request_tx.write() = Some(tx);

        let conn = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("ssh-{}", self.id))
            .spawn(move || match conn.connect_blocking() {
                Ok(session) => {
                    conn.transition(ConnectionStatus::Connected);
                    *conn.connected_at.write() = Some(chrono::Utc::now().timestamp());
                    let _ = ready.send(Ok(()));
                    conn.serve(session, rx);
                }
                Err(e) => {
                    if conn.cancel_requested() {
                        conn.transition(ConnectionStatus::Cancelled);
                    } else {
                        conn.set_failure(e.to_string());
                        conn.transition(ConnectionStatus::Failed);
                    }
                    let _ = ready.send(Err(e));
                }
            })
            .map_err(|e| AppError::Unknown(format!("Failed to spawn transport worker: {}", e)))?;

        Ok(())
    }

    fn check_cancelled(&self) -> AppResult<()> {
        if self.cancel_requested() {
            Err(AppError::Ssh("Connection attempt cancelled".into()))
        } else {
            Ok(())
        }
    }

    fn connect_blocking(&self) -> AppResult<Session> {
        let config = &self.config;

        self.connect_step.store(1, Ordering::SeqCst);
        tracing::info!(
            "Connecting to {}@{}:{}",
            config.username,
            config.host,
            config.port
        );

        let addrs: Vec<_> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                AppError::NetworkUnreachable(format!(
                    "Could not resolve {}: {}",
                    config.host, e
                ))
            })?
            .collect();
        let addr = addrs.first().ok_or_else(|| {
            AppError::NetworkUnreachable(format!("No addresses for {}", config.host))
        })?;

        let tcp = TcpStream::connect_timeout(addr, Duration::from_secs(10)).map_err(|e| {
            AppError::NetworkUnreachable(format!(
                "TCP connect to {}:{} failed: {}",
                config.host, config.port, e
            ))
        })?;
        let _ = tcp.set_nodelay(true);

        self.check_cancelled()?;
        self.connect_step.store(2, Ordering::SeqCst);

        let mut session = Session::new().map_err(|e| AppError::Ssh(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SESSION_OP_TIMEOUT_MS);
        session
            .handshake()
            .map_err(|e| AppError::Ssh(format!("SSH handshake failed: {}", e)))?;
        session.set_keepalive(true, self.keepalive_interval.as_secs() as u32);

        if let Some(key) = session.host_key() {
            let digest = Sha256::digest(key.0);
            let fingerprint = format!(
                "SHA256:{}",
                base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
            );
            tracing::info!("Host key fingerprint for {}: {}", config.host, fingerprint);
            *self.fingerprint.write() = Some(fingerprint);
        }

        self.check_cancelled()?;
        self.connect_step.store(3, Ordering::SeqCst);

        self.authenticate(&session)?;
        if !session.authenticated() {
            return Err(AppError::AuthFailure("Authentication incomplete".into()));
        }

        self.check_cancelled()?;
        self.connect_step.store(4, Ordering::SeqCst);

        // Starting directory is informational; a host without pwd just
        // leaves it unset
        if let Ok(output) = exec::run_command(&session, "pwd", Duration::from_secs(10)) {
            let cwd = output.stdout.trim();
            if !cwd.is_empty() {
                *self.cwd.write() = Some(cwd.to_string());
            }
        }

        tracing::info!("Connection {} established", self.id);
        Ok(session)
    }

    fn authenticate(&self, session: &Session) -> AppResult<()> {
        let config = &self.config;
        match &config.auth {
            AuthMethod::Password { password } => session
                .userauth_password(&config.username, password)
                .map_err(|e| AppError::AuthFailure(format!("Password auth failed: {}", e))),
            AuthMethod::Key { key } => {
                let key_path = match key {
                    KeySource::Path(path) => expand_tilde(path),
                    KeySource::Content(content) => {
                        // libssh2 wants a file; stage the material in a
                        // private temp file for the duration of auth
                        let staged = tempfile_for_key(content)?;
                        let path = staged.path().to_path_buf();
                        let result = session
                            .userauth_pubkey_file(&config.username, None, &path, None)
                            .map_err(|e| {
                                AppError::AuthFailure(format!("Key auth failed: {}", e))
                            });
                        drop(staged);
                        return result;
                    }
                };
                session
                    .userauth_pubkey_file(&config.username, None, &key_path, None)
                    .map_err(|e| AppError::AuthFailure(format!("Key auth failed: {}", e)))
            }
        }
    }

    fn serve(self: &Arc<Self>, session: Session, mut rx: mpsc::Receiver<TransportRequest>) {
        let mut sftp: Option<ssh2::Sftp> = None;
        let mut shell: Option<ShellState> = None;
        let mut last_keepalive = Instant::now();

        loop {
            if last_keepalive.elapsed() >= self.keepalive_interval {
                if let Err(e) = session.keepalive_send() {
                    tracing::warn!("Keepalive on {} failed: {}", self.id, e);
                }
                last_keepalive = Instant::now();
            }

            let mut shutdown = false;
            for _ in 0..MAX_REQUESTS_PER_ITERATION {
                match rx.try_recv() {
                    Ok(req) => {
                        if let Flow::Shutdown =
                            self.handle_request(req, &session, &mut sftp, &mut shell)
                        {
                            shutdown = true;
                            break;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        shutdown = true;
                        break;
                    }
                }
            }
            if shutdown {
                break;
            }

            if let Some(state) = shell.as_mut() {
                let mut sink = |data: &[u8]| {
                    self.push_scrollback(data);
                    self.events.emit(Event::TerminalData {
                        connection_id: self.id.clone(),
                        data: data.to_vec(),
                    });
                };
                match shell::pump(state, &session, &mut sink) {
                    PumpOutcome::Idle => std::thread::sleep(SHELL_SLEEP),
                    PumpOutcome::Activity => {
                        self.touch();
                    }
                    PumpOutcome::Closed => {
                        tracing::info!("Shell on {} closed by remote", self.id);
                        if let Some(state) = shell.take() {
                            state.close(&session);
                        }
                        self.shell_open.store(false, Ordering::SeqCst);
                        self.events.emit(Event::TerminalClose {
                            connection_id: self.id.clone(),
                            reason: "remote closed the stream".to_string(),
                        });
                    }
                    PumpOutcome::Fatal(message) => {
                        tracing::error!("Transport fault on {}: {}", self.id, message);
                        shell = None;
                        self.shell_open.store(false, Ordering::SeqCst);
                        self.events.emit(Event::TerminalError {
                            connection_id: self.id.clone(),
                            message: message.clone(),
                        });
                        self.set_failure(message);
                        self.transition(ConnectionStatus::Failed);
                        break;
                    }
                }
            } else {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        if let Some(state) = shell.take() {
            state.close(&session);
            self.shell_open.store(false, Ordering::SeqCst);
            self.events.emit(Event::TerminalClose {
                connection_id: self.id.clone(),
                reason: "connection closed".to_string(),
            });
        }
        drop(sftp);
        let _ = session.disconnect(None, "closing", None);
        tracing::info!("Transport worker for {} exited", self.id);
    }

    fn handle_request(
        &self,
        req: TransportRequest,
        session: &Session,
        sftp: &mut Option<ssh2::Sftp>,
        shell: &mut Option<ShellState>,
    ) -> Flow {
        match req {
            TransportRequest::Exec {
                command,
                timeout,
                reply,
            } => {
                *self.current_command.write() = Some(command.clone());
                let result = exec::run_command(session, &command, timeout);
                *self.current_command.write() = None;
                self.touch();
                let _ = reply.send(result);
            }
            TransportRequest::OpenShell { options, reply } => {
                let result = if shell.is_some() {
                    Err(AppError::Ssh(format!(
                        "Connection {} already has a shell",
                        self.id
                    )))
                } else {
                    shell::open(session, &options).map(|state| {
                        *shell = Some(state);
                        self.shell_open.store(true, Ordering::SeqCst);
                        self.terminal_scrollback.lock().clear();
                    })
                };
                let _ = reply.send(result);
            }
            TransportRequest::ShellWrite { data, reply } => {
                let result = match shell.as_mut() {
                    Some(state) => state.enqueue(&data),
                    None => Err(AppError::Ssh(format!(
                        "Connection {} has no open shell",
                        self.id
                    ))),
                };
                let _ = reply.send(result);
            }
            TransportRequest::ShellResize { rows, cols } => {
                if let Some(state) = shell.as_mut() {
                    state.resize(rows, cols);
                }
            }
            TransportRequest::CloseShell { reply } => {
                if let Some(state) = shell.take() {
                    state.close(session);
                    self.shell_open.store(false, Ordering::SeqCst);
                    self.events.emit(Event::TerminalClose {
                        connection_id: self.id.clone(),
                        reason: "closed by caller".to_string(),
                    });
                }
                let _ = reply.send(());
            }
            TransportRequest::FileList { path, reply } => {
                let result =
                    ensure_sftp(session, sftp).and_then(|s| sftp::list_dir(s, &path));
                self.touch();
                let _ = reply.send(result);
            }
            TransportRequest::Upload {
                source,
                remote_path,
                reply,
            } => {
                let result =
                    ensure_sftp(session, sftp).and_then(|s| sftp::upload(s, &source, &remote_path));
                self.touch();
                let _ = reply.send(result);
            }
            TransportRequest::Download {
                remote_path,
                local_path,
                reply,
            } => {
                let result = ensure_sftp(session, sftp)
                    .and_then(|s| sftp::download(s, &remote_path, &local_path));
                self.touch();
                let _ = reply.send(result);
            }
            TransportRequest::StatRemote { path, reply } => {
                let result =
                    ensure_sftp(session, sftp).and_then(|s| sftp::stat_remote(s, &path));
                let _ = reply.send(result);
            }
            TransportRequest::Shutdown { reply } => {
                let _ = reply.send(());
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }
}

/// Open the SFTP subsystem on first use and keep it for the connection's
/// lifetime
fn ensure_sftp<'a>(session: &Session, sftp: &'a mut Option<ssh2::Sftp>) -> AppResult<&'a ssh2::Sftp> {
    if sftp.is_none() {
        let subsystem = session
            .sftp()
            .map_err(|e| AppError::Ssh(format!("Failed to open SFTP subsystem: {}", e)))?;
        *sftp = Some(subsystem);
    }
    Ok(sftp.as_ref().unwrap())
}

/// Expand a leading `~/` against the local home directory
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn tempfile_for_key(content: &str) -> AppResult<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| AppError::Io(e))?;
    file.write_all(content.as_bytes())?;
    if !content.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(file.path(), perms)?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            id: None,
            name: "test".to_string(),
            host: "example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth: AuthMethod::Password {
                password: "hunter2".to_string(),
            },
        }
    }

    fn test_connection() -> Arc<Connection> {
        Connection::new(
            "c1".to_string(),
            test_config(),
            Arc::new(EventBus::new()),
            Duration::from_secs(20),
            1024,
        )
    }

    #[test]
    fn test_status_transitions() {
        use ConnectionStatus::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connecting.can_transition_to(Cancelled));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Failed));

        assert!(!Connecting.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Cancelled));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Cancelled.can_transition_to(Connected));
    }

    #[test]
    fn test_illegal_transition_ignored() {
        let conn = test_connection();
        assert_eq!(conn.status(), ConnectionStatus::Connecting);

        assert!(!conn.transition(ConnectionStatus::Disconnected));
        assert_eq!(conn.status(), ConnectionStatus::Connecting);

        assert!(conn.transition(ConnectionStatus::Failed));
        assert!(!conn.transition(ConnectionStatus::Connected));
        assert_eq!(conn.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn test_config_validation() {
        assert!(test_config().validate().is_ok());

        let mut config = test_config();
        config.host = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.auth = AuthMethod::Password {
            password: String::new(),
        };
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.auth = AuthMethod::Key {
            key: KeySource::Path(String::new()),
        };
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.auth = AuthMethod::Key {
            key: KeySource::Path("~/.ssh/id_ed25519".to_string()),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auth_method_serde_shape() {
        let json = r#"{"method": "password", "password": "hunter2"}"#;
        let auth: AuthMethod = serde_json::from_str(json).unwrap();
        assert!(matches!(auth, AuthMethod::Password { .. }));

        let json = r#"{"method": "key", "key": {"path": "~/.ssh/id_rsa"}}"#;
        let auth: AuthMethod = serde_json::from_str(json).unwrap();
        match auth {
            AuthMethod::Key {
                key: KeySource::Path(p),
            } => assert_eq!(p, "~/.ssh/id_rsa"),
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_requests_rejected_when_not_connected() {
        let conn = test_connection();
        let err = conn.sender().unwrap_err();
        assert!(matches!(err, AppError::NotConnected(_)));
    }

    #[test]
    fn test_scrollback_bounded() {
        let conn = test_connection();
        conn.push_scrollback(&[b'a'; 700]);
        conn.push_scrollback(&[b'b'; 700]);

        let buf = conn.terminal_scrollback();
        assert_eq!(buf.len(), 1024);
        // oldest bytes were evicted
        assert_eq!(buf[0], b'a');
        assert_eq!(buf[buf.len() - 1], b'b');
        assert_eq!(buf.iter().filter(|&&b| b == b'b').count(), 700);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/.ssh/id_rsa");
        assert!(!expanded.to_string_lossy().starts_with('~'));

        let absolute = expand_tilde("/etc/key");
        assert_eq!(absolute, PathBuf::from("/etc/key"));
    }

    #[test]
    fn test_info_snapshot() {
        let conn = test_connection();
        let info = conn.info();
        assert_eq!(info.id, "c1");
        assert_eq!(info.status, ConnectionStatus::Connecting);
        assert_eq!(info.connect_step, ConnectStep::Idle);
        assert!(!info.shell_open);
        assert!(info.error_message.is_none());
    }
}
