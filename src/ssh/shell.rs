//! Interactive PTY shell on a connection.
//!
//! One shell per connection. The transport worker pumps the channel each
//! loop iteration: drains remote output into the event stream and feeds
//! queued input back in chunks. Writes land in a bounded pending buffer;
//! a full buffer is a backpressure failure surfaced to the writer rather
//! than silent loss.

use crate::error::{AppError, AppResult};
use crate::ssh::exec::{is_recoverable_error, open_channel_with_retry};
use serde::Deserialize;
use ssh2::{Channel, ExtendedData, Session};
use std::io::{Read, Write};

/// Upper bound on buffered-but-unwritten input bytes
pub(crate) const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Input is fed to the channel in chunks so a large paste cannot starve
/// the output side of the pump
const WRITE_CHUNK_BYTES: usize = 4096;

const READ_BUF_BYTES: usize = 32 * 1024;

/// PTY geometry and terminal type for a new shell
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOptions {
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_term")]
    pub term: String,
}

fn default_rows() -> u32 {
    24
}

fn default_cols() -> u32 {
    80
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            term: default_term(),
        }
    }
}

/// Live shell state owned by the transport worker
pub(crate) struct ShellState {
    channel: Channel,
    pending: Vec<u8>,
}

/// What one pump iteration observed
pub(crate) enum PumpOutcome {
    /// Nothing moved
    Idle,
    /// Bytes were read or written
    Activity,
    /// Remote side closed the stream
    Closed,
    /// Transport fault; the connection is no longer usable
    Fatal(String),
}

/// Open a PTY shell. Extended data is merged so stderr interleaves into
/// the one output stream a terminal expects.
pub(crate) fn open(session: &Session, options: &ShellOptions) -> AppResult<ShellState> {
    let mut channel = open_channel_with_retry(session)?;

    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| AppError::Ssh(format!("Failed to merge extended data: {}", e)))?;
    channel
        .request_pty(
            &options.term,
            None,
            Some((options.cols, options.rows, 0, 0)),
        )
        .map_err(|e| AppError::Ssh(format!("Failed to request PTY: {}", e)))?;
    channel
        .shell()
        .map_err(|e| AppError::Ssh(format!("Failed to start shell: {}", e)))?;

    Ok(ShellState {
        channel,
        pending: Vec::new(),
    })
}

impl ShellState {
    /// Queue input for the next pump iterations. Fails when the buffer is
    /// full; the caller may retry once the pump has drained.
    pub fn enqueue(&mut self, data: &[u8]) -> AppResult<()> {
        if self.pending.len() + data.len() > MAX_PENDING_BYTES {
            return Err(AppError::Ssh(format!(
                "Shell write buffer full ({} bytes pending)",
                self.pending.len()
            )));
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    pub fn resize(&mut self, rows: u32, cols: u32) {
        if let Err(e) = self.channel.request_pty_size(cols, rows, None, None) {
            tracing::warn!("PTY resize to {}x{} failed: {}", cols, rows, e);
        }
    }

    /// Close the channel; errors during teardown are not actionable
    pub fn close(mut self, session: &Session) {
        session.set_blocking(true);
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
        let _ = self.channel.wait_close();
    }
}

/// One pump iteration: drain remote output through `sink`, then feed a
/// slice of pending input. Runs with the session non-blocking and
/// restores it before returning.
pub(crate) fn pump(state: &mut ShellState, session: &Session, sink: &mut dyn FnMut(&[u8])) -> PumpOutcome {
    session.set_blocking(false);
    let outcome = pump_inner(state, sink);
    session.set_blocking(true);
    outcome
}

fn pump_inner(state: &mut ShellState, sink: &mut dyn FnMut(&[u8])) -> PumpOutcome {
    let mut buf = [0u8; READ_BUF_BYTES];
    let mut activity = false;

    loop {
        match state.channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                sink(&buf[..n]);
                activity = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if is_recoverable_error(&e.to_string()) => break,
            Err(e) => return PumpOutcome::Fatal(format!("Shell read failed: {}", e)),
        }
    }

    if state.channel.eof() {
        return PumpOutcome::Closed;
    }

    if !state.pending.is_empty() {
        let chunk_len = state.pending.len().min(WRITE_CHUNK_BYTES);
        match state.channel.write(&state.pending[..chunk_len]) {
            Ok(0) => {}
            Ok(n) => {
                state.pending.drain(..n);
                activity = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if is_recoverable_error(&e.to_string()) => {}
            Err(e) => return PumpOutcome::Fatal(format!("Shell write failed: {}", e)),
        }

        if state.pending.is_empty() {
            let _ = state.channel.flush();
        }
    }

    if activity {
        PumpOutcome::Activity
    } else {
        PumpOutcome::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options: ShellOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.rows, 24);
        assert_eq!(options.cols, 80);
        assert_eq!(options.term, "xterm-256color");
    }

    #[test]
    fn test_options_deserialize_camel_case() {
        let options: ShellOptions =
            serde_json::from_str(r#"{"rows": 50, "cols": 120, "term": "vt100"}"#).unwrap();
        assert_eq!(options.rows, 50);
        assert_eq!(options.cols, 120);
        assert_eq!(options.term, "vt100");
    }
}
