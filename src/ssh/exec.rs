//! Command execution over an established session.
//!
//! Runs on the connection's transport worker thread; the session is
//! flipped to non-blocking for the read loop and always restored before
//! returning.

use crate::error::{AppError, AppResult};
use serde::Serialize;
use ssh2::{Channel, ErrorCode, Session};
use std::io::Read;
use std::time::{Duration, Instant};

/// Attempts at opening a channel before reporting exhaustion
const CHANNEL_OPEN_RETRIES: u32 = 3;

// libssh2 session error codes
const LIBSSH2_ERROR_CHANNEL_FAILURE: i32 = -21;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Result of a completed remote command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Open a session channel, retrying briefly when the server is at its
/// concurrent-channel limit.
pub(crate) fn open_channel_with_retry(session: &Session) -> AppResult<Channel> {
    let mut attempt = 0;
    loop {
        match session.channel_session() {
            Ok(channel) => return Ok(channel),
            Err(e) if is_channel_contention(&e) => {
                attempt += 1;
                if attempt > CHANNEL_OPEN_RETRIES {
                    return Err(AppError::ChannelLimitExceeded(format!(
                        "Channel open failed after {} attempts: {}",
                        attempt, e
                    )));
                }
                std::thread::sleep(Duration::from_millis(50 * attempt as u64));
            }
            Err(e) => return Err(AppError::Ssh(format!("Failed to open channel: {}", e))),
        }
    }
}

fn is_channel_contention(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Session(LIBSSH2_ERROR_CHANNEL_FAILURE)
            | ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)
    )
}

/// Transient conditions the shell and exec read loops ride out
pub(crate) fn is_recoverable_error(err_str: &str) -> bool {
    let lowered = err_str.to_lowercase();
    lowered.contains("would block")
        || lowered.contains("wouldblock")
        || lowered.contains("eagain")
        || lowered.contains("timed out")
        || lowered.contains("interrupted")
}

/// Run a command and collect stdout/stderr until EOF or the deadline.
///
/// On timeout the channel is torn down so the remote process does not
/// keep a channel slot occupied.
pub(crate) fn run_command(
    session: &Session,
    command: &str,
    timeout: Duration,
) -> AppResult<CommandOutput> {
    let mut channel = open_channel_with_retry(session)?;
    channel
        .exec(command)
        .map_err(|e| AppError::Ssh(format!("Failed to start command: {}", e)))?;

    session.set_blocking(false);
    let result = collect_output(session, &mut channel, timeout);
    session.set_blocking(true);

    let (stdout, stderr) = result?;

    let _ = channel.close();
    let _ = channel.wait_close();
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

fn collect_output(
    session: &Session,
    channel: &mut Channel,
    timeout: Duration,
) -> AppResult<(Vec<u8>, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let mut progressed = false;

        match channel.stream(0).read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                stdout.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if is_recoverable_error(&e.to_string()) => {}
            Err(e) => {
                session.set_blocking(true);
                let _ = channel.close();
                return Err(AppError::Ssh(format!("Read failed: {}", e)));
            }
        }

        match channel.stream(1).read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                stderr.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if is_recoverable_error(&e.to_string()) => {}
            Err(e) => {
                session.set_blocking(true);
                let _ = channel.close();
                return Err(AppError::Ssh(format!("Stderr read failed: {}", e)));
            }
        }

        if channel.eof() && !progressed {
            return Ok((stdout, stderr));
        }

        if Instant::now() >= deadline {
            session.set_blocking(true);
            let _ = channel.close();
            return Err(AppError::Timeout(format!(
                "Command did not complete within {:?}",
                timeout
            )));
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_error_patterns() {
        assert!(is_recoverable_error("operation would block"));
        assert!(is_recoverable_error("Resource temporarily unavailable (EAGAIN)"));
        assert!(is_recoverable_error("connection timed out"));
        assert!(!is_recoverable_error("connection reset by peer"));
        assert!(!is_recoverable_error("broken pipe"));
    }

    #[test]
    fn test_command_output_serializes_camel_case() {
        let out = CommandOutput {
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["stdout"], "ok\n");
    }
}
