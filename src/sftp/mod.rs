//! SFTP-backed file browsing and transfer.
//!
//! These routines run on a connection's transport worker thread against the
//! lazily opened SFTP subsystem of that connection. Uploads stream to a
//! temporary remote name and rename into place; a failed transfer never
//! leaves a partial artifact behind.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use ssh2::{ErrorCode, FileStat, RenameFlags, Sftp};
use std::io::{Read, Write};
use std::path::Path;
use uuid::Uuid;

/// Chunk size for streamed transfers
const TRANSFER_CHUNK_BYTES: usize = 64 * 1024;

// SFTP status codes per draft-ietf-secsh-filexfer
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

/// One entry of a remote directory listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: FileNodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// Populated only for expanded directories; absence is not "empty"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNodeType {
    File,
    Directory,
}

/// Source of an upload: a file on the caller's disk, or bytes handed over
/// directly (the drag-and-drop case)
#[derive(Debug, Clone)]
pub enum UploadSource {
    LocalPath(std::path::PathBuf),
    Blob(Vec<u8>),
}

/// Modification signal of a remote file, used by watchers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: i64,
}

/// List one level of a remote directory, directories first, then
/// lexicographically by name.
pub(crate) fn list_dir(sftp: &Sftp, path: &str) -> AppResult<Vec<FileNode>> {
    let path = if path.is_empty() { "." } else { path };
    let entries = sftp
        .readdir(Path::new(path))
        .map_err(|e| map_sftp_error(&e, path))?;

    let mut nodes = Vec::new();
    for (file_path, stat) in entries {
        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name == "." || name == ".." {
            continue;
        }

        nodes.push(FileNode {
            name,
            path: file_path.to_string_lossy().to_string(),
            node_type: if stat.is_dir() {
                FileNodeType::Directory
            } else {
                FileNodeType::File
            },
            size: stat.size,
            modified: stat.mtime.map(|t| t as i64),
            permissions: Some(format_permissions(&stat)),
            children: None,
        });
    }

    sort_nodes(&mut nodes);
    Ok(nodes)
}

/// Stat a remote path (size + mtime)
pub(crate) fn stat_remote(sftp: &Sftp, path: &str) -> AppResult<RemoteStat> {
    let stat = sftp
        .stat(Path::new(path))
        .map_err(|e| map_sftp_error(&e, path))?;
    Ok(RemoteStat {
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime.map(|t| t as i64).unwrap_or(0),
    })
}

/// Upload to `remote_path`, streaming through a temporary sibling name and
/// renaming into place once every byte is written. Returns bytes written.
pub(crate) fn upload(sftp: &Sftp, source: &UploadSource, remote_path: &str) -> AppResult<u64> {
    let temp_path = temp_upload_path(remote_path);

    let result = match source {
        UploadSource::LocalPath(local) => stream_file_to_remote(sftp, local, &temp_path),
        UploadSource::Blob(bytes) => stream_blob_to_remote(sftp, bytes, &temp_path),
    };

    let written = match result {
        Ok(n) => n,
        Err(e) => {
            // Never leave a partial artifact behind
            let _ = sftp.unlink(Path::new(&temp_path));
            return Err(e);
        }
    };

    rename_into_place(sftp, &temp_path, remote_path)?;
    Ok(written)
}

/// Move a fully written temp file onto its final name. Overwrite flags
/// only reach servers speaking SFTP protocol 5+; a v3 server (OpenSSH)
/// refuses to rename over an existing target, so on failure the target
/// is cleared and the rename tried once more.
fn rename_into_place(sftp: &Sftp, temp_path: &str, remote_path: &str) -> AppResult<()> {
    let flags = Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE);

    if let Err(first) = sftp.rename(Path::new(temp_path), Path::new(remote_path), flags) {
        let _ = sftp.unlink(Path::new(remote_path));
        if let Err(e) = sftp.rename(Path::new(temp_path), Path::new(remote_path), flags) {
            let _ = sftp.unlink(Path::new(temp_path));
            return Err(AppError::TransferInterrupted(format!(
                "Failed to move upload into place: {} (retry after clearing target: {})",
                first, e
            )));
        }
    }
    Ok(())
}

/// Download `remote_path` into `local_path`, streaming. Returns bytes read.
pub(crate) fn download(sftp: &Sftp, remote_path: &str, local_path: &Path) -> AppResult<u64> {
    let mut remote = sftp
        .open(Path::new(remote_path))
        .map_err(|e| map_sftp_error(&e, remote_path))?;

    if let Some(parent) = local_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut local = std::fs::File::create(local_path)?;

    let mut buf = vec![0u8; TRANSFER_CHUNK_BYTES];
    let mut total: u64 = 0;
    loop {
        let n = match remote.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(local);
                let _ = std::fs::remove_file(local_path);
                return Err(AppError::TransferInterrupted(format!(
                    "Read failed during download of {}: {}",
                    remote_path, e
                )));
            }
        };
        if let Err(e) = local.write_all(&buf[..n]) {
            drop(local);
            let _ = std::fs::remove_file(local_path);
            return Err(AppError::TransferInterrupted(format!(
                "Local write failed: {}",
                e
            )));
        }
        total += n as u64;
    }

    local.flush()?;
    Ok(total)
}

fn stream_file_to_remote(sftp: &Sftp, local: &Path, temp_path: &str) -> AppResult<u64> {
    let mut src = std::fs::File::open(local)
        .map_err(|e| AppError::PathNotFound(format!("{}: {}", local.display(), e)))?;
    let mut dst = sftp
        .create(Path::new(temp_path))
        .map_err(|e| map_sftp_error(&e, temp_path))?;

    let mut buf = vec![0u8; TRANSFER_CHUNK_BYTES];
    let mut total: u64 = 0;
    loop {
        let n = src
            .read(&mut buf)
            .map_err(|e| AppError::TransferInterrupted(format!("Local read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).map_err(|e| {
            AppError::TransferInterrupted(format!("Write failed during upload: {}", e))
        })?;
        total += n as u64;
    }
    Ok(total)
}

fn stream_blob_to_remote(sftp: &Sftp, bytes: &[u8], temp_path: &str) -> AppResult<u64> {
    let mut dst = sftp
        .create(Path::new(temp_path))
        .map_err(|e| map_sftp_error(&e, temp_path))?;

    for chunk in bytes.chunks(TRANSFER_CHUNK_BYTES) {
        dst.write_all(chunk).map_err(|e| {
            AppError::TransferInterrupted(format!("Write failed during upload: {}", e))
        })?;
    }
    Ok(bytes.len() as u64)
}

/// Temporary sibling name an upload streams into before the final rename
fn temp_upload_path(remote_path: &str) -> String {
    let token = &Uuid::new_v4().simple().to_string()[..8];
    match remote_path.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.{}.part-{}", dir, name, token),
        None => format!(".{}.part-{}", remote_path, token),
    }
}

/// Map a remote SFTP failure onto the caller-facing taxonomy
fn map_sftp_error(err: &ssh2::Error, path: &str) -> AppError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => AppError::PathNotFound(path.to_string()),
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => AppError::PermissionDenied(path.to_string()),
        _ => AppError::Ssh(format!("SFTP error on {}: {}", path, err)),
    }
}

/// Directories before files, then lexicographically by name
fn sort_nodes(nodes: &mut [FileNode]) {
    nodes.sort_by(|a, b| {
        match (a.node_type, b.node_type) {
            (FileNodeType::Directory, FileNodeType::File) => std::cmp::Ordering::Less,
            (FileNodeType::File, FileNodeType::Directory) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        }
    });
}

/// Format file permissions as a string like "rwxr-xr-x"
fn format_permissions(stat: &FileStat) -> String {
    let perms = stat.perm.unwrap_or(0);

    let mut s = String::with_capacity(10);

    if stat.is_dir() {
        s.push('d');
    } else if stat.file_type().is_symlink() {
        s.push('l');
    } else {
        s.push('-');
    }

    s.push(if perms & 0o400 != 0 { 'r' } else { '-' });
    s.push(if perms & 0o200 != 0 { 'w' } else { '-' });
    s.push(if perms & 0o100 != 0 { 'x' } else { '-' });

    s.push(if perms & 0o040 != 0 { 'r' } else { '-' });
    s.push(if perms & 0o020 != 0 { 'w' } else { '-' });
    s.push(if perms & 0o010 != 0 { 'x' } else { '-' });

    s.push(if perms & 0o004 != 0 { 'r' } else { '-' });
    s.push(if perms & 0o002 != 0 { 'w' } else { '-' });
    s.push(if perms & 0o001 != 0 { 'x' } else { '-' });

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, node_type: FileNodeType) -> FileNode {
        FileNode {
            name: name.to_string(),
            path: format!("/srv/{}", name),
            node_type,
            size: None,
            modified: None,
            permissions: None,
            children: None,
        }
    }

    #[test]
    fn test_sort_directories_first_then_lexicographic() {
        let mut nodes = vec![
            node("zebra.txt", FileNodeType::File),
            node("var", FileNodeType::Directory),
            node("alpha.txt", FileNodeType::File),
            node("etc", FileNodeType::Directory),
        ];
        sort_nodes(&mut nodes);

        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["etc", "var", "alpha.txt", "zebra.txt"]);
    }

    #[test]
    fn test_temp_upload_path_is_sibling() {
        let temp = temp_upload_path("/srv/data/report.csv");
        assert!(temp.starts_with("/srv/data/.report.csv.part-"));

        let bare = temp_upload_path("report.csv");
        assert!(bare.starts_with(".report.csv.part-"));
    }

    #[test]
    fn test_temp_upload_paths_unique() {
        let a = temp_upload_path("/srv/f");
        let b = temp_upload_path("/srv/f");
        assert_ne!(a, b);
    }

    #[test]
    fn test_format_permissions() {
        let stat = FileStat {
            size: Some(10),
            uid: None,
            gid: None,
            perm: Some(0o100644),
            atime: None,
            mtime: None,
        };
        assert_eq!(format_permissions(&stat), "-rw-r--r--");
    }

    #[test]
    fn test_file_node_serializes_camel_case() {
        let n = FileNode {
            name: "report.csv".to_string(),
            path: "/srv/report.csv".to_string(),
            node_type: FileNodeType::File,
            size: Some(42),
            modified: Some(1_700_000_000),
            permissions: Some("-rw-r--r--".to_string()),
            children: None,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["size"], 42);
        assert!(json.get("children").is_none());
    }
}
