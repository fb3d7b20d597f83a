use crate::error::{AppError, AppResult};
use crate::ssh::connection::{AuthMethod, ConnectionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A saved connection record.
///
/// This is the durable profile shape the core is handed: a superset of the
/// connect parameters with no runtime fields. A live [`ConnectionConfig`] is
/// derived from it; the reverse never happens automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_port() -> u16 {
    22
}

impl SessionData {
    pub fn new(name: String, host: String, username: String, auth: AuthMethod) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            host,
            port: 22,
            username,
            auth,
            tags: vec![],
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive live connect parameters from this record
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth.clone(),
        }
    }
}

/// Session store file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsFile {
    #[serde(default)]
    pub sessions: Vec<SessionData>,
}

/// Durable store of saved connection records
pub struct SessionStore {
    sessions: HashMap<String, SessionData>,
    store_path: PathBuf,
}

impl SessionStore {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let store_path = config_dir.join("sessions.toml");
        let sessions = if store_path.exists() {
            let content = std::fs::read_to_string(&store_path)?;
            let file: SessionsFile = toml::from_str(&content)?;
            file.sessions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            sessions,
            store_path,
        })
    }

    fn persist(&self) -> AppResult<()> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let sessions: Vec<_> = self.sessions.values().cloned().collect();
        let file = SessionsFile { sessions };
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.store_path, content)?;
        Ok(())
    }

    /// List all saved records. Callers re-list after mutations; writes do
    /// not return the refreshed collection.
    pub fn list(&self) -> Vec<SessionData> {
        let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    pub fn get(&self, id: &str) -> Option<SessionData> {
        self.sessions.get(id).cloned()
    }

    /// Insert or replace a record and persist
    pub fn save(&mut self, mut data: SessionData) -> AppResult<()> {
        data.updated_at = chrono::Utc::now().timestamp();
        self.sessions.insert(data.id.clone(), data);
        self.persist()
    }

    pub fn delete(&mut self, id: &str) -> AppResult<()> {
        self.sessions
            .remove(id)
            .ok_or_else(|| AppError::Config(format!("Session {} not found", id)))?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::KeySource;

    fn sample(name: &str) -> SessionData {
        SessionData::new(
            name.to_string(),
            "example.com".to_string(),
            "deploy".to_string(),
            AuthMethod::Password {
                password: "hunter2".to_string(),
            },
        )
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::load(dir.path()).unwrap();
        let data = sample("prod");
        let id = data.id.clone();
        store.save(data).unwrap();

        let reloaded = SessionStore::load(dir.path()).unwrap();
        let got = reloaded.get(&id).unwrap();
        assert_eq!(got.name, "prod");
        assert_eq!(got.host, "example.com");
    }

    #[test]
    fn test_delete_missing_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::load(dir.path()).unwrap();
        assert!(store.delete("nope").is_err());
    }

    #[test]
    fn test_list_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::load(dir.path()).unwrap();
        store.save(sample("zeta")).unwrap();
        store.save(sample("alpha")).unwrap();

        let names: Vec<_> = store.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_key_auth_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::load(dir.path()).unwrap();
        let data = SessionData::new(
            "keyed".to_string(),
            "example.com".to_string(),
            "root".to_string(),
            AuthMethod::Key {
                key: KeySource::Path("~/.ssh/id_ed25519".to_string()),
            },
        );
        let id = data.id.clone();
        store.save(data).unwrap();

        let reloaded = SessionStore::load(dir.path()).unwrap();
        match reloaded.get(&id).unwrap().auth {
            AuthMethod::Key {
                key: KeySource::Path(p),
            } => assert_eq!(p, "~/.ssh/id_ed25519"),
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_to_connection_config() {
        let data = sample("prod");
        let config = data.to_connection_config();
        assert_eq!(config.id.as_deref(), Some(data.id.as_str()));
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 22);
    }
}
