use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::DEFAULT_TIMEOUT_MS;
use crate::{Error, TransportConfig};

/// A saved connection: a display name plus its transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub config: TransportConfig,
}

/// A profile before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewServerProfile {
    pub name: String,
    #[serde(flatten)]
    pub config: TransportConfig,
}

/// Where connection profiles live.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ServerProfile>, Error>;

    async fn get(&self, id: &str) -> Result<Option<ServerProfile>, Error>;

    /// Stores a new profile with a generated id and a defaulted timeout.
    async fn add(&self, profile: NewServerProfile) -> Result<ServerProfile, Error>;

    /// Replaces the profile with the same id. Unknown ids are an error.
    async fn update(&self, profile: ServerProfile) -> Result<ServerProfile, Error>;

    /// Returns whether a profile was removed.
    async fn remove(&self, id: &str) -> Result<bool, Error>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ProfileDocument {
    #[serde(default)]
    servers: Vec<ServerProfile>,
}

/// Profiles kept in one JSON file, `{"servers": [...]}`. A missing file reads as empty.
#[derive(Debug)]
pub struct JsonFileProfileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ProfileDocument, Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProfileDocument::default());
            }
            Err(err) => {
                return Err(Error::Profile(format!(
                    "read {}: {err}",
                    self.path.display()
                )));
            }
        };
        if contents.trim().is_empty() {
            return Ok(ProfileDocument::default());
        }
        serde_json::from_str(&contents)
            .map_err(|err| Error::Profile(format!("parse {}: {err}", self.path.display())))
    }

    async fn save(&self, document: &ProfileDocument) -> Result<(), Error> {
        let mut contents = serde_json::to_vec_pretty(document)
            .map_err(|err| Error::Profile(format!("serialize profiles: {err}")))?;
        contents.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                Error::Profile(format!("create {}: {err}", parent.display()))
            })?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &contents)
            .await
            .map_err(|err| Error::Profile(format!("write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|err| {
            Error::Profile(format!("replace {}: {err}", self.path.display()))
        })
    }
}

fn checked(mut config: TransportConfig) -> Result<TransportConfig, Error> {
    config.validate()?;
    config.timeout.get_or_insert(DEFAULT_TIMEOUT_MS);
    Ok(config)
}

fn checked_name(name: &str) -> Result<String, Error> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Configuration(
            "profile name must not be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Millisecond timestamp, bumped past any id already in use.
fn next_id(existing: &[ServerProfile]) -> String {
    let mut id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default();
    while existing.iter().any(|profile| profile.id == id.to_string()) {
        id = id.saturating_add(1);
    }
    id.to_string()
}

#[async_trait]
impl ProfileStore for JsonFileProfileStore {
    async fn list(&self) -> Result<Vec<ServerProfile>, Error> {
        Ok(self.load().await?.servers)
    }

    async fn get(&self, id: &str) -> Result<Option<ServerProfile>, Error> {
        Ok(self
            .load()
            .await?
            .servers
            .into_iter()
            .find(|profile| profile.id == id))
    }

    async fn add(&self, profile: NewServerProfile) -> Result<ServerProfile, Error> {
        let name = checked_name(&profile.name)?;
        let config = checked(profile.config)?;

        let _writing = self.write_lock.lock().await;
        let mut document = self.load().await?;
        let profile = ServerProfile {
            id: next_id(&document.servers),
            name,
            config,
        };
        document.servers.push(profile.clone());
        self.save(&document).await?;
        tracing::info!(id = %profile.id, name = %profile.name, "profile added");
        Ok(profile)
    }

    async fn update(&self, profile: ServerProfile) -> Result<ServerProfile, Error> {
        let profile = ServerProfile {
            name: checked_name(&profile.name)?,
            config: checked(profile.config)?,
            id: profile.id,
        };

        let _writing = self.write_lock.lock().await;
        let mut document = self.load().await?;
        let slot = document
            .servers
            .iter_mut()
            .find(|existing| existing.id == profile.id)
            .ok_or_else(|| Error::Profile(format!("profile {} not found", profile.id)))?;
        *slot = profile.clone();
        self.save(&document).await?;
        Ok(profile)
    }

    async fn remove(&self, id: &str) -> Result<bool, Error> {
        let _writing = self.write_lock.lock().await;
        let mut document = self.load().await?;
        let before = document.servers.len();
        document.servers.retain(|profile| profile.id != id);
        if document.servers.len() == before {
            return Ok(false);
        }
        self.save(&document).await?;
        tracing::info!(id, "profile removed");
        Ok(true)
    }
}
