use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Error;

/// App-wide settings. Holds one credential string, the API key handed to tool-calling clients.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The stored key, or an empty string when none was ever set.
    async fn api_key(&self) -> Result<String, Error>;

    async fn set_api_key(&self, key: &str) -> Result<(), Error>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDocument {
    #[serde(default)]
    api_key: String,
    /// Keys written by other tools survive a rewrite.
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

/// Settings kept in one JSON file, `{"apiKey": "..."}`. A missing file reads as defaults.
#[derive(Debug)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<SettingsDocument, Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SettingsDocument::default());
            }
            Err(err) => {
                return Err(Error::Settings(format!(
                    "read {}: {err}",
                    self.path.display()
                )));
            }
        };
        if contents.trim().is_empty() {
            return Ok(SettingsDocument::default());
        }
        serde_json::from_str(&contents)
            .map_err(|err| Error::Settings(format!("parse {}: {err}", self.path.display())))
    }

    async fn save(&self, document: &SettingsDocument) -> Result<(), Error> {
        let mut contents = serde_json::to_vec_pretty(document)
            .map_err(|err| Error::Settings(format!("serialize settings: {err}")))?;
        contents.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                Error::Settings(format!("create {}: {err}", parent.display()))
            })?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &contents)
            .await
            .map_err(|err| Error::Settings(format!("write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|err| {
            Error::Settings(format!("replace {}: {err}", self.path.display()))
        })
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn api_key(&self) -> Result<String, Error> {
        Ok(self.load().await?.api_key)
    }

    async fn set_api_key(&self, key: &str) -> Result<(), Error> {
        let _writing = self.write_lock.lock().await;
        let mut document = self.load().await?;
        document.api_key = key.to_string();
        self.save(&document).await?;
        // Never log the key itself.
        tracing::info!(path = %self.path.display(), set = !key.is_empty(), "api key stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSettingsStore::new(dir.path().join("settings.json"));
        assert_eq!(store.api_key().await.unwrap(), "");
    }

    #[tokio::test]
    async fn set_then_get_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        JsonFileSettingsStore::new(&path)
            .set_api_key("sk-first")
            .await
            .unwrap();
        let store = JsonFileSettingsStore::new(&path);
        assert_eq!(store.api_key().await.unwrap(), "sk-first");

        store.set_api_key("sk-second").await.unwrap();
        assert_eq!(store.api_key().await.unwrap(), "sk-second");

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, serde_json::json!({"apiKey": "sk-second"}));
    }

    #[tokio::test]
    async fn unrelated_keys_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"apiKey":"old","theme":"dark"}"#).unwrap();

        let store = JsonFileSettingsStore::new(&path);
        store.set_api_key("").await.unwrap();
        assert_eq!(store.api_key().await.unwrap(), "");

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["theme"], "dark");
    }

    #[tokio::test]
    async fn corrupt_file_is_a_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileSettingsStore::new(&path);
        assert!(matches!(store.api_key().await, Err(Error::Settings(_))));
        assert!(matches!(
            store.set_api_key("k").await,
            Err(Error::Settings(_))
        ));
    }
}
