use std::collections::BTreeMap;

use serde::Serialize;

use crate::Error;

/// Process-level overrides for the default environment, as a JSON object of strings.
pub const ENV_OVERRIDES_VAR: &str = "MCP_ENV_VARS";

#[cfg(windows)]
const DEFAULT_INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

#[cfg(not(windows))]
const DEFAULT_INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Environment handed to every spawned stdio server, beneath the caller's own `env`.
///
/// Built once: a safe subset of the current process environment, overlaid with the
/// [`ENV_OVERRIDES_VAR`] object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DefaultEnvironment(BTreeMap<String, String>);

impl DefaultEnvironment {
    pub fn from_process() -> Result<Self, Error> {
        let vars = DEFAULT_INHERITED_ENV_VARS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)));
        let overrides = std::env::var(ENV_OVERRIDES_VAR).ok();
        Self::from_parts(vars, overrides.as_deref())
    }

    /// Builds the snapshot from explicit inputs. Variables outside the inherited set are
    /// ignored, as are values that look like exported shell functions (`() { ... }`).
    pub fn from_parts<I>(vars: I, overrides: Option<&str>) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = vars
            .into_iter()
            .filter(|(key, value)| {
                DEFAULT_INHERITED_ENV_VARS.contains(&key.as_str()) && !value.starts_with("()")
            })
            .collect();

        if let Some(raw) = overrides.map(str::trim).filter(|raw| !raw.is_empty()) {
            let overrides: BTreeMap<String, String> = serde_json::from_str(raw).map_err(|err| {
                Error::Configuration(format!(
                    "{ENV_OVERRIDES_VAR} must be a JSON object of strings: {err}"
                ))
            })?;
            env.extend(overrides);
        }
        Ok(Self(env))
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Defaults first, then `env` on top.
    pub fn merged_with(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.0.clone();
        merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

impl From<BTreeMap<String, String>> for DefaultEnvironment {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}
