use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::proxy::error::CredentialError;

const DATA_DIR: &str = ".studio-relay";
const DATA_DIR_ENV: &str = "STUDIO_RELAY_DATA_DIR";
const AUTH_DIR: &str = "auth";
const AUTH_ENV_PREFIX: &str = "AUTH_JSON_";
const AUTH_FILE_PREFIX: &str = "auth-";
const AUTH_FILE_SUFFIX: &str = ".json";

/// Get data directory path
pub fn get_data_dir() -> Result<PathBuf, String> {
    let data_dir = match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => {
            let home = dirs::home_dir().ok_or("Failed to get user home directory")?;
            home.join(DATA_DIR)
        }
    };

    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
    }

    Ok(data_dir)
}

/// Default directory of `auth-<n>.json` files
pub fn get_auth_dir() -> Result<PathBuf, String> {
    Ok(get_data_dir()?.join(AUTH_DIR))
}

/// Where identity bundles come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// `AUTH_JSON_<n>` environment variables
    Environment,
    /// `auth-<n>.json` files in a directory
    Directory(PathBuf),
}

impl CredentialSource {
    /// Environment mode when any `AUTH_JSON_<n>` is set, directory mode otherwise.
    pub fn detect(auth_dir: PathBuf) -> Self {
        if !env_indices().is_empty() {
            Self::Environment
        } else {
            Self::Directory(auth_dir)
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Environment => format!("environment ({}<n>)", AUTH_ENV_PREFIX),
            Self::Directory(dir) => format!("{:?}", dir),
        }
    }

    fn read_raw(&self, index: u32) -> Option<String> {
        match self {
            Self::Environment => std::env::var(format!("{}{}", AUTH_ENV_PREFIX, index)).ok(),
            Self::Directory(dir) => fs::read_to_string(auth_file_path(dir, index)).ok(),
        }
    }
}

/// One identity bundle as read from its source.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub index: u32,
    pub raw_content: String,
    pub valid: bool,
}

impl CredentialRecord {
    fn parse(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.raw_content).ok()
    }
}

pub fn auth_file_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{}{}{}", AUTH_FILE_PREFIX, index, AUTH_FILE_SUFFIX))
}

fn parse_env_index(key: &str) -> Option<u32> {
    key.strip_prefix(AUTH_ENV_PREFIX)?
        .parse::<u32>()
        .ok()
        .filter(|i| *i > 0)
}

/// `AUTH_JSON_<n>` indices in the environment; keys that are not UTF-8 are skipped.
fn env_indices() -> BTreeSet<u32> {
    std::env::vars_os()
        .filter_map(|(key, _)| key.to_str().and_then(parse_env_index))
        .collect()
}

fn parse_file_index(name: &str) -> Option<u32> {
    name.strip_prefix(AUTH_FILE_PREFIX)?
        .strip_suffix(AUTH_FILE_SUFFIX)?
        .parse::<u32>()
        .ok()
        .filter(|i| *i > 0)
}

/// Validated set of identity bundles.
///
/// Only the index set is kept in memory; content is re-read from the source on
/// every [`CredentialPool::get`] so edited bundles take effect on the next switch.
#[derive(Debug)]
pub struct CredentialPool {
    source: CredentialSource,
    available: Vec<u32>,
}

impl CredentialPool {
    /// Scans and validates `source`. Fails when no usable bundle exists.
    pub fn new(source: CredentialSource) -> Result<Self, CredentialError> {
        let discovered = Self::discover(&source);
        let available = Self::validate(&source, &discovered);

        if available.is_empty() {
            return Err(CredentialError::NoValidCredentials(source.describe()));
        }

        let invalid: Vec<u32> = discovered.difference(&available).copied().collect();
        if !invalid.is_empty() {
            tracing::warn!("Ignoring unparsable credentials: {:?}", invalid);
        }
        tracing::info!(
            "Loaded {} credential(s) from {}: {:?}",
            available.len(),
            source.describe(),
            available
        );

        Ok(Self {
            source,
            available: available.into_iter().collect(),
        })
    }

    /// Indices present in `source`. Never fails; access errors yield an empty set.
    pub fn discover(source: &CredentialSource) -> BTreeSet<u32> {
        match source {
            CredentialSource::Environment => env_indices(),
            CredentialSource::Directory(dir) => match fs::read_dir(dir) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().to_str().and_then(parse_file_index))
                    .collect(),
                Err(e) => {
                    tracing::warn!("Failed to read credential directory {:?}: {}", dir, e);
                    BTreeSet::new()
                }
            },
        }
    }

    /// Subset of `indices` whose content exists and parses as JSON.
    pub fn validate(source: &CredentialSource, indices: &BTreeSet<u32>) -> BTreeSet<u32> {
        indices
            .iter()
            .copied()
            .filter(|index| Self::read_record(source, *index).valid)
            .collect()
    }

    fn read_record(source: &CredentialSource, index: u32) -> CredentialRecord {
        let raw_content = source.read_raw(index).unwrap_or_default();
        let valid = !raw_content.trim().is_empty()
            && serde_json::from_str::<serde_json::Value>(&raw_content).is_ok();
        CredentialRecord {
            index,
            raw_content,
            valid,
        }
    }

    /// Fresh content of a validated index, or `None` if it is unknown or no longer parses.
    pub fn get(&self, index: u32) -> Option<serde_json::Value> {
        if !self.contains(index) {
            return None;
        }
        let record = Self::read_record(&self.source, index);
        match record.parse() {
            Some(content) => Some(content),
            None => {
                tracing::error!(
                    "Credential #{} was valid at startup but can no longer be parsed",
                    index
                );
                None
            }
        }
    }

    /// Display name stored in the bundle, if any.
    pub fn account_name(&self, index: u32) -> Option<String> {
        self.get(index)?
            .get("accountName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn indices(&self) -> &[u32] {
        &self.available
    }

    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.available.binary_search(&index).is_ok()
    }

    pub fn first(&self) -> Option<u32> {
        self.available.first().copied()
    }

    /// Cyclic successor of `current`; the first index when `current` is unknown.
    pub fn next_after(&self, current: Option<u32>) -> Option<u32> {
        let first = self.first()?;
        let Some(current) = current else {
            return Some(first);
        };
        match self.available.binary_search(&current) {
            Ok(pos) => Some(self.available[(pos + 1) % self.available.len()]),
            Err(_) => Some(first),
        }
    }
}
