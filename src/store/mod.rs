use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::debug;
use thiserror::Error;

use crate::layout;

const BASE_URL_KEY: &str = "OverTheAirBaseURL";
const BUNDLE_VERSION_KEY_PREFIX: &str = "CurrentBundleVersion_";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state io error: {0}")]
    Io(#[from] io::Error),
    #[error("state parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Logical fields tracked per native app version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreField {
    BaseUrl,
    BundleVersion,
}

impl StoreField {
    /// External key name. The base URL is one shared slot; bundle versions
    /// are namespaced by native app version.
    fn key(self, native_app_version: &str) -> String {
        match self {
            StoreField::BaseUrl => BASE_URL_KEY.to_owned(),
            StoreField::BundleVersion => {
                format!("{BUNDLE_VERSION_KEY_PREFIX}{native_app_version}")
            }
        }
    }
}

/// Durable key/value state for the update engine, keyed by native app
/// version plus logical field. Last write wins; writes are driven by a
/// single logical update flow per device.
pub trait VersionStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing state cannot be read.
    fn get(
        &self,
        native_app_version: &str,
        field: StoreField,
    ) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Returns an error if the backing state cannot be written.
    fn set(
        &self,
        native_app_version: &str,
        field: StoreField,
        value: &str,
    ) -> Result<(), StoreError>;
}

/// Store persisted as a flat JSON map at `<storage_root>/ota/state.json`.
pub struct FileStore {
    state_path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(storage_root: &Path) -> Self {
        Self {
            state_path: layout::ota_dir(storage_root).join(STATE_FILE),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let bytes = match fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, state: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        // Write to a sibling and rename so a crash never truncates the state.
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.state_path)?;
        Ok(())
    }
}

impl VersionStore for FileStore {
    fn get(
        &self,
        native_app_version: &str,
        field: StoreField,
    ) -> Result<Option<String>, StoreError> {
        let state = self.load()?;
        Ok(state.get(&field.key(native_app_version)).cloned())
    }

    fn set(
        &self,
        native_app_version: &str,
        field: StoreField,
        value: &str,
    ) -> Result<(), StoreError> {
        let key = field.key(native_app_version);
        debug!("set: {key} = {value}");
        let mut state = self.load()?;
        state.insert(key, value.to_owned());
        self.save(&state)
    }
}

/// In-memory store for tests and hosts without durable storage.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStore for MemoryStore {
    fn get(
        &self,
        native_app_version: &str,
        field: StoreField,
    ) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(&field.key(native_app_version)).cloned())
    }

    fn set(
        &self,
        native_app_version: &str,
        field: StoreField,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(field.key(native_app_version), value.to_owned());
        Ok(())
    }
}
