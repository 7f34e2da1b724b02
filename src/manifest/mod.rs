use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

const MANIFEST_FILE: &str = "manifest.json";
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// One update offer: where to fetch the bundle and which version it carries.
///
/// `version` is an opaque label. Two entries describe the same bundle when
/// the strings are equal; no ordering between versions is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub url: String,
    pub version: String,
    #[serde(default, rename = "isMandatory")]
    pub is_mandatory: bool,
}

/// Remote manifest: platform key -> native app version -> update entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    platforms: HashMap<String, HashMap<String, UpdateEntry>>,
}

impl Manifest {
    /// Entry applicable to one platform and native app version, if any.
    /// Entries published for other native app versions are ignored.
    #[must_use]
    pub fn entry_for(&self, platform: Platform, native_app_version: &str) -> Option<&UpdateEntry> {
        self.platforms.get(platform.key())?.get(native_app_version)
    }
}

/// Outcome of an update check. Fetch and parse problems land in
/// `CheckFailed` so callers can tell "nothing new" from "could not look".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    UpdateAvailable(UpdateEntry),
    CheckFailed(String),
}

pub struct ManifestResolver {
    client: Client,
}

impl ManifestResolver {
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(CHECK_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("manifest resolver: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Fetch `<base_url>/manifest.json` and resolve the entry for the given
    /// platform and native app version against the installed bundle version.
    ///
    /// Never fails hard: transport, status and parse problems all come back
    /// as `CheckFailed`, an absent or version-identical entry as `UpToDate`.
    pub async fn resolve(
        &self,
        base_url: &str,
        platform: Platform,
        native_app_version: &str,
        installed_version: Option<&str>,
    ) -> UpdateStatus {
        let url = manifest_url(base_url);
        debug!("resolve: fetching {url}");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                return UpdateStatus::CheckFailed(format!("manifest request failed: {err}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return UpdateStatus::CheckFailed(format!("manifest request returned status {status}"));
        }

        let manifest: Manifest = match response.json().await {
            Ok(manifest) => manifest,
            Err(err) => {
                return UpdateStatus::CheckFailed(format!("failed to parse manifest: {err}"));
            }
        };

        match manifest.entry_for(platform, native_app_version) {
            Some(entry) if installed_version != Some(entry.version.as_str()) => {
                debug!(
                    "resolve: update available ({} -> {})",
                    installed_version.unwrap_or("none"),
                    entry.version
                );
                UpdateStatus::UpdateAvailable(entry.clone())
            }
            Some(entry) => {
                debug!("resolve: bundle version {} already installed", entry.version);
                UpdateStatus::UpToDate
            }
            None => {
                debug!("resolve: no entry for {platform}/{native_app_version}");
                UpdateStatus::UpToDate
            }
        }
    }
}

fn manifest_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/{MANIFEST_FILE}")
}
