use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;

use crate::installer::{BundleInstaller, InstallError};
use crate::layout;
use crate::manifest::{ManifestResolver, UpdateEntry, UpdateStatus};
use crate::platform::Platform;
use crate::store::{StoreError, StoreField, VersionStore};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no base URL configured; call set_base_url first")]
    MissingBaseUrl,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Install(#[from] InstallError),
}

/// Host hook for restarting on the installed bundle. Implementations are
/// responsible for hopping onto their primary/UI context before touching
/// process or activity lifecycle.
pub trait HostRuntime: Send + Sync {
    fn reload(&self, bundle_path: &Path);
}

/// What `sync` did, for hosts that want to react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    Installed(UpdateEntry),
    Deferred(UpdateEntry),
    Failed(String),
}

/// Orchestrates manifest checks, downloads and version state for one
/// platform and native app version.
pub struct UpdateEngine {
    storage_root: PathBuf,
    platform: Platform,
    native_app_version: String,
    store: Box<dyn VersionStore>,
    resolver: ManifestResolver,
    installer: BundleInstaller,
    host: Option<Arc<dyn HostRuntime>>,
}

impl UpdateEngine {
    pub fn new(
        storage_root: PathBuf,
        platform: Platform,
        native_app_version: &str,
        store: Box<dyn VersionStore>,
    ) -> Self {
        Self {
            storage_root,
            platform,
            native_app_version: native_app_version.to_owned(),
            store,
            resolver: ManifestResolver::new(),
            installer: BundleInstaller::new(),
            host: None,
        }
    }

    /// Install the host restart hook used by `reload_bundle`.
    #[must_use]
    pub fn with_host_runtime(mut self, host: Arc<dyn HostRuntime>) -> Self {
        self.host = Some(host);
        self
    }

    /// Persist the distribution base URL used by later checks.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    pub fn set_base_url(&self, url: &str) -> Result<(), UpdateError> {
        info!("set_base_url: {url}");
        self.store
            .set(&self.native_app_version, StoreField::BaseUrl, url)?;
        Ok(())
    }

    /// Look up the remote manifest and compare it against the installed
    /// bundle version.
    ///
    /// # Errors
    /// Fails with `MissingBaseUrl` when no base URL has been configured.
    /// Fetch and parse problems do not error; they surface as
    /// `UpdateStatus::CheckFailed`.
    pub async fn check_for_updates(&self) -> Result<UpdateStatus, UpdateError> {
        let base_url = self
            .store
            .get(&self.native_app_version, StoreField::BaseUrl)?
            .ok_or(UpdateError::MissingBaseUrl)?;
        let installed = self.installed_version()?;

        Ok(self
            .resolver
            .resolve(
                &base_url,
                self.platform,
                &self.native_app_version,
                installed.as_deref(),
            )
            .await)
    }

    /// Download and install a bundle, then record its version. The version
    /// record changes only after the payload is fully installed, so the
    /// store never names a bundle whose bytes are not on disk.
    ///
    /// # Errors
    /// Propagates installer failures; on error the previous install and the
    /// recorded version are unchanged.
    pub async fn download_bundle(&self, url: &str, version: &str) -> Result<(), UpdateError> {
        let version_dir = layout::version_dir(&self.storage_root, &self.native_app_version);
        self.installer
            .install(url, &version_dir, &self.platform.bundle_file_name())
            .await?;
        self.store
            .set(&self.native_app_version, StoreField::BundleVersion, version)?;
        info!("download_bundle: installed bundle version {version}");
        Ok(())
    }

    /// Check for updates and install the offered bundle when it is flagged
    /// mandatory; non-mandatory offers are reported back for the caller to
    /// decide on. Never fails: every problem is logged and folded into the
    /// outcome, so hosts can run this during startup unconditionally.
    pub async fn sync(&self) -> SyncOutcome {
        let status = match self.check_for_updates().await {
            Ok(status) => status,
            Err(err) => {
                warn!("sync: check failed: {err}");
                return SyncOutcome::Failed(err.to_string());
            }
        };

        match status {
            UpdateStatus::UpToDate => SyncOutcome::UpToDate,
            UpdateStatus::CheckFailed(reason) => {
                warn!("sync: update check unavailable: {reason}");
                SyncOutcome::Failed(reason)
            }
            UpdateStatus::UpdateAvailable(entry) if entry.is_mandatory => {
                info!("sync: installing mandatory update {}", entry.version);
                match self.download_bundle(&entry.url, &entry.version).await {
                    Ok(()) => SyncOutcome::Installed(entry),
                    Err(err) => {
                        error!("sync: mandatory update failed: {err}");
                        SyncOutcome::Failed(err.to_string())
                    }
                }
            }
            UpdateStatus::UpdateAvailable(entry) => {
                info!(
                    "sync: update {} available, awaiting caller decision",
                    entry.version
                );
                SyncOutcome::Deferred(entry)
            }
        }
    }

    /// Ask the host to restart on the currently installed bundle.
    pub fn reload_bundle(&self) {
        let path = self.bundle_path();
        match &self.host {
            Some(host) => {
                info!("reload_bundle: requesting host reload with {}", path.display());
                host.reload(&path);
            }
            None => warn!("reload_bundle: no host runtime installed"),
        }
    }

    /// Where the bundle for this platform and native app version lives.
    #[must_use]
    pub fn bundle_path(&self) -> PathBuf {
        layout::bundle_path(&self.storage_root, &self.native_app_version, self.platform)
    }

    /// Currently recorded bundle version, if any install has succeeded.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn installed_version(&self) -> Result<Option<String>, UpdateError> {
        Ok(self
            .store
            .get(&self.native_app_version, StoreField::BundleVersion)?)
    }
}
