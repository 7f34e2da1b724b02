use std::path::{Path, PathBuf};

use crate::platform::Platform;

/// Directory under the storage root holding everything the client writes.
pub const OTA_DIR_NAME: &str = "ota";

/// Root of the client's on-disk tree: `<storage_root>/ota`.
#[must_use]
pub fn ota_dir(storage_root: &Path) -> PathBuf {
    storage_root.join(OTA_DIR_NAME)
}

/// Install directory for one native app version. Never shared across
/// versions, so a bundle built against one app shell cannot leak into
/// another after a store update.
#[must_use]
pub fn version_dir(storage_root: &Path, native_app_version: &str) -> PathBuf {
    ota_dir(storage_root).join(native_app_version)
}

/// Full path of the installed bundle file for a platform and native app
/// version.
#[must_use]
pub fn bundle_path(storage_root: &Path, native_app_version: &str, platform: Platform) -> PathBuf {
    version_dir(storage_root, native_app_version).join(platform.bundle_file_name())
}
