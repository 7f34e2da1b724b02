//! Over-the-air bundle updates for embedded JS runtimes.
//!
//! The library half drives the client side: checking a hosted manifest,
//! downloading and atomically installing bundle artifacts, and tracking
//! which bundle version each native app version runs. The `ota` binary
//! drives the build side, packaging bundler output into full or
//! incremental archives for hosting.

pub mod engine;
pub mod hasher;
pub mod installer;
pub mod layout;
pub mod manifest;
pub mod packager;
pub mod platform;
pub mod store;

pub use engine::{HostRuntime, SyncOutcome, UpdateEngine, UpdateError};
pub use hasher::AssetManifest;
pub use installer::{BundleInstaller, InstallError};
pub use manifest::{Manifest, ManifestResolver, UpdateEntry, UpdateStatus};
pub use packager::{PackageError, PackageOptions, PackageReport};
pub use platform::Platform;
pub use store::{FileStore, MemoryStore, StoreError, StoreField, VersionStore};
