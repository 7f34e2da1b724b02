use std::fmt;
use std::str::FromStr;

/// Target platform of a bundle, as keyed in the remote manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Android, Platform::Ios];

    /// Identifier used in manifest keys and generated file names.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    #[must_use]
    pub fn bundle_file_name(self) -> String {
        format!("index.{}.bundle", self.key())
    }

    #[must_use]
    pub fn package_file_name(self) -> String {
        format!("{}-package.zip", self.key())
    }

    #[must_use]
    pub fn asset_manifest_file_name(self) -> String {
        format!("ota-assets-manifest.{}.json", self.key())
    }

    /// Whether a top-level directory of the bundler output carries assets
    /// for this platform.
    #[must_use]
    pub fn is_asset_dir(self, name: &str) -> bool {
        match self {
            Platform::Android => name == "raw" || name.starts_with("drawable-"),
            Platform::Ios => name == "assets",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}
