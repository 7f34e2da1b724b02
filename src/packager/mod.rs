use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use thiserror::Error;
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::hasher::{self, AssetManifest};
use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("bundler failed for {platform}: {details}")]
    Bundler { platform: Platform, details: String },
    #[error("missing bundle file {0}")]
    MissingBundle(PathBuf),
    #[error("package io error: {0}")]
    Io(#[from] io::Error),
    #[error("archive write error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("asset manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Inputs for one platform's packaging run.
#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub platform: Platform,
    /// Bundler output tree; also receives the finished archive.
    pub output_dir: PathBuf,
    /// Skip assets unchanged since the base manifest.
    pub incremental: bool,
    /// Explicit base manifest; when absent, the manifest cached by the
    /// previous incremental run for the same platform is used.
    pub base_manifest: Option<PathBuf>,
    /// Directory where the chained asset manifest is read and written.
    pub manifest_dir: PathBuf,
}

#[derive(Debug)]
pub struct PackageReport {
    pub archive_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub included_assets: usize,
    pub skipped_assets: usize,
}

/// Run the JS bundler for one platform, producing the bundle file and asset
/// directories inside `output_dir`.
///
/// # Errors
/// Fails with `Bundler` when the bundler cannot be launched or exits
/// nonzero; stderr is captured into the error.
pub fn run_bundler(
    platform: Platform,
    entry_file: &Path,
    output_dir: &Path,
) -> Result<(), PackageError> {
    let bundle_output = output_dir.join(platform.bundle_file_name());
    info!(
        "run_bundler: bundling {platform} from {}",
        entry_file.display()
    );

    let output = Command::new("npx")
        .arg("react-native")
        .arg("bundle")
        .arg("--platform")
        .arg(platform.key())
        .arg("--dev")
        .arg("false")
        .arg("--entry-file")
        .arg(entry_file)
        .arg("--bundle-output")
        .arg(&bundle_output)
        .arg("--assets-dest")
        .arg(output_dir)
        .output()
        .map_err(|err| PackageError::Bundler {
            platform,
            details: format!("failed to launch bundler: {err}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let details = if stderr.trim().is_empty() {
            format!("bundler exited with {}", output.status)
        } else {
            stderr.trim().to_owned()
        };
        return Err(PackageError::Bundler { platform, details });
    }

    Ok(())
}

/// Package one platform's bundler output into a distributable archive.
///
/// In incremental mode, assets whose (path, hash) pair already appears in
/// the base manifest are dropped from the tree and the archive; the
/// unfiltered manifest of the current tree is persisted for the next run.
/// The bundle file is always shipped. After archiving, everything except
/// finished archives is cleaned out of the output directory.
///
/// # Errors
/// Fails when the bundle file is missing or any filesystem, archive or
/// manifest step fails.
pub fn package(options: &PackageOptions) -> Result<PackageReport, PackageError> {
    let platform = options.platform;
    let bundle_file = options.output_dir.join(platform.bundle_file_name());
    if !bundle_file.exists() {
        return Err(PackageError::MissingBundle(bundle_file));
    }

    let asset_dirs = asset_dirs(&options.output_dir, platform)?;
    let current = hash_assets(&asset_dirs)?;

    let mut skipped = 0usize;
    if options.incremental {
        let base = load_base_manifest(options);
        skipped = filter_unchanged(&options.output_dir, &current, &base)?;
        prune_empty_dirs(&asset_dirs)?;
    }

    let manifest_path = if options.incremental {
        let path = options
            .manifest_dir
            .join(platform.asset_manifest_file_name());
        fs::write(&path, serde_json::to_string_pretty(&current)?)?;
        Some(path)
    } else {
        None
    };

    let archive_path = options.output_dir.join(platform.package_file_name());
    let surviving: Vec<PathBuf> = asset_dirs.into_iter().filter(|dir| dir.exists()).collect();
    write_archive(&archive_path, &options.output_dir, &bundle_file, &surviving)?;

    clean_output_dir(&options.output_dir)?;

    let included = current.len() - skipped;
    info!(
        "package: {platform} -> {} ({included} assets included, {skipped} skipped)",
        archive_path.display()
    );

    Ok(PackageReport {
        archive_path,
        manifest_path,
        included_assets: included,
        skipped_assets: skipped,
    })
}

/// Top-level directories of the bundler output that carry assets for the
/// platform, in stable order.
fn asset_dirs(output_dir: &Path, platform: Platform) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if platform.is_asset_dir(&name.to_string_lossy()) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Hash every file under the asset directories, keyed relative to the
/// output tree. The bundle file is deliberately absent from the manifest.
fn hash_assets(asset_dirs: &[PathBuf]) -> Result<AssetManifest, PackageError> {
    let mut manifest = AssetManifest::new();
    for dir in asset_dirs {
        let prefix = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for (path, hash) in hasher::hash_tree(dir)? {
            manifest.insert(format!("{prefix}/{path}"), hash);
        }
    }
    Ok(manifest)
}

fn load_base_manifest(options: &PackageOptions) -> AssetManifest {
    let path = match &options.base_manifest {
        Some(path) => path.clone(),
        None => options
            .manifest_dir
            .join(options.platform.asset_manifest_file_name()),
    };
    match fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    "package: ignoring unreadable base manifest {}: {err}",
                    path.display()
                );
                AssetManifest::new()
            }
        },
        Err(_) => {
            info!(
                "package: no base manifest at {}; packaging all assets",
                path.display()
            );
            AssetManifest::new()
        }
    }
}

/// Delete assets whose (path, hash) pair matches the base manifest exactly.
/// New paths and changed hashes stay.
fn filter_unchanged(
    output_dir: &Path,
    current: &AssetManifest,
    base: &AssetManifest,
) -> Result<usize, PackageError> {
    let mut skipped = 0usize;
    for (path, hash) in current {
        if base.get(path) == Some(hash) {
            fs::remove_file(output_dir.join(path))?;
            skipped += 1;
        }
    }
    Ok(skipped)
}

/// Remove directories left empty by filtering, bottom-up, including asset
/// roots that emptied out entirely.
fn prune_empty_dirs(asset_dirs: &[PathBuf]) -> io::Result<()> {
    for dir in asset_dirs {
        for entry in WalkDir::new(dir).contents_first(true) {
            let entry = entry?;
            if entry.file_type().is_dir() && fs::read_dir(entry.path())?.next().is_none() {
                fs::remove_dir(entry.path())?;
            }
        }
    }
    Ok(())
}

fn write_archive(
    archive_path: &Path,
    output_dir: &Path,
    bundle_file: &Path,
    asset_dirs: &[PathBuf],
) -> Result<(), PackageError> {
    let file = fs::File::create(archive_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file(entry_name(output_dir, bundle_file)?, options)?;
    let mut bundle = fs::File::open(bundle_file)?;
    io::copy(&mut bundle, &mut writer)?;

    for dir in asset_dirs {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry_name(output_dir, entry.path())?;
            if entry.file_type().is_dir() {
                writer.add_directory(name, options)?;
            } else if entry.file_type().is_file() {
                writer.start_file(name, options)?;
                let mut source = fs::File::open(entry.path())?;
                io::copy(&mut source, &mut writer)?;
            }
        }
    }

    writer.finish()?;
    Ok(())
}

/// Archive entry name: relative to the output tree, forward slashes.
fn entry_name(output_dir: &Path, path: &Path) -> Result<String, PackageError> {
    let relative = path
        .strip_prefix(output_dir)
        .map_err(io::Error::other)?;
    Ok(relative
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/"))
}

/// Clear consumed inputs out of the output directory, keeping finished
/// archives (including those of previously packaged platforms).
fn clean_output_dir(output_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .ends_with("-package.zip")
        {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
