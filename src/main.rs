use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};

use over_the_air::packager::{self, PackageOptions};
use over_the_air::platform::Platform;

#[derive(Parser, Debug)]
#[command(
    name = "ota",
    author,
    version,
    about = "Bundle and package over-the-air updates for hosting"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the JS bundler and package its output into per-platform archives.
    Bundle {
        /// Platform(s) to bundle.
        #[arg(value_enum, default_value = "all")]
        platform: PlatformArg,

        /// Package only assets that changed since the base manifest.
        #[arg(long)]
        incremental: bool,

        /// Diff against this manifest instead of the cached one.
        #[arg(long, requires = "incremental")]
        base_manifest: Option<PathBuf>,

        /// Entry point handed to the bundler.
        #[arg(long, default_value = "index.js")]
        entry_file: PathBuf,

        /// Directory receiving the packaged archives.
        #[arg(long, default_value = "ota-server-files")]
        output_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlatformArg {
    Android,
    Ios,
    All,
}

impl PlatformArg {
    fn platforms(self) -> Vec<Platform> {
        match self {
            PlatformArg::Android => vec![Platform::Android],
            PlatformArg::Ios => vec![Platform::Ios],
            PlatformArg::All => Platform::ALL.to_vec(),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Bundle {
            platform,
            incremental,
            base_manifest,
            entry_file,
            output_dir,
        } => bundle(
            &platform.platforms(),
            incremental,
            base_manifest,
            &entry_file,
            &output_dir,
        ),
    }
}

fn bundle(
    platforms: &[Platform],
    incremental: bool,
    base_manifest: Option<PathBuf>,
    entry_file: &Path,
    output_dir: &Path,
) -> ExitCode {
    if let Err(err) = reset_output_dir(output_dir) {
        error!("bundle: cannot prepare {}: {err}", output_dir.display());
        return ExitCode::FAILURE;
    }
    let manifest_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let mut packaged = 0usize;
    for &platform in platforms {
        if let Err(err) = packager::run_bundler(platform, entry_file, output_dir) {
            error!("bundle: skipping {platform}: {err}");
            continue;
        }

        let options = PackageOptions {
            platform,
            output_dir: output_dir.to_path_buf(),
            incremental,
            base_manifest: base_manifest.clone(),
            manifest_dir: manifest_dir.clone(),
        };
        match packager::package(&options) {
            Ok(report) => {
                info!(
                    "bundle: {platform} ready at {} ({} assets included, {} skipped)",
                    report.archive_path.display(),
                    report.included_assets,
                    report.skipped_assets
                );
                packaged += 1;
            }
            Err(err) => error!("bundle: skipping {platform}: {err}"),
        }
    }

    if packaged == 0 {
        error!("bundle: no platform was packaged");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Start each run from an empty output directory so stale artifacts of a
/// previous run never leak into the archives.
fn reset_output_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::create_dir_all(dir)
}
