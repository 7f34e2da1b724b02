use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use zip::read::ZipArchive;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const ARCHIVE_SUFFIX: &str = ".zip";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("server returned status {0}")]
    Http(u16),
    #[error("download request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("download incomplete: received {received} of {total} bytes")]
    Truncated { received: u64, total: u64 },
    #[error("payload io error: {0}")]
    Io(#[from] io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Downloads a payload and materializes it into a version directory.
///
/// The previously installed bundle is replaced only after the new payload is
/// fully written: single files stream into a hidden part file renamed over
/// the destination, archives extract into a staging sibling promoted
/// entry-by-entry. Installs for the same directory are serialized.
pub struct BundleInstaller {
    client: Client,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl BundleInstaller {
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("bundle installer: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Download `url` into `version_dir`, creating the directory if needed.
    /// URLs ending in `.zip` are treated as archives and extracted; anything
    /// else is written as the bundle file named `bundle_file_name`.
    ///
    /// # Errors
    /// Fails with `Http` on a non-2xx response, `Request`/`Io`/`Truncated`
    /// when the payload cannot be fully written, `Archive` on a corrupt zip.
    /// On failure the previous contents of `version_dir` are untouched.
    pub async fn install(
        &self,
        url: &str,
        version_dir: &Path,
        bundle_file_name: &str,
    ) -> Result<(), InstallError> {
        fs::create_dir_all(version_dir)?;
        let version_dir = version_dir.canonicalize()?;

        let lock = self.dir_lock(&version_dir);
        let _guard = lock.lock().await;

        clear_stale_staging(&version_dir);

        if is_archive_url(url) {
            self.install_archive(url, &version_dir).await
        } else {
            self.install_file(url, &version_dir.join(bundle_file_name))
                .await
        }
    }

    fn dir_lock(&self, version_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(version_dir.to_path_buf()).or_default().clone()
    }

    async fn install_file(&self, url: &str, bundle_path: &Path) -> Result<(), InstallError> {
        let part = part_path(bundle_path);
        if let Err(err) = self.download_to(url, &part).await {
            let _ = fs::remove_file(&part);
            return Err(err);
        }
        fs::rename(&part, bundle_path)?;
        info!("install_file: installed bundle at {}", bundle_path.display());
        Ok(())
    }

    async fn install_archive(&self, url: &str, version_dir: &Path) -> Result<(), InstallError> {
        let staging = staging_dir(version_dir);
        let payload = payload_path(version_dir);

        let result = self
            .fetch_and_promote(url, &payload, &staging, version_dir)
            .await;
        let _ = fs::remove_file(&payload);
        let _ = fs::remove_dir_all(&staging);
        result
    }

    async fn fetch_and_promote(
        &self,
        url: &str,
        payload: &Path,
        staging: &Path,
        version_dir: &Path,
    ) -> Result<(), InstallError> {
        self.download_to(url, payload).await?;
        fs::create_dir_all(staging)?;
        let stats = extract_archive(payload, staging)?;
        promote(staging, version_dir)?;
        info!(
            "install_archive: {} entries installed into {} ({} skipped)",
            stats.extracted,
            version_dir.display(),
            stats.skipped
        );
        Ok(())
    }

    async fn download_to(&self, url: &str, dest: &Path) -> Result<(), InstallError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::Http(status.as_u16()));
        }

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = File::create(dest).await?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(total) = total
            && downloaded < total
        {
            return Err(InstallError::Truncated {
                received: downloaded,
                total,
            });
        }

        debug!("download_to: {downloaded} bytes -> {}", dest.display());
        Ok(())
    }
}

/// Whether the payload behind `url` is a zip archive, judged by the path
/// suffix with any query or fragment ignored.
fn is_archive_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(ARCHIVE_SUFFIX)
}

fn part_path(bundle_path: &Path) -> PathBuf {
    let name = bundle_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_owned());
    bundle_path.with_file_name(format!(".{name}.part"))
}

fn staging_dir(version_dir: &Path) -> PathBuf {
    version_dir.with_file_name(format!(".stage-{}", dir_name(version_dir)))
}

fn payload_path(version_dir: &Path) -> PathBuf {
    version_dir.with_file_name(format!(".stage-{}.zip", dir_name(version_dir)))
}

fn dir_name(version_dir: &Path) -> String {
    version_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_owned())
}

/// Remove leftovers of an install interrupted before promotion.
fn clear_stale_staging(version_dir: &Path) {
    let staging = staging_dir(version_dir);
    if staging.exists() {
        warn!("install: removing stale staging dir {}", staging.display());
        let _ = fs::remove_dir_all(&staging);
    }
    let payload = payload_path(version_dir);
    if payload.exists() {
        let _ = fs::remove_file(&payload);
    }
    if let Ok(entries) = fs::read_dir(version_dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(".part") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

struct ExtractStats {
    extracted: usize,
    skipped: usize,
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<ExtractStats, InstallError> {
    let file = fs::File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let dest_root = dest.canonicalize()?;

    let mut stats = ExtractStats {
        extracted: 0,
        skipped: 0,
    };
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(
                "extract_archive: skipping entry with unsafe path {:?}",
                entry.name()
            );
            stats.skipped += 1;
            continue;
        };
        let out_path = dest_root.join(&relative);

        if entry.name().ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
            // Canonical check catches paths routed through linked parents.
            let canonical_parent = parent.canonicalize()?;
            if !canonical_parent.starts_with(&dest_root) {
                warn!(
                    "extract_archive: skipping entry escaping destination: {:?}",
                    entry.name()
                );
                stats.skipped += 1;
                continue;
            }
        }
        let mut out_file = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out_file)?;
        stats.extracted += 1;
    }

    Ok(stats)
}

/// Move freshly extracted entries into the destination, replacing files the
/// archive shipped and leaving everything else in place. Incremental
/// archives omit unchanged assets, so the destination must be merged into,
/// not replaced.
fn promote(staging: &Path, dest: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            promote(&entry.path(), &target)?;
        } else {
            if target.exists() {
                fs::remove_file(&target)?;
            }
            fs::rename(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn write_archive(dest: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(dest).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(bytes).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    /// Byte-level rename of an archive entry, bypassing any name filtering
    /// the writer might apply. Replacement must match the original length.
    fn rename_entry(archive: &Path, from: &[u8], to: &[u8]) {
        assert_eq!(from.len(), to.len());
        let mut bytes = fs::read(archive).unwrap();
        let mut i = 0;
        while i + from.len() <= bytes.len() {
            if &bytes[i..i + from.len()] == from {
                bytes[i..i + from.len()].copy_from_slice(to);
                i += from.len();
            } else {
                i += 1;
            }
        }
        fs::write(archive, bytes).unwrap();
    }

    async fn serve_bytes(server: &MockServer, route: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    #[test]
    fn detects_archive_urls_by_suffix() {
        assert!(is_archive_url("https://x/android-package.zip"));
        assert!(is_archive_url("https://x/pack.zip?token=abc"));
        assert!(is_archive_url("https://x/pack.zip#frag"));
        assert!(!is_archive_url("https://x/index.android.bundle"));
        assert!(!is_archive_url("https://x/pack.zip.sig"));
    }

    #[tokio::test]
    async fn installs_single_file_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        let server = MockServer::start().await;
        serve_bytes(&server, "/index.android.bundle", b"bundle-bytes".to_vec()).await;

        let installer = BundleInstaller::new();
        installer
            .install(
                &format!("{}/index.android.bundle", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap();

        let installed = fs::read(version_dir.join("index.android.bundle")).unwrap();
        assert_eq!(installed, b"bundle-bytes");
        assert!(!version_dir.join(".index.android.bundle.part").exists());
    }

    #[tokio::test]
    async fn failed_download_keeps_previous_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("index.android.bundle"), b"old").unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.android.bundle"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let installer = BundleInstaller::new();
        let err = installer
            .install(
                &format!("{}/index.android.bundle", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Http(404)));
        let kept = fs::read(version_dir.join("index.android.bundle")).unwrap();
        assert_eq!(kept, b"old");
    }

    #[tokio::test]
    async fn extracts_archive_payload() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        let archive = dir.path().join("pack.zip");
        write_archive(
            &archive,
            &[
                ("index.android.bundle", b"new-bundle".as_slice()),
                ("drawable-mdpi/", b"".as_slice()),
                ("drawable-mdpi/icon.png", b"png".as_slice()),
            ],
        );

        let server = MockServer::start().await;
        serve_bytes(&server, "/pack.zip", fs::read(&archive).unwrap()).await;

        let installer = BundleInstaller::new();
        installer
            .install(
                &format!("{}/pack.zip", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap();

        assert_eq!(
            fs::read(version_dir.join("index.android.bundle")).unwrap(),
            b"new-bundle"
        );
        assert_eq!(
            fs::read(version_dir.join("drawable-mdpi/icon.png")).unwrap(),
            b"png"
        );
        assert!(!staging_dir(&version_dir).exists());
        assert!(!payload_path(&version_dir).exists());
    }

    #[tokio::test]
    async fn skips_entries_escaping_the_destination() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("storage/ota/2.0.0");
        let archive = dir.path().join("evil.zip");
        write_archive(
            &archive,
            &[
                ("ZZ/ZZ/evil.txt", b"gotcha".as_slice()),
                ("ok.txt", b"fine".as_slice()),
            ],
        );
        rename_entry(&archive, b"ZZ/ZZ/evil.txt", b"../../evil.txt");

        let server = MockServer::start().await;
        serve_bytes(&server, "/evil.zip", fs::read(&archive).unwrap()).await;

        let installer = BundleInstaller::new();
        installer
            .install(
                &format!("{}/evil.zip", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap();

        // The benign entry installs, the traversal entry is dropped.
        assert_eq!(fs::read(version_dir.join("ok.txt")).unwrap(), b"fine");
        assert!(!dir.path().join("storage/evil.txt").exists());
        assert!(!dir.path().join("evil.txt").exists());
        assert!(!version_dir.join("evil.txt").exists());
    }

    #[tokio::test]
    async fn archive_install_preserves_files_not_in_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        fs::create_dir_all(version_dir.join("drawable-mdpi")).unwrap();
        fs::write(version_dir.join("index.android.bundle"), b"old-bundle").unwrap();
        fs::write(version_dir.join("drawable-mdpi/kept.png"), b"kept").unwrap();

        let archive = dir.path().join("pack.zip");
        write_archive(
            &archive,
            &[
                ("index.android.bundle", b"new-bundle".as_slice()),
                ("drawable-mdpi/changed.png", b"changed".as_slice()),
            ],
        );
        let server = MockServer::start().await;
        serve_bytes(&server, "/pack.zip", fs::read(&archive).unwrap()).await;

        let installer = BundleInstaller::new();
        installer
            .install(
                &format!("{}/pack.zip", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap();

        assert_eq!(
            fs::read(version_dir.join("index.android.bundle")).unwrap(),
            b"new-bundle"
        );
        assert_eq!(
            fs::read(version_dir.join("drawable-mdpi/kept.png")).unwrap(),
            b"kept"
        );
        assert_eq!(
            fs::read(version_dir.join("drawable-mdpi/changed.png")).unwrap(),
            b"changed"
        );
    }

    #[tokio::test]
    async fn failed_archive_download_leaves_no_staging_behind() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("index.android.bundle"), b"old").unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pack.zip"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let installer = BundleInstaller::new();
        let err = installer
            .install(
                &format!("{}/pack.zip", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Http(500)));
        assert_eq!(
            fs::read(version_dir.join("index.android.bundle")).unwrap(),
            b"old"
        );
        assert!(!staging_dir(&version_dir).exists());
        assert!(!payload_path(&version_dir).exists());
    }

    #[tokio::test]
    async fn corrupt_archive_fails_without_touching_destination() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("index.android.bundle"), b"old").unwrap();

        let server = MockServer::start().await;
        serve_bytes(&server, "/pack.zip", b"this is not a zip".to_vec()).await;

        let installer = BundleInstaller::new();
        let err = installer
            .install(
                &format!("{}/pack.zip", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Archive(_)));
        assert_eq!(
            fs::read(version_dir.join("index.android.bundle")).unwrap(),
            b"old"
        );
        assert!(!staging_dir(&version_dir).exists());
    }

    #[tokio::test]
    async fn stale_staging_is_cleared_before_install() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("ota/2.0.0");
        fs::create_dir_all(&version_dir).unwrap();
        fs::create_dir_all(staging_dir(&version_dir)).unwrap();
        fs::write(staging_dir(&version_dir).join("orphan"), b"x").unwrap();
        fs::write(version_dir.join(".index.android.bundle.part"), b"y").unwrap();

        let server = MockServer::start().await;
        serve_bytes(&server, "/index.android.bundle", b"fresh".to_vec()).await;

        let installer = BundleInstaller::new();
        installer
            .install(
                &format!("{}/index.android.bundle", server.uri()),
                &version_dir,
                "index.android.bundle",
            )
            .await
            .unwrap();

        assert!(!staging_dir(&version_dir).exists());
        assert!(!version_dir.join(".index.android.bundle.part").exists());
        assert_eq!(
            fs::read(version_dir.join("index.android.bundle")).unwrap(),
            b"fresh"
        );
    }
}
