use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Map from forward-slash relative path to lowercase hex SHA-256 digest.
///
/// Keyed storage is ordered so that serializing the same tree twice yields
/// byte-identical output regardless of filesystem iteration order.
pub type AssetManifest = BTreeMap<String, String>;

const HASH_BUFFER_SIZE: usize = 8192;

/// Compute the SHA-256 digest of a file as a lowercase hex string.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash every regular file under `root`, keyed by its relative path.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a file cannot be read.
pub fn hash_tree(root: &Path) -> io::Result<AssetManifest> {
    let mut manifest = AssetManifest::new();

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?;
        let key = relative
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        manifest.insert(key, hash_file(entry.path())?);
    }

    Ok(manifest)
}
