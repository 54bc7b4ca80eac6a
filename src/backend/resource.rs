//! Synthetic payloads published during benchmark rounds.

use parking_lot::Mutex;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Multihash code and digest length for SHA3-256
const MULTIHASH_PREFIX: [u8; 2] = [0x16, 0x20];
const CHUNK_SIZE: usize = 64 * 1024;

/// Hex-encoded multihash of `data`
pub fn multihash_hex(data: &[u8]) -> String {
    let digest = Sha3_256::digest(data);
    let mut encoded = Vec::with_capacity(MULTIHASH_PREFIX.len() + digest.len());
    encoded.extend_from_slice(&MULTIHASH_PREFIX);
    encoded.extend_from_slice(&digest);
    hex::encode(encoded)
}

/// Write `size_bytes` random bytes into `dir`, named after their multihash.
///
/// Returns the file path and name.
pub fn generate_file(size_bytes: usize, dir: &Path) -> io::Result<(PathBuf, String)> {
    let mut data = vec![0u8; size_bytes];
    let mut rng = rand::thread_rng();
    for chunk in data.chunks_mut(CHUNK_SIZE) {
        rng.fill_bytes(chunk);
    }

    let name = multihash_hex(&data);
    fs::create_dir_all(dir)?;
    let path = dir.join(&name);
    fs::write(&path, &data)?;
    debug!("Generated {} ({} bytes)", path.display(), size_bytes);
    Ok((path, name))
}

/// Generates one resource directory per requester, replacing the previous one each time.
pub struct OneShotResourceCreator {
    file_size: usize,
    dirs: Mutex<HashMap<String, PathBuf>>,
}

impl OneShotResourceCreator {
    pub fn new(file_size: usize) -> Self {
        Self {
            file_size,
            dirs: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a fresh file for `identifier` under a new sub-directory of `directory`,
    /// removing whatever was last generated for it.
    pub fn create(&self, identifier: &str, directory: &Path) -> io::Result<PathBuf> {
        let previous = self.dirs.lock().remove(identifier);
        if let Some(previous) = previous {
            if previous.exists() {
                fs::remove_dir_all(&previous)?;
            }
        }

        let sub_dir = directory.join(uuid::Uuid::new_v4().to_string());
        let (path, _) = generate_file(self.file_size, &sub_dir)?;
        self.dirs.lock().insert(identifier.to_string(), sub_dir);
        Ok(path)
    }
}
