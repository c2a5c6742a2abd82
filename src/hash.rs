use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::errors::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// Length of the hex prefix used for [`image_id_for_path`].
pub const IMAGE_ID_LEN: usize = 16;

pub fn hash_content(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Streams the file through SHA-256 without loading it into memory.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stable identifier derived from the image's path.
pub fn image_id_for_path(path: &Path) -> String {
    let full = hash_content(path.to_string_lossy().as_bytes());
    full[..IMAGE_ID_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_deterministic() {
        let h1 = hash_content(b"hello");
        let h2 = hash_content(b"hello");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_different_inputs() {
        let h1 = hash_content(b"hello");
        let h2 = hash_content(b"world");
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = hash_content(b"hello");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_hash_file_matches_in_memory_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        // spans several chunks
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).await.unwrap(), hash_content(&data));
    }

    #[tokio::test]
    async fn test_hash_file_missing() {
        let dir = TempDir::new().unwrap();
        assert!(hash_file(&dir.path().join("nope.png")).await.is_err());
    }

    #[test]
    fn test_image_id_stable_and_path_sensitive() {
        let a = image_id_for_path(Path::new("/shots/a.png"));
        assert_eq!(a, image_id_for_path(Path::new("/shots/a.png")));
        assert_ne!(a, image_id_for_path(Path::new("/shots/b.png")));
        assert_eq!(a.len(), IMAGE_ID_LEN);
    }
}
