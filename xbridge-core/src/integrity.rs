//! Integrity: SHA-256 over transferred file bytes.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

pub const DIGEST_LEN: usize = 32;

/// Hash a byte slice. Returns 32-byte digest.
pub fn hash_bytes(payload: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(payload).into()
}

/// Hash a whole file, streaming.
pub fn hash_file(path: &Path) -> std::io::Result<([u8; DIGEST_LEN], u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize().into(), total))
}

/// Incremental digest over chunks as they are written.
#[derive(Default)]
pub struct RunningDigest {
    hasher: Sha256,
    len: u64,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> ([u8; DIGEST_LEN], u64) {
        (self.hasher.finalize().into(), self.len)
    }
}

/// Verify bytes against an expected digest.
pub fn verify(expected: &[u8], actual: &[u8; DIGEST_LEN]) -> bool {
    expected == actual.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_digest_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut running = RunningDigest::new();
        for chunk in data.chunks(333) {
            running.update(chunk);
        }
        let (digest, len) = running.finish();
        assert_eq!(len, data.len() as u64);
        assert!(verify(&hash_bytes(&data), &digest));
    }

    #[test]
    fn file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello chunk").unwrap();
        let (digest, len) = hash_file(&path).unwrap();
        assert_eq!(len, 11);
        assert_eq!(digest, hash_bytes(b"hello chunk"));
        assert!(!verify(&hash_bytes(b"tampered"), &digest));
    }
}
