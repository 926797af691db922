//! Streaming content hash: SHA-256 over SHA-256 digests of fixed 4 MiB
//! blocks, concatenated. Identical algorithm to the remote service's
//! `content_hash`, used for equality checks without a byte transfer.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Streaming hasher with the same interface shape as a `hashlib` hasher:
/// repeated `update()` calls followed by one `finalize()`.
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_pos: usize,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            overall: Sha256::new(),
            block: Sha256::new(),
            block_pos: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.block_pos == BLOCK_SIZE {
                self.overall
                    .update(std::mem::replace(&mut self.block, Sha256::new()).finalize());
                self.block_pos = 0;
            }
            let space = BLOCK_SIZE - self.block_pos;
            let take = space.min(data.len());
            self.block.update(&data[..take]);
            self.block_pos += take;
            data = &data[take..];
        }
    }

    /// Consumes the hasher and returns the 64-hex-character digest.
    pub fn finalize_hex(mut self) -> String {
        if self.block_pos > 0 {
            self.overall.update(self.block.finalize_reset());
        }
        hex::encode(self.overall.finalize())
    }
}

/// Hashes a file from disk in 64 KiB read chunks, following the streaming
/// structure of the host's `compute_md5_hex_streaming`.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Hashes an in-memory buffer in one shot; mainly useful for tests and for
/// small already-resident payloads (e.g. verifying a just-downloaded
/// temp file that's also been read into memory for another purpose).
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_input_hashes_to_sha256_of_empty_digest() {
        let empty_block_digest = Sha256::digest([]);
        let expected = hex::encode(Sha256::digest(empty_block_digest));
        assert_eq!(hash_bytes(b""), expected);
    }

    #[test]
    fn small_input_matches_reference_single_block_hash() {
        let data = b"hello\nfoo";
        let block_digest = Sha256::digest(data);
        let expected = hex::encode(Sha256::digest(block_digest));
        assert_eq!(hash_bytes(data), expected);
    }

    #[test]
    fn chunked_updates_match_single_update() {
        let data = vec![7u8; BLOCK_SIZE + 1234];
        let mut a = ContentHasher::new();
        a.update(&data);
        let whole = a.finalize_hex();

        let mut b = ContentHasher::new();
        for chunk in data.chunks(777) {
            b.update(chunk);
        }
        let piecewise = b.finalize_hex();

        assert_eq!(whole, piecewise);
    }

    #[test]
    fn result_is_64_hex_chars() {
        let digest = hash_bytes(b"anything");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_file_matches_hash_bytes() {
        let dir = std::env::temp_dir().join(format!("hasher-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("f.bin");
        let data = vec![3u8; BLOCK_SIZE * 2 + 10];
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&data).unwrap();
        }
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn exact_multiple_of_block_size_finalizes_cleanly() {
        let data = vec![1u8; BLOCK_SIZE];
        let mut h = ContentHasher::new();
        h.update(&data);
        let digest = h.finalize_hex();
        assert_eq!(digest.len(), 64);
    }
}
