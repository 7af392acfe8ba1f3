//! Content digests for artifacts and table-level integrity checks.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Hex-encoded SHA-256 of a file, streamed in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| Error::storage(format!("cannot open {} for hashing: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::storage(format!("read error hashing {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incremental hasher for table-level digests: rows are fed in order,
/// columns joined with `|` and a `NULL` sentinel for absent values.
pub struct RowHasher {
    hasher: Sha256,
}

impl RowHasher {
    pub fn new() -> Self {
        RowHasher {
            hasher: Sha256::new(),
        }
    }

    pub fn add_row<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let joined: Vec<&str> = values
            .into_iter()
            .map(|v| v.unwrap_or("NULL"))
            .collect();
        self.hasher.update(joined.join("|").as_bytes());
        self.hasher.update(b"\n");
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for RowHasher {
    fn default() -> Self {
        Self::new()
    }
}
