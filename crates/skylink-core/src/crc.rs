//! CRC32 helpers
//!
//! Standard IEEE CRC-32, computed incrementally so a file never has to be
//! held in memory for checksumming.

use std::io::Read;
use std::path::Path;

/// Read buffer for file checksums
const CRC_READ_BUF: usize = 8192;

/// Incremental CRC32 accumulator
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
    len: u64,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// CRC32 of a whole file, streamed in fixed-size reads
pub fn file_crc32(path: &Path) -> std::io::Result<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut crc = Crc32::new();
    let mut buf = [0u8; CRC_READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
    }
    Ok(crc.value())
}
