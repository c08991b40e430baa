//! Content-defined chunking over whole files (spec §4.1).
//!
//! FastCDC chunk boundaries are a function of content, not offset, so two
//! files that differ by a small insertion share almost all of their chunks
//! — that's what makes `TransferExecutor`'s chunked dedup path cheap.

use crate::error::{Result, SyncError};
use fastcdc::v2020::FastCDC;
use sha2::{Digest, Sha256};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    pub hash: [u8; 32],
    pub bytes: Vec<u8>,
}

pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hash_file(path: &Path) -> Result<[u8; 32]> {
    use std::io::Read;
    let mut f = std::fs::File::open(path).map_err(|e| SyncError::io(path.display().to_string(), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| SyncError::io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// FastCDC over a file's bytes, min/avg/max as configured (spec default
/// 4/16/64 KiB). Reads the whole file once; chunk boundaries and hashes are
/// deterministic given the same bytes and parameters.
pub fn chunk_file(path: &Path, min: u32, avg: u32, max: u32) -> Result<Vec<Chunk>> {
    let data = std::fs::read(path).map_err(|e| SyncError::io(path.display().to_string(), e))?;
    Ok(chunk_bytes(&data, min, avg, max))
}

pub fn chunk_bytes(data: &[u8], min: u32, avg: u32, max: u32) -> Vec<Chunk> {
    if data.is_empty() {
        return Vec::new();
    }
    FastCDC::new(data, min, avg, max)
        .map(|c| {
            let slice = &data[c.offset..c.offset + c.length];
            Chunk { hash: hash_bytes(slice), bytes: slice.to_vec() }
        })
        .collect()
}

/// Concatenate chunk bytes back into the original file content.
pub fn reassemble(chunks: &[Chunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunks.iter().map(|c| c.bytes.len()).sum());
    for c in chunks {
        out.extend_from_slice(&c.bytes);
    }
    out
}
