//! Wire protocol: length-prefixed bincode frames over a bidirectional
//! stream (spec §6). Framing is a 4-byte big-endian length prefix followed
//! by the bincode payload, exactly as the teacher's `send_msg`/`recv_msg`
//! already did — only the message shapes changed.

use crate::state::FileState;
use crate::vclock::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Serialize, Deserialize)]
pub enum SyncRequest {
    GetMST { sync_id: String },
    GetFiles { sync_id: String },
    GetFileData { sync_id: String, relative_path: String },
    PutFileData { sync_id: String, relative_path: String, bytes: Vec<u8>, vector_clock: Option<VectorClock> },
    /// `deletions` carries each path's tombstone vector clock — the
    /// requester already decided (via the decision engine) that this
    /// clock should win, so the recipient applies it without re-deriving
    /// causal order itself (spec §4.8 rules 4 and 6).
    DeleteFiles { sync_id: String, deletions: HashMap<String, VectorClock> },
    GetFileChunks { sync_id: String, relative_path: String },
    GetChunkData { sync_id: String, chunk_hash: [u8; 32] },
    PutFileChunks { sync_id: String, relative_path: String, chunk_hashes: Vec<[u8; 32]>, vector_clock: Option<VectorClock> },
    PutChunkData { sync_id: String, chunk_hash: [u8; 32], bytes: Vec<u8> },
}

/// Legacy per-file metadata, kept only so servers can emit the pre-`FilesV2`
/// shape for compatibility (spec §9 open question).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyFileMetadata {
    pub content_hash: [u8; 32],
    pub mtime_unix: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum SyncResponse {
    MstRoot { sync_id: String, digest: Option<[u8; 32]> },
    /// Legacy encoding: `Exists` entries plus a separate deleted-paths list,
    /// with no per-tombstone vector clock.
    Files { sync_id: String, files: HashMap<String, LegacyFileMetadata>, deleted_paths: Vec<String> },
    /// Unified encoding servers MUST prefer when emitting.
    FilesV2 { sync_id: String, files: HashMap<String, FileState> },
    FileData { sync_id: String, path: String, bytes: Vec<u8> },
    PutAck { sync_id: String, path: String },
    DeleteAck { sync_id: String },
    FileChunks { sync_id: String, path: String, chunk_hashes: Vec<[u8; 32]> },
    ChunkData { sync_id: String, chunk_hash: [u8; 32], bytes: Vec<u8> },
    FileChunksAck { sync_id: String, path: String },
    ChunkAck { sync_id: String, chunk_hash: [u8; 32] },
    /// This server has no folder registered for `sync_id`. Distinct from
    /// `Error` so callers can tell "drop this peer for this sync_id" apart
    /// from a real failure (spec §4.11, §7).
    FolderNotFound { sync_id: String },
    Error { text: String },
}

pub fn encode_request(msg: &SyncRequest) -> Vec<u8> {
    bincode::serialize(msg).expect("serialize SyncRequest")
}
pub fn encode_response(msg: &SyncResponse) -> Vec<u8> {
    bincode::serialize(msg).expect("serialize SyncResponse")
}
pub fn decode_request(buf: &[u8]) -> crate::error::Result<SyncRequest> {
    Ok(bincode::deserialize(buf)?)
}
pub fn decode_response(buf: &[u8]) -> crate::error::Result<SyncResponse> {
    Ok(bincode::deserialize(buf)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    let len = (bytes.len() as u32).to_be_bytes();
    w.write_all(&len).await?;
    w.write_all(bytes).await?;
    w.flush().await
}

/// Returns `Ok(None)` on a clean stream close, mirroring the teacher's
/// `recv_msg` contract of tolerating EOF as "no more messages".
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if r.read_exact(&mut len_buf).await.is_err() {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    if r.read_exact(&mut buf).await.is_err() {
        return Ok(None);
    }
    Ok(Some(buf))
}

pub async fn send_request<W: AsyncWrite + Unpin>(w: &mut W, msg: &SyncRequest) -> std::io::Result<()> {
    write_frame(w, &encode_request(msg)).await
}
pub async fn send_response<W: AsyncWrite + Unpin>(w: &mut W, msg: &SyncResponse) -> std::io::Result<()> {
    write_frame(w, &encode_response(msg)).await
}

pub async fn recv_request<R: AsyncRead + Unpin>(r: &mut R) -> crate::error::Result<Option<SyncRequest>> {
    match read_frame(r).await? {
        Some(buf) => Ok(Some(decode_request(&buf)?)),
        None => Ok(None),
    }
}
pub async fn recv_response<R: AsyncRead + Unpin>(r: &mut R) -> crate::error::Result<Option<SyncResponse>> {
    match read_frame(r).await? {
        Some(buf) => Ok(Some(decode_response(&buf)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrips_over_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = SyncRequest::GetMST { sync_id: "ab12".into() };
        send_request(&mut a, &req).await.unwrap();
        let got = recv_request(&mut b).await.unwrap().unwrap();
        match got {
            SyncRequest::GetMST { sync_id } => assert_eq!(sync_id, "ab12"),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn response_roundtrips_filesv2() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let mut files = HashMap::new();
        files.insert(
            "a.txt".to_string(),
            FileState::Exists(crate::state::FileMetadata {
                content_hash: [1u8; 32],
                mtime: chrono::Utc::now(),
                vector_clock: VectorClock::new(),
                size: 5,
            }),
        );
        let resp = SyncResponse::FilesV2 { sync_id: "ab12".into(), files };
        send_response(&mut a, &resp).await.unwrap();
        let got = recv_response(&mut b).await.unwrap().unwrap();
        assert!(matches!(got, SyncResponse::FilesV2 { .. }));
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (a, mut b) = tokio::io::duplex(16);
        drop(a);
        let got = recv_request(&mut b).await.unwrap();
        assert!(got.is_none());
    }
}
