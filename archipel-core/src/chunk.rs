//! File manifests and the chunk wire codec: fixed-size chunking with sha-256
//! per chunk and for the whole file, and content-derived offer ids.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;
/// Chunk frames cap the body length with a u16.
pub const MAX_CHUNK_BYTES: usize = u16::MAX as usize;
/// Magic prefix of a chunk frame inside a decrypted payload.
pub const CHUNK_MAGIC: [u8; 4] = *b"FCH1";
/// Offer ids are the first 16 hex chars of the content hash.
pub const OFFER_ID_LEN: usize = 16;
/// magic + offer id + index + total + chunk hash + body length.
pub const CHUNK_HEADER_SIZE: usize = 4 + OFFER_ID_LEN + 4 + 4 + 32 + 2;

/// Sha-256 of a chunk body.
pub fn hash_chunk(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Descriptor of a file's chunk layout, exchanged ahead of any chunk data so
/// every piece and the whole can be verified independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    pub offer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub file_hash: String,
    pub chunk_hashes: Vec<String>,
}

impl FileManifest {
    /// Structural completeness check applied to manifests off the network.
    pub fn is_structurally_valid(&self) -> bool {
        self.offer_id.len() == OFFER_ID_LEN
            && self.offer_id.is_ascii()
            && !self.file_name.is_empty()
            && self.chunk_size > 0
            && self.chunk_hashes.len() == self.total_chunks as usize
    }

    /// Raw digest for chunk `index`, when present and well-formed.
    pub fn chunk_hash_bytes(&self, index: u32) -> Option<[u8; 32]> {
        let hex_digest = self.chunk_hashes.get(index as usize)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(hex_digest, &mut out).ok()?;
        Some(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("chunk size must be positive")]
    BadChunkSize,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read `path` in fixed-size chunks, hashing each chunk and the whole file,
/// and derive the content-addressed offer id.
pub fn build_manifest(path: &Path, chunk_size: usize) -> Result<FileManifest, ManifestError> {
    if chunk_size == 0 {
        return Err(ManifestError::BadChunkSize);
    }
    if !path.is_file() {
        return Err(ManifestError::NotFound(path.display().to_string()));
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut file = File::open(path)?;
    let mut chunk_hashes = Vec::new();
    let mut file_hasher = Sha256::new();
    let mut file_size: u64 = 0;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        chunk_hashes.push(hex::encode(hash_chunk(chunk)));
        file_hasher.update(chunk);
        file_size += n as u64;
    }

    let file_hash = hex::encode(file_hasher.finalize());
    let seed = format!("{}:{}:{}", file_name, file_size, file_hash);
    let offer_id = hex::encode(Sha256::digest(seed.as_bytes()))[..OFFER_ID_LEN].to_string();

    Ok(FileManifest {
        offer_id,
        file_name,
        file_size,
        chunk_size: chunk_size as u32,
        total_chunks: chunk_hashes.len() as u32,
        file_hash,
        chunk_hashes,
    })
}

/// Read the chunk at `index` from an offered file. Short reads at the tail
/// return the remaining bytes.
pub fn read_chunk_at(path: &Path, index: u32, chunk_size: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(index as u64 * chunk_size as u64))?;
    let mut buf = vec![0u8; chunk_size];
    let n = read_full(&mut file, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// One chunk frame as carried inside a decrypted SECURE_MSG payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChunk {
    pub offer_id: String,
    pub index: u32,
    pub total_chunks: u32,
    pub chunk_hash: [u8; 32],
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkCodecError {
    #[error("offer id must be {} ascii characters", OFFER_ID_LEN)]
    BadOfferId,
    #[error("chunk body too large: {0} bytes")]
    BodyTooLarge(usize),
}

/// Encode a chunk frame: fixed header then the raw body.
pub fn encode_file_chunk(chunk: &FileChunk) -> Result<Vec<u8>, ChunkCodecError> {
    if chunk.offer_id.len() != OFFER_ID_LEN || !chunk.offer_id.is_ascii() {
        return Err(ChunkCodecError::BadOfferId);
    }
    if chunk.data.len() > MAX_CHUNK_BYTES {
        return Err(ChunkCodecError::BodyTooLarge(chunk.data.len()));
    }
    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + chunk.data.len());
    out.extend_from_slice(&CHUNK_MAGIC);
    out.extend_from_slice(chunk.offer_id.as_bytes());
    out.extend_from_slice(&chunk.index.to_be_bytes());
    out.extend_from_slice(&chunk.total_chunks.to_be_bytes());
    out.extend_from_slice(&chunk.chunk_hash);
    out.extend_from_slice(&(chunk.data.len() as u16).to_be_bytes());
    out.extend_from_slice(&chunk.data);
    Ok(out)
}

/// Try to parse a decrypted payload as a chunk frame. `None` means "not a
/// chunk": wrong magic, short header, or a length field that disagrees with
/// the body; the caller falls through to the object parser.
pub fn decode_file_chunk(data: &[u8]) -> Option<FileChunk> {
    if data.len() < CHUNK_HEADER_SIZE {
        return None;
    }
    if data[..4] != CHUNK_MAGIC {
        return None;
    }
    let offer_id = std::str::from_utf8(&data[4..20]).ok()?.to_string();
    let index = u32::from_be_bytes(data[20..24].try_into().ok()?);
    let total_chunks = u32::from_be_bytes(data[24..28].try_into().ok()?);
    let mut chunk_hash = [0u8; 32];
    chunk_hash.copy_from_slice(&data[28..60]);
    let declared = u16::from_be_bytes([data[60], data[61]]) as usize;
    let body = &data[CHUNK_HEADER_SIZE..];
    if body.len() != declared {
        return None;
    }
    Some(FileChunk {
        offer_id,
        index,
        total_chunks,
        chunk_hash,
        data: body.to_vec(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("{0} chunks missing")]
    MissingChunks(usize),
    #[error("file hash mismatch after assembly")]
    HashMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Write collected chunks in index order, recomputing the whole-file hash and
/// failing if it diverges from the manifest. Catches truncation and any
/// reconstruction that individually valid chunks cannot.
pub fn assemble_file(
    manifest: &FileManifest,
    chunks: &BTreeMap<u32, Vec<u8>>,
    output: &Path,
) -> Result<(), AssembleError> {
    let missing = (0..manifest.total_chunks)
        .filter(|index| !chunks.contains_key(index))
        .count();
    if missing > 0 {
        return Err(AssembleError::MissingChunks(missing));
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut hasher = Sha256::new();
    let mut out = File::create(output)?;
    for index in 0..manifest.total_chunks {
        let data = &chunks[&index];
        hasher.update(data);
        out.write_all(data)?;
    }
    if hex::encode(hasher.finalize()) != manifest.file_hash {
        return Err(AssembleError::HashMismatch);
    }
    Ok(())
}
