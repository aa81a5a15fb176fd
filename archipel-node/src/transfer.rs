//! File transfer: offers, download requests, chunk streaming, and verified
//! reassembly on top of the secure channel.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use archipel_core::chunk::{self, FileChunk, FileManifest, DEFAULT_CHUNK_SIZE};
use archipel_core::identity::NodeId;
use archipel_core::message::SecureObject;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::secure_channel::{ChannelError, SecureChannel};

/// Chunk-arrival progress is logged every this many stored chunks.
const PROGRESS_EVERY: u32 = 25;

/// A file this node serves chunks from.
#[derive(Debug, Clone)]
pub struct LocalOffer {
    pub manifest: FileManifest,
    pub path: PathBuf,
}

/// A file some peer announced to us.
#[derive(Debug, Clone)]
pub struct RemoteOffer {
    pub manifest: FileManifest,
    pub owner: NodeId,
    pub seen_at: SystemTime,
}

/// An in-flight download, chunks keyed by index so arrival order is free.
#[derive(Debug)]
pub struct Download {
    manifest: FileManifest,
    owner: NodeId,
    chunks: BTreeMap<u32, Vec<u8>>,
    started_at: Instant,
}

/// Why a received chunk frame was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReject {
    WrongOwner,
    IndexOutOfRange,
    HashNotInManifest,
    ContentMismatch,
}

/// Result of feeding one chunk frame into a download.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkIngest {
    Stored { have: u32, total: u32 },
    Duplicate,
    Rejected(ChunkReject),
}

impl Download {
    fn new(manifest: FileManifest, owner: NodeId) -> Self {
        Self {
            manifest,
            owner,
            chunks: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    pub fn have(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Validate and store one chunk. A frame is rejected when the sender is
    /// not the offer's owner, the index is out of range, the declared hash is
    /// not the manifest's hash for that index, or the body does not actually
    /// hash to the declared digest (forged/garbled header defense).
    /// Duplicates are ignored, not overwritten.
    pub fn ingest(&mut self, from: &NodeId, frame: &FileChunk) -> ChunkIngest {
        if from != &self.owner {
            return ChunkIngest::Rejected(ChunkReject::WrongOwner);
        }
        if frame.index >= self.manifest.total_chunks {
            return ChunkIngest::Rejected(ChunkReject::IndexOutOfRange);
        }
        let claimed = hex::encode(frame.chunk_hash);
        if self.manifest.chunk_hashes[frame.index as usize] != claimed {
            return ChunkIngest::Rejected(ChunkReject::HashNotInManifest);
        }
        if hex::encode(chunk::hash_chunk(&frame.data)) != claimed {
            return ChunkIngest::Rejected(ChunkReject::ContentMismatch);
        }
        if self.chunks.contains_key(&frame.index) {
            return ChunkIngest::Duplicate;
        }
        self.chunks.insert(frame.index, frame.data.clone());
        ChunkIngest::Stored {
            have: self.chunks.len() as u32,
            total: self.manifest.total_chunks,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Manifest(#[from] chunk::ManifestError),
    #[error("unknown offer id")]
    UnknownOffer,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Summary row for display layers.
#[derive(Debug, Clone)]
pub struct OfferSummary {
    pub offer_id: String,
    pub owner: NodeId,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
}

pub struct FileTransfer {
    channel: Arc<SecureChannel>,
    download_dir: PathBuf,
    local_offers: Mutex<HashMap<String, LocalOffer>>,
    remote_offers: Mutex<HashMap<String, RemoteOffer>>,
    downloads: Mutex<HashMap<String, Download>>,
}

impl FileTransfer {
    pub fn new(channel: Arc<SecureChannel>, download_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            download_dir: download_dir.into(),
            local_offers: Mutex::new(HashMap::new()),
            remote_offers: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
        })
    }

    /// Build a manifest for `path` and announce it to `peer_id`. The offer is
    /// remembered locally so chunk requests can be served later.
    pub async fn offer_file(
        &self,
        peer_id: &NodeId,
        path: &Path,
    ) -> Result<FileManifest, TransferError> {
        let manifest = chunk::build_manifest(path, DEFAULT_CHUNK_SIZE)?;
        self.local_offers.lock().insert(
            manifest.offer_id.clone(),
            LocalOffer {
                manifest: manifest.clone(),
                path: path.to_path_buf(),
            },
        );
        self.channel
            .send_secure_object(
                peer_id,
                &SecureObject::FileOffer {
                    manifest: manifest.clone(),
                },
            )
            .await?;
        info!(
            offer = %manifest.offer_id,
            file = %manifest.file_name,
            peer = %peer_id.short(),
            "file offered"
        );
        Ok(manifest)
    }

    /// Offers announced by peers, newest knowledge of each id.
    pub fn list_remote_offers(&self) -> Vec<OfferSummary> {
        self.remote_offers
            .lock()
            .iter()
            .map(|(offer_id, offer)| OfferSummary {
                offer_id: offer_id.clone(),
                owner: offer.owner,
                file_name: offer.manifest.file_name.clone(),
                file_size: offer.manifest.file_size,
                total_chunks: offer.manifest.total_chunks,
            })
            .collect()
    }

    /// Ask the owner of a known remote offer to stream its chunks.
    pub async fn request_download(&self, offer_id: &str) -> Result<(), TransferError> {
        let (owner, manifest) = {
            let offers = self.remote_offers.lock();
            let offer = offers.get(offer_id).ok_or(TransferError::UnknownOffer)?;
            (offer.owner, offer.manifest.clone())
        };
        self.downloads
            .lock()
            .insert(offer_id.to_string(), Download::new(manifest, owner));
        self.channel
            .send_secure_object(
                &owner,
                &SecureObject::FileGet {
                    offer_id: offer_id.to_string(),
                },
            )
            .await?;
        info!(offer = %offer_id, owner = %owner.short(), "download requested");
        Ok(())
    }

    /// Accept an offer announcement. Structurally incomplete manifests are
    /// ignored without a reply.
    pub fn handle_offer(&self, from: NodeId, manifest: FileManifest) {
        if !manifest.is_structurally_valid() {
            debug!(peer = %from.short(), "ignoring malformed file offer");
            return;
        }
        info!(
            offer = %manifest.offer_id,
            file = %manifest.file_name,
            size = manifest.file_size,
            peer = %from.short(),
            "file offer received"
        );
        self.remote_offers.lock().insert(
            manifest.offer_id.clone(),
            RemoteOffer {
                manifest,
                owner: from,
                seen_at: SystemTime::now(),
            },
        );
    }

    /// Serve a download request: stream every chunk in ascending index
    /// order. Ascending order is a simplicity choice, not something the
    /// receiver depends on.
    pub async fn handle_get(&self, from: NodeId, offer_id: &str) -> Result<(), TransferError> {
        let offer = { self.local_offers.lock().get(offer_id).cloned() };
        let Some(offer) = offer else {
            debug!(peer = %from.short(), offer = %offer_id, "request for unknown local offer");
            return Ok(());
        };
        let total = offer.manifest.total_chunks;
        for index in 0..total {
            let data = chunk::read_chunk_at(&offer.path, index, offer.manifest.chunk_size as usize)?;
            let Some(chunk_hash) = offer.manifest.chunk_hash_bytes(index) else {
                warn!(offer = %offer_id, index, "local manifest digest unreadable, aborting stream");
                return Ok(());
            };
            let frame = FileChunk {
                offer_id: offer_id.to_string(),
                index,
                total_chunks: total,
                chunk_hash,
                data,
            };
            self.channel.send_file_chunk(&from, &frame).await?;
        }
        info!(offer = %offer_id, peer = %from.short(), total, "chunk stream finished");
        Ok(())
    }

    /// Store one received chunk; finalize when the set is complete.
    pub fn handle_chunk(&self, from: NodeId, frame: FileChunk) {
        let outcome = {
            let mut downloads = self.downloads.lock();
            let Some(download) = downloads.get_mut(&frame.offer_id) else {
                debug!(offer = %frame.offer_id, "chunk for unknown download");
                return;
            };
            download.ingest(&from, &frame)
        };
        match outcome {
            ChunkIngest::Stored { have, total } => {
                if have % PROGRESS_EVERY == 0 || have == total {
                    info!(offer = %frame.offer_id, have, total, "download progress");
                }
                if have == total {
                    self.finalize(&frame.offer_id);
                }
            }
            ChunkIngest::Duplicate => {}
            ChunkIngest::Rejected(reason) => {
                warn!(
                    offer = %frame.offer_id,
                    peer = %from.short(),
                    index = frame.index,
                    ?reason,
                    "chunk rejected"
                );
            }
        }
    }

    /// Assemble a completed download under the download directory. Failures
    /// keep the collected chunks so the transfer can be retried.
    fn finalize(&self, offer_id: &str) {
        let (manifest, chunks, elapsed) = {
            let downloads = self.downloads.lock();
            let Some(download) = downloads.get(offer_id) else {
                return;
            };
            (
                download.manifest.clone(),
                download.chunks.clone(),
                download.started_at.elapsed(),
            )
        };
        let out_path = self.output_path(&manifest.file_name);
        match chunk::assemble_file(&manifest, &chunks, &out_path) {
            Ok(()) => {
                info!(
                    offer = %offer_id,
                    path = %out_path.display(),
                    secs = elapsed.as_secs_f64(),
                    "download complete"
                );
                self.downloads.lock().remove(offer_id);
            }
            Err(e) => warn!(offer = %offer_id, error = %e, "download assembly failed"),
        }
    }

    /// Destination path for a finished download: the offered base name only
    /// (a hostile manifest cannot point outside the download directory),
    /// timestamp-prefixed instead of overwriting on collision.
    fn output_path(&self, offered_name: &str) -> PathBuf {
        let base = Path::new(offered_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download.bin".to_string());
        let candidate = self.download_dir.join(&base);
        if !candidate.exists() {
            return candidate;
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.download_dir.join(format!("{stamp}_{base}"))
    }

    /// Number of in-flight downloads (display layers).
    pub fn active_downloads(&self) -> usize {
        self.downloads.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archipel_core::identity::LocalIdentity;

    fn manifest_for(data: &[u8], chunk_size: usize, dir: &Path) -> (FileManifest, PathBuf) {
        let path = dir.join("src.bin");
        std::fs::write(&path, data).unwrap();
        (chunk::build_manifest(&path, chunk_size).unwrap(), path)
    }

    fn frame_for(manifest: &FileManifest, path: &Path, index: u32) -> FileChunk {
        FileChunk {
            offer_id: manifest.offer_id.clone(),
            index,
            total_chunks: manifest.total_chunks,
            chunk_hash: manifest.chunk_hash_bytes(index).unwrap(),
            data: chunk::read_chunk_at(path, index, manifest.chunk_size as usize).unwrap(),
        }
    }

    #[test]
    fn download_accepts_out_of_order_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..20000u32).map(|i| (i % 239) as u8).collect();
        let (manifest, path) = manifest_for(&data, DEFAULT_CHUNK_SIZE, dir.path());
        assert_eq!(manifest.total_chunks, 3);

        let owner = LocalIdentity::generate().node_id();
        let mut download = Download::new(manifest.clone(), owner);

        // Reverse arrival order; storage is keyed by index.
        for index in (0..manifest.total_chunks).rev() {
            let frame = frame_for(&manifest, &path, index);
            assert!(matches!(
                download.ingest(&owner, &frame),
                ChunkIngest::Stored { .. }
            ));
        }
        assert_eq!(download.have(), 3);

        let out = dir.path().join("out.bin");
        chunk::assemble_file(&manifest, &download.chunks, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data);
        assert_eq!(
            hex::encode(chunk::hash_chunk(&std::fs::read(&out).unwrap())),
            manifest.file_hash
        );
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, path) = manifest_for(&vec![9u8; 1000], 400, dir.path());
        let owner = LocalIdentity::generate().node_id();
        let mut download = Download::new(manifest.clone(), owner);

        let frame = frame_for(&manifest, &path, 1);
        assert!(matches!(
            download.ingest(&owner, &frame),
            ChunkIngest::Stored { have: 1, .. }
        ));
        assert_eq!(download.ingest(&owner, &frame), ChunkIngest::Duplicate);
        assert_eq!(download.have(), 1);
    }

    #[test]
    fn chunk_from_wrong_owner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, path) = manifest_for(&vec![9u8; 1000], 400, dir.path());
        let owner = LocalIdentity::generate().node_id();
        let impostor = LocalIdentity::generate().node_id();
        let mut download = Download::new(manifest.clone(), owner);

        let frame = frame_for(&manifest, &path, 0);
        assert_eq!(
            download.ingest(&impostor, &frame),
            ChunkIngest::Rejected(ChunkReject::WrongOwner)
        );
        assert_eq!(download.have(), 0);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, path) = manifest_for(&vec![9u8; 1000], 400, dir.path());
        let owner = LocalIdentity::generate().node_id();
        let mut download = Download::new(manifest.clone(), owner);

        let mut frame = frame_for(&manifest, &path, 0);
        frame.index = manifest.total_chunks;
        assert_eq!(
            download.ingest(&owner, &frame),
            ChunkIngest::Rejected(ChunkReject::IndexOutOfRange)
        );
    }

    #[test]
    fn self_consistent_but_unlisted_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, _path) = manifest_for(&vec![9u8; 1000], 400, dir.path());
        let owner = LocalIdentity::generate().node_id();
        let mut download = Download::new(manifest.clone(), owner);

        // Forged frame: body and declared hash agree with each other but not
        // with the manifest.
        let body = b"not the real chunk".to_vec();
        let frame = FileChunk {
            offer_id: manifest.offer_id.clone(),
            index: 0,
            total_chunks: manifest.total_chunks,
            chunk_hash: chunk::hash_chunk(&body),
            data: body,
        };
        assert_eq!(
            download.ingest(&owner, &frame),
            ChunkIngest::Rejected(ChunkReject::HashNotInManifest)
        );
        assert_eq!(download.have(), 0);
    }

    #[test]
    fn garbled_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, path) = manifest_for(&vec![9u8; 1000], 400, dir.path());
        let owner = LocalIdentity::generate().node_id();
        let mut download = Download::new(manifest.clone(), owner);

        let mut frame = frame_for(&manifest, &path, 0);
        frame.data[0] ^= 1;
        assert_eq!(
            download.ingest(&owner, &frame),
            ChunkIngest::Rejected(ChunkReject::ContentMismatch)
        );
    }
}
