//! Chunked file transfer engine
//!
//! Registries for incoming and outgoing transfers plus the receiver-side
//! protocol handlers. The sender-side transmit loop lives in the session
//! (it interleaves transport sends with protocol-bus waits); everything it
//! mutates (chunk bookkeeping, retries, status) lives here.
//!
//! Incoming payloads at or above the spool threshold are written to a
//! per-session spool directory with positional writes, so the storage layer
//! does not care that today's receivers ACK strictly in sequence. Spool file
//! handles are closed before finalization hashes the file back in.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::SharedSessionConfig;
use crate::crypto::{sha256_hex, StreamingHash};
use crate::envelope::{
    EnvelopeKind, FileAcceptPayload, FileAckPayload, FileCancelPayload, FileChunkPayload,
    FileCompleteAckPayload, FileCompletePayload, FileNackPayload, FileOfferPayload,
    FileResumeReqPayload, FileResumeStatePayload, OutboundEnvelope,
};
use crate::errors::{BridgeError, FileTransferError, Result};
use crate::events::BridgeEvent;
use crate::types::{PeerUuid, StreamId, Timestamp, TransferId};

/// Buffer size for streaming hash and save operations.
const SPOOL_READ_BUF: usize = 64 * 1024;

// ----------------------------------------------------------------------------
// Status Enums
// ----------------------------------------------------------------------------

/// Lifecycle of an outgoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingStatus {
    Offered,
    Transferring,
    Completed,
    Failed,
}

/// Lifecycle of an incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomingStatus {
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

impl IncomingStatus {
    fn as_str(&self) -> &'static str {
        match self {
            IncomingStatus::Receiving => "receiving",
            IncomingStatus::Completed => "completed",
            IncomingStatus::Failed => "failed",
            IncomingStatus::Cancelled => "cancelled",
        }
    }
}

// ----------------------------------------------------------------------------
// Chunk Geometry
// ----------------------------------------------------------------------------

/// Number of chunks a payload splits into.
pub fn chunk_count(total_bytes: u64, chunk_bytes: u64) -> u64 {
    total_bytes.div_ceil(chunk_bytes)
}

/// Expected length of chunk `seq`.
pub fn expected_chunk_len(total_bytes: u64, chunk_bytes: u64, seq: u64) -> u64 {
    chunk_bytes.min(total_bytes - seq * chunk_bytes)
}

// ----------------------------------------------------------------------------
// Outgoing Transfers
// ----------------------------------------------------------------------------

/// Where an outgoing payload comes from.
#[derive(Debug, Clone)]
pub enum OutgoingSource {
    Memory(Arc<Vec<u8>>),
    Path(PathBuf),
}

impl OutgoingSource {
    fn kind(&self) -> &'static str {
        match self {
            OutgoingSource::Memory(_) => "memory",
            OutgoingSource::Path(_) => "path",
        }
    }
}

/// Sender-side transfer record.
#[derive(Debug)]
pub struct OutgoingTransfer {
    pub id: TransferId,
    pub status: OutgoingStatus,
    pub target: PeerUuid,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunk_bytes: u64,
    pub chunk_hashes: Vec<String>,
    pub file_hash: String,
    pub next_seq: u64,
    pub acked: Vec<bool>,
    pub retries_for_seq: HashMap<u64, u32>,
    pub retries_total: u32,
    pub last_error: Option<String>,
    pub source: OutgoingSource,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl OutgoingTransfer {
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now();
    }

    pub fn acked_count(&self) -> u64 {
        self.acked.iter().filter(|a| **a).count() as u64
    }

    pub fn offer_payload(&self) -> FileOfferPayload {
        FileOfferPayload {
            transfer_id: self.id.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            total_bytes: self.total_bytes,
            total_chunks: self.total_chunks,
            chunk_bytes: self.chunk_bytes,
            file_hash: self.file_hash.clone(),
        }
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            transfer_id: self.id.clone(),
            direction: "outgoing".into(),
            status: serde_json::to_value(self.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default(),
            peer: self.target.clone(),
            peer_stream_id: None,
            name: self.name.clone(),
            mime: self.mime.clone(),
            total_bytes: self.total_bytes,
            total_chunks: self.total_chunks,
            chunk_bytes: self.chunk_bytes,
            transferred_chunks: self.acked_count(),
            received_bytes: None,
            next_seq: self.next_seq,
            retries_total: self.retries_total,
            file_hash: self.file_hash.clone(),
            last_error: self.last_error.clone(),
            source: Some(self.source.kind().into()),
            spooled: None,
            spool_path: None,
            created_at: self.created_at.as_millis(),
            updated_at: self.updated_at.as_millis(),
        }
    }
}

/// Reads chunks for the transmit loop without materializing path sources.
pub enum ChunkSource {
    Memory(Arc<Vec<u8>>),
    File(fs::File),
}

impl ChunkSource {
    /// Open the source recorded on a transfer.
    pub async fn open(source: &OutgoingSource) -> Result<Self> {
        match source {
            OutgoingSource::Memory(bytes) => Ok(ChunkSource::Memory(bytes.clone())),
            OutgoingSource::Path(path) => Ok(ChunkSource::File(fs::File::open(path).await?)),
        }
    }

    /// Read chunk `seq` of the given geometry.
    pub async fn read_chunk(
        &mut self,
        total_bytes: u64,
        chunk_bytes: u64,
        seq: u64,
    ) -> Result<Vec<u8>> {
        let len = expected_chunk_len(total_bytes, chunk_bytes, seq) as usize;
        let offset = seq * chunk_bytes;
        match self {
            ChunkSource::Memory(bytes) => {
                let start = offset as usize;
                Ok(bytes[start..start + len].to_vec())
            }
            ChunkSource::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Incoming Transfers
// ----------------------------------------------------------------------------

/// Backing storage for an incoming transfer. A spooled transfer never holds
/// an in-memory chunk array.
enum IncomingStorage {
    Memory(Vec<Option<Vec<u8>>>),
    Spool {
        /// Write handle; dropped before finalization hashes the file.
        file: Option<fs::File>,
        path: PathBuf,
    },
}

/// Receiver-side transfer record.
pub struct IncomingTransfer {
    pub id: TransferId,
    pub status: IncomingStatus,
    pub from: PeerUuid,
    pub from_stream_id: Option<StreamId>,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunk_bytes: u64,
    pub expected_hash: String,
    received: Vec<bool>,
    pub received_bytes: u64,
    storage: IncomingStorage,
    /// Reassembled payload once a memory-backed transfer finalizes.
    buffered: Option<Vec<u8>>,
    pub complete_received: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl IncomingTransfer {
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now();
    }

    /// First sequence not yet received; `total_chunks` when none missing.
    pub fn first_missing(&self) -> u64 {
        self.received
            .iter()
            .position(|r| !*r)
            .map(|p| p as u64)
            .unwrap_or(self.total_chunks)
    }

    pub fn received_count(&self) -> u64 {
        self.received.iter().filter(|r| **r).count() as u64
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self.storage, IncomingStorage::Spool { .. })
    }

    pub fn spool_path(&self) -> Option<&Path> {
        match &self.storage {
            IncomingStorage::Spool { path, .. } => Some(path.as_path()),
            IncomingStorage::Memory(_) => None,
        }
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            transfer_id: self.id.clone(),
            direction: "incoming".into(),
            status: self.status.as_str().into(),
            peer: self.from.clone(),
            peer_stream_id: self.from_stream_id.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            total_bytes: self.total_bytes,
            total_chunks: self.total_chunks,
            chunk_bytes: self.chunk_bytes,
            transferred_chunks: self.received_count(),
            received_bytes: Some(self.received_bytes),
            next_seq: self.first_missing(),
            retries_total: 0,
            file_hash: self.expected_hash.clone(),
            last_error: None,
            source: None,
            spooled: Some(self.is_spooled()),
            spool_path: self
                .spool_path()
                .map(|p| p.to_string_lossy().into_owned()),
            created_at: self.created_at.as_millis(),
            updated_at: self.updated_at.as_millis(),
        }
    }

    /// Drop storage. Removes the spool file unless `keep` is set.
    async fn release_storage(&mut self, keep: bool) {
        match &mut self.storage {
            IncomingStorage::Memory(chunks) => chunks.clear(),
            IncomingStorage::Spool { file, path } => {
                file.take();
                if !keep {
                    if let Err(err) = fs::remove_file(&path).await {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(path = %path.display(), error = %err, "spool cleanup failed");
                        }
                    }
                }
            }
        }
        self.buffered = None;
    }
}

// ----------------------------------------------------------------------------
// Transfer Summary
// ----------------------------------------------------------------------------

/// Serializable view of a transfer in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSummary {
    pub transfer_id: TransferId,
    pub direction: String,
    pub status: String,
    pub peer: PeerUuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_stream_id: Option<StreamId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunk_bytes: u64,
    pub transferred_chunks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_bytes: Option<u64>,
    pub next_seq: u64,
    pub retries_total: u32,
    pub file_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spooled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_path: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Replies and events produced by one receiver-side protocol step.
#[derive(Default)]
pub struct FileStepOutcome {
    pub replies: Vec<OutboundEnvelope>,
    pub events: Vec<BridgeEvent>,
}

// ----------------------------------------------------------------------------
// File Transfer Engine
// ----------------------------------------------------------------------------

/// Per-session registries of incoming and outgoing transfers.
pub struct FileTransferEngine {
    config: SharedSessionConfig,
    session_tag: String,
    outgoing: HashMap<TransferId, OutgoingTransfer>,
    incoming: HashMap<TransferId, IncomingTransfer>,
    completed_outgoing: VecDeque<TransferId>,
    completed_incoming: VecDeque<TransferId>,
    spool_dir: Option<PathBuf>,
}

impl FileTransferEngine {
    pub fn new(config: SharedSessionConfig, session_tag: String) -> Self {
        Self {
            config,
            session_tag,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            completed_outgoing: VecDeque::new(),
            completed_incoming: VecDeque::new(),
            spool_dir: None,
        }
    }

    // ------------------------------------------------------------------
    // Outgoing registry
    // ------------------------------------------------------------------

    /// Build and register an outgoing transfer from in-memory bytes.
    pub fn prepare_outgoing_memory(
        &mut self,
        id: Option<TransferId>,
        data: Vec<u8>,
        target: PeerUuid,
        name: Option<String>,
        mime: Option<String>,
        chunk_bytes: Option<u64>,
        ack_timeout_ms: Option<u64>,
        max_retries: Option<u32>,
    ) -> Result<TransferId> {
        let total_bytes = data.len() as u64;
        self.check_bounds(total_bytes)?;
        let chunk_bytes = chunk_bytes.unwrap_or(self.config.file_chunk_bytes).max(1);

        let chunk_hashes = data
            .chunks(chunk_bytes as usize)
            .map(sha256_hex)
            .collect::<Vec<_>>();
        let file_hash = sha256_hex(&data);

        Ok(self.register_outgoing(
            id,
            OutgoingSource::Memory(Arc::new(data)),
            target,
            name,
            mime,
            total_bytes,
            chunk_bytes,
            chunk_hashes,
            file_hash,
            ack_timeout_ms,
            max_retries,
        ))
    }

    /// Build and register an outgoing transfer from a file path, hashing it
    /// chunk-by-chunk without loading the whole file.
    #[allow(clippy::too_many_arguments)]
    pub async fn prepare_outgoing_path(
        &mut self,
        id: Option<TransferId>,
        path: PathBuf,
        target: PeerUuid,
        name: Option<String>,
        mime: Option<String>,
        chunk_bytes: Option<u64>,
        ack_timeout_ms: Option<u64>,
        max_retries: Option<u32>,
    ) -> Result<TransferId> {
        let metadata = fs::metadata(&path).await?;
        let total_bytes = metadata.len();
        self.check_bounds(total_bytes)?;
        let chunk_bytes = chunk_bytes.unwrap_or(self.config.file_chunk_bytes).max(1);

        let mut file = fs::File::open(&path).await?;
        let mut whole = StreamingHash::new();
        let mut chunk_hashes = Vec::with_capacity(chunk_count(total_bytes, chunk_bytes) as usize);
        let mut buf = vec![0u8; chunk_bytes as usize];
        let mut remaining = total_bytes;
        while remaining > 0 {
            let take = (chunk_bytes.min(remaining)) as usize;
            file.read_exact(&mut buf[..take]).await?;
            whole.update(&buf[..take]);
            chunk_hashes.push(sha256_hex(&buf[..take]));
            remaining -= take as u64;
        }
        let file_hash = whole.finalize_hex();

        let name = name.or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
        });

        Ok(self.register_outgoing(
            id,
            OutgoingSource::Path(path),
            target,
            name,
            mime,
            total_bytes,
            chunk_bytes,
            chunk_hashes,
            file_hash,
            ack_timeout_ms,
            max_retries,
        ))
    }

    fn check_bounds(&self, total_bytes: u64) -> Result<()> {
        if total_bytes == 0 {
            return Err(FileTransferError::EmptyPayload.into());
        }
        if total_bytes > self.config.file_max_bytes {
            return Err(FileTransferError::PayloadTooLarge {
                size: total_bytes,
                max: self.config.file_max_bytes,
            }
            .into());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn register_outgoing(
        &mut self,
        id: Option<TransferId>,
        source: OutgoingSource,
        target: PeerUuid,
        name: Option<String>,
        mime: Option<String>,
        total_bytes: u64,
        chunk_bytes: u64,
        chunk_hashes: Vec<String>,
        file_hash: String,
        ack_timeout_ms: Option<u64>,
        max_retries: Option<u32>,
    ) -> TransferId {
        let id = id.unwrap_or_else(TransferId::generate);
        let total_chunks = chunk_count(total_bytes, chunk_bytes);
        let now = Timestamp::now();
        let transfer = OutgoingTransfer {
            id: id.clone(),
            status: OutgoingStatus::Offered,
            target,
            name,
            mime,
            total_bytes,
            total_chunks,
            chunk_bytes,
            chunk_hashes,
            file_hash,
            next_seq: 0,
            acked: vec![false; total_chunks as usize],
            retries_for_seq: HashMap::new(),
            retries_total: 0,
            last_error: None,
            source,
            ack_timeout_ms: ack_timeout_ms.unwrap_or(self.config.file_ack_timeout_ms),
            max_retries: max_retries.unwrap_or(self.config.file_max_retries),
            created_at: now,
            updated_at: now,
        };
        self.outgoing.insert(id.clone(), transfer);
        id
    }

    pub fn outgoing(&self, id: &TransferId) -> Option<&OutgoingTransfer> {
        self.outgoing.get(id)
    }

    pub fn outgoing_mut(&mut self, id: &TransferId) -> Option<&mut OutgoingTransfer> {
        self.outgoing.get_mut(id)
    }

    /// Record a completed outgoing transfer, evicting the oldest completed
    /// one past the cap.
    pub fn complete_outgoing(&mut self, id: &TransferId) {
        if let Some(transfer) = self.outgoing.get_mut(id) {
            transfer.status = OutgoingStatus::Completed;
            transfer.last_error = None;
            transfer.touch();
            self.completed_outgoing.push_back(id.clone());
        }
        while self.completed_outgoing.len() > self.config.file_completed_cap {
            if let Some(oldest) = self.completed_outgoing.pop_front() {
                self.outgoing.remove(&oldest);
            }
        }
    }

    pub fn fail_outgoing(&mut self, id: &TransferId, error: String) {
        if let Some(transfer) = self.outgoing.get_mut(id) {
            transfer.status = OutgoingStatus::Failed;
            transfer.last_error = Some(error);
            transfer.touch();
        }
    }

    // ------------------------------------------------------------------
    // Incoming protocol handlers
    // ------------------------------------------------------------------

    /// Handle `file.offer`. A re-offer for a known transfer is idempotent:
    /// the reply reports where the receiver already is.
    pub async fn handle_offer(
        &mut self,
        from: &PeerUuid,
        from_stream_id: Option<StreamId>,
        offer: FileOfferPayload,
    ) -> Result<FileStepOutcome> {
        let mut outcome = FileStepOutcome::default();

        if let Some(existing) = self.incoming.get_mut(&offer.transfer_id) {
            existing.touch();
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileAccept,
                &FileAcceptPayload {
                    transfer_id: offer.transfer_id,
                    next_seq: existing.first_missing(),
                },
            ));
            return Ok(outcome);
        }

        if offer.total_bytes == 0
            || offer.total_bytes > self.config.file_max_bytes
            || offer.chunk_bytes == 0
            || offer.total_chunks != chunk_count(offer.total_bytes, offer.chunk_bytes)
        {
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: offer.transfer_id,
                    expected_seq: 0,
                    reason: "invalid offer bounds".into(),
                },
            ));
            return Ok(outcome);
        }

        let storage = if offer.total_bytes >= self.config.spool_threshold_bytes {
            let dir = self.ensure_spool_dir().await?;
            let file_name = format!(
                "{}-{}.spool",
                offer.transfer_id,
                &uuid::Uuid::new_v4().to_string()[..8]
            );
            let path = dir.join(file_name);
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?;
            IncomingStorage::Spool {
                file: Some(file),
                path,
            }
        } else {
            IncomingStorage::Memory(vec![None; offer.total_chunks as usize])
        };

        let now = Timestamp::now();
        let transfer = IncomingTransfer {
            id: offer.transfer_id.clone(),
            status: IncomingStatus::Receiving,
            from: from.clone(),
            from_stream_id,
            name: offer.name.clone(),
            mime: offer.mime.clone(),
            total_bytes: offer.total_bytes,
            total_chunks: offer.total_chunks,
            chunk_bytes: offer.chunk_bytes,
            expected_hash: offer.file_hash.clone(),
            received: vec![false; offer.total_chunks as usize],
            received_bytes: 0,
            storage,
            buffered: None,
            complete_received: false,
            created_at: now,
            updated_at: now,
        };

        outcome.events.push(BridgeEvent::FileOfferReceived {
            transfer_id: transfer.id.clone(),
            from_uuid: from.clone(),
            name: transfer.name.clone(),
            mime: transfer.mime.clone(),
            total_bytes: transfer.total_bytes,
            total_chunks: transfer.total_chunks,
        });
        outcome.replies.push(OutboundEnvelope::new(
            from,
            EnvelopeKind::FileAccept,
            &FileAcceptPayload {
                transfer_id: transfer.id.clone(),
                next_seq: 0,
            },
        ));
        self.incoming.insert(transfer.id.clone(), transfer);
        Ok(outcome)
    }

    /// Handle `file.chunk`: validate, store once, ACK (or NACK and drop).
    pub async fn handle_chunk(
        &mut self,
        from: &PeerUuid,
        chunk: FileChunkPayload,
    ) -> Result<FileStepOutcome> {
        let mut outcome = FileStepOutcome::default();

        let Some(transfer) = self.incoming.get_mut(&chunk.transfer_id) else {
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: chunk.transfer_id,
                    expected_seq: 0,
                    reason: "unknown_transfer".into(),
                },
            ));
            return Ok(outcome);
        };

        let nack = |transfer: &IncomingTransfer, reason: &str| {
            OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: transfer.id.clone(),
                    expected_seq: transfer.first_missing(),
                    reason: reason.into(),
                },
            )
        };

        if transfer.status != IncomingStatus::Receiving {
            outcome.replies.push(nack(transfer, transfer.status.as_str()));
            return Ok(outcome);
        }
        if chunk.seq >= transfer.total_chunks {
            outcome.replies.push(nack(transfer, "seq out of range"));
            return Ok(outcome);
        }

        let data = match BASE64.decode(&chunk.data_base64) {
            Ok(data) => data,
            Err(_) => {
                outcome.replies.push(nack(transfer, "chunk base64 invalid"));
                return Ok(outcome);
            }
        };
        let expected_len =
            expected_chunk_len(transfer.total_bytes, transfer.chunk_bytes, chunk.seq);
        if data.len() as u64 != expected_len {
            outcome.replies.push(nack(transfer, "chunk length mismatch"));
            return Ok(outcome);
        }
        if sha256_hex(&data) != chunk.chunk_hash {
            outcome.replies.push(nack(transfer, "chunk hash mismatch"));
            return Ok(outcome);
        }

        // Duplicate chunks are ACKed without a second write.
        let seq = chunk.seq as usize;
        if !transfer.received[seq] {
            match &mut transfer.storage {
                IncomingStorage::Memory(chunks) => {
                    transfer.received_bytes += data.len() as u64;
                    chunks[seq] = Some(data);
                }
                IncomingStorage::Spool { file, .. } => {
                    let file = file
                        .as_mut()
                        .ok_or_else(|| FileTransferError::Spool(std::io::Error::other(
                            "spool file already closed",
                        )))?;
                    file.seek(SeekFrom::Start(chunk.seq * transfer.chunk_bytes))
                        .await?;
                    file.write_all(&data).await?;
                    transfer.received_bytes += data.len() as u64;
                }
            }
            transfer.received[seq] = true;
        }
        transfer.touch();

        outcome.replies.push(OutboundEnvelope::new(
            from,
            EnvelopeKind::FileAck,
            &FileAckPayload {
                transfer_id: transfer.id.clone(),
                seq: chunk.seq,
                next_seq: transfer.first_missing(),
                received_bytes: transfer.received_bytes,
            },
        ));

        // The sender's complete may have raced ahead of the last chunk.
        if transfer.complete_received && transfer.first_missing() == transfer.total_chunks {
            let id = transfer.id.clone();
            let mut finalized = self.try_finalize(&id, from).await?;
            outcome.replies.append(&mut finalized.replies);
            outcome.events.append(&mut finalized.events);
        }
        Ok(outcome)
    }

    /// Handle `file.complete`: attempt finalization.
    pub async fn handle_complete(
        &mut self,
        from: &PeerUuid,
        complete: FileCompletePayload,
    ) -> Result<FileStepOutcome> {
        let mut outcome = FileStepOutcome::default();
        let Some(transfer) = self.incoming.get_mut(&complete.transfer_id) else {
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: complete.transfer_id,
                    expected_seq: 0,
                    reason: "unknown_transfer".into(),
                },
            ));
            return Ok(outcome);
        };

        transfer.complete_received = true;
        transfer.touch();
        if matches!(
            transfer.status,
            IncomingStatus::Cancelled | IncomingStatus::Failed
        ) {
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: transfer.id.clone(),
                    expected_seq: transfer.first_missing(),
                    reason: transfer.status.as_str().into(),
                },
            ));
            return Ok(outcome);
        }
        if transfer.status == IncomingStatus::Completed {
            // Idempotent re-complete: re-ACK so a sender retry converges.
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileCompleteAck,
                &FileCompleteAckPayload {
                    transfer_id: transfer.id.clone(),
                    file_hash: transfer.expected_hash.clone(),
                    total_bytes: transfer.total_bytes,
                },
            ));
            return Ok(outcome);
        }

        let id = complete.transfer_id.clone();
        let mut finalized = self.try_finalize(&id, from).await?;
        outcome.replies.append(&mut finalized.replies);
        outcome.events.append(&mut finalized.events);
        Ok(outcome)
    }

    /// Handle `file.resume_req`: report the first missing sequence. Unknown
    /// transfers report `next_seq = 0, status = "unknown_transfer"`.
    pub fn handle_resume_req(
        &mut self,
        from: &PeerUuid,
        req: FileResumeReqPayload,
    ) -> FileStepOutcome {
        let mut outcome = FileStepOutcome::default();
        let payload = match self.incoming.get(&req.transfer_id) {
            Some(transfer) => FileResumeStatePayload {
                transfer_id: req.transfer_id,
                next_seq: transfer.first_missing(),
                status: transfer.status.as_str().into(),
            },
            None => FileResumeStatePayload {
                transfer_id: req.transfer_id,
                next_seq: 0,
                status: "unknown_transfer".into(),
            },
        };
        outcome
            .replies
            .push(OutboundEnvelope::new(from, EnvelopeKind::FileResumeState, &payload));
        outcome
    }

    /// Handle `file.cancel`: release storage and surface the cancellation.
    pub async fn handle_cancel(
        &mut self,
        _from: &PeerUuid,
        cancel: FileCancelPayload,
    ) -> FileStepOutcome {
        let mut outcome = FileStepOutcome::default();
        if let Some(transfer) = self.incoming.get_mut(&cancel.transfer_id) {
            transfer.status = IncomingStatus::Cancelled;
            transfer
                .release_storage(self.config.keep_spool_files)
                .await;
            transfer.touch();
            outcome.events.push(BridgeEvent::FileTransferCancelled {
                transfer_id: cancel.transfer_id,
                reason: cancel.reason,
            });
        }
        outcome
    }

    /// Finalize when every chunk is present and the whole-payload hash
    /// matches; otherwise NACK and stay open for more chunks.
    async fn try_finalize(&mut self, id: &TransferId, from: &PeerUuid) -> Result<FileStepOutcome> {
        let mut outcome = FileStepOutcome::default();
        let keep = self.config.keep_spool_files;
        let cap = self.config.file_completed_cap;

        let transfer = self
            .incoming
            .get_mut(id)
            .ok_or_else(|| FileTransferError::UnknownTransfer {
                transfer_id: id.clone(),
            })?;

        if transfer.first_missing() != transfer.total_chunks {
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: transfer.id.clone(),
                    expected_seq: transfer.first_missing(),
                    reason: "incomplete".into(),
                },
            ));
            return Ok(outcome);
        }

        let actual_hash = match &mut transfer.storage {
            IncomingStorage::Memory(chunks) => {
                let mut whole = StreamingHash::new();
                let mut buffered = Vec::with_capacity(transfer.total_bytes as usize);
                for chunk in chunks.iter().flatten() {
                    whole.update(chunk);
                    buffered.extend_from_slice(chunk);
                }
                transfer.buffered = Some(buffered);
                whole.finalize_hex()
            }
            IncomingStorage::Spool { file, path } => {
                // Close the write handle before hashing the file back in.
                if let Some(mut handle) = file.take() {
                    handle.flush().await?;
                    handle.sync_all().await?;
                }
                let mut reader = fs::File::open(&path).await?;
                let mut whole = StreamingHash::new();
                let mut buf = vec![0u8; SPOOL_READ_BUF];
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    whole.update(&buf[..n]);
                }
                whole.finalize_hex()
            }
        };

        if actual_hash != transfer.expected_hash {
            transfer.buffered = None;
            outcome.replies.push(OutboundEnvelope::new(
                from,
                EnvelopeKind::FileNack,
                &FileNackPayload {
                    transfer_id: transfer.id.clone(),
                    expected_seq: transfer.first_missing(),
                    reason: "file hash mismatch".into(),
                },
            ));
            return Ok(outcome);
        }

        transfer.status = IncomingStatus::Completed;
        if let IncomingStorage::Memory(chunks) = &mut transfer.storage {
            chunks.clear();
        }
        transfer.touch();
        outcome.events.push(BridgeEvent::FileReceived {
            transfer_id: transfer.id.clone(),
            from_uuid: transfer.from.clone(),
            name: transfer.name.clone(),
            total_bytes: transfer.total_bytes,
            file_hash: transfer.expected_hash.clone(),
            spooled: transfer.is_spooled(),
        });
        outcome.replies.push(OutboundEnvelope::new(
            from,
            EnvelopeKind::FileCompleteAck,
            &FileCompleteAckPayload {
                transfer_id: transfer.id.clone(),
                file_hash: transfer.expected_hash.clone(),
                total_bytes: transfer.total_bytes,
            },
        ));

        self.completed_incoming.push_back(id.clone());
        while self.completed_incoming.len() > cap {
            if let Some(oldest) = self.completed_incoming.pop_front() {
                if let Some(mut evicted) = self.incoming.remove(&oldest) {
                    evicted.release_storage(keep).await;
                }
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Reads, listings, cleanup
    // ------------------------------------------------------------------

    pub fn incoming(&self, id: &TransferId) -> Option<&IncomingTransfer> {
        self.incoming.get(id)
    }

    /// Read a completed incoming transfer's payload.
    pub async fn read_completed(&self, id: &TransferId) -> Result<Vec<u8>> {
        let transfer = self
            .incoming
            .get(id)
            .ok_or_else(|| FileTransferError::UnknownTransfer {
                transfer_id: id.clone(),
            })?;
        if transfer.status != IncomingStatus::Completed {
            return Err(FileTransferError::WrongStatus {
                transfer_id: id.clone(),
                status: transfer.status.as_str().into(),
                expected: "completed".into(),
            }
            .into());
        }
        match (&transfer.buffered, transfer.spool_path()) {
            (Some(buffered), _) => Ok(buffered.clone()),
            (None, Some(path)) => Ok(fs::read(path).await?),
            (None, None) => Err(FileTransferError::Spool(std::io::Error::other(
                "payload storage already released",
            ))
            .into()),
        }
    }

    /// Write a completed incoming transfer's payload to `output_path`.
    pub async fn save_completed(
        &self,
        id: &TransferId,
        output_path: &Path,
        overwrite: bool,
    ) -> Result<u64> {
        if !overwrite && fs::try_exists(output_path).await? {
            return Err(BridgeError::invalid_input(format!(
                "output path {} exists (pass overwrite=true)",
                output_path.display()
            )));
        }
        let transfer = self
            .incoming
            .get(id)
            .ok_or_else(|| FileTransferError::UnknownTransfer {
                transfer_id: id.clone(),
            })?;
        if transfer.status != IncomingStatus::Completed {
            return Err(FileTransferError::WrongStatus {
                transfer_id: id.clone(),
                status: transfer.status.as_str().into(),
                expected: "completed".into(),
            }
            .into());
        }
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        match (&transfer.buffered, transfer.spool_path()) {
            (Some(buffered), _) => {
                fs::write(output_path, buffered).await?;
                Ok(buffered.len() as u64)
            }
            (None, Some(path)) => Ok(fs::copy(path, output_path).await?),
            (None, None) => Err(FileTransferError::Spool(std::io::Error::other(
                "payload storage already released",
            ))
            .into()),
        }
    }

    /// Transfer summaries, newest first.
    pub fn summaries(&self, direction: &str) -> Vec<TransferSummary> {
        let mut list: Vec<TransferSummary> = Vec::new();
        if direction == "incoming" || direction == "all" {
            list.extend(self.incoming.values().map(IncomingTransfer::summary));
        }
        if direction == "outgoing" || direction == "all" {
            list.extend(self.outgoing.values().map(OutgoingTransfer::summary));
        }
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Release every incoming transfer's storage. Called on session stop.
    pub async fn cleanup(&mut self) {
        let keep = self.config.keep_spool_files;
        for transfer in self.incoming.values_mut() {
            if transfer.status == IncomingStatus::Completed && keep {
                // Finished spool files survive when configured to.
                transfer.release_storage(true).await;
            } else {
                transfer.release_storage(keep).await;
            }
        }
    }

    async fn ensure_spool_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.spool_dir {
            return Ok(dir.clone());
        }
        let dir = match &self.config.spool_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!("vdo-bridge-{}", self.session_tag)),
        };
        fs::create_dir_all(&dir).await?;
        self.spool_dir = Some(dir.clone());
        Ok(dir)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
