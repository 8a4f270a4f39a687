//! Per-transfer state: one file moving in one direction, plus its lifecycle.
//! `Opening -> Active -> {Finished | Aborted}`; the stream handle is closed on either exit.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Opening,
    Active,
    Finished,
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot open {what}: {source}")]
    Open {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("transfer {0} is already active")]
    Duplicate(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("node shutting down")]
    Shutdown,
    #[error("peer {0} disconnected")]
    PeerLost(String),
    #[error("aborted by peer")]
    AbortedByPeer,
}

/// Identity and metadata of a transfer, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub file_id: String,
    pub role: Role,
    pub peer: String,
    pub chat_id: String,
    pub file_name: String,
    pub total_size: u64,
}

/// Point-in-time view handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub file_id: String,
    pub role: Role,
    pub peer: String,
    pub chat_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub processed_bytes: u64,
    /// Destination (receiver) or source (sender) location.
    pub location: Option<String>,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.processed_bytes >= self.total_size
    }
}

enum Stream {
    Source(Box<dyn Read + Send>),
    Destination(Box<dyn Write + Send>),
}

pub struct TransferState {
    meta: TransferMeta,
    processed: u64,
    location: Option<String>,
    phase: TransferPhase,
    stream: Option<Stream>,
    hasher: Sha256,
}

impl TransferState {
    pub fn opening(meta: TransferMeta) -> Self {
        Self {
            meta,
            processed: 0,
            location: None,
            phase: TransferPhase::Opening,
            stream: None,
            hasher: Sha256::new(),
        }
    }

    /// Attach the sender's source stream. Opening -> Active.
    pub fn activate_source(&mut self, reader: Box<dyn Read + Send>, location: String) {
        self.activate(Stream::Source(reader), location);
    }

    /// Attach the receiver's destination stream. Opening -> Active.
    pub fn activate_destination(&mut self, writer: Box<dyn Write + Send>, location: String) {
        self.activate(Stream::Destination(writer), location);
    }

    fn activate(&mut self, stream: Stream, location: String) {
        debug_assert_eq!(self.phase, TransferPhase::Opening);
        self.stream = Some(stream);
        self.location = Some(location);
        self.phase = TransferPhase::Active;
    }

    pub fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == TransferPhase::Active
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed
    }

    pub fn remaining(&self) -> u64 {
        self.meta.total_size.saturating_sub(self.processed)
    }

    pub fn is_finished(&self) -> bool {
        self.processed >= self.meta.total_size
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            file_id: self.meta.file_id.clone(),
            role: self.meta.role,
            peer: self.meta.peer.clone(),
            chat_id: self.meta.chat_id.clone(),
            file_name: self.meta.file_name.clone(),
            total_size: self.meta.total_size,
            processed_bytes: self.processed,
            location: self.location.clone(),
        }
    }

    /// SHA-256 of every byte moved so far, hex encoded.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Sender: read the next chunk of at most `requested` bytes into a fresh buffer.
    /// Returns an empty chunk when the transfer is not active.
    pub fn next_chunk(&mut self, requested: usize) -> Result<Vec<u8>, TransferError> {
        if !self.is_active() {
            return Ok(Vec::new());
        }
        let want = (requested as u64).min(self.remaining()) as usize;
        let Some(Stream::Source(reader)) = self.stream.as_mut() else {
            return Ok(Vec::new());
        };
        let mut chunk = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if filled < want {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "source ended at {} of {} bytes",
                    self.processed + filled as u64,
                    self.meta.total_size
                ),
            )));
        }
        self.hasher.update(&chunk);
        self.processed += want as u64;
        Ok(chunk)
    }

    /// Receiver: append a chunk. Returns true once the file is complete.
    /// Bytes past the advertised size are dropped.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<bool, TransferError> {
        if !self.is_active() {
            return Ok(true);
        }
        let remaining = self.remaining();
        let take = (bytes.len() as u64).min(remaining) as usize;
        if take < bytes.len() {
            warn!(
                file_id = %self.meta.file_id,
                extra = bytes.len() - take,
                "chunk overshoots advertised size, truncating"
            );
        }
        let Some(Stream::Destination(writer)) = self.stream.as_mut() else {
            return Ok(true);
        };
        writer.write_all(&bytes[..take])?;
        writer.flush()?;
        self.hasher.update(&bytes[..take]);
        self.processed += take as u64;
        Ok(self.is_finished())
    }

    /// Active -> Finished: flush and close the handle. Returns false if already closed.
    /// A failed final flush lands in Aborted instead.
    pub fn finish(&mut self) -> Result<bool, TransferError> {
        if !self.is_active() {
            return Ok(false);
        }
        let flushed = match self.stream.take() {
            Some(Stream::Destination(mut writer)) => writer.flush(),
            _ => Ok(()),
        };
        match flushed {
            Ok(()) => {
                self.phase = TransferPhase::Finished;
                Ok(true)
            }
            Err(e) => {
                self.phase = TransferPhase::Aborted;
                Err(e.into())
            }
        }
    }

    /// {Opening, Active} -> Aborted: drop the handle. Returns false if already closed.
    pub fn abort(&mut self) -> bool {
        match self.phase {
            TransferPhase::Opening | TransferPhase::Active => {
                self.phase = TransferPhase::Aborted;
                self.stream = None;
                true
            }
            TransferPhase::Finished | TransferPhase::Aborted => false,
        }
    }
}
