//! Transfer manager: registry of inbound and outbound transfers driven by pull-based chunk events.
//!
//! The transport decides pacing: a sender only reads when a chunk is requested, a receiver only
//! writes what arrives. Different ids proceed in parallel; calls for the same id are serialized
//! by the entry lock. Observers are notified after the entry lock is released.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{lock, Registry, Slot};
use crate::storage::Storage;
use crate::transfer::{Role, TransferError, TransferMeta, TransferProgress, TransferState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress(TransferProgress),
    /// `processed_bytes == total_size`; `location` is where the file lives.
    Completed {
        progress: TransferProgress,
        sha256: String,
    },
    Failed {
        progress: TransferProgress,
        error: String,
    },
}

impl TransferEvent {
    pub fn progress(&self) -> &TransferProgress {
        match self {
            TransferEvent::Progress(p) => p,
            TransferEvent::Completed { progress, .. } => progress,
            TransferEvent::Failed { progress, .. } => progress,
        }
    }
}

pub trait TransferObserver: Send + Sync {
    fn on_transfer_event(&self, event: TransferEvent);
}

impl<F> TransferObserver for F
where
    F: Fn(TransferEvent) + Send + Sync,
{
    fn on_transfer_event(&self, event: TransferEvent) {
        self(event)
    }
}

/// What happened to a received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; ask for the next one.
    Wanted,
    /// The file is complete.
    Complete,
    /// Unknown id, or the transfer is closed or just failed. The sender should stop.
    Refused,
}

/// A registered outbound file: what the host announces to the peer in a FileStart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub file_id: String,
    pub peer: String,
    pub chat_id: String,
    pub file_name: String,
    pub total_size: u64,
    /// Empty files are complete at registration and never registered.
    pub finished: bool,
}

pub struct TransferManager {
    storage: Arc<dyn Storage>,
    observer: Arc<dyn TransferObserver>,
    outbound: Registry<TransferState>,
    inbound: Registry<TransferState>,
}

impl TransferManager {
    pub fn new(storage: Arc<dyn Storage>, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            storage,
            observer,
            outbound: Registry::new(),
            inbound: Registry::new(),
        }
    }

    fn registry(&self, role: Role) -> &Registry<TransferState> {
        match role {
            Role::Sender => &self.outbound,
            Role::Receiver => &self.inbound,
        }
    }

    fn emit(&self, event: Option<TransferEvent>) {
        if let Some(event) = event {
            self.observer.on_transfer_event(event);
        }
    }

    /// Open `locator` and register it for sending to `peer` under a fresh id.
    pub fn begin_send(
        &self,
        locator: &str,
        peer: &str,
        chat_id: &str,
    ) -> Result<OutgoingFile, TransferError> {
        let source = self.storage.open_for_read(locator).map_err(|e| {
            warn!(locator, error = %e, "cannot open file to send");
            TransferError::Open {
                what: "source",
                source: e,
            }
        })?;
        let file_id = Uuid::new_v4().to_string();
        let mut state = TransferState::opening(TransferMeta {
            file_id: file_id.clone(),
            role: Role::Sender,
            peer: peer.to_string(),
            chat_id: chat_id.to_string(),
            file_name: source.display_name.clone(),
            total_size: source.size,
        });
        state.activate_source(source.reader, source.location);

        let mut outgoing = OutgoingFile {
            file_id: file_id.clone(),
            peer: peer.to_string(),
            chat_id: chat_id.to_string(),
            file_name: source.display_name,
            total_size: source.size,
            finished: false,
        };

        if state.is_finished() {
            outgoing.finished = true;
            let event = self.settle(&mut state, None);
            self.emit(event);
            return Ok(outgoing);
        }

        if let Err(mut state) = self.outbound.insert_if_absent(&file_id, state) {
            state.abort();
            return Err(TransferError::Duplicate(file_id));
        }
        info!(
            file_id = %file_id,
            peer,
            name = %outgoing.file_name,
            size = outgoing.total_size,
            "outbound transfer registered"
        );
        Ok(outgoing)
    }

    /// Serve one chunk request: at most `requested` bytes, fewer at the end of the file,
    /// empty for unknown or finished ids.
    pub fn produce_chunk(&self, file_id: &str, requested: usize) -> Vec<u8> {
        let Some(slot) = self.outbound.get(file_id) else {
            debug!(file_id, "chunk request for unknown transfer");
            return Vec::new();
        };
        let (chunk, event) = {
            let mut state = lock(&slot);
            if !state.is_active() {
                return Vec::new();
            }
            match state.next_chunk(requested) {
                Ok(chunk) if state.is_finished() => {
                    let event = self.settle(&mut state, Some(&slot));
                    (chunk, event)
                }
                Ok(chunk) if chunk.is_empty() => (chunk, None),
                Ok(chunk) => (chunk, Some(TransferEvent::Progress(state.progress()))),
                Err(e) => (Vec::new(), self.fail(&mut state, Some(&slot), e)),
            }
        };
        self.emit(event);
        chunk
    }

    /// Open a destination for a file announced by `peer` and register it under the sender's id.
    /// A zero-byte file completes immediately and is never registered.
    pub fn begin_receive(
        &self,
        file_id: &str,
        peer: &str,
        chat_id: &str,
        file_name: &str,
        total_size: u64,
    ) -> Result<TransferProgress, TransferError> {
        if self.inbound.contains(file_id) {
            warn!(file_id, peer, "duplicate file start ignored");
            return Err(TransferError::Duplicate(file_id.to_string()));
        }
        let dest = self.storage.open_for_write(file_name).map_err(|e| {
            warn!(file_id, error = %e, "cannot open download destination");
            TransferError::Open {
                what: "destination",
                source: e,
            }
        })?;
        let mut state = TransferState::opening(TransferMeta {
            file_id: file_id.to_string(),
            role: Role::Receiver,
            peer: peer.to_string(),
            chat_id: chat_id.to_string(),
            file_name: file_name.to_string(),
            total_size,
        });
        state.activate_destination(dest.writer, dest.location);
        let progress = state.progress();

        if state.is_finished() {
            let event = self.settle(&mut state, None);
            self.emit(event);
            return Ok(progress);
        }

        match self.inbound.insert_if_absent(file_id, state) {
            Ok(_) => {
                info!(file_id, peer, name = file_name, size = total_size, "inbound transfer registered");
                Ok(progress)
            }
            Err(mut state) => {
                state.abort();
                warn!(file_id, "lost race registering inbound transfer");
                Err(TransferError::Duplicate(file_id.to_string()))
            }
        }
    }

    /// Append a received chunk. Returns true when no further chunks are wanted: the file is
    /// complete, the id is unknown, or the transfer was aborted.
    pub fn consume_chunk(&self, file_id: &str, bytes: &[u8]) -> bool {
        self.receive_chunk(file_id, bytes) != ChunkOutcome::Wanted
    }

    /// Like `consume_chunk`, but tells completion apart from refusal.
    pub fn receive_chunk(&self, file_id: &str, bytes: &[u8]) -> ChunkOutcome {
        let Some(slot) = self.inbound.get(file_id) else {
            debug!(file_id, "chunk for unknown transfer");
            return ChunkOutcome::Refused;
        };
        let (outcome, event) = {
            let mut state = lock(&slot);
            if !state.is_active() {
                return ChunkOutcome::Refused;
            }
            match state.write_chunk(bytes) {
                Ok(true) => match self.settle(&mut state, Some(&slot)) {
                    event @ Some(TransferEvent::Failed { .. }) => (ChunkOutcome::Refused, event),
                    event => (ChunkOutcome::Complete, event),
                },
                Ok(false) => (
                    ChunkOutcome::Wanted,
                    Some(TransferEvent::Progress(state.progress())),
                ),
                Err(e) => (ChunkOutcome::Refused, self.fail(&mut state, Some(&slot), e)),
            }
        };
        self.emit(event);
        outcome
    }

    /// Abort a transfer in either direction. Returns false if there was nothing to cancel.
    pub fn cancel(&self, file_id: &str) -> bool {
        self.abort_with(file_id, || TransferError::Cancelled)
    }

    /// Abort a transfer because `peer` asked to stop it. Ignored unless `peer` owns it.
    pub fn abort_from_peer(&self, file_id: &str, role: Role, peer: &str) -> bool {
        let Some(slot) = self.registry(role).get(file_id) else {
            return false;
        };
        let event = {
            let mut state = lock(&slot);
            if state.meta().peer != peer {
                warn!(file_id, peer, owner = %state.meta().peer, "abort from foreign peer ignored");
                return false;
            }
            self.fail(&mut state, Some(&slot), TransferError::AbortedByPeer)
        };
        let aborted = event.is_some();
        self.emit(event);
        aborted
    }

    /// Abort every transfer with `peer` in either direction. Returns how many were aborted.
    pub fn cancel_peer(&self, peer: &str) -> usize {
        let mut aborted = 0;
        for role in [Role::Sender, Role::Receiver] {
            let registry = self.registry(role);
            for id in registry.ids() {
                let Some(slot) = registry.get(&id) else {
                    continue;
                };
                let event = {
                    let mut state = lock(&slot);
                    if state.meta().peer != peer {
                        continue;
                    }
                    self.fail(&mut state, Some(&slot), TransferError::PeerLost(peer.to_string()))
                };
                if event.is_some() {
                    aborted += 1;
                }
                self.emit(event);
            }
        }
        if aborted > 0 {
            info!(peer, aborted, "transfers with lost peer aborted");
        }
        aborted
    }

    /// The peer a registered transfer is exchanged with.
    pub fn peer_of(&self, file_id: &str, role: Role) -> Option<String> {
        let slot = self.registry(role).get(file_id)?;
        let state = lock(&slot);
        Some(state.meta().peer.clone())
    }

    /// Snapshot of every registered transfer in both directions.
    pub fn in_flight(&self) -> Vec<TransferProgress> {
        let mut out = Vec::new();
        for registry in [&self.outbound, &self.inbound] {
            for id in registry.ids() {
                if let Some(slot) = registry.get(&id) {
                    let state = lock(&slot);
                    out.push(state.progress());
                }
            }
        }
        out
    }

    /// Abort everything still in flight.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .outbound
            .ids()
            .into_iter()
            .chain(self.inbound.ids())
            .collect();
        for id in ids {
            self.abort_with(&id, || TransferError::Shutdown);
        }
    }

    fn abort_with(&self, file_id: &str, error: impl Fn() -> TransferError) -> bool {
        for role in [Role::Sender, Role::Receiver] {
            let Some(slot) = self.registry(role).get(file_id) else {
                continue;
            };
            let event = {
                let mut state = lock(&slot);
                self.fail(&mut state, Some(&slot), error())
            };
            if event.is_some() {
                self.emit(event);
                return true;
            }
        }
        false
    }

    pub fn progress(&self, file_id: &str) -> Option<TransferProgress> {
        let slot = self
            .outbound
            .get(file_id)
            .or_else(|| self.inbound.get(file_id))?;
        let state = lock(&slot);
        Some(state.progress())
    }

    pub fn active_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn active_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Active -> Finished, then drop the registry entry. Caller holds the entry lock.
    fn settle(
        &self,
        state: &mut TransferState,
        slot: Option<&Slot<TransferState>>,
    ) -> Option<TransferEvent> {
        let result = state.finish();
        let registry = self.registry(state.meta().role);
        if let Some(slot) = slot {
            registry.remove_exact(&state.meta().file_id, slot);
        }
        match result {
            Ok(true) => {
                let sha256 = state.digest_hex();
                info!(
                    file_id = %state.meta().file_id,
                    role = ?state.meta().role,
                    bytes = state.processed_bytes(),
                    %sha256,
                    "transfer finished"
                );
                Some(TransferEvent::Completed {
                    progress: state.progress(),
                    sha256,
                })
            }
            Ok(false) => None,
            Err(e) => {
                warn!(file_id = %state.meta().file_id, error = %e, "final flush failed");
                Some(TransferEvent::Failed {
                    progress: state.progress(),
                    error: e.to_string(),
                })
            }
        }
    }

    /// Active -> Aborted, then drop the registry entry. None if it was already closed.
    fn fail(
        &self,
        state: &mut TransferState,
        slot: Option<&Slot<TransferState>>,
        error: TransferError,
    ) -> Option<TransferEvent> {
        if !state.abort() {
            return None;
        }
        if let Some(slot) = slot {
            self.registry(state.meta().role)
                .remove_exact(&state.meta().file_id, slot);
        }
        warn!(
            file_id = %state.meta().file_id,
            role = ?state.meta().role,
            processed = state.processed_bytes(),
            error = %error,
            "transfer aborted"
        );
        Some(TransferEvent::Failed {
            progress: state.progress(),
            error: error.to_string(),
        })
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
