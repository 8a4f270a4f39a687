//! Wires murmur-core to this host: filesystem downloads, PCM audio, and observers that log
//! events and push captured audio onto the transport.

use std::sync::Arc;

use murmur_core::{
    CallController, CallDirection, CallObserver, CallState, ChatSink, Dispatcher,
    DuplexAudioPipeline, Envelope, FsStorage, TransferEvent, TransferManager, TransferObserver,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::pcm::PcmBackend;
use crate::transport::PeerSenders;

pub type Node = Dispatcher<DuplexAudioPipeline>;

pub fn build(
    cfg: &Config,
    peers: PeerSenders,
    events: mpsc::UnboundedSender<TransferEvent>,
) -> Arc<Node> {
    let transfers = Arc::new(TransferManager::new(
        Arc::new(FsStorage::new(&cfg.download_dir)),
        Arc::new(TransferLog { events }),
    ));
    let pipeline = DuplexAudioPipeline::new(
        cfg.core.audio.clone(),
        Box::new(PcmBackend::new(cfg.audio_in.clone(), cfg.audio_out.clone())),
    );
    let calls = CallController::new(pipeline, Arc::new(CallEvents { peers }));
    Arc::new(
        Dispatcher::new(cfg.core.clone(), transfers, calls, Arc::new(ChatLog))
            .with_auto_answer(cfg.auto_answer),
    )
}

struct TransferLog {
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferObserver for TransferLog {
    fn on_transfer_event(&self, event: TransferEvent) {
        match &event {
            TransferEvent::Progress(p) => debug!(
                file_id = %p.file_id,
                processed = p.processed_bytes,
                total = p.total_size,
                "transfer progress"
            ),
            TransferEvent::Completed { progress, sha256 } => info!(
                file_id = %progress.file_id,
                peer = %progress.peer,
                name = %progress.file_name,
                location = ?progress.location,
                %sha256,
                "transfer complete"
            ),
            TransferEvent::Failed { progress, error } => warn!(
                file_id = %progress.file_id,
                peer = %progress.peer,
                %error,
                "transfer failed"
            ),
        }
        let _ = self.events.send(event);
    }
}

struct ChatLog;

impl ChatSink for ChatLog {
    fn on_chat(&self, from: &str, envelope: Envelope) {
        match envelope {
            Envelope::Text { chat_id, text, .. } => {
                info!(peer = from, chat_id = %chat_id, "text received");
                println!("[{chat_id}] {from}: {text}");
            }
            Envelope::Location {
                chat_id,
                latitude,
                longitude,
                ..
            } => {
                info!(peer = from, chat_id = %chat_id, "location received");
                println!("[{chat_id}] {from} is at {latitude:.5}, {longitude:.5}");
            }
            other => debug!(peer = from, kind = other.kind(), "not a chat envelope"),
        }
    }
}

struct CallEvents {
    peers: PeerSenders,
}

impl CallObserver for CallEvents {
    fn on_ring(&self, peer: &str, call_id: &str, direction: CallDirection) {
        match direction {
            CallDirection::Incoming => {
                println!("incoming call from {peer} ({call_id})");
            }
            CallDirection::Outgoing => {
                println!("calling {peer}...");
            }
        }
    }

    fn on_ring_stopped(&self, call_id: &str) {
        debug!(call_id, "ring stopped");
    }

    fn on_state(&self, state: &CallState) {
        info!(?state, "call state");
    }

    /// Runs on the capture thread: never wait for the lock, drop the frame instead.
    fn on_audio_frame(&self, peer: &str, call_id: &str, frame: &[u8]) {
        let Ok(peers) = self.peers.try_lock() else {
            debug!(call_id, "peer table busy, dropping audio frame");
            return;
        };
        if let Some(tx) = peers.get(peer) {
            let _ = tx.send(Node::audio_envelope(peer, call_id, frame).envelope);
        }
    }
}
