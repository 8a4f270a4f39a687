//! Host-driven node API: the host hands in envelopes from peers, the dispatcher returns the
//! envelopes to send back. File envelopes drive the transfer manager, call envelopes drive the
//! call controller, chat envelopes go to the chat sink untouched.
//!
//! Either side can end a transfer: the sender answers a request with an empty chunk, the
//! receiver sends a chunk request of size zero. File and call envelopes are only honored from
//! the peer the transfer or call belongs to.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::AudioEngine;
use crate::call::{CallController, CallError, CallState};
use crate::config::CoreConfig;
use crate::manager::{ChunkOutcome, TransferManager};
use crate::protocol::Envelope;
use crate::registry::lock;
use crate::transfer::{Role, TransferError, TransferProgress};

/// Envelope for the host to deliver to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: String,
    pub envelope: Envelope,
}

impl Outbound {
    fn new(to: &str, envelope: Envelope) -> Self {
        Self {
            to: to.to_string(),
            envelope,
        }
    }
}

/// Chat layer: receives Text and Location envelopes as they arrived.
pub trait ChatSink: Send + Sync {
    fn on_chat(&self, from: &str, envelope: Envelope);
}

impl<F> ChatSink for F
where
    F: Fn(&str, Envelope) + Send + Sync,
{
    fn on_chat(&self, from: &str, envelope: Envelope) {
        self(from, envelope)
    }
}

pub struct Dispatcher<A: AudioEngine> {
    config: CoreConfig,
    transfers: Arc<TransferManager>,
    calls: Mutex<CallController<A>>,
    chat: Arc<dyn ChatSink>,
    auto_answer: bool,
}

impl<A: AudioEngine> Dispatcher<A> {
    pub fn new(
        config: CoreConfig,
        transfers: Arc<TransferManager>,
        calls: CallController<A>,
        chat: Arc<dyn ChatSink>,
    ) -> Self {
        Self {
            config,
            transfers,
            calls: Mutex::new(calls),
            chat,
            auto_answer: false,
        }
    }

    /// Answer incoming calls as soon as they ring.
    pub fn with_auto_answer(mut self, auto_answer: bool) -> Self {
        self.auto_answer = auto_answer;
        self
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    pub fn call_state(&self) -> CallState {
        lock(&self.calls).state().clone()
    }

    /// Process one envelope from `from`. Returns envelopes to send in response.
    pub fn on_envelope(&self, from: &str, envelope: Envelope) -> Vec<Outbound> {
        debug!(peer = from, kind = envelope.kind(), "envelope received");
        match envelope {
            Envelope::Text { .. } | Envelope::Location { .. } => {
                self.chat.on_chat(from, envelope);
                Vec::new()
            }
            Envelope::FileStart {
                file_id,
                chat_id,
                file_name,
                file_size,
            } => {
                match self
                    .transfers
                    .begin_receive(&file_id, from, &chat_id, &file_name, file_size)
                {
                    Ok(progress) if progress.is_complete() => Vec::new(),
                    Ok(_) => vec![self.chunk_request(from, file_id)],
                    Err(TransferError::Duplicate(_))
                        if self.transfers.peer_of(&file_id, Role::Receiver).as_deref()
                            == Some(from) =>
                    {
                        // Repeated announce; the running transfer carries on.
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(peer = from, file_id = %file_id, error = %e, "cannot accept file");
                        vec![abort_request(from, file_id)]
                    }
                }
            }
            Envelope::ChunkRequest { file_id, max_size: 0 } => {
                if self.transfers.abort_from_peer(&file_id, Role::Sender, from) {
                    info!(peer = from, file_id = %file_id, "receiver ended transfer");
                }
                Vec::new()
            }
            Envelope::ChunkRequest { file_id, max_size } => {
                match self.transfers.peer_of(&file_id, Role::Sender) {
                    Some(owner) if owner != from => {
                        warn!(peer = from, owner = %owner, file_id = %file_id, "chunk request from foreign peer");
                        return Vec::new();
                    }
                    _ => {}
                }
                let size = self.config.clamp_request(max_size as usize);
                let data = self.transfers.produce_chunk(&file_id, size);
                vec![Outbound::new(from, Envelope::FileChunk { file_id, data })]
            }
            Envelope::FileChunk { file_id, data } => self.on_file_chunk(from, file_id, data),
            Envelope::CallInvoke { call_id } => self.on_invoke(from, call_id),
            Envelope::CallAnswer { call_id } => {
                let mut calls = lock(&self.calls);
                if !call_from_peer(&*calls, from, &call_id) {
                    return Vec::new();
                }
                match calls.on_answer(from, &call_id) {
                    Err(_) => vec![Outbound::new(from, Envelope::CallReject { call_id })],
                    Ok(_) => Vec::new(),
                }
            }
            Envelope::CallReject { call_id } => {
                let mut calls = lock(&self.calls);
                if call_from_peer(&*calls, from, &call_id) {
                    calls.on_reject(&call_id);
                }
                Vec::new()
            }
            Envelope::CallAudio { call_id, data } => {
                let calls = lock(&self.calls);
                if calls.state().peer() == Some(from) {
                    calls.play(&call_id, &data);
                }
                Vec::new()
            }
        }
    }

    fn on_file_chunk(&self, from: &str, file_id: String, data: Vec<u8>) -> Vec<Outbound> {
        match self.transfers.peer_of(&file_id, Role::Receiver) {
            Some(owner) if owner != from => {
                warn!(peer = from, owner = %owner, file_id = %file_id, "file chunk from foreign peer");
                return Vec::new();
            }
            Some(_) => {}
            None if data.is_empty() => return Vec::new(),
            // Nothing here wants it: tell the sender to stop.
            None => return vec![abort_request(from, file_id)],
        }
        if data.is_empty() {
            // Sender has nothing more for this id.
            if self.transfers.abort_from_peer(&file_id, Role::Receiver, from) {
                warn!(peer = from, file_id = %file_id, "sender ended transfer early");
            }
            return Vec::new();
        }
        match self.transfers.receive_chunk(&file_id, &data) {
            ChunkOutcome::Wanted => vec![self.chunk_request(from, file_id)],
            ChunkOutcome::Complete => Vec::new(),
            ChunkOutcome::Refused => vec![abort_request(from, file_id)],
        }
    }

    fn chunk_request(&self, to: &str, file_id: String) -> Outbound {
        let max_size = u32::try_from(self.config.chunk_size.max(1)).unwrap_or(u32::MAX);
        Outbound::new(to, Envelope::ChunkRequest { file_id, max_size })
    }

    /// Abort a transfer locally. Returns the envelope that tells its peer to stop too.
    pub fn cancel_transfer(&self, file_id: &str) -> Vec<Outbound> {
        let Some(progress) = self.transfers.progress(file_id) else {
            return Vec::new();
        };
        if !self.transfers.cancel(file_id) {
            return Vec::new();
        }
        vec![stop_envelope(&progress)]
    }

    fn on_invoke(&self, from: &str, call_id: String) -> Vec<Outbound> {
        let mut calls = lock(&self.calls);
        if calls.on_invoke(from, &call_id).is_err() {
            return vec![Outbound::new(from, Envelope::CallReject { call_id })];
        }
        if !self.auto_answer {
            return Vec::new();
        }
        match calls.answer() {
            Ok(info) => vec![Outbound::new(
                &info.peer,
                Envelope::CallAnswer {
                    call_id: info.call_id,
                },
            )],
            Err(_) => vec![Outbound::new(from, Envelope::CallReject { call_id })],
        }
    }

    /// Announce `locator` to `peer`. The peer pulls the content with chunk requests.
    pub fn send_file(
        &self,
        peer: &str,
        locator: &str,
        chat_id: &str,
    ) -> Result<Outbound, TransferError> {
        let file = self.transfers.begin_send(locator, peer, chat_id)?;
        Ok(Outbound::new(
            peer,
            Envelope::FileStart {
                file_id: file.file_id,
                chat_id: file.chat_id,
                file_name: file.file_name,
                file_size: file.total_size,
            },
        ))
    }

    pub fn send_text(&self, peer: &str, chat_id: &str, text: &str) -> Outbound {
        Outbound::new(
            peer,
            Envelope::Text {
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_string(),
                timestamp: now_millis(),
                text: text.to_string(),
            },
        )
    }

    pub fn send_location(&self, peer: &str, chat_id: &str, latitude: f64, longitude: f64) -> Outbound {
        Outbound::new(
            peer,
            Envelope::Location {
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_string(),
                timestamp: now_millis(),
                latitude,
                longitude,
            },
        )
    }

    pub fn place_call(&self, peer: &str) -> Result<Outbound, CallError> {
        let call_id = lock(&self.calls).place_call(peer)?;
        Ok(Outbound::new(peer, Envelope::CallInvoke { call_id }))
    }

    /// Accept the ringing incoming call. If the audio cannot start the caller is told no.
    pub fn answer_call(&self) -> Vec<Outbound> {
        let mut calls = lock(&self.calls);
        let ringing = match calls.state() {
            CallState::Ringing { call_id, peer, .. } => (call_id.clone(), peer.clone()),
            _ => {
                warn!("answer requested with no incoming call");
                return Vec::new();
            }
        };
        match calls.answer() {
            Ok(info) => vec![Outbound::new(
                &info.peer,
                Envelope::CallAnswer {
                    call_id: info.call_id,
                },
            )],
            Err(CallError::Audio(_)) => {
                let (call_id, peer) = ringing;
                vec![Outbound::new(&peer, Envelope::CallReject { call_id })]
            }
            Err(e) => {
                warn!(error = %e, "cannot answer");
                Vec::new()
            }
        }
    }

    pub fn hang_up(&self) -> Vec<Outbound> {
        lock(&self.calls)
            .hang_up()
            .map(|info| {
                vec![Outbound::new(
                    &info.peer,
                    Envelope::CallReject {
                        call_id: info.call_id,
                    },
                )]
            })
            .unwrap_or_default()
    }

    /// Host timer fired for `call_id` (unanswered ringing, or silence on an active call).
    pub fn call_timeout(&self, call_id: &str) -> Vec<Outbound> {
        let mut calls = lock(&self.calls);
        let Some(peer) = calls.state().peer().map(str::to_string) else {
            return Vec::new();
        };
        if calls.on_timeout(call_id) {
            vec![Outbound::new(
                &peer,
                Envelope::CallReject {
                    call_id: call_id.to_string(),
                },
            )]
        } else {
            Vec::new()
        }
    }

    /// Connection to `peer` is gone: end any call with it and abort its transfers.
    pub fn on_peer_lost(&self, peer: &str) {
        {
            let mut calls = lock(&self.calls);
            if calls.state().peer() == Some(peer) {
                if let Some(call_id) = calls.state().call_id().map(str::to_string) {
                    calls.on_timeout(&call_id);
                }
            }
        }
        self.transfers.cancel_peer(peer);
    }

    /// Local audio captured for the active call, wrapped for the wire.
    pub fn audio_envelope(peer: &str, call_id: &str, frame: &[u8]) -> Outbound {
        Outbound::new(
            peer,
            Envelope::CallAudio {
                call_id: call_id.to_string(),
                data: frame.to_vec(),
            },
        )
    }

    /// Stop everything: end the call and abort in-flight transfers. Returns the envelopes that
    /// tell each peer.
    pub fn shutdown(&self) -> Vec<Outbound> {
        let mut out = self.hang_up();
        let in_flight = self.transfers.in_flight();
        self.transfers.shutdown();
        out.extend(in_flight.iter().map(stop_envelope));
        out
    }
}

/// Receiver side: stop sending `file_id`.
fn abort_request(to: &str, file_id: String) -> Outbound {
    Outbound::new(to, Envelope::ChunkRequest { file_id, max_size: 0 })
}

/// What tells the other end of `progress` that this side has stopped.
fn stop_envelope(progress: &TransferProgress) -> Outbound {
    let file_id = progress.file_id.clone();
    match progress.role {
        Role::Sender => Outbound::new(
            &progress.peer,
            Envelope::FileChunk {
                file_id,
                data: Vec::new(),
            },
        ),
        Role::Receiver => abort_request(&progress.peer, file_id),
    }
}

fn call_from_peer<A: AudioEngine>(calls: &CallController<A>, from: &str, call_id: &str) -> bool {
    if calls.state().peer() == Some(from) {
        return true;
    }
    if calls.state().call_id() == Some(call_id) {
        warn!(peer = from, call_id, "call signal from foreign peer");
    }
    false
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, FrameCallback};
    use crate::call::CallObserver;
    use crate::manager::TransferEvent;
    use crate::storage::tests::MemStorage;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct NullEngine {
        running: bool,
        fail: bool,
    }

    impl AudioEngine for NullEngine {
        fn start(&mut self, _: FrameCallback) -> Result<(), AudioError> {
            if self.fail {
                return Err(AudioError::DeviceUnavailable("none".into()));
            }
            self.running = true;
            Ok(())
        }
        fn stop(&mut self) {
            self.running = false;
        }
        fn feed(&self, _: &[u8]) {}
        fn is_running(&self) -> bool {
            self.running
        }
    }

    struct Quiet;
    impl CallObserver for Quiet {}

    struct Node {
        name: &'static str,
        dispatcher: Dispatcher<NullEngine>,
        storage: Arc<MemStorage>,
        events: Arc<Mutex<Vec<TransferEvent>>>,
        chat: Arc<Mutex<Vec<(String, Envelope)>>>,
    }

    fn node(name: &'static str, storage: MemStorage, config: CoreConfig) -> Node {
        let storage = Arc::new(storage);
        let events = Arc::new(Mutex::new(Vec::new()));
        let chat = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let transfers = Arc::new(TransferManager::new(
            storage.clone(),
            Arc::new(move |e: TransferEvent| sink.lock().unwrap().push(e)),
        ));
        let chat_sink = chat.clone();
        let dispatcher = Dispatcher::new(
            config,
            transfers,
            CallController::new(NullEngine::default(), Arc::new(Quiet)),
            Arc::new(move |from: &str, env: Envelope| {
                chat_sink.lock().unwrap().push((from.to_string(), env))
            }),
        );
        Node {
            name,
            dispatcher,
            storage,
            events,
            chat,
        }
    }

    /// Deliver envelopes between two nodes until both go quiet. Returns envelopes delivered.
    fn pump(a: &Node, b: &Node, first: Vec<Outbound>) -> usize {
        let mut queue: VecDeque<(&'static str, Outbound)> =
            first.into_iter().map(|o| (a.name, o)).collect();
        let mut delivered = 0;
        while let Some((from, out)) = queue.pop_front() {
            delivered += 1;
            assert!(delivered < 10_000, "protocol did not settle");
            let target = if out.to == a.name { a } else { b };
            for reply in target.dispatcher.on_envelope(from, out.envelope) {
                queue.push_back((target.name, reply));
            }
        }
        delivered
    }

    fn small_chunks() -> CoreConfig {
        CoreConfig {
            chunk_size: 7,
            ..CoreConfig::default()
        }
    }

    #[test]
    fn file_moves_end_to_end() {
        let data: Vec<u8> = (0..100u8).collect();
        let alice = node("alice", MemStorage::default().with_source("pic.png", data.clone()), small_chunks());
        let bob = node("bob", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "pic.png", "chat-1").unwrap();
        // FileStart, then 15 request/chunk pairs for 100 bytes at 7 per chunk.
        assert_eq!(pump(&alice, &bob, vec![start]), 1 + 2 * 15);

        assert_eq!(bob.dispatcher.transfers().active_inbound(), 0);
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
        let done = bob.events.lock().unwrap();
        let Some(TransferEvent::Completed { progress, sha256 }) = done.last() else {
            panic!("receiver did not complete");
        };
        assert_eq!(progress.chat_id, "chat-1");
        assert_eq!(progress.peer, "alice");
        assert_eq!(bob.storage.contents(progress.location.as_deref().unwrap()), data);
        let sent = alice.events.lock().unwrap();
        assert!(matches!(sent.last(), Some(TransferEvent::Completed { sha256: s, .. }) if s == sha256));
    }

    #[test]
    fn empty_file_needs_no_chunks() {
        let alice = node("alice", MemStorage::default().with_source("e", vec![]), small_chunks());
        let bob = node("bob", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "e", "chat").unwrap();
        assert_eq!(pump(&alice, &bob, vec![start]), 1);
        assert_eq!(bob.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn peer_chunk_requests_are_clamped() {
        let config = CoreConfig {
            max_chunk_size: 16,
            ..CoreConfig::default()
        };
        let alice = node("alice", MemStorage::default().with_source("f", vec![1; 100]), config);
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        let Envelope::FileStart { file_id, .. } = start.envelope else {
            panic!("expected file start");
        };
        let out = alice.dispatcher.on_envelope(
            "bob",
            Envelope::ChunkRequest {
                file_id,
                max_size: u32::MAX,
            },
        );
        assert!(matches!(&out[0].envelope, Envelope::FileChunk { data, .. } if data.len() == 16));
    }

    #[test]
    fn empty_chunk_ends_inbound_transfer() {
        let bob = node("bob", MemStorage::default(), small_chunks());
        let out = bob.dispatcher.on_envelope(
            "alice",
            Envelope::FileStart {
                file_id: "f".into(),
                chat_id: "c".into(),
                file_name: "x".into(),
                file_size: 10,
            },
        );
        assert!(matches!(&out[0].envelope, Envelope::ChunkRequest { max_size: 7, .. }));
        let out = bob.dispatcher.on_envelope(
            "alice",
            Envelope::FileChunk {
                file_id: "f".into(),
                data: vec![],
            },
        );
        assert!(out.is_empty());
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 0);
        assert!(matches!(
            bob.events.lock().unwrap().last(),
            Some(TransferEvent::Failed { .. })
        ));
    }

    fn file_id_of(start: &Outbound) -> String {
        let Envelope::FileStart { file_id, .. } = &start.envelope else {
            panic!("expected file start");
        };
        file_id.clone()
    }

    fn last_error(events: &Mutex<Vec<TransferEvent>>) -> Option<String> {
        match events.lock().unwrap().last() {
            Some(TransferEvent::Failed { error, .. }) => Some(error.clone()),
            _ => None,
        }
    }

    #[test]
    fn receiver_cancel_closes_the_sender() {
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let bob = node("bob", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        let file_id = file_id_of(&start);
        let request = bob.dispatcher.on_envelope("alice", start.envelope);
        let chunk = alice.dispatcher.on_envelope("bob", request[0].envelope.clone());
        let next = bob.dispatcher.on_envelope("alice", chunk[0].envelope.clone());
        assert!(matches!(&next[0].envelope, Envelope::ChunkRequest { max_size: 7, .. }));

        let stop = bob.dispatcher.cancel_transfer(&file_id);
        assert_eq!(
            stop,
            vec![Outbound::new("alice", Envelope::ChunkRequest { file_id, max_size: 0 })]
        );
        pump(&bob, &alice, stop);
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 0);
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
        assert_eq!(last_error(&alice.events).as_deref(), Some("aborted by peer"));
    }

    #[test]
    fn sender_cancel_closes_the_receiver() {
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let bob = node("bob", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        let file_id = file_id_of(&start);
        bob.dispatcher.on_envelope("alice", start.envelope);

        let stop = alice.dispatcher.cancel_transfer(&file_id);
        pump(&alice, &bob, stop);
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 0);
        assert!(alice.dispatcher.cancel_transfer(&file_id).is_empty());
    }

    #[test]
    fn receiver_write_failure_closes_the_sender() {
        let failing = MemStorage::default();
        *failing.fail_writes_after.lock().unwrap() = Some(10);
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let bob = node("bob", failing, small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        // FileStart, two request/chunk pairs, then the abort after the failed second write.
        assert_eq!(pump(&alice, &bob, vec![start]), 1 + 2 * 2 + 1);
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 0);
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
        assert_eq!(last_error(&alice.events).as_deref(), Some("aborted by peer"));
    }

    #[test]
    fn refused_announce_closes_the_sender() {
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let carol = node("carol", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        let file_id = file_id_of(&start);
        // Carol already holds an inbound transfer under the same id from someone else.
        carol.dispatcher.on_envelope(
            "bob",
            Envelope::FileStart {
                file_id: file_id.clone(),
                chat_id: "c".into(),
                file_name: "other".into(),
                file_size: 50,
            },
        );
        let reply = carol.dispatcher.on_envelope("alice", start.envelope.clone());
        assert_eq!(
            reply,
            vec![Outbound::new("alice", Envelope::ChunkRequest { file_id: file_id.clone(), max_size: 0 })]
        );
        // A repeated announce from the owning sender leaves its transfer alone.
        assert!(carol
            .dispatcher
            .on_envelope(
                "bob",
                Envelope::FileStart {
                    file_id: file_id.clone(),
                    chat_id: "c".into(),
                    file_name: "other".into(),
                    file_size: 50,
                },
            )
            .is_empty());
        assert_eq!(carol.dispatcher.transfers().active_inbound(), 1);

        // The abort is honored only from the peer alice is sending to.
        alice.dispatcher.on_envelope("carol", reply[0].envelope.clone());
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 1);
        alice.dispatcher.on_envelope("bob", reply[0].envelope.clone());
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
    }

    #[test]
    fn lost_peer_aborts_its_transfers() {
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let bob = node("bob", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        bob.dispatcher.on_envelope("alice", start.envelope);
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 1);

        bob.dispatcher.on_peer_lost("carol");
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 1);
        bob.dispatcher.on_peer_lost("alice");
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 0);
        alice.dispatcher.on_peer_lost("bob");
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
        assert_eq!(last_error(&alice.events).as_deref(), Some("peer bob disconnected"));
        assert_eq!(last_error(&bob.events).as_deref(), Some("peer alice disconnected"));
    }

    #[test]
    fn shutdown_tells_every_peer() {
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        let outgoing = file_id_of(&start);
        alice.dispatcher.on_envelope(
            "carol",
            Envelope::FileStart {
                file_id: "in".into(),
                chat_id: "c".into(),
                file_name: "x".into(),
                file_size: 10,
            },
        );
        let mut out = alice.dispatcher.shutdown();
        out.sort_by(|a, b| a.to.cmp(&b.to));
        assert_eq!(
            out,
            vec![
                Outbound::new("bob", Envelope::FileChunk { file_id: outgoing, data: vec![] }),
                Outbound::new("carol", Envelope::ChunkRequest { file_id: "in".into(), max_size: 0 }),
            ]
        );
        assert_eq!(alice.dispatcher.transfers().active_outbound(), 0);
        assert_eq!(alice.dispatcher.transfers().active_inbound(), 0);
    }

    #[test]
    fn foreign_peers_cannot_touch_a_transfer() {
        let alice = node("alice", MemStorage::default().with_source("f", vec![3; 100]), small_chunks());
        let bob = node("bob", MemStorage::default(), small_chunks());
        let start = alice.dispatcher.send_file("bob", "f", "chat").unwrap();
        let file_id = file_id_of(&start);
        bob.dispatcher.on_envelope("alice", start.envelope);

        let pull = Envelope::ChunkRequest { file_id: file_id.clone(), max_size: 7 };
        assert!(alice.dispatcher.on_envelope("mallory", pull).is_empty());
        assert_eq!(alice.dispatcher.transfers().progress(&file_id).unwrap().processed_bytes, 0);

        let inject = Envelope::FileChunk { file_id: file_id.clone(), data: vec![9; 7] };
        assert!(bob.dispatcher.on_envelope("mallory", inject).is_empty());
        assert_eq!(bob.dispatcher.transfers().progress(&file_id).unwrap().processed_bytes, 0);

        let end = Envelope::FileChunk { file_id: file_id.clone(), data: vec![] };
        bob.dispatcher.on_envelope("mallory", end);
        assert_eq!(bob.dispatcher.transfers().active_inbound(), 1);
    }

    #[test]
    fn chunk_for_unknown_transfer_asks_sender_to_stop() {
        let bob = node("bob", MemStorage::default(), small_chunks());
        let out = bob
            .dispatcher
            .on_envelope("alice", Envelope::FileChunk { file_id: "gone".into(), data: vec![1] });
        assert_eq!(
            out,
            vec![Outbound::new("alice", Envelope::ChunkRequest { file_id: "gone".into(), max_size: 0 })]
        );
        assert!(bob
            .dispatcher
            .on_envelope("alice", Envelope::FileChunk { file_id: "gone".into(), data: vec![] })
            .is_empty());
    }

    #[test]
    fn foreign_peers_cannot_end_or_feed_a_call() {
        let bob = node("bob", MemStorage::default(), CoreConfig::default());
        bob.dispatcher
            .on_envelope("alice", Envelope::CallInvoke { call_id: "c1".into() });
        assert!(bob
            .dispatcher
            .on_envelope("mallory", Envelope::CallReject { call_id: "c1".into() })
            .is_empty());
        assert_eq!(bob.dispatcher.call_state().call_id(), Some("c1"));
        bob.dispatcher
            .on_envelope("alice", Envelope::CallReject { call_id: "c1".into() });
        assert_eq!(bob.dispatcher.call_state(), CallState::Idle);

        let alice = node("alice", MemStorage::default(), CoreConfig::default());
        let Envelope::CallInvoke { call_id } = alice.dispatcher.place_call("bob").unwrap().envelope else {
            panic!("expected invite");
        };
        alice
            .dispatcher
            .on_envelope("mallory", Envelope::CallAnswer { call_id: call_id.clone() });
        assert!(matches!(alice.dispatcher.call_state(), CallState::Ringing { .. }));
        alice.dispatcher.on_envelope("bob", Envelope::CallAnswer { call_id });
        assert!(matches!(alice.dispatcher.call_state(), CallState::Active { .. }));
    }

    #[test]
    fn chat_envelopes_pass_through() {
        let alice = node("alice", MemStorage::default(), CoreConfig::default());
        let bob = node("bob", MemStorage::default(), CoreConfig::default());
        let text = alice.dispatcher.send_text("bob", "chat-9", "hello");
        let loc = alice.dispatcher.send_location("bob", "chat-9", 52.52, 13.40);
        pump(&alice, &bob, vec![text.clone(), loc]);
        let chat = bob.chat.lock().unwrap();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0], ("alice".to_string(), text.envelope));
        assert!(matches!(chat[1].1, Envelope::Location { .. }));
    }

    #[test]
    fn call_setup_and_teardown() {
        let alice = node("alice", MemStorage::default(), CoreConfig::default());
        let bob = node("bob", MemStorage::default(), CoreConfig::default());
        let invite = alice.dispatcher.place_call("bob").unwrap();
        pump(&alice, &bob, vec![invite]);
        assert!(matches!(bob.dispatcher.call_state(), CallState::Ringing { .. }));

        let answer = bob.dispatcher.answer_call();
        pump(&bob, &alice, answer);
        assert!(matches!(alice.dispatcher.call_state(), CallState::Active { .. }));
        assert!(matches!(bob.dispatcher.call_state(), CallState::Active { .. }));

        let bye = alice.dispatcher.hang_up();
        pump(&alice, &bob, bye);
        assert_eq!(alice.dispatcher.call_state(), CallState::Idle);
        assert_eq!(bob.dispatcher.call_state(), CallState::Idle);
    }

    #[test]
    fn second_caller_gets_rejected() {
        let bob = node("bob", MemStorage::default(), CoreConfig::default());
        assert!(bob
            .dispatcher
            .on_envelope("alice", Envelope::CallInvoke { call_id: "c1".into() })
            .is_empty());
        let out = bob
            .dispatcher
            .on_envelope("carol", Envelope::CallInvoke { call_id: "c2".into() });
        assert_eq!(
            out,
            vec![Outbound::new("carol", Envelope::CallReject { call_id: "c2".into() })]
        );
        assert_eq!(bob.dispatcher.call_state().call_id(), Some("c1"));
    }

    #[test]
    fn auto_answer_replies_immediately() {
        let bob = node("bob", MemStorage::default(), CoreConfig::default());
        let dispatcher = bob.dispatcher.with_auto_answer(true);
        let out = dispatcher.on_envelope("alice", Envelope::CallInvoke { call_id: "c1".into() });
        assert_eq!(
            out,
            vec![Outbound::new("alice", Envelope::CallAnswer { call_id: "c1".into() })]
        );
        assert!(matches!(dispatcher.call_state(), CallState::Active { .. }));
    }

    #[test]
    fn failed_audio_rejects_the_caller() {
        let transfers = Arc::new(TransferManager::new(
            Arc::new(MemStorage::default()),
            Arc::new(|_: TransferEvent| {}),
        ));
        let dispatcher = Dispatcher::new(
            CoreConfig::default(),
            transfers,
            CallController::new(
                NullEngine {
                    running: false,
                    fail: true,
                },
                Arc::new(Quiet),
            ),
            Arc::new(|_: &str, _: Envelope| {}),
        );
        dispatcher.on_envelope("alice", Envelope::CallInvoke { call_id: "c1".into() });
        assert_eq!(
            dispatcher.answer_call(),
            vec![Outbound::new("alice", Envelope::CallReject { call_id: "c1".into() })]
        );
        assert_eq!(dispatcher.call_state(), CallState::Idle);
    }

    #[test]
    fn ringing_timeout_tells_the_peer() {
        let alice = node("alice", MemStorage::default(), CoreConfig::default());
        let Envelope::CallInvoke { call_id } = alice.dispatcher.place_call("bob").unwrap().envelope else {
            panic!("expected invite");
        };
        assert!(alice.dispatcher.call_timeout("other").is_empty());
        let out = alice.dispatcher.call_timeout(&call_id);
        assert_eq!(out, vec![Outbound::new("bob", Envelope::CallReject { call_id })]);
        assert_eq!(alice.dispatcher.call_state(), CallState::Idle);
    }

    #[test]
    fn lost_peer_ends_its_call() {
        let bob = node("bob", MemStorage::default(), CoreConfig::default());
        bob.dispatcher
            .on_envelope("alice", Envelope::CallInvoke { call_id: "c1".into() });
        bob.dispatcher.on_peer_lost("carol");
        assert!(!matches!(bob.dispatcher.call_state(), CallState::Idle));
        bob.dispatcher.on_peer_lost("alice");
        assert_eq!(bob.dispatcher.call_state(), CallState::Idle);
    }
}
