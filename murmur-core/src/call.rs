//! Call controller: one call at a time, gating the audio pipeline on signaling events.
//!
//! Remote signals arrive through `on_invoke`/`on_answer`/`on_reject`/`on_timeout`; the local user
//! acts through `place_call`/`answer`/`hang_up`. Every remote signal carries a call id and is
//! ignored unless it matches the call being tracked.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::{AudioEngine, AudioError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// The peer invited us.
    Incoming,
    /// We invited the peer.
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing {
        call_id: String,
        peer: String,
        direction: CallDirection,
    },
    Active {
        call_id: String,
        peer: String,
    },
}

impl CallState {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            CallState::Idle => None,
            CallState::Ringing { call_id, .. } | CallState::Active { call_id, .. } => Some(call_id),
        }
    }

    pub fn peer(&self) -> Option<&str> {
        match self {
            CallState::Idle => None,
            CallState::Ringing { peer, .. } | CallState::Active { peer, .. } => Some(peer),
        }
    }
}

/// A call that just ended or started, for signaling the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub call_id: String,
    pub peer: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("already in call {0}")]
    Busy(String),
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("audio: {0}")]
    Audio(#[from] AudioError),
}

/// UI and transport hooks. All methods default to no-ops.
pub trait CallObserver: Send + Sync {
    fn on_ring(&self, _peer: &str, _call_id: &str, _direction: CallDirection) {}
    fn on_ring_stopped(&self, _call_id: &str) {}
    fn on_state(&self, _state: &CallState) {}
    /// A captured frame to send to `peer` as audio for `call_id`. Runs on the capture thread.
    fn on_audio_frame(&self, _peer: &str, _call_id: &str, _frame: &[u8]) {}
}

pub struct CallController<A: AudioEngine> {
    state: CallState,
    audio: A,
    observer: Arc<dyn CallObserver>,
}

impl<A: AudioEngine> CallController<A> {
    pub fn new(audio: A, observer: Arc<dyn CallObserver>) -> Self {
        Self {
            state: CallState::Idle,
            audio,
            observer,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == CallState::Idle
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }

    fn set_state(&mut self, state: CallState) {
        if let CallState::Ringing { call_id, .. } = &self.state {
            if !matches!(state, CallState::Ringing { .. }) {
                self.observer.on_ring_stopped(call_id);
            }
        }
        self.state = state;
        self.observer.on_state(&self.state);
    }

    fn ring(&mut self, peer: &str, call_id: String, direction: CallDirection) {
        self.observer.on_ring(peer, &call_id, direction);
        self.set_state(CallState::Ringing {
            call_id,
            peer: peer.to_string(),
            direction,
        });
    }

    /// Remote invite. Rings when idle; otherwise the caller is told we are busy.
    pub fn on_invoke(&mut self, peer: &str, call_id: &str) -> Result<(), CallError> {
        if let Some(current) = self.state.call_id() {
            warn!(peer, call_id, current, "invite while another call is in progress");
            return Err(CallError::Busy(current.to_string()));
        }
        info!(peer, call_id, "incoming call");
        self.ring(peer, call_id.to_string(), CallDirection::Incoming);
        Ok(())
    }

    /// Remote accepted the call we are ringing. Returns whether the call went active.
    pub fn on_answer(&mut self, peer: &str, call_id: &str) -> Result<bool, CallError> {
        match &self.state {
            CallState::Ringing { call_id: current, .. } if current == call_id => {}
            other => {
                warn!(peer, call_id, current = ?other.call_id(), "answer for unknown call ignored");
                return Ok(false);
            }
        }
        self.activate()?;
        Ok(true)
    }

    /// Remote declined or ended the call. Returns whether anything changed.
    pub fn on_reject(&mut self, call_id: &str) -> bool {
        self.end_matching(call_id, "rejected")
    }

    /// Ringing or call timed out. Returns whether anything changed.
    pub fn on_timeout(&mut self, call_id: &str) -> bool {
        self.end_matching(call_id, "timed out")
    }

    /// Remote audio for the active call. Anything else is dropped.
    pub fn play(&self, call_id: &str, bytes: &[u8]) {
        match &self.state {
            CallState::Active { call_id: current, .. } if current == call_id => {
                self.audio.feed(bytes);
            }
            _ => {}
        }
    }

    /// Start ringing `peer`. Returns the new call id to send in the invite.
    pub fn place_call(&mut self, peer: &str) -> Result<String, CallError> {
        if let Some(current) = self.state.call_id() {
            return Err(CallError::Busy(current.to_string()));
        }
        let call_id = Uuid::new_v4().to_string();
        info!(peer, call_id = %call_id, "placing call");
        self.ring(peer, call_id.clone(), CallDirection::Outgoing);
        Ok(call_id)
    }

    /// Local user accepts the incoming call. Returns the call to signal as answered.
    pub fn answer(&mut self) -> Result<CallInfo, CallError> {
        let CallState::Ringing {
            call_id,
            peer,
            direction: CallDirection::Incoming,
        } = &self.state
        else {
            return Err(CallError::NoIncomingCall);
        };
        let info = CallInfo {
            call_id: call_id.clone(),
            peer: peer.clone(),
        };
        self.activate()?;
        Ok(info)
    }

    /// Local user declines or ends the call. Returns the call to signal as rejected.
    pub fn hang_up(&mut self) -> Option<CallInfo> {
        let info = CallInfo {
            call_id: self.state.call_id()?.to_string(),
            peer: self.state.peer()?.to_string(),
        };
        self.end_matching(&info.call_id, "hung up");
        Some(info)
    }

    /// Ringing -> Active, starting the pipeline. A start failure drops back to Idle.
    fn activate(&mut self) -> Result<(), CallError> {
        let (call_id, peer) = match &self.state {
            CallState::Ringing { call_id, peer, .. } => (call_id.clone(), peer.clone()),
            _ => return Ok(()),
        };
        let observer = self.observer.clone();
        let (frame_peer, frame_call) = (peer.clone(), call_id.clone());
        let started = self.audio.start(Arc::new(move |frame: &[u8]| {
            observer.on_audio_frame(&frame_peer, &frame_call, frame)
        }));
        if let Err(e) = started {
            error!(peer = %peer, call_id = %call_id, error = %e, "cannot start call audio");
            self.set_state(CallState::Idle);
            return Err(e.into());
        }
        info!(peer = %peer, call_id = %call_id, "call active");
        self.set_state(CallState::Active { call_id, peer });
        Ok(())
    }

    fn end_matching(&mut self, call_id: &str, reason: &str) -> bool {
        match self.state.call_id() {
            Some(current) if current == call_id => {}
            current => {
                warn!(call_id, ?current, reason, "signal for unknown call ignored");
                return false;
            }
        }
        if matches!(self.state, CallState::Active { .. }) {
            self.audio.stop();
        }
        info!(call_id, reason, "call ended");
        self.set_state(CallState::Idle);
        true
    }
}

impl<A: AudioEngine> Drop for CallController<A> {
    fn drop(&mut self) {
        self.audio.stop();
    }
}
