//! Tunables for chunking and call audio. Every field has a serde default so hosts can
//! embed a partial `[core]` table in their own config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bytes asked for per chunk request. Sized for a narrow radio link MTU.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Upper bound on any chunk, whatever a peer asks for.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Size the receiver requests for each chunk.
    pub chunk_size: usize,
    /// Cap applied to chunk requests arriving from peers.
    pub max_chunk_size: usize,
    pub audio: AudioConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            audio: AudioConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Chunk size a peer's request is served with: never zero, never above the cap.
    pub fn clamp_request(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_chunk_size.max(1))
    }
}

/// Call audio format and pipeline timing. PCM 16-bit little-endian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes read from the capture device per frame.
    pub capture_frame_bytes: usize,
    /// Bytes handed to the playback device per write.
    pub playback_frame_bytes: usize,
    /// Jitter buffer between the network and the playback device.
    pub ring_capacity: usize,
    /// Sleep between playback polls while the ring is short of a frame.
    pub poll_interval_ms: u64,
    /// Longest `stop()` waits for each audio thread.
    pub join_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        // 40 ms of 8 kHz mono 16-bit audio per capture frame.
        let capture = 640;
        Self {
            sample_rate: 8_000,
            channels: 1,
            capture_frame_bytes: capture,
            playback_frame_bytes: capture * 2,
            ring_capacity: capture * 16,
            poll_interval_ms: 2,
            join_timeout_ms: 50,
        }
    }
}

impl AudioConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Bytes of PCM produced per second at this format.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }

    /// Wall-clock length of one capture frame.
    pub fn capture_frame_duration(&self) -> Duration {
        let bps = self.bytes_per_second().max(1) as u64;
        Duration::from_micros(self.capture_frame_bytes as u64 * 1_000_000 / bps)
    }
}
