//! Duplex call audio: a capture thread pushing frames to the transport and a playback thread
//! draining the jitter ring into the device. The ring is the only state the two threads share.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::AudioConfig;
use crate::ring::RingBuffer;

/// Capture side of the audio hardware.
pub trait AudioSource: Send {
    /// Fill `buf` with the next frame. Returns bytes captured (0 = nothing this time).
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Playback side of the audio hardware.
pub trait AudioSink: Send {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Opens the hardware for one call. Devices are released by dropping what it returns.
pub trait AudioBackend: Send {
    fn open_capture(&mut self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, AudioError>;
    fn open_playback(&mut self, config: &AudioConfig) -> Result<Box<dyn AudioSink>, AudioError>;
}

/// Receives every captured frame (the transport send path).
pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// What the call controller needs from an audio pipeline.
pub trait AudioEngine: Send {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError>;
    fn stop(&mut self);
    fn feed(&self, bytes: &[u8]);
    fn is_running(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio permission denied")]
    PermissionDenied,
    #[error("audio pipeline already running")]
    AlreadyRunning,
    #[error("failed to spawn audio thread: {0}")]
    Spawn(#[from] io::Error),
}

pub struct DuplexAudioPipeline {
    config: AudioConfig,
    backend: Box<dyn AudioBackend>,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    playback: Option<JoinHandle<()>>,
}

impl DuplexAudioPipeline {
    pub fn new(config: AudioConfig, backend: Box<dyn AudioBackend>) -> Self {
        let ring = Arc::new(RingBuffer::new(config.ring_capacity.max(1)));
        Self {
            config,
            backend,
            ring,
            running: Arc::new(AtomicBool::new(false)),
            capture: None,
            playback: None,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Bytes waiting for playback.
    pub fn buffered(&self) -> usize {
        self.ring.available()
    }

    /// Remote audio dropped because playback fell behind.
    pub fn dropped_bytes(&self) -> u64 {
        self.ring.evicted()
    }

    fn spawn_threads(
        &mut self,
        mut source: Box<dyn AudioSource>,
        mut sink: Box<dyn AudioSink>,
        on_frame: FrameCallback,
    ) -> io::Result<()> {
        let running = self.running.clone();
        let frame_len = self.config.capture_frame_bytes.max(1);
        let capture = thread::Builder::new()
            .name("murmur-capture".into())
            .spawn(move || {
                let mut frame = vec![0u8; frame_len];
                while running.load(Ordering::Acquire) {
                    match source.read_frame(&mut frame) {
                        Ok(0) => {}
                        Ok(n) => on_frame(&frame[..n.min(frame_len)]),
                        Err(e) => {
                            error!(error = %e, "audio capture failed, stopping capture");
                            break;
                        }
                    }
                }
                debug!("capture thread exiting");
            })?;
        self.capture = Some(capture);

        let running = self.running.clone();
        let ring = self.ring.clone();
        let frame_len = self.config.playback_frame_bytes.max(1);
        let poll = self.config.poll_interval();
        let playback = thread::Builder::new()
            .name("murmur-playback".into())
            .spawn(move || {
                let mut frame = vec![0u8; frame_len];
                while running.load(Ordering::Acquire) {
                    if !ring.available_at_least(frame_len) {
                        thread::sleep(poll);
                        continue;
                    }
                    let n = ring.read_into(&mut frame);
                    if let Err(e) = sink.write_frame(&frame[..n]) {
                        error!(error = %e, "audio playback failed, stopping playback");
                        break;
                    }
                }
                debug!("playback thread exiting");
            });
        match playback {
            Ok(handle) => {
                self.playback = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                join_bounded(self.capture.take(), self.config.join_timeout(), "capture");
                Err(e)
            }
        }
    }
}

impl AudioEngine for DuplexAudioPipeline {
    /// Open both devices and start the capture and playback threads.
    /// Hardware failures are reported here once; the pipeline stays stopped.
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError> {
        if self.is_running() {
            return Err(AudioError::AlreadyRunning);
        }
        let source = self.backend.open_capture(&self.config).map_err(|e| {
            error!(error = %e, "cannot open capture device");
            e
        })?;
        let sink = self.backend.open_playback(&self.config).map_err(|e| {
            error!(error = %e, "cannot open playback device");
            e
        })?;

        self.ring.clear();
        // Threads detached by an earlier stop keep their own flag, which stays false.
        self.running = Arc::new(AtomicBool::new(true));
        if let Err(e) = self.spawn_threads(source, sink, on_frame) {
            self.running.store(false, Ordering::Release);
            return Err(e.into());
        }
        info!(
            sample_rate = self.config.sample_rate,
            capture_frame = self.config.capture_frame_bytes,
            playback_frame = self.config.playback_frame_bytes,
            "audio pipeline started"
        );
        Ok(())
    }

    /// Signal both threads and join them within the configured timeout. Idempotent.
    fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let timeout = self.config.join_timeout();
        join_bounded(self.capture.take(), timeout, "capture");
        join_bounded(self.playback.take(), timeout, "playback");
        if was_running {
            self.ring.clear();
            info!(dropped = self.ring.evicted(), "audio pipeline stopped");
        }
    }

    /// Queue remote audio for playback. Never blocks; evicts the oldest audio on overrun.
    fn feed(&self, bytes: &[u8]) {
        self.ring.write(bytes);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for DuplexAudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join `handle` if it finishes before `timeout`; otherwise detach it. A device read that never
/// returns must not hang call teardown.
fn join_bounded(handle: Option<JoinHandle<()>>, timeout: Duration, name: &str) {
    let Some(handle) = handle else {
        return;
    };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, "audio thread did not stop in time, detaching");
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        error!(thread = name, "audio thread panicked");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Capture yields a fixed byte per frame at a steady pace; playback records what it gets.
    pub(crate) struct FakeBackend {
        pub played: Arc<Mutex<Vec<u8>>>,
        pub fail_capture: bool,
        pub opened: Arc<Mutex<u32>>,
    }

    impl FakeBackend {
        pub(crate) fn new() -> Self {
            Self {
                played: Arc::new(Mutex::new(Vec::new())),
                fail_capture: false,
                opened: Arc::new(Mutex::new(0)),
            }
        }
    }

    struct ToneSource;

    impl AudioSource for ToneSource {
        fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            buf.fill(7);
            Ok(buf.len())
        }
    }

    struct RecordingSink(Arc<Mutex<Vec<u8>>>);

    impl AudioSink for RecordingSink {
        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(frame);
            Ok(())
        }
    }

    impl AudioBackend for FakeBackend {
        fn open_capture(&mut self, _: &AudioConfig) -> Result<Box<dyn AudioSource>, AudioError> {
            if self.fail_capture {
                return Err(AudioError::DeviceUnavailable("busy".into()));
            }
            *self.opened.lock().unwrap() += 1;
            Ok(Box::new(ToneSource))
        }

        fn open_playback(&mut self, _: &AudioConfig) -> Result<Box<dyn AudioSink>, AudioError> {
            Ok(Box::new(RecordingSink(self.played.clone())))
        }
    }

    fn small_config() -> AudioConfig {
        AudioConfig {
            capture_frame_bytes: 4,
            playback_frame_bytes: 8,
            ring_capacity: 64,
            poll_interval_ms: 1,
            join_timeout_ms: 200,
            ..AudioConfig::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn capture_frames_reach_callback() {
        let mut pipeline = DuplexAudioPipeline::new(small_config(), Box::new(FakeBackend::new()));
        let captured = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = captured.clone();
        pipeline
            .start(Arc::new(move |frame: &[u8]| sink.lock().unwrap().push(frame.to_vec())))
            .unwrap();
        assert!(wait_for(|| captured.lock().unwrap().len() >= 3));
        pipeline.stop();
        assert!(captured.lock().unwrap().iter().all(|f| f == &vec![7u8; 4]));
    }

    #[test]
    fn fed_audio_is_played_in_frames() {
        let backend = FakeBackend::new();
        let played = backend.played.clone();
        let mut pipeline = DuplexAudioPipeline::new(small_config(), Box::new(backend));
        pipeline.start(Arc::new(|_: &[u8]| {})).unwrap();
        pipeline.feed(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(wait_for(|| played.lock().unwrap().len() == 8));
        // Two bytes stay buffered: less than a playback frame.
        assert_eq!(pipeline.buffered(), 2);
        pipeline.stop();
        assert_eq!(*played.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn start_failure_leaves_pipeline_inert() {
        let mut backend = FakeBackend::new();
        backend.fail_capture = true;
        let mut pipeline = DuplexAudioPipeline::new(small_config(), Box::new(backend));
        let err = pipeline.start(Arc::new(|_: &[u8]| {})).unwrap_err();
        assert!(matches!(err, AudioError::DeviceUnavailable(_)));
        assert!(!pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn detached_capture_stays_stopped_after_restart() {
        struct StuckBackend {
            opened: u32,
        }

        struct SlowSource;

        impl AudioSource for SlowSource {
            fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                thread::sleep(Duration::from_millis(150));
                buf.fill(1);
                Ok(buf.len())
            }
        }

        impl AudioBackend for StuckBackend {
            fn open_capture(&mut self, _: &AudioConfig) -> Result<Box<dyn AudioSource>, AudioError> {
                self.opened += 1;
                if self.opened == 1 {
                    Ok(Box::new(SlowSource))
                } else {
                    Ok(Box::new(ToneSource))
                }
            }

            fn open_playback(&mut self, _: &AudioConfig) -> Result<Box<dyn AudioSink>, AudioError> {
                Ok(Box::new(RecordingSink(Arc::new(Mutex::new(Vec::new())))))
            }
        }

        let config = AudioConfig {
            join_timeout_ms: 20,
            ..small_config()
        };
        let mut pipeline = DuplexAudioPipeline::new(config, Box::new(StuckBackend { opened: 0 }));
        let first = Arc::new(Mutex::new(0usize));
        let counter = first.clone();
        pipeline
            .start(Arc::new(move |_: &[u8]| *counter.lock().unwrap() += 1))
            .unwrap();
        // Capture is inside its first slow read; stop gives up waiting and detaches it.
        thread::sleep(Duration::from_millis(10));
        pipeline.stop();

        let second = Arc::new(Mutex::new(0usize));
        let counter = second.clone();
        pipeline
            .start(Arc::new(move |_: &[u8]| *counter.lock().unwrap() += 1))
            .unwrap();
        // Long enough for the detached read to return and, if it were revived, loop again.
        thread::sleep(Duration::from_millis(400));
        pipeline.stop();

        assert!(*second.lock().unwrap() > 0);
        // At most the one read that was already in flight when the first call stopped.
        assert!(*first.lock().unwrap() <= 1);
    }

    #[test]
    fn stop_is_idempotent_and_safe_without_start() {
        let mut pipeline = DuplexAudioPipeline::new(small_config(), Box::new(FakeBackend::new()));
        pipeline.stop();
        pipeline.start(Arc::new(|_: &[u8]| {})).unwrap();
        assert!(pipeline.is_running());
        let t = Instant::now();
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(t.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn restart_reopens_devices() {
        let backend = FakeBackend::new();
        let opened = backend.opened.clone();
        let mut pipeline = DuplexAudioPipeline::new(small_config(), Box::new(backend));
        pipeline.start(Arc::new(|_: &[u8]| {})).unwrap();
        assert!(matches!(
            pipeline.start(Arc::new(|_: &[u8]| {})),
            Err(AudioError::AlreadyRunning)
        ));
        pipeline.stop();
        pipeline.start(Arc::new(|_: &[u8]| {})).unwrap();
        pipeline.stop();
        assert_eq!(*opened.lock().unwrap(), 2);
    }
}
