//! Audio devices over raw PCM files, for headless nodes and testing links without a sound card.
//! Capture replays `audio_in` at real-time pace; playback appends to `audio_out`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use murmur_core::{AudioBackend, AudioConfig, AudioError, AudioSink, AudioSource};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct PcmBackend {
    audio_in: Option<PathBuf>,
    audio_out: Option<PathBuf>,
}

impl PcmBackend {
    pub fn new(audio_in: Option<PathBuf>, audio_out: Option<PathBuf>) -> Self {
        Self {
            audio_in,
            audio_out,
        }
    }
}

fn device_error(path: &std::path::Path, e: io::Error) -> AudioError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => AudioError::PermissionDenied,
        _ => AudioError::DeviceUnavailable(format!("{}: {e}", path.display())),
    }
}

impl AudioBackend for PcmBackend {
    fn open_capture(&mut self, config: &AudioConfig) -> Result<Box<dyn AudioSource>, AudioError> {
        let file = match &self.audio_in {
            Some(path) => Some(File::open(path).map_err(|e| device_error(path, e))?),
            None => None,
        };
        info!(input = ?self.audio_in, "capture opened");
        Ok(Box::new(PcmSource {
            file,
            frame_duration: config.capture_frame_duration(),
            next_due: None,
        }))
    }

    fn open_playback(&mut self, _config: &AudioConfig) -> Result<Box<dyn AudioSink>, AudioError> {
        let file = match &self.audio_out {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| device_error(path, e))?,
            ),
            None => None,
        };
        info!(output = ?self.audio_out, "playback opened");
        Ok(Box::new(PcmSink { file }))
    }
}

/// Hands out one frame per frame duration, like a microphone would.
struct PcmSource {
    file: Option<File>,
    frame_duration: Duration,
    next_due: Option<Instant>,
}

impl AudioSource for PcmSource {
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + self.frame_duration);

        let mut filled = 0;
        if let Some(file) = self.file.as_mut() {
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => {
                        debug!("capture input exhausted, continuing with silence");
                        self.file = None;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
        buf[filled..].fill(0);
        Ok(buf.len())
    }
}

struct PcmSink {
    file: Option<File>,
}

impl AudioSink for PcmSink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(frame),
            None => Ok(()),
        }
    }
}
