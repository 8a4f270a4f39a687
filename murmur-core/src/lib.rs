//! Murmur messaging data plane.
//! Host-driven: no sockets; the host passes envelopes and hardware in and delivers what comes back.

pub mod audio;
pub mod call;
pub mod config;
pub mod dispatch;
pub mod ffi;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod storage;
pub mod transfer;
pub mod wire;

pub use audio::{
    AudioBackend, AudioEngine, AudioError, AudioSink, AudioSource, DuplexAudioPipeline,
    FrameCallback,
};
pub use call::{CallController, CallDirection, CallError, CallInfo, CallObserver, CallState};
pub use config::{AudioConfig, CoreConfig};
pub use dispatch::{ChatSink, Dispatcher, Outbound};
pub use manager::{ChunkOutcome, OutgoingFile, TransferEvent, TransferManager, TransferObserver};
pub use protocol::{Envelope, Hello, PROTOCOL_VERSION};
pub use ring::RingBuffer;
pub use storage::{FsStorage, Storage};
pub use transfer::{Role, TransferError, TransferProgress};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
