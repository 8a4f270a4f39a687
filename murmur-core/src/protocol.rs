//! Murmur wire protocol: envelope types and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Exchanged in the hello before any envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// First frame on every connection: who is on the other end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub node_name: String,
}

impl Hello {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            node_name: node_name.into(),
        }
    }
}

/// All envelope types exchanged between nodes. Encoding is bincode; framing is length-prefix
/// (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Chat text. Passed to the chat layer untouched.
    Text {
        id: String,
        chat_id: String,
        /// Milliseconds since the Unix epoch, sender clock.
        timestamp: u64,
        text: String,
    },
    /// Shared location. Passed to the chat layer untouched.
    Location {
        id: String,
        chat_id: String,
        timestamp: u64,
        latitude: f64,
        longitude: f64,
    },
    /// Sender announces a file; the receiver answers with the first chunk request.
    FileStart {
        file_id: String,
        chat_id: String,
        file_name: String,
        file_size: u64,
    },
    /// Receiver pulls the next chunk of at most `max_size` bytes. Zero means the receiver gave
    /// up on the file and the sender should close it.
    ChunkRequest { file_id: String, max_size: u32 },
    /// Sender's answer to a chunk request. Empty data means nothing more will come.
    FileChunk { file_id: String, data: Vec<u8> },
    CallInvoke { call_id: String },
    CallAnswer { call_id: String },
    /// Decline, busy or hang-up.
    CallReject { call_id: String },
    CallAudio { call_id: String, data: Vec<u8> },
}

impl Envelope {
    /// Short type name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Text { .. } => "text",
            Envelope::Location { .. } => "location",
            Envelope::FileStart { .. } => "file_start",
            Envelope::ChunkRequest { .. } => "chunk_request",
            Envelope::FileChunk { .. } => "file_chunk",
            Envelope::CallInvoke { .. } => "call_invoke",
            Envelope::CallAnswer { .. } => "call_answer",
            Envelope::CallReject { .. } => "call_reject",
            Envelope::CallAudio { .. } => "call_audio",
        }
    }
}
