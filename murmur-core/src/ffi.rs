//! C ABI for linking murmur-core as a static library from Android (NDK), iOS or other C/C++ hosts.
//! Strings cross the boundary as (pointer, byte length) UTF-8 pairs, never NUL-terminated.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;
use std::sync::Arc;

use crate::manager::{TransferEvent, TransferManager};
use crate::protocol::PROTOCOL_VERSION;
use crate::ring::RingBuffer;
use crate::storage::FsStorage;

pub const MURMUR_EVENT_PROGRESS: c_int = 0;
pub const MURMUR_EVENT_COMPLETED: c_int = 1;
pub const MURMUR_EVENT_FAILED: c_int = 2;

/// Transfer notification. `file_id` and `location` are only valid for the duration of the call;
/// `location` is null with length 0 when unknown.
pub type MurmurTransferCallback = extern "C" fn(
    user_data: *mut c_void,
    kind: c_int,
    file_id: *const u8,
    file_id_len: usize,
    processed: u64,
    total: u64,
    location: *const u8,
    location_len: usize,
);

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn murmur_core_version() -> u8 {
    PROTOCOL_VERSION
}

unsafe fn str_arg<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    std::str::from_utf8(slice::from_raw_parts(ptr, len)).ok()
}

/// Create a ring buffer of `capacity` bytes. Returns opaque handle, or null if capacity is 0.
#[no_mangle]
pub extern "C" fn murmur_core_ring_create(capacity: usize) -> *mut c_void {
    if capacity == 0 {
        return std::ptr::null_mut();
    }
    Box::into_raw(Box::new(RingBuffer::new(capacity))) as *mut c_void
}

/// Destroy ring buffer. No-op if h is null.
#[no_mangle]
pub extern "C" fn murmur_core_ring_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut RingBuffer) };
}

/// Write bytes, evicting the oldest on overflow. Returns 0, or -1 on null arguments.
#[no_mangle]
pub extern "C" fn murmur_core_ring_write(h: *mut c_void, bytes: *const u8, len: usize) -> c_int {
    if h.is_null() || (bytes.is_null() && len > 0) {
        return -1;
    }
    let ring = unsafe { &*(h as *const RingBuffer) };
    if len > 0 {
        ring.write(unsafe { slice::from_raw_parts(bytes, len) });
    }
    0
}

/// Read up to out_len bytes. Returns bytes read, or -1 on error.
#[no_mangle]
pub extern "C" fn murmur_core_ring_read(h: *mut c_void, out_buf: *mut u8, out_len: usize) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return -1;
    }
    let ring = unsafe { &*(h as *const RingBuffer) };
    let out = unsafe { slice::from_raw_parts_mut(out_buf, out_len.min(c_int::MAX as usize)) };
    ring.read_into(out) as c_int
}

/// Bytes currently buffered, or -1 if h is null.
#[no_mangle]
pub extern "C" fn murmur_core_ring_available(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let ring = unsafe { &*(h as *const RingBuffer) };
    ring.available().min(c_int::MAX as usize) as c_int
}

struct CallbackSink {
    callback: MurmurTransferCallback,
    user_data: *mut c_void,
}

// The host guarantees user_data may be used from any thread for the manager's lifetime.
unsafe impl Send for CallbackSink {}
unsafe impl Sync for CallbackSink {}

impl CallbackSink {
    fn deliver(&self, event: TransferEvent) {
        let kind = match &event {
            TransferEvent::Progress(_) => MURMUR_EVENT_PROGRESS,
            TransferEvent::Completed { .. } => MURMUR_EVENT_COMPLETED,
            TransferEvent::Failed { .. } => MURMUR_EVENT_FAILED,
        };
        let p = event.progress();
        let (loc_ptr, loc_len) = match &p.location {
            Some(l) => (l.as_ptr(), l.len()),
            None => (std::ptr::null(), 0),
        };
        (self.callback)(
            self.user_data,
            kind,
            p.file_id.as_ptr(),
            p.file_id.len(),
            p.processed_bytes,
            p.total_size,
            loc_ptr,
            loc_len,
        );
    }
}

/// Create a transfer manager writing downloads into `download_dir`. `callback` receives every
/// progress, completion and failure. Returns opaque handle or null on failure.
#[no_mangle]
pub extern "C" fn murmur_core_transfers_create(
    download_dir: *const u8,
    download_dir_len: usize,
    callback: Option<MurmurTransferCallback>,
    user_data: *mut c_void,
) -> *mut c_void {
    let Some(dir) = (unsafe { str_arg(download_dir, download_dir_len) }) else {
        return std::ptr::null_mut();
    };
    let Some(callback) = callback else {
        return std::ptr::null_mut();
    };
    let sink = CallbackSink {
        callback,
        user_data,
    };
    let manager = TransferManager::new(
        Arc::new(FsStorage::new(dir)),
        Arc::new(move |event: TransferEvent| sink.deliver(event)),
    );
    Box::into_raw(Box::new(manager)) as *mut c_void
}

/// Destroy transfer manager, aborting anything in flight. No-op if h is null.
#[no_mangle]
pub extern "C" fn murmur_core_transfers_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut TransferManager) };
}

/// Register a local file for sending. Writes the new file id (36 bytes) to out_file_id and the
/// size to out_size (if non-null). Returns the id length, or -1 on error.
#[no_mangle]
pub extern "C" fn murmur_core_transfers_begin_send(
    h: *mut c_void,
    path: *const u8,
    path_len: usize,
    peer: *const u8,
    peer_len: usize,
    chat_id: *const u8,
    chat_id_len: usize,
    out_file_id: *mut u8,
    out_file_id_len: usize,
    out_size: *mut u64,
) -> c_int {
    if h.is_null() || out_file_id.is_null() {
        return -1;
    }
    let manager = unsafe { &*(h as *const TransferManager) };
    let args = unsafe {
        (
            str_arg(path, path_len),
            str_arg(peer, peer_len),
            str_arg(chat_id, chat_id_len),
        )
    };
    let (Some(path), Some(peer), Some(chat_id)) = args else {
        return -1;
    };
    let file = match manager.begin_send(path, peer, chat_id) {
        Ok(f) => f,
        Err(_) => return -1,
    };
    if file.file_id.len() > out_file_id_len {
        manager.cancel(&file.file_id);
        return -1;
    }
    unsafe {
        out_file_id.copy_from_nonoverlapping(file.file_id.as_ptr(), file.file_id.len());
        if !out_size.is_null() {
            *out_size = file.total_size;
        }
    }
    file.file_id.len() as c_int
}

/// Fill out_buf with the next chunk (at most out_buf_len bytes). Returns bytes written,
/// 0 when the id is unknown or finished, -1 on error.
#[no_mangle]
pub extern "C" fn murmur_core_transfers_produce_chunk(
    h: *mut c_void,
    file_id: *const u8,
    file_id_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return -1;
    }
    let manager = unsafe { &*(h as *const TransferManager) };
    let Some(file_id) = (unsafe { str_arg(file_id, file_id_len) }) else {
        return -1;
    };
    let chunk = manager.produce_chunk(file_id, out_buf_len.min(c_int::MAX as usize));
    unsafe {
        out_buf.copy_from_nonoverlapping(chunk.as_ptr(), chunk.len());
    }
    chunk.len() as c_int
}

/// Register an announced inbound file. Returns 1 if already complete (empty file),
/// 0 if chunks should be requested, -1 on error (including a duplicate id).
#[no_mangle]
pub extern "C" fn murmur_core_transfers_begin_receive(
    h: *mut c_void,
    file_id: *const u8,
    file_id_len: usize,
    peer: *const u8,
    peer_len: usize,
    chat_id: *const u8,
    chat_id_len: usize,
    file_name: *const u8,
    file_name_len: usize,
    total_size: u64,
) -> c_int {
    if h.is_null() {
        return -1;
    }
    let manager = unsafe { &*(h as *const TransferManager) };
    let args = unsafe {
        (
            str_arg(file_id, file_id_len),
            str_arg(peer, peer_len),
            str_arg(chat_id, chat_id_len),
            str_arg(file_name, file_name_len),
        )
    };
    let (Some(file_id), Some(peer), Some(chat_id), Some(file_name)) = args else {
        return -1;
    };
    match manager.begin_receive(file_id, peer, chat_id, file_name, total_size) {
        Ok(p) if p.is_complete() => 1,
        Ok(_) => 0,
        Err(_) => -1,
    }
}

/// Append a received chunk. Returns 1 when no more chunks are wanted, 0 otherwise, -1 on error.
#[no_mangle]
pub extern "C" fn murmur_core_transfers_consume_chunk(
    h: *mut c_void,
    file_id: *const u8,
    file_id_len: usize,
    bytes: *const u8,
    len: usize,
) -> c_int {
    if h.is_null() || (bytes.is_null() && len > 0) {
        return -1;
    }
    let manager = unsafe { &*(h as *const TransferManager) };
    let Some(file_id) = (unsafe { str_arg(file_id, file_id_len) }) else {
        return -1;
    };
    let data: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(bytes, len) }
    };
    manager.consume_chunk(file_id, data) as c_int
}

/// Abort a transfer in either direction. Returns 1 if cancelled, 0 if unknown, -1 on error.
#[no_mangle]
pub extern "C" fn murmur_core_transfers_cancel(
    h: *mut c_void,
    file_id: *const u8,
    file_id_len: usize,
) -> c_int {
    if h.is_null() {
        return -1;
    }
    let manager = unsafe { &*(h as *const TransferManager) };
    match unsafe { str_arg(file_id, file_id_len) } {
        Some(file_id) => manager.cancel(file_id) as c_int,
        None => -1,
    }
}
