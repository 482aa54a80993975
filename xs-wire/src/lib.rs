//! XenStore wire ABI
//!
//! Layout of the per-domain shared ring page, the fixed message header with
//! its opcode numbering, and the wrap-aware copy helpers used by both sides
//! of a ring.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

use core::{cell::UnsafeCell, cmp, mem::size_of, ptr::copy_nonoverlapping, sync::atomic::AtomicU32};

/// Bytes in each direction of the shared ring
pub const RING_SIZE: usize = 1024;

/// Bytes in the fixed message header
pub const HEADER_SIZE: usize = 16;

/// Largest payload that fits a ring alongside its header
pub const PAYLOAD_MAX: usize = RING_SIZE - HEADER_SIZE;

/// Longest accepted absolute path, terminating nul included
pub const ABS_PATH_MAX: usize = 3072;

/// Worst-case length of `/local/domain/<domid>/` for a 16-bit domid, nul included
pub const MAX_LOCALPATH_LEN: usize = 21;

/// `connection` value for an established ring
pub const CONNECTED: u32 = 0;

/// `connection` value while the peer renegotiates the ring
pub const RECONNECT: u32 = 1;

/// `server_features` bit advertising reconnection support
pub const SERVER_FEATURE_RECONNECTION: u32 = 1;

/// Error strings a server may carry in an [`Kind::Error`] reply payload
pub const XSD_ERRORS: &[&str] = &[
    "EINVAL", "EACCES", "EEXIST", "EISDIR", "ENOENT", "ENOMEM", "ENOSPC", "EIO", "ENOTEMPTY",
    "ENOSYS", "EROFS", "EBUSY", "EAGAIN", "EISCONN", "E2BIG",
];

/// Mask a free-running ring index to its byte position
pub fn mask_ring_idx(idx: u32) -> u32 {
    idx & (RING_SIZE as u32 - 1)
}

/// Per-domain shared ring page
///
/// Indices are free-running modulo 2^32. The producer publishes bytes with a
/// release store of its index; the consumer acquires the index before copying
/// bytes out, which is the only ordering the byte regions rely on.
#[repr(C)]
pub struct Interface {
    /// Request bytes, peer to server
    pub req: [UnsafeCell<u8>; RING_SIZE],
    /// Reply bytes, server to peer
    pub rsp: [UnsafeCell<u8>; RING_SIZE],
    /// Request consumer index
    pub req_cons: AtomicU32,
    /// Request producer index
    pub req_prod: AtomicU32,
    /// Reply consumer index
    pub rsp_cons: AtomicU32,
    /// Reply producer index
    pub rsp_prod: AtomicU32,
    /// Server feature bits
    pub server_features: AtomicU32,
    /// Connection status word
    pub connection: AtomicU32,
}

// The byte regions are only touched through the index protocol above.
unsafe impl Sync for Interface {}

const _: () = assert!(size_of::<Interface>() == 2 * RING_SIZE + 6 * size_of::<u32>());

impl Interface {
    /// A fresh page with both directions empty and status cleared
    pub fn new() -> Self {
        // All-zero is the valid initial state of every field.
        unsafe { core::mem::zeroed() }
    }
}

impl Default for Interface {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy `length` bytes out of `ring` starting at the masked byte position
/// `offset`, wrapping past the end of the ring.
///
/// # Safety
///
/// The caller must be the sole consumer of `ring` and must have acquired the
/// producer index covering `offset..offset + length`.
pub unsafe fn copy_from_ring(
    ring: &[UnsafeCell<u8>; RING_SIZE],
    destination: &mut [u8],
    offset: usize,
    length: usize,
) {
    let c1 = cmp::min(length, RING_SIZE - offset);
    let c2 = length - c1;
    copy_nonoverlapping(
        UnsafeCell::raw_get(ring.as_ptr().add(offset)) as *const u8,
        destination.as_mut_ptr(),
        c1,
    );
    copy_nonoverlapping(
        UnsafeCell::raw_get(ring.as_ptr()) as *const u8,
        destination.as_mut_ptr().add(c1),
        c2,
    );
}

/// Copy `length` bytes of `source` into `ring` starting at the masked byte
/// position `offset`, wrapping past the end of the ring.
///
/// # Safety
///
/// The caller must be the sole producer of `ring` and `offset..offset +
/// length` must lie within the free region the consumer index grants it.
pub unsafe fn copy_to_ring(
    ring: &[UnsafeCell<u8>; RING_SIZE],
    source: &[u8],
    offset: usize,
    length: usize,
) {
    let c1 = cmp::min(length, RING_SIZE - offset);
    let c2 = length - c1;
    copy_nonoverlapping(source.as_ptr(), UnsafeCell::raw_get(ring.as_ptr().add(offset)), c1);
    copy_nonoverlapping(source.as_ptr().add(c1), UnsafeCell::raw_get(ring.as_ptr()), c2);
}

/// Fixed message header carried before every payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Message type, numbered per [`Kind`]
    pub kind: u32,
    /// Request id, echoed verbatim in the reply
    pub req_id: u32,
    /// Transaction id, zero outside a transaction
    pub tx_id: u32,
    /// Payload byte count
    pub len: u32,
}

impl Header {
    /// Little-endian wire encoding
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.kind.to_le_bytes());
        raw[4..8].copy_from_slice(&self.req_id.to_le_bytes());
        raw[8..12].copy_from_slice(&self.tx_id.to_le_bytes());
        raw[12..16].copy_from_slice(&self.len.to_le_bytes());
        raw
    }

    /// Decode from the little-endian wire form
    pub fn from_bytes(raw: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            kind: word(0),
            req_id: word(4),
            tx_id: word(8),
            len: word(12),
        }
    }
}

/// XenStore message type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Kind {
    Control = 0,
    Directory = 1,
    Read = 2,
    GetPerms = 3,
    Watch = 4,
    Unwatch = 5,
    TransactionStart = 6,
    TransactionEnd = 7,
    Introduce = 8,
    Release = 9,
    GetDomainPath = 10,
    Write = 11,
    MakeDirectory = 12,
    Remove = 13,
    SetPerms = 14,
    WatchEvent = 15,
    Error = 16,
    IsDomainIntroduced = 17,
    Resume = 18,
    SetTarget = 19,
    // 20 is the retired RESTRICT slot
    ResetWatches = 21,
    DirectoryPart = 22,
    /// Number of valid types
    TypeCount = 23,
    /// Guaranteed to remain an invalid type
    Invalid = 0xffff,
}

impl From<u32> for Kind {
    fn from(value: u32) -> Self {
        match value {
            0 => Kind::Control,
            1 => Kind::Directory,
            2 => Kind::Read,
            3 => Kind::GetPerms,
            4 => Kind::Watch,
            5 => Kind::Unwatch,
            6 => Kind::TransactionStart,
            7 => Kind::TransactionEnd,
            8 => Kind::Introduce,
            9 => Kind::Release,
            10 => Kind::GetDomainPath,
            11 => Kind::Write,
            12 => Kind::MakeDirectory,
            13 => Kind::Remove,
            14 => Kind::SetPerms,
            15 => Kind::WatchEvent,
            16 => Kind::Error,
            17 => Kind::IsDomainIntroduced,
            18 => Kind::Resume,
            19 => Kind::SetTarget,
            21 => Kind::ResetWatches,
            22 => Kind::DirectoryPart,
            23 => Kind::TypeCount,
            _ => Kind::Invalid,
        }
    }
}

impl From<Kind> for u32 {
    fn from(kind: Kind) -> Self {
        kind as u32
    }
}
