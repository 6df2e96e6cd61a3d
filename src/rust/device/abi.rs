// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fixed-layout control-call records.
//!
//! Records travel as native-endian byte strings with no padding between fields. Parsing fails with `EFAULT` when the
//! payload is shorter than the record, the analogue of a faulting copy from the caller's memory.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::{
        MAX_NB_BLOCK,
        NUM_PORTS,
    },
};
use ::static_assertions::const_assert_eq;
use ::std::mem;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Control-call type byte.
pub const IOCTL_TYPE: u8 = b'v';

/// Size of a [RegisterMap] record.
pub const REGISTER_MAP_SIZE: usize = 8 + 4 + 8 * MAX_NB_BLOCK;

/// Size of a [ThreadMap] record.
pub const THREAD_MAP_SIZE: usize = NUM_PORTS;

/// Size of a port list record, as returned by `GetPorts`.
pub const PORT_LIST_SIZE: usize = 16 + NUM_PORTS * PORT_RECORD_SIZE;

/// Size of one port entry of a port list record.
pub const PORT_RECORD_SIZE: usize = 4 + 4 + 8 + 6 + 16 * PIPE_RECORD_SIZE;

/// Size of one pipe entry of a port record.
pub const PIPE_RECORD_SIZE: usize = 4 + 6;

pub const IOCTL_GET_PORTS: u32 = iowr(1, PORT_LIST_SIZE);
pub const IOCTL_VECTOR_SYNC: u32 = iowr(2, mem::size_of::<VectorSyncRequest>());
pub const IOCTL_REGISTER_MAP: u32 = iowr(3, REGISTER_MAP_SIZE);
pub const IOCTL_THREAD_MAP: u32 = iowr(4, THREAD_MAP_SIZE);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Vector-sync operation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum SyncCode {
    /// Reserved.
    Allocate = 0,
    /// Reserved.
    Free = 1,
    Transmit = 2,
    Receive = 3,
    Inject = 4,
}

/// Vector-sync request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VectorSyncRequest {
    /// TX or RX vector length.
    pub size: u16,
    /// Operation code.
    pub code: u16,
    /// Dataplane worker issuing the call.
    pub worker: u8,
    pub port: u8,
    pub pipe: u8,
    /// Reserved.
    pub flow: u8,
    /// Entries of the allocation-request vector to take in.
    pub alloc_size: u16,
}

const_assert_eq!(mem::size_of::<VectorSyncRequest>(), 10);

/// User memory map registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterMap {
    /// Address of the memory in the dataplane's address space. Informational.
    pub virt: u64,
    /// Physical address of each hugepage, in block order.
    pub pages: Vec<u64>,
}

/// Port to worker cache mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadMap {
    pub thread: [u8; NUM_PORTS],
}

/// Reads fixed-width fields off the front of a byte string.
struct Reader<'a> {
    bytes: &'a [u8],
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Encodes a read-write control-call number for the device type.
pub const fn iowr(nr: u8, size: usize) -> u32 {
    const IOC_READ_WRITE: u32 = 3;
    (IOC_READ_WRITE << 30) | (((size as u32) & 0x3fff) << 16) | ((IOCTL_TYPE as u32) << 8) | nr as u32
}

fn short_payload(what: &str, len: usize, needed: usize) -> Fail {
    let cause: String = format!("{} payload too short (len={}, needed={})", what, len, needed);
    error!("parse(): {}", cause);
    Fail::new(libc::EFAULT, &cause)
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], needed: usize, what: &str) -> Result<Self, Fail> {
        if bytes.len() < needed {
            return Err(short_payload(what, bytes.len(), needed));
        }
        Ok(Self { bytes })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out: [u8; N] = [0; N];
        out.copy_from_slice(&self.bytes[..N]);
        self.bytes = &self.bytes[N..];
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.take())
    }
}

impl VectorSyncRequest {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Creates a request for `code`.
    pub fn new(code: SyncCode, worker: u8, port: u8, pipe: u8, size: u16) -> Self {
        Self {
            size,
            code: code as u16,
            worker,
            port,
            pipe,
            flow: u8::MAX,
            alloc_size: 0,
        }
    }

    pub fn with_alloc_size(mut self, alloc_size: u16) -> Self {
        self.alloc_size = alloc_size;
        self
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new(bytes, Self::SIZE, "vector sync")?;
        Ok(Self {
            size: r.u16(),
            code: r.u16(),
            worker: r.u8(),
            port: r.u8(),
            pipe: r.u8(),
            flow: r.u8(),
            alloc_size: r.u16(),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out: [u8; Self::SIZE] = [0; Self::SIZE];
        out[0..2].copy_from_slice(&self.size.to_ne_bytes());
        out[2..4].copy_from_slice(&self.code.to_ne_bytes());
        out[4] = self.worker;
        out[5] = self.port;
        out[6] = self.pipe;
        out[7] = self.flow;
        out[8..10].copy_from_slice(&self.alloc_size.to_ne_bytes());
        out
    }

    /// Decoded operation code. Unknown codes fail with `EINVAL`.
    pub fn sync_code(&self) -> Result<SyncCode, Fail> {
        SyncCode::try_from(self.code)
    }
}

impl RegisterMap {
    pub fn new(virt: u64, pages: Vec<u64>) -> Self {
        Self { virt, pages }
    }

    /// Parses a registration record. The page count must be below [MAX_NB_BLOCK].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new(bytes, REGISTER_MAP_SIZE, "register map")?;
        let virt: u64 = r.u64();
        let n_pages: usize = r.u32() as usize;
        if n_pages >= MAX_NB_BLOCK {
            let cause: String = format!("too many pages (n_pages={})", n_pages);
            error!("from_bytes(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let pages: Vec<u64> = (0..n_pages).map(|_| r.u64()).collect();
        Ok(Self { virt, pages })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(REGISTER_MAP_SIZE);
        out.extend_from_slice(&self.virt.to_ne_bytes());
        out.extend_from_slice(&(self.pages.len() as u32).to_ne_bytes());
        for pa in self.pages.iter().take(MAX_NB_BLOCK) {
            out.extend_from_slice(&pa.to_ne_bytes());
        }
        out.resize(REGISTER_MAP_SIZE, 0);
        out
    }
}

impl ThreadMap {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new(bytes, THREAD_MAP_SIZE, "thread map")?;
        Ok(Self { thread: r.take() })
    }

    pub fn to_bytes(&self) -> [u8; THREAD_MAP_SIZE] {
        self.thread
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl TryFrom<u16> for SyncCode {
    type Error = Fail;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(SyncCode::Allocate),
            1 => Ok(SyncCode::Free),
            2 => Ok(SyncCode::Transmit),
            3 => Ok(SyncCode::Receive),
            4 => Ok(SyncCode::Inject),
            _ => {
                let cause: String = format!("unknown vector sync code (code={})", code);
                error!("try_from(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
