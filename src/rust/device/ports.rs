// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    device::abi::{
        PIPE_RECORD_SIZE,
        PORT_LIST_SIZE,
        PORT_RECORD_SIZE,
    },
    runtime::{
        fail::Fail,
        limits::{
            BUF_SIZE,
            DEFAULT_THREAD_MAP,
            NB_BUFFERS,
            NUM_PORTS,
            NUM_WORKERS,
            PIPES_PER_PORT,
        },
    },
};
use ::arc_swap::{
    ArcSwapOption,
    Guard,
};
use ::std::{
    any::Any,
    fmt,
    str::FromStr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU8,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Opaque driver state attached to a port.
pub type PortContext = Arc<dyn Any + Send + Sync>;

/// MAC Address
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress(eui48::MacAddress);

/// Administrative state of one pipe, as reported to the dataplane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeInfo {
    pub enable: bool,
    /// Peer MAC address.
    pub mac: MacAddress,
}

/// Administrative state of one port, as reported to the dataplane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub enable: bool,
    /// Interface MAC address.
    pub mac: MacAddress,
    pub pipes: [PipeInfo; PIPES_PER_PORT],
}

/// Snapshot of every port, returned by the `GetPorts` command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortList {
    pub nb_ports: u32,
    pub pipes_per_port: u32,
    /// Size of the buffer pool memory.
    pub mem_size: u32,
    /// Network buffer size.
    pub buf_size: u32,
    pub ports: [PortInfo; NUM_PORTS],
}

/// Port and pipe state shared by the control plane and the poll path.
///
/// The control plane writes under `records`. The poll path reads only the enable flags, the contexts, and the thread
/// map, none of which take that lock.
pub struct PortTable {
    port_enabled: [AtomicBool; NUM_PORTS],
    pipe_enabled: [[AtomicBool; PIPES_PER_PORT]; NUM_PORTS],
    contexts: [ArcSwapOption<PortContext>; NUM_PORTS],
    thread_map: [AtomicU8; NUM_PORTS],
    records: spin::Mutex<[PortInfo; NUM_PORTS]>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(eui48::MacAddress::new(bytes))
    }

    /// Reads a MAC address off the first six bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fail> {
        match eui48::MacAddress::from_bytes(bytes.get(..6).unwrap_or(bytes)) {
            Ok(addr) => Ok(Self(addr)),
            Err(_) => Err(Fail::new(libc::EINVAL, "too few bytes for a MAC address")),
        }
    }

    pub fn nil() -> MacAddress {
        MacAddress(eui48::MacAddress::nil())
    }

    pub fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    pub fn is_multicast(self) -> bool {
        self.0.is_multicast()
    }

    pub fn to_canonical(self) -> String {
        self.0.to_canonical()
    }

    /// Converts to a byte array.
    pub fn to_array(self) -> [u8; 6] {
        self.0.to_array()
    }
}

impl PortList {
    /// Serializes the list into its wire record. Driver contexts are never exposed and read as zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(PORT_LIST_SIZE);
        out.extend_from_slice(&self.nb_ports.to_ne_bytes());
        out.extend_from_slice(&self.pipes_per_port.to_ne_bytes());
        out.extend_from_slice(&self.mem_size.to_ne_bytes());
        out.extend_from_slice(&self.buf_size.to_ne_bytes());
        for port in self.ports.iter() {
            let start: usize = out.len();
            out.extend_from_slice(&(port.enable as u32).to_ne_bytes());
            // PCI slot, unused.
            out.extend_from_slice(&0u32.to_ne_bytes());
            out.extend_from_slice(&0u64.to_ne_bytes());
            out.extend_from_slice(&port.mac.to_array());
            for pipe in port.pipes.iter() {
                out.extend_from_slice(&(pipe.enable as u32).to_ne_bytes());
                out.extend_from_slice(&pipe.mac.to_array());
            }
            debug_assert_eq!(out.len() - start, PORT_RECORD_SIZE);
        }
        debug_assert_eq!(out.len(), PORT_LIST_SIZE);
        out
    }

    /// Reads the enable flag and MAC address of a pipe back from a wire record.
    pub fn pipe_from_bytes(bytes: &[u8], port: usize, pipe: usize) -> Result<PipeInfo, Fail> {
        let offset: usize = 16 + port * PORT_RECORD_SIZE + 22 + pipe * PIPE_RECORD_SIZE;
        match bytes.get(offset..offset + PIPE_RECORD_SIZE) {
            Some(record) if port < NUM_PORTS && pipe < PIPES_PER_PORT => Ok(PipeInfo {
                enable: u32::from_ne_bytes([record[0], record[1], record[2], record[3]]) != 0,
                mac: MacAddress::from_bytes(&record[4..])?,
            }),
            _ => Err(Fail::new(libc::EINVAL, "pipe outside of port list record")),
        }
    }
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            port_enabled: Default::default(),
            pipe_enabled: Default::default(),
            contexts: Default::default(),
            thread_map: DEFAULT_THREAD_MAP.map(AtomicU8::new),
            records: spin::Mutex::new([PortInfo::default(); NUM_PORTS]),
        }
    }

    /// Enables or disables a port. Enabling binds `context` and `mac` and resets every pipe of the port to disabled;
    /// disabling wipes the port.
    pub fn port_state(&self, context: PortContext, port: usize, mac: MacAddress, enable: bool) -> Result<(), Fail> {
        info!(
            "port_state(): port={} mac={} {}",
            port,
            mac,
            if enable { "enabled" } else { "disabled" }
        );
        check_port(port)?;

        let mut records = self.records.lock();
        // The poll path must not see the new context paired with stale pipe state.
        self.port_enabled[port].store(false, Ordering::Release);
        for pipe in self.pipe_enabled[port].iter() {
            pipe.store(false, Ordering::Release);
        }
        if enable {
            self.contexts[port].store(Some(Arc::new(context)));
            records[port] = PortInfo {
                enable: true,
                mac,
                pipes: [PipeInfo::default(); PIPES_PER_PORT],
            };
            self.port_enabled[port].store(true, Ordering::Release);
        } else {
            self.contexts[port].store(None);
            records[port] = PortInfo::default();
        }
        Ok(())
    }

    /// Enables or disables a pipe of an enabled port. Has no effect on a disabled port.
    pub fn pipe_state(&self, port: usize, pipe: usize, mac: Option<MacAddress>, enable: bool) -> Result<(), Fail> {
        info!(
            "pipe_state(): port={} pipe={} mac={} {}",
            port,
            pipe,
            mac.unwrap_or_default(),
            if enable { "enabled" } else { "disabled" }
        );
        check_port(port)?;
        check_pipe(pipe)?;

        let mut records = self.records.lock();
        if records[port].enable {
            records[port].pipes[pipe] = PipeInfo {
                enable,
                mac: match (enable, mac) {
                    (true, Some(mac)) => mac,
                    _ => MacAddress::nil(),
                },
            };
            self.pipe_enabled[port][pipe].store(enable, Ordering::Release);
        }
        Ok(())
    }

    pub fn is_port_enabled(&self, port: usize) -> bool {
        port < NUM_PORTS && self.port_enabled[port].load(Ordering::Acquire)
    }

    pub fn is_pipe_enabled(&self, port: usize, pipe: usize) -> bool {
        port < NUM_PORTS && pipe < PIPES_PER_PORT && self.pipe_enabled[port][pipe].load(Ordering::Acquire)
    }

    /// Runs `f` on the driver context of a port, without taking the control-plane lock. Returns `None` if no context
    /// is bound.
    pub fn with_context<R>(&self, port: usize, f: impl FnOnce(&PortContext) -> R) -> Option<R> {
        let guard: Guard<Option<Arc<PortContext>>> = self.contexts.get(port)?.load();
        Option::as_ref(&guard).map(|context| f(&**context))
    }

    /// Worker whose descriptor cache serves `port`.
    pub fn worker_for(&self, port: usize) -> usize {
        self.thread_map[port % NUM_PORTS].load(Ordering::Relaxed) as usize
    }

    /// Replaces the port to worker mapping.
    pub fn set_thread_map(&self, map: [u8; NUM_PORTS]) -> Result<(), Fail> {
        if let Some(worker) = map.iter().find(|w| (**w as usize) >= NUM_WORKERS) {
            let cause: String = format!("thread map refers to an unknown worker (worker={})", worker);
            error!("set_thread_map(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        for (slot, worker) in self.thread_map.iter().zip(map) {
            slot.store(worker, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn thread_map(&self) -> [u8; NUM_PORTS] {
        let mut map: [u8; NUM_PORTS] = [0; NUM_PORTS];
        for (out, slot) in map.iter_mut().zip(self.thread_map.iter()) {
            *out = slot.load(Ordering::Relaxed);
        }
        map
    }

    /// Snapshot of every port.
    pub fn snapshot(&self) -> PortList {
        PortList {
            nb_ports: NUM_PORTS as u32,
            pipes_per_port: PIPES_PER_PORT as u32,
            mem_size: (BUF_SIZE * NB_BUFFERS) as u32,
            buf_size: BUF_SIZE as u32,
            ports: *self.records.lock(),
        }
    }
}

fn check_port(port: usize) -> Result<(), Fail> {
    if port >= NUM_PORTS {
        let cause: String = format!("invalid port (port={})", port);
        error!("check_port(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    Ok(())
}

fn check_pipe(pipe: usize) -> Result<(), Fail> {
    if pipe >= PIPES_PER_PORT {
        let cause: String = format!("invalid pipe (pipe={})", pipe);
        error!("check_pipe(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    Ok(())
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for MacAddress {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddress({})", &self.to_canonical())
    }
}

impl FromStr for MacAddress {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match eui48::MacAddress::parse_str(s) {
            Ok(addr) => Ok(Self(addr)),
            Err(_) => Err(Fail::new(libc::EINVAL, "failed to parse MAC Address")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
