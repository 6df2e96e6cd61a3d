// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::limits::{
    NUM_PORTS,
    PIPES_PER_PORT,
};
use ::std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-pipe counters.
#[derive(Default)]
pub struct PipeStats {
    /// Descriptors the driver did not accept on TRANSMIT.
    pub drops_from_dataplane: AtomicU64,
    /// Descriptors transmitted on behalf of the dataplane.
    pub pkts_from_dataplane: AtomicU64,
    /// Injected packets with a multicast destination.
    pub inject_mcast: AtomicU64,
    /// Packets handed to the injection callback.
    pub inject_pkts: AtomicU64,
    /// Packets dropped while being assembled for injection.
    pub inject_drops: AtomicU64,
}

/// Per-port counters.
#[derive(Default)]
pub struct PortStats {
    /// Descriptors sent to a disabled pipe.
    pub tx_black_hole: AtomicU64,
    /// Descriptors freed by the driver into a cache.
    pub driver_free: AtomicU64,
    /// Descriptors handed back to the dataplane by watermark release.
    pub free_to_dataplane: AtomicU64,
    pub vector_sync_tx: AtomicU64,
    pub vector_sync_rx: AtomicU64,
    /// Descriptors received from the driver.
    pub pkts_from_driver: AtomicU64,
    pub pipes: [PipeStats; PIPES_PER_PORT],
}

/// Device counters.
#[derive(Default)]
pub struct DeviceStats {
    pub ports: [PortStats; NUM_PORTS],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeStatsSnapshot {
    pub drops_from_dataplane: u64,
    pub pkts_from_dataplane: u64,
    pub inject_mcast: u64,
    pub inject_pkts: u64,
    pub inject_drops: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub tx_black_hole: u64,
    pub driver_free: u64,
    pub free_to_dataplane: u64,
    pub vector_sync_tx: u64,
    pub vector_sync_rx: u64,
    pub pkts_from_driver: u64,
    pub pipes: [PipeStatsSnapshot; PIPES_PER_PORT],
}

/// Point-in-time copy of every counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ports: [PortStatsSnapshot; NUM_PORTS],
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Bumps a counter by `n`.
#[inline]
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of `port`. Out-of-range ports wrap; callers validate ports before counting.
    pub fn port(&self, port: usize) -> &PortStats {
        &self.ports[port % NUM_PORTS]
    }

    /// Counters of `pipe` on `port`.
    pub fn pipe(&self, port: usize, pipe: usize) -> &PipeStats {
        &self.port(port).pipes[pipe % PIPES_PER_PORT]
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot: StatsSnapshot = StatsSnapshot::default();
        for (out, port) in snapshot.ports.iter_mut().zip(self.ports.iter()) {
            *out = port.snapshot();
        }
        snapshot
    }
}

impl PortStats {
    fn snapshot(&self) -> PortStatsSnapshot {
        let mut pipes: [PipeStatsSnapshot; PIPES_PER_PORT] = [PipeStatsSnapshot::default(); PIPES_PER_PORT];
        for (out, pipe) in pipes.iter_mut().zip(self.pipes.iter()) {
            *out = PipeStatsSnapshot {
                drops_from_dataplane: read(&pipe.drops_from_dataplane),
                pkts_from_dataplane: read(&pipe.pkts_from_dataplane),
                inject_mcast: read(&pipe.inject_mcast),
                inject_pkts: read(&pipe.inject_pkts),
                inject_drops: read(&pipe.inject_drops),
            };
        }
        PortStatsSnapshot {
            tx_black_hole: read(&self.tx_black_hole),
            driver_free: read(&self.driver_free),
            free_to_dataplane: read(&self.free_to_dataplane),
            vector_sync_tx: read(&self.vector_sync_tx),
            vector_sync_rx: read(&self.vector_sync_rx),
            pkts_from_driver: read(&self.pkts_from_driver),
            pipes,
        }
    }
}

impl PipeStatsSnapshot {
    fn counters(&self) -> [(&'static str, u64); 5] {
        [
            ("drops_from_dataplane", self.drops_from_dataplane),
            ("pkts_from_dataplane", self.pkts_from_dataplane),
            ("inject_mcast", self.inject_mcast),
            ("inject_pkts", self.inject_pkts),
            ("inject_drops", self.inject_drops),
        ]
    }
}

impl PortStatsSnapshot {
    fn counters(&self) -> [(&'static str, u64); 6] {
        [
            ("tx_black_hole", self.tx_black_hole),
            ("driver_free", self.driver_free),
            ("free_to_dataplane", self.free_to_dataplane),
            ("vector_sync_tx", self.vector_sync_tx),
            ("vector_sync_rx", self.vector_sync_rx),
            ("pkts_from_driver", self.pkts_from_driver),
        ]
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Renders the non-zero counters, one port or pipe per line.
impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (p, port) in self.ports.iter().enumerate() {
            if port.counters().iter().any(|(_, v)| *v != 0) {
                write!(f, "port {}:", p)?;
                for (name, value) in port.counters().iter().filter(|(_, v)| *v != 0) {
                    write!(f, " {} {}", name, value)?;
                }
                writeln!(f)?;
            }
            for (q, pipe) in port.pipes.iter().enumerate() {
                if pipe.counters().iter().all(|(_, v)| *v == 0) {
                    continue;
                }
                write!(f, "port {} pipe {}:", p, q)?;
                for (name, value) in pipe.counters().iter().filter(|(_, v)| *v != 0) {
                    write!(f, " {} {}", name, value)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
