// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::common::{
    inject,
    nth_buffer,
    post_alloc,
    post_tx,
    receive,
    segment,
    Test,
    ENABLED_PIPES,
    PORT,
    WORKER,
};
use ::anyhow::Result;
use ::meshbuf::{
    device::{
        abi::{
            IOCTL_GET_PORTS,
            IOCTL_REGISTER_MAP,
            IOCTL_THREAD_MAP,
            PORT_LIST_SIZE,
        },
        ports::PipeInfo,
    },
    ensure_eq,
    memory::{
        DescriptorCache,
        WorkerSlot,
        REGION_SIZE,
    },
    runtime::limits::NUM_WORKERS,
    Command,
    Config,
    DeviceConfig,
    FragmentDescriptor,
    LockPolicy,
    PortList,
    RegisterMap,
    Session,
    SharedRegion,
    ThreadMap,
};
use ::std::sync::atomic::Ordering;

//======================================================================================================================
// Helper Functions
//======================================================================================================================

/// Checks that every vector and counter of every worker slot reads as zero.
fn ensure_region_zeroed(region: &SharedRegion) -> Result<()> {
    for worker in 0..NUM_WORKERS {
        let mut slot: WorkerSlot = region.claim(worker)?;
        ensure_eq!(slot.cache_level(), 0);
        ensure_eq!(slot.release_count(), 0);
        for port in 0..4 {
            anyhow::ensure!(slot.rx(port)?.iter().all(|d| d.is_zero()));
            anyhow::ensure!(slot.tx(port)?.iter().all(|d| d.is_zero()));
            anyhow::ensure!(slot.alloc(port)?.iter().all(|i| *i == 0));
            anyhow::ensure!(slot.release(port)?.iter().all(|i| *i == 0));
        }
    }
    for port in 0..4 {
        anyhow::ensure!(region.tx_avail(port)?.iter().all(|a| a.load(Ordering::Relaxed) == 0));
    }
    Ok(())
}

//======================================================================================================================
// Disconnect
//======================================================================================================================

/// Tests that closing the session discards every dataplane buffer held by the device.
#[test]
fn disconnect_reclaims_everything() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    ensure_eq!(session.ioctl(Command::RegisterMap(&test.register_map())), 0);
    let region: &SharedRegion = session.map_region(REGION_SIZE)?;

    // Fill the cache, drain it past empty, and leave some state in every vector.
    let indices: Vec<u32> = (0..100).map(nth_buffer).collect();
    post_alloc(region, WORKER, PORT, &indices)?;
    test.driver.tx_avail.store(7, Ordering::Relaxed);
    session.vector_sync(&receive(0, 100))?;
    let mut taken: Vec<FragmentDescriptor> = Vec::new();
    while let Some(desc) = test.device.alloc_descriptor(PORT as usize) {
        taken.push(desc);
    }
    ensure_eq!(taken.len(), 100);
    for desc in taken.drain(..50) {
        test.device.free_descriptor(desc, PORT as usize);
    }
    post_tx(region, 0, 3, &[segment(1, 0, 64, true)])?;

    let cache: &DescriptorCache = match test.device.cache(WORKER as usize) {
        Some(cache) => cache,
        None => anyhow::bail!("worker cache should exist"),
    };
    ensure_eq!(cache.size(), 50);
    ensure_eq!(cache.alloc_failures(), 1);
    anyhow::ensure!(test.device.is_mapped());

    drop(session);

    ensure_eq!(test.driver.cancel_dma_calls.load(Ordering::Relaxed), 1);
    anyhow::ensure!(!test.device.is_mapped());
    for worker in 0..NUM_WORKERS {
        let cache: &DescriptorCache = match test.device.cache(worker) {
            Some(cache) => cache,
            None => anyhow::bail!("worker cache should exist"),
        };
        ensure_eq!(cache.size(), 0);
        ensure_eq!(cache.alloc_failures(), 0);
        ensure_eq!(cache.overflow_drops(), 0);
        ensure_eq!(cache.cursors(), (0, 0));
        ensure_eq!(cache.nonzero_slots(), 0);
    }
    ensure_region_zeroed(region)?;
    anyhow::ensure!(test.device.poll_events().exiting);

    // Buffers in flight in the driver are forgotten once the map is gone.
    for desc in taken.drain(..) {
        test.device.free_descriptor(desc, PORT as usize);
    }
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(0));

    // Blocks survive the disconnect until explicitly forgotten.
    ensure_eq!(test.device.block_count(), common::NB_BLOCKS);
    test.device.forget_blocks();
    ensure_eq!(test.device.block_count(), 0);
    Ok(())
}

/// Tests that a new dataplane can attach after the previous one went away.
#[test]
fn reopen_after_release() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let first: Session = test.device.open()?;
    match test.device.open() {
        Err(e) => ensure_eq!(e.errno, libc::EAGAIN),
        Ok(_) => anyhow::bail!("second dataplane should be rejected"),
    }
    drop(first);

    let second: Session = test.device.open()?;
    anyhow::ensure!(!second.poll_events().exiting);
    ensure_eq!(second.ioctl(Command::RegisterMap(&test.register_map())), 0);
    anyhow::ensure!(test.device.is_mapped());
    Ok(())
}

/// Tests that buffers are refused between a disconnect and the next memory map registration.
#[test]
fn buffers_need_a_current_user_map() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let first: Session = test.device.open()?;
    ensure_eq!(first.ioctl(Command::RegisterMap(&test.register_map())), 0);
    drop(first);

    let session: Session = test.device.open()?;
    let region: &SharedRegion = session.map_region(REGION_SIZE)?;
    anyhow::ensure!(!test.device.is_mapped());
    ensure_eq!(test.device.block_count(), common::NB_BLOCKS);

    post_alloc(region, WORKER, PORT, &[nth_buffer(3)])?;
    match session.vector_sync(&receive(0, 1)) {
        Err(e) => ensure_eq!(e.errno, libc::EFAULT),
        Ok(n) => anyhow::bail!("stale blocks should not be used, returned {}", n),
    }
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(0));

    let desc: FragmentDescriptor = segment(3, 0, 4, true);
    post_tx(region, WORKER, PORT, &[desc])?;
    match session.vector_sync(&inject(1)) {
        Err(e) => ensure_eq!(e.errno, libc::EFAULT),
        Ok(n) => anyhow::bail!("injection from stale blocks returned {}", n),
    }
    anyhow::ensure!(test.driver.injected.lock().is_empty());
    anyhow::ensure!(test.device.descriptor_address(&desc).is_err());
    let mut out: [u8; 4] = [0; 4];
    anyhow::ensure!(test.device.copy_payload(&desc, &mut out).is_err());
    anyhow::ensure!(test.device.fill_payload(&desc, b"late").is_err());

    // Polling without buffers still works, and a new registration brings buffers back.
    ensure_eq!(session.vector_sync(&receive(0, 0))?, 0);
    ensure_eq!(session.ioctl(Command::RegisterMap(&test.register_map())), 0);
    ensure_eq!(session.vector_sync(&receive(0, 1))?, 0);
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(1));
    Ok(())
}

//======================================================================================================================
// Control Calls
//======================================================================================================================

/// Tests registration of the user memory map through its binary record.
#[test]
fn register_map_through_raw_control_call() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;

    let mut record: Vec<u8> = test.register_map().to_bytes();
    ensure_eq!(session.ioctl_raw(IOCTL_REGISTER_MAP, &mut record), 0);
    ensure_eq!(test.device.block_count(), common::NB_BLOCKS);

    // A later registration replaces the earlier one.
    let pages: Vec<u64> = test.arena.physical_addresses()[..2].to_vec();
    let mut record: Vec<u8> = RegisterMap::new(test.arena.virtual_base(), pages).to_bytes();
    ensure_eq!(session.ioctl_raw(IOCTL_REGISTER_MAP, &mut record), 0);
    ensure_eq!(test.device.block_count(), 2);

    // Truncated records and unknown pages are refused.
    ensure_eq!(
        session.ioctl_raw(IOCTL_REGISTER_MAP, &mut record[..16]),
        -(libc::EFAULT as i64)
    );
    let mut record: Vec<u8> = RegisterMap::new(0, vec![0x1000]).to_bytes();
    ensure_eq!(session.ioctl_raw(IOCTL_REGISTER_MAP, &mut record), -(libc::EFAULT as i64));
    ensure_eq!(test.device.block_count(), 2);
    Ok(())
}

/// Tests that the port list record reflects driver reports.
#[test]
fn get_ports_through_raw_control_call() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;

    let mut record: Vec<u8> = vec![0; PORT_LIST_SIZE];
    ensure_eq!(session.ioctl_raw(IOCTL_GET_PORTS, &mut record), 0);
    for pipe in 0..ENABLED_PIPES {
        let info: PipeInfo = PortList::pipe_from_bytes(&record, PORT as usize, pipe)?;
        anyhow::ensure!(info.enable);
        ensure_eq!(info.mac.to_array(), [0x02, 0x00, 0x00, 0x00, 0x01, pipe as u8]);
    }
    let info: PipeInfo = PortList::pipe_from_bytes(&record, PORT as usize, ENABLED_PIPES)?;
    anyhow::ensure!(!info.enable);

    let mut list: PortList = PortList::default();
    ensure_eq!(session.ioctl(Command::GetPorts(&mut list)), 0);
    ensure_eq!(list.to_bytes(), record);
    anyhow::ensure!(list.ports[PORT as usize].enable);
    anyhow::ensure!(!list.ports[1].enable);
    Ok(())
}

/// Tests that the thread map redirects a port to another worker cache.
#[test]
fn thread_map_redirects_port_cache() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    ensure_eq!(session.ioctl(Command::RegisterMap(&test.register_map())), 0);
    let region: &SharedRegion = session.map_region(REGION_SIZE)?;

    let mut record: [u8; 4] = ThreadMap { thread: [0, 1, 2, 3] }.to_bytes();
    ensure_eq!(session.ioctl_raw(IOCTL_THREAD_MAP, &mut record), 0);
    ensure_eq!(test.device.ports().thread_map(), [0, 1, 2, 3]);

    // Port 0 is now served by cache 0, whatever worker issues the call.
    post_alloc(region, WORKER, PORT, &[nth_buffer(1), nth_buffer(2)])?;
    session.vector_sync(&receive(0, 2))?;
    ensure_eq!(test.device.cache(0).map(|c| c.size()), Some(2));
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(0));

    ensure_eq!(
        session.ioctl(Command::ThreadMap(ThreadMap { thread: [0, 1, 2, 4] })),
        -(libc::EINVAL as i64)
    );
    ensure_eq!(test.device.ports().thread_map(), [0, 1, 2, 3]);
    Ok(())
}

//======================================================================================================================
// Configuration
//======================================================================================================================

/// Tests that a device can be built from a configuration file.
#[test]
fn device_from_yaml_configuration() -> Result<()> {
    let yaml: &str = "
meshbuf:
  lock_policy: \"poll\"
  cache_capacity: 4096
  high_watermark: 2048
  release_batch: 64
";
    let config: DeviceConfig = DeviceConfig::try_from(&Config::from_yaml_str(yaml)?)?;
    ensure_eq!(config.lock_policy, LockPolicy::PollOnly);
    ensure_eq!(config.cache_capacity, 4096);
    ensure_eq!(config.release_batch, 64);

    let test: Test = Test::new(config)?;
    ensure_eq!(test.device.cache(0).map(|c| c.capacity()), Some(4096));
    anyhow::ensure!(!test.device.cache(0).map_or(true, |c| c.is_locked()));

    let bad: DeviceConfig = DeviceConfig {
        cache_capacity: 3000,
        ..DeviceConfig::default()
    };
    match Test::new(bad) {
        Err(_) => Ok(()),
        Ok(_) => anyhow::bail!("capacity must be a power of two"),
    }
}
