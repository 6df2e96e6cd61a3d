// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::common::{
    nth_buffer,
    post_alloc,
    post_tx,
    read_release,
    read_rx,
    receive,
    segment,
    transmit,
    Test,
    PORT,
    WORKER,
};
use ::anyhow::Result;
use ::meshbuf::{
    device::abi::IOCTL_VECTOR_SYNC,
    ensure_eq,
    memory::{
        buffer_index,
        WorkerSlot,
        REGION_SIZE,
    },
    runtime::limits::{
        ALLOC_VLEN,
        NUM_PORTS,
        RXTX_VLEN,
    },
    Command,
    DeviceConfig,
    Fail,
    FragmentDescriptor,
    LockPolicy,
    MacAddress,
    SharedRegion,
    Session,
    StatsSnapshot,
    SyncCode,
    VectorSyncRequest,
};
use ::std::{
    sync::{
        atomic::Ordering,
        Arc,
    },
    thread,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Allocated buffers handed over per RECEIVE in the watermark tests.
const ALLOC_BATCH: usize = 1000;

//======================================================================================================================
// Helper Functions
//======================================================================================================================

/// Issues `request`, expecting it to fail with `errno`.
fn expect_errno(session: &Session, request: VectorSyncRequest, errno: i32) -> Result<()> {
    match session.vector_sync(&request) {
        Err(e) => ensure_eq!(e.errno, errno),
        Ok(n) => anyhow::bail!("request {:?} should have failed, returned {}", request, n),
    }
    ensure_eq!(session.ioctl(Command::VectorSync(request)), -(errno as i64));
    Ok(())
}

/// Registers the arena of `test` and maps the shared region.
fn attach<'a>(test: &'a Test, session: &Session<'a>) -> Result<&'a SharedRegion> {
    ensure_eq!(session.ioctl(Command::RegisterMap(&test.register_map())), 0);
    Ok(session.map_region(REGION_SIZE)?)
}

//======================================================================================================================
// Receive
//======================================================================================================================

/// Tests that allocated buffers are taken in and that the cache is drained above the high watermark.
#[test]
fn receive_releases_above_high_watermark() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    for batch in 0..9 {
        let indices: Vec<u32> = (batch * ALLOC_BATCH..(batch + 1) * ALLOC_BATCH).map(nth_buffer).collect();
        post_alloc(region, WORKER, PORT, &indices)?;
        ensure_eq!(session.vector_sync(&receive(0, ALLOC_BATCH as u16))?, 0);
        if batch < 8 {
            let (level, released): (u32, Vec<u32>) = read_release(region, WORKER, PORT)?;
            ensure_eq!(level, ((batch + 1) * ALLOC_BATCH) as u32);
            anyhow::ensure!(released.is_empty());
        }
    }

    // 9000 cached: one batch goes back, oldest first.
    let (level, released): (u32, Vec<u32>) = read_release(region, WORKER, PORT)?;
    ensure_eq!(level, 8744);
    let expected: Vec<u32> = (0..256).map(nth_buffer).collect();
    ensure_eq!(released, expected);

    // Release continues while the cache stays above the watermark.
    let mut levels: Vec<u32> = Vec::new();
    for _ in 0..4 {
        ensure_eq!(session.vector_sync(&receive(0, 0))?, 0);
        levels.push(read_release(region, WORKER, PORT)?.0);
    }
    ensure_eq!(levels, vec![8488, 8232, 7976, 7976]);
    ensure_eq!(read_release(region, WORKER, PORT)?.1.len(), 0);

    let stats: StatsSnapshot = test.device.stats();
    ensure_eq!(stats.ports[PORT as usize].free_to_dataplane, 4 * 256);
    ensure_eq!(stats.ports[PORT as usize].vector_sync_rx, 13);
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(7976));
    Ok(())
}

/// Tests that allocated buffers receive the configured headroom.
#[test]
fn allocated_buffers_get_headroom() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    post_alloc(region, WORKER, PORT, &[nth_buffer(7)])?;
    session.vector_sync(&receive(0, 1))?;
    let desc: FragmentDescriptor = match test.device.alloc_descriptor(PORT as usize) {
        Some(desc) => desc,
        None => anyhow::bail!("allocated buffer should be cached"),
    };
    ensure_eq!(desc.seg.lo(), nth_buffer(7));
    ensure_eq!(desc.seg.offset(), 256);
    ensure_eq!(desc.seg.len(), 0);
    Ok(())
}

/// Tests that bits above the buffer index of an allocated buffer are dropped.
#[test]
fn allocated_index_is_truncated_to_buffer_index() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    post_alloc(region, WORKER, PORT, &[nth_buffer(5) | (1 << 24) | (1 << 31)])?;
    ensure_eq!(session.vector_sync(&receive(0, 1))?, 0);
    let desc: FragmentDescriptor = match test.device.alloc_descriptor(PORT as usize) {
        Some(desc) => desc,
        None => anyhow::bail!("allocated buffer should be cached"),
    };
    ensure_eq!(desc.seg.lo(), nth_buffer(5));
    ensure_eq!(desc.seg.hi(), 0);
    ensure_eq!(
        test.device.descriptor_address(&desc)?,
        test.device.descriptor_address(&segment(5, 0, 0, true))?
    );
    Ok(())
}

/// Tests that poll-only caches hold up when every port is polled by its own worker.
#[test]
fn poll_only_caches_serve_one_worker_each() -> Result<()> {
    const ROUNDS: usize = 64;
    const PER_ROUND: usize = 8;
    let config: DeviceConfig = DeviceConfig {
        lock_policy: LockPolicy::PollOnly,
        thread_map: [0, 1, 2, 3],
        ..DeviceConfig::default()
    };
    anyhow::ensure!(!config.shares_caches());
    let test: Test = Test::new(config)?;
    for port in 1..NUM_PORTS {
        let mac: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, port as u8 + 1]);
        test.device.port_state(Arc::new(port as u8), port, mac, true)?;
    }
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    thread::scope(|scope| -> Result<()> {
        let mut workers: Vec<thread::ScopedJoinHandle<Result<()>>> = Vec::new();
        for port in 0..NUM_PORTS {
            let session: &Session = &session;
            workers.push(scope.spawn(move || -> Result<()> {
                let worker: u8 = port as u8;
                for round in 0..ROUNDS {
                    let first: usize = (port * ROUNDS + round) * PER_ROUND;
                    let indices: Vec<u32> = (first..first + PER_ROUND).map(nth_buffer).collect();
                    post_alloc(region, worker, port as u8, &indices)?;
                    let request: VectorSyncRequest =
                        VectorSyncRequest::new(SyncCode::Receive, worker, port as u8, 0, 0)
                            .with_alloc_size(PER_ROUND as u16);
                    session.vector_sync(&request)?;
                }
                Ok(())
            }));
        }
        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("worker panicked"),
            }
        }
        Ok(())
    })?;

    for worker in 0..NUM_PORTS {
        ensure_eq!(test.device.cache(worker).map(|c| c.size()), Some((ROUNDS * PER_ROUND) as u32));
    }
    Ok(())
}

/// Tests that received descriptors land in the RX vector and that completion and availability are polled.
#[test]
fn receive_polls_the_driver() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    let batch: Vec<FragmentDescriptor> = (0..3).map(|n| segment(n, 1, 60 + n as u16, true)).collect();
    test.driver.script_rx(batch.clone());
    test.driver.tx_avail.store(42, Ordering::Relaxed);

    ensure_eq!(session.vector_sync(&receive(8, 0))?, 3);
    ensure_eq!(read_rx(region, WORKER, PORT, 3)?, batch);
    ensure_eq!(test.driver.tx_complete_calls.load(Ordering::Relaxed), 1);
    for pipe in 0..16 {
        ensure_eq!(region.tx_avail(PORT as usize)?[pipe].load(Ordering::Relaxed), 42);
    }
    ensure_eq!(test.device.stats().ports[PORT as usize].pkts_from_driver, 3);

    // Nothing scripted: the poll still runs, and receives nothing.
    ensure_eq!(session.vector_sync(&receive(8, 0))?, 0);
    ensure_eq!(test.driver.tx_complete_calls.load(Ordering::Relaxed), 2);
    Ok(())
}

/// Tests that a driver returning more descriptors than requested is clamped to the request.
#[test]
fn receive_is_clamped_to_the_request() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let _region: &SharedRegion = attach(&test, &session)?;

    test.driver.script_rx((0..5).map(|n| segment(n, 0, 64, true)).collect());
    ensure_eq!(session.vector_sync(&receive(2, 0))?, 2);
    Ok(())
}

/// Tests that RECEIVE needs a bound driver and an enabled port, but still takes allocated buffers in.
#[test]
fn receive_without_driver_fails() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    // Port 1 is disabled.
    let request: VectorSyncRequest = VectorSyncRequest::new(SyncCode::Receive, WORKER, 1, 0, 4);
    expect_errno(&session, request, libc::ENODEV)?;

    test.device.register_driver(None);
    let indices: Vec<u32> = (0..10).map(nth_buffer).collect();
    post_alloc(region, WORKER, PORT, &indices)?;
    expect_errno(&session, receive(4, 10), libc::ENODEV)?;
    // Once through vector_sync and once through ioctl.
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(20));
    Ok(())
}

/// Tests that an allocation vector naming an unregistered block is rejected as a whole.
#[test]
fn receive_rejects_unregistered_buffers() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    post_alloc(region, WORKER, PORT, &[nth_buffer(0), nth_buffer(1), buffer_index(5, 0)])?;
    match session.vector_sync(&receive(0, 3)) {
        Err(e) => ensure_eq!(e.errno, libc::EFAULT),
        Ok(_) => anyhow::bail!("unregistered block should be rejected"),
    }
    ensure_eq!(test.device.cache(WORKER as usize).map(|c| c.size()), Some(0));
    Ok(())
}

//======================================================================================================================
// Transmit
//======================================================================================================================

/// Tests that descriptors the driver does not take are counted as drops.
#[test]
fn transmit_counts_partial_acceptance() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    let descs: Vec<FragmentDescriptor> = (0..10).map(|n| segment(n, 1, 128, true)).collect();
    post_tx(region, WORKER, PORT, &descs)?;
    test.driver.tx_accept.store(7, Ordering::Relaxed);

    ensure_eq!(session.vector_sync(&transmit(1, 10))?, 7);
    ensure_eq!(test.driver.transmitted_count(), 7);
    anyhow::ensure!(test.driver.transmitted.lock().iter().all(|(pipe, _)| *pipe == 1));

    let stats: StatsSnapshot = test.device.stats();
    ensure_eq!(stats.ports[PORT as usize].pipes[1].pkts_from_dataplane, 7);
    ensure_eq!(stats.ports[PORT as usize].pipes[1].drops_from_dataplane, 3);
    ensure_eq!(stats.ports[PORT as usize].vector_sync_tx, 1);
    Ok(())
}

/// Tests that a disabled pipe swallows the whole vector.
#[test]
fn transmit_to_disabled_pipe_is_black_holed() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    let descs: Vec<FragmentDescriptor> = (0..4).map(|n| segment(n, 5, 128, true)).collect();
    post_tx(region, WORKER, PORT, &descs)?;
    ensure_eq!(session.vector_sync(&transmit(5, 4))?, 0);
    ensure_eq!(session.vector_sync(&transmit(1, 0))?, 0);
    ensure_eq!(test.driver.transmitted_count(), 0);

    let stats: StatsSnapshot = test.device.stats();
    ensure_eq!(stats.ports[PORT as usize].tx_black_hole, 4);
    ensure_eq!(stats.ports[PORT as usize].pipes[5].drops_from_dataplane, 0);
    ensure_eq!(stats.ports[PORT as usize].vector_sync_tx, 2);
    Ok(())
}

/// Tests that a vector-sync request encoded as a control call record is executed.
#[test]
fn transmit_through_raw_control_call() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    post_tx(region, WORKER, PORT, &[segment(0, 0, 64, true), segment(1, 0, 64, true)])?;
    let mut record: [u8; VectorSyncRequest::SIZE] = transmit(0, 2).to_bytes();
    ensure_eq!(session.ioctl_raw(IOCTL_VECTOR_SYNC, &mut record), 2);
    ensure_eq!(test.driver.transmitted_count(), 2);
    Ok(())
}

//======================================================================================================================
// Validation
//======================================================================================================================

/// Tests that malformed requests are rejected.
#[test]
fn malformed_requests_are_rejected() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let _region: &SharedRegion = attach(&test, &session)?;

    expect_errno(&session, VectorSyncRequest::new(SyncCode::Transmit, WORKER, 4, 0, 1), libc::EINVAL)?;
    expect_errno(&session, VectorSyncRequest::new(SyncCode::Transmit, WORKER, PORT, 16, 1), libc::EINVAL)?;
    expect_errno(&session, VectorSyncRequest::new(SyncCode::Allocate, WORKER, PORT, 0, 0), libc::EINVAL)?;
    expect_errno(&session, VectorSyncRequest::new(SyncCode::Free, WORKER, PORT, 0, 0), libc::EINVAL)?;
    expect_errno(&session, transmit(0, (RXTX_VLEN + 1) as u16), libc::EINVAL)?;
    expect_errno(&session, receive(0, (ALLOC_VLEN + 1) as u16), libc::EINVAL)?;
    expect_errno(&session, VectorSyncRequest::new(SyncCode::Transmit, 4, PORT, 0, 1), libc::EINVAL)?;

    let mut unknown: VectorSyncRequest = transmit(0, 0);
    unknown.code = 9;
    expect_errno(&session, unknown, libc::EINVAL)?;
    Ok(())
}

/// Tests that a worker cannot issue two overlapping calls.
#[test]
fn busy_worker_slot_is_rejected() -> Result<()> {
    let test: Test = Test::with_defaults()?;
    let session: Session = test.device.open()?;
    let region: &SharedRegion = attach(&test, &session)?;

    let held: WorkerSlot = region.claim(WORKER as usize)?;
    let result: Result<usize, Fail> = session.vector_sync(&transmit(0, 0));
    drop(held);
    match result {
        Err(e) => ensure_eq!(e.errno, libc::EBUSY),
        Ok(_) => anyhow::bail!("overlapping call should be rejected"),
    }
    ensure_eq!(session.vector_sync(&transmit(0, 0))?, 0);
    Ok(())
}
