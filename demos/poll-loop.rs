// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Drives a device with a loopback driver and one dataplane worker per port.
//!
//! Every worker transmits bursts of buffers on pipe 0 of its port. The loopback driver hands whatever it accepted back
//! on the next RECEIVE, so buffers circulate between the worker pool, the device cache, and the driver ring. Every
//! few iterations a worker also injects a packet, which the driver forwards to a stand-in network stack thread.

#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::meshbuf::{
    memory::{
        block_table::{
            index_to_block,
            index_to_offset,
        },
        buffer_index,
        SegmentDescriptor,
        WorkerSlot,
        REGION_SIZE,
    },
    runtime::{
        limits::{
            BUF_SIZE,
            DATA_HEADROOM,
            NUM_PORTS,
            VLEN,
        },
        logging,
    },
    Command as DeviceCommand,
    Config,
    Device,
    DeviceConfig,
    DriverOps,
    FragmentDescriptor,
    HugePageArena,
    MacAddress,
    PacketBuffer,
    PortContext,
    RegisterMap,
    Session,
    SharedRegion,
    SyncCode,
    ThreadMap,
    VectorSyncRequest,
};
use ::std::{
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Descriptors a loopback ring holds.
const RING_SIZE: usize = 1024;

/// Buffers owned by each worker. One hugepage block worth of network buffers.
const BUFFERS_PER_WORKER: usize = (1 << 21) / BUF_SIZE;

/// Length of every transmitted segment.
const SEGMENT_LEN: u16 = 64;

/// Iterations between two injected packets.
const INJECT_INTERVAL: usize = 64;

/// Payload of injected packets.
const INJECT_PAYLOAD: &[u8] = b"poll-loop";

//======================================================================================================================
// Program Arguments
//======================================================================================================================

#[derive(Debug)]
pub struct ProgramArguments {
    workers: usize,
    iterations: usize,
    burst: usize,
    config_path: Option<String>,
}

impl ProgramArguments {
    pub fn new() -> Result<Self> {
        let matches: ArgMatches = Command::new("poll-loop")
            .arg(
                Arg::new("workers")
                    .long("workers")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of dataplane workers (one port each)"),
            )
            .arg(
                Arg::new("iterations")
                    .long("iterations")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of poll iterations per worker"),
            )
            .arg(
                Arg::new("burst")
                    .long("burst")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of descriptors transmitted per iteration"),
            )
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the device configuration file"),
            )
            .get_matches();

        let args: ProgramArguments = ProgramArguments {
            workers: matches.get_one::<usize>("workers").copied().unwrap_or(NUM_PORTS),
            iterations: matches.get_one::<usize>("iterations").copied().unwrap_or(10_000),
            burst: matches.get_one::<usize>("burst").copied().unwrap_or(32),
            config_path: matches.get_one::<String>("config").cloned(),
        };
        if args.workers == 0 || args.workers > NUM_PORTS {
            anyhow::bail!("workers must be between 1 and {}", NUM_PORTS);
        }
        if args.burst == 0 || args.burst > VLEN {
            anyhow::bail!("burst must be between 1 and {}", VLEN);
        }
        Ok(args)
    }
}

//======================================================================================================================
// Loopback Driver
//======================================================================================================================

/// Driver whose ports receive whatever they transmit.
struct Loopback {
    rings: Vec<(Sender<FragmentDescriptor>, Receiver<FragmentDescriptor>)>,
}

impl Loopback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rings: (0..NUM_PORTS).map(|_| crossbeam_channel::bounded(RING_SIZE)).collect(),
        })
    }

    /// Ring of the port `context` belongs to.
    fn ring(&self, context: &PortContext) -> Option<&(Sender<FragmentDescriptor>, Receiver<FragmentDescriptor>)> {
        context.downcast_ref::<usize>().and_then(|port| self.rings.get(*port))
    }

    /// Builds the callbacks of this driver. Injected packets go to `stack`.
    fn ops(self: &Arc<Self>, stack: Sender<PacketBuffer>) -> DriverOps {
        let (tx, rx, avail, cancel) = (self.clone(), self.clone(), self.clone(), self.clone());
        DriverOps::new()
            .with_transmit(
                move |_: &Device, context: &PortContext, _: u32, descs: &mut [FragmentDescriptor], _: bool| {
                    let (sender, _) = match tx.ring(context) {
                        Some(ring) => ring,
                        None => return 0,
                    };
                    descs.iter().take_while(|desc| sender.try_send(**desc).is_ok()).count()
                },
            )
            .with_receive(move |_: &Device, context: &PortContext, out: &mut [FragmentDescriptor], _: bool| {
                let (_, receiver) = match rx.ring(context) {
                    Some(ring) => ring,
                    None => return 0,
                };
                let mut n: usize = 0;
                while n < out.len() {
                    match receiver.try_recv() {
                        Ok(desc) => {
                            out[n] = desc;
                            n += 1;
                        },
                        Err(_) => break,
                    }
                }
                n
            })
            .with_tx_avail(move |_: &Device, context: &PortContext, out: &mut [u32; 16]| {
                if let Some((sender, _)) = avail.ring(context) {
                    out.fill((RING_SIZE - sender.len()) as u32);
                }
            })
            .with_cancel_dma(move |_: &Device, context: &PortContext| {
                if let Some((_, receiver)) = cancel.ring(context) {
                    while receiver.try_recv().is_ok() {}
                }
            })
            .with_inject(move |_: &PortContext, packet: PacketBuffer, _: u32| match stack.send(packet) {
                Ok(()) => 0,
                Err(_) => -libc::ENOBUFS,
            })
    }
}

//======================================================================================================================
// Worker
//======================================================================================================================

#[derive(Debug, Default)]
struct WorkerReport {
    sent: usize,
    dropped: usize,
    received: usize,
    released: usize,
    injected: usize,
}

/// Dataplane worker polling the port of the same number.
struct Worker<'a> {
    session: &'a Session<'a>,
    region: &'a SharedRegion,
    arena: &'a HugePageArena,
    worker: usize,
    /// Buffers owned by the worker.
    pool: Vec<u32>,
    report: WorkerReport,
}

impl<'a> Worker<'a> {
    fn new(session: &'a Session<'a>, region: &'a SharedRegion, arena: &'a HugePageArena, worker: usize) -> Self {
        Self {
            session,
            region,
            arena,
            worker,
            pool: (0..BUFFERS_PER_WORKER).map(|i| buffer_index(worker, i * BUF_SIZE)).collect(),
            report: WorkerReport::default(),
        }
    }

    fn request(&self, code: SyncCode, size: usize) -> VectorSyncRequest {
        VectorSyncRequest::new(code, self.worker as u8, self.worker as u8, 0, size as u16)
    }

    fn descriptor(&self, lo: u32, len: u16) -> FragmentDescriptor {
        let mut seg: SegmentDescriptor = SegmentDescriptor::new(lo, DATA_HEADROOM, len);
        seg.set_eop(true);
        FragmentDescriptor {
            seg,
            port_id: self.worker as u8,
            pipe_id: 0,
            ..Default::default()
        }
    }

    /// Hands half of the pool to the device.
    fn prime(&mut self) -> Result<()> {
        let alloc: Vec<u32> = self.pool.split_off(self.pool.len() / 2);
        {
            let mut slot: WorkerSlot = self.region.claim(self.worker)?;
            slot.alloc(self.worker)?[..alloc.len()].copy_from_slice(&alloc);
        }
        let request: VectorSyncRequest = self.request(SyncCode::Receive, 0).with_alloc_size(alloc.len() as u16);
        self.session.vector_sync(&request)?;
        Ok(())
    }

    /// Transmits a burst out of the pool. Buffers the driver did not take stay with the worker.
    fn transmit(&mut self, burst: usize) -> Result<()> {
        let n: usize = burst.min(self.pool.len());
        let burst: Vec<u32> = self.pool.split_off(self.pool.len() - n);
        {
            let mut slot: WorkerSlot = self.region.claim(self.worker)?;
            let tx: &mut [FragmentDescriptor] = slot.tx(self.worker)?;
            for (desc, lo) in tx.iter_mut().zip(burst.iter()) {
                *desc = self.descriptor(*lo, SEGMENT_LEN);
            }
        }
        let sent: usize = self.session.vector_sync(&self.request(SyncCode::Transmit, n))?;
        self.pool.extend_from_slice(&burst[sent..]);
        self.report.sent += sent;
        self.report.dropped += n - sent;
        Ok(())
    }

    /// Receives what came back, and takes released buffers.
    fn receive(&mut self) -> Result<()> {
        let received: usize = self.session.vector_sync(&self.request(SyncCode::Receive, VLEN))?;
        let mut slot: WorkerSlot = self.region.claim(self.worker)?;
        self.pool
            .extend(slot.rx(self.worker)?[..received].iter().map(|desc| desc.seg.lo()));
        let released: usize = slot.release_count() as usize;
        self.pool.extend_from_slice(&slot.release(self.worker)?[..released]);
        self.report.received += received;
        self.report.released += released;
        Ok(())
    }

    /// Injects one packet into the network stack.
    fn inject(&mut self) -> Result<()> {
        let lo: u32 = match self.pool.last() {
            Some(lo) => *lo,
            None => return Ok(()),
        };
        let port: u8 = self.worker as u8;
        let mut frame: Vec<u8> = vec![0x02, 0, 0, 0, 1, port, 0x02, 0, 0, 0, 0, port, 0x08, 0x00];
        let header_len: usize = frame.len();
        frame.extend_from_slice(INJECT_PAYLOAD);
        let offset: usize = index_to_offset(lo) + DATA_HEADROOM as usize - header_len;
        self.arena.write(index_to_block(lo), offset, &frame)?;

        {
            let mut slot: WorkerSlot = self.region.claim(self.worker)?;
            slot.tx(self.worker)?[0] = self.descriptor(lo, INJECT_PAYLOAD.len() as u16);
        }
        self.report.injected += self.session.vector_sync(&self.request(SyncCode::Inject, 1))?;
        Ok(())
    }

    fn run(mut self, args: &ProgramArguments) -> Result<WorkerReport> {
        self.prime()?;
        for iteration in 0..args.iterations {
            self.transmit(args.burst)?;
            self.receive()?;
            if iteration % INJECT_INTERVAL == 0 {
                self.inject()?;
            }
        }
        Ok(self.report)
    }
}

//======================================================================================================================
// main()
//======================================================================================================================

fn main() -> Result<()> {
    logging::initialize();
    let args: ProgramArguments = ProgramArguments::new()?;
    let config: DeviceConfig = match &args.config_path {
        Some(path) => DeviceConfig::try_from(&Config::new(path)?)?,
        None => DeviceConfig::default(),
    };

    let arena: Arc<HugePageArena> = Arc::new(HugePageArena::new(args.workers)?);
    let device: Device = Device::new(config, arena.clone())?;
    let (stack_tx, stack_rx): (Sender<PacketBuffer>, Receiver<PacketBuffer>) = crossbeam_channel::unbounded();
    let loopback: Arc<Loopback> = Loopback::new();
    device.register_driver(Some(loopback.ops(stack_tx)));
    for port in 0..args.workers {
        let context: PortContext = Arc::new(port);
        device.port_state(context, port, MacAddress::new([0x02, 0, 0, 0, 0, port as u8]), true)?;
        device.pipe_state(port, 0, Some(MacAddress::new([0x02, 0, 0, 0, 1, port as u8])), true)?;
    }

    let session: Session = device.open()?;
    let map: RegisterMap = RegisterMap::new(arena.virtual_base(), arena.physical_addresses());
    if session.ioctl(DeviceCommand::RegisterMap(&map)) != 0 {
        anyhow::bail!("failed to register hugepage memory");
    }
    let thread_map: ThreadMap = ThreadMap { thread: [0, 1, 2, 3] };
    if session.ioctl(DeviceCommand::ThreadMap(thread_map)) != 0 {
        anyhow::bail!("failed to set thread map");
    }
    let region: &SharedRegion = session.map_region(REGION_SIZE)?;

    let start: Instant = Instant::now();
    let (reports, delivered): (Vec<Result<WorkerReport>>, (usize, usize)) = thread::scope(|s| {
        let stack = s.spawn(move || {
            stack_rx
                .iter()
                .fold((0, 0), |(packets, bytes), packet| (packets + 1, bytes + packet.len()))
        });
        let handles: Vec<_> = (0..args.workers)
            .map(|worker| {
                let worker: Worker = Worker::new(&session, region, &arena, worker);
                let args: &ProgramArguments = &args;
                s.spawn(move || worker.run(args))
            })
            .collect();
        let reports: Vec<Result<WorkerReport>> = handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(report) => report,
                Err(_) => Err(anyhow::anyhow!("worker panicked")),
            })
            .collect();
        // Unbinding the driver closes the stack channel.
        device.register_driver(None);
        (reports, stack.join().unwrap_or_default())
    });
    let elapsed: Duration = start.elapsed();

    for (worker, report) in reports.into_iter().enumerate() {
        let report: WorkerReport = report?;
        println!(
            "worker {}: sent={} dropped={} received={} released={} injected={}",
            worker, report.sent, report.dropped, report.received, report.released, report.injected
        );
    }
    println!("stack: packets={} bytes={}", delivered.0, delivered.1);
    println!("elapsed: {:?}", elapsed);
    print!("{}", device.stats());

    drop(session);
    Ok(())
}
