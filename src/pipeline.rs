use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    thread::JoinHandle,
};

use chrono::{Local, Utc};
use crossbeam::channel::{bounded, Receiver, Sender};

use crate::{
    config::{SourceConfig, TxConfig},
    error::{Result, TxError},
    payload::{sample_pool, Block, Message, TimeSpec},
    sdr::{self, SharedDevice, TxDevice, TxMetadata},
    utils::{bytes_to_samples, samples_as_mut_u8, samples_as_u8},
    Sample,
};

/// Samples per block read from a sample file
pub const BLOCK_SIZE: usize = 8192;
/// Messages the queue source holds before the producer blocks
pub const QUEUE_DEPTH: usize = 3;
const STAGE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Usrp,
    File,
    Null,
}

impl SinkKind {
    /// Hardware when a frequency is given, else a file when a path is given, else discard.
    pub fn select(tx_freq: Option<f64>, to_file: Option<&Path>) -> Self {
        match (tx_freq, to_file) {
            (Some(_), _) => SinkKind::Usrp,
            (None, Some(_)) => SinkKind::File,
            (None, None) => SinkKind::Null,
        }
    }
}

pub enum Sink {
    Usrp(SharedDevice),
    File(PathBuf),
    Null,
}

enum Stage {
    FileSource {
        path: PathBuf,
        repeat: usize,
        tx: Sender<Block>,
    },
    QueueSource {
        rx: Receiver<Message>,
        tx: Sender<Block>,
    },
    Scale {
        k: f32,
        rx: Receiver<Block>,
        tx: Sender<Block>,
    },
    Delay {
        n: usize,
        rx: Receiver<Block>,
        tx: Sender<Block>,
    },
    Tap {
        path: PathBuf,
        rx: Receiver<Block>,
        tx: Sender<Block>,
    },
    Sink {
        sink: Sink,
        rx: Vec<Receiver<Block>>,
    },
}

impl Stage {
    fn name(&self) -> String {
        match self {
            Stage::FileSource { path, repeat, .. } if *repeat > 1 => {
                format!("file_source({}) x{repeat}", path.display())
            }
            Stage::FileSource { path, .. } => format!("file_source({})", path.display()),
            Stage::QueueSource { .. } => format!("message_source(depth={QUEUE_DEPTH})"),
            Stage::Scale { k, .. } => format!("multiply_const({k})"),
            Stage::Delay { n, .. } => format!("delay({n})"),
            Stage::Tap { path, .. } => format!("file_tap({})", path.display()),
            Stage::Sink { sink, .. } => match sink {
                Sink::Usrp(_) => "usrp_sink".to_string(),
                Sink::File(path) => format!("file_sink({})", path.display()),
                Sink::Null => "null_sink".to_string(),
            },
        }
    }

    fn run(self) -> Result<()> {
        match self {
            Stage::FileSource { path, repeat, tx } => file_source(&path, repeat, tx),
            Stage::QueueSource { rx, tx } => queue_source(rx, tx),
            Stage::Scale { k, rx, tx } => multiply_const(k, rx, tx),
            Stage::Delay { n, rx, tx } => delay(n, rx, tx),
            Stage::Tap { path, rx, tx } => file_tap(&path, rx, tx),
            Stage::Sink { sink, mut rx } => match sink {
                Sink::Usrp(dev) => usrp_sink(&dev, rx),
                Sink::File(path) => match rx.pop() {
                    Some(rx) => file_sink(&path, rx),
                    None => Ok(()),
                },
                Sink::Null => null_sink(rx),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Built,
    Started,
    Stopped,
}

/// Owns every stage of the transmit graph from build until the last worker is joined.
pub struct Pipeline {
    stages: Vec<Stage>,
    chains: Vec<Vec<String>>,
    workers: Vec<(String, JoinHandle<Result<()>>)>,
    queue: Option<Sender<Message>>,
    device: Option<SharedDevice>,
    sink_kind: SinkKind,
    gains: Vec<f64>,
    state: PipelineState,
}

fn tap_path(chan: usize) -> PathBuf {
    PathBuf::from(format!("mimo_{}.dat", (b'a' + chan as u8) as char))
}

fn file_len(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| TxError::from(e).with_context(format!("opening {}", path.display())))
}

/// Append a stage fed by `rx`; returns the receiving end of its output.
fn link(
    stages: &mut Vec<Stage>,
    chain: &mut Vec<String>,
    rx: Receiver<Block>,
    make: impl FnOnce(Receiver<Block>, Sender<Block>) -> Stage,
) -> Receiver<Block> {
    let (tx, next) = bounded(STAGE_DEPTH);
    let stage = make(rx, tx);
    chain.push(stage.name());
    stages.push(stage);
    next
}

/// Every channel file must hold the same number of samples.
pub fn check_equal_lengths(paths: &[PathBuf]) -> Result<()> {
    let Some(first) = paths.first() else {
        return Ok(());
    };
    let a_len = file_len(first)?;
    for p in &paths[1..] {
        let b_len = file_len(p)?;
        if b_len != a_len {
            return Err(TxError::LengthMismatch {
                a: first.clone(),
                a_len,
                b: p.clone(),
                b_len,
            });
        }
    }
    Ok(())
}

impl Pipeline {
    /// Select and wire every stage. `device` is required when the configuration selects the
    /// hardware sink; it is configured here, before any sample flows.
    pub fn build(cfg: &TxConfig, device: Option<Box<dyn TxDevice>>) -> Result<Self> {
        let nchan = cfg.num_channels();
        if nchan == 0 {
            return Err(TxError::Config("no channels configured".to_string()));
        }

        let sink_kind = cfg.sink_kind();
        let mut gains = Vec::new();
        let mut shared = None;
        let sink = match sink_kind {
            SinkKind::Usrp => {
                let mut dev = device.ok_or_else(|| {
                    TxError::Device("hardware sink selected but no device was opened".to_string())
                })?;
                gains = sdr::configure(dev.as_mut(), cfg)?;
                if cfg.verbose
                    && let Some(freq) = cfg.tx_freq
                {
                    sdr::print_banner(&cfg.device, freq, cfg.bandwidth, &gains);
                }
                let dev = SharedDevice::new(dev);
                shared = Some(dev.clone());
                Sink::Usrp(dev)
            }
            SinkKind::File => {
                if nchan > 1 {
                    return Err(TxError::Config(format!(
                        "file sink takes a single channel, {nchan} configured"
                    )));
                }
                Sink::File(cfg.to_file.clone().unwrap_or_default())
            }
            SinkKind::Null => Sink::Null,
        };

        let mut stages = Vec::new();
        let mut chains = Vec::with_capacity(nchan);
        let mut heads = Vec::with_capacity(nchan);
        let mut queue = None;

        match &cfg.source {
            SourceConfig::Files { paths, repeat } => {
                if paths.len() != nchan {
                    return Err(TxError::Config(format!(
                        "{} input files for {nchan} channels",
                        paths.len()
                    )));
                }
                check_equal_lengths(paths)?;
                for path in paths {
                    let (tx, rx) = bounded(STAGE_DEPTH);
                    stages.push(Stage::FileSource {
                        path: path.clone(),
                        repeat: *repeat,
                        tx,
                    });
                    heads.push(rx);
                }
            }
            SourceConfig::Queue(q) => {
                if nchan != 1 {
                    return Err(TxError::Config(format!(
                        "message source feeds a single channel, {nchan} configured"
                    )));
                }
                file_len(&q.data_file)?;
                let (tx_msg, rx_msg) = bounded(QUEUE_DEPTH);
                let (tx, rx) = bounded(STAGE_DEPTH);
                stages.push(Stage::QueueSource { rx: rx_msg, tx });
                heads.push(rx);
                queue = Some(tx_msg);
            }
        }
        for s in &stages {
            chains.push(vec![s.name()]);
        }

        let mut tails = Vec::with_capacity(nchan);
        for (chan, (rx, chain)) in heads.into_iter().zip(chains.iter_mut()).enumerate() {
            let k = cfg.channels[chan].amplitude;
            let mut rx = link(&mut stages, chain, rx, |rx, tx| Stage::Scale { k, rx, tx });
            if cfg.log {
                let path = tap_path(chan);
                rx = link(&mut stages, chain, rx, |rx, tx| Stage::Tap { path, rx, tx });
            }
            if let Some(n) = cfg.delay {
                rx = link(&mut stages, chain, rx, |rx, tx| Stage::Delay { n, rx, tx });
            }
            tails.push(rx);
        }

        let sink = Stage::Sink { sink, rx: tails };
        let name = sink.name();
        for (chan, chain) in chains.iter_mut().enumerate() {
            chain.push(if nchan > 1 { format!("{name}[{chan}]") } else { name.clone() });
        }
        stages.push(sink);

        Ok(Self {
            stages,
            chains,
            workers: Vec::new(),
            queue,
            device: shared,
            sink_kind,
            gains,
            state: PipelineState::Built,
        })
    }

    pub fn sink_kind(&self) -> SinkKind {
        self.sink_kind
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Gains applied to the hardware channels, empty for file and null sinks.
    pub fn gains(&self) -> &[f64] {
        &self.gains
    }

    /// One line per channel, source to sink.
    pub fn describe(&self) -> Vec<String> {
        self.chains.iter().map(|c| c.join(" -> ")).collect()
    }

    /// Producer end of the message source, if the graph has one.
    pub fn queue(&self) -> Option<&Sender<Message>> {
        self.queue.as_ref()
    }

    /// Drop the producer end; the message source stops once the queue drains.
    pub fn close_queue(&mut self) {
        self.queue = None;
    }

    /// Device time, or the host clock when no hardware sink is in the graph.
    pub fn time_now(&self) -> Result<TimeSpec> {
        match self.device {
            Some(ref dev) => dev.lock()?.time_now(),
            None => {
                let now = Utc::now();
                Ok(TimeSpec::new(
                    now.timestamp(),
                    now.timestamp_subsec_nanos() as f64 * 1e-9,
                ))
            }
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Built {
            return Err(TxError::Config(format!(
                "cannot start a pipeline in state {:?}",
                self.state
            )));
        }
        for stage in self.stages.drain(..) {
            let name = stage.name();
            let h = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || stage.run())?;
            self.workers.push((name, h));
        }
        self.state = PipelineState::Started;
        let local_time = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        log::info!("pipeline started at {local_time} ({} stages)", self.workers.len());
        Ok(())
    }

    /// Block until every stage has finished; reports the first stage error.
    pub fn wait(&mut self) -> Result<()> {
        self.close_queue();
        let mut result = Ok(());
        for (name, h) in self.workers.drain(..) {
            let r = match h.join() {
                Ok(r) => r.map_err(|e| e.with_context(name.clone())),
                Err(_) => Err(TxError::Disconnected(format!("{name} panicked"))),
            };
            if let Err(e) = r {
                log::error!("{e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.state = PipelineState::Stopped;
        result
    }
}

fn read_block(reader: &mut impl Read, buf: &mut Vec<Sample>, nsamp: usize) -> Result<usize> {
    buf.resize(nsamp, Sample::default());
    let bytes = samples_as_mut_u8(&mut buf[..]);
    let mut filled = 0;
    while filled < bytes.len() {
        match reader.read(&mut bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let n = filled / std::mem::size_of::<Sample>();
    buf.truncate(n);
    Ok(n)
}

/// Stream raw complex samples from `path`, `repeat` times over.
pub fn file_source(path: &Path, repeat: usize, tx: Sender<Block>) -> Result<()> {
    let pool = sample_pool(BLOCK_SIZE);
    let mut nsamp = 0u64;
    for _ in 0..repeat {
        let file = File::open(path)
            .map_err(|e| TxError::from(e).with_context(format!("opening {}", path.display())))?;
        let mut reader = BufReader::with_capacity(1024 * 1024, file);
        loop {
            let mut samples = pool.pull_owned();
            let n = read_block(&mut reader, &mut samples, BLOCK_SIZE)?;
            if n == 0 {
                break;
            }
            nsamp += n as u64;
            if tx.send(Block::new(samples)).is_err() {
                return Ok(());
            }
        }
    }
    log::info!("end of file: {} ({nsamp} samples)", path.display());
    Ok(())
}

/// Turn queued messages into one burst each until `Message::Eof` or the producer goes away.
pub fn queue_source(rx: Receiver<Message>, tx: Sender<Block>) -> Result<()> {
    let pool = sample_pool(0);
    let mut nmsg = 0usize;
    while let Ok(msg) = rx.recv() {
        let Message::Data { payload, timestamp } = msg else {
            log::debug!("message source: end of stream after {nmsg} messages");
            break;
        };
        let mut samples = pool.pull_owned();
        bytes_to_samples(&payload, &mut samples);
        nmsg += 1;
        let block = Block {
            samples,
            tx_time: timestamp,
            end_of_burst: true,
        };
        if tx.send(block).is_err() {
            break;
        }
    }
    Ok(())
}

pub fn multiply_const(k: f32, rx: Receiver<Block>, tx: Sender<Block>) -> Result<()> {
    while let Ok(mut b) = rx.recv() {
        b.samples.iter_mut().for_each(|x| *x *= k);
        if tx.send(b).is_err() {
            break;
        }
    }
    Ok(())
}

/// Prepend `n` zero samples to the stream.
pub fn delay(n: usize, rx: Receiver<Block>, tx: Sender<Block>) -> Result<()> {
    let mut pending = n;
    while let Ok(mut b) = rx.recv() {
        if pending > 0 {
            b.samples
                .splice(0..0, std::iter::repeat_n(Sample::default(), pending));
            pending = 0;
        }
        if tx.send(b).is_err() {
            break;
        }
    }
    Ok(())
}

/// Pass blocks through while writing a copy of their samples to `path`.
pub fn file_tap(path: &Path, rx: Receiver<Block>, tx: Sender<Block>) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| TxError::from(e).with_context(format!("creating {}", path.display())))?;
    let mut w = BufWriter::new(file);
    while let Ok(b) = rx.recv() {
        w.write_all(samples_as_u8(&b.samples))?;
        if tx.send(b).is_err() {
            break;
        }
    }
    w.flush()?;
    Ok(())
}

pub fn file_sink(path: &Path, rx: Receiver<Block>) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| TxError::from(e).with_context(format!("creating {}", path.display())))?;
    let mut w = BufWriter::new(file);
    let mut nsamp = 0u64;
    for b in rx.iter() {
        w.write_all(samples_as_u8(&b.samples))?;
        nsamp += b.len() as u64;
    }
    w.flush()?;
    log::info!("wrote {nsamp} samples to {}", path.display());
    Ok(())
}

pub fn null_sink(rx: Vec<Receiver<Block>>) -> Result<()> {
    let mut nsamp = 0u64;
    for r in &rx {
        nsamp += r.iter().map(|b| b.len() as u64).sum::<u64>();
    }
    log::info!("null sink discarded {nsamp} samples");
    Ok(())
}

/// Take one block per channel per send; all channels must deliver blocks of equal length and
/// end together.
pub fn usrp_sink(dev: &SharedDevice, rx: Vec<Receiver<Block>>) -> Result<()> {
    let mut in_burst = false;
    let mut nsamp = 0u64;
    loop {
        let blocks: Vec<Option<Block>> = rx.iter().map(|r| r.recv().ok()).collect();
        if blocks.iter().all(Option::is_none) {
            break;
        }
        if let Some(ch) = blocks.iter().position(Option::is_none) {
            return Err(TxError::ChannelUnderrun(ch));
        }
        let blocks: Vec<Block> = blocks.into_iter().flatten().collect();
        if let Some(ch) = blocks.iter().position(|b| b.len() != blocks[0].len()) {
            return Err(TxError::ChannelUnderrun(ch));
        }

        let md = TxMetadata {
            start_of_burst: !in_burst,
            end_of_burst: blocks[0].end_of_burst,
            time_spec: blocks[0].tx_time,
        };
        let buffs: Vec<&[Sample]> = blocks.iter().map(|b| b.samples.as_slice()).collect();
        send_all(dev, &buffs, md)?;
        nsamp += blocks[0].len() as u64;
        in_burst = !md.end_of_burst;
    }
    if in_burst {
        let empty: &[Sample] = &[];
        let buffs = vec![empty; rx.len()];
        let md = TxMetadata {
            end_of_burst: true,
            ..Default::default()
        };
        dev.lock()?.send(&buffs, &md)?;
    }
    log::info!("usrp sink sent {nsamp} samples per channel");
    Ok(())
}

/// Send one block to the device, resubmitting the remainder after a short send.
/// Only the first call carries the start flag and the time; the end flag rides on the
/// call that finishes the block.
fn send_all(dev: &SharedDevice, buffs: &[&[Sample]], md: TxMetadata) -> Result<()> {
    let total = buffs.first().map_or(0, |b| b.len());
    let mut done = 0;
    let mut md = md;
    loop {
        let rest: Vec<&[Sample]> = buffs.iter().map(|b| &b[done..]).collect();
        let sent = dev.lock()?.send(&rest, &md)?;
        done += sent.min(total - done);
        if done == total {
            return Ok(());
        }
        if sent == 0 {
            return Err(TxError::Device(format!(
                "send stalled after {done} of {total} samples"
            )));
        }
        md.start_of_burst = false;
        md.time_spec = None;
    }
}
