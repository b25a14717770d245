//! Runs a built pipeline to completion: real-time request, start, the packet loop of the
//! message-queue programs, end-of-stream and drain.

use std::{
    fs::File,
    io::Read,
    path::Path,
    sync::Arc,
    thread::sleep,
    time::Duration,
};

use crossbeam::channel::Sender;

use crate::{
    config::{DeviceConfig, QueueConfig, SourceConfig, TxConfig},
    error::{Result, TxError},
    payload::{Message, TimeSpec},
    pipeline::{Pipeline, SinkKind},
    rt,
    sdr::TxDevice,
};

/// How far ahead of the device clock the first timed packet is scheduled
pub const TIMED_LEAD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    pub sink: SinkKind,
    /// Packets queued by the message-queue loop (0 for file-driven runs)
    pub packets: usize,
}

/// Scheduled time of packet `index`: `t0 + TIMED_LEAD + index * gap`.
pub fn packet_time(t0: TimeSpec, index: usize, gap: f64) -> TimeSpec {
    t0.offset(TIMED_LEAD + index as f64 * gap)
}

/// Read at most `max_bytes` of `path`.
pub fn read_payload(path: &Path, max_bytes: usize) -> Result<Vec<u8>> {
    let file = File::open(path)
        .map_err(|e| TxError::from(e).with_context(format!("opening {}", path.display())))?;
    let mut data = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut data)?;
    Ok(data)
}

/// Queue `q.num` copies of `payload`, then one `Message::Eof`.
///
/// With `t0` set every packet carries `packet_time(t0, i, gap)` and the loop does not sleep;
/// otherwise the loop sleeps `gap` seconds after each packet.
pub fn send_packets(
    queue: &Sender<Message>,
    payload: Arc<[u8]>,
    q: &QueueConfig,
    t0: Option<TimeSpec>,
) -> Result<usize> {
    let gap = Duration::from_secs_f64(q.gap);
    let disconnected = || TxError::Disconnected("message_source".to_string());
    for cnt in 0..q.num {
        let timestamp = t0.map(|t0| packet_time(t0, cnt, q.gap));
        queue
            .send(Message::data(Arc::clone(&payload), timestamp))
            .map_err(|_| disconnected())?;
        log::trace!("queued packet {cnt}");
        if timestamp.is_none() && !gap.is_zero() {
            sleep(gap);
        }
    }
    queue.send(Message::Eof).map_err(|_| disconnected())?;
    Ok(q.num)
}

fn transmit_queue(pipeline: &Pipeline, q: &QueueConfig) -> Result<usize> {
    let data = read_payload(&q.data_file, q.max_read_bytes)?;
    println!(
        "Length of payload = {} | MAX_READ = {}",
        data.len(),
        q.max_read_bytes
    );

    let t0 = pipeline.time_now()?;
    println!("USRP Time: {}", t0.full_secs);
    log::debug!("first packet due at {:.6} s", t0.offset(TIMED_LEAD).as_secs_f64());
    let queue = pipeline
        .queue()
        .ok_or_else(|| TxError::Config("pipeline has no message source".to_string()))?
        .clone();

    let cnt = send_packets(&queue, data.into(), q, q.timed.then_some(t0))?;
    println!("End of Tx | cnt = {cnt}");
    sleep(q.grace);
    Ok(cnt)
}

/// Build, start and drain the transmit pipeline described by `cfg`.
///
/// `open_device` is called only when the configuration selects the hardware sink.
pub fn run<F>(cfg: &TxConfig, open_device: F) -> Result<TxSummary>
where
    F: FnOnce(&DeviceConfig, usize) -> Result<Box<dyn TxDevice>>,
{
    let sink = cfg.sink_kind();
    let device = match sink {
        SinkKind::Usrp => Some(open_device(&cfg.device, cfg.num_channels())?),
        SinkKind::File | SinkKind::Null => None,
    };
    let mut pipeline = Pipeline::build(cfg, device)?;
    if !pipeline.gains().is_empty() {
        log::info!("tx gains {:?}", pipeline.gains());
    }
    if cfg.verbose {
        for line in pipeline.describe() {
            println!("{line}");
        }
    }

    if let Err(e) = rt::enable_realtime_scheduling() {
        println!("Warning: failed to enable realtime scheduling");
        log::warn!("{e}");
    }
    pipeline.start()?;

    let packets = match cfg.source {
        SourceConfig::Files { .. } => 0,
        SourceConfig::Queue(ref q) => match transmit_queue(&pipeline, q) {
            Ok(n) => n,
            Err(e) => {
                // a failed stage explains a disconnected queue better than the queue does
                pipeline.wait()?;
                return Err(e);
            }
        },
    };

    pipeline.wait()?;
    log::info!("transmission complete, pipeline {:?}", pipeline.state());
    Ok(TxSummary { sink, packets })
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Instant};

    use crossbeam::channel::unbounded;

    use super::*;
    use crate::{
        Sample,
        config::{ChannelConfig, SyncMode},
        sdr::fake::{Call, FakeDevice},
        utils::samples_as_u8,
    };

    fn queue_cfg(data_file: PathBuf, num: usize, gap: f64, timed: bool) -> TxConfig {
        TxConfig {
            bandwidth: 4e6,
            tx_freq: Some(2.45e9),
            to_file: None,
            channels: vec![ChannelConfig {
                amplitude: 0.1,
                gain: None,
            }],
            source: SourceConfig::Queue(QueueConfig {
                data_file,
                num,
                gap,
                timed,
                max_read_bytes: 1_000_000,
                grace: Duration::ZERO,
            }),
            device: DeviceConfig {
                args: String::new(),
                spec: None,
                antenna: None,
                sync: SyncMode::Default,
            },
            delay: None,
            verbose: false,
            log: false,
        }
    }

    fn payload_file(dir: &Path, nsamp: usize) -> PathBuf {
        let path = dir.join("payload.bin");
        let x: Vec<Sample> = (0..nsamp).map(|i| Sample::new(i as f32, 1.0)).collect();
        std::fs::write(&path, samples_as_u8(&x)).unwrap();
        path
    }

    #[test]
    fn timestamp_law() {
        let t0 = TimeSpec::new(1000, 0.25);
        for i in 0..10 {
            let t = packet_time(t0, i, 0.01);
            assert!((t.as_secs_f64() - (1000.25 + 0.1 + i as f64 * 0.01)).abs() < 1e-9);
        }
    }

    #[test]
    fn packets_then_single_eof() {
        let (tx, rx) = unbounded();
        let q = QueueConfig {
            data_file: PathBuf::new(),
            num: 4,
            gap: 0.0,
            timed: false,
            max_read_bytes: 0,
            grace: Duration::ZERO,
        };
        let payload: Arc<[u8]> = vec![1u8, 2, 3].into();
        assert_eq!(send_packets(&tx, payload.clone(), &q, None).unwrap(), 4);
        drop(tx);
        let msgs: Vec<Message> = rx.iter().collect();
        assert_eq!(msgs.len(), 5);
        assert!(msgs[..4].iter().all(|m| *m == Message::data(payload.clone(), None)));
        assert_eq!(msgs.iter().filter(|m| matches!(m, Message::Eof)).count(), 1);
        assert_eq!(msgs[4], Message::Eof);
    }

    #[test]
    fn timed_packets_in_order() {
        let (tx, rx) = unbounded();
        let q = QueueConfig {
            data_file: PathBuf::new(),
            num: 3,
            gap: 0.5,
            timed: true,
            max_read_bytes: 0,
            grace: Duration::ZERO,
        };
        let t0 = TimeSpec::new(7, 0.0);
        let start = Instant::now();
        send_packets(&tx, vec![0u8; 8].into(), &q, Some(t0)).unwrap();
        // timed mode never sleeps between packets
        assert!(start.elapsed() < Duration::from_millis(400));
        drop(tx);
        let stamps: Vec<TimeSpec> = rx
            .iter()
            .filter_map(|m| match m {
                Message::Data { timestamp, .. } => timestamp,
                Message::Eof => None,
            })
            .collect();
        assert_eq!(stamps, vec![packet_time(t0, 0, 0.5), packet_time(t0, 1, 0.5), packet_time(t0, 2, 0.5)]);
    }

    #[test]
    fn send_fails_when_source_gone() {
        let (tx, rx) = unbounded();
        drop(rx);
        let q = QueueConfig {
            data_file: PathBuf::new(),
            num: 1,
            gap: 0.0,
            timed: false,
            max_read_bytes: 0,
            grace: Duration::ZERO,
        };
        assert!(matches!(
            send_packets(&tx, vec![].into(), &q, None),
            Err(TxError::Disconnected(_))
        ));
    }

    #[test]
    fn payload_read_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = payload_file(dir.path(), 100);
        assert_eq!(read_payload(&path, 16).unwrap().len(), 16);
        assert_eq!(read_payload(&path, 1_000_000).unwrap().len(), 800);
    }

    #[test]
    fn five_packets_to_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = queue_cfg(payload_file(dir.path(), 16), 5, 0.01, false);
        let (dev, rec) = FakeDevice::new(1);

        let start = Instant::now();
        let summary = run(&cfg, |_, nchan| {
            assert_eq!(nchan, 1);
            Ok(Box::new(dev) as Box<dyn TxDevice>)
        })
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(
            summary,
            TxSummary {
                sink: SinkKind::Usrp,
                packets: 5
            }
        );

        let rec = rec.lock().unwrap();
        assert!(rec.calls.contains(&Call::CenterFreq(2.45e9, 0)));
        assert!(rec.calls.contains(&Call::Gain(15.75, 0)));
        assert_eq!(rec.sent.len(), 5);
        for s in &rec.sent {
            assert!(s.md.start_of_burst && s.md.end_of_burst);
            assert_eq!(s.md.time_spec, None);
            assert_eq!(s.samples[0].len(), 16);
            assert_eq!(s.samples[0][3], Sample::new(3.0, 1.0) * 0.1);
        }
    }

    #[test]
    fn timed_packets_carry_device_time() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = queue_cfg(payload_file(dir.path(), 4), 3, 0.02, true);
        let (dev, rec) = FakeDevice::new(1);
        let t0 = dev.now;
        run(&cfg, |_, _| Ok(Box::new(dev) as Box<dyn TxDevice>)).unwrap();

        let rec = rec.lock().unwrap();
        let stamps: Vec<_> = rec.sent.iter().map(|s| s.md.time_spec).collect();
        assert_eq!(
            stamps,
            (0..3).map(|i| Some(packet_time(t0, i, 0.02))).collect::<Vec<_>>()
        );
    }

    #[test]
    fn queue_to_null_sink_without_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = queue_cfg(payload_file(dir.path(), 4), 2, 0.0, true);
        cfg.tx_freq = None;
        let summary = run(&cfg, |_, _| panic!("no device should be opened")).unwrap();
        assert_eq!(summary.sink, SinkKind::Null);
        assert_eq!(summary.packets, 2);
    }

    #[test]
    fn mimo_external_runs_until_files_end() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        let x: Vec<Sample> = (0..1000).map(|i| Sample::new(i as f32, 0.0)).collect();
        std::fs::write(&a, samples_as_u8(&x)).unwrap();
        std::fs::write(&b, samples_as_u8(&x)).unwrap();

        let cfg = TxConfig {
            bandwidth: 0.5e6,
            tx_freq: Some(915e6),
            to_file: None,
            channels: vec![
                ChannelConfig {
                    amplitude: 0.1,
                    gain: None,
                },
                ChannelConfig {
                    amplitude: 0.2,
                    gain: None,
                },
            ],
            source: SourceConfig::Files {
                paths: vec![a, b],
                repeat: 1,
            },
            device: DeviceConfig {
                args: "addr0=192.168.10.2, addr1=192.168.20.2".into(),
                spec: None,
                antenna: None,
                sync: SyncMode::External,
            },
            delay: Some(0),
            verbose: true,
            log: false,
        };
        let (dev, rec) = FakeDevice::new(2);
        let summary = run(&cfg, |_, _| Ok(Box::new(dev) as Box<dyn TxDevice>)).unwrap();
        assert_eq!(summary.packets, 0);

        let rec = rec.lock().unwrap();
        assert!(rec.calls.contains(&Call::ClockSource("external".into(), 0)));
        assert!(rec.calls.contains(&Call::ClockSource("external".into(), 1)));
        assert!(!rec.calls.contains(&Call::ClockSource("mimo".into(), 1)));
        let total: usize = rec.sent.iter().map(|s| s.samples[0].len()).sum();
        assert_eq!(total, 1000);
        assert!(rec.sent.last().unwrap().md.end_of_burst);
    }

    #[test]
    fn device_open_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = queue_cfg(payload_file(dir.path(), 4), 1, 0.0, false);
        let err = run(&cfg, |_, _| Err(TxError::Device("no USRP found".into()))).unwrap_err();
        assert!(matches!(err, TxError::Device(_)));
    }
}
