use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    config::{DeviceConfig, SyncMode, TxConfig},
    error::{Result, TxError},
    payload::TimeSpec,
    utils::eng_format,
    Sample,
};

/// Reference source names understood by the device layer.
pub const SRC_INTERNAL: &str = "internal";
pub const SRC_EXTERNAL: &str = "external";
pub const SRC_MIMO: &str = "mimo";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRange {
    pub start: f64,
    pub stop: f64,
}

impl GainRange {
    pub fn midpoint(&self) -> f64 {
        (self.start + self.stop) / 2.0
    }
}

/// Per-send burst framing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TxMetadata {
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    pub time_spec: Option<TimeSpec>,
}

/// Hardware transmitter. Clock and time sources are per motherboard; with one channel per board
/// (address-pair device args) board and channel indices coincide.
pub trait TxDevice: Send {
    fn num_channels(&self) -> usize;

    fn set_clock_source(&mut self, source: &str, mboard: usize) -> Result<()>;
    fn set_time_source(&mut self, source: &str, mboard: usize) -> Result<()>;
    fn set_subdev_spec(&mut self, spec: &str) -> Result<()>;

    fn set_samp_rate(&mut self, rate: f64) -> Result<()>;
    fn set_center_freq(&mut self, freq: f64, chan: usize) -> Result<()>;
    fn set_bandwidth(&mut self, bandwidth: f64, chan: usize) -> Result<()>;
    fn set_antenna(&mut self, antenna: &str, chan: usize) -> Result<()>;

    fn gain_range(&self, chan: usize) -> Result<GainRange>;
    fn set_gain(&mut self, gain: f64, chan: usize) -> Result<()>;

    fn time_now(&self) -> Result<TimeSpec>;

    /// Send one buffer per channel; all buffers hold the same number of samples.
    fn send(&mut self, buffs: &[&[Sample]], md: &TxMetadata) -> Result<usize>;
}

/// The device as shared by the sink stage and the driver (which reads device time).
#[derive(Clone)]
pub struct SharedDevice(Arc<Mutex<Box<dyn TxDevice>>>);

impl SharedDevice {
    pub fn new(dev: Box<dyn TxDevice>) -> Self {
        Self(Arc::new(Mutex::new(dev)))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn TxDevice>>> {
        self.0
            .lock()
            .map_err(|_| TxError::Device("device lock poisoned".to_string()))
    }
}

/// Open the hardware transmitter described by `cfg` with `nchan` channels.
#[cfg(feature = "uhd")]
pub fn open_device(cfg: &DeviceConfig, nchan: usize) -> Result<Box<dyn TxDevice>> {
    Ok(Box::new(crate::uhd::UhdDevice::open(&cfg.args, nchan)?))
}

#[cfg(not(feature = "uhd"))]
pub fn open_device(cfg: &DeviceConfig, _nchan: usize) -> Result<Box<dyn TxDevice>> {
    Err(TxError::Device(format!(
        "cannot open '{}': built without UHD support (enable the `uhd` feature)",
        cfg.args
    )))
}

fn apply_sync(dev: &mut dyn TxDevice, sync: SyncMode) -> Result<()> {
    match sync {
        SyncMode::Default => {}
        SyncMode::External => {
            dev.set_clock_source(SRC_EXTERNAL, 0)?;
            dev.set_clock_source(SRC_EXTERNAL, 1)?;
            dev.set_time_source(SRC_INTERNAL, 0)?;
            dev.set_time_source(SRC_MIMO, 1)?;
        }
        SyncMode::Mimo => {
            dev.set_clock_source(SRC_INTERNAL, 0)?;
            dev.set_clock_source(SRC_MIMO, 1)?;
            dev.set_time_source(SRC_INTERNAL, 0)?;
            dev.set_time_source(SRC_MIMO, 1)?;
        }
    }
    Ok(())
}

/// Apply synchronization, rate, tuning and gain settings. Returns the gain set on each channel.
pub fn configure(dev: &mut dyn TxDevice, cfg: &TxConfig) -> Result<Vec<f64>> {
    let nchan = cfg.num_channels();
    if dev.num_channels() < nchan {
        return Err(TxError::Device(format!(
            "device has {} channels, {} needed",
            dev.num_channels(),
            nchan
        )));
    }
    let freq = cfg
        .tx_freq
        .ok_or_else(|| TxError::Config("hardware sink without a transmit frequency".to_string()))?;

    apply_sync(dev, cfg.device.sync)?;
    if let Some(ref spec) = cfg.device.spec {
        dev.set_subdev_spec(spec)?;
    }
    dev.set_samp_rate(cfg.bandwidth)?;
    for chan in 0..nchan {
        dev.set_center_freq(freq, chan)?;
        dev.set_bandwidth(cfg.bandwidth, chan)?;
        if let Some(ref ant) = cfg.device.antenna {
            dev.set_antenna(ant, chan)?;
        }
    }

    let gains = if cfg.channels.iter().any(|c| c.gain.is_none()) {
        // no gain given for some channel: put every channel at the midpoint
        let g = dev.gain_range(0)?;
        let mid = g.midpoint();
        println!();
        println!("No gain specified.");
        println!("Setting gain to {:.6} (from [{:.6}, {:.6}])", mid, g.start, g.stop);
        vec![mid; nchan]
    } else {
        cfg.channels.iter().filter_map(|c| c.gain).collect()
    };
    for (chan, &gain) in gains.iter().enumerate() {
        dev.set_gain(gain, chan)?;
    }
    log::debug!("device configured: freq={freq} rate={} gains={gains:?}", cfg.bandwidth);
    Ok(gains)
}

pub fn print_banner(cfg: &DeviceConfig, tx_freq: f64, bandwidth: f64, gains: &[f64]) {
    println!();
    for line in banner_lines(cfg, tx_freq, bandwidth, gains) {
        println!("{line}");
    }
}

fn banner_lines(cfg: &DeviceConfig, tx_freq: f64, bandwidth: f64, gains: &[f64]) -> Vec<String> {
    let gains: Vec<_> = gains.iter().map(|g| format!("{g:.6}")).collect();
    let mut lines = vec![
        "UHD Transmitter:".to_string(),
        format!("UHD Args:    {}", cfg.args),
        format!("Freq:        {}Hz", eng_format(tx_freq)),
        format!("Gain:        {} dB", gains.join(" ")),
        format!("Sample Rate: {}sps", eng_format(bandwidth)),
        format!("Antenna:     {}", cfg.antenna.as_deref().unwrap_or("None")),
        format!("Subdev Sec: {}", cfg.spec.as_deref().unwrap_or("None")),
    ];
    if cfg.sync == SyncMode::External {
        lines.push("Using external Ref Clock and PPS".to_string());
    }
    lines
}

/// In-memory device that records every call, for tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        ClockSource(String, usize),
        TimeSource(String, usize),
        SubdevSpec(String),
        SampRate(f64),
        CenterFreq(f64, usize),
        Bandwidth(f64, usize),
        Antenna(String, usize),
        Gain(f64, usize),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Sent {
        pub samples: Vec<Vec<Sample>>,
        pub md: TxMetadata,
    }

    #[derive(Default)]
    pub struct Record {
        pub calls: Vec<Call>,
        pub sent: Vec<Sent>,
    }

    pub struct FakeDevice {
        pub nchan: usize,
        pub range: GainRange,
        pub now: TimeSpec,
        pub reject_rate: bool,
        /// Accept at most this many samples per channel in one `send`.
        pub max_per_send: Option<usize>,
        pub record: Arc<Mutex<Record>>,
    }

    impl FakeDevice {
        pub fn new(nchan: usize) -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            (
                Self {
                    nchan,
                    range: GainRange {
                        start: 0.0,
                        stop: 31.5,
                    },
                    now: TimeSpec::new(1000, 0.25),
                    reject_rate: false,
                    max_per_send: None,
                    record: Arc::clone(&record),
                },
                record,
            )
        }

        fn call(&self, c: Call) -> Result<()> {
            self.record.lock().unwrap().calls.push(c);
            Ok(())
        }
    }

    impl TxDevice for FakeDevice {
        fn num_channels(&self) -> usize {
            self.nchan
        }
        fn set_clock_source(&mut self, source: &str, mboard: usize) -> Result<()> {
            self.call(Call::ClockSource(source.into(), mboard))
        }
        fn set_time_source(&mut self, source: &str, mboard: usize) -> Result<()> {
            self.call(Call::TimeSource(source.into(), mboard))
        }
        fn set_subdev_spec(&mut self, spec: &str) -> Result<()> {
            self.call(Call::SubdevSpec(spec.into()))
        }
        fn set_samp_rate(&mut self, rate: f64) -> Result<()> {
            if self.reject_rate {
                return Err(TxError::Device(format!("rate {rate} out of range")));
            }
            self.call(Call::SampRate(rate))
        }
        fn set_center_freq(&mut self, freq: f64, chan: usize) -> Result<()> {
            self.call(Call::CenterFreq(freq, chan))
        }
        fn set_bandwidth(&mut self, bandwidth: f64, chan: usize) -> Result<()> {
            self.call(Call::Bandwidth(bandwidth, chan))
        }
        fn set_antenna(&mut self, antenna: &str, chan: usize) -> Result<()> {
            self.call(Call::Antenna(antenna.into(), chan))
        }
        fn gain_range(&self, _chan: usize) -> Result<GainRange> {
            Ok(self.range)
        }
        fn set_gain(&mut self, gain: f64, chan: usize) -> Result<()> {
            self.call(Call::Gain(gain, chan))
        }
        fn time_now(&self) -> Result<TimeSpec> {
            Ok(self.now)
        }
        fn send(&mut self, buffs: &[&[Sample]], md: &TxMetadata) -> Result<usize> {
            let mut n = buffs.first().map(|b| b.len()).unwrap_or(0);
            if let Some(max) = self.max_per_send {
                n = n.min(max);
            }
            self.record.lock().unwrap().sent.push(Sent {
                samples: buffs.iter().map(|b| b[..n].to_vec()).collect(),
                md: *md,
            });
            Ok(n)
        }
    }
}
