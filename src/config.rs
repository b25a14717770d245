//! Command-line options of the three transmit programs and the configuration record they produce.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser};

use crate::{
    error::{Result, TxError},
    pipeline::SinkKind,
    utils::{parse_eng_count, parse_eng_float},
};

pub const DEFAULT_MIMO_ARGS: &str = "addr0=192.168.10.2, addr1=192.168.20.2";
pub const MAX_READ_BYTES: usize = 1_000_000;
pub const EOF_GRACE: Duration = Duration::from_secs(1);

/// Clock/time distribution between the boards of a multi-board device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Leave the device's clock and time sources alone
    Default,
    /// Board 0 is the timing master and feeds clock and time over the MIMO cable
    Mimo,
    /// Both boards take an external reference; board 1 takes time over the MIMO cable
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub args: String,
    pub spec: Option<String>,
    pub antenna: Option<String>,
    pub sync: SyncMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Linear scale applied to every sample
    pub amplitude: f32,
    /// Gain in dB; `None` selects the midpoint of the device range
    pub gain: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub data_file: PathBuf,
    pub num: usize,
    /// Seconds between packets
    pub gap: f64,
    /// Stamp packets with future device times instead of sleeping
    pub timed: bool,
    pub max_read_bytes: usize,
    pub grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    /// One sample file per channel, played `repeat` times
    Files { paths: Vec<PathBuf>, repeat: usize },
    Queue(QueueConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxConfig {
    pub bandwidth: f64,
    pub tx_freq: Option<f64>,
    pub to_file: Option<PathBuf>,
    pub channels: Vec<ChannelConfig>,
    pub source: SourceConfig,
    pub device: DeviceConfig,
    /// Samples of delay inserted before the sink, `None` for no delay stage
    pub delay: Option<usize>,
    pub verbose: bool,
    /// Tap each channel after scaling into `mimo_<ch>.dat`
    pub log: bool,
}

impl TxConfig {
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn sink_kind(&self) -> SinkKind {
        SinkKind::select(self.tx_freq, self.to_file.as_deref())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Transmit two sample files through a MIMO pair", long_about = None)]
pub struct MimoFileArgs {
    /// Sample file for channel A
    #[clap(long = "from-file-a", value_name = "FILE")]
    pub from_file_a: Option<PathBuf>,

    /// Sample file for channel B (same length as channel A)
    #[clap(long = "from-file-b", value_name = "FILE")]
    pub from_file_b: Option<PathBuf>,

    #[clap(short = 'v', long)]
    pub verbose: bool,

    /// Write the scaled samples of each channel to mimo_a.dat and mimo_b.dat
    #[clap(short = 'l', long)]
    pub log: bool,

    /// Sample rate and per-channel bandwidth in Hz
    #[clap(short = 'W', long, default_value = "0.5e6", value_parser = parse_eng_float)]
    pub bandwidth: f64,

    #[clap(long = "tx-amplitude-a", default_value = "0.1", value_parser = parse_eng_float)]
    pub tx_amplitude_a: f64,

    #[clap(long = "tx-amplitude-b", default_value = "0.2", value_parser = parse_eng_float)]
    pub tx_amplitude_b: f64,

    /// Number of passes over the input files
    #[clap(short = 'N', long, default_value_t = 1)]
    pub num: usize,

    /// UHD device address args
    #[clap(short = 'a', long, default_value = DEFAULT_MIMO_ARGS)]
    pub args: String,

    /// Subdevice of UHD device where appropriate
    #[clap(long)]
    pub spec: Option<String>,

    #[clap(short = 'A', long)]
    pub antenna: Option<String>,

    /// Transmit frequency in Hz; selects the hardware sink
    #[clap(long = "tx-freq", value_name = "FREQ", value_parser = parse_eng_float)]
    pub tx_freq: Option<f64>,

    /// Channel A gain in dB (default is midpoint)
    #[clap(long = "tx-gain-a", value_parser = parse_eng_float)]
    pub tx_gain_a: Option<f64>,

    /// Channel B gain in dB (default is midpoint)
    #[clap(long = "tx-gain-b", value_parser = parse_eng_float)]
    pub tx_gain_b: Option<f64>,

    /// Use external reference clock and PPS instead of the MIMO cable
    #[clap(long)]
    pub external: bool,
}

impl MimoFileArgs {
    pub fn into_config(self) -> Result<TxConfig> {
        let (Some(a), Some(b)) = (self.from_file_a, self.from_file_b) else {
            return Err(TxError::Usage(
                "You must identify two files (equal length) with --from-file-a and --from-file-b"
                    .to_string(),
            ));
        };
        Ok(TxConfig {
            bandwidth: self.bandwidth,
            tx_freq: self.tx_freq,
            to_file: None,
            channels: vec![
                ChannelConfig {
                    amplitude: self.tx_amplitude_a as f32,
                    gain: self.tx_gain_a,
                },
                ChannelConfig {
                    amplitude: self.tx_amplitude_b as f32,
                    gain: self.tx_gain_b,
                },
            ],
            source: SourceConfig::Files {
                paths: vec![a, b],
                repeat: self.num,
            },
            device: DeviceConfig {
                args: self.args,
                spec: self.spec,
                antenna: self.antenna,
                sync: if self.external {
                    SyncMode::External
                } else {
                    SyncMode::Mimo
                },
            },
            delay: Some(0),
            verbose: self.verbose,
            log: self.log,
        })
    }
}

/// Transmitter options shared by the single-channel programs.
#[derive(Args, Debug)]
pub struct UhdTxArgs {
    /// UHD device address args
    #[clap(short = 'a', long, default_value = "")]
    pub args: String,

    /// Subdevice of UHD device where appropriate
    #[clap(long)]
    pub spec: Option<String>,

    /// Select TX antenna where appropriate
    #[clap(short = 'A', long)]
    pub antenna: Option<String>,

    /// Transmit frequency in Hz; selects the hardware sink
    #[clap(long = "tx-freq", value_name = "FREQ", value_parser = parse_eng_float)]
    pub tx_freq: Option<f64>,

    /// Transmit gain in dB (default is midpoint)
    #[clap(long = "tx-gain", value_parser = parse_eng_float)]
    pub tx_gain: Option<f64>,

    #[clap(short = 'v', long)]
    pub verbose: bool,
}

impl UhdTxArgs {
    fn device(&self) -> DeviceConfig {
        DeviceConfig {
            args: self.args.clone(),
            spec: self.spec.clone(),
            antenna: self.antenna.clone(),
            sync: SyncMode::Default,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Transmit a complex sample file", long_about = None)]
pub struct RawFileArgs {
    /// Number of passes over the data file
    #[clap(short = 'n', long, default_value = "1", value_parser = parse_eng_count)]
    pub num: usize,

    /// Complex input file for transmission
    #[clap(long = "data-file", value_name = "FILE")]
    pub data_file: Option<PathBuf>,

    /// Output file for samples instead of hardware
    #[clap(long = "to-file", value_name = "FILE")]
    pub to_file: Option<PathBuf>,

    #[clap(short = 'W', long, default_value = "4e6", value_parser = parse_eng_float)]
    pub bandwidth: f64,

    /// Gain factor for complex baseband floats
    #[clap(long, default_value = "1", value_parser = parse_eng_float)]
    pub amp: f64,

    #[command(flatten)]
    pub uhd: UhdTxArgs,
}

impl RawFileArgs {
    pub fn into_config(self) -> Result<TxConfig> {
        let Some(data_file) = self.data_file else {
            return Err(TxError::Usage("You must specify data file".to_string()));
        };
        Ok(TxConfig {
            bandwidth: self.bandwidth,
            tx_freq: self.uhd.tx_freq,
            to_file: self.to_file,
            channels: vec![ChannelConfig {
                amplitude: self.amp as f32,
                gain: self.uhd.tx_gain,
            }],
            source: SourceConfig::Files {
                paths: vec![data_file],
                repeat: self.num,
            },
            device: self.uhd.device(),
            delay: None,
            verbose: self.uhd.verbose,
            log: false,
        })
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Transmit a file payload as queued packets", long_about = None)]
pub struct MsgqArgs {
    /// Number of packets
    #[clap(short = 'n', long, default_value = "1", value_parser = parse_eng_count)]
    pub num: usize,

    /// Seconds between packets
    #[clap(short = 'g', long, default_value = "0.005", value_parser = parse_eng_float)]
    pub gap: f64,

    /// Complex input file for transmission
    #[clap(long = "data-file", value_name = "FILE")]
    pub data_file: Option<PathBuf>,

    /// Output file for samples instead of hardware
    #[clap(long = "to-file", value_name = "FILE")]
    pub to_file: Option<PathBuf>,

    #[clap(short = 'W', long, default_value = "4e6", value_parser = parse_eng_float)]
    pub bandwidth: f64,

    /// Gain factor for complex baseband floats
    #[clap(long, default_value = "0.1", value_parser = parse_eng_float)]
    pub amp: f64,

    /// Timed transmission: stamp each packet with a future device time
    #[clap(long)]
    pub time: bool,

    #[command(flatten)]
    pub uhd: UhdTxArgs,
}

impl MsgqArgs {
    pub fn into_config(self) -> Result<TxConfig> {
        let Some(data_file) = self.data_file else {
            return Err(TxError::Usage("You must specify data file".to_string()));
        };
        if !self.gap.is_finite() || self.gap < 0.0 {
            return Err(TxError::Usage(format!(
                "gap must be a non-negative number of seconds, got {}",
                self.gap
            )));
        }
        Ok(TxConfig {
            bandwidth: self.bandwidth,
            tx_freq: self.uhd.tx_freq,
            to_file: self.to_file,
            channels: vec![ChannelConfig {
                amplitude: self.amp as f32,
                gain: self.uhd.tx_gain,
            }],
            source: SourceConfig::Queue(QueueConfig {
                data_file,
                num: self.num,
                gap: self.gap,
                timed: self.time,
                max_read_bytes: MAX_READ_BYTES,
                grace: EOF_GRACE,
            }),
            device: self.uhd.device(),
            delay: None,
            verbose: self.uhd.verbose,
            log: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mimo_defaults() {
        let cfg = MimoFileArgs::try_parse_from(["mimo_file_tx", "--from-file-a", "a.dat", "--from-file-b", "b.dat"])
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(cfg.bandwidth, 0.5e6);
        assert_eq!(cfg.tx_freq, None);
        assert_eq!(cfg.channels[0], ChannelConfig { amplitude: 0.1, gain: None });
        assert_eq!(cfg.channels[1], ChannelConfig { amplitude: 0.2, gain: None });
        assert_eq!(cfg.device.args, DEFAULT_MIMO_ARGS);
        assert_eq!(cfg.device.sync, SyncMode::Mimo);
        assert_eq!(cfg.delay, Some(0));
        assert_eq!(
            cfg.source,
            SourceConfig::Files {
                paths: vec!["a.dat".into(), "b.dat".into()],
                repeat: 1
            }
        );
        assert!(!cfg.verbose && !cfg.log);
    }

    #[test]
    fn mimo_external_and_gains() {
        let cfg = MimoFileArgs::try_parse_from([
            "mimo_file_tx",
            "--from-file-a",
            "a.dat",
            "--from-file-b",
            "b.dat",
            "--tx-freq",
            "915M",
            "--tx-gain-a",
            "10",
            "--tx-gain-b",
            "12.5",
            "--external",
        ])
        .unwrap()
        .into_config()
        .unwrap();
        assert_eq!(cfg.tx_freq, Some(915e6));
        assert_eq!(cfg.device.sync, SyncMode::External);
        assert_eq!(cfg.channels[0].gain, Some(10.0));
        assert_eq!(cfg.channels[1].gain, Some(12.5));
        assert_eq!(cfg.sink_kind(), SinkKind::Usrp);
    }

    #[test]
    fn mimo_needs_both_files() {
        let err = MimoFileArgs::try_parse_from(["mimo_file_tx", "--from-file-a", "a.dat"])
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn msgq_defaults() {
        let cfg = MsgqArgs::try_parse_from(["raw_msgqtx", "--data-file", "payload.bin"])
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(cfg.bandwidth, 4e6);
        assert_eq!(cfg.channels, vec![ChannelConfig { amplitude: 0.1, gain: None }]);
        assert_eq!(cfg.device.args, "");
        assert_eq!(cfg.device.sync, SyncMode::Default);
        assert_eq!(cfg.delay, None);
        assert_eq!(cfg.sink_kind(), SinkKind::Null);
        let SourceConfig::Queue(q) = cfg.source else {
            panic!("expected a queue source");
        };
        assert_eq!(q.num, 1);
        assert_eq!(q.gap, 0.005);
        assert!(!q.timed);
        assert_eq!(q.max_read_bytes, MAX_READ_BYTES);
        assert_eq!(q.grace, EOF_GRACE);
    }

    #[test]
    fn msgq_scenario_flags() {
        let cfg = MsgqArgs::try_parse_from([
            "raw_msgqtx",
            "--data-file",
            "payload.bin",
            "--tx-freq",
            "2.45e9",
            "--num",
            "5",
            "--gap",
            "0.01",
            "--time",
            "-A",
            "TX/RX",
        ])
        .unwrap()
        .into_config()
        .unwrap();
        assert_eq!(cfg.tx_freq, Some(2.45e9));
        assert_eq!(cfg.device.antenna.as_deref(), Some("TX/RX"));
        let SourceConfig::Queue(q) = cfg.source else {
            panic!("expected a queue source");
        };
        assert_eq!((q.num, q.gap, q.timed), (5, 0.01, true));
    }

    #[test]
    fn missing_data_file_is_usage_error() {
        let err = MsgqArgs::try_parse_from(["raw_msgqtx", "--num", "3"])
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "You must specify data file");

        let err = RawFileArgs::try_parse_from(["raw_filetx"])
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn negative_gap_rejected() {
        let err = MsgqArgs::try_parse_from(["raw_msgqtx", "--data-file", "p.bin", "--gap=-1"])
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn raw_file_to_file() {
        let cfg = RawFileArgs::try_parse_from(["raw_filetx", "--data-file", "in.dat", "--to-file", "out.dat", "--amp", "0.5"])
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(cfg.sink_kind(), SinkKind::File);
        assert_eq!(cfg.channels[0].amplitude, 0.5);
        assert_eq!(cfg.bandwidth, 4e6);
    }
}
