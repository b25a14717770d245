//! Error type shared by the option parser, pipeline, device layer and driver.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxError {
    /// Missing or inconsistent command-line arguments
    #[error("{0}")]
    Usage(String),

    /// Rejected by the hardware-abstraction layer
    #[error("device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel input files do not hold the same number of samples
    #[error(
        "input files differ in length: {} has {a_len} bytes, {} has {b_len} bytes",
        a.display(),
        b.display()
    )]
    LengthMismatch {
        a: PathBuf,
        a_len: u64,
        b: PathBuf,
        b_len: u64,
    },

    /// One channel ran dry (or delivered a shorter block) while another still had samples
    #[error("channel {0} underrun while other channels still carry samples")]
    ChannelUnderrun(usize),

    #[error("stage '{0}' disconnected")]
    Disconnected(String),

    #[error("real-time scheduling unavailable: {0}")]
    Scheduling(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TxError>,
    },
}

impl TxError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        TxError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for errors caused by the user's command line rather than the device or filesystem
    pub fn is_usage(&self) -> bool {
        match self {
            TxError::Usage(_) => true,
            TxError::WithContext { source, .. } => source.is_usage(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
