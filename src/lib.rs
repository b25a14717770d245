pub mod config;
pub mod driver;
pub mod error;
pub mod payload;
pub mod pipeline;
pub mod rt;
pub mod sdr;
pub mod utils;

#[cfg(feature = "uhd")]
pub mod uhd;

pub use error::{Result, TxError};

pub type Ftype = f32;
pub type Sample = num::Complex<Ftype>;
