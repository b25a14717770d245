use std::sync::Arc;

use lockfree_object_pool::{LinearObjectPool, LinearOwnedReusable};

use crate::Sample;

/// Device time: whole seconds plus fractional seconds in [0, 1).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeSpec {
    pub full_secs: i64,
    pub frac_secs: f64,
}

impl TimeSpec {
    pub fn new(full_secs: i64, frac_secs: f64) -> Self {
        Self {
            full_secs,
            frac_secs: 0.0,
        }
        .offset(frac_secs)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    /// Shift by `dt` seconds, keeping the whole part exact.
    pub fn offset(self, dt: f64) -> Self {
        let frac = self.frac_secs + dt;
        let whole = frac.floor();
        Self {
            full_secs: self.full_secs + whole as i64,
            frac_secs: frac - whole,
        }
    }
}

/// Envelope handed to the message-queue source.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data {
        payload: Arc<[u8]>,
        timestamp: Option<TimeSpec>,
    },
    /// No more messages follow
    Eof,
}

impl Message {
    pub fn data(payload: Arc<[u8]>, timestamp: Option<TimeSpec>) -> Self {
        Message::Data { payload, timestamp }
    }
}

pub type SamplePool = Arc<LinearObjectPool<Vec<Sample>>>;

pub fn sample_pool(capacity: usize) -> SamplePool {
    Arc::new(LinearObjectPool::new(
        move || Vec::with_capacity(capacity),
        |v| {
            v.clear();
        },
    ))
}

/// Unit of work passed between pipeline stages.
pub struct Block {
    pub samples: LinearOwnedReusable<Vec<Sample>>,
    /// Scheduled transmit time of the first sample
    pub tx_time: Option<TimeSpec>,
    /// Last block of a burst
    pub end_of_burst: bool,
}

impl Block {
    pub fn new(samples: LinearOwnedReusable<Vec<Sample>>) -> Self {
        Self {
            samples,
            tx_time: None,
            end_of_burst: false,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_split() {
        let t = TimeSpec::new(11, 1.25);
        assert_eq!(t.full_secs, 12);
        assert!((t.frac_secs - 0.25).abs() < 1e-12);
        assert!((t.as_secs_f64() - 12.25).abs() < 1e-12);
    }

    #[test]
    fn offset_carries_into_whole_seconds() {
        let t = TimeSpec::new(100, 0.95).offset(0.1);
        assert_eq!(t.full_secs, 101);
        assert!((t.frac_secs - 0.05).abs() < 1e-9);

        let t = TimeSpec::new(100, 0.05).offset(-0.1);
        assert_eq!(t.full_secs, 99);
        assert!((t.frac_secs - 0.95).abs() < 1e-9);
    }

    #[test]
    fn pooled_blocks_come_back_empty() {
        let pool = sample_pool(16);
        {
            let mut b = Block::new(pool.pull_owned());
            b.samples.push(Sample::new(1.0, 1.0));
            assert_eq!(b.len(), 1);
        }
        let b = Block::new(pool.pull_owned());
        assert!(b.is_empty());
    }
}
