use crate::error::{Result, TxError};

/// Switch the calling thread to SCHED_FIFO at the middle of the allowed priority range.
/// Threads spawned afterwards inherit the policy.
#[cfg(unix)]
pub fn enable_realtime_scheduling() -> Result<()> {
    unsafe {
        let policy = libc::SCHED_FIFO;
        let max = libc::sched_get_priority_max(policy);
        let min = libc::sched_get_priority_min(policy);
        if max < 0 || min < 0 {
            return Err(TxError::Scheduling("SCHED_FIFO not supported".to_string()));
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = mid_priority(min, max);
        match libc::pthread_setschedparam(libc::pthread_self(), policy, &param) {
            0 => Ok(()),
            libc::EPERM => Err(TxError::Scheduling("no privileges".to_string())),
            e => Err(TxError::Scheduling(
                std::io::Error::from_raw_os_error(e).to_string(),
            )),
        }
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn mid_priority(min: i32, max: i32) -> i32 {
    min + (max - min) / 2
}

#[cfg(not(unix))]
pub fn enable_realtime_scheduling() -> Result<()> {
    Err(TxError::Scheduling("not supported on this platform".to_string()))
}
