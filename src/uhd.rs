//! Transmit backend on the UHD C API.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;

use crate::{
    error::{Result, TxError},
    payload::TimeSpec,
    sdr::{GainRange, TxDevice, TxMetadata},
    Sample,
};

type UhdError = c_int;
const UHD_ERROR_NONE: UhdError = 0;

type UhdUsrpHandle = *mut c_void;
type UhdTxStreamerHandle = *mut c_void;
type UhdTxMetadataHandle = *mut c_void;
type UhdMetaRangeHandle = *mut c_void;
type UhdSubdevSpecHandle = *mut c_void;

const UHD_TUNE_REQUEST_POLICY_AUTO: c_int = 65;
const ALL_MBOARDS: usize = usize::MAX;
const SEND_TIMEOUT: c_double = 10.0;

#[repr(C)]
struct UhdTuneRequest {
    target_freq: c_double,
    rf_freq_policy: c_int,
    rf_freq: c_double,
    dsp_freq_policy: c_int,
    dsp_freq: c_double,
    args: *mut c_char,
}

#[repr(C)]
#[derive(Default)]
struct UhdTuneResult {
    clipped_rf_freq: c_double,
    target_rf_freq: c_double,
    actual_rf_freq: c_double,
    target_dsp_freq: c_double,
    actual_dsp_freq: c_double,
}

#[repr(C)]
struct UhdStreamArgs {
    cpu_format: *mut c_char,
    otw_format: *mut c_char,
    args: *mut c_char,
    channel_list: *mut usize,
    n_channels: c_int,
}

unsafe extern "C" {
    fn uhd_get_last_error(error_out: *mut c_char, strbuffer_len: usize) -> UhdError;

    fn uhd_usrp_make(h: *mut UhdUsrpHandle, args: *const c_char) -> UhdError;
    fn uhd_usrp_free(h: *mut UhdUsrpHandle) -> UhdError;
    fn uhd_usrp_get_tx_num_channels(h: UhdUsrpHandle, num_channels_out: *mut usize) -> UhdError;
    fn uhd_usrp_set_clock_source(h: UhdUsrpHandle, clock_source: *const c_char, mboard: usize) -> UhdError;
    fn uhd_usrp_set_time_source(h: UhdUsrpHandle, time_source: *const c_char, mboard: usize) -> UhdError;
    fn uhd_usrp_get_time_now(
        h: UhdUsrpHandle,
        mboard: usize,
        full_secs_out: *mut i64,
        frac_secs_out: *mut c_double,
    ) -> UhdError;
    fn uhd_usrp_set_tx_subdev_spec(h: UhdUsrpHandle, subdev_spec: UhdSubdevSpecHandle, mboard: usize) -> UhdError;
    fn uhd_usrp_set_tx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_set_tx_freq(
        h: UhdUsrpHandle,
        tune_request: *mut UhdTuneRequest,
        chan: usize,
        tune_result: *mut UhdTuneResult,
    ) -> UhdError;
    fn uhd_usrp_set_tx_bandwidth(h: UhdUsrpHandle, bandwidth: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_set_tx_antenna(h: UhdUsrpHandle, ant: *const c_char, chan: usize) -> UhdError;
    fn uhd_usrp_set_tx_gain(h: UhdUsrpHandle, gain: c_double, chan: usize, gain_name: *const c_char) -> UhdError;
    fn uhd_usrp_get_tx_gain_range(
        h: UhdUsrpHandle,
        name: *const c_char,
        chan: usize,
        gain_range_out: UhdMetaRangeHandle,
    ) -> UhdError;
    fn uhd_usrp_get_tx_stream(h: UhdUsrpHandle, stream_args: *mut UhdStreamArgs, h_out: UhdTxStreamerHandle) -> UhdError;

    fn uhd_subdev_spec_make(h: *mut UhdSubdevSpecHandle, markup: *const c_char) -> UhdError;
    fn uhd_subdev_spec_free(h: *mut UhdSubdevSpecHandle) -> UhdError;

    fn uhd_meta_range_make(h: *mut UhdMetaRangeHandle) -> UhdError;
    fn uhd_meta_range_free(h: *mut UhdMetaRangeHandle) -> UhdError;
    fn uhd_meta_range_start(h: UhdMetaRangeHandle, start_out: *mut c_double) -> UhdError;
    fn uhd_meta_range_stop(h: UhdMetaRangeHandle, stop_out: *mut c_double) -> UhdError;

    fn uhd_tx_streamer_make(h: *mut UhdTxStreamerHandle) -> UhdError;
    fn uhd_tx_streamer_free(h: *mut UhdTxStreamerHandle) -> UhdError;
    fn uhd_tx_streamer_send(
        h: UhdTxStreamerHandle,
        buffs: *mut *const c_void,
        samps_per_buff: usize,
        md: *mut UhdTxMetadataHandle,
        timeout: c_double,
        items_sent: *mut usize,
    ) -> UhdError;

    fn uhd_tx_metadata_make(
        handle: *mut UhdTxMetadataHandle,
        has_time_spec: bool,
        full_secs: i64,
        frac_secs: c_double,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> UhdError;
    fn uhd_tx_metadata_free(handle: *mut UhdTxMetadataHandle) -> UhdError;
}

fn check(err: UhdError, what: &str) -> Result<()> {
    if err == UHD_ERROR_NONE {
        return Ok(());
    }
    let mut buf = vec![0u8; 512];
    let detail = unsafe {
        uhd_get_last_error(buf.as_mut_ptr() as *mut c_char, buf.len());
        CStr::from_ptr(buf.as_ptr() as *const c_char)
            .to_string_lossy()
            .to_string()
    };
    Err(TxError::Device(format!("{what} failed: error {err} {detail}")))
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| TxError::Device(format!("invalid string '{s}': {e}")))
}

/// One multi_usrp handle with a lazily created fc32 transmit streamer.
pub struct UhdDevice {
    usrp: UhdUsrpHandle,
    tx: Option<UhdTxStreamerHandle>,
    nchan: usize,
}

// multi_usrp and its streamers may be driven from any thread
unsafe impl Send for UhdDevice {}

impl UhdDevice {
    pub fn open(args: &str, nchan: usize) -> Result<Self> {
        let dev_args = c_string(args)?;
        let mut usrp: UhdUsrpHandle = ptr::null_mut();
        log::info!("opening USRP args='{args}'");
        check(unsafe { uhd_usrp_make(&mut usrp, dev_args.as_ptr()) }, "uhd_usrp_make")?;

        let mut dev = Self {
            usrp,
            tx: None,
            nchan: 0,
        };
        let mut avail = 0usize;
        check(
            unsafe { uhd_usrp_get_tx_num_channels(dev.usrp, &mut avail) },
            "uhd_usrp_get_tx_num_channels",
        )?;
        if avail < nchan {
            return Err(TxError::Device(format!(
                "'{args}' offers {avail} tx channels, {nchan} needed"
            )));
        }
        dev.nchan = nchan;
        Ok(dev)
    }

    fn streamer(&mut self) -> Result<UhdTxStreamerHandle> {
        if let Some(h) = self.tx {
            return Ok(h);
        }
        let mut h: UhdTxStreamerHandle = ptr::null_mut();
        check(unsafe { uhd_tx_streamer_make(&mut h) }, "uhd_tx_streamer_make")?;

        let cpu_fmt = c_string("fc32")?;
        let otw_fmt = c_string("sc16")?;
        let stream_args_str = c_string("")?;
        let mut channels: Vec<usize> = (0..self.nchan).collect();
        let mut stream_args = UhdStreamArgs {
            cpu_format: cpu_fmt.as_ptr() as *mut c_char,
            otw_format: otw_fmt.as_ptr() as *mut c_char,
            args: stream_args_str.as_ptr() as *mut c_char,
            channel_list: channels.as_mut_ptr(),
            n_channels: self.nchan as c_int,
        };
        let err = unsafe { uhd_usrp_get_tx_stream(self.usrp, &mut stream_args, h) };
        if let Err(e) = check(err, "uhd_usrp_get_tx_stream") {
            unsafe { uhd_tx_streamer_free(&mut h) };
            return Err(e);
        }
        self.tx = Some(h);
        Ok(h)
    }
}

impl Drop for UhdDevice {
    fn drop(&mut self) {
        unsafe {
            if let Some(mut h) = self.tx.take() {
                uhd_tx_streamer_free(&mut h);
            }
            uhd_usrp_free(&mut self.usrp);
        }
    }
}

impl TxDevice for UhdDevice {
    fn num_channels(&self) -> usize {
        self.nchan
    }

    fn set_clock_source(&mut self, source: &str, mboard: usize) -> Result<()> {
        let s = c_string(source)?;
        check(
            unsafe { uhd_usrp_set_clock_source(self.usrp, s.as_ptr(), mboard) },
            "uhd_usrp_set_clock_source",
        )
    }

    fn set_time_source(&mut self, source: &str, mboard: usize) -> Result<()> {
        let s = c_string(source)?;
        check(
            unsafe { uhd_usrp_set_time_source(self.usrp, s.as_ptr(), mboard) },
            "uhd_usrp_set_time_source",
        )
    }

    fn set_subdev_spec(&mut self, spec: &str) -> Result<()> {
        let markup = c_string(spec)?;
        let mut h: UhdSubdevSpecHandle = ptr::null_mut();
        check(unsafe { uhd_subdev_spec_make(&mut h, markup.as_ptr()) }, "uhd_subdev_spec_make")?;
        let r = check(
            unsafe { uhd_usrp_set_tx_subdev_spec(self.usrp, h, ALL_MBOARDS) },
            "uhd_usrp_set_tx_subdev_spec",
        );
        unsafe { uhd_subdev_spec_free(&mut h) };
        r
    }

    fn set_samp_rate(&mut self, rate: f64) -> Result<()> {
        for chan in 0..self.nchan {
            check(unsafe { uhd_usrp_set_tx_rate(self.usrp, rate, chan) }, "uhd_usrp_set_tx_rate")?;
        }
        Ok(())
    }

    fn set_center_freq(&mut self, freq: f64, chan: usize) -> Result<()> {
        let mut tune_req = UhdTuneRequest {
            target_freq: freq,
            rf_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
            rf_freq: 0.0,
            dsp_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
            dsp_freq: 0.0,
            args: ptr::null_mut(),
        };
        let mut tune_result = UhdTuneResult::default();
        check(
            unsafe { uhd_usrp_set_tx_freq(self.usrp, &mut tune_req, chan, &mut tune_result) },
            "uhd_usrp_set_tx_freq",
        )?;
        log::info!(
            "USRP ch{chan} tuned: RF={:.1} MHz, DSP={:.1} kHz",
            tune_result.actual_rf_freq / 1e6,
            tune_result.actual_dsp_freq / 1e3,
        );
        Ok(())
    }

    fn set_bandwidth(&mut self, bandwidth: f64, chan: usize) -> Result<()> {
        check(
            unsafe { uhd_usrp_set_tx_bandwidth(self.usrp, bandwidth, chan) },
            "uhd_usrp_set_tx_bandwidth",
        )
    }

    fn set_antenna(&mut self, antenna: &str, chan: usize) -> Result<()> {
        let ant = c_string(antenna)?;
        check(
            unsafe { uhd_usrp_set_tx_antenna(self.usrp, ant.as_ptr(), chan) },
            "uhd_usrp_set_tx_antenna",
        )
    }

    fn gain_range(&self, chan: usize) -> Result<GainRange> {
        let name = c_string("")?;
        let mut h: UhdMetaRangeHandle = ptr::null_mut();
        check(unsafe { uhd_meta_range_make(&mut h) }, "uhd_meta_range_make")?;
        let mut range = GainRange { start: 0.0, stop: 0.0 };
        let r = check(
            unsafe { uhd_usrp_get_tx_gain_range(self.usrp, name.as_ptr(), chan, h) },
            "uhd_usrp_get_tx_gain_range",
        )
        .and_then(|_| check(unsafe { uhd_meta_range_start(h, &mut range.start) }, "uhd_meta_range_start"))
        .and_then(|_| check(unsafe { uhd_meta_range_stop(h, &mut range.stop) }, "uhd_meta_range_stop"));
        unsafe { uhd_meta_range_free(&mut h) };
        r.map(|_| range)
    }

    fn set_gain(&mut self, gain: f64, chan: usize) -> Result<()> {
        let name = c_string("")?;
        check(
            unsafe { uhd_usrp_set_tx_gain(self.usrp, gain, chan, name.as_ptr()) },
            "uhd_usrp_set_tx_gain",
        )
    }

    fn time_now(&self) -> Result<TimeSpec> {
        let mut full: i64 = 0;
        let mut frac: c_double = 0.0;
        check(
            unsafe { uhd_usrp_get_time_now(self.usrp, 0, &mut full, &mut frac) },
            "uhd_usrp_get_time_now",
        )?;
        Ok(TimeSpec::new(full, frac))
    }

    fn send(&mut self, buffs: &[&[Sample]], md: &TxMetadata) -> Result<usize> {
        if buffs.len() != self.nchan {
            return Err(TxError::Device(format!(
                "{} buffers for {} channels",
                buffs.len(),
                self.nchan
            )));
        }
        let tx = self.streamer()?;
        let nsamp = buffs.first().map(|b| b.len()).unwrap_or(0);
        let mut ptrs: Vec<*const c_void> = buffs.iter().map(|b| b.as_ptr() as *const c_void).collect();
        let ts = md.time_spec.unwrap_or_default();

        let mut md_h: UhdTxMetadataHandle = ptr::null_mut();
        check(
            unsafe {
                uhd_tx_metadata_make(
                    &mut md_h,
                    md.time_spec.is_some(),
                    ts.full_secs,
                    ts.frac_secs,
                    md.start_of_burst,
                    md.end_of_burst,
                )
            },
            "uhd_tx_metadata_make",
        )?;
        let mut sent = 0usize;
        let r = check(
            unsafe { uhd_tx_streamer_send(tx, ptrs.as_mut_ptr(), nsamp, &mut md_h, SEND_TIMEOUT, &mut sent) },
            "uhd_tx_streamer_send",
        );
        unsafe { uhd_tx_metadata_free(&mut md_h) };
        r?;
        if sent < nsamp {
            log::warn!("USRP accepted {sent} of {nsamp} samples");
        }
        Ok(sent)
    }
}
