use num::Complex;

use crate::Sample;

/// Raw byte view of a block of samples, in host byte order.
pub fn samples_as_u8(x: &[Sample]) -> &[u8] {
    // Complex<T> is repr(C) { re, im }, so a sample slice is a plain run of f32 pairs
    unsafe { std::slice::from_raw_parts(x.as_ptr() as *const u8, std::mem::size_of_val(x)) }
}

pub fn samples_as_mut_u8(x: &mut [Sample]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(x.as_mut_ptr() as *mut u8, std::mem::size_of_val(x)) }
}

/// Interpret raw interleaved f32 I/Q bytes as samples, appending to `out`.
/// A trailing partial sample is ignored; the count of converted samples is returned.
pub fn bytes_to_samples(bytes: &[u8], out: &mut Vec<Sample>) -> usize {
    let n = bytes.len() / SAMPLE_SIZE;
    out.extend(bytes.chunks_exact(SAMPLE_SIZE).map(|c| {
        let re = f32::from_ne_bytes([c[0], c[1], c[2], c[3]]);
        let im = f32::from_ne_bytes([c[4], c[5], c[6], c[7]]);
        Complex::new(re, im)
    }));
    n
}

pub const SAMPLE_SIZE: usize = std::mem::size_of::<Sample>();

const SUFFIXES: [(char, f64); 12] = [
    ('E', 1e18),
    ('P', 1e15),
    ('T', 1e12),
    ('G', 1e9),
    ('M', 1e6),
    ('k', 1e3),
    ('m', 1e-3),
    ('u', 1e-6),
    ('n', 1e-9),
    ('p', 1e-12),
    ('f', 1e-15),
    ('a', 1e-18),
];

/// Parse an engineering-notation number such as `2.45G`, `500k` or `4e6`.
pub fn parse_eng_float(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (num, scale) = match s.chars().last() {
        Some(c) => match SUFFIXES.iter().find(|(suffix, _)| *suffix == c) {
            Some(&(_, scale)) => (&s[..s.len() - c.len_utf8()], scale),
            None => (s, 1.0),
        },
        None => return Err("empty value".to_string()),
    };
    num.trim()
        .parse::<f64>()
        .map(|v| v * scale)
        .map_err(|e| format!("invalid engineering-notation value '{s}': {e}"))
}

/// Non-negative count in engineering notation (`1k` = 1000).
/// Fractions round up, so `0.5` still means one.
pub fn parse_eng_count(s: &str) -> Result<usize, String> {
    let v = parse_eng_float(s)?;
    if !v.is_finite() || v < 0.0 {
        return Err(format!("count must be a non-negative number, got '{s}'"));
    }
    Ok(v.ceil() as usize)
}

/// Format with an SI suffix and up to six significant digits, e.g. `2.45G`.
pub fn eng_format(x: f64) -> String {
    let m = x.abs();
    let (scale, suffix) = if m >= 1e12 {
        (1e-12, "T")
    } else if m >= 1e9 {
        (1e-9, "G")
    } else if m >= 1e6 {
        (1e-6, "M")
    } else if m >= 1e3 {
        (1e-3, "k")
    } else if m >= 1.0 {
        (1.0, "")
    } else if m >= 1e-3 {
        (1e3, "m")
    } else if m >= 1e-6 {
        (1e6, "u")
    } else if m >= 1e-9 {
        (1e9, "n")
    } else if m >= 1e-12 {
        (1e12, "p")
    } else if m >= 1e-15 {
        (1e15, "f")
    } else {
        (1.0, "")
    };
    format!("{}{}", round_sig(x * scale, 6), suffix)
}

fn round_sig(x: f64, digits: i32) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let d = digits - 1 - x.abs().log10().floor() as i32;
    let p = 10f64.powi(d);
    (x * p).round() / p
}
