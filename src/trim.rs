//! Amplitude scan for chunk-boundary silence.
//!
//! The engine pads chunk edges with short stretches of near-silence, which
//! read as pauses. These scans find how many whole frames at an edge sit at
//! or below an amplitude threshold, bounded by a scan window and a minimum
//! kept stretch so attacks and releases survive. PCM 8-bit unsigned and
//! 16-bit signed only.

use crate::format::AudioFormat;

/// Scan bounds derived from the 0..=100 aggressiveness factor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TrimParams {
    pub max_lead_ms: u32,
    pub keep_lead_ms: u32,
    pub max_tail_ms: u32,
    pub keep_tail_ms: u32,
    /// Amplitude threshold in 16-bit sample space.
    pub threshold: u32,
}

impl TrimParams {
    pub fn from_aggressiveness(factor: i32) -> Self {
        let f = factor.clamp(0, 100) as u32;
        TrimParams {
            max_lead_ms: 200 + f * 12,
            keep_lead_ms: 8,
            max_tail_ms: 250 + f * 12,
            keep_tail_ms: 10,
            threshold: 48 + f * 2,
        }
    }
}

fn threshold_for_8bit(threshold16: u32) -> u32 {
    (threshold16 / 64).clamp(1, 127)
}

fn frame_is_silent(frame: &[u8], bits: u16, channels: usize, t16: u32, t8: u32) -> bool {
    match bits {
        16 => {
            for c in 0..channels {
                let sample = i16::from_le_bytes([frame[c * 2], frame[c * 2 + 1]]);
                if sample.unsigned_abs() as u32 > t16 {
                    return false;
                }
            }
            true
        }
        8 => {
            // 8-bit PCM is unsigned; silence sits around 128.
            for c in 0..channels {
                let dv = (frame[c] as i32 - 128).unsigned_abs();
                if dv > t8 {
                    return false;
                }
            }
            true
        }
        _ => false,
    }
}

fn frames_for_ms(bytes_per_sec: u64, ms: u32, block_align: usize) -> u64 {
    bytes_per_sec * ms as u64 / 1000 / block_align as u64
}

fn scan_geometry(fmt: &AudioFormat) -> Option<(usize, usize, u16)> {
    if !fmt.is_pcm() || fmt.channels == 0 || fmt.block_align == 0 {
        return None;
    }
    let bits = fmt.bits_per_sample;
    if bits != 8 && bits != 16 {
        return None;
    }
    let bytes_per_sample = if bits == 8 { 1 } else { 2 };
    let block_align = fmt.block_align as usize;
    if block_align < fmt.channels as usize * bytes_per_sample {
        return None;
    }
    Some((block_align, fmt.channels as usize, bits))
}

/// Bytes of leading silence to skip in an unread buffer.
pub(crate) fn leading_silence(
    data: &[u8],
    fmt: &AudioFormat,
    bytes_per_sec: u64,
    p: &TrimParams,
) -> usize {
    let Some((block_align, channels, bits)) = scan_geometry(fmt) else {
        return 0;
    };

    let total_frames = data.len() / block_align;
    if total_frames == 0 {
        return 0;
    }

    let max_frames = if bytes_per_sec > 0 && p.max_lead_ms > 0 {
        frames_for_ms(bytes_per_sec, p.max_lead_ms, block_align) as usize
    } else {
        total_frames
    };
    let keep_frames = if bytes_per_sec > 0 && p.keep_lead_ms > 0 {
        frames_for_ms(bytes_per_sec, p.keep_lead_ms, block_align) as usize
    } else {
        0
    };

    let scan_frames = max_frames.min(total_frames);
    if scan_frames == 0 {
        return 0;
    }

    let t8 = if bits == 8 { threshold_for_8bit(p.threshold) } else { 0 };
    let mut silent = 0;
    while silent < scan_frames {
        let frame = &data[silent * block_align..(silent + 1) * block_align];
        if !frame_is_silent(frame, bits, channels, p.threshold, t8) {
            break;
        }
        silent += 1;
    }

    if silent <= keep_frames {
        return 0;
    }
    (silent - keep_frames) * block_align
}

/// Bytes of trailing silence to cut from a buffer's end, never touching the
/// already-delivered prefix before `offset`.
pub(crate) fn trailing_silence(
    data: &[u8],
    offset: usize,
    fmt: &AudioFormat,
    bytes_per_sec: u64,
    p: &TrimParams,
) -> usize {
    let Some((block_align, channels, bits)) = scan_geometry(fmt) else {
        return 0;
    };

    if data.len() < block_align || offset >= data.len() {
        return 0;
    }

    // Scan whole frames only, starting past anything already handed out.
    let scan_end = (data.len() / block_align) * block_align;
    let scan_start = offset.div_ceil(block_align) * block_align;
    if scan_end == 0 || scan_start >= scan_end {
        return 0;
    }

    let total_frames = scan_end / block_align;
    let start_frame = scan_start / block_align;
    let available_frames = total_frames - start_frame;

    let max_frames = if bytes_per_sec > 0 && p.max_tail_ms > 0 {
        frames_for_ms(bytes_per_sec, p.max_tail_ms, block_align) as usize
    } else {
        available_frames
    };
    let keep_frames = if bytes_per_sec > 0 && p.keep_tail_ms > 0 {
        frames_for_ms(bytes_per_sec, p.keep_tail_ms, block_align) as usize
    } else {
        0
    };

    let scan_frames = max_frames.min(available_frames);
    if scan_frames == 0 {
        return 0;
    }

    let t8 = if bits == 8 { threshold_for_8bit(p.threshold) } else { 0 };
    let mut trailing = 0;
    for j in 0..scan_frames {
        let idx = total_frames - 1 - j;
        if idx < start_frame {
            break;
        }
        let frame = &data[idx * block_align..(idx + 1) * block_align];
        if !frame_is_silent(frame, bits, channels, p.threshold, t8) {
            break;
        }
        trailing += 1;
    }

    if trailing <= keep_frames {
        return 0;
    }
    let mut cut = (trailing - keep_frames) * block_align;
    cut = cut.min(scan_end - scan_start);
    cut.min(data.len() - offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt16() -> AudioFormat {
        AudioFormat::pcm(1000, 1, 16)
    }

    fn samples(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn leading_respects_keep_window() {
        let fmt = fmt16();
        let p = TrimParams {
            max_lead_ms: 1000,
            keep_lead_ms: 2, // 2 frames at 1000 Hz
            max_tail_ms: 1000,
            keep_tail_ms: 0,
            threshold: 48,
        };
        // 10 silent frames then sound.
        let mut data = samples(&[0; 10]);
        data.extend(samples(&[5000; 5]));
        let cut = leading_silence(&data, &fmt, fmt.bytes_per_sec(), &p);
        assert_eq!(cut, 8 * 2);
    }

    #[test]
    fn leading_bounded_by_scan_window() {
        let fmt = fmt16();
        let p = TrimParams {
            max_lead_ms: 3, // 3 frames
            keep_lead_ms: 0,
            max_tail_ms: 0,
            keep_tail_ms: 0,
            threshold: 48,
        };
        let data = samples(&[0; 100]);
        assert_eq!(leading_silence(&data, &fmt, fmt.bytes_per_sec(), &p), 3 * 2);
    }

    #[test]
    fn no_trim_when_loud() {
        let fmt = fmt16();
        let p = TrimParams::from_aggressiveness(50);
        let data = samples(&[4000; 20]);
        assert_eq!(leading_silence(&data, &fmt, fmt.bytes_per_sec(), &p), 0);
        assert_eq!(trailing_silence(&data, 0, &fmt, fmt.bytes_per_sec(), &p), 0);
    }

    #[test]
    fn trailing_never_touches_read_bytes() {
        let fmt = fmt16();
        let p = TrimParams {
            max_lead_ms: 0,
            keep_lead_ms: 0,
            max_tail_ms: 1000,
            keep_tail_ms: 0,
            threshold: 48,
        };
        // Entirely silent, but the first 18 of 20 bytes were delivered.
        let data = samples(&[0; 10]);
        let cut = trailing_silence(&data, 18, &fmt, fmt.bytes_per_sec(), &p);
        assert!(cut <= 2);
    }

    #[test]
    fn trailing_cuts_only_the_tail() {
        let fmt = fmt16();
        let p = TrimParams {
            max_lead_ms: 0,
            keep_lead_ms: 0,
            max_tail_ms: 1000,
            keep_tail_ms: 1, // 1 frame
            threshold: 48,
        };
        let mut data = samples(&[3000; 5]);
        data.extend(samples(&[0; 6]));
        let cut = trailing_silence(&data, 0, &fmt, fmt.bytes_per_sec(), &p);
        assert_eq!(cut, 5 * 2);
    }

    #[test]
    fn eight_bit_silence_centers_at_128() {
        let fmt = AudioFormat::pcm(1000, 1, 8);
        let p = TrimParams {
            max_lead_ms: 1000,
            keep_lead_ms: 0,
            max_tail_ms: 0,
            keep_tail_ms: 0,
            threshold: 128, // maps to 2 in 8-bit space
        };
        let mut data = vec![128u8; 6];
        data.extend([200u8; 4]);
        assert_eq!(leading_silence(&data, &fmt, fmt.bytes_per_sec(), &p), 6);
    }

    #[test]
    fn non_pcm_is_left_alone() {
        let mut fmt = fmt16();
        fmt.format_tag = 2;
        let p = TrimParams::from_aggressiveness(100);
        let data = samples(&[0; 50]);
        assert_eq!(leading_silence(&data, &fmt, fmt.bytes_per_sec(), &p), 0);
    }
}
