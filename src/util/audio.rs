// Audio math shared across the engine.

// Minimum ratio fed to log10 when converting to decibels.
const RATIO_EPSILON: f32 = 1.0e-20;

// Rounding bias applied when truncating fractional bin positions.
pub const BIN_EPSILON: f64 = 0.001;

// Convert an amplitude ratio to decibels.
#[inline(always)]
pub fn ratio_to_db(ratio: f32) -> f32 {
    20.0 * ratio.max(RATIO_EPSILON).log10()
}

/// Centre frequency of an FFT bin.
#[inline]
pub fn bin_frequency(bin: usize, fft_size: usize, sample_rate: f32) -> f32 {
    (bin as f32 * sample_rate) / fft_size.max(1) as f32
}

#[inline]
pub fn apply_window(buffer: &mut [f32], window: &[f32]) {
    debug_assert_eq!(buffer.len(), window.len());
    for (sample, coeff) in buffer.iter_mut().zip(window.iter()) {
        *sample *= *coeff;
    }
}

/// Bin range covered by a frequency window, clamped to [1, fft_size/2] with
/// min strictly below max. `0.0` for either frequency means "unrestricted".
pub fn effective_bin_range(
    min_frequency: f32,
    max_frequency: f32,
    fft_size: usize,
    sample_rate: f32,
) -> (usize, usize) {
    let half = (fft_size / 2).max(1);

    let mut maxbin = half;
    if max_frequency > 0.0 {
        maxbin =
            ((max_frequency as f64 * fft_size as f64) / sample_rate as f64 + BIN_EPSILON) as usize;
        maxbin = maxbin.min(half);
    }
    maxbin = maxbin.max(1);

    let mut minbin = 1;
    if min_frequency > 0.0 {
        minbin =
            ((min_frequency as f64 * fft_size as f64) / sample_rate as f64 + BIN_EPSILON) as usize;
        minbin = minbin.max(1);
    }
    if minbin >= maxbin {
        minbin = maxbin - 1;
    }
    (minbin, maxbin)
}

// IEC 60268-18 deflection as a percentage of meter travel.
fn iec_deflection_percent(db: f32) -> f32 {
    if db < -70.0 {
        0.0
    } else if db < -60.0 {
        (db + 70.0) * 0.25
    } else if db < -50.0 {
        (db + 60.0) * 0.5 + 2.5
    } else if db < -40.0 {
        (db + 50.0) * 0.75 + 7.5
    } else if db < -30.0 {
        (db + 40.0) * 1.5 + 15.0
    } else if db < -20.0 {
        (db + 30.0) * 2.0 + 30.0
    } else if db < 0.0 {
        (db + 20.0) * 2.5 + 50.0
    } else {
        100.0
    }
}

/// Maps an amplitude ratio onto 0..=levels following the IEC 60268-18
/// programme meter curve.
pub fn meter_deflection(ratio: f32, levels: u32) -> u32 {
    if ratio <= 0.0 {
        return 0;
    }
    let percent = iec_deflection_percent(ratio_to_db(ratio));
    (((percent * levels as f32) / 100.0 + 0.01) as u32).min(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_deflection_is_monotonic() {
        let mut last = 0;
        for step in 0..=100 {
            let ratio = step as f32 / 100.0;
            let level = meter_deflection(ratio, 254);
            assert!(level >= last, "ratio {ratio} gave {level} after {last}");
            last = level;
        }
        assert_eq!(meter_deflection(0.0, 254), 0);
        assert_eq!(meter_deflection(1.0, 254), 254);
    }

    #[test]
    fn bin_range_honours_frequency_window() {
        let (minbin, maxbin) = effective_bin_range(10.0, 8_000.0, 1024, 44_100.0);
        assert_eq!(minbin, 1);
        // 8 kHz at 44100 Hz / 1024 bins is ~43.07 Hz per bin.
        assert_eq!(maxbin, 185);

        let (minbin, maxbin) = effective_bin_range(0.0, 0.0, 1024, 44_100.0);
        assert_eq!((minbin, maxbin), (1, 512));
    }

    #[test]
    fn bin_range_never_collapses() {
        // A window entirely above Nyquist still yields a non-empty range.
        let (minbin, maxbin) = effective_bin_range(30_000.0, 31_000.0, 1024, 44_100.0);
        assert!(minbin < maxbin);
        assert!(maxbin <= 512);
    }
}
