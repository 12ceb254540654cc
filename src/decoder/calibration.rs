//! Per-range calibration and spike filtering for the fixed-frame probe
//!
//! Raw ADC codes are converted to amperes with the per-range modifiers read
//! from the probe:
//!
//! ```text
//! adc = (raw - O[r]) * (adc_mult / R[r])
//! adc = UG[r] * (adc * (GS[r] * adc + GI[r]) + (S[r] * vdd / 1000 + I[r]))
//! ```
//!
//! After a range switch the analog front end settles for a few samples. The
//! spike filter replaces those samples with an exponential moving average.

use super::common::DecodeError;
use crate::config::SpikeFilterConfig;

/// Number of measurement ranges on the fixed-frame probe
pub const NUM_RANGES: usize = 5;

/// Index of the highest-current range
const TOP_RANGE: usize = NUM_RANGES - 1;

/// Post-switch samples of the top range that do not update the averages
const TOP_RANGE_SETTLE_SAMPLES: u32 = 2;

/// ADC volts per code, after the 2-bit left shift of the 14-bit field
pub const DEFAULT_ADC_MULT: f64 = 1.8 / 163_840.0;

/// Calibration modifiers, one entry per range
#[derive(Debug, Clone, PartialEq)]
pub struct Modifiers {
    /// Shunt resistors in ohms
    pub r: [f64; NUM_RANGES],
    /// Gain slope
    pub gs: [f64; NUM_RANGES],
    /// Gain intercept
    pub gi: [f64; NUM_RANGES],
    /// ADC offset
    pub o: [f64; NUM_RANGES],
    /// VDD slope
    pub s: [f64; NUM_RANGES],
    /// VDD intercept
    pub i: [f64; NUM_RANGES],
    /// User gain
    pub ug: [f64; NUM_RANGES],
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            r: [1031.64, 101.65, 10.15, 0.94, 0.043],
            gs: [1.0; NUM_RANGES],
            gi: [1.0; NUM_RANGES],
            o: [0.0; NUM_RANGES],
            s: [0.0; NUM_RANGES],
            i: [0.0; NUM_RANGES],
            ug: [1.0; NUM_RANGES],
        }
    }
}

/// Calibration state including the spike filter
#[derive(Debug, Clone)]
pub struct Calibration {
    pub modifiers: Modifiers,
    adc_mult: f64,
    vdd_mv: u16,
    filter: SpikeFilterConfig,
    rolling_avg: Option<f64>,
    rolling_avg4: Option<f64>,
    prev_range: Option<usize>,
    after_spike: u32,
    consecutive_range_samples: u32,
}

impl Calibration {
    pub fn new(vdd_mv: u16, filter: SpikeFilterConfig) -> Self {
        Self {
            modifiers: Modifiers::default(),
            adc_mult: DEFAULT_ADC_MULT,
            vdd_mv,
            filter,
            rolling_avg: None,
            rolling_avg4: None,
            prev_range: None,
            after_spike: 0,
            consecutive_range_samples: 0,
        }
    }

    pub fn vdd_mv(&self) -> u16 {
        self.vdd_mv
    }

    pub fn set_vdd_mv(&mut self, vdd_mv: u16) {
        self.vdd_mv = vdd_mv;
    }

    pub fn set_spike_filter(&mut self, filter: SpikeFilterConfig) {
        self.filter = filter;
    }

    /// Forget the filter history (new acquisition)
    pub fn reset_filter(&mut self) {
        self.rolling_avg = None;
        self.rolling_avg4 = None;
        self.prev_range = None;
        self.after_spike = 0;
        self.consecutive_range_samples = 0;
    }

    /// Calibrated value without filtering, in amperes
    pub fn calibrate(&self, range: usize, adc_raw: u32) -> Result<f64, DecodeError> {
        if range >= NUM_RANGES {
            return Err(DecodeError::InvalidRange(range as u8));
        }
        let m = &self.modifiers;
        let without_gain = (adc_raw as f64 - m.o[range]) * (self.adc_mult / m.r[range]);
        let vdd_v = self.vdd_mv as f64 / 1000.0;
        Ok(m.ug[range]
            * (without_gain * (m.gs[range] * without_gain + m.gi[range])
                + (m.s[range] * vdd_v + m.i[range])))
    }

    /// Calibrated and spike-filtered value, in amperes
    pub fn adc_result(&mut self, range: usize, adc_raw: u32) -> Result<f64, DecodeError> {
        let mut adc = self.calibrate(range, adc_raw)?;

        let prev_avg = self.rolling_avg;
        let prev_avg4 = self.rolling_avg4;
        self.rolling_avg = Some(match self.rolling_avg {
            Some(avg) => self.filter.alpha * avg + (1.0 - self.filter.alpha) * adc,
            None => adc,
        });
        self.rolling_avg4 = Some(match self.rolling_avg4 {
            Some(avg) => self.filter.alpha5 * avg + (1.0 - self.filter.alpha5) * adc,
            None => adc,
        });

        let prev_range = *self.prev_range.get_or_insert(range);
        if prev_range != range || self.after_spike > 0 {
            if prev_range != range {
                // every switch restarts the countdown, including one mid-flight
                self.consecutive_range_samples = 0;
                self.after_spike = self.filter.samples;
            } else {
                self.consecutive_range_samples += 1;
            }

            if range == TOP_RANGE {
                if self.consecutive_range_samples < TOP_RANGE_SETTLE_SAMPLES {
                    self.rolling_avg = prev_avg;
                    self.rolling_avg4 = prev_avg4;
                }
                adc = self.rolling_avg4.unwrap_or(adc);
            } else {
                adc = self.rolling_avg.unwrap_or(adc);
            }
            self.after_spike = self.after_spike.saturating_sub(1);
        }

        self.prev_range = Some(range);
        Ok(adc)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new(3000, SpikeFilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_conversion() {
        let cal = Calibration::default();
        // range 0: 1.8 V full scale over 1031.64 ohms
        let amps = cal.calibrate(0, 163_840).unwrap();
        assert!((amps - 1.8 / 1031.64).abs() < 1e-9);
        // zero code with default intercepts gives zero current
        assert_eq!(cal.calibrate(2, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_invalid_range() {
        let cal = Calibration::default();
        assert_eq!(cal.calibrate(5, 100), Err(DecodeError::InvalidRange(5)));
    }

    #[test]
    fn test_vdd_terms() {
        let mut cal = Calibration::default();
        cal.modifiers.s[1] = 0.001;
        cal.modifiers.i[1] = 0.002;
        cal.set_vdd_mv(2000);
        let amps = cal.calibrate(1, 0).unwrap();
        assert!((amps - (0.001 * 2.0 + 0.002)).abs() < 1e-12);
    }

    #[test]
    fn test_steady_range_is_unfiltered() {
        let mut cal = Calibration::default();
        for _ in 0..5 {
            let raw = cal.calibrate(1, 4000).unwrap();
            let filtered = cal.adc_result(1, 4000).unwrap();
            assert_eq!(raw, filtered);
        }
    }

    #[test]
    fn test_range_switch_substitutes_average() {
        let filter = SpikeFilterConfig {
            alpha: 0.5,
            alpha5: 0.5,
            samples: 3,
        };
        let mut cal = Calibration::new(3000, filter);
        let low = cal.adc_result(1, 1000).unwrap();

        // switch to range 2: the filtered value is the blended average, not the raw spike
        let raw = cal.calibrate(2, 50_000).unwrap();
        let first = cal.adc_result(2, 50_000).unwrap();
        assert!((first - (0.5 * low + 0.5 * raw)).abs() < 1e-12);

        // two more filtered samples, then raw values come through
        cal.adc_result(2, 50_000).unwrap();
        cal.adc_result(2, 50_000).unwrap();
        let settled = cal.adc_result(2, 50_000).unwrap();
        assert_eq!(settled, raw);
    }

    #[test]
    fn test_top_range_keeps_previous_average() {
        let filter = SpikeFilterConfig {
            alpha: 0.5,
            alpha5: 0.5,
            samples: 3,
        };
        let mut cal = Calibration::new(3000, filter);
        let before = cal.adc_result(3, 1000).unwrap();

        // first two top-range samples do not pollute the average
        assert_eq!(cal.adc_result(4, 160_000).unwrap(), before);
        assert_eq!(cal.adc_result(4, 160_000).unwrap(), before);
        // third sample starts blending
        let third = cal.adc_result(4, 160_000).unwrap();
        assert!(third > before);
    }
}
