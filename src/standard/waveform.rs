//! Digitizer waveforms.
//!
//! A [`StandardWaveform`] holds one channel's samples for one trigger together with the
//! readout metadata needed to place them on a time axis. Domino-ring digitizers start
//! reading at the trigger cell, so the calibrated time of sample `i` accumulates the
//! per-cell widths starting from that cell:
//!
//! ```text
//! t[0] = tcal[tc]
//! t[i] = tcal[(tc + i) mod n] + t[i - 1]
//! ```
//!
//! Index ranges passed to the `*_in_range` helpers are half open (`lo..hi`).

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Minimum number of samples a pulse must stay above threshold in [`StandardWaveform::peaks_above`].
const MIN_PEAK_WIDTH: usize = 5;
/// Minimum distance in samples between two reported peaks.
const MIN_PEAK_SEPARATION: usize = 35;

/// One channel's sampled waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardWaveform {
    id: u32,
    #[serde(rename = "type")]
    waveform_type: String,
    sensor: String,
    channel_name: String,
    channel_number: i32,
    samples: Vec<f32>,
    trigger_cell: u16,
    polarity: i8,
    pulser_polarity: i8,
    timestamp: u64,
    times: Vec<f32>,
}

impl StandardWaveform {
    /// Create an empty waveform; the channel number starts unset (`-1`).
    pub fn new(id: u32, waveform_type: impl Into<String>, sensor: impl Into<String>) -> Self {
        Self {
            id,
            waveform_type: waveform_type.into(),
            sensor: sensor.into(),
            channel_name: String::new(),
            channel_number: -1,
            samples: Vec::new(),
            trigger_cell: 0,
            polarity: 1,
            pulser_polarity: 1,
            timestamp: 0,
            times: Vec::new(),
        }
    }

    /// Channel id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Waveform type.
    pub fn waveform_type(&self) -> &str {
        &self.waveform_type
    }

    /// Sensor name.
    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    /// Channel name as reported by the digitizer.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Set the channel name.
    pub fn set_channel_name(&mut self, name: impl Into<String>) {
        self.channel_name = name.into();
    }

    /// Channel number, `-1` when unset.
    pub fn channel_number(&self) -> i32 {
        self.channel_number
    }

    /// Set the channel number.
    pub fn set_channel_number(&mut self, number: i32) {
        self.channel_number = number;
    }

    /// Replace the samples.
    pub fn set_samples(&mut self, samples: Vec<f32>) {
        self.samples = samples;
    }

    /// Samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Domino cell at which the readout started.
    pub fn trigger_cell(&self) -> u16 {
        self.trigger_cell
    }

    /// Set the trigger cell.
    pub fn set_trigger_cell(&mut self, cell: u16) {
        self.trigger_cell = cell;
    }

    /// Signal polarity, `+1` or `-1`.
    pub fn polarity(&self) -> i8 {
        self.polarity
    }

    /// Pulser polarity, `+1` or `-1`.
    pub fn pulser_polarity(&self) -> i8 {
        self.pulser_polarity
    }

    /// Set signal and pulser polarities.
    pub fn set_polarities(&mut self, polarity: i8, pulser_polarity: i8) {
        self.polarity = polarity;
        self.pulser_polarity = pulser_polarity;
    }

    /// Readout timestamp.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Set the readout timestamp.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Calibrated time axis, empty until [`set_times`](Self::set_times) succeeded.
    pub fn times(&self) -> &[f32] {
        &self.times
    }

    /// Compute and store the calibrated time axis.
    pub fn set_times(&mut self, tcal: &[f32]) -> AppResult<()> {
        self.times = self.calibrated_times(tcal)?;
        Ok(())
    }

    /// Time axis obtained by accumulating cell widths from the trigger cell onwards.
    pub fn calibrated_times(&self, tcal: &[f32]) -> AppResult<Vec<f32>> {
        let n = self.samples.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if tcal.len() < n {
            return Err(DaqError::out_of_range("time calibration cell", n - 1, tcal.len()));
        }
        let tc = usize::from(self.trigger_cell);
        let first = *tcal
            .get(tc)
            .ok_or_else(|| DaqError::out_of_range("trigger cell", tc, tcal.len()))?;
        let mut times = Vec::with_capacity(n);
        times.push(first);
        for i in 1..n {
            let previous = times[i - 1];
            times.push(tcal[(tc + i) % n] + previous);
        }
        Ok(times)
    }

    fn range(&self, lo: usize, hi: usize) -> AppResult<&[f32]> {
        if hi > self.samples.len() {
            return Err(DaqError::out_of_range("sample", hi, self.samples.len()));
        }
        if lo >= hi {
            return Err(DaqError::out_of_range("sample", lo, hi));
        }
        Ok(&self.samples[lo..hi])
    }

    fn sample(&self, index: usize) -> AppResult<f32> {
        self.samples
            .get(index)
            .copied()
            .ok_or_else(|| DaqError::out_of_range("sample", index, self.samples.len()))
    }

    fn time(&self, index: usize) -> AppResult<f32> {
        self.times
            .get(index)
            .copied()
            .ok_or_else(|| DaqError::out_of_range("time", index, self.times.len()))
    }

    /// Index of the smallest sample in `lo..hi`.
    pub fn index_min(&self, lo: usize, hi: usize) -> AppResult<usize> {
        let slice = self.range(lo, hi)?;
        let (offset, _) = slice
            .iter()
            .enumerate()
            .fold((0, f32::INFINITY), |best, (i, &v)| if v < best.1 { (i, v) } else { best });
        Ok(lo + offset)
    }

    /// Index of the largest sample in `lo..hi`.
    pub fn index_max(&self, lo: usize, hi: usize) -> AppResult<usize> {
        let slice = self.range(lo, hi)?;
        let (offset, _) = slice
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        Ok(lo + offset)
    }

    /// Index of the sample with the largest magnitude in `lo..hi`.
    pub fn index_abs_max(&self, lo: usize, hi: usize) -> AppResult<usize> {
        let min = self.index_min(lo, hi)?;
        let max = self.index_max(lo, hi)?;
        Ok(if self.samples[min].abs() > self.samples[max].abs() {
            min
        } else {
            max
        })
    }

    /// Index of the extremum in the direction of `polarity`.
    pub fn index_for_polarity(&self, lo: usize, hi: usize, polarity: i8) -> AppResult<usize> {
        if polarity > 0 {
            self.index_max(lo, hi)
        } else {
            self.index_min(lo, hi)
        }
    }

    /// Smallest sample in `lo..hi`.
    pub fn min_in_range(&self, lo: usize, hi: usize) -> AppResult<f32> {
        Ok(self.samples[self.index_min(lo, hi)?])
    }

    /// Largest sample in `lo..hi`.
    pub fn max_in_range(&self, lo: usize, hi: usize) -> AppResult<f32> {
        Ok(self.samples[self.index_max(lo, hi)?])
    }

    /// Largest magnitude in `lo..hi`.
    pub fn abs_max_in_range(&self, lo: usize, hi: usize) -> AppResult<f32> {
        Ok(self.samples[self.index_abs_max(lo, hi)?].abs())
    }

    /// Difference between the largest and smallest sample in `lo..hi`.
    pub fn peak_to_peak(&self, lo: usize, hi: usize) -> AppResult<f32> {
        Ok(self.max_in_range(lo, hi)? - self.min_in_range(lo, hi)?)
    }

    /// Mean signal over the inclusive bin range `lo..=hi`, `hi` clamped to the last sample.
    ///
    /// The sum is divided by `hi - lo`; a single-bin range returns that bin.
    pub fn integral(&self, lo: usize, hi: usize, absolute: bool) -> AppResult<f32> {
        let last = self
            .samples
            .len()
            .checked_sub(1)
            .ok_or_else(|| DaqError::out_of_range("sample", lo, 0))?;
        let hi = hi.min(last);
        if lo > hi {
            return Err(DaqError::out_of_range("sample", lo, hi + 1));
        }
        let sum: f32 = self.samples[lo..=hi]
            .iter()
            .map(|v| if absolute { v.abs() } else { *v })
            .sum();
        if hi == lo {
            return Ok(sum);
        }
        Ok(sum / (hi - lo) as f32)
    }

    /// Index and value of the sample with the largest magnitude in the whole waveform.
    pub fn max_peak(&self) -> AppResult<(usize, f32)> {
        let index = self.index_abs_max(0, self.samples.len())?;
        Ok((index, self.samples[index]))
    }

    /// Median of the inclusive range `lo..=hi`.
    pub fn median(&self, lo: usize, hi: usize) -> AppResult<f32> {
        let mut values = self.range(lo, hi + 1)?.to_vec();
        values.sort_by(f32::total_cmp);
        let mid = values.len() / 2;
        Ok(if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        })
    }

    /// Positions of pulses whose magnitude crosses `threshold` inside `lo..hi`.
    ///
    /// A pulse must stay above threshold for more than five samples, and consecutive
    /// pulses closer than 35 samples are merged into the first.
    pub fn peaks_above(&self, lo: usize, hi: usize, threshold: f32) -> AppResult<Vec<usize>> {
        self.range(lo, hi)?;
        let mut peaks: Vec<usize> = Vec::new();
        let mut start = 0usize;
        for j in (lo + 1)..hi.saturating_sub(1) {
            let value = self.samples[j].abs();
            if value > threshold && self.samples[j - 1].abs() < threshold {
                start = j;
            }
            if value > threshold && self.samples[j + 1].abs() < threshold && j > start + MIN_PEAK_WIDTH {
                let pos = self.index_abs_max(start, j)?;
                match peaks.last() {
                    None => peaks.push(pos),
                    Some(&last) if pos > last + MIN_PEAK_SEPARATION => peaks.push(pos),
                    Some(_) => {}
                }
            }
        }
        Ok(peaks)
    }

    /// Width of bin `i` on the calibrated time axis.
    pub fn bin_width(&self, i: usize) -> AppResult<f32> {
        if i == 0 {
            return Err(DaqError::out_of_range("time", 0, self.times.len()));
        }
        Ok(self.time(i)? - self.time(i - 1)?)
    }

    /// Time at which the line through bins `i - 1` and `i` reaches `value`.
    pub fn interpolate_time(&self, i: usize, value: f32) -> AppResult<f32> {
        let (slope, offset) = self.segment(i)?;
        Ok((value - offset) / slope)
    }

    /// Signal of the line through bins `i - 1` and `i` at `time`.
    pub fn interpolate_voltage(&self, i: usize, time: f32) -> AppResult<f32> {
        let (slope, offset) = self.segment(i)?;
        Ok(slope * time + offset)
    }

    fn segment(&self, i: usize) -> AppResult<(f32, f32)> {
        if i == 0 {
            return Err(DaqError::out_of_range("sample", 0, self.samples.len()));
        }
        let (v1, v0) = (self.sample(i)?, self.sample(i - 1)?);
        let (t1, t0) = (self.time(i)?, self.time(i - 1)?);
        let slope = (v1 - v0) / (t1 - t0);
        Ok((slope, v1 - slope * t1))
    }
}

impl Encode for StandardWaveform {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.waveform_type);
        ser.write(&self.sensor);
        ser.write(&self.id);
        ser.write(&self.channel_number);
        ser.write(&self.channel_name);
        ser.write(&self.trigger_cell);
        ser.write(&self.polarity);
        ser.write(&self.pulser_polarity);
        ser.write(&self.timestamp);
        ser.write(&self.samples);
        ser.write(&self.times);
    }
}

impl Decode for StandardWaveform {
    const MIN_SIZE: usize = 36;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Ok(Self {
            waveform_type: de.read()?,
            sensor: de.read()?,
            id: de.read()?,
            channel_number: de.read()?,
            channel_name: de.read()?,
            trigger_cell: de.read()?,
            polarity: de.read()?,
            pulser_polarity: de.read()?,
            timestamp: de.read()?,
            samples: de.read()?,
            times: de.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waveform(samples: &[f32]) -> StandardWaveform {
        let mut wf = StandardWaveform::new(0, "DRS4", "diamond");
        wf.set_samples(samples.to_vec());
        wf
    }

    #[test]
    fn test_new_waveform_has_unset_channel_number() {
        assert_eq!(StandardWaveform::new(1, "DRS4", "").channel_number(), -1);
    }

    #[test]
    fn test_calibrated_times_start_at_trigger_cell() {
        let mut wf = waveform(&[0.0; 4]);
        wf.set_trigger_cell(2);
        let tcal = [1.0, 2.0, 3.0, 4.0];
        // t0 = tcal[2]; t1 = tcal[3] + t0; t2 = tcal[0] + t1; t3 = tcal[1] + t2
        assert_eq!(wf.calibrated_times(&tcal).unwrap(), vec![3.0, 7.0, 8.0, 10.0]);
    }

    #[test]
    fn test_calibrated_times_need_enough_cells() {
        let mut wf = waveform(&[0.0; 4]);
        assert!(wf.calibrated_times(&[1.0, 1.0]).is_err());
        wf.set_trigger_cell(9);
        assert!(matches!(
            wf.calibrated_times(&[1.0; 4]),
            Err(DaqError::OutOfRange { what: "trigger cell", .. })
        ));
    }

    #[test]
    fn test_extrema_in_half_open_ranges() {
        let wf = waveform(&[1.0, -5.0, 3.0, 7.0, -2.0]);
        assert_eq!(wf.index_min(0, 5).unwrap(), 1);
        assert_eq!(wf.index_max(0, 3).unwrap(), 2);
        assert_eq!(wf.max_in_range(0, 5).unwrap(), 7.0);
        assert_eq!(wf.min_in_range(2, 5).unwrap(), -2.0);
        assert_eq!(wf.abs_max_in_range(0, 3).unwrap(), 5.0);
        assert_eq!(wf.peak_to_peak(0, 5).unwrap(), 12.0);
        assert_eq!(wf.index_for_polarity(0, 5, -1).unwrap(), 1);
        assert_eq!(wf.max_peak().unwrap(), (3, 7.0));
    }

    #[test]
    fn test_range_errors_instead_of_panics() {
        let wf = waveform(&[1.0, 2.0]);
        assert!(matches!(wf.index_max(0, 3), Err(DaqError::OutOfRange { .. })));
        assert!(wf.index_max(1, 1).is_err());
        assert!(waveform(&[]).max_peak().is_err());
    }

    #[test]
    fn test_integral_is_mean_over_span() {
        let wf = waveform(&[1.0, 2.0, 3.0, -4.0]);
        assert_eq!(wf.integral(0, 2, false).unwrap(), 3.0);
        assert_eq!(wf.integral(2, 10, true).unwrap(), 7.0);
        assert_eq!(wf.integral(1, 1, false).unwrap(), 2.0);
    }

    #[test]
    fn test_median_of_inclusive_range() {
        let wf = waveform(&[5.0, 1.0, 3.0, 2.0]);
        assert_eq!(wf.median(0, 2).unwrap(), 3.0);
        assert_eq!(wf.median(0, 3).unwrap(), 2.5);
    }

    #[test]
    fn test_peaks_above_threshold() {
        let mut samples = vec![0.0f32; 120];
        for (i, sample) in samples.iter_mut().enumerate().take(30).skip(20) {
            *sample = -(i as f32);
        }
        for sample in samples.iter_mut().take(100).skip(90) {
            *sample = 50.0;
        }
        let wf = waveform(&samples);
        let peaks = wf.peaks_above(0, 120, 10.0).unwrap();
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0], 29);
        assert!((90..100).contains(&peaks[1]));
    }

    #[test]
    fn test_interpolation_on_calibrated_axis() {
        let mut wf = waveform(&[0.0, 10.0, 20.0]);
        wf.set_times(&[0.5, 0.5, 0.5]).unwrap();
        assert_eq!(wf.times(), &[0.5, 1.0, 1.5]);
        assert_eq!(wf.bin_width(1).unwrap(), 0.5);
        assert!((wf.interpolate_time(1, 5.0).unwrap() - 0.75).abs() < 1e-6);
        assert!((wf.interpolate_voltage(2, 1.25).unwrap() - 15.0).abs() < 1e-5);
        assert!(wf.bin_width(0).is_err());
    }
}
