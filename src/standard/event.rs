//! Canonical decoded event.

use super::{StandardPlane, StandardWaveform};
use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use crate::event::{Event, EventFlags};
use serde::{Deserialize, Serialize};

/// Plane type prefix of CMS pixel sub-detectors.
pub const CMS_PLANE_PREFIX: &str = "CMSPixel";

/// Hardware-agnostic representation of one event: pixel planes, waveforms and trigger data.
///
/// The header is copied from the raw event it was converted from. Planes and waveforms keep
/// their insertion index for the lifetime of the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardEvent {
    run: u32,
    event: u32,
    flags: u32,
    time_begin: u64,
    time_end: u64,
    detector_type: String,
    planes: Vec<StandardPlane>,
    waveforms: Vec<StandardWaveform>,
    trigger_phases: Vec<u16>,
    trigger_counts: Vec<u32>,
}

impl StandardEvent {
    /// Empty standard event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty standard event carrying the header of `raw`.
    pub fn from_raw(raw: &Event) -> Self {
        Self {
            run: raw.run_number(),
            event: raw.event_number(),
            flags: raw.flags().bits(),
            time_begin: raw.timestamp_begin(),
            time_end: raw.timestamp_end(),
            ..Self::default()
        }
    }

    /// Run number.
    pub fn run_number(&self) -> u32 {
        self.run
    }

    /// Event number.
    pub fn event_number(&self) -> u32 {
        self.event
    }

    /// Flags of the raw event.
    pub fn flags(&self) -> EventFlags {
        EventFlags::from_bits(self.flags)
    }

    /// True when converted from an end-of-run event.
    pub fn is_eore(&self) -> bool {
        self.flags().contains(EventFlags::EORE)
    }

    /// Begin time in picoseconds.
    pub fn time_begin(&self) -> u64 {
        self.time_begin
    }

    /// End time in picoseconds.
    pub fn time_end(&self) -> u64 {
        self.time_end
    }

    /// Set both times.
    pub fn set_times(&mut self, begin: u64, end: u64) {
        self.time_begin = begin;
        self.time_end = end;
    }

    /// Detector type reported by the converter.
    pub fn detector_type(&self) -> &str {
        &self.detector_type
    }

    /// Set the detector type.
    pub fn set_detector_type(&mut self, detector_type: impl Into<String>) {
        self.detector_type = detector_type.into();
    }

    /// Append a plane and return its index.
    pub fn add_plane(&mut self, plane: StandardPlane) -> usize {
        self.planes.push(plane);
        self.planes.len() - 1
    }

    /// Plane `index`.
    pub fn get_plane(&self, index: usize) -> AppResult<&StandardPlane> {
        self.planes
            .get(index)
            .ok_or_else(|| DaqError::out_of_range("plane", index, self.planes.len()))
    }

    /// Mutable plane `index`.
    pub fn get_plane_mut(&mut self, index: usize) -> AppResult<&mut StandardPlane> {
        let len = self.planes.len();
        self.planes
            .get_mut(index)
            .ok_or_else(|| DaqError::out_of_range("plane", index, len))
    }

    /// Number of planes.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Planes in insertion order.
    pub fn planes(&self) -> &[StandardPlane] {
        &self.planes
    }

    /// Number of planes belonging to CMS pixel sub-detectors.
    pub fn num_cms_planes(&self) -> usize {
        self.planes
            .iter()
            .filter(|plane| plane.plane_type().starts_with(CMS_PLANE_PREFIX))
            .count()
    }

    /// Append a waveform and return its index.
    pub fn add_waveform(&mut self, waveform: StandardWaveform) -> usize {
        self.waveforms.push(waveform);
        self.waveforms.len() - 1
    }

    /// Waveform `index`.
    pub fn get_waveform(&self, index: usize) -> AppResult<&StandardWaveform> {
        self.waveforms
            .get(index)
            .ok_or_else(|| DaqError::out_of_range("waveform", index, self.waveforms.len()))
    }

    /// Number of waveforms.
    pub fn num_waveforms(&self) -> usize {
        self.waveforms.len()
    }

    /// Waveforms in insertion order.
    pub fn waveforms(&self) -> &[StandardWaveform] {
        &self.waveforms
    }

    /// Record the trigger phase of the next CMS plane.
    pub fn add_trigger_phase(&mut self, phase: u16) {
        self.trigger_phases.push(phase);
    }

    /// Record the trigger count of the next CMS plane.
    pub fn add_trigger_count(&mut self, count: u32) {
        self.trigger_counts.push(count);
    }

    /// Trigger phase of CMS plane `index`.
    pub fn trigger_phase(&self, index: usize) -> AppResult<u16> {
        self.trigger_phases
            .get(index)
            .copied()
            .ok_or_else(|| DaqError::out_of_range("trigger phase", index, self.trigger_phases.len()))
    }

    /// Trigger count of CMS plane `index`.
    pub fn trigger_count(&self, index: usize) -> AppResult<u32> {
        self.trigger_counts
            .get(index)
            .copied()
            .ok_or_else(|| DaqError::out_of_range("trigger count", index, self.trigger_counts.len()))
    }

    /// All trigger phases.
    pub fn trigger_phases(&self) -> &[u16] {
        &self.trigger_phases
    }

    /// True when nothing was decoded into the event.
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty() && self.waveforms.is_empty()
    }
}

impl Encode for StandardEvent {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.run);
        ser.write(&self.event);
        ser.write(&self.flags);
        ser.write(&self.time_begin);
        ser.write(&self.time_end);
        ser.write(&self.detector_type);
        ser.write(&self.planes);
        ser.write(&self.waveforms);
        ser.write(&self.trigger_phases);
        ser.write(&self.trigger_counts);
    }
}

impl Decode for StandardEvent {
    const MIN_SIZE: usize = 48;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Ok(Self {
            run: de.read()?,
            event: de.read()?,
            flags: de.read()?,
            time_begin: de.read()?,
            time_end: de.read()?,
            detector_type: de.read()?,
            planes: de.read()?,
            waveforms: de.read()?,
            trigger_phases: de.read()?,
            trigger_counts: de.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_comes_from_raw_event() {
        let mut raw = Event::new("CMSPixelREF");
        raw.set_run_number(12);
        raw.set_event_number(34);
        raw.set_timestamp(5, 6);
        let sev = StandardEvent::from_raw(&raw);
        assert_eq!((sev.run_number(), sev.event_number()), (12, 34));
        assert_eq!((sev.time_begin(), sev.time_end()), (5, 6));
        assert!(sev.flags().contains(EventFlags::TIMESTAMP));
        assert!(sev.is_empty());
    }

    #[test]
    fn test_planes_keep_insertion_index() {
        let mut sev = StandardEvent::new();
        for id in 0..3 {
            assert_eq!(sev.add_plane(StandardPlane::new(id, "CMSPixelDUT", "d")), id as usize);
        }
        assert_eq!(sev.get_plane(1).unwrap().id(), 1);
        assert!(matches!(
            sev.get_plane(3),
            Err(DaqError::OutOfRange { what: "plane", index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_cms_planes_are_counted_by_type() {
        let mut sev = StandardEvent::new();
        sev.add_plane(StandardPlane::new(0, "NI", "MIMOSA26"));
        sev.add_plane(StandardPlane::new(1, "CMSPixelREF", "ref"));
        sev.add_plane(StandardPlane::new(2, "CMSPixelDUT", "dut"));
        assert_eq!(sev.num_cms_planes(), 2);
    }

    #[test]
    fn test_trigger_slots_are_bounds_checked() {
        let mut sev = StandardEvent::new();
        sev.add_trigger_phase(3);
        sev.add_trigger_count(17);
        assert_eq!(sev.trigger_phase(0).unwrap(), 3);
        assert_eq!(sev.trigger_count(0).unwrap(), 17);
        assert!(sev.trigger_phase(1).is_err());
    }

    #[test]
    fn test_binary_and_json_forms() {
        let mut sev = StandardEvent::new();
        sev.set_detector_type("DRS4");
        let mut wf = StandardWaveform::new(0, "DRS4", "scint");
        wf.set_samples(vec![1.5, -2.0]);
        sev.add_waveform(wf);
        let mut ser = Serializer::new();
        ser.write(&sev);
        let bytes = ser.into_vec();
        let decoded: StandardEvent = Deserializer::new(&bytes).read().unwrap();
        assert_eq!(decoded, sev);

        let json = serde_json::to_value(&sev).unwrap();
        assert_eq!(json["detector_type"], "DRS4");
        assert_eq!(json["waveforms"][0]["type"], "DRS4");
    }
}
