//! DRS4 digitizer waveforms.
//!
//! The begin-of-run event describes the board (`NChannels`, `ActiveChannels`,
//! `BaselineOffset`, `WaveDepth`, `CH_<n>` names) and carries one `f32` time-calibration
//! block per active channel, in channel order. Data events hold the trigger cell in block
//! 0, the timestamp in block 1, and then a name block (`C001\n\0`) and a sample block per
//! active channel. Samples are stored as
//!
//! ```text
//! raw = (mV / 1000 - offset + 0.5) * 65535
//! ```

use super::{Converter, RunDecoder};
use crate::config::ConversionConfig;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::standard::{StandardEvent, StandardWaveform};
use tracing::info;

/// Raw event type produced by DRS4 boards.
pub const EVENT_TYPE: &str = "DRS4RawDataEvent";
/// Detector type reported on converted events.
pub const DETECTOR_TYPE: &str = "DRS4";

/// Convert a voltage in millivolts to the stored sample value.
pub fn encode_sample(millivolts: f32, baseline_offset: f32) -> u16 {
    let scaled = (millivolts / 1000.0 - baseline_offset + 0.5) * 65535.0;
    scaled.clamp(0.0, 65535.0) as u16
}

/// Convert a stored sample value back to millivolts.
pub fn decode_sample(raw: u16, baseline_offset: f32) -> f32 {
    (f32::from(raw) / 65535.0 - 0.5 + baseline_offset) * 1000.0
}

/// Name block content of channel `number` (1-based).
pub fn channel_block_name(number: usize) -> Vec<u8> {
    format!("C{number:03}\n\0").into_bytes()
}

fn parse_channel_block_name(bytes: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(bytes).ok()?;
    text.trim_end_matches(['\0', '\n']).strip_prefix('C')?.parse().ok()
}

/// Converter for [`EVENT_TYPE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Drs4Converter;

struct Channel {
    index: usize,
    name: String,
    tcal: Vec<f32>,
}

struct Drs4Decoder {
    channels: Vec<Channel>,
    baseline_offset: f32,
    wave_depth: usize,
}

impl Converter for Drs4Converter {
    fn begin_run(&self, bore: &Event, _config: &ConversionConfig) -> AppResult<Box<dyn RunDecoder>> {
        let n_channels: usize = bore.get_tag_as("NChannels", 4);
        let active: u32 = bore.get_tag_as("ActiveChannels", 255);
        let baseline_offset: f32 = bore.get_tag_as("BaselineOffset", 0.0);
        let wave_depth: usize = bore.get_tag_as("WaveDepth", 1024);

        let mut channels = Vec::new();
        for index in (0..n_channels).filter(|ch| *ch < 32 && active & (1u32 << *ch) != 0) {
            let block_id = channels.len() as u32;
            let tcal = bore.get_block_f32(block_id)?;
            if tcal.len() < wave_depth {
                return Err(DaqError::Configuration(format!(
                    "time calibration of channel {} has {} cells, wave depth is {wave_depth}",
                    index + 1,
                    tcal.len()
                )));
            }
            let name = bore.get_tag(&format!("CH_{}", index + 1), "OFF").to_string();
            channels.push(Channel { index, name, tcal });
        }
        info!(
            serial = bore.get_tag("SerialNumber", "-1"),
            channels = channels.len(),
            wave_depth,
            baseline_offset,
            "DRS4 converter initialized"
        );
        Ok(Box::new(Drs4Decoder {
            channels,
            baseline_offset,
            wave_depth,
        }))
    }
}

impl RunDecoder for Drs4Decoder {
    fn decode(&mut self, raw: &Event, out: &mut StandardEvent) -> AppResult<()> {
        let fail = |reason: String| DaqError::decode(raw.run_number(), raw.event_number(), reason);

        let trigger_cell = raw.get_block(0)?;
        let trigger_cell: [u8; 4] = trigger_cell
            .try_into()
            .map_err(|_| fail(format!("trigger cell block has {} bytes", trigger_cell.len())))?;
        let trigger_cell = u16::try_from(i32::from_le_bytes(trigger_cell))
            .map_err(|_| fail("negative trigger cell".to_string()))?;
        let timestamp = raw.get_block(1)?;
        let timestamp: [u8; 8] = timestamp
            .try_into()
            .map_err(|_| fail(format!("timestamp block has {} bytes", timestamp.len())))?;
        let timestamp = u64::from_le_bytes(timestamp);

        for (k, channel) in self.channels.iter().enumerate() {
            let name_id = 2 + 2 * k as u32;
            let number = parse_channel_block_name(raw.get_block(name_id)?)
                .ok_or_else(|| fail(format!("block {name_id} is not a channel name")))?;
            if number != channel.index + 1 {
                return Err(fail(format!(
                    "channel C{number:03} is not active in this run (expected C{:03})",
                    channel.index + 1
                )));
            }
            let samples = raw.get_block_u16(name_id + 1)?;
            if samples.len() != self.wave_depth {
                return Err(fail(format!(
                    "channel {number} has {} samples, wave depth is {}",
                    samples.len(),
                    self.wave_depth
                )));
            }

            let mut waveform = StandardWaveform::new(channel.index as u32, DETECTOR_TYPE, channel.name.clone());
            waveform.set_channel_name(format!("C{number:03}"));
            waveform.set_channel_number(number as i32);
            waveform.set_trigger_cell(trigger_cell);
            waveform.set_timestamp(timestamp);
            waveform.set_samples(
                samples
                    .iter()
                    .map(|raw| decode_sample(*raw, self.baseline_offset))
                    .collect(),
            );
            waveform
                .set_times(&channel.tcal)
                .map_err(|e| fail(e.to_string()))?;
            out.add_waveform(waveform);
        }
        if self.channels.len() * 2 + 2 < raw.num_blocks() {
            return Err(fail(format!(
                "{} blocks for {} active channels",
                raw.num_blocks(),
                self.channels.len()
            )));
        }
        out.set_detector_type(DETECTOR_TYPE);
        Ok(())
    }
}
