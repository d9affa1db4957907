//! Simulated DRS4 evaluation board.
//!
//! Produces self-triggered waveforms on up to four channels: a noisy baseline with a
//! negative pulse at a random position. The time calibration published in the BORE is a
//! fixed per-cell jitter around the nominal bin width.

use super::{PollResult, Producer};
use crate::config::ProducerConfig;
use crate::converter::drs4::{channel_block_name, encode_sample, EVENT_TYPE};
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const N_CHANNELS: usize = 4;
const FIRMWARE: u32 = 30000;
const BOARD_TYPE: u32 = 9;
// Nominal bin width in ns at 5 GSPS
const BIN_WIDTH_NS: f32 = 0.2;

/// Simulated DRS4 producer.
pub struct Drs4Producer {
    name: String,
    serial_number: i64,
    active_channels: u32,
    baseline_offset: f32,
    wave_depth: usize,
    channel_names: [String; N_CHANNELS],
    tlu_waiting_time: Duration,
    trigger_period: Duration,
    pulse_amplitude: f32,
    rng: StdRng,
    tcal: Vec<Vec<f32>>,
    run: u32,
    running: bool,
    started: Instant,
    last_trigger: Instant,
    events: u64,
}

impl Drs4Producer {
    /// Unconfigured producer for instance `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            serial_number: -1,
            active_channels: 255,
            baseline_offset: 0.0,
            wave_depth: 1024,
            channel_names: Default::default(),
            tlu_waiting_time: Duration::from_millis(4000),
            trigger_period: Duration::from_millis(10),
            pulse_amplitude: 150.0,
            rng: StdRng::from_entropy(),
            tcal: Vec::new(),
            run: 0,
            running: false,
            started: Instant::now(),
            last_trigger: Instant::now(),
            events: 0,
        }
    }

    fn active(&self) -> impl Iterator<Item = usize> + '_ {
        (0..N_CHANNELS).filter(move |ch| self.active_channels & (1 << ch) != 0)
    }

    fn waveform(&mut self) -> Vec<u16> {
        let peak = self.rng.gen_range(self.wave_depth / 4..self.wave_depth * 3 / 4) as f32;
        let amplitude = self.pulse_amplitude * self.rng.gen_range(0.5f32..1.5);
        (0..self.wave_depth)
            .map(|i| {
                let dt = (i as f32 - peak) / 8.0;
                let pulse = -amplitude * (-dt * dt).exp();
                let noise = self.rng.gen_range(-2.0f32..2.0);
                encode_sample(pulse + noise, self.baseline_offset)
            })
            .collect()
    }

    fn trigger(&mut self) -> Event {
        let mut event = Event::new(EVENT_TYPE);
        let trigger_cell = self.rng.gen_range(0..self.wave_depth as i32);
        let timestamp = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
        event.add_block(0, trigger_cell.to_le_bytes().to_vec());
        event.add_block(1, timestamp.to_le_bytes().to_vec());
        let channels: Vec<usize> = self.active().collect();
        let mut block = 2;
        for ch in channels {
            event.add_block(block, channel_block_name(ch + 1));
            let samples = self.waveform();
            event.add_block_u16(block + 1, &samples);
            block += 2;
        }
        self.events += 1;
        event
    }
}

#[async_trait]
impl Producer for Drs4Producer {
    fn event_type(&self) -> &str {
        EVENT_TYPE
    }

    fn grace_period(&self) -> Duration {
        self.tlu_waiting_time
    }

    async fn configure(&mut self, config: &ProducerConfig) -> AppResult<()> {
        self.serial_number = config.get_or("serial_number", -1i64);
        self.active_channels = config.get_or("activated_channels", 255u32);
        if self.active().next().is_none() {
            return Err(DaqError::Configuration(format!(
                "{}: activated_channels {:#x} selects none of the {N_CHANNELS} channels",
                self.name, self.active_channels
            )));
        }
        let offset: f32 = config.get_or("base_line_offset", 0.0f32);
        self.baseline_offset = if offset.abs() > 0.5 {
            warn!(producer = %self.name, offset, "baseline offset cannot be larger than 0.5, setting it to 0");
            0.0
        } else {
            offset
        };
        self.wave_depth = config.get_or("wave_depth", 1024usize);
        if !(16..=2048).contains(&self.wave_depth) {
            return Err(DaqError::Configuration(format!(
                "{}: wave_depth {} outside 16 to 2048",
                self.name, self.wave_depth
            )));
        }
        for (ch, name) in self.channel_names.iter_mut().enumerate() {
            *name = config.get_str(&format!("CH_{}", ch + 1), "OFF");
        }
        self.tlu_waiting_time = Duration::from_millis(config.get_or("tlu_waiting_time", 4000u64));
        self.trigger_period =
            Duration::from_millis(config.get_or("self_trigger_period", 10u64).max(1));
        self.pulse_amplitude = config.get_or("pulse_amplitude", 150.0f32);
        self.rng = match config.get_or::<Option<u64>>("seed", None) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let depth = self.wave_depth;
        let channels: Vec<usize> = self.active().collect();
        self.tcal = channels
            .iter()
            .map(|_| {
                (0..depth)
                    .map(|_| BIN_WIDTH_NS * self.rng.gen_range(0.95f32..1.05))
                    .collect()
            })
            .collect();

        info!(
            producer = %self.name,
            serial = self.serial_number,
            active_channels = self.active_channels,
            baseline_offset = self.baseline_offset,
            wave_depth = self.wave_depth,
            "DRS4 producer configured"
        );
        Ok(())
    }

    async fn begin_run(&mut self, run_number: u32) -> AppResult<Event> {
        self.run = run_number;
        self.events = 0;
        self.started = Instant::now();
        self.last_trigger = self.started;
        self.running = true;

        let mut bore = Event::new(EVENT_TYPE);
        bore.set_tag_value("NChannels", N_CHANNELS);
        bore.set_tag_value("SerialNumber", self.serial_number);
        bore.set_tag_value("Firmware", FIRMWARE);
        bore.set_tag_value("BoardType", BOARD_TYPE);
        bore.set_tag_value("ActiveChannels", self.active_channels);
        bore.set_tag("DeviceName", "DRS4");
        bore.set_tag_value("BaselineOffset", self.baseline_offset);
        bore.set_tag_value("WaveDepth", self.wave_depth);
        for ch in 0..N_CHANNELS {
            let name = if self.active_channels & (1 << ch) != 0 {
                self.channel_names[ch].as_str()
            } else {
                "OFF"
            };
            bore.set_tag(format!("CH_{}", ch + 1), name);
        }
        for (block, tcal) in self.tcal.iter().enumerate() {
            bore.add_block_f32(block as u32, tcal);
        }
        Ok(bore)
    }

    async fn poll(&mut self) -> PollResult {
        if !self.running || self.last_trigger.elapsed() < self.trigger_period {
            return PollResult::NoEventYet;
        }
        self.last_trigger += self.trigger_period;
        PollResult::Event(self.trigger())
    }

    async fn end_run(&mut self) -> AppResult<()> {
        self.running = false;
        info!(producer = %self.name, run = self.run, events = self.events, "run ended");
        Ok(())
    }

    async fn terminate(&mut self) -> AppResult<()> {
        self.running = false;
        Ok(())
    }
}
