//! Simulated CMS pixel telescope front-end.
//!
//! Generates self-triggered readouts in the word format understood by the CMS pixel
//! converter. Hits are drawn per ROC with a configurable probability; a fixed `seed`
//! makes a run reproducible.

use super::{PollResult, Producer};
use crate::config::ProducerConfig;
use crate::converter::cmspixel::{
    calibration_factor, event_type_for, PixelHit, Readout, ROC_NUMCOLS, ROC_NUMROWS,
};
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

// Triggers kept by the simulated testboard buffer after the run stops
const BUFFER_DEPTH: u32 = 32;

/// Simulated CMS pixel producer.
pub struct CmsPixelProducer {
    name: String,
    event_type: &'static str,
    detector: String,
    roctype: String,
    tbmtype: String,
    pcbtype: String,
    mask_file: String,
    dacs: String,
    planes: u16,
    tlu_waiting_time: Duration,
    trigger_period: Duration,
    hit_probability: f64,
    rng: StdRng,
    run: u32,
    running: bool,
    last_trigger: Instant,
    trigger_count: u16,
    buffered: Vec<Event>,
    events: u64,
    filled: u64,
}

impl CmsPixelProducer {
    /// Unconfigured producer for instance `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            event_type: "CMSPixelDUT",
            detector: String::new(),
            roctype: "psi46digv21respin".to_string(),
            tbmtype: "notbm".to_string(),
            pcbtype: "desytb".to_string(),
            mask_file: String::new(),
            dacs: String::new(),
            planes: 1,
            tlu_waiting_time: Duration::from_millis(4000),
            trigger_period: Duration::from_millis(10),
            hit_probability: 0.5,
            rng: StdRng::from_entropy(),
            run: 0,
            running: false,
            last_trigger: Instant::now(),
            trigger_count: 0,
            buffered: Vec::new(),
            events: 0,
            filled: 0,
        }
    }

    fn readout(&mut self) -> Event {
        let mut readout = Readout {
            trigger_count: self.trigger_count & 0xFF,
            phase: self.rng.gen_range(0..16),
            hits: Vec::new(),
        };
        self.trigger_count = self.trigger_count.wrapping_add(1);
        for roc in 0..self.planes {
            if self.rng.gen_bool(self.hit_probability) {
                let cluster = self.rng.gen_range(1..=3);
                let col = self.rng.gen_range(0..ROC_NUMCOLS - 1);
                let row = self.rng.gen_range(0..ROC_NUMROWS - 2);
                for k in 0..cluster {
                    readout.hits.push(PixelHit {
                        roc,
                        col: col + (k & 1),
                        row: row + k / 2,
                        adc: self.rng.gen_range(20..256),
                    });
                }
            }
        }

        self.events += 1;
        if !readout.hits.is_empty() {
            self.filled += 1;
        }
        let mut event = Event::new(self.event_type);
        event.add_block_u16(0, &readout.to_words(self.planes));
        event
    }

    fn yield_percent(&self) -> Option<u64> {
        (self.events > 0).then(|| 100 * self.filled / self.events)
    }
}

#[async_trait]
impl Producer for CmsPixelProducer {
    fn event_type(&self) -> &str {
        self.event_type
    }

    fn grace_period(&self) -> Duration {
        self.tlu_waiting_time
    }

    async fn configure(&mut self, config: &ProducerConfig) -> AppResult<()> {
        let requested = config.get_str("event_type", "INVALID");
        self.event_type = event_type_for(&requested).ok_or_else(|| {
            DaqError::Configuration(format!(
                "{}: event_type '{requested}' is none of dut, ref, trp, analog, digital",
                self.name
            ))
        })?;
        self.detector = config.get_str("detector_name", "INVALID");
        self.roctype = config.get_str("roctype", "psi46digv21respin");
        if calibration_factor(&self.roctype).is_none() {
            return Err(DaqError::Configuration(format!(
                "{}: unsupported roctype '{}'",
                self.name, self.roctype
            )));
        }
        self.tbmtype = config.get_str("tbmtype", "notbm");
        self.pcbtype = config.get_str("pcbtype", "desytb");
        self.mask_file = config.get_str("maskFile", "");
        self.dacs = config.get_str("dacs", "");
        let planes: i64 = config.get_or("planes", 1);
        self.planes = u16::try_from(planes)
            .ok()
            .filter(|p| (1..=16).contains(p))
            .ok_or_else(|| {
                DaqError::Configuration(format!("{}: planes must be 1 to 16, got {planes}", self.name))
            })?;
        self.hit_probability = config.get_or("hit_probability", 0.5f64);
        if !(0.0..=1.0).contains(&self.hit_probability) {
            return Err(DaqError::Configuration(format!(
                "{}: hit_probability {} is not a probability",
                self.name, self.hit_probability
            )));
        }
        self.tlu_waiting_time = Duration::from_millis(config.get_or("tlu_waiting_time", 4000u64));
        self.trigger_period =
            Duration::from_millis(config.get_or("self_trigger_period", 10u64).max(1));
        self.rng = match config.get_or::<Option<u64>>("seed", None) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            producer = %self.name,
            event_type = self.event_type,
            detector = %self.detector,
            roctype = %self.roctype,
            planes = self.planes,
            tlu_waiting_time = ?self.tlu_waiting_time,
            "CMS pixel producer configured"
        );
        Ok(())
    }

    async fn begin_run(&mut self, run_number: u32) -> AppResult<Event> {
        self.run = run_number;
        self.events = 0;
        self.filled = 0;
        self.trigger_count = 0;
        self.buffered.clear();
        self.last_trigger = Instant::now();
        self.running = true;

        let mut bore = Event::new(self.event_type);
        bore.set_tag("ROCTYPE", self.roctype.as_str());
        bore.set_tag("TBMTYPE", self.tbmtype.as_str());
        bore.set_tag("MASKFILE", self.mask_file.as_str());
        bore.set_tag_value("PLANES", self.planes);
        bore.set_tag("DACS", self.dacs.as_str());
        bore.set_tag("PCBTYPE", self.pcbtype.as_str());
        bore.set_tag("DETECTOR", self.detector.as_str());
        bore.set_tag("EVENTTYPE", self.event_type.trim_start_matches("CMSPixel"));
        Ok(bore)
    }

    async fn poll(&mut self) -> PollResult {
        if !self.running || self.last_trigger.elapsed() < self.trigger_period {
            return PollResult::NoEventYet;
        }
        self.last_trigger += self.trigger_period;
        PollResult::Event(self.readout())
    }

    async fn end_run(&mut self) -> AppResult<()> {
        self.running = false;
        let pending = (self.last_trigger.elapsed().as_micros()
            / self.trigger_period.as_micros().max(1))
        .min(u128::from(BUFFER_DEPTH));
        for _ in 0..pending {
            let event = self.readout();
            self.buffered.push(event);
        }
        Ok(())
    }

    async fn drain(&mut self) -> AppResult<Vec<Event>> {
        let events = std::mem::take(&mut self.buffered);
        info!(
            producer = %self.name,
            run = self.run,
            detector = %self.detector,
            triggers = self.events,
            filled = self.filled,
            yield_percent = ?self.yield_percent(),
            "post run read-out finished"
        );
        Ok(events)
    }

    async fn terminate(&mut self) -> AppResult<()> {
        self.running = false;
        self.buffered.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversionConfig;
    use crate::converter::{CmsPixelConverter, Converter};
    use crate::standard::StandardEvent;

    fn config() -> ProducerConfig {
        ProducerConfig::new("CMSREF", "CMSPixelProducer")
            .with_param("event_type", "ref")
            .with_param("detector_name", "M4587")
            .with_param("roctype", "psi46v2")
            .with_param("planes", 4)
            .with_param("hit_probability", 1.0)
            .with_param("self_trigger_period", 1)
            .with_param("seed", 7)
    }

    #[tokio::test]
    async fn test_configure_maps_event_type() {
        let mut producer = CmsPixelProducer::new("CMSREF");
        producer.configure(&config()).await.unwrap();
        assert_eq!(producer.event_type(), "CMSPixelREF");
        assert_eq!(producer.grace_period(), Duration::from_millis(4000));

        let bad = config().with_param("event_type", "telescope");
        assert!(matches!(
            producer.configure(&bad).await,
            Err(DaqError::Configuration(_))
        ));
        let bad = config().with_param("roctype", "psi99");
        assert!(producer.configure(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_readouts_decode_with_the_converter() {
        let mut producer = CmsPixelProducer::new("CMSREF");
        producer.configure(&config()).await.unwrap();
        let bore = producer.begin_run(12).await.unwrap();
        assert_eq!(bore.get_tag("ROCTYPE", ""), "psi46v2");
        assert_eq!(bore.get_tag("DETECTOR", ""), "M4587");
        assert_eq!(bore.get_tag("EVENTTYPE", ""), "REF");

        tokio::time::sleep(Duration::from_millis(3)).await;
        let event = match producer.poll().await {
            PollResult::Event(event) => event,
            other => panic!("expected an event, got {other:?}"),
        };
        assert_eq!(event.num_blocks(), 1);

        let mut decoder = CmsPixelConverter::new("CMSPixelREF")
            .begin_run(&bore, &ConversionConfig::default())
            .unwrap();
        let mut out = StandardEvent::from_raw(&event);
        decoder.decode(&event, &mut out).unwrap();
        assert_eq!(out.num_planes(), 4);
        assert!(out.planes().iter().all(|plane| plane.total_hits() > 0));
    }

    #[tokio::test]
    async fn test_no_events_before_run_or_after_stop() {
        let mut producer = CmsPixelProducer::new("CMSREF");
        producer.configure(&config()).await.unwrap();
        assert!(matches!(producer.poll().await, PollResult::NoEventYet));
        producer.begin_run(1).await.unwrap();
        producer.end_run().await.unwrap();
        assert!(matches!(producer.poll().await, PollResult::NoEventYet));
        let drained = producer.drain().await.unwrap();
        assert!(drained.len() <= BUFFER_DEPTH as usize);
        assert!(producer.drain().await.unwrap().is_empty());
    }
}
