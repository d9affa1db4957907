//! CMS pixel telescope readout.
//!
//! Data events carry exactly one block `0` of little-endian 16-bit words. The upper nibble
//! of each word is its marker:
//!
//! ```text
//! 0xA000 | count << 4 | phase   event header (trigger count, trigger phase)
//! 0x7000 | roc                  ROC header, following hits belong to this ROC
//! 0x4000 | col                  \
//! 0x5000 | row                   } one pixel hit
//! 0x6000 | adc                  /
//! 0xE000 | hits                 trailer, number of hits in the event
//! ```

use super::{Converter, RunDecoder};
use crate::config::ConversionConfig;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::standard::{StandardEvent, StandardPlane};
use tracing::{debug, info};

/// Raw event types produced by CMS pixel front-ends.
pub const EVENT_TYPES: [&str; 5] = [
    "CMSPixelREF",
    "CMSPixelDUT",
    "CMSPixelTRP",
    "CMSPixelANA",
    "CMSPixelDIG",
];

/// Columns of one readout chip.
pub const ROC_NUMCOLS: u16 = 52;
/// Rows of one readout chip.
pub const ROC_NUMROWS: u16 = 80;

const MARKER_MASK: u16 = 0xF000;
const VALUE_MASK: u16 = 0x0FFF;
const EVENT_HEADER: u16 = 0xA000;
const ROC_HEADER: u16 = 0x7000;
const HIT_COLUMN: u16 = 0x4000;
const HIT_ROW: u16 = 0x5000;
const HIT_ADC: u16 = 0x6000;
const TRAILER: u16 = 0xE000;

/// Map the free-form `event_type` parameter of a producer onto its raw event type.
pub fn event_type_for(value: &str) -> Option<&'static str> {
    let value = value.to_lowercase();
    [
        ("dut", "CMSPixelDUT"),
        ("ref", "CMSPixelREF"),
        ("trp", "CMSPixelTRP"),
        ("analog", "CMSPixelANA"),
        ("digital", "CMSPixelDIG"),
    ]
    .into_iter()
    .find(|(key, _)| value.contains(key))
    .map(|(_, event_type)| event_type)
}

/// Pulse-height to charge factor of a ROC type.
pub fn calibration_factor(roctype: &str) -> Option<f64> {
    match roctype {
        "psi46v2" => Some(65.0),
        "psi46digv21respin" | "proc600" => Some(47.0),
        _ => None,
    }
}

/// One decoded pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelHit {
    /// ROC index within the module.
    pub roc: u16,
    /// Column on the ROC.
    pub col: u16,
    /// Row on the ROC.
    pub row: u16,
    /// Pulse height.
    pub adc: u16,
}

/// Content of one readout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readout {
    /// Trigger count, 8 bits.
    pub trigger_count: u16,
    /// Trigger phase, 4 bits.
    pub phase: u16,
    /// Hits in readout order.
    pub hits: Vec<PixelHit>,
}

impl Readout {
    /// Encode as readout words for a module of `planes` ROCs.
    pub fn to_words(&self, planes: u16) -> Vec<u16> {
        let mut words = Vec::with_capacity(2 + planes as usize + 3 * self.hits.len());
        words.push(EVENT_HEADER | (self.trigger_count & 0xFF) << 4 | (self.phase & 0xF));
        for roc in 0..planes {
            words.push(ROC_HEADER | roc);
            for hit in self.hits.iter().filter(|hit| hit.roc == roc) {
                words.push(HIT_COLUMN | (hit.col & VALUE_MASK));
                words.push(HIT_ROW | (hit.row & VALUE_MASK));
                words.push(HIT_ADC | (hit.adc & VALUE_MASK));
            }
        }
        words.push(TRAILER | (self.hits.len() as u16 & VALUE_MASK));
        words
    }

    /// Parse readout words of a module with `planes` ROCs.
    pub fn parse(words: &[u16], planes: u16) -> Result<Self, String> {
        let mut iter = words.iter().copied().enumerate();
        let header = match iter.next() {
            Some((_, word)) if word & MARKER_MASK == EVENT_HEADER => word,
            Some((_, word)) => return Err(format!("expected event header, found {word:#06x}")),
            None => return Err("empty readout".to_string()),
        };
        let mut readout = Readout {
            trigger_count: (header >> 4) & 0xFF,
            phase: header & 0xF,
            hits: Vec::new(),
        };

        let mut roc: Option<u16> = None;
        while let Some((pos, word)) = iter.next() {
            match word & MARKER_MASK {
                ROC_HEADER => {
                    let index = word & VALUE_MASK;
                    if index >= planes {
                        return Err(format!("ROC index {index} outside {planes} planes"));
                    }
                    roc = Some(index);
                }
                HIT_COLUMN => {
                    let roc = roc.ok_or_else(|| format!("pixel before ROC header at word {pos}"))?;
                    let row = expect_word(iter.next(), HIT_ROW, pos + 1)?;
                    let adc = expect_word(iter.next(), HIT_ADC, pos + 2)?;
                    let col = word & VALUE_MASK;
                    if col >= ROC_NUMCOLS || row >= ROC_NUMROWS {
                        return Err(format!("pixel ({col}, {row}) outside the ROC on ROC {roc}"));
                    }
                    readout.hits.push(PixelHit { roc, col, row, adc });
                }
                TRAILER => {
                    let expected = word & VALUE_MASK;
                    if pos + 1 != words.len() {
                        return Err(format!("trailer at word {pos} is not the last word"));
                    }
                    if usize::from(expected) != readout.hits.len() {
                        return Err(format!(
                            "trailer announces {expected} hits, decoded {}",
                            readout.hits.len()
                        ));
                    }
                    return Ok(readout);
                }
                marker => {
                    return Err(format!("unknown word marker {marker:#06x} at word {pos}"));
                }
            }
        }
        Err("readout has no trailer".to_string())
    }
}

fn expect_word(next: Option<(usize, u16)>, marker: u16, pos: usize) -> Result<u16, String> {
    match next {
        Some((_, word)) if word & MARKER_MASK == marker => Ok(word & VALUE_MASK),
        Some((_, word)) => Err(format!(
            "expected {marker:#06x} at word {pos}, found {word:#06x}"
        )),
        None => Err(format!("readout ends inside a pixel at word {pos}")),
    }
}

/// Converter for all CMS pixel event types.
#[derive(Debug, Clone)]
pub struct CmsPixelConverter {
    event_type: &'static str,
}

impl CmsPixelConverter {
    /// Converter producing planes of type `event_type`.
    pub fn new(event_type: &'static str) -> Self {
        Self { event_type }
    }
}

impl Converter for CmsPixelConverter {
    fn begin_run(&self, bore: &Event, config: &ConversionConfig) -> AppResult<Box<dyn RunDecoder>> {
        let roctype = bore.get_tag("ROCTYPE", "psi46v2");
        let factor = calibration_factor(roctype).ok_or_else(|| {
            DaqError::Configuration(format!("unknown ROCTYPE '{roctype}'"))
        })?;
        let planes: u16 = bore.get_tag_as("PLANES", 1);
        if planes == 0 {
            return Err(DaqError::Configuration("PLANES must be at least 1".to_string()));
        }
        let decoder = CmsPixelDecoder {
            plane_type: self.event_type.to_string(),
            detector: bore.get_tag("DETECTOR", "").to_string(),
            planes,
            rotated: bore.get_tag("PCBTYPE", "").contains("-rot"),
            factor: config.charge_calibration.then_some(factor),
            events: 0,
            pixels: 0,
        };
        info!(
            detector = %decoder.detector,
            event_type = self.event_type,
            roctype,
            tbmtype = bore.get_tag("TBMTYPE", "tbmemulator2"),
            planes,
            rotated = decoder.rotated,
            "CMS pixel converter initialized"
        );
        Ok(Box::new(decoder))
    }
}

struct CmsPixelDecoder {
    plane_type: String,
    detector: String,
    planes: u16,
    rotated: bool,
    factor: Option<f64>,
    events: u64,
    pixels: u64,
}

impl RunDecoder for CmsPixelDecoder {
    fn decode(&mut self, raw: &Event, out: &mut StandardEvent) -> AppResult<()> {
        let fail = |reason: String| DaqError::decode(raw.run_number(), raw.event_number(), reason);
        if raw.num_blocks() > 1 {
            return Err(fail(format!(
                "only one data block is expected, found {}",
                raw.num_blocks()
            )));
        }
        let bytes = raw.get_block(0)?;
        if bytes.len() % 2 != 0 {
            return Err(fail(format!("odd block length {}", bytes.len())));
        }
        let words = raw.get_block_u16(0)?;
        let readout = Readout::parse(&words, self.planes).map_err(fail)?;

        for roc in 0..self.planes {
            let mut plane = StandardPlane::new(u32::from(roc), self.plane_type.clone(), self.detector.clone());
            if self.rotated {
                plane.set_size_zs(u32::from(ROC_NUMROWS), u32::from(ROC_NUMCOLS), 1);
            } else {
                plane.set_size_zs(u32::from(ROC_NUMCOLS), u32::from(ROC_NUMROWS), 1);
            }
            for hit in readout.hits.iter().filter(|hit| hit.roc == roc) {
                let value = f64::from(hit.adc);
                let charge = self.factor.map_or(value, |factor| value * factor);
                let (x, y) = if self.rotated {
                    (hit.row, hit.col)
                } else {
                    (hit.col, hit.row)
                };
                plane.push_pixel(u32::from(x), u32::from(y), value, charge);
            }
            out.add_trigger_phase(readout.phase);
            out.add_trigger_count(u32::from(readout.trigger_count));
            out.add_plane(plane);
        }
        if out.detector_type().is_empty() {
            out.set_detector_type(self.plane_type.clone());
        }
        self.events += 1;
        self.pixels += readout.hits.len() as u64;
        Ok(())
    }

    fn end_run(&mut self) {
        debug!(
            detector = %self.detector,
            events = self.events,
            pixels = self.pixels,
            "CMS pixel decoding statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bore(tags: &[(&str, &str)]) -> Event {
        let mut bore = Event::new("CMSPixelREF");
        bore.set_bore();
        for (key, value) in tags {
            bore.set_tag(*key, *value);
        }
        bore
    }

    fn data(words: &[u16]) -> Event {
        let mut event = Event::new("CMSPixelREF");
        event.set_run_number(7);
        event.set_event_number(1);
        event.add_block_u16(0, words);
        event
    }

    fn sample_readout() -> Readout {
        Readout {
            trigger_count: 3,
            phase: 2,
            hits: vec![
                PixelHit { roc: 0, col: 10, row: 20, adc: 100 },
                PixelHit { roc: 1, col: 51, row: 79, adc: 7 },
            ],
        }
    }

    #[test]
    fn test_event_type_mapping() {
        assert_eq!(event_type_for("DUT"), Some("CMSPixelDUT"));
        assert_eq!(event_type_for("telescope_ref"), Some("CMSPixelREF"));
        assert_eq!(event_type_for("analog"), Some("CMSPixelANA"));
        assert_eq!(event_type_for("digital"), Some("CMSPixelDIG"));
        assert_eq!(event_type_for("INVALID"), None);
    }

    #[test]
    fn test_readout_words_layout() {
        let words = sample_readout().to_words(2);
        assert_eq!(words[0], 0xA032);
        assert_eq!(&words[1..5], &[0x7000, 0x400A, 0x5014, 0x6064]);
        assert_eq!(words[5], 0x7001);
        assert_eq!(*words.last().unwrap(), 0xE002);
        assert_eq!(Readout::parse(&words, 2).unwrap(), sample_readout());
    }

    #[test]
    fn test_readout_parse_failures() {
        let words = sample_readout().to_words(2);
        assert!(Readout::parse(&words, 1).unwrap_err().contains("ROC index 1"));
        let mut bad_trailer = words.clone();
        *bad_trailer.last_mut().unwrap() = 0xE005;
        assert!(Readout::parse(&bad_trailer, 2).unwrap_err().contains("announces 5"));
        let mut unknown = words.clone();
        unknown[2] = 0x9000;
        assert!(Readout::parse(&unknown, 2).unwrap_err().contains("unknown word marker"));
        assert!(Readout::parse(&words[..words.len() - 1], 2).is_err());
        assert!(Readout::parse(&[0xA000, 0x7000, 0x4035, 0x5000, 0x6000, 0xE001], 1)
            .unwrap_err()
            .contains("outside the ROC"));
    }

    #[test]
    fn test_decode_builds_one_plane_per_roc() {
        let converter = CmsPixelConverter::new("CMSPixelREF");
        let bore = bore(&[("ROCTYPE", "psi46digv21respin"), ("PLANES", "2"), ("DETECTOR", "REF1")]);
        let mut decoder = converter.begin_run(&bore, &ConversionConfig::default()).unwrap();
        let raw = data(&sample_readout().to_words(2));
        let mut out = StandardEvent::from_raw(&raw);
        decoder.decode(&raw, &mut out).unwrap();

        assert_eq!(out.num_planes(), 2);
        assert_eq!(out.num_cms_planes(), 2);
        let plane = out.get_plane(1).unwrap();
        assert_eq!(plane.plane_type(), "CMSPixelREF");
        assert_eq!(plane.sensor(), "REF1");
        assert_eq!((plane.xsize(), plane.ysize()), (52, 80));
        let hit = plane.hit(0, 0).unwrap();
        assert_eq!((hit.x, hit.y, hit.pixel, hit.charge), (51, 79, 7.0, 7.0 * 47.0));
        assert_eq!(out.trigger_phase(1).unwrap(), 2);
        assert_eq!(out.trigger_count(0).unwrap(), 3);
    }

    #[test]
    fn test_rotated_pcb_swaps_axes() {
        let converter = CmsPixelConverter::new("CMSPixelDUT");
        let bore = bore(&[("PCBTYPE", "desytb-rot")]);
        let config = ConversionConfig {
            charge_calibration: false,
            ..ConversionConfig::default()
        };
        let mut decoder = converter.begin_run(&bore, &config).unwrap();
        let raw = data(&[0xA000, 0x7000, 0x4003, 0x5046, 0x6010, 0xE001]);
        let mut out = StandardEvent::new();
        decoder.decode(&raw, &mut out).unwrap();
        let plane = out.get_plane(0).unwrap();
        assert_eq!((plane.xsize(), plane.ysize()), (80, 52));
        let hit = plane.hit(0, 0).unwrap();
        assert_eq!((hit.x, hit.y, hit.charge), (70, 3, 16.0));
    }

    #[test]
    fn test_unknown_roctype_is_rejected() {
        let converter = CmsPixelConverter::new("CMSPixelREF");
        let err = converter
            .begin_run(&bore(&[("ROCTYPE", "psi99")]), &ConversionConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("psi99"));
    }

    #[test]
    fn test_malformed_blocks_are_decode_failures() {
        let converter = CmsPixelConverter::new("CMSPixelREF");
        let mut decoder = converter
            .begin_run(&bore(&[]), &ConversionConfig::default())
            .unwrap();
        let mut two_blocks = data(&[0xA000, 0xE000]);
        two_blocks.add_block(1, vec![0]);
        let mut odd = Event::new("CMSPixelREF");
        odd.add_block(0, vec![0, 0xA0, 0]);
        for raw in [two_blocks, odd] {
            let err = decoder.decode(&raw, &mut StandardEvent::new()).unwrap_err();
            assert!(matches!(err, DaqError::DecodeFailure { .. }));
        }
        let empty = Event::new("CMSPixelREF");
        assert!(matches!(
            decoder.decode(&empty, &mut StandardEvent::new()),
            Err(DaqError::NoSuchBlock { id: 0 })
        ));
    }
}
