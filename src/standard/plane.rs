//! Zero-suppressed pixel planes.

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// One pixel hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Raw value as read out (ADC, time over threshold, ...).
    pub pixel: f64,
    /// Calibrated charge.
    pub charge: f64,
}

impl Encode for Hit {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.x);
        ser.write(&self.y);
        ser.write(&self.pixel);
        ser.write(&self.charge);
    }
}

impl Decode for Hit {
    const MIN_SIZE: usize = 24;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Ok(Hit {
            x: de.read()?,
            y: de.read()?,
            pixel: de.read()?,
            charge: de.read()?,
        })
    }
}

/// One sensor's hits for one event, grouped in readout frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardPlane {
    id: u32,
    #[serde(rename = "type")]
    plane_type: String,
    sensor: String,
    xsize: u32,
    ysize: u32,
    frames: Vec<Vec<Hit>>,
}

impl StandardPlane {
    /// Create an empty plane with a single frame.
    pub fn new(id: u32, plane_type: impl Into<String>, sensor: impl Into<String>) -> Self {
        Self {
            id,
            plane_type: plane_type.into(),
            sensor: sensor.into(),
            xsize: 0,
            ysize: 0,
            frames: vec![Vec::new()],
        }
    }

    /// Sensor id within its detector.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Plane type.
    pub fn plane_type(&self) -> &str {
        &self.plane_type
    }

    /// Detector or sensor name.
    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    /// Number of columns.
    pub fn xsize(&self) -> u32 {
        self.xsize
    }

    /// Number of rows.
    pub fn ysize(&self) -> u32 {
        self.ysize
    }

    /// Set the sensor geometry for zero-suppressed data and reset to `frames` empty frames.
    pub fn set_size_zs(&mut self, xsize: u32, ysize: u32, frames: usize) {
        self.xsize = xsize;
        self.ysize = ysize;
        self.frames = vec![Vec::new(); frames.max(1)];
    }

    /// Append a hit to the first frame.
    pub fn push_pixel(&mut self, x: u32, y: u32, pixel: f64, charge: f64) {
        self.frames[0].push(Hit {
            x,
            y,
            pixel,
            charge,
        });
    }

    /// Append a hit to `frame`.
    pub fn push_pixel_in_frame(&mut self, frame: usize, hit: Hit) -> AppResult<()> {
        let len = self.frames.len();
        self.frames
            .get_mut(frame)
            .ok_or_else(|| DaqError::out_of_range("frame", frame, len))?
            .push(hit);
        Ok(())
    }

    /// Number of readout frames.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of hits in `frame`; zero for a missing frame.
    pub fn hit_pixels(&self, frame: usize) -> usize {
        self.frames.get(frame).map_or(0, Vec::len)
    }

    /// Number of hits over all frames.
    pub fn total_hits(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// Hit `index` of `frame`.
    pub fn hit(&self, index: usize, frame: usize) -> AppResult<&Hit> {
        let hits = self
            .frames
            .get(frame)
            .ok_or_else(|| DaqError::out_of_range("frame", frame, self.frames.len()))?;
        hits.get(index)
            .ok_or_else(|| DaqError::out_of_range("hit", index, hits.len()))
    }

    /// All hits of `frame`.
    pub fn hits(&self, frame: usize) -> &[Hit] {
        self.frames.get(frame).map_or(&[], Vec::as_slice)
    }

    /// Copy with columns and rows exchanged, for sensors mounted rotated on their carrier.
    pub fn transposed(&self) -> Self {
        Self {
            id: self.id,
            plane_type: self.plane_type.clone(),
            sensor: self.sensor.clone(),
            xsize: self.ysize,
            ysize: self.xsize,
            frames: self
                .frames
                .iter()
                .map(|hits| {
                    hits.iter()
                        .map(|hit| Hit {
                            x: hit.y,
                            y: hit.x,
                            ..*hit
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

impl Encode for StandardPlane {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.id);
        ser.write(&self.plane_type);
        ser.write(&self.sensor);
        ser.write(&self.xsize);
        ser.write(&self.ysize);
        ser.write(&self.frames);
    }
}

impl Decode for StandardPlane {
    const MIN_SIZE: usize = 24;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Ok(Self {
            id: de.read()?,
            plane_type: de.read()?,
            sensor: de.read()?,
            xsize: de.read()?,
            ysize: de.read()?,
            frames: de.read()?,
        })
    }
}
