//! Canonical decoded representation shared by all converters.

mod event;
mod plane;
mod waveform;

pub use event::{StandardEvent, CMS_PLANE_PREFIX};
pub use plane::{Hit, StandardPlane};
pub use waveform::StandardWaveform;
