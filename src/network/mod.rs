//! Network transport between run control, producers and data collectors.
//!
//! Two channels exist: a request/response control channel ([`CommandEndpoint`] and
//! [`RemoteLink`]) and a one-way data channel ([`DataSender`] and [`DataReceiver`]). Both
//! carry length-prefixed frames.

pub mod data;
pub mod endpoint;
pub mod frame;
pub mod protocol;

pub use data::{DataReceiver, DataSender};
pub use endpoint::{CommandEndpoint, RemoteLink};
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use protocol::{CommandRequest, ResponseStatus, StatusResponse};
