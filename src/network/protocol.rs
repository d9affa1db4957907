//! Control channel messages.
//!
//! Both messages are written with the crate codec, so strings are length-prefixed UTF-8
//! and integers little endian.

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use crate::run_control::{Command, CommandKind, ComponentStatus, State};
use chrono::Utc;
use serde::{Deserialize, Serialize};

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0,
    Error = 1,
    InvalidRequest = 2,
    Timeout = 3,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Success),
            1 => Some(ResponseStatus::Error),
            2 => Some(ResponseStatus::InvalidRequest),
            3 => Some(ResponseStatus::Timeout),
            _ => None,
        }
    }
}

/// Command sent by the run controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_id: u32,
    pub command: CommandKind,
    /// Logical name of the addressed component
    pub name: String,
    /// Run number for StartRun, 0 otherwise
    pub run_number: u32,
    /// TOML parameter table for Configure, empty otherwise
    pub payload: String,
    pub timestamp: u64,
}

impl CommandRequest {
    pub fn new(request_id: u32, name: impl Into<String>, command: &Command) -> AppResult<Self> {
        let (run_number, payload) = match command {
            Command::StartRun(run) => (*run, String::new()),
            Command::Configure(params) => (
                0,
                toml::to_string(params).map_err(|e| {
                    DaqError::Protocol(format!("cannot encode Configure parameters: {e}"))
                })?,
            ),
            _ => (0, String::new()),
        };
        Ok(Self {
            request_id,
            command: command.kind(),
            name: name.into(),
            run_number,
            payload,
            timestamp: now_millis(),
        })
    }

    /// Rebuild the command carried by the request.
    pub fn to_command(&self) -> AppResult<Command> {
        Ok(match self.command {
            CommandKind::Configure => {
                let params = toml::from_str(&self.payload).map_err(|e| {
                    DaqError::Protocol(format!("invalid Configure payload: {e}"))
                })?;
                Command::Configure(params)
            }
            CommandKind::StartRun => Command::StartRun(self.run_number),
            CommandKind::StopRun => Command::StopRun,
            CommandKind::Terminate => Command::Terminate,
            CommandKind::Status => Command::Status,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut ser = Serializer::new();
        ser.write(self);
        ser.into_vec()
    }

    pub fn decode(data: &[u8]) -> AppResult<Self> {
        decode_exact(data)
    }
}

impl Encode for CommandRequest {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&(self.command as u8));
        ser.write(&self.request_id);
        ser.write(&self.name);
        ser.write(&self.run_number);
        ser.write(&self.payload);
        ser.write(&self.timestamp);
    }
}

impl Decode for CommandRequest {
    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        let offset = de.position();
        let raw = de.read::<u8>()?;
        let command = CommandKind::from_u8(raw).ok_or_else(|| DaqError::CorruptRecord {
            offset: offset as u64,
            reason: format!("unknown command code {raw}"),
        })?;
        Ok(Self {
            command,
            request_id: de.read()?,
            name: de.read()?,
            run_number: de.read()?,
            payload: de.read()?,
            timestamp: de.read()?,
        })
    }
}

/// Answer to a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub request_id: u32,
    pub status: ResponseStatus,
    pub name: String,
    pub state: State,
    pub run_number: u32,
    pub events: u64,
    /// Last error of the component, or why the request failed; empty when none
    pub error: String,
    pub timestamp: u64,
}

impl StatusResponse {
    pub fn from_status(request_id: u32, status: &ComponentStatus) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            name: status.name.clone(),
            state: status.state,
            run_number: status.run_number,
            events: status.events,
            error: status.last_error.clone().unwrap_or_default(),
            timestamp: now_millis(),
        }
    }

    pub fn error(request_id: u32, status: ResponseStatus, name: &str, message: String) -> Self {
        Self {
            request_id,
            status,
            name: name.to_string(),
            state: State::Error,
            run_number: 0,
            events: 0,
            error: message,
            timestamp: now_millis(),
        }
    }

    /// Component status carried by a successful response.
    pub fn to_status(&self) -> ComponentStatus {
        ComponentStatus {
            name: self.name.clone(),
            state: self.state,
            run_number: self.run_number,
            events: self.events,
            last_error: (!self.error.is_empty()).then(|| self.error.clone()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut ser = Serializer::new();
        ser.write(self);
        ser.into_vec()
    }

    pub fn decode(data: &[u8]) -> AppResult<Self> {
        decode_exact(data)
    }
}

impl Encode for StatusResponse {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&(self.status as u8));
        ser.write(&self.request_id);
        ser.write(&self.name);
        ser.write(&(self.state as u8));
        ser.write(&self.run_number);
        ser.write(&self.events);
        ser.write(&self.error);
        ser.write(&self.timestamp);
    }
}

impl Decode for StatusResponse {
    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        let offset = de.position() as u64;
        let raw = de.read::<u8>()?;
        let status = ResponseStatus::from_u8(raw).ok_or_else(|| DaqError::CorruptRecord {
            offset,
            reason: format!("unknown response status {raw}"),
        })?;
        let request_id = de.read()?;
        let name = de.read()?;
        let offset = de.position() as u64;
        let raw = de.read::<u8>()?;
        let state = State::from_u8(raw).ok_or_else(|| DaqError::CorruptRecord {
            offset,
            reason: format!("unknown state {raw}"),
        })?;
        Ok(Self {
            request_id,
            status,
            name,
            state,
            run_number: de.read()?,
            events: de.read()?,
            error: de.read()?,
            timestamp: de.read()?,
        })
    }
}

fn decode_exact<T: Decode>(data: &[u8]) -> AppResult<T> {
    let mut de = Deserializer::new(data);
    let value = de.read()?;
    if !de.is_empty() {
        return Err(DaqError::Protocol(format!(
            "{} trailing bytes after message",
            de.remaining()
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_request_roundtrip() {
        let params: toml::Table = toml::from_str("roctype = \"psi46v2\"\nplanes = 4\n").unwrap();
        let req = CommandRequest::new(42, "CMSREF", &Command::Configure(params.clone())).unwrap();
        let decoded = CommandRequest::decode(&req.encode()).unwrap();

        assert_eq!(decoded, req);
        assert_eq!(decoded.to_command().unwrap(), Command::Configure(params));
    }

    #[test]
    fn test_start_run_carries_run_number() {
        let req = CommandRequest::new(1, "DRS4", &Command::StartRun(123)).unwrap();
        let decoded = CommandRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.command, CommandKind::StartRun);
        assert_eq!(decoded.to_command().unwrap(), Command::StartRun(123));
    }

    #[test]
    fn test_status_response_roundtrip() {
        let status = ComponentStatus {
            name: "DataCollector".into(),
            state: State::Running,
            run_number: 9,
            events: 1500,
            last_error: None,
        };
        let resp = StatusResponse::from_status(7, &status);
        let decoded = StatusResponse::decode(&resp.encode()).unwrap();

        assert_eq!(decoded, resp);
        assert_eq!(decoded.to_status(), status);
    }

    #[test]
    fn test_error_response_keeps_message() {
        let resp = StatusResponse::error(3, ResponseStatus::Timeout, "CMSREF", "no answer".into());
        let decoded = StatusResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.status, ResponseStatus::Timeout);
        assert_eq!(decoded.to_status().last_error.as_deref(), Some("no answer"));
    }

    #[test]
    fn test_unknown_codes_are_rejected() {
        let mut bytes = CommandRequest::new(1, "x", &Command::Status).unwrap().encode();
        bytes[0] = 0x7f;
        assert!(matches!(
            CommandRequest::decode(&bytes),
            Err(DaqError::CorruptRecord { offset: 0, .. })
        ));
        assert!(matches!(
            StatusResponse::decode(&[0, 1]),
            Err(DaqError::TruncatedInput { .. })
        ));
    }
}
