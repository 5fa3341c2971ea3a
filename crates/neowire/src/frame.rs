//! # Protocol Frames
//!
//! Defines the envelopes exchanged with the peer: one `CommitFrame` per
//! commit going out, and either a `ReplyFrame` or a `LogFrame` coming back.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Parallel Lists**: `args` and `argIsHandle` of a command always have equal length.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::value::Value;

/// One queued call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub name: String,
    pub signature_id: u32,
    pub args: Vec<Value>,
    pub arg_is_handle: Vec<bool>,
    /// Zero when the call returns void.
    pub result_handle_id: u32,
}

impl Command {
    pub fn new(name: impl Into<String>, signature_id: u32, result_handle_id: u32) -> Self {
        Self {
            name: name.into(),
            signature_id,
            args: Vec::new(),
            arg_is_handle: Vec::new(),
            result_handle_id,
        }
    }

    pub fn push_value(&mut self, value: Value) {
        self.args.push(value);
        self.arg_is_handle.push(false);
    }

    pub fn push_handle(&mut self, id: u32) {
        self.args.push(Value::from(id));
        self.arg_is_handle.push(true);
    }

    /// Ids of the handles this command reads.
    pub fn handle_args(&self) -> impl Iterator<Item = u32> + '_ {
        self.args
            .iter()
            .zip(&self.arg_is_handle)
            .filter(|(_, is_handle)| **is_handle)
            .filter_map(|(v, _)| v.as_u64().and_then(|id| u32::try_from(id).ok()))
    }

    fn validate(&self) -> Result<()> {
        if self.args.len() != self.arg_is_handle.len() {
            return Err(Error::ProtocolViolation(format!(
                "command '{}' has {} args but {} argIsHandle flags",
                self.name,
                self.args.len(),
                self.arg_is_handle.len()
            )));
        }
        if self.handle_args().count() != self.arg_is_handle.iter().filter(|h| **h).count() {
            return Err(Error::ProtocolViolation(format!(
                "command '{}' has a handle argument that is not a handle id",
                self.name
            )));
        }
        Ok(())
    }
}

/// The single outgoing message produced by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFrame {
    pub correlation_id: u64,
    pub commands: Vec<Command>,
    pub output_handle_ids: Vec<u32>,
}

impl CommitFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame: Self = serde_json::from_slice(bytes)?;
        for command in &frame.commands {
            command.validate()?;
        }
        Ok(frame)
    }
}

/// The peer's answer to one commit. `values` runs parallel to `outputHandleIds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    pub correlation_id: u64,
    pub values: Vec<Value>,
}

impl ReplyFrame {
    pub fn new(correlation_id: u64, values: Vec<Value>) -> Self {
        Self { correlation_id, values }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An out-of-band log line from the peer. Carries no correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    pub msg: String,
}

impl LogFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Top-level inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply(ReplyFrame),
    Log(LogFrame),
}

impl Inbound {
    /// Decode an inbound message. A message with a `correlationId` is a reply;
    /// one with only a `msg` is a log line; anything else is a violation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let (is_reply, is_log) = match &raw {
            serde_json::Value::Object(map) => (map.contains_key("correlationId"), map.contains_key("msg")),
            _ => return Err(Error::ProtocolViolation(format!("unexpected value from peer: {}", raw))),
        };

        if is_reply {
            Ok(Self::Reply(serde_json::from_value(raw)?))
        } else if is_log {
            Ok(Self::Log(serde_json::from_value(raw)?))
        } else {
            Err(Error::ProtocolViolation(format!("message has neither correlationId nor msg: {}", raw)))
        }
    }
}
