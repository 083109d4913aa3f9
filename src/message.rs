//! A module which contains the definition of the messages exchanged between the nodes of the
//! engine: the master, the slaves and any connected client.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// The application-level opcodes carried by [`Message`]. The values are arbitrary but must stay
/// stable within one deployment, because they travel on the wire as plain integers.
pub mod codes {
    pub const SETTING_UP: i32 = 1;
    pub const MAPPING: i32 = 2;
    pub const REDUCING: i32 = 3;
    pub const SLAVE_CONNECTED: i32 = 4;
    pub const SLAVE_DISCONNECTED: i32 = 5;
    pub const IDLE: i32 = 6;
    pub const MAP_CHUNK: i32 = 7;
    pub const END_MAP: i32 = 8;
    pub const KEY_FOUND: i32 = 9;
    pub const LOAD_SLAVE_ADDRESSES: i32 = 10;
    pub const REDUCE_KEYS: i32 = 11;
    pub const KEY_VALUE: i32 = 12;
    pub const REQUEST_VALUES: i32 = 13;
    pub const END_OF_DATA_STREAM: i32 = 14;
    pub const END_OF_RESULT_STREAM: i32 = 15;
    pub const RESULT_PAIR: i32 = 16;
    pub const FAILURE: i32 = 17;
    pub const SEND_RESULT: i32 = 18;
}

/// The payload of a [`Message`]. The payload kind decides the wire framing: serialized values
/// travel inside a MESSAGE frame, file references are expanded into a FILE frame carrying the
/// file *content* (peers do not share a filesystem, so paths are never sent across the wire).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Data(Vec<u8>),
    File(PathBuf),
}

/// The error returned when a typed payload cannot be extracted from a message.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message with opcode {0} carries no serialized payload")]
    Missing(i32),
    #[error("could not decode the message payload")]
    Decode(#[from] bincode::Error),
}

/// A single unit of inter-node communication: an opcode plus an optional payload. Messages are
/// the only way state crosses node boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    code: i32,
    payload: Payload,
}

impl Message {
    /// Creates a message with no payload.
    pub fn new(code: i32) -> Self {
        Message { code, payload: Payload::Empty }
    }

    /// Creates a message whose payload is the bincode serialization of `data`.
    pub fn with_data<T: Serialize>(code: i32, data: &T) -> Result<Self, bincode::Error> {
        let bytes = bincode::serialize(data)?;
        Ok(Message { code, payload: Payload::Data(bytes) })
    }

    /// Creates a message which references a local file. Dispatching it streams the file content.
    pub fn with_file<P: Into<PathBuf>>(code: i32, path: P) -> Self {
        Message { code, payload: Payload::File(path.into()) }
    }

    /// Reassembles a message from its framed parts. Used by the frame decoder.
    pub fn from_parts(code: i32, payload: Payload) -> Self {
        Message { code, payload }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Deserializes the payload into a concrete type. The caller knows the expected type from
    /// the opcode; a mismatch surfaces as a decode fault, not a crash.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        match &self.payload {
            Payload::Data(bytes) => Ok(bincode::deserialize(bytes)?),
            _ => Err(PayloadError::Missing(self.code)),
        }
    }

    /// The path of the materialized file, for messages received through a FILE frame.
    pub fn file(&self) -> Option<&Path> {
        match &self.payload {
            Payload::File(path) => Some(path),
            _ => None,
        }
    }
}
