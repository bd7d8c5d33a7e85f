//! Payload codecs and the message schema spoken by the bundled binaries.
//!
//! The transport only moves opaque byte frames; what the bytes mean is up to a
//! [`PayloadCodec`]. [`BincodeCodec`] covers any serde type.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes do not describe a valid message. The peer is at fault; the
    /// connection can answer with an error and carry on.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The message type cannot be represented by this codec at all.
    #[error("unsupported by codec: {0}")]
    Unsupported(String),
}

impl CodecError {
    /// True when the failure is a programming defect on our side rather than
    /// bad input from the peer.
    pub fn is_defect(&self) -> bool {
        matches!(self, CodecError::Unsupported(_))
    }
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::DeserializeAnyNotSupported
            | bincode::ErrorKind::SequenceMustHaveLength => CodecError::Unsupported(err.to_string()),
            _ => CodecError::Malformed(err.to_string()),
        }
    }
}

/// Turns typed messages into frame payloads and back.
pub trait PayloadCodec<T> {
    fn encode(&self, message: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<T, CodecError>;
}

/// [`PayloadCodec`] for any serde type, using bincode's default options.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BincodeCodec").finish()
    }
}

impl<T: Serialize + DeserializeOwned> PayloadCodec<T> for BincodeCodec<T> {
    fn encode(&self, message: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(message)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Messages exchanged between `warden-client` and `warden-server`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMessage {
    /// Liveness check
    Ping,
    /// Reply to [`AgentMessage::Ping`]
    Pong,
    /// Ask the server to scan a file. The open file follows the frame as a
    /// passed descriptor; `path` is informational only.
    ScanRequest {
        /// Identifier echoed in the reply
        id:   u32,
        /// Path the client opened
        path: String,
    },
    /// Result of a scan
    ScanVerdict {
        /// Identifier matching the request
        id:     u32,
        /// Bytes read from the descriptor
        size:   u64,
        /// Hex-encoded SHA-256 of the contents
        sha256: String,
    },
    /// A request could not be served
    Error {
        /// Identifier matching the request, zero when unknown
        id:      u32,
        /// What went wrong
        message: String,
    },
}

impl AgentMessage {
    /// Whether a descriptor follows this message on the wire.
    pub fn carries_descriptor(&self) -> bool {
        matches!(self, AgentMessage::ScanRequest { .. })
    }
}
