//! Request handler for the [`AgentMessage`] protocol served by `warden-server`.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    os::fd::OwnedFd,
};

use sha2::{Digest, Sha256};
use warden_common::{AgentMessage, BincodeCodec, CodecError, PayloadCodec};

use crate::{
    handler::{HandlerFactory, HandlerReply, Request, RequestHandler},
    peer_creds::PeerInfo,
};

/// Largest file a scan will read.
pub const MAX_SCAN_BYTES: u64 = 1 << 30;

/// Answers pings and hashes files passed by descriptor.
pub struct AgentHandler {
    codec:   BincodeCodec<AgentMessage>,
    peer:    PeerInfo,
    /// Payload decoded while deciding whether a descriptor follows, reused by
    /// `handle` when the same payload comes back.
    pending: Option<(Vec<u8>, AgentMessage)>,
}

impl AgentHandler {
    pub fn new(peer: PeerInfo) -> Self {
        Self {
            codec: BincodeCodec::new(),
            peer,
            pending: None,
        }
    }

    fn reply(&self, message: &AgentMessage, failure: Option<String>) -> HandlerReply {
        match (self.codec.encode(message), failure) {
            (Ok(payload), None) => HandlerReply::success(payload),
            (Ok(payload), Some(reason)) => HandlerReply::recoverable(payload, reason),
            (Err(e), _) => HandlerReply::fatal(format!("cannot encode reply: {e}")),
        }
    }

    fn scan(&self, id: u32, path: &str, descriptor: Option<OwnedFd>) -> HandlerReply {
        let Some(fd) = descriptor else {
            let message = "scan request carried no descriptor".to_string();
            return self.reply(&AgentMessage::Error { id, message: message.clone() }, Some(message));
        };

        tracing::info!(id, path, pid = ?self.peer.pid(), "Scanning passed file");
        match hash_file(File::from(fd)) {
            Ok((size, sha256)) => {
                tracing::debug!(id, size, sha256 = %sha256, "Scan complete");
                self.reply(&AgentMessage::ScanVerdict { id, size, sha256 }, None)
            }
            Err(e) => {
                let message = format!("failed to read passed file: {e}");
                self.reply(&AgentMessage::Error { id, message: message.clone() }, Some(message))
            }
        }
    }
}

impl RequestHandler for AgentHandler {
    fn handle(&mut self, request: Request) -> HandlerReply {
        let decoded = match self.pending.take() {
            Some((payload, message)) if payload == request.payload => Ok(message),
            _ => self.codec.decode(&request.payload),
        };

        let message = match decoded {
            Ok(message) => message,
            Err(e @ CodecError::Unsupported(_)) => return HandlerReply::fatal(e.to_string()),
            Err(e) => {
                let message = e.to_string();
                return self.reply(&AgentMessage::Error { id: 0, message: message.clone() }, Some(message));
            }
        };

        match message {
            AgentMessage::Ping => {
                tracing::debug!("Responding to ping with pong");
                self.reply(&AgentMessage::Pong, None)
            }
            AgentMessage::ScanRequest { id, path } => self.scan(id, &path, request.descriptor),
            other => {
                let message = format!("unexpected message from client: {other:?}");
                self.reply(&AgentMessage::Error { id: 0, message: message.clone() }, Some(message))
            }
        }
    }

    fn trailing_descriptor(&mut self, payload: &[u8]) -> bool {
        // Undecodable payloads carry no descriptor; `handle` reports the error.
        self.pending = self
            .codec
            .decode(payload)
            .ok()
            .map(|message| (payload.to_vec(), message));
        self.pending
            .as_ref()
            .is_some_and(|(_, message)| message.carries_descriptor())
    }
}

/// Builds an [`AgentHandler`] per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentHandlerFactory;

impl HandlerFactory for AgentHandlerFactory {
    fn create(&self, peer: &PeerInfo) -> Box<dyn RequestHandler> {
        Box::new(AgentHandler::new(*peer))
    }
}

/// Size and hex SHA-256 of everything in `file`, from the start.
///
/// Only regular files of at most [`MAX_SCAN_BYTES`] are read; devices, pipes
/// and sockets could stream forever.
fn hash_file(mut file: File) -> io::Result<(u64, String)> {
    let file_type = file.metadata()?.file_type();
    if !file_type.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "passed descriptor is not a regular file",
        ));
    }

    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut (&mut file).take(MAX_SCAN_BYTES + 1), &mut hasher)?;
    if size > MAX_SCAN_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file is larger than {MAX_SCAN_BYTES} bytes"),
        ));
    }
    Ok((size, hex::encode(hasher.finalize())))
}
