//! Typed key-value operations.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{CoreError, Result};
use crate::protocol::{self, Opcode, ResponseFrame, ResponseStatus};
use crate::request::{Completable, Request, RequestId, ResponseHandle};

/// An operation that can travel over a key-value connection.
///
/// Object safe, so a connection's correlation table can hold operations of
/// different result types.
pub trait KeyValueRequest: Completable {
    /// Correlation key.
    fn opaque(&self) -> u32;

    /// Partition (vbucket) the key maps to.
    fn partition(&self) -> u16;

    /// Document key.
    fn key(&self) -> &[u8];

    /// Encodes the request frame.
    fn encode(&self) -> Result<Bytes>;

    /// Decodes `frame` into the typed result and completes the request.
    ///
    /// Returns `true` if this call completed the request.
    fn complete_with(&self, frame: ResponseFrame) -> bool;
}

/// Result of a GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    /// Server status.
    pub status: ResponseStatus,
    /// CAS of the document.
    pub cas: u64,
    /// Document flags, zero when the server sent no extras.
    pub flags: u32,
    /// Datatype flags.
    pub datatype: u8,
    /// Document body.
    pub content: Bytes,
}

impl GetResponse {
    /// Decodes a GET response frame.
    pub fn decode(frame: &ResponseFrame) -> Result<Self> {
        if frame.header.opcode != Opcode::Get as u8 {
            return Err(CoreError::MalformedFrame {
                reason: format!("expected GET opcode, got 0x{:02X}", frame.header.opcode),
            });
        }
        let extras = frame.extras();
        let flags = match extras.len() {
            0 => 0,
            4 => u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            other => {
                return Err(CoreError::MalformedFrame {
                    reason: format!("GET extras must be 0 or 4 bytes, got {}", other),
                })
            }
        };
        Ok(Self {
            status: frame.header.status,
            cas: frame.header.cas,
            flags,
            datatype: frame.header.datatype,
            content: frame.value(),
        })
    }
}

/// Fetches one document by key.
#[derive(Debug, Clone)]
pub struct GetRequest {
    key: Bytes,
    partition: u16,
    request: Request<GetResponse>,
}

impl GetRequest {
    /// Creates a GET, rejecting keys the protocol cannot carry.
    pub fn new(id: RequestId, opaque: u32, key: impl Into<Bytes>, timeout: Duration) -> Result<Self> {
        let key = key.into();
        protocol::verify_key(&key)?;
        Ok(Self {
            key,
            partition: 0,
            request: Request::new(id, opaque, timeout),
        })
    }

    /// Sets the partition.
    pub fn with_partition(mut self, partition: u16) -> Self {
        self.partition = partition;
        self
    }

    /// Underlying request state machine.
    pub fn request(&self) -> &Request<GetResponse> {
        &self.request
    }

    /// Handle to the eventual response.
    pub fn response(&self) -> ResponseHandle<GetResponse> {
        self.request.response()
    }
}

impl Completable for GetRequest {
    fn request_id(&self) -> RequestId {
        self.request.id()
    }

    fn timeout(&self) -> Duration {
        self.request.timeout()
    }

    fn fail(&self, error: CoreError) -> bool {
        self.request.fail(error)
    }

    fn is_terminal(&self) -> bool {
        self.request.is_terminal()
    }

    fn add_completion_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.request.on_complete(move |_| hook());
    }
}

impl KeyValueRequest for GetRequest {
    fn opaque(&self) -> u32 {
        self.request.opaque()
    }

    fn partition(&self) -> u16 {
        self.partition
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn encode(&self) -> Result<Bytes> {
        protocol::encode_get(&self.key, self.request.opaque(), self.partition)
    }

    fn complete_with(&self, frame: ResponseFrame) -> bool {
        self.request.complete(GetResponse::decode(&frame))
    }
}
