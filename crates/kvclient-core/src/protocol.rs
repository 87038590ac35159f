//! Binary key-value protocol: fixed 24-byte header codec.
//!
//! Every frame starts with the same header layout, all multi-byte fields in
//! network byte order:
//!
//! ```text
//!  0      1      2      4      5      6      8             12         16       24
//!  magic  opcode keylen extlen dtype  status body-length  opaque     cas
//!                               vbucket (requests)
//! ```
//!
//! Field reads are fixed-offset and check the header length once up front.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Magic byte of a request frame.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Magic byte of a response frame.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Longest key the protocol accepts.
pub const MAX_KEY_SIZE: usize = 250;

/// Upper bound for a whole frame (roughly a 20 MiB document plus slack).
pub const MAX_FRAME_SIZE: usize = 25 * 1024 * 1024;

pub(crate) const OFFSET_MAGIC: usize = 0;
pub(crate) const OFFSET_OPCODE: usize = 1;
pub(crate) const OFFSET_KEY_LENGTH: usize = 2;
pub(crate) const OFFSET_EXTRAS_LENGTH: usize = 4;
pub(crate) const OFFSET_DATATYPE: usize = 5;
pub(crate) const OFFSET_STATUS: usize = 6;
pub(crate) const OFFSET_BODY_LENGTH: usize = 8;
/// Offset of the opaque (correlation key).
pub const OFFSET_OPAQUE: usize = 12;
pub(crate) const OFFSET_CAS: usize = 16;

const NO_DATATYPE: u8 = 0;
const NO_CAS: u64 = 0;

/// Operation codes used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch a document by key.
    Get = 0x00,
    /// Store a document.
    Set = 0x01,
    /// Delete a document.
    Delete = 0x04,
    /// No-op, used for keepalive.
    Noop = 0x0a,
}

impl Opcode {
    /// Decodes a raw opcode byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x04 => Some(Opcode::Delete),
            0x0a => Some(Opcode::Noop),
            _ => None,
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// 0x0000
    Success,
    /// 0x0001
    KeyNotFound,
    /// 0x0002
    KeyExists,
    /// 0x0003
    TooBig,
    /// 0x0004
    InvalidArguments,
    /// 0x0007, the partition is owned by another node.
    NotMyVbucket,
    /// 0x0020
    AuthError,
    /// 0x0081
    UnknownCommand,
    /// 0x0086
    TemporaryFailure,
    /// Any other code.
    Other(u16),
}

impl ResponseStatus {
    /// Decodes a raw status code.
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x0000 => ResponseStatus::Success,
            0x0001 => ResponseStatus::KeyNotFound,
            0x0002 => ResponseStatus::KeyExists,
            0x0003 => ResponseStatus::TooBig,
            0x0004 => ResponseStatus::InvalidArguments,
            0x0007 => ResponseStatus::NotMyVbucket,
            0x0020 => ResponseStatus::AuthError,
            0x0081 => ResponseStatus::UnknownCommand,
            0x0086 => ResponseStatus::TemporaryFailure,
            other => ResponseStatus::Other(other),
        }
    }

    /// Encodes back to the raw status code.
    pub fn as_u16(&self) -> u16 {
        match self {
            ResponseStatus::Success => 0x0000,
            ResponseStatus::KeyNotFound => 0x0001,
            ResponseStatus::KeyExists => 0x0002,
            ResponseStatus::TooBig => 0x0003,
            ResponseStatus::InvalidArguments => 0x0004,
            ResponseStatus::NotMyVbucket => 0x0007,
            ResponseStatus::AuthError => 0x0020,
            ResponseStatus::UnknownCommand => 0x0081,
            ResponseStatus::TemporaryFailure => 0x0086,
            ResponseStatus::Other(raw) => *raw,
        }
    }

    /// Returns `true` for [`ResponseStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }
}

fn require_header(buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_SIZE {
        return Err(CoreError::malformed(format!(
            "header needs {} bytes, got {}",
            HEADER_SIZE,
            buf.len()
        )));
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Reads the magic byte.
pub fn extract_magic(header: &[u8]) -> Result<u8> {
    require_header(header)?;
    Ok(header[OFFSET_MAGIC])
}

/// Reads the opcode byte.
pub fn extract_opcode(header: &[u8]) -> Result<u8> {
    require_header(header)?;
    Ok(header[OFFSET_OPCODE])
}

/// Reads the key length.
pub fn extract_key_length(header: &[u8]) -> Result<u16> {
    require_header(header)?;
    Ok(read_u16(header, OFFSET_KEY_LENGTH))
}

/// Reads the extras length.
pub fn extract_extras_length(header: &[u8]) -> Result<u8> {
    require_header(header)?;
    Ok(header[OFFSET_EXTRAS_LENGTH])
}

/// Reads the datatype byte.
pub fn extract_datatype(header: &[u8]) -> Result<u8> {
    require_header(header)?;
    Ok(header[OFFSET_DATATYPE])
}

/// Reads the status field of a response (vbucket id on requests).
pub fn extract_status(header: &[u8]) -> Result<u16> {
    require_header(header)?;
    Ok(read_u16(header, OFFSET_STATUS))
}

/// Reads the total body length.
pub fn extract_body_length(header: &[u8]) -> Result<u32> {
    require_header(header)?;
    Ok(read_u32(header, OFFSET_BODY_LENGTH))
}

/// Reads the opaque, the correlation key of the frame.
pub fn extract_opaque(header: &[u8]) -> Result<u32> {
    require_header(header)?;
    Ok(read_u32(header, OFFSET_OPAQUE))
}

/// Reads the CAS value.
pub fn extract_cas(header: &[u8]) -> Result<u64> {
    require_header(header)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&header[OFFSET_CAS..OFFSET_CAS + 8]);
    Ok(u64::from_be_bytes(raw))
}

/// Fields of a frame header, used to build frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Request or response magic.
    pub magic: u8,
    /// Raw opcode.
    pub opcode: u8,
    /// Datatype flags.
    pub datatype: u8,
    /// Partition on requests, status on responses.
    pub vbucket_or_status: u16,
    /// Correlation key.
    pub opaque: u32,
    /// CAS value.
    pub cas: u64,
}

/// Encodes a complete frame: header followed by extras, key and value.
pub fn encode_frame(header: &FrameHeader, extras: &[u8], key: &[u8], value: &[u8]) -> Result<Bytes> {
    let key_len = u16::try_from(key.len())
        .map_err(|_| CoreError::encoding(format!("key length {} overflows u16", key.len())))?;
    let extras_len = u8::try_from(extras.len()).map_err(|_| {
        CoreError::encoding(format!("extras length {} overflows u8", extras.len()))
    })?;
    let body_len = extras.len() + key.len() + value.len();
    if HEADER_SIZE + body_len > MAX_FRAME_SIZE {
        return Err(CoreError::encoding(format!(
            "frame of {} bytes exceeds maximum {}",
            HEADER_SIZE + body_len,
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    buf.put_u8(header.magic);
    buf.put_u8(header.opcode);
    buf.put_u16(key_len);
    buf.put_u8(extras_len);
    buf.put_u8(header.datatype);
    buf.put_u16(header.vbucket_or_status);
    buf.put_u32(body_len as u32);
    buf.put_u32(header.opaque);
    buf.put_u64(header.cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
    Ok(buf.freeze())
}

/// Checks a document key against the protocol limits.
pub fn verify_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(CoreError::encoding("key must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(CoreError::encoding(format!(
            "key of {} bytes exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(())
}

/// Encodes a GET request for `key` on `partition`.
pub fn encode_get(key: &[u8], opaque: u32, partition: u16) -> Result<Bytes> {
    verify_key(key)?;
    let header = FrameHeader {
        magic: MAGIC_REQUEST,
        opcode: Opcode::Get as u8,
        datatype: NO_DATATYPE,
        vbucket_or_status: partition,
        opaque,
        cas: NO_CAS,
    };
    encode_frame(&header, &[], key, &[])
}

/// Decoded and validated response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Raw opcode.
    pub opcode: u8,
    /// Key length.
    pub key_length: u16,
    /// Extras length.
    pub extras_length: u8,
    /// Datatype flags.
    pub datatype: u8,
    /// Status code.
    pub status: ResponseStatus,
    /// Total body length.
    pub body_length: u32,
    /// Correlation key.
    pub opaque: u32,
    /// CAS value.
    pub cas: u64,
}

impl ResponseHeader {
    /// Decodes a response header, rejecting a wrong magic or a body length
    /// too short for its key and extras.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let magic = extract_magic(buf)?;
        if magic != MAGIC_RESPONSE {
            return Err(CoreError::malformed(format!(
                "expected response magic 0x{:02X}, got 0x{:02X}",
                MAGIC_RESPONSE, magic
            )));
        }
        let header = Self {
            opcode: buf[OFFSET_OPCODE],
            key_length: read_u16(buf, OFFSET_KEY_LENGTH),
            extras_length: buf[OFFSET_EXTRAS_LENGTH],
            datatype: buf[OFFSET_DATATYPE],
            status: ResponseStatus::from_u16(read_u16(buf, OFFSET_STATUS)),
            body_length: read_u32(buf, OFFSET_BODY_LENGTH),
            opaque: read_u32(buf, OFFSET_OPAQUE),
            cas: extract_cas(buf)?,
        };
        let required = header.key_length as u32 + header.extras_length as u32;
        if header.body_length < required {
            return Err(CoreError::malformed(format!(
                "body length {} shorter than key {} + extras {}",
                header.body_length, header.key_length, header.extras_length
            )));
        }
        Ok(header)
    }
}

/// A complete response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Decoded header.
    pub header: ResponseHeader,
    body: Bytes,
}

impl ResponseFrame {
    /// Splits `frame` into header and body, checking the body is complete.
    pub fn decode(frame: Bytes) -> Result<Self> {
        let header = ResponseHeader::decode(&frame)?;
        let available = frame.len() - HEADER_SIZE;
        let body_length = usize::try_from(header.body_length)
            .ok()
            .filter(|len| *len <= available)
            .ok_or_else(|| {
                CoreError::malformed(format!(
                    "frame truncated: body of {} bytes, got {}",
                    header.body_length, available
                ))
            })?;
        let body = frame.slice(HEADER_SIZE..HEADER_SIZE + body_length);
        Ok(Self { header, body })
    }

    /// Extras section.
    pub fn extras(&self) -> Bytes {
        self.body.slice(..self.header.extras_length as usize)
    }

    /// Key section.
    pub fn key(&self) -> Bytes {
        let start = self.header.extras_length as usize;
        self.body.slice(start..start + self.header.key_length as usize)
    }

    /// Value section.
    pub fn value(&self) -> Bytes {
        let start = self.header.extras_length as usize + self.header.key_length as usize;
        self.body.slice(start..)
    }
}
