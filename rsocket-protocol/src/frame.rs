//! RSocket frame layouts.
//!
//! Every frame starts with a 6 byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-------------------------------------------------------------+
//! |0|                        Stream ID                            |
//! +-----------+-+-+---------------+-------------------------------+
//! |Frame Type |I|M|     Flags     |  type-specific fields ...
//! +-----------+-+-+---------------+
//! ```
//!
//! Payload-carrying frames encode metadata (when the M flag is set) as a
//! 24-bit length followed by the metadata bytes, then the data as the frame
//! remainder. LEASE and METADATA_PUSH carry their metadata as the remainder
//! with no length prefix.
//!
//! Stream-oriented transports additionally put a 24-bit frame length in
//! front of every frame; see [`crate::codec`].

use crate::error::{ErrorCode, ProtocolError};
use crate::payload::Payload;
use crate::{MAX_REQUEST_N, MAX_STREAM_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Size of the frame header in bytes (stream id + type/flags).
pub const FRAME_HEADER_SIZE: usize = 6;

const FLAGS_MASK: u16 = 0x03FF;
const TYPE_SHIFT: u16 = 10;
const METADATA_LENGTH_SIZE: usize = 3;
const MAX_METADATA_LENGTH: usize = 0xFF_FFFF;
const MAX_POSITION: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl FrameType {
    pub fn from_u8(code: u8) -> Option<Self> {
        let frame_type = match code {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x0D => FrameType::Resume,
            0x0E => FrameType::ResumeOk,
            0x3F => FrameType::Ext,
            _ => return None,
        };
        Some(frame_type)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns whether this type opens a new stream.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }

    /// Returns whether frames of this type may be split with FOLLOWS.
    pub fn can_fragment(self) -> bool {
        self.is_request() || self == FrameType::Payload
    }

    /// Returns whether this type may only travel on stream 0.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::Keepalive
                | FrameType::MetadataPush
                | FrameType::Resume
                | FrameType::ResumeOk
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameType::Setup => "SETUP",
            FrameType::Lease => "LEASE",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::MetadataPush => "METADATA_PUSH",
            FrameType::Resume => "RESUME",
            FrameType::ResumeOk => "RESUME_OK",
            FrameType::Ext => "EXT",
        };
        write!(f, "{}", s)
    }
}

/// The 10-bit flags field of the frame header.
///
/// Some bits are reused with a per-type meaning (FOLLOWS, RESPOND and
/// RESUME_ENABLE share 0x80; COMPLETE and LEASE share 0x40).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Receiver may ignore the frame if it does not understand it.
    pub const IGNORE: Flags = Flags(0x200);
    /// Metadata is present.
    pub const METADATA: Flags = Flags(0x100);
    /// More fragments follow.
    pub const FOLLOWS: Flags = Flags(0x80);
    /// Stream completion.
    pub const COMPLETE: Flags = Flags(0x40);
    /// PAYLOAD carries a next item.
    pub const NEXT: Flags = Flags(0x20);
    /// KEEPALIVE: the receiver must answer.
    pub const RESPOND: Flags = Flags(0x80);
    /// SETUP: the client honours leases.
    pub const LEASE: Flags = Flags(0x40);
    /// SETUP: a resume token is present.
    pub const RESUME_ENABLE: Flags = Flags(0x80);

    /// Builds flags from raw header bits, discarding the frame type bits.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits & FLAGS_MASK)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Flags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    pub fn with(mut self, other: Flags) -> Self {
        self.insert(other);
        self
    }

    pub fn without(mut self, other: Flags) -> Self {
        self.remove(other);
        self
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#05x})", self.0)
    }
}

/// SETUP frame fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    pub major_version: u16,
    pub minor_version: u16,
    /// Interval between client KEEPALIVE frames.
    pub keepalive_ms: u32,
    /// Time without any inbound frame after which the peer is considered dead.
    pub lifetime_ms: u32,
    pub resume_token: Option<Bytes>,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

/// LEASE frame fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ttl_ms: u32,
    pub request_count: u32,
    pub metadata: Option<Bytes>,
}

/// KEEPALIVE frame fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keepalive {
    pub last_received_position: u64,
    pub data: Bytes,
}

/// RESUME frame fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    pub major_version: u16,
    pub minor_version: u16,
    pub token: Bytes,
    pub last_received_server_position: u64,
    pub first_available_client_position: u64,
}

/// Type-specific frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Setup(Setup),
    Lease(Lease),
    Keepalive(Keepalive),
    RequestResponse(Payload),
    RequestFnf(Payload),
    RequestStream {
        initial_request_n: u32,
        payload: Payload,
    },
    RequestChannel {
        initial_request_n: u32,
        payload: Payload,
    },
    RequestN {
        n: u32,
    },
    Cancel,
    Payload(Payload),
    Error {
        code: ErrorCode,
        message: String,
    },
    MetadataPush(Bytes),
    Resume(Resume),
    ResumeOk {
        last_received_client_position: u64,
    },
    Ext {
        extended_type: u32,
        payload: Payload,
    },
}

impl Body {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Body::Setup(_) => FrameType::Setup,
            Body::Lease(_) => FrameType::Lease,
            Body::Keepalive(_) => FrameType::Keepalive,
            Body::RequestResponse(_) => FrameType::RequestResponse,
            Body::RequestFnf(_) => FrameType::RequestFnf,
            Body::RequestStream { .. } => FrameType::RequestStream,
            Body::RequestChannel { .. } => FrameType::RequestChannel,
            Body::RequestN { .. } => FrameType::RequestN,
            Body::Cancel => FrameType::Cancel,
            Body::Payload(_) => FrameType::Payload,
            Body::Error { .. } => FrameType::Error,
            Body::MetadataPush(_) => FrameType::MetadataPush,
            Body::Resume(_) => FrameType::Resume,
            Body::ResumeOk { .. } => FrameType::ResumeOk,
            Body::Ext { .. } => FrameType::Ext,
        }
    }

    /// Returns the application payload carried by this body, if any.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Body::Setup(setup) => Some(&setup.payload),
            Body::RequestResponse(payload)
            | Body::RequestFnf(payload)
            | Body::Payload(payload)
            | Body::RequestStream { payload, .. }
            | Body::RequestChannel { payload, .. }
            | Body::Ext { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match self {
            Body::Setup(setup) => Some(&mut setup.payload),
            Body::RequestResponse(payload)
            | Body::RequestFnf(payload)
            | Body::Payload(payload)
            | Body::RequestStream { payload, .. }
            | Body::RequestChannel { payload, .. }
            | Body::Ext { payload, .. } => Some(payload),
            _ => None,
        }
    }

    fn has_metadata(&self) -> bool {
        match self {
            Body::Lease(lease) => lease.metadata.is_some(),
            Body::MetadataPush(_) => true,
            other => other.payload().map_or(false, Payload::has_metadata),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Body::Setup(setup) => {
                12 + setup.resume_token.as_ref().map_or(0, |t| 2 + t.len())
                    + 1
                    + setup.metadata_mime_type.len()
                    + 1
                    + setup.data_mime_type.len()
                    + payload_len(&setup.payload)
            }
            Body::Lease(lease) => 8 + lease.metadata.as_ref().map_or(0, Bytes::len),
            Body::Keepalive(keepalive) => 8 + keepalive.data.len(),
            Body::RequestResponse(payload) | Body::RequestFnf(payload) | Body::Payload(payload) => {
                payload_len(payload)
            }
            Body::RequestStream { payload, .. } | Body::RequestChannel { payload, .. } => {
                4 + payload_len(payload)
            }
            Body::RequestN { .. } => 4,
            Body::Cancel => 0,
            Body::Error { message, .. } => 4 + message.len(),
            Body::MetadataPush(metadata) => metadata.len(),
            Body::Resume(resume) => 4 + 2 + resume.token.len() + 16,
            Body::ResumeOk { .. } => 8,
            Body::Ext { payload, .. } => 4 + payload_len(payload),
        }
    }
}

fn payload_len(payload: &Payload) -> usize {
    payload
        .metadata()
        .map_or(0, |m| METADATA_LENGTH_SIZE + m.len())
        + payload.data().len()
}

/// A parsed RSocket frame.
///
/// Frames built with [`Frame::new`] (and every constructor, and
/// [`Frame::decode`]) are normalized: the METADATA flag mirrors metadata
/// presence and RESUME_ENABLE mirrors the SETUP resume token, so
/// `Frame::decode(frame.encode()) == frame` holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub flags: Flags,
    pub body: Body,
}

impl Frame {
    pub fn new(stream_id: u32, flags: Flags, body: Body) -> Self {
        debug_assert!(stream_id <= MAX_STREAM_ID, "stream id out of range");
        let mut frame = Self {
            stream_id: stream_id & MAX_STREAM_ID,
            flags,
            body,
        };
        frame.normalize();
        frame
    }

    fn normalize(&mut self) {
        let has_metadata = self.body.has_metadata();
        self.flags.set(Flags::METADATA, has_metadata);
        if let Body::Setup(setup) = &self.body {
            let resumable = setup.resume_token.is_some();
            self.flags.set(Flags::RESUME_ENABLE, resumable);
        }
    }

    pub fn setup(setup: Setup, lease: bool) -> Self {
        let flags = if lease { Flags::LEASE } else { Flags::NONE };
        Self::new(0, flags, Body::Setup(setup))
    }

    pub fn lease(ttl_ms: u32, request_count: u32, metadata: Option<Bytes>) -> Self {
        Self::new(
            0,
            Flags::NONE,
            Body::Lease(Lease {
                ttl_ms,
                request_count,
                metadata,
            }),
        )
    }

    pub fn keepalive(last_received_position: u64, data: Bytes, respond: bool) -> Self {
        let flags = if respond { Flags::RESPOND } else { Flags::NONE };
        Self::new(
            0,
            flags,
            Body::Keepalive(Keepalive {
                last_received_position: last_received_position & MAX_POSITION,
                data,
            }),
        )
    }

    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Self::new(stream_id, Flags::NONE, Body::RequestResponse(payload))
    }

    pub fn request_fnf(stream_id: u32, payload: Payload) -> Self {
        Self::new(stream_id, Flags::NONE, Body::RequestFnf(payload))
    }

    pub fn request_stream(stream_id: u32, initial_request_n: u32, payload: Payload) -> Self {
        Self::new(
            stream_id,
            Flags::NONE,
            Body::RequestStream {
                initial_request_n: clamp_request_n(initial_request_n),
                payload,
            },
        )
    }

    /// REQUEST_CHANNEL; `complete` marks the requester's half as finished.
    pub fn request_channel(
        stream_id: u32,
        initial_request_n: u32,
        payload: Payload,
        complete: bool,
    ) -> Self {
        let flags = if complete {
            Flags::COMPLETE
        } else {
            Flags::NONE
        };
        Self::new(
            stream_id,
            flags,
            Body::RequestChannel {
                initial_request_n: clamp_request_n(initial_request_n),
                payload,
            },
        )
    }

    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Self::new(
            stream_id,
            Flags::NONE,
            Body::RequestN {
                n: clamp_request_n(n),
            },
        )
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self::new(stream_id, Flags::NONE, Body::Cancel)
    }

    /// PAYLOAD with NEXT, optionally also COMPLETE.
    pub fn payload_next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        let mut flags = Flags::NEXT;
        flags.set(Flags::COMPLETE, complete);
        Self::new(stream_id, flags, Body::Payload(payload))
    }

    /// PAYLOAD with only COMPLETE and an empty payload.
    pub fn payload_complete(stream_id: u32) -> Self {
        Self::new(stream_id, Flags::COMPLETE, Body::Payload(Payload::default()))
    }

    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            stream_id,
            Flags::NONE,
            Body::Error {
                code,
                message: message.into(),
            },
        )
    }

    pub fn metadata_push(metadata: Bytes) -> Self {
        Self::new(0, Flags::METADATA, Body::MetadataPush(metadata))
    }

    pub fn resume(
        token: Bytes,
        last_received_server_position: u64,
        first_available_client_position: u64,
    ) -> Self {
        Self::new(
            0,
            Flags::NONE,
            Body::Resume(Resume {
                major_version: crate::MAJOR_VERSION,
                minor_version: crate::MINOR_VERSION,
                token,
                last_received_server_position: last_received_server_position & MAX_POSITION,
                first_available_client_position: first_available_client_position & MAX_POSITION,
            }),
        )
    }

    pub fn resume_ok(last_received_client_position: u64) -> Self {
        Self::new(
            0,
            Flags::NONE,
            Body::ResumeOk {
                last_received_client_position: last_received_client_position & MAX_POSITION,
            },
        )
    }

    pub fn ext(stream_id: u32, extended_type: u32, payload: Payload, ignore: bool) -> Self {
        let flags = if ignore { Flags::IGNORE } else { Flags::NONE };
        Self::new(
            stream_id,
            flags,
            Body::Ext {
                extended_type,
                payload,
            },
        )
    }

    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    pub fn is_request(&self) -> bool {
        self.frame_type().is_request()
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.body.payload()
    }

    /// Encoded size of this frame, excluding any transport length prefix.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.encoded_len()
    }

    /// Writes this frame into `buf`.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        let frame_type = u16::from(self.frame_type().code());
        buf.put_u32(self.stream_id & MAX_STREAM_ID);
        buf.put_u16((frame_type << TYPE_SHIFT) | self.flags.bits());

        match &self.body {
            Body::Setup(setup) => {
                buf.put_u16(setup.major_version);
                buf.put_u16(setup.minor_version);
                buf.put_u32(setup.keepalive_ms);
                buf.put_u32(setup.lifetime_ms);
                if let Some(token) = &setup.resume_token {
                    debug_assert!(token.len() <= usize::from(u16::MAX));
                    buf.put_u16(token.len() as u16);
                    buf.put_slice(token);
                }
                put_mime_type(buf, &setup.metadata_mime_type);
                put_mime_type(buf, &setup.data_mime_type);
                put_payload(buf, &setup.payload);
            }
            Body::Lease(lease) => {
                buf.put_u32(lease.ttl_ms);
                buf.put_u32(lease.request_count);
                if let Some(metadata) = &lease.metadata {
                    buf.put_slice(metadata);
                }
            }
            Body::Keepalive(keepalive) => {
                buf.put_u64(keepalive.last_received_position & MAX_POSITION);
                buf.put_slice(&keepalive.data);
            }
            Body::RequestResponse(payload) | Body::RequestFnf(payload) | Body::Payload(payload) => {
                put_payload(buf, payload);
            }
            Body::RequestStream {
                initial_request_n,
                payload,
            }
            | Body::RequestChannel {
                initial_request_n,
                payload,
            } => {
                buf.put_u32(*initial_request_n & MAX_REQUEST_N);
                put_payload(buf, payload);
            }
            Body::RequestN { n } => buf.put_u32(*n & MAX_REQUEST_N),
            Body::Cancel => {}
            Body::Error { code, message } => {
                buf.put_u32(code.as_u32());
                buf.put_slice(message.as_bytes());
            }
            Body::MetadataPush(metadata) => buf.put_slice(metadata),
            Body::Resume(resume) => {
                buf.put_u16(resume.major_version);
                buf.put_u16(resume.minor_version);
                debug_assert!(resume.token.len() <= usize::from(u16::MAX));
                buf.put_u16(resume.token.len() as u16);
                buf.put_slice(&resume.token);
                buf.put_u64(resume.last_received_server_position & MAX_POSITION);
                buf.put_u64(resume.first_available_client_position & MAX_POSITION);
            }
            Body::ResumeOk {
                last_received_client_position,
            } => buf.put_u64(*last_received_client_position & MAX_POSITION),
            Body::Ext {
                extended_type,
                payload,
            } => {
                buf.put_u32(*extended_type);
                put_payload(buf, payload);
            }
        }
    }

    /// Encodes this frame into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes exactly one frame from `buf` (no length prefix).
    pub fn decode(buf: Bytes) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor { buf };
        let stream_id = cursor.u32("stream_id")? & MAX_STREAM_ID;
        let type_and_flags = cursor.u16("frame_type")?;
        let code = (type_and_flags >> TYPE_SHIFT) as u8;
        let flags = Flags::from_bits(type_and_flags);

        let frame_type =
            FrameType::from_u8(code).ok_or(ProtocolError::UnknownFrameType {
                frame_type: code,
                ignorable: flags.contains(Flags::IGNORE),
            })?;

        if frame_type.is_connection_level() && stream_id != 0 {
            return Err(ProtocolError::malformed(
                "stream_id",
                format!("{} must use stream 0, got {}", frame_type, stream_id),
            ));
        }
        let stream_scoped = frame_type.is_request()
            || matches!(
                frame_type,
                FrameType::RequestN | FrameType::Cancel | FrameType::Payload
            );
        if stream_scoped && stream_id == 0 {
            return Err(ProtocolError::malformed(
                "stream_id",
                format!("{} must not use stream 0", frame_type),
            ));
        }

        let body = match frame_type {
            FrameType::Setup => {
                let major_version = cursor.u16("major_version")?;
                let minor_version = cursor.u16("minor_version")?;
                let keepalive_ms = cursor.u32("keepalive")?;
                let lifetime_ms = cursor.u32("lifetime")?;
                let resume_token = if flags.contains(Flags::RESUME_ENABLE) {
                    let len = usize::from(cursor.u16("resume_token_length")?);
                    Some(cursor.bytes(len, "resume_token")?)
                } else {
                    None
                };
                let len = usize::from(cursor.u8("metadata_mime_length")?);
                let metadata_mime_type = cursor.ascii(len, "metadata_mime_type")?;
                let len = usize::from(cursor.u8("data_mime_length")?);
                let data_mime_type = cursor.ascii(len, "data_mime_type")?;
                let payload = cursor.payload(flags)?;
                Body::Setup(Setup {
                    major_version,
                    minor_version,
                    keepalive_ms,
                    lifetime_ms,
                    resume_token,
                    metadata_mime_type,
                    data_mime_type,
                    payload,
                })
            }
            FrameType::Lease => {
                let ttl_ms = cursor.u32("ttl")?;
                let request_count = cursor.u32("request_count")?;
                let metadata = if flags.contains(Flags::METADATA) {
                    Some(cursor.rest())
                } else {
                    None
                };
                Body::Lease(Lease {
                    ttl_ms,
                    request_count,
                    metadata,
                })
            }
            FrameType::Keepalive => Body::Keepalive(Keepalive {
                last_received_position: cursor.u64("last_received_position")? & MAX_POSITION,
                data: cursor.rest(),
            }),
            FrameType::RequestResponse => Body::RequestResponse(cursor.payload(flags)?),
            FrameType::RequestFnf => Body::RequestFnf(cursor.payload(flags)?),
            FrameType::RequestStream => Body::RequestStream {
                initial_request_n: cursor.request_n("initial_request_n")?,
                payload: cursor.payload(flags)?,
            },
            FrameType::RequestChannel => Body::RequestChannel {
                initial_request_n: cursor.request_n("initial_request_n")?,
                payload: cursor.payload(flags)?,
            },
            FrameType::RequestN => Body::RequestN {
                n: cursor.request_n("request_n")?,
            },
            FrameType::Cancel => Body::Cancel,
            FrameType::Payload => Body::Payload(cursor.payload(flags)?),
            FrameType::Error => {
                let code = ErrorCode::from_u32(cursor.u32("error_code")?);
                let message = String::from_utf8(cursor.rest().to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("error_message"))?;
                Body::Error { code, message }
            }
            FrameType::MetadataPush => Body::MetadataPush(cursor.rest()),
            FrameType::Resume => {
                let major_version = cursor.u16("major_version")?;
                let minor_version = cursor.u16("minor_version")?;
                let len = usize::from(cursor.u16("resume_token_length")?);
                let token = cursor.bytes(len, "resume_token")?;
                Body::Resume(Resume {
                    major_version,
                    minor_version,
                    token,
                    last_received_server_position: cursor.u64("last_received_server_position")?
                        & MAX_POSITION,
                    first_available_client_position: cursor
                        .u64("first_available_client_position")?
                        & MAX_POSITION,
                })
            }
            FrameType::ResumeOk => Body::ResumeOk {
                last_received_client_position: cursor.u64("last_received_client_position")?
                    & MAX_POSITION,
            },
            FrameType::Ext => Body::Ext {
                extended_type: cursor.u32("extended_type")?,
                payload: cursor.payload(flags)?,
            },
        };

        Ok(Frame::new(stream_id, flags, body))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} flags={:?}",
            self.frame_type(),
            self.stream_id,
            self.flags
        )
    }
}

fn clamp_request_n(n: u32) -> u32 {
    debug_assert!(n > 0, "request-n must be positive");
    n.clamp(1, MAX_REQUEST_N)
}

fn put_mime_type<B: BufMut>(buf: &mut B, mime_type: &str) {
    debug_assert!(mime_type.len() <= usize::from(u8::MAX));
    let bytes = &mime_type.as_bytes()[..mime_type.len().min(usize::from(u8::MAX))];
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

fn put_payload<B: BufMut>(buf: &mut B, payload: &Payload) {
    if let Some(metadata) = payload.metadata() {
        debug_assert!(metadata.len() <= MAX_METADATA_LENGTH);
        buf.put_uint(metadata.len().min(MAX_METADATA_LENGTH) as u64, METADATA_LENGTH_SIZE);
        buf.put_slice(metadata);
    }
    buf.put_slice(payload.data());
}

/// Bounds-checked reader over a single frame's bytes.
struct Cursor {
    buf: Bytes,
}

impl Cursor {
    fn ensure(&self, needed: usize, field: &'static str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::malformed(
                field,
                format!(
                    "needs {} bytes, {} remaining",
                    needed,
                    self.buf.remaining()
                ),
            ));
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.ensure(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u24(&mut self, field: &'static str) -> Result<usize, ProtocolError> {
        self.ensure(3, field)?;
        Ok(self.buf.get_uint(3) as usize)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.ensure(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        self.ensure(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, len: usize, field: &'static str) -> Result<Bytes, ProtocolError> {
        self.ensure(len, field)?;
        Ok(self.buf.split_to(len))
    }

    fn ascii(&mut self, len: usize, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.bytes(len, field)?;
        if !bytes.is_ascii() {
            return Err(ProtocolError::InvalidUtf8(field));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn request_n(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        let n = self.u32(field)? & MAX_REQUEST_N;
        if n == 0 {
            return Err(ProtocolError::malformed(field, "must be greater than zero"));
        }
        Ok(n)
    }

    fn payload(&mut self, flags: Flags) -> Result<Payload, ProtocolError> {
        let metadata = if flags.contains(Flags::METADATA) {
            let len = self.u24("metadata_length")?;
            Some(self.bytes(len, "metadata")?)
        } else {
            None
        };
        Ok(Payload::new(self.rest(), metadata))
    }

    fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode();
        assert_eq!(encoded.len(), frame.encoded_len());
        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    fn sample_setup() -> Setup {
        Setup {
            major_version: 1,
            minor_version: 0,
            keepalive_ms: 20_000,
            lifetime_ms: 90_000,
            resume_token: None,
            metadata_mime_type: "message/x.rsocket.routing.v0".to_string(),
            data_mime_type: "application/json".to_string(),
            payload: Payload::from_data("hello"),
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::request_n(5, 10);
        let encoded = frame.encode();
        assert_eq!(&encoded[..4], &[0, 0, 0, 5]);
        let type_and_flags = u16::from_be_bytes([encoded[4], encoded[5]]);
        assert_eq!(type_and_flags >> 10, 0x08);
        assert_eq!(type_and_flags & 0x3FF, 0);
        assert_eq!(&encoded[6..], &[0, 0, 0, 10]);
    }

    #[test]
    fn test_flags_bits() {
        let flags = Flags::NEXT | Flags::COMPLETE;
        assert_eq!(flags.bits(), 0x60);
        assert!(flags.contains(Flags::NEXT));
        assert!(!flags.contains(Flags::FOLLOWS));
        assert_eq!(flags.without(Flags::NEXT), Flags::COMPLETE);
        assert_eq!(Flags::from_bits(0xFFFF).bits(), 0x3FF);
    }

    #[test]
    fn test_metadata_flag_is_derived() {
        let frame = Frame::new(
            1,
            Flags::METADATA | Flags::NEXT,
            Body::Payload(Payload::from_data("x")),
        );
        assert!(!frame.flags.contains(Flags::METADATA));

        let frame = Frame::payload_next(1, Payload::from_data("x").with_metadata("m"), false);
        assert!(frame.flags.contains(Flags::METADATA));
    }

    #[test]
    fn test_payload_metadata_layout() {
        let frame = Frame::payload_next(3, Payload::from_data("abc").with_metadata("mm"), true);
        let encoded = frame.encode();
        // metadata length prefix (u24) follows the header
        assert_eq!(&encoded[6..9], &[0, 0, 2]);
        assert_eq!(&encoded[9..11], b"mm");
        assert_eq!(&encoded[11..], b"abc");
    }

    #[test]
    fn test_setup_roundtrip() {
        roundtrip(Frame::setup(sample_setup(), false));
        roundtrip(Frame::setup(sample_setup(), true));

        let mut setup = sample_setup();
        setup.resume_token = Some(Bytes::from_static(b"token-1"));
        setup.payload = Payload::from_data("d").with_metadata("m");
        let frame = Frame::setup(setup, true);
        assert!(frame.flags.contains(Flags::RESUME_ENABLE));
        assert!(frame.flags.contains(Flags::LEASE));
        roundtrip(frame);
    }

    #[test]
    fn test_connection_frames_roundtrip() {
        roundtrip(Frame::lease(30_000, 100, None));
        roundtrip(Frame::lease(30_000, 100, Some(Bytes::from_static(b"lease-meta"))));
        roundtrip(Frame::keepalive(42, Bytes::from_static(b"ping"), true));
        roundtrip(Frame::keepalive(0, Bytes::new(), false));
        roundtrip(Frame::metadata_push(Bytes::from_static(b"push")));
        roundtrip(Frame::resume(Bytes::from_static(b"tok"), 10, 5));
        roundtrip(Frame::resume_ok(99));
        roundtrip(Frame::error(0, ErrorCode::ConnectionClose, "bye"));
    }

    #[test]
    fn test_stream_frames_roundtrip() {
        roundtrip(Frame::request_response(1, Payload::from_data("req")));
        roundtrip(Frame::request_fnf(3, Payload::from_data("fire").with_metadata("")));
        roundtrip(Frame::request_stream(5, 16, Payload::from_data("s")));
        roundtrip(Frame::request_channel(7, 2, Payload::from_data("c"), true));
        roundtrip(Frame::request_n(7, MAX_REQUEST_N));
        roundtrip(Frame::cancel(9));
        roundtrip(Frame::payload_next(9, Payload::from_data("n"), false));
        roundtrip(Frame::payload_complete(9));
        roundtrip(Frame::error(9, ErrorCode::Custom(0x0000_0301), "custom"));
        roundtrip(Frame::ext(11, 0xCAFE, Payload::from_data("e"), true));
    }

    #[test]
    fn test_empty_data_decodes_as_empty() {
        let frame = Frame::payload_complete(1);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.payload().map(|p| p.data().len()), Some(0));
        assert!(decoded.payload().map_or(false, |p| !p.has_metadata()));
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0])).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedFrame {
                field: "stream_id",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_metadata_overrun() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16((0x0A << 10) | Flags::METADATA.bits() | Flags::NEXT.bits());
        buf.put_uint(100, 3);
        buf.put_slice(b"short");
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedFrame {
                field: "metadata",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_zero_request_n() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(0x08 << 10);
        buf.put_u32(0);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedFrame {
                field: "request_n",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16((0x20 << 10) | Flags::IGNORE.bits());
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnknownFrameType {
                frame_type: 0x20,
                ignorable: true
            }
        );
    }

    #[test]
    fn test_decode_rejects_wrong_stream() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u16(0x03 << 10);
        buf.put_u64(0);
        assert!(Frame::decode(buf.freeze()).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u16(0x09 << 10);
        assert!(Frame::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_reserved_stream_bit_is_masked() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8000_0001);
        buf.put_u16(0x09 << 10);
        let frame = Frame::decode(buf.freeze()).unwrap();
        assert_eq!(frame.stream_id, 1);
    }

    #[test]
    fn test_invalid_utf8_error_message() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(0x0B << 10);
        buf.put_u32(0x201);
        buf.put_slice(&[0xFF, 0xFE]);
        assert_eq!(
            Frame::decode(buf.freeze()).unwrap_err(),
            ProtocolError::InvalidUtf8("error_message")
        );
    }

    #[test]
    fn test_frame_type_codes() {
        for code in 0u8..=0x3F {
            if let Some(frame_type) = FrameType::from_u8(code) {
                assert_eq!(frame_type.code(), code);
            }
        }
        assert_eq!(FrameType::from_u8(0x00), None);
        assert_eq!(FrameType::from_u8(0x3F), Some(FrameType::Ext));
        assert_eq!(FrameType::RequestChannel.to_string(), "REQUEST_CHANNEL");
    }

    fn arb_bytes() -> impl Strategy<Value = Bytes> {
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from)
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        (arb_bytes(), proptest::option::of(arb_bytes()))
            .prop_map(|(data, metadata)| Payload::new(data, metadata))
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        let stream_id = 1u32..=MAX_STREAM_ID;
        let request_n = 1u32..=MAX_REQUEST_N;
        prop_oneof![
            (stream_id.clone(), arb_payload()).prop_map(|(id, p)| Frame::request_response(id, p)),
            (stream_id.clone(), arb_payload()).prop_map(|(id, p)| Frame::request_fnf(id, p)),
            (stream_id.clone(), request_n.clone(), arb_payload())
                .prop_map(|(id, n, p)| Frame::request_stream(id, n, p)),
            (stream_id.clone(), request_n.clone(), arb_payload(), any::<bool>())
                .prop_map(|(id, n, p, c)| Frame::request_channel(id, n, p, c)),
            (stream_id.clone(), request_n).prop_map(|(id, n)| Frame::request_n(id, n)),
            stream_id.clone().prop_map(Frame::cancel),
            (stream_id.clone(), arb_payload(), any::<bool>())
                .prop_map(|(id, p, c)| Frame::payload_next(id, p, c)),
            (0u32..=MAX_STREAM_ID, any::<u32>(), "[a-z ]{0,32}")
                .prop_map(|(id, code, msg)| Frame::error(id, ErrorCode::from_u32(code), msg)),
            (any::<u64>(), arb_bytes(), any::<bool>())
                .prop_map(|(pos, data, respond)| Frame::keepalive(pos, data, respond)),
            (any::<u32>(), any::<u32>(), proptest::option::of(arb_bytes()))
                .prop_map(|(ttl, count, meta)| Frame::lease(ttl, count, meta)),
            arb_bytes().prop_map(Frame::metadata_push),
            (stream_id, any::<u32>(), arb_payload(), any::<bool>())
                .prop_map(|(id, ty, p, ignore)| Frame::ext(id, ty, p, ignore)),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(frame in arb_frame()) {
            let decoded = Frame::decode(frame.encode()).unwrap();
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Frame::decode(Bytes::from(bytes));
        }
    }
}
