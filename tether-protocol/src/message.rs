//! Message Types
//!
//! Requests and responses are closed sum types. Each variant has a stable
//! 16-bit type value and a fixed payload layout; a response payload always
//! starts with the id of the request it answers.

use crate::packet::{read_bytes, read_i32, read_string, read_u32, read_u64, read_u8, PacketError};
use crate::sequence::MessageId;
use bytes::{BufMut, Bytes};

/// Value a `Connect` response must carry
pub const CONNECT_CHECK_VALUE: i32 = 42;

/// Message class byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageClass {
    Response = 0x12,
    Request = 0x28,
}

impl MessageClass {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x12 => Some(MessageClass::Response),
            0x28 => Some(MessageClass::Request),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Encryption mode negotiated during the handshake
///
/// The cipher itself lives outside the transport; only the agreement is
/// carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionMode {
    #[default]
    None = 0,
    Standard = 1,
}

impl EncryptionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EncryptionMode::None),
            1 => Some(EncryptionMode::Standard),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Request type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestKind {
    Connect = 1,
    Security = 2,
    Authenticate = 3,
    Echo = 4,
    RemoteConsoleAccess = 5,
    Custom = 0x100,
}

impl RequestKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(RequestKind::Connect),
            2 => Some(RequestKind::Security),
            3 => Some(RequestKind::Authenticate),
            4 => Some(RequestKind::Echo),
            5 => Some(RequestKind::RemoteConsoleAccess),
            0x100 => Some(RequestKind::Custom),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// True if an encoded request of this kind writes payload bytes
    pub fn has_payload(self) -> bool {
        !matches!(self, RequestKind::Connect | RequestKind::Echo)
    }
}

/// Response type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseKind {
    None = 0,
    Keepalive = 1,
    CloseConnection = 2,
    Connect = 3,
    Security = 4,
    Authenticate = 5,
    RemoteConsoleOpened = 6,
    Custom = 0x100,
}

impl ResponseKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ResponseKind::None),
            1 => Some(ResponseKind::Keepalive),
            2 => Some(ResponseKind::CloseConnection),
            3 => Some(ResponseKind::Connect),
            4 => Some(ResponseKind::Security),
            5 => Some(ResponseKind::Authenticate),
            6 => Some(ResponseKind::RemoteConsoleOpened),
            0x100 => Some(ResponseKind::Custom),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// True if the body (after `response_to`) writes payload bytes
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            ResponseKind::Connect
                | ResponseKind::Security
                | ResponseKind::Authenticate
                | ResponseKind::Custom
        )
    }
}

/// A request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Opens the handshake
    Connect,
    /// Asks for an encryption mode
    Security { encryption: EncryptionMode },
    /// Logs in; answered with a connection-scoped identity
    Authenticate { user_name: String },
    /// Round-trip timing probe
    Echo,
    /// Opens a remote-console session on a restricted connection
    RemoteConsoleAccess { session_token: i32 },
    /// Application payload
    Custom(Bytes),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Connect => RequestKind::Connect,
            Request::Security { .. } => RequestKind::Security,
            Request::Authenticate { .. } => RequestKind::Authenticate,
            Request::Echo => RequestKind::Echo,
            Request::RemoteConsoleAccess { .. } => RequestKind::RemoteConsoleAccess,
            Request::Custom(_) => RequestKind::Custom,
        }
    }

    /// Write the type-specific payload
    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            Request::Connect | Request::Echo => {}
            Request::Security { encryption } => buf.put_u8(encryption.as_u8()),
            Request::Authenticate { user_name } => put_string(buf, user_name),
            Request::RemoteConsoleAccess { session_token } => buf.put_i32_le(*session_token),
            Request::Custom(data) => put_bytes(buf, data),
        }
    }

    /// Read a payload of the given type, advancing `buf`
    pub fn decode_payload(kind: u16, buf: &mut &[u8]) -> Result<Self, PacketError> {
        let kind = RequestKind::from_u16(kind).ok_or(PacketError::UnknownRequestType(kind))?;

        Ok(match kind {
            RequestKind::Connect => Request::Connect,
            RequestKind::Security => Request::Security {
                encryption: read_encryption(buf)?,
            },
            RequestKind::Authenticate => Request::Authenticate {
                user_name: read_string(buf)?,
            },
            RequestKind::Echo => Request::Echo,
            RequestKind::RemoteConsoleAccess => Request::RemoteConsoleAccess {
                session_token: read_i32(buf)?,
            },
            RequestKind::Custom => Request::Custom(read_bytes(buf)?),
        })
    }
}

/// Body of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Empty response, also used to answer echoes
    None,
    /// Liveness probe
    Keepalive,
    /// Peer is closing the connection
    CloseConnection,
    /// Answer to `Connect`
    Connect { check_value: i32 },
    /// Announces the encryption mode in force
    Security { encryption: EncryptionMode },
    /// Identity assigned by the accepting side
    Authenticate { user_id: i32, token: u64 },
    /// Remote console session accepted
    RemoteConsoleOpened,
    /// Application payload
    Custom(Bytes),
}

impl ResponseBody {
    pub fn kind(&self) -> ResponseKind {
        match self {
            ResponseBody::None => ResponseKind::None,
            ResponseBody::Keepalive => ResponseKind::Keepalive,
            ResponseBody::CloseConnection => ResponseKind::CloseConnection,
            ResponseBody::Connect { .. } => ResponseKind::Connect,
            ResponseBody::Security { .. } => ResponseKind::Security,
            ResponseBody::Authenticate { .. } => ResponseKind::Authenticate,
            ResponseBody::RemoteConsoleOpened => ResponseKind::RemoteConsoleOpened,
            ResponseBody::Custom(_) => ResponseKind::Custom,
        }
    }

    /// True for bodies that carry no information beyond liveness
    pub fn is_empty_kind(&self) -> bool {
        matches!(self, ResponseBody::None | ResponseBody::Keepalive)
    }
}

/// A response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Message id of the request this answers, or [`MessageId::NONE`]
    pub response_to: MessageId,
    pub body: ResponseBody,
}

impl Response {
    /// A response answering `request`
    pub fn to(request: MessageId, body: ResponseBody) -> Self {
        Response {
            response_to: request,
            body,
        }
    }

    /// A response not tied to any request
    pub fn unsolicited(body: ResponseBody) -> Self {
        Response {
            response_to: MessageId::NONE,
            body,
        }
    }

    pub fn kind(&self) -> ResponseKind {
        self.body.kind()
    }

    /// Write `response_to` followed by the body payload
    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.response_to.as_raw());

        match &self.body {
            ResponseBody::None
            | ResponseBody::Keepalive
            | ResponseBody::CloseConnection
            | ResponseBody::RemoteConsoleOpened => {}
            ResponseBody::Connect { check_value } => buf.put_i32_le(*check_value),
            ResponseBody::Security { encryption } => buf.put_u8(encryption.as_u8()),
            ResponseBody::Authenticate { user_id, token } => {
                buf.put_i32_le(*user_id);
                buf.put_u64_le(*token);
            }
            ResponseBody::Custom(data) => put_bytes(buf, data),
        }
    }

    /// Read a response of the given type, advancing `buf`
    pub fn decode_payload(kind: u16, buf: &mut &[u8]) -> Result<Self, PacketError> {
        let kind = ResponseKind::from_u16(kind).ok_or(PacketError::UnknownResponseType(kind))?;
        let response_to = MessageId::new(read_u32(buf)?);

        let body = match kind {
            ResponseKind::None => ResponseBody::None,
            ResponseKind::Keepalive => ResponseBody::Keepalive,
            ResponseKind::CloseConnection => ResponseBody::CloseConnection,
            ResponseKind::Connect => ResponseBody::Connect {
                check_value: read_i32(buf)?,
            },
            ResponseKind::Security => ResponseBody::Security {
                encryption: read_encryption(buf)?,
            },
            ResponseKind::Authenticate => ResponseBody::Authenticate {
                user_id: read_i32(buf)?,
                token: read_u64(buf)?,
            },
            ResponseKind::RemoteConsoleOpened => ResponseBody::RemoteConsoleOpened,
            ResponseKind::Custom => ResponseBody::Custom(read_bytes(buf)?),
        };

        Ok(Response { response_to, body })
    }
}

/// Either class of message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn class(&self) -> MessageClass {
        match self {
            Message::Request(_) => MessageClass::Request,
            Message::Response(_) => MessageClass::Response,
        }
    }

    /// Raw type value written after the message id
    pub fn type_value(&self) -> u16 {
        match self {
            Message::Request(request) => request.kind().as_u16(),
            Message::Response(response) => response.kind().as_u16(),
        }
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            Message::Request(request) => format!("request {:?}", request.kind()),
            Message::Response(response) => format!("response {:?}", response.kind()),
        }
    }

    /// Write the payload, checking it against what the type declares
    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        let before = buf.remaining_mut();
        let (declared, fixed) = match self {
            Message::Request(request) => {
                request.encode_payload(buf);
                (request.kind().has_payload(), 0)
            }
            Message::Response(response) => {
                response.encode_payload(buf);
                // `response_to` is always written and is not part of the body
                (response.kind().has_payload(), 4)
            }
        };

        let written = before - buf.remaining_mut();
        debug_assert!(
            !declared || written > fixed,
            "{} declares a payload but encoded none",
            self.label()
        );
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn put_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn read_encryption(buf: &mut &[u8]) -> Result<EncryptionMode, PacketError> {
    let raw = read_u8(buf)?;
    EncryptionMode::from_u8(raw).ok_or(PacketError::InvalidEncryptionMode(raw))
}
