// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, u8 as parse_u8},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Display, Formatter};

/// Largest message allowed without the extended message capability.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Largest message allowed once the extended message capability has been
/// negotiated.
///
/// Ref: RFC 8654
pub const MAX_EXT_MESSAGE_SIZE: usize = 65535;

pub const OPEN_MIN_SIZE: usize = 29;
pub const UPDATE_MIN_SIZE: usize = 23;
pub const NOTIFICATION_MIN_SIZE: usize = 21;
pub const KEEPALIVE_SIZE: usize = 19;
pub const ROUTE_REFRESH_SIZE: usize = 23;

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,

    /// Asks a peer to re-advertise its Adj-RIB-Out for one address family.
    ///
    /// RFC 2918 §3, RFC 7313 §3.2
    RouteRefresh = 5,
}

impl MessageType {
    /// The smallest valid total length for a message of this type.
    pub fn min_size(&self) -> usize {
        match self {
            Self::Open => OPEN_MIN_SIZE,
            Self::Update => UPDATE_MIN_SIZE,
            Self::Notification => NOTIFICATION_MIN_SIZE,
            Self::KeepAlive => KEEPALIVE_SIZE,
            Self::RouteRefresh => ROUTE_REFRESH_SIZE,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Update => write!(f, "UPDATE"),
            Self::Notification => write!(f, "NOTIFICATION"),
            Self::KeepAlive => write!(f, "KEEPALIVE"),
            Self::RouteRefresh => write!(f, "ROUTE-REFRESH"),
        }
    }
}

/// An outbound message. UPDATE bodies are produced by the RDE and are carried
/// through opaquely.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Open(OpenMessage),
    Update(Vec<u8>),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
}

impl Message {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Open(_) => MessageType::Open,
            Self::Update(_) => MessageType::Update,
            Self::Notification(_) => MessageType::Notification,
            Self::KeepAlive => MessageType::KeepAlive,
            Self::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }

    /// Serialize the message body, without the header.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(body) => Ok(body.clone()),
            Self::Notification(m) => Ok(m.to_wire()),
            Self::KeepAlive => Ok(Vec::new()),
            Self::RouteRefresh(m) => Ok(m.to_wire()),
        }
    }

    /// Serialize the complete message, header included. `max_len` is the
    /// largest total length the session currently allows.
    pub fn to_frame(&self, max_len: usize) -> Result<Vec<u8>, Error> {
        frame(self.typ(), &self.to_wire()?, max_len)
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}

impl From<RouteRefreshMessage> for Message {
    fn from(m: RouteRefreshMessage) -> Message {
        Message::RouteRefresh(m)
    }
}

/// Prefix `body` with a header for a message of type `typ`.
pub fn frame(
    typ: MessageType,
    body: &[u8],
    max_len: usize,
) -> Result<Vec<u8>, Error> {
    let length = Header::WIRE_SIZE + body.len();
    if length > max_len {
        return Err(Error::TooLarge(format!("{typ} message of {length}")));
    }
    let mut buf = Header {
        length: length as u16,
        typ,
    }
    .to_wire();
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// This object contains the length and type fields. The marker is
/// generated by [`Header::to_wire`] and checked by [`Header::validate`].
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    /// Total length of the message, including the header.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

/// According to RFC 4271 §4.1 the header marker is all ones.
pub const MARKER: [u8; 16] = [0xFFu8; 16];

/// Ways a received header can be unacceptable. Each maps onto a header
/// error NOTIFICATION.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HeaderError {
    /// The marker is not all ones.
    Sync,

    /// The length is out of range, in general or for the message type.
    BadLength(u16),

    /// The message type is not one we know.
    BadType(u8),
}

impl HeaderError {
    pub fn notification(&self) -> NotificationMessage {
        match self {
            Self::Sync => NotificationMessage::new(
                ErrorCode::Header,
                HeaderErrorSubcode::ConnectionNotSynchronized,
                Vec::new(),
            ),
            Self::BadLength(len) => NotificationMessage::new(
                ErrorCode::Header,
                HeaderErrorSubcode::BadMessageLength,
                len.to_be_bytes().to_vec(),
            ),
            Self::BadType(typ) => NotificationMessage::new(
                ErrorCode::Header,
                HeaderErrorSubcode::BadMessageType,
                vec![*typ],
            ),
        }
    }
}

impl Display for HeaderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync error"),
            Self::BadLength(len) => write!(f, "bad message length {len}"),
            Self::BadType(typ) => write!(f, "unknown message type {typ}"),
        }
    }
}

impl Header {
    pub const WIRE_SIZE: usize = 19;

    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Check a received header. `max_len` is 4096, or 65535 once the
    /// extended message capability is in effect. OPEN messages are always
    /// held to 4096.
    pub fn validate(
        buf: &[u8; Header::WIRE_SIZE],
        max_len: usize,
    ) -> Result<Header, HeaderError> {
        if buf[..MARKER.len()] != MARKER {
            return Err(HeaderError::Sync);
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]);
        let len = usize::from(length);
        if len < Header::WIRE_SIZE || len > max_len {
            return Err(HeaderError::BadLength(length));
        }
        let typ = MessageType::try_from(buf[18])
            .map_err(|_| HeaderError::BadType(buf[18]))?;

        let ok = match typ {
            MessageType::Open => {
                len >= OPEN_MIN_SIZE && len <= MAX_MESSAGE_SIZE
            }
            MessageType::KeepAlive => len == KEEPALIVE_SIZE,
            t => len >= t.min_size(),
        };
        if !ok {
            return Err(HeaderError::BadLength(length));
        }
        Ok(Header { length, typ })
    }
}

/// The autonomous system number used in OPEN messages when 4-byte ASNs are in
/// use.
///
/// Ref: RFC 4893 §7
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4
pub const BGP4: u8 = 4;

/// The first message sent by each side once a TCP connection is established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |     Optional Parameters       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :             Optional Parameters (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// When the optional parameters do not fit a one byte length the RFC 9072
/// layout is used: the length byte is 255 and is followed by a parameter of
/// type 255 carrying a two byte length, and every parameter then has a two
/// byte length of its own.
///
/// Ref: RFC 4271 §4.2, RFC 9072
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When 4-byte ASNs are in use this
    /// value is set to AS_TRANS which has a value of 23456.
    ///
    /// Ref: RFC 4893 §7
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender
    pub id: u32,

    /// A list of optional parameters.
    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    /// Create an open message carrying the given encoded capabilities. No
    /// capabilities parameter is added when `capabilities` is empty.
    pub fn new(
        asn: u16,
        hold_time: u16,
        id: u32,
        capabilities: Vec<u8>,
    ) -> OpenMessage {
        let mut parameters = Vec::new();
        if !capabilities.is_empty() {
            parameters.push(OptionalParameter::Capabilities(capabilities));
        }
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            parameters,
        }
    }

    /// Serialize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // version
        buf.push(self.version);

        // as
        buf.extend_from_slice(&self.asn.to_be_bytes());

        // hold time
        buf.extend_from_slice(&self.hold_time.to_be_bytes());

        // id
        buf.extend_from_slice(&self.id.to_be_bytes());

        // opt param len
        let short: usize =
            self.parameters.iter().map(|p| 2 + p.value().len()).sum();
        let fits = short < usize::from(u8::MAX)
            && self
                .parameters
                .iter()
                .all(|p| p.value().len() <= usize::from(u8::MAX));

        if fits {
            buf.push(short as u8);
            for p in &self.parameters {
                buf.push(p.code());
                buf.push(p.value().len() as u8);
                buf.extend_from_slice(p.value());
            }
        } else {
            let long: usize =
                self.parameters.iter().map(|p| 3 + p.value().len()).sum();
            if long > usize::from(u16::MAX) {
                return Err(Error::TooLarge(
                    "open message optional parameters".into(),
                ));
            }
            buf.push(u8::MAX);
            buf.push(OptionalParameter::EXTENDED_LENGTH);
            buf.extend_from_slice(&(long as u16).to_be_bytes());
            for p in &self.parameters {
                buf.push(p.code());
                buf.extend_from_slice(&(p.value().len() as u16).to_be_bytes());
                buf.extend_from_slice(p.value());
            }
        }

        Ok(buf)
    }

    /// Deserialize an open message from wire format. A version other than 4 is
    /// reported as [`Error::BadVersion`] before anything else is looked at.
    pub fn from_wire(input: &[u8]) -> Result<OpenMessage, Error> {
        let (input, version) = parse_u8(input)?;
        if version != BGP4 {
            return Err(Error::BadVersion(version));
        }
        let (input, asn) = be_u16(input)?;
        let (input, hold_time) = be_u16(input)?;
        let (input, id) = be_u32(input)?;
        let (input, param_len) = parse_u8(input)?;

        let (rest, parameters) = if param_len == 0 {
            (input, Vec::new())
        } else if input.first() == Some(&OptionalParameter::EXTENDED_LENGTH) {
            let (input, _) = parse_u8(input)?;
            let (input, ext_len) = be_u16(input)?;
            let (rest, params) = take(ext_len)(input)?;
            (rest, Self::parameters_from_wire(params, true)?)
        } else {
            let (rest, params) = take(param_len)(input)?;
            (rest, Self::parameters_from_wire(params, false)?)
        };

        if !rest.is_empty() {
            return Err(Error::TrailingData(rest.len()));
        }

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }

    fn parameters_from_wire(
        mut buf: &[u8],
        extended: bool,
    ) -> Result<Vec<OptionalParameter>, Error> {
        let mut result = Vec::new();

        while !buf.is_empty() {
            let (input, code) = parse_u8(buf)?;
            let (input, len) = if extended {
                be_u16(input)?
            } else {
                let (input, len) = parse_u8(input)?;
                (input, u16::from(len))
            };
            let (input, value) = take(len)(input)?;
            result.push(OptionalParameter::from_parts(code, value));
            buf = input;
        }

        Ok(result)
    }
}

/// Optional parameters of an OPEN message. Only capabilities are used; the
/// deprecated authentication parameter and anything unassigned are carried
/// as `Other` so the session can refuse them.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492. The value is a sequence of capability TLVs.
    Capabilities(Vec<u8>),

    Other { code: u8, value: Vec<u8> },
}

impl OptionalParameter {
    pub const CAPABILITIES: u8 = 2;
    pub const EXTENDED_LENGTH: u8 = 255;

    fn from_parts(code: u8, value: &[u8]) -> OptionalParameter {
        match code {
            Self::CAPABILITIES => Self::Capabilities(value.to_vec()),
            code => Self::Other {
                code,
                value: value.to_vec(),
            },
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Capabilities(_) => Self::CAPABILITIES,
            Self::Other { code, .. } => *code,
        }
    }

    pub fn value(&self) -> &[u8] {
        match self {
            Self::Capabilities(v) => v,
            Self::Other { value, .. } => value,
        }
    }
}

/// Sent when an error condition is detected, after which the connection is
/// closed. Codes are kept as raw octets so that anything a peer sends can be
/// logged and counted; the typed enums below are used to build and name
/// them.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Error code    | Error subcode |   Data (variable)             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(
        code: ErrorCode,
        subcode: impl Into<u8>,
        data: Vec<u8>,
    ) -> NotificationMessage {
        NotificationMessage {
            error_code: code.into(),
            error_subcode: subcode.into(),
            data,
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![self.error_code, self.error_subcode];
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<NotificationMessage, Error> {
        let (input, error_code) = parse_u8(input)?;
        let (input, error_subcode) = parse_u8(input)?;
        Ok(NotificationMessage {
            error_code,
            error_subcode,
            data: input.to_owned(),
        })
    }

    pub fn code(&self) -> Result<ErrorCode, Error> {
        Ok(ErrorCode::try_from(self.error_code)?)
    }
}

impl Display for NotificationMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", describe_error(self.error_code, self.error_subcode))
    }
}

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open,
    Update,
    HoldTimerExpired,
    Fsm,
    Cease,
    RouteRefresh,
    SendHoldTimerExpired,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Header => "header error",
            Self::Open => "error in OPEN message",
            Self::Update => "error in UPDATE message",
            Self::HoldTimerExpired => "HoldTimer expired",
            Self::Fsm => "Finite State Machine error",
            Self::Cease => "Cease",
            Self::RouteRefresh => "error in ROUTE-REFRESH message",
            Self::SendHoldTimerExpired => "SendHoldTimer expired",
        };
        write!(f, "{s}")
    }
}

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    Unspecific = 0,
    ConnectionNotSynchronized,
    BadMessageLength,
    BadMessageType,
}

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    Unspecific = 0,
    UnsupportedVersionNumber,
    BadPeerAS,
    BadBgpIdentifier,
    UnsupportedOptionalParameter,
    Deprecated,
    UnacceptableHoldTime,
    UnsupportedCapability,

    /// RFC 9234
    RoleMismatch = 11,
}

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    Unspecific = 0,
    MalformedAttributeList,
    UnrecognizedWellKnownAttribute,
    MissingWellKnownAttribute,
    AttributeFlags,
    AttributeLength,
    InvalidOriginAttribute,
    Deprecated,
    InvalidNexthopAttribute,
    OptionalAttribute,
    InvalidNetworkField,
    MalformedAsPath,
}

/// Ref: RFC 6608
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum FsmErrorSubcode {
    Unspecific = 0,
    UnexpectedInOpenSent,
    UnexpectedInOpenConfirm,
    UnexpectedInEstablished,
}

/// Ref: RFC 4486, RFC 8538
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum CeaseErrorSubcode {
    Unspecific = 0,
    MaxPrefix,
    AdminShutdown,
    PeerUnconfigured,
    AdminReset,
    ConnectionRejected,
    OtherConfigChange,
    ConnectionCollision,
    OutOfResources,
    HardReset,
    MaxSentPrefix,
}

/// Ref: RFC 7313 §5
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum RouteRefreshErrorSubcode {
    Reserved = 0,
    InvalidLength,
}

/// Human readable name of an error code and subcode pair, for logs.
pub fn describe_error(code: u8, subcode: u8) -> String {
    let Ok(ec) = ErrorCode::try_from(code) else {
        return format!("unknown error code {code}, subcode {subcode}");
    };
    let sub = match ec {
        ErrorCode::Header => {
            HeaderErrorSubcode::try_from(subcode)
                .ok()
                .map(|s| format!("{s:?}"))
        }
        ErrorCode::Open => {
            OpenErrorSubcode::try_from(subcode)
                .ok()
                .map(|s| format!("{s:?}"))
        }
        ErrorCode::Update => {
            UpdateErrorSubcode::try_from(subcode)
                .ok()
                .map(|s| format!("{s:?}"))
        }
        ErrorCode::Fsm => {
            FsmErrorSubcode::try_from(subcode)
                .ok()
                .map(|s| format!("{s:?}"))
        }
        ErrorCode::Cease => {
            CeaseErrorSubcode::try_from(subcode)
                .ok()
                .map(|s| format!("{s:?}"))
        }
        ErrorCode::RouteRefresh => RouteRefreshErrorSubcode::try_from(subcode)
            .ok()
            .map(|s| format!("{s:?}")),
        ErrorCode::HoldTimerExpired | ErrorCode::SendHoldTimerExpired => {
            return format!("{ec}");
        }
    };
    match sub {
        Some(s) => format!("{ec}, {s}"),
        None => format!("{ec}, unknown subcode {subcode}"),
    }
}

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum RouteRefreshSubtype {
    Request = 0,

    /// Ref: RFC 7313
    BeginOfRr = 1,

    /// Ref: RFC 7313
    EndOfRr = 2,
}

/// ```text
///  0       7      15      23      31
/// +-------+-------+-------+-------+
/// |      AFI      | Subt. | SAFI  |
/// +-------+-------+-------+-------+
/// ```
///
/// Ref: RFC 2918 §3, RFC 7313 §3.2
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub subtype: u8,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = self.afi.to_be_bytes().to_vec();
        buf.push(self.subtype);
        buf.push(self.safi);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<RouteRefreshMessage, Error> {
        let (input, afi) = be_u16(input)?;
        let (input, subtype) = parse_u8(input)?;
        let (_, safi) = parse_u8(input)?;
        Ok(RouteRefreshMessage { afi, subtype, safi })
    }
}
