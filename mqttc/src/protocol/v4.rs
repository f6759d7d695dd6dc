//! MQTT 3.1.1 (v4) protocol implementation.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Error, Result};

use super::codec::{
    has_size, read_pkid, read_string, read_u8, remaining_length_len, write_binary,
    write_remaining_length, write_string, write_u16, write_u8,
};
use super::{MAX_REMAINING_LENGTH, PROTOCOL_LEVEL, PROTOCOL_NAME};

/// Control packet type, the high nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        })
    }
}

/// First byte of every control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
}

impl FixedHeader {
    pub fn new(packet_type: PacketType, flags: u8) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0F,
        }
    }

    /// Split a header byte into packet type and flags.
    pub fn from_byte(byte: u8) -> std::result::Result<Self, DecodeError> {
        let packet_type =
            PacketType::from_u8(byte >> 4).ok_or(DecodeError::MalformedPacketType(byte >> 4))?;
        Ok(Self::new(packet_type, byte))
    }

    pub fn byte1(&self) -> u8 {
        ((self.packet_type as u8) << 4) | self.flags
    }
}

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(value: u8) -> std::result::Result<Self, DecodeError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            n => Err(DecodeError::MalformedQoS(n)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> std::result::Result<Self, DecodeError> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            n => Err(DecodeError::MalformedConnAckReturnCode(n)),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(reason)
    }
}

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
}

/// Last Will and Testament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
///
/// The identifier is present exactly when QoS is above 0; [`Publish::new`]
/// enforces this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    dup: bool,
    pkid: Option<u16>,
}

/// PUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

/// PUBREC packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

/// PUBREL packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

/// PUBCOMP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pkid: u16,
    filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

/// Subscribe reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Failure,
}

impl TryFrom<u8> for SubscribeReasonCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> std::result::Result<Self, DecodeError> {
        match value {
            0 => Ok(SubscribeReasonCode::Success(QoS::AtMostOnce)),
            1 => Ok(SubscribeReasonCode::Success(QoS::AtLeastOnce)),
            2 => Ok(SubscribeReasonCode::Success(QoS::ExactlyOnce)),
            0x80 => Ok(SubscribeReasonCode::Failure),
            n => Err(DecodeError::MalformedSubAckReturnCode(n)),
        }
    }
}

impl SubscribeReasonCode {
    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReasonCode::Success(qos) => qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pkid: u16,
    topics: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

// ============================================================================
// Construction
// ============================================================================

/// Check a topic name used in PUBLISH or a will message.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic("topic name is empty".into()));
    }
    if topic.len() > u16::MAX as usize {
        return Err(Error::InvalidTopic(format!("topic name is {} bytes", topic.len())));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(format!("wildcard in topic name {topic:?}")));
    }
    Ok(())
}

fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopic("topic filter is empty".into()));
    }
    if filter.len() > u16::MAX as usize {
        return Err(Error::InvalidTopic(format!("topic filter is {} bytes", filter.len())));
    }
    Ok(())
}

fn check_remaining_length(size: usize) -> Result<()> {
    if size > MAX_REMAINING_LENGTH {
        return Err(Error::PacketTooLarge {
            size,
            max: MAX_REMAINING_LENGTH,
        });
    }
    Ok(())
}

impl Publish {
    /// Build a PUBLISH, checking the QoS/identifier pairing, the topic and
    /// the encoded size.
    pub fn new(
        topic: impl Into<String>,
        qos: QoS,
        payload: impl Into<Bytes>,
        retain: bool,
        pkid: Option<u16>,
    ) -> Result<Self> {
        let topic = topic.into();
        validate_topic_name(&topic)?;

        match (qos, pkid) {
            (QoS::AtMostOnce, Some(_)) => {
                return Err(Error::InvalidPacketIdentifier("QoS 0 publish carries no identifier"));
            }
            (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
                return Err(Error::InvalidPacketIdentifier("QoS 1/2 publish requires an identifier"));
            }
            (_, Some(0)) => return Err(Error::InvalidPacketIdentifier("identifier 0 is reserved")),
            _ => {}
        }

        let payload = payload.into();
        let pkid_len = if pkid.is_some() { 2 } else { 0 };
        check_remaining_length(2 + topic.len() + pkid_len + payload.len())?;

        Ok(Self {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            pkid,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn dup(&self) -> bool {
        self.dup
    }

    pub fn pkid(&self) -> Option<u16> {
        self.pkid
    }
}

impl Subscribe {
    pub fn new(pkid: u16, filters: Vec<SubscribeFilter>) -> Result<Self> {
        if pkid == 0 {
            return Err(Error::InvalidPacketIdentifier("identifier 0 is reserved"));
        }
        if filters.is_empty() {
            return Err(Error::InvalidTopic("subscribe needs at least one filter".into()));
        }
        for filter in &filters {
            validate_topic_filter(&filter.path)?;
        }
        check_remaining_length(2 + filters.iter().map(|f| 2 + f.path.len() + 1).sum::<usize>())?;
        Ok(Self { pkid, filters })
    }

    pub fn pkid(&self) -> u16 {
        self.pkid
    }

    pub fn filters(&self) -> &[SubscribeFilter] {
        &self.filters
    }
}

impl Unsubscribe {
    pub fn new(pkid: u16, topics: Vec<String>) -> Result<Self> {
        if pkid == 0 {
            return Err(Error::InvalidPacketIdentifier("identifier 0 is reserved"));
        }
        if topics.is_empty() {
            return Err(Error::InvalidTopic("unsubscribe needs at least one filter".into()));
        }
        for topic in &topics {
            validate_topic_filter(topic)?;
        }
        check_remaining_length(2 + topics.iter().map(|t| 2 + t.len()).sum::<usize>())?;
        Ok(Self { pkid, topics })
    }

    pub fn pkid(&self) -> u16 {
        self.pkid
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

// ============================================================================
// Packet encoding
// ============================================================================

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    pub fn fixed_header(&self) -> FixedHeader {
        let flags = match self {
            Packet::Publish(p) => {
                ((p.dup as u8) << 3) | ((p.qos as u8) << 1) | (p.retain as u8)
            }
            Packet::PubRel(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) => 0b0010,
            _ => 0,
        };
        FixedHeader::new(self.packet_type(), flags)
    }

    /// Packet identifier, for packets that carry one.
    pub fn pkid(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.pkid,
            Packet::PubAck(p) => Some(p.pkid),
            Packet::PubRec(p) => Some(p.pkid),
            Packet::PubRel(p) => Some(p.pkid),
            Packet::PubComp(p) => Some(p.pkid),
            Packet::Subscribe(p) => Some(p.pkid),
            Packet::SubAck(p) => Some(p.pkid),
            Packet::Unsubscribe(p) => Some(p.pkid),
            Packet::UnsubAck(p) => Some(p.pkid),
            _ => None,
        }
    }

    /// Length of the variable header plus payload.
    pub fn remaining_length(&self) -> usize {
        match self {
            Packet::Connect(p) => p.remaining_length(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => {
                2 + p.topic.len() + if p.pkid.is_some() { 2 } else { 0 } + p.payload.len()
            }
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(p) => 2 + p.filters.iter().map(|f| 2 + f.path.len() + 1).sum::<usize>(),
            Packet::SubAck(p) => 2 + p.return_codes.len(),
            Packet::Unsubscribe(p) => 2 + p.topics.iter().map(|t| 2 + t.len()).sum::<usize>(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        }
    }

    /// Total encoded size including the fixed header.
    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + remaining_length_len(remaining) + remaining
    }

    /// Append the encoded packet to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        let remaining = self.remaining_length();
        buf.reserve(1 + remaining_length_len(remaining) + remaining);

        write_u8(buf, self.fixed_header().byte1());
        write_remaining_length(buf, remaining);

        match self {
            Packet::Connect(p) => p.write_body(buf),
            Packet::ConnAck(p) => {
                write_u8(buf, p.session_present as u8);
                write_u8(buf, p.code as u8);
            }
            Packet::Publish(p) => {
                write_string(buf, &p.topic);
                if let Some(pkid) = p.pkid {
                    write_u16(buf, pkid);
                }
                buf.put_slice(&p.payload);
            }
            Packet::PubAck(PubAck { pkid })
            | Packet::PubRec(PubRec { pkid })
            | Packet::PubRel(PubRel { pkid })
            | Packet::PubComp(PubComp { pkid })
            | Packet::UnsubAck(UnsubAck { pkid }) => write_u16(buf, *pkid),
            Packet::Subscribe(p) => {
                write_u16(buf, p.pkid);
                for filter in &p.filters {
                    write_string(buf, &filter.path);
                    write_u8(buf, filter.qos as u8);
                }
            }
            Packet::SubAck(p) => {
                write_u16(buf, p.pkid);
                for code in &p.return_codes {
                    write_u8(buf, code.to_u8());
                }
            }
            Packet::Unsubscribe(p) => {
                write_u16(buf, p.pkid);
                for topic in &p.topics {
                    write_string(buf, topic);
                }
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write(&mut buf);
        buf.freeze()
    }
}

impl Connect {
    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep alive
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();
        if let Some(will) = &self.will {
            len += 2 + will.topic.len() + 2 + will.payload.len();
        }
        if let Some(username) = &self.username {
            len += 2 + username.len();
        }
        if let Some(password) = &self.password {
            len += 2 + password.len();
        }
        len
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        flags
    }

    fn write_body(&self, buf: &mut BytesMut) {
        write_string(buf, PROTOCOL_NAME);
        write_u8(buf, PROTOCOL_LEVEL);
        write_u8(buf, self.flags());
        write_u16(buf, self.keep_alive);
        write_string(buf, &self.client_id);

        if let Some(will) = &self.will {
            write_string(buf, &will.topic);
            write_binary(buf, &will.payload);
        }
        if let Some(username) = &self.username {
            write_string(buf, username);
        }
        if let Some(password) = &self.password {
            write_binary(buf, password);
        }
    }
}

// ============================================================================
// Packet parsing
// ============================================================================

impl Packet {
    /// Parse a packet body whose frame has already been split off the stream.
    ///
    /// Only packets a broker sends to a client are accepted. The body must be
    /// consumed exactly.
    pub fn read(header: FixedHeader, mut body: Bytes) -> std::result::Result<Packet, DecodeError> {
        let packet = match header.packet_type {
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut body)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, &mut body)?),
            PacketType::PubAck => Packet::PubAck(PubAck {
                pkid: read_pkid(&mut body)?,
            }),
            PacketType::PubRec => Packet::PubRec(PubRec {
                pkid: read_pkid(&mut body)?,
            }),
            PacketType::PubRel if header.flags != 0b0010 => return Err(DecodeError::MalformedData),
            PacketType::PubRel => Packet::PubRel(PubRel {
                pkid: read_pkid(&mut body)?,
            }),
            PacketType::PubComp => Packet::PubComp(PubComp {
                pkid: read_pkid(&mut body)?,
            }),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut body)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck {
                pkid: read_pkid(&mut body)?,
            }),
            PacketType::PingResp => Packet::PingResp,
            other => return Err(DecodeError::UnexpectedPacket(other)),
        };

        if !body.is_empty() {
            return Err(DecodeError::MalformedData);
        }
        Ok(packet)
    }
}

impl ConnAck {
    fn read(buf: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        if !has_size(buf, 2) {
            return Err(DecodeError::MalformedData);
        }
        let ack_flags = read_u8(buf);
        let code = ConnectReturnCode::try_from(read_u8(buf))?;
        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
            code,
        })
    }
}

impl Publish {
    fn read(flags: u8, buf: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let topic = read_string(buf)?;

        let pkid = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => match read_pkid(buf)? {
                0 => return Err(DecodeError::MalformedData),
                pkid => Some(pkid),
            },
        };

        Ok(Self {
            topic,
            payload: buf.split_off(0),
            qos,
            retain: flags & 0x01 != 0,
            dup: flags & 0x08 != 0,
            pkid,
        })
    }
}

impl SubAck {
    fn read(buf: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let pkid = read_pkid(buf)?;
        let return_codes = buf
            .split_off(0)
            .iter()
            .map(|&code| SubscribeReasonCode::try_from(code))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { pkid, return_codes })
    }
}
