// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType, ProtocolLevel, PubTopic, QoS, StringData,
};

/// `ConnectPacket` opens a session; it MUST be the first packet the
/// client sends after the network connection is established
/// [MQTT-3.1.0-1].
///
/// Variable header: protocol name, protocol level, connect flags,
/// keep alive. Payload order: client id, will topic, will message,
/// user name, password, each governed by the connect flags
/// [MQTT-3.1.3-1].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    protocol_level: ProtocolLevel,
    keep_alive: u16,
    clean_session: bool,
    client_id: StringData,
    will_topic: Option<PubTopic>,
    will_message: BinaryData,
    will_qos: QoS,
    will_retain: bool,
    username: Option<StringData>,
    password: Option<BinaryData>,
}

const CONNECT_FLAG_USERNAME: u8 = 0b1000_0000;
const CONNECT_FLAG_PASSWORD: u8 = 0b0100_0000;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0b0010_0000;
const CONNECT_FLAG_WILL_QOS: u8 = 0b0001_1000;
const CONNECT_FLAG_WILL: u8 = 0b0000_0100;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0b0000_0010;
const CONNECT_FLAG_RESERVED: u8 = 0b0000_0001;

fn protocol_name(level: ProtocolLevel) -> &'static str {
    match level {
        ProtocolLevel::V31 => "MQIsdp",
        ProtocolLevel::V311 | ProtocolLevel::V5 => "MQTT",
    }
}

impl ConnectPacket {
    /// Create a clean-session connect packet for `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is not a valid MQTT string.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        Ok(Self {
            protocol_level: ProtocolLevel::V311,
            keep_alive: 60,
            clean_session: true,
            client_id: StringData::from(client_id)?,
            will_topic: None,
            will_message: BinaryData::default(),
            will_qos: QoS::AtMostOnce,
            will_retain: false,
            username: None,
            password: None,
        })
    }

    pub fn set_protocol_level(&mut self, level: ProtocolLevel) -> &mut Self {
        self.protocol_level = level;
        self
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Attach credentials; a password without a user name is rejected by
    /// this protocol version [MQTT-3.1.2-22].
    ///
    /// # Errors
    ///
    /// Returns error if the user name is not a valid MQTT string or the
    /// password is longer than 65535 bytes.
    pub fn set_credentials(
        &mut self,
        username: &str,
        password: Option<&[u8]>,
    ) -> Result<&mut Self, EncodeError> {
        self.username = Some(StringData::from(username)?);
        self.password = match password {
            Some(bytes) => Some(BinaryData::from(bytes)?),
            None => None,
        };
        Ok(self)
    }

    /// Attach a will message.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name or the payload
    /// is too long.
    pub fn set_will(
        &mut self,
        topic: &str,
        message: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = BinaryData::from(message)?;
        self.will_qos = qos;
        self.will_retain = retain;
        Ok(self)
    }

    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0;
        if self.username.is_some() {
            flags |= CONNECT_FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= CONNECT_FLAG_PASSWORD;
        }
        if self.will_topic.is_some() {
            flags |= CONNECT_FLAG_WILL;
            flags |= (self.will_qos as u8) << 3;
            if self.will_retain {
                flags |= CONNECT_FLAG_WILL_RETAIN;
            }
        }
        if self.clean_session {
            flags |= CONNECT_FLAG_CLEAN_SESSION;
        }
        flags
    }

    fn payload_bytes(&self) -> usize {
        let mut bytes = self.client_id.bytes();
        if let Some(topic) = &self.will_topic {
            bytes += topic.bytes() + self.will_message.bytes();
        }
        if let Some(username) = &self.username {
            bytes += username.bytes();
        }
        if let Some(password) = &self.password {
            bytes += password.bytes();
        }
        bytes
    }

    pub(crate) fn remaining_length(&self) -> usize {
        // Protocol name + level byte + flags byte + keep alive.
        2 + protocol_name(self.protocol_level).len() + 1 + 1 + 2 + self.payload_bytes()
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let name = StringData::decode(ba)?;
        let protocol_level = ProtocolLevel::decode(ba)?;
        if name.as_ref() != protocol_name(protocol_level) {
            return Err(DecodeError::InvalidProtocolName);
        }

        let flags = ba.read_byte()?;
        if flags & CONNECT_FLAG_RESERVED != 0 {
            // The reserved flag MUST be zero [MQTT-3.1.2-3].
            return Err(DecodeError::InvalidConnectFlags);
        }
        let has_will = flags & CONNECT_FLAG_WILL != 0;
        let will_qos = QoS::try_from((flags & CONNECT_FLAG_WILL_QOS) >> 3)
            .map_err(|_| DecodeError::InvalidConnectFlags)?;
        let will_retain = flags & CONNECT_FLAG_WILL_RETAIN != 0;
        if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
            // Will QoS and Will Retain MUST be zero without a will
            // [MQTT-3.1.2-11].
            return Err(DecodeError::InvalidConnectFlags);
        }
        let has_username = flags & CONNECT_FLAG_USERNAME != 0;
        let has_password = flags & CONNECT_FLAG_PASSWORD != 0;
        if has_password && !has_username {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let keep_alive = ba.read_u16()?;
        let client_id = StringData::decode(ba)?;

        let (will_topic, will_message) = if has_will {
            let topic = PubTopic::decode(ba)?;
            let message = BinaryData::decode(ba)?;
            (Some(topic), message)
        } else {
            (None, BinaryData::default())
        };
        let username = if has_username {
            Some(StringData::decode(ba)?)
        } else {
            None
        };
        let password = if has_password {
            Some(BinaryData::decode(ba)?)
        } else {
            None
        };

        Ok(Self {
            protocol_level,
            keep_alive,
            clean_session: flags & CONNECT_FLAG_CLEAN_SESSION != 0,
            client_id,
            will_topic,
            will_message,
            will_qos,
            will_retain,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = FixedHeader::new(PacketType::Connect, self.remaining_length())?;
        fixed_header.encode(buf)?;

        StringData::from(protocol_name(self.protocol_level))?.encode(buf)?;
        self.protocol_level.encode(buf)?;
        buf.push(self.connect_flags());
        buf.extend_from_slice(&self.keep_alive.to_be_bytes());

        self.client_id.encode(buf)?;
        if let Some(topic) = &self.will_topic {
            topic.encode(buf)?;
            self.will_message.encode(buf)?;
        }
        if let Some(username) = &self.username {
            username.encode(buf)?;
        }
        if let Some(password) = &self.password {
            password.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_minimal() {
        let mut packet = ConnectPacket::new("test-A").unwrap();
        packet.set_keep_alive(0);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            vec![
                0x10, 0x12, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // protocol
                0x02, // clean session
                0x00, 0x00, // keep alive
                0x00, 0x06, b't', b'e', b's', b't', b'-', b'A',
            ]
        );
    }

    #[test]
    fn test_round_trip_with_will() {
        let mut packet = ConnectPacket::new("client-1").unwrap();
        packet
            .set_will("state/last", b"offline", QoS::AtLeastOnce, true)
            .unwrap();
        packet.set_credentials("user", Some(b"pass")).unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_reject_reserved_flag() {
        let buf = vec![
            0x10, 0x0c, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidConnectFlags)
        );
    }
}
