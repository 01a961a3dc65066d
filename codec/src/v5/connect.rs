// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use super::property::check_property_type_list;
use super::{Properties, PropertyType};
use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType, ProtocolLevel, PubTopic, QoS, StringData,
};

/// Properties available in the connect variable header.
pub const CONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumPacketSize,
    PropertyType::TopicAliasMaximum,
    PropertyType::RequestResponseInformation,
    PropertyType::RequestProblemInformation,
    PropertyType::UserProperty,
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
];

/// Properties available in the will section of the payload.
pub const WILL_PROPERTIES: &[PropertyType] = &[
    PropertyType::WillDelayInterval,
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::ContentType,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
];

const CONNECT_FLAG_USERNAME: u8 = 0b1000_0000;
const CONNECT_FLAG_PASSWORD: u8 = 0b0100_0000;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0b0010_0000;
const CONNECT_FLAG_WILL_QOS: u8 = 0b0001_1000;
const CONNECT_FLAG_WILL: u8 = 0b0000_0100;
const CONNECT_FLAG_CLEAN_START: u8 = 0b0000_0010;
const CONNECT_FLAG_RESERVED: u8 = 0b0000_0001;

/// `ConnectPacket` opens an MQTT 5.0 session.
///
/// Unlike earlier revisions the client id may be empty, in which case
/// the server assigns one and returns it in the connect
/// acknowledgement [MQTT-3.1.3-6]. Payload order: client id, will
/// properties, will topic, will payload, user name, password
/// [MQTT-3.1.3-1].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConnectPacket {
    keep_alive: u16,
    clean_start: bool,
    client_id: StringData,
    properties: Properties,
    will_topic: Option<PubTopic>,
    will_message: BinaryData,
    will_qos: QoS,
    will_retain: bool,
    will_properties: Properties,
    username: Option<StringData>,
    password: Option<BinaryData>,
}

impl ConnectPacket {
    /// Create a clean-start connect packet for `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is not a valid MQTT string.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        Ok(Self {
            keep_alive: 60,
            clean_start: true,
            client_id: StringData::from(client_id)?,
            ..Self::default()
        })
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Attach credentials. In this protocol revision a password may be
    /// sent without a user name [MQTT-3.1.2-22].
    ///
    /// # Errors
    ///
    /// Returns error if a field is too long.
    pub fn set_credentials(
        &mut self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<&mut Self, EncodeError> {
        self.username = match username {
            Some(name) => Some(StringData::from(name)?),
            None => None,
        };
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

    pub fn set_will_properties(&mut self, properties: Properties) -> &mut Self {
        self.will_properties = properties;
        self
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
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
        if self.clean_start {
            flags |= CONNECT_FLAG_CLEAN_START;
        }
        flags
    }

    fn remaining_length(&self) -> usize {
        // "MQTT" + level + flags + keep alive + properties.
        let mut len = 6 + 1 + 1 + 2 + self.properties.bytes();
        len += self.client_id.bytes();
        if let Some(topic) = &self.will_topic {
            len += self.will_properties.bytes() + topic.bytes() + self.will_message.bytes();
        }
        if let Some(username) = &self.username {
            len += username.bytes();
        }
        if let Some(password) = &self.password {
            len += password.bytes();
        }
        len
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let name = StringData::decode(ba)?;
        if name.as_ref() != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }
        let level = ProtocolLevel::decode(ba)?;
        if level != ProtocolLevel::V5 {
            return Err(DecodeError::InvalidProtocolLevel);
        }

        let flags = ba.read_byte()?;
        if flags & CONNECT_FLAG_RESERVED != 0 {
            return Err(DecodeError::InvalidConnectFlags);
        }
        let has_will = flags & CONNECT_FLAG_WILL != 0;
        let will_qos = QoS::try_from((flags & CONNECT_FLAG_WILL_QOS) >> 3)
            .map_err(|_| DecodeError::InvalidConnectFlags)?;
        let will_retain = flags & CONNECT_FLAG_WILL_RETAIN != 0;
        if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let keep_alive = ba.read_u16()?;
        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), CONNECT_PROPERTIES)
        {
            log::error!("v5/ConnectPacket: property {property_type:?} not allowed");
            return Err(DecodeError::InvalidPropertyType);
        }

        let client_id = StringData::decode(ba)?;
        let (will_properties, will_topic, will_message) = if has_will {
            let will_properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(will_properties.props(), WILL_PROPERTIES)
            {
                log::error!("v5/ConnectPacket: will property {property_type:?} not allowed");
                return Err(DecodeError::InvalidPropertyType);
            }
            let topic = PubTopic::decode(ba)?;
            let message = BinaryData::decode(ba)?;
            (will_properties, Some(topic), message)
        } else {
            (Properties::new(), None, BinaryData::default())
        };
        let username = if flags & CONNECT_FLAG_USERNAME != 0 {
            Some(StringData::decode(ba)?)
        } else {
            None
        };
        let password = if flags & CONNECT_FLAG_PASSWORD != 0 {
            Some(BinaryData::decode(ba)?)
        } else {
            None
        };

        Ok(Self {
            keep_alive,
            clean_start: flags & CONNECT_FLAG_CLEAN_START != 0,
            client_id,
            properties,
            will_topic,
            will_message,
            will_qos,
            will_retain,
            will_properties,
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

        StringData::from("MQTT")?.encode(buf)?;
        ProtocolLevel::V5.encode(buf)?;
        buf.push(self.connect_flags());
        buf.extend_from_slice(&self.keep_alive.to_be_bytes());
        self.properties.encode(buf)?;

        self.client_id.encode(buf)?;
        if let Some(topic) = &self.will_topic {
            self.will_properties.encode(buf)?;
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
    use crate::v5::Property;
    use crate::U32Data;

    #[test]
    fn test_encode_minimal() {
        let mut packet = ConnectPacket::new("c1").unwrap();
        packet.set_keep_alive(30);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            vec![
                0x10, 0x0f, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, // protocol
                0x02, // clean start
                0x00, 0x1e, // keep alive
                0x00, // empty properties
                0x00, 0x02, b'c', b'1',
            ]
        );
    }

    #[test]
    fn test_round_trip_with_session_expiry() {
        let mut packet = ConnectPacket::new("").unwrap();
        packet
            .properties_mut()
            .push(Property::SessionExpiryInterval(U32Data::new(1800)));
        packet
            .set_will("state/last", b"gone", QoS::AtLeastOnce, false)
            .unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(ConnectPacket::decode(&mut ba).unwrap(), packet);
    }
}
