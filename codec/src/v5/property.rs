// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    BinaryData, BoolData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    PubTopic, QoS, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Property identifiers defined by MQTT 5.0, chapter 2.2.2.2.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// Properties that may legally appear more than once in one packet.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
];

/// Check that every property in `properties` is listed in `types` and
/// that single-valued properties appear at most once.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        if MULTIPLE_PROPERTIES.contains(property_type) {
            continue;
        }
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 {
            return Err(*property_type);
        }
    }

    Ok(())
}

/// One (identifier, value) pair of the property section.
///
/// The variant payloads follow the value types of the MQTT 5.0 property
/// table: byte, two/four byte integer, var-int, UTF-8 string, string
/// pair or binary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Byte. PUBLISH, Will Properties.
    PayloadFormatIndicator(BoolData),

    /// Four Byte Integer. PUBLISH, Will Properties.
    MessageExpiryInterval(U32Data),

    /// UTF-8 String. PUBLISH, Will Properties.
    ContentType(StringData),

    /// UTF-8 String. PUBLISH, Will Properties.
    ResponseTopic(PubTopic),

    /// Binary Data. PUBLISH, Will Properties.
    CorrelationData(BinaryData),

    /// Variable Byte Integer, non-zero. SUBSCRIBE, PUBLISH.
    SubscriptionIdentifier(VarInt),

    /// Four Byte Integer. CONNECT, CONNACK, DISCONNECT.
    SessionExpiryInterval(U32Data),

    /// UTF-8 String. CONNACK.
    AssignedClientIdentifier(StringData),

    /// Two Byte Integer. CONNACK.
    ServerKeepAlive(U16Data),

    /// UTF-8 String. CONNECT, CONNACK, AUTH.
    AuthenticationMethod(StringData),

    /// Binary Data. CONNECT, CONNACK, AUTH.
    AuthenticationData(BinaryData),

    /// Byte, 0 or 1. CONNECT.
    RequestProblemInformation(BoolData),

    /// Four Byte Integer. Will Properties.
    WillDelayInterval(U32Data),

    /// Byte, 0 or 1. CONNECT.
    RequestResponseInformation(BoolData),

    /// UTF-8 String. CONNACK.
    ResponseInformation(StringData),

    /// UTF-8 String. CONNACK, DISCONNECT.
    ServerReference(StringData),

    /// UTF-8 String. All acknowledgement packets.
    ReasonString(StringData),

    /// Two Byte Integer, non-zero. CONNECT, CONNACK.
    ReceiveMaximum(U16Data),

    /// Two Byte Integer. CONNECT, CONNACK.
    TopicAliasMaximum(U16Data),

    /// Two Byte Integer. PUBLISH.
    TopicAlias(U16Data),

    /// Byte, 0 or 1. CONNACK.
    MaximumQoS(QoS),

    /// Byte, 0 or 1. CONNACK.
    RetainAvailable(BoolData),

    /// UTF-8 String Pair. All packets; may repeat, order preserved.
    UserProperty(StringPairData),

    /// Four Byte Integer. CONNECT, CONNACK.
    MaximumPacketSize(U32Data),

    /// Byte, 0 or 1. CONNACK.
    WildcardSubscriptionAvailable(BoolData),

    /// Byte, 0 or 1. CONNACK.
    SubscriptionIdentifierAvailable(BoolData),

    /// Byte, 0 or 1. CONNACK.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    /// Get identifier of this property.
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length used in packet, identifier byte included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let value_bytes = match self {
            Self::PayloadFormatIndicator(..)
            | Self::RequestProblemInformation(..)
            | Self::RequestResponseInformation(..)
            | Self::RetainAvailable(..)
            | Self::WildcardSubscriptionAvailable(..)
            | Self::SubscriptionIdentifierAvailable(..)
            | Self::SharedSubscriptionAvailable(..) => BoolData::bytes(),
            Self::MaximumQoS(..) => QoS::bytes(),
            Self::ServerKeepAlive(..)
            | Self::ReceiveMaximum(..)
            | Self::TopicAliasMaximum(..)
            | Self::TopicAlias(..) => U16Data::bytes(),
            Self::MessageExpiryInterval(..)
            | Self::SessionExpiryInterval(..)
            | Self::WillDelayInterval(..)
            | Self::MaximumPacketSize(..) => U32Data::bytes(),
            Self::SubscriptionIdentifier(id) => id.bytes(),
            Self::ContentType(value)
            | Self::AssignedClientIdentifier(value)
            | Self::AuthenticationMethod(value)
            | Self::ResponseInformation(value)
            | Self::ServerReference(value)
            | Self::ReasonString(value) => value.bytes(),
            Self::ResponseTopic(topic) => topic.bytes(),
            Self::CorrelationData(data) | Self::AuthenticationData(data) => data.bytes(),
            Self::UserProperty(pair) => pair.bytes(),
        };
        PropertyType::bytes() + value_bytes
    }
}

impl DecodePacket for Property {
    #[allow(clippy::too_many_lines)]
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_type = PropertyType::try_from(ba.read_byte()?)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                BoolData::decode(ba).map(Self::PayloadFormatIndicator)
            }
            PropertyType::MessageExpiryInterval => {
                U32Data::decode(ba).map(Self::MessageExpiryInterval)
            }
            PropertyType::ContentType => StringData::decode(ba).map(Self::ContentType),
            PropertyType::ResponseTopic => PubTopic::decode(ba).map(Self::ResponseTopic),
            PropertyType::CorrelationData => BinaryData::decode(ba).map(Self::CorrelationData),
            PropertyType::SubscriptionIdentifier => {
                let id = VarInt::decode(ba)?;
                // It is a Protocol Error if the Subscription Identifier
                // has a value of 0 [MQTT-3.8.2.1.2].
                if id.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::SubscriptionIdentifier(id))
            }
            PropertyType::SessionExpiryInterval => {
                U32Data::decode(ba).map(Self::SessionExpiryInterval)
            }
            PropertyType::AssignedClientIdentifier => {
                StringData::decode(ba).map(Self::AssignedClientIdentifier)
            }
            PropertyType::ServerKeepAlive => U16Data::decode(ba).map(Self::ServerKeepAlive),
            PropertyType::AuthenticationMethod => {
                StringData::decode(ba).map(Self::AuthenticationMethod)
            }
            PropertyType::AuthenticationData => {
                BinaryData::decode(ba).map(Self::AuthenticationData)
            }
            PropertyType::RequestProblemInformation => {
                BoolData::decode(ba).map(Self::RequestProblemInformation)
            }
            PropertyType::WillDelayInterval => U32Data::decode(ba).map(Self::WillDelayInterval),
            PropertyType::RequestResponseInformation => {
                BoolData::decode(ba).map(Self::RequestResponseInformation)
            }
            PropertyType::ResponseInformation => {
                StringData::decode(ba).map(Self::ResponseInformation)
            }
            PropertyType::ServerReference => StringData::decode(ba).map(Self::ServerReference),
            PropertyType::ReasonString => StringData::decode(ba).map(Self::ReasonString),
            PropertyType::ReceiveMaximum => {
                let max = U16Data::decode(ba)?;
                // It is a Protocol Error to include the value 0
                // [MQTT-3.1.2.11.3].
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::ReceiveMaximum(max))
            }
            PropertyType::TopicAliasMaximum => U16Data::decode(ba).map(Self::TopicAliasMaximum),
            PropertyType::TopicAlias => U16Data::decode(ba).map(Self::TopicAlias),
            PropertyType::MaximumQoS => {
                let qos = QoS::decode(ba)?;
                if qos == QoS::ExactOnce {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumQoS(qos))
            }
            PropertyType::RetainAvailable => BoolData::decode(ba).map(Self::RetainAvailable),
            PropertyType::UserProperty => StringPairData::decode(ba).map(Self::UserProperty),
            PropertyType::MaximumPacketSize => {
                let max = U32Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumPacketSize(max))
            }
            PropertyType::WildcardSubscriptionAvailable => {
                BoolData::decode(ba).map(Self::WildcardSubscriptionAvailable)
            }
            PropertyType::SubscriptionIdentifierAvailable => {
                BoolData::decode(ba).map(Self::SubscriptionIdentifierAvailable)
            }
            PropertyType::SharedSubscriptionAvailable => {
                BoolData::decode(ba).map(Self::SharedSubscriptionAvailable)
            }
        }
    }
}

impl EncodePacket for Property {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::PayloadFormatIndicator(value)
            | Self::RequestProblemInformation(value)
            | Self::RequestResponseInformation(value)
            | Self::RetainAvailable(value)
            | Self::WildcardSubscriptionAvailable(value)
            | Self::SubscriptionIdentifierAvailable(value)
            | Self::SharedSubscriptionAvailable(value) => value.encode(buf)?,
            Self::MaximumQoS(qos) => qos.encode(buf)?,
            Self::ServerKeepAlive(value)
            | Self::ReceiveMaximum(value)
            | Self::TopicAliasMaximum(value)
            | Self::TopicAlias(value) => value.encode(buf)?,
            Self::MessageExpiryInterval(value)
            | Self::SessionExpiryInterval(value)
            | Self::WillDelayInterval(value)
            | Self::MaximumPacketSize(value) => value.encode(buf)?,
            Self::SubscriptionIdentifier(id) => id.encode(buf)?,
            Self::ContentType(value)
            | Self::AssignedClientIdentifier(value)
            | Self::AuthenticationMethod(value)
            | Self::ResponseInformation(value)
            | Self::ServerReference(value)
            | Self::ReasonString(value) => value.encode(buf)?,
            Self::ResponseTopic(topic) => topic.encode(buf)?,
            Self::CorrelationData(data) | Self::AuthenticationData(data) => data.encode(buf)?,
            Self::UserProperty(pair) => pair.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// Property section of a packet: a var-int byte count followed by the
/// (identifier, value) pairs.
///
/// User properties keep their order of insertion; duplicate keys are
/// permitted and preserved [MQTT-3.3.2-18].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    /// Create an empty property list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Get byte length in packet, the length prefix included.
    ///
    /// # Panics
    ///
    /// Never in practice: the section length is bounded by the packet
    /// length already checked at construction.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let section = self.section_bytes();
        VarInt::from(section).unwrap().bytes() + section
    }

    fn section_bytes(&self) -> usize {
        self.0.iter().map(Property::bytes).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a reference to the property list.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.0
    }

    /// Append a property.
    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    /// Remove every property of `property_type`.
    pub fn remove(&mut self, property_type: PropertyType) {
        self.0.retain(|p| p.property_type() != property_type);
    }

    /// Find the first property of `property_type`.
    #[must_use]
    pub fn find(&self, property_type: PropertyType) -> Option<&Property> {
        self.0.iter().find(|p| p.property_type() == property_type)
    }

    /// Get all user properties in packet order.
    #[must_use]
    pub fn user_properties(&self) -> Vec<(&str, &str)> {
        self.0
            .iter()
            .filter_map(|p| match p {
                Property::UserProperty(pair) => Some((pair.key(), pair.value())),
                _ => None,
            })
            .collect()
    }

    /// Get the topic alias value, if present.
    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        match self.find(PropertyType::TopicAlias) {
            Some(Property::TopicAlias(alias)) => Some(alias.value()),
            _ => None,
        }
    }

    /// Get the receive maximum value, if present.
    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        match self.find(PropertyType::ReceiveMaximum) {
            Some(Property::ReceiveMaximum(max)) => Some(max.value()),
            _ => None,
        }
    }

    /// Get the topic alias maximum value, if present.
    #[must_use]
    pub fn topic_alias_maximum(&self) -> Option<u16> {
        match self.find(PropertyType::TopicAliasMaximum) {
            Some(Property::TopicAliasMaximum(max)) => Some(max.value()),
            _ => None,
        }
    }

    /// Get the server keep alive value, if present.
    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        match self.find(PropertyType::ServerKeepAlive) {
            Some(Property::ServerKeepAlive(keep_alive)) => Some(keep_alive.value()),
            _ => None,
        }
    }

    /// Get the assigned client identifier, if present.
    #[must_use]
    pub fn assigned_client_identifier(&self) -> Option<&str> {
        match self.find(PropertyType::AssignedClientIdentifier) {
            Some(Property::AssignedClientIdentifier(id)) => Some(id.as_ref()),
            _ => None,
        }
    }

    /// Get the session expiry interval, if present.
    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        match self.find(PropertyType::SessionExpiryInterval) {
            Some(Property::SessionExpiryInterval(interval)) => Some(interval.value()),
            _ => None,
        }
    }

    /// Get the maximum packet size, if present.
    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        match self.find(PropertyType::MaximumPacketSize) {
            Some(Property::MaximumPacketSize(max)) => Some(max.value()),
            _ => None,
        }
    }
}

impl AsRef<[Property]> for Properties {
    fn as_ref(&self) -> &[Property] {
        &self.0
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let section_len = VarInt::decode(ba)?.value();
        let end_offset = ba.offset() + section_len;
        let mut properties = Vec::new();
        while ba.offset() < end_offset {
            properties.push(Property::decode(ba)?);
        }
        if ba.offset() != end_offset {
            // A property ran past the advertised section length.
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self(properties))
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let section = self.section_bytes();
        let len = VarInt::from(section)?;
        len.encode(buf)?;
        for property in &self.0 {
            property.encode(buf)?;
        }
        Ok(len.bytes() + section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_length_counts_bytes() {
        let mut properties = Properties::new();
        properties.push(Property::ReceiveMaximum(U16Data::new(20)));
        properties.push(Property::TopicAliasMaximum(U16Data::new(5)));
        // Two (id + u16) pairs: 6 bytes plus one length byte.
        assert_eq!(properties.bytes(), 7);

        let mut buf = Vec::new();
        properties.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x06, 0x21, 0x00, 0x14, 0x22, 0x00, 0x05]);
    }

    #[test]
    fn test_round_trip() {
        let mut properties = Properties::new();
        properties.push(Property::SessionExpiryInterval(U32Data::new(300)));
        properties.push(Property::UserProperty(
            StringPairData::from("origin", "unit").unwrap(),
        ));
        properties.push(Property::UserProperty(
            StringPairData::from("origin", "dup-key").unwrap(),
        ));

        let mut buf = Vec::new();
        properties.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(
            decoded.user_properties(),
            vec![("origin", "unit"), ("origin", "dup-key")]
        );
    }

    #[test]
    fn test_reject_zero_receive_maximum() {
        let buf = [0x03, 0x21, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyValue)
        );
    }

    #[test]
    fn test_check_property_type_list() {
        let mut properties = Properties::new();
        properties.push(Property::TopicAlias(U16Data::new(1)));
        assert!(check_property_type_list(
            properties.props(),
            &[PropertyType::TopicAlias]
        )
        .is_ok());
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::ReasonString]),
            Err(PropertyType::TopicAlias)
        );
    }
}
