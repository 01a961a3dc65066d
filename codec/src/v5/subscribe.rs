// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use super::property::check_property_type_list;
use super::{Properties, PropertyType};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, QoS, SubTopic,
};

/// Properties available in subscribe packets.
pub const SUBSCRIBE_PROPERTIES: &[PropertyType] = &[
    PropertyType::SubscriptionIdentifier,
    PropertyType::UserProperty,
];

/// Retain handling option of a subscription [MQTT-3.8.3.1].
///
/// Serializes as its numeric value, matching the two option bits it
/// occupies on the wire.
#[repr(u8)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum RetainHandling {
    /// Send retained messages at the time of the subscribe.
    #[default]
    SendAtSubscribe = 0,

    /// Send retained messages only if the subscription does not
    /// currently exist.
    SendIfNotSubscribed = 1,

    /// Do not send retained messages.
    DoNotSend = 2,
}

impl From<RetainHandling> for u8 {
    fn from(retain_handling: RetainHandling) -> Self {
        retain_handling as Self
    }
}

impl TryFrom<u8> for RetainHandling {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::SendAtSubscribe),
            1 => Ok(Self::SendIfNotSubscribed),
            2 => Ok(Self::DoNotSend),
            _ => Err(DecodeError::InvalidPacketFlags),
        }
    }
}

/// Subscription options byte: maximum QoS in bits 0-1, no-local in
/// bit 2, retain-as-published in bit 3, retain handling in bits 4-5.
/// Bits 6 and 7 are reserved [MQTT-3.8.3.1].
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct SubscribeOptions {
    qos: QoS,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    pub fn set_no_local(&mut self, no_local: bool) -> &mut Self {
        self.no_local = no_local;
        self
    }

    #[must_use]
    pub const fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn set_retain_as_published(&mut self, retain_as_published: bool) -> &mut Self {
        self.retain_as_published = retain_as_published;
        self
    }

    #[must_use]
    pub const fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    pub fn set_retain_handling(&mut self, retain_handling: RetainHandling) -> &mut Self {
        self.retain_handling = retain_handling;
        self
    }

    #[must_use]
    pub const fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    #[must_use]
    pub const fn byte(&self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for SubscribeOptions {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        if v & 0b1100_0000 != 0 {
            // Reserved bits must be zero [MQTT-3.8.3-5].
            return Err(DecodeError::InvalidPacketFlags);
        }
        let qos = QoS::try_from(v & 0b0000_0011)?;
        let no_local = v & 0b0000_0100 != 0;
        let retain_as_published = v & 0b0000_1000 != 0;
        let retain_handling = RetainHandling::try_from((v & 0b0011_0000) >> 4)?;
        Ok(Self {
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }
}

/// One topic filter entry in the subscribe payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeTopic {
    topic: SubTopic,
    options: SubscribeOptions,
}

impl SubscribeTopic {
    /// Create a filter entry.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic filter.
    pub fn new(topic: &str, options: SubscribeOptions) -> Result<Self, EncodeError> {
        Ok(Self {
            topic: SubTopic::new(topic)?,
            options,
        })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub const fn options(&self) -> SubscribeOptions {
        self.options
    }

    fn bytes(&self) -> usize {
        self.topic.bytes() + SubscribeOptions::bytes()
    }
}

/// `SubscribePacket` registers one or more topic filters, each with its
/// subscription options.
///
/// The payload MUST contain at least one filter/options pair
/// [MQTT-3.8.3-2].
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribePacket {
    packet_id: PacketId,
    properties: Properties,
    topics: Vec<SubscribeTopic>,
}

impl SubscribePacket {
    /// Create a subscribe packet with a single filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic filter.
    pub fn new(topic: &str, qos: QoS, packet_id: PacketId) -> Result<Self, EncodeError> {
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics: vec![SubscribeTopic::new(topic, SubscribeOptions::new(qos))?],
        })
    }

    #[must_use]
    pub fn with_topics(packet_id: PacketId, topics: Vec<SubscribeTopic>) -> Self {
        Self {
            packet_id,
            properties: Properties::new(),
            topics,
        }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let body_start = ba.offset();
        let packet_id = PacketId::decode(ba)?;
        if packet_id.value() == 0 {
            return Err(DecodeError::InvalidPacketId);
        }
        let properties = Properties::decode(ba)?;
        if let Err(property_type) =
            check_property_type_list(properties.props(), SUBSCRIBE_PROPERTIES)
        {
            log::error!("v5/SubscribePacket: property {property_type:?} not allowed");
            return Err(DecodeError::InvalidPropertyType);
        }

        let mut topics = Vec::new();
        while ba.offset() - body_start < fixed_header.remaining_length() {
            let topic = SubTopic::decode(ba)?;
            let options = SubscribeOptions::try_from(ba.read_byte()?)?;
            topics.push(SubscribeTopic { topic, options });
        }
        if topics.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        Ok(Self {
            packet_id,
            properties,
            topics,
        })
    }
}

impl EncodePacket for SubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let remaining_length = PacketId::bytes()
            + self.properties.bytes()
            + self
                .topics
                .iter()
                .map(SubscribeTopic::bytes)
                .sum::<usize>();
        let fixed_header = FixedHeader::new(PacketType::Subscribe, remaining_length)?;
        fixed_header.encode(buf)?;

        self.packet_id.encode(buf)?;
        self.properties.encode(buf)?;
        for entry in &self.topics {
            entry.topic.encode(buf)?;
            buf.push(entry.options.byte());
        }

        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_byte() {
        let mut options = SubscribeOptions::new(QoS::AtLeastOnce);
        options.set_no_local(true);
        options.set_retain_handling(RetainHandling::DoNotSend);
        assert_eq!(options.byte(), 0b0010_0101);
        assert_eq!(SubscribeOptions::try_from(0b0010_0101).unwrap(), options);
    }

    #[test]
    fn test_reject_reserved_option_bits() {
        assert!(SubscribeOptions::try_from(0b0100_0000).is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut options = SubscribeOptions::new(QoS::ExactOnce);
        options.set_retain_as_published(true);
        let topics = vec![SubscribeTopic::new("sensors/#", options).unwrap()];
        let packet = SubscribePacket::with_topics(PacketId::new(5), topics);

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribePacket::decode(&mut ba).unwrap(), packet);
    }
}
