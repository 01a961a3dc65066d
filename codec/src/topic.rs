// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::io::Write;

use crate::utils::validate_utf8_string;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Violations of the topic rules in MQTT chapter 4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic string has no chars.
    EmptyTopic,

    /// Topic string is longer than 65535 bytes.
    TooManyData,

    /// Wildcard char is embedded in a level instead of filling it.
    InvalidWildcard,

    /// Topic name contains `+` or `#`.
    ContainsWildcard,

    /// Topic string is not a valid MQTT string.
    InvalidString,

    /// `$share` filter misses the group or the inner filter.
    InvalidShare,
}

/// Check a topic name used in a publish packet.
///
/// The Topic Name in a PUBLISH packet MUST NOT contain wildcard
/// characters [MQTT-3.3.2-2].
///
/// # Errors
///
/// Returns error if `topic` is empty, too long or contains wildcards.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    validate_utf8_string(topic).map_err(|_| TopicError::InvalidString)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::ContainsWildcard);
    }
    Ok(())
}

/// Check a topic filter used in subscribe and unsubscribe packets.
///
/// `+` must fill a whole level, and `#` must fill the last level
/// [MQTT-4.7.1-2], [MQTT-4.7.1-3].
///
/// # Errors
///
/// Returns error if `filter` violates the wildcard placement rules.
pub fn validate_sub_topic(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if filter.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    validate_utf8_string(filter).map_err(|_| TopicError::InvalidString)?;

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "+" => (),
            "#" => {
                if index != levels.len() - 1 {
                    return Err(TopicError::InvalidWildcard);
                }
            }
            _ => {
                if level.contains(['+', '#']) {
                    return Err(TopicError::InvalidWildcard);
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum FilterLevel {
    /// Literal level, possibly empty.
    Literal(String),

    /// `+`, matches exactly one level.
    Single,

    /// `#`, matches the remainder of the topic.
    Multi,
}

impl FilterLevel {
    fn parse(s: &str) -> Self {
        match s {
            "+" => Self::Single,
            "#" => Self::Multi,
            _ => Self::Literal(s.to_string()),
        }
    }
}

/// Parsed topic filter with wildcard matching.
///
/// A `$share/<group>/<filter>` shared subscription is accepted; the
/// share prefix identifies the group and matching is performed against
/// the inner filter [MQTT-4.8.2].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicFilter {
    filter: String,
    share_group: Option<String>,
    levels: Vec<FilterLevel>,
}

impl TopicFilter {
    /// Parse a filter string.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` violates MQTT chapter 4.7 or has a
    /// malformed `$share` prefix.
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        let (share_group, inner) = match filter.strip_prefix("$share/") {
            Some(rest) => {
                let (group, inner) = rest.split_once('/').ok_or(TopicError::InvalidShare)?;
                if group.is_empty() || group.contains(['+', '#']) {
                    return Err(TopicError::InvalidShare);
                }
                (Some(group.to_string()), inner)
            }
            None => (None, filter),
        };
        validate_sub_topic(inner)?;

        let levels = inner.split('/').map(FilterLevel::parse).collect();
        Ok(Self {
            filter: filter.to_string(),
            share_group,
            levels,
        })
    }

    /// Get the complete filter string, share prefix included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.filter
    }

    /// Get the share group of a `$share` filter.
    #[must_use]
    pub fn share_group(&self) -> Option<&str> {
        self.share_group.as_deref()
    }

    /// Check whether `topic` matches this filter.
    ///
    /// Filters starting with a wildcard do not match topics beginning
    /// with `$` [MQTT-4.7.2-1].
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        if topic.starts_with('$')
            && matches!(self.levels[0], FilterLevel::Single | FilterLevel::Multi)
        {
            return false;
        }

        // `#` matches the parent level as well, so `sport/#` covers
        // both `sport` and `sport/tennis`.
        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                FilterLevel::Multi => return true,
                FilterLevel::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                FilterLevel::Literal(literal) => match topic_levels.next() {
                    Some(part) if part == literal => (),
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.filter)
    }
}

/// Topic name carried in a publish packet, wildcard free.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Wrap a validated topic name.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet, including the length prefix.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(usize::from(len))?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter string carried in subscribe and unsubscribe packets.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubTopic(String);

impl SubTopic {
    /// Wrap a validated topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn new(filter: &str) -> Result<Self, TopicError> {
        // Parsing also validates a possible $share prefix.
        TopicFilter::parse(filter)?;
        Ok(Self(filter.to_string()))
    }

    /// Get byte length in packet, including the length prefix.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(usize::from(len))?;
        TopicFilter::parse(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("sport/tennis/player1").is_ok());
        assert_eq!(validate_pub_topic(""), Err(TopicError::EmptyTopic));
        assert_eq!(
            validate_pub_topic("sport/+"),
            Err(TopicError::ContainsWildcard)
        );
    }

    #[test]
    fn test_validate_sub_topic() {
        assert!(validate_sub_topic("sport/tennis/player1/#").is_ok());
        assert!(validate_sub_topic("#").is_ok());
        assert!(validate_sub_topic("+").is_ok());
        assert!(validate_sub_topic("+/tennis/#").is_ok());
        assert_eq!(
            validate_sub_topic("sport/tennis#"),
            Err(TopicError::InvalidWildcard)
        );
        assert_eq!(
            validate_sub_topic("sport/#/ranking"),
            Err(TopicError::InvalidWildcard)
        );
        assert_eq!(validate_sub_topic("sport+"), Err(TopicError::InvalidWildcard));
    }

    #[test]
    fn test_filter_match() {
        let filter = TopicFilter::parse("sport/tennis/+").unwrap();
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(!filter.is_match("sport/tennis/player1/ranking"));

        let filter = TopicFilter::parse("sport/#").unwrap();
        assert!(filter.is_match("sport"));
        assert!(filter.is_match("sport/tennis/player1"));

        let filter = TopicFilter::parse("sensors/#").unwrap();
        assert!(filter.is_match("sensors/t"));
        assert!(!filter.is_match("actuators/t"));
    }

    #[test]
    fn test_filter_does_not_match_sys_topics() {
        let filter = TopicFilter::parse("#").unwrap();
        assert!(!filter.is_match("$SYS/uptime"));
        assert!(filter.is_match("uptime"));

        let filter = TopicFilter::parse("+/monitor").unwrap();
        assert!(!filter.is_match("$SYS/monitor"));
    }

    #[test]
    fn test_shared_subscription() {
        let filter = TopicFilter::parse("$share/group-a/sensors/+").unwrap();
        assert_eq!(filter.share_group(), Some("group-a"));
        assert!(filter.is_match("sensors/t"));

        assert_eq!(
            TopicFilter::parse("$share/g"),
            Err(TopicError::InvalidShare)
        );
        assert_eq!(
            TopicFilter::parse("$share//sensors"),
            Err(TopicError::InvalidShare)
        );
    }

    #[test]
    fn test_empty_levels() {
        let filter = TopicFilter::parse("finance//closings").unwrap();
        assert!(filter.is_match("finance//closings"));
        assert!(!filter.is_match("finance/closings"));
    }
}
