// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::v5::SubscribeOptions;
use codec::QoS;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One entry of the subscription registry.
///
/// `qos` is the granted QoS from the subscribe acknowledgement, not the
/// requested one. `options` carries the MQTT 5.0 subscription options;
/// it is absent on 3.1.1 sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub qos: QoS,
    pub options: Option<SubscribeOptions>,
}

/// Session state surviving a network connection, persisted through a
/// session store.
///
/// Subscriptions keep their insertion order so a restore replays them
/// deterministically.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    subscriptions: IndexMap<String, SubscriptionEntry>,
    pending_qos2: Vec<u16>,
    saved_at: u64,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.pending_qos2.is_empty()
    }

    /// Insert or replace the entry of `filter`.
    pub fn insert_subscription(&mut self, filter: &str, entry: SubscriptionEntry) {
        self.subscriptions.insert(filter.to_string(), entry);
    }

    /// Remove the entry of `filter`; order of the remaining entries is
    /// preserved.
    pub fn remove_subscription(&mut self, filter: &str) {
        self.subscriptions.shift_remove(filter);
    }

    #[must_use]
    pub const fn subscriptions(&self) -> &IndexMap<String, SubscriptionEntry> {
        &self.subscriptions
    }

    /// Record a QoS 2 publish that reached the release stage.
    pub fn add_pending_qos2(&mut self, packet_id: u16) {
        if !self.pending_qos2.contains(&packet_id) {
            self.pending_qos2.push(packet_id);
        }
    }

    pub fn remove_pending_qos2(&mut self, packet_id: u16) {
        self.pending_qos2.retain(|id| *id != packet_id);
    }

    #[must_use]
    pub fn pending_qos2(&self) -> &[u16] {
        &self.pending_qos2
    }

    /// Update the save stamp to the current unix second.
    pub fn touch(&mut self) {
        self.saved_at = unix_seconds_now();
    }

    #[must_use]
    pub const fn saved_at(&self) -> u64 {
        self.saved_at
    }
}

pub(crate) fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_order_preserved() {
        let mut state = SessionState::new();
        for filter in ["z/#", "a/#", "m/+"] {
            state.insert_subscription(
                filter,
                SubscriptionEntry {
                    qos: QoS::AtLeastOnce,
                    options: None,
                },
            );
        }
        let filters: Vec<&str> = state.subscriptions().keys().map(String::as_str).collect();
        assert_eq!(filters, vec!["z/#", "a/#", "m/+"]);

        state.remove_subscription("a/#");
        let filters: Vec<&str> = state.subscriptions().keys().map(String::as_str).collect();
        assert_eq!(filters, vec!["z/#", "m/+"]);
    }

    #[test]
    fn test_pending_qos2_deduplicates() {
        let mut state = SessionState::new();
        state.add_pending_qos2(42);
        state.add_pending_qos2(42);
        state.add_pending_qos2(7);
        assert_eq!(state.pending_qos2(), &[42, 7]);
        state.remove_pending_qos2(42);
        assert_eq!(state.pending_qos2(), &[7]);
    }

    #[test]
    fn test_touch_sets_stamp() {
        let mut state = SessionState::new();
        assert_eq!(state.saved_at(), 0);
        state.touch();
        assert!(state.saved_at() > 0);
    }

    #[test]
    fn test_document_shape() {
        use codec::v5::RetainHandling;

        let mut state = SessionState::new();
        let mut options = SubscribeOptions::new(QoS::AtLeastOnce);
        options.set_retain_handling(RetainHandling::DoNotSend);
        state.insert_subscription(
            "sensors/#",
            SubscriptionEntry {
                qos: QoS::AtLeastOnce,
                options: Some(options),
            },
        );
        state.insert_subscription(
            "alerts/+",
            SubscriptionEntry {
                qos: QoS::ExactOnce,
                options: None,
            },
        );
        state.add_pending_qos2(42);
        state.touch();

        // The persisted document carries numeric QoS levels and option
        // values, never variant names.
        let doc = serde_json::to_value(&state).unwrap();
        let entry = &doc["subscriptions"]["sensors/#"];
        assert_eq!(entry["qos"], 1);
        assert_eq!(entry["options"]["qos"], 1);
        assert_eq!(entry["options"]["no_local"], false);
        assert_eq!(entry["options"]["retain_handling"], 2);
        assert_eq!(doc["subscriptions"]["alerts/+"]["qos"], 2);
        assert_eq!(
            doc["subscriptions"]["alerts/+"]["options"],
            serde_json::Value::Null
        );
        assert_eq!(doc["pending_qos2"], serde_json::json!([42]));
        assert!(doc["saved_at"].as_u64().unwrap() > 0);

        let restored: SessionState = serde_json::from_value(doc).unwrap();
        assert_eq!(restored, state);
    }
}
