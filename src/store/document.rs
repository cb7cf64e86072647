//! Coordination document schema
//!
//! One document per (consumer group, stream) pair holds everything the
//! protocol shares: the consumer roster, the shard map, and the per-slot
//! version tokens that make every contended write a compare-and-set.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fresh opaque version token for a document slot
pub fn fresh_version() -> String {
    Uuid::new_v4().to_string()
}

/// RFC 3339 rendering used for every timestamp attribute
pub fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    pub consumer_group: String,
    pub stream_name: String,
    /// Creation timestamp of the upstream stream. A mismatch on startup
    /// means the stream was recreated under the same name and the whole
    /// document is stale.
    pub stream_created_on: String,
    #[serde(default)]
    pub consumers: BTreeMap<String, ConsumerRecord>,
    #[serde(default)]
    pub shards: BTreeMap<String, ShardRecord>,
    /// Guards top-level conditional updates
    pub version: String,
}

impl StreamState {
    pub fn new(
        consumer_group: impl Into<String>,
        stream_name: impl Into<String>,
        stream_created_on: impl Into<String>,
    ) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            stream_name: stream_name.into(),
            stream_created_on: stream_created_on.into(),
            consumers: BTreeMap::new(),
            shards: BTreeMap::new(),
            version: fresh_version(),
        }
    }

    /// Consumers whose heartbeat is recent enough to count as live
    pub fn active_consumer_ids(&self, failure_timeout: ChronoDuration, now: DateTime<Utc>) -> Vec<&str> {
        self.consumers
            .iter()
            .filter(|(_, c)| !c.heartbeat_stale(failure_timeout, now))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Consumers whose heartbeat age exceeds the failure timeout
    pub fn stale_consumer_ids(&self, failure_timeout: ChronoDuration, now: DateTime<Utc>) -> Vec<&str> {
        self.consumers
            .iter()
            .filter(|(_, c)| c.heartbeat_stale(failure_timeout, now))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRecord {
    pub app_name: String,
    pub host: String,
    pub pid: u32,
    pub started_on: String,
    pub heartbeat: String,
    pub is_active: bool,
    pub is_standalone: bool,
    /// Standalone mode keeps lease and checkpoint state private to each
    /// consumer in this sub-map; shard lineage stays in the global map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<BTreeMap<String, ShardRecord>>,
}

impl ConsumerRecord {
    pub fn heartbeat_stale(&self, failure_timeout: ChronoDuration, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.heartbeat) {
            Ok(hb) => now.signed_duration_since(hb.with_timezone(&Utc)) > failure_timeout,
            // An unparseable heartbeat is as good as a missing one
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardRecord {
    pub parent: Option<String>,
    pub checkpoint: Option<String>,
    pub depleted: bool,
    pub lease_owner: Option<String>,
    pub lease_expiration: Option<String>,
    /// Optimistic-concurrency token for this slot; changes on every
    /// successful mutation
    pub version: String,
}

impl ShardRecord {
    pub fn new(parent: Option<String>) -> Self {
        Self {
            parent,
            checkpoint: None,
            depleted: false,
            lease_owner: None,
            lease_expiration: None,
            version: fresh_version(),
        }
    }

    pub fn lease_expiration_ts(&self) -> Option<DateTime<Utc>> {
        self.lease_expiration
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// A lease with no expiration on record counts as expired: it can only
    /// be the residue of a half-finished write.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expiration_ts() {
            Some(expiration) => now > expiration,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_json() {
        let mut state = StreamState::new("group", "stream", "2026-01-01T00:00:00+00:00");
        state.shards.insert(
            "shard-1".to_string(),
            ShardRecord {
                parent: None,
                checkpoint: Some("495903".to_string()),
                depleted: false,
                lease_owner: Some("c-1".to_string()),
                lease_expiration: Some(timestamp(Utc::now())),
                version: fresh_version(),
            },
        );

        let value = serde_json::to_value(&state).unwrap();
        // Attribute names are the document's camelCase schema
        assert!(value.get("streamCreatedOn").is_some());
        assert!(value["shards"]["shard-1"].get("leaseOwner").is_some());

        let back: StreamState = serde_json::from_value(value).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_heartbeat_staleness() {
        let now = Utc::now();
        let record = ConsumerRecord {
            app_name: "app".into(),
            host: "host".into(),
            pid: 1,
            started_on: timestamp(now),
            heartbeat: timestamp(now - ChronoDuration::seconds(90)),
            is_active: true,
            is_standalone: false,
            shards: None,
        };

        assert!(record.heartbeat_stale(ChronoDuration::seconds(60), now));
        assert!(!record.heartbeat_stale(ChronoDuration::seconds(120), now));

        let broken = ConsumerRecord {
            heartbeat: "not-a-timestamp".into(),
            ..record
        };
        assert!(broken.heartbeat_stale(ChronoDuration::seconds(60), now));
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let mut record = ShardRecord::new(None);
        assert!(record.lease_expired(now));

        record.lease_expiration = Some(timestamp(now + ChronoDuration::seconds(30)));
        assert!(!record.lease_expired(now));

        record.lease_expiration = Some(timestamp(now - ChronoDuration::seconds(1)));
        assert!(record.lease_expired(now));
    }

    #[test]
    fn test_consumer_liveness_partition() {
        let now = Utc::now();
        let mut state = StreamState::new("group", "stream", timestamp(now));
        let live = ConsumerRecord {
            app_name: "app".into(),
            host: "host".into(),
            pid: 1,
            started_on: timestamp(now),
            heartbeat: timestamp(now),
            is_active: true,
            is_standalone: false,
            shards: None,
        };
        let dead = ConsumerRecord {
            heartbeat: timestamp(now - ChronoDuration::seconds(600)),
            ..live.clone()
        };
        state.consumers.insert("live".into(), live);
        state.consumers.insert("dead".into(), dead);

        let timeout = ChronoDuration::seconds(60);
        assert_eq!(state.active_consumer_ids(timeout, now), vec!["live"]);
        assert_eq!(state.stale_consumer_ids(timeout, now), vec!["dead"]);
    }
}
