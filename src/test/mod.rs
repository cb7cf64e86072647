//! Test utilities and mock implementations

pub mod mocks;

use aws_sdk_kinesis::types::{Record, SequenceNumberRange, Shard};
use aws_smithy_types::Blob;
use chrono::{TimeZone, Utc};

use crate::client::StreamDescription;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with given sequence number and data
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> Record {
        Record::builder()
            .sequence_number(sequence_number)
            .data(Blob::new(data.to_vec()))
            .partition_key("test-partition-key")
            .build()
            .expect("Failed to build test record")
    }

    /// Create a vector of test records with sequence numbers that sort in
    /// arrival order
    pub fn create_test_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Self::create_test_record(
                    &format!("sequence-{:03}", i),
                    format!("data-{}", i).as_bytes(),
                )
            })
            .collect()
    }

    /// Create a root test shard with given ID
    pub fn create_test_shard(shard_id: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .sequence_number_range(
                SequenceNumberRange::builder()
                    .starting_sequence_number("0")
                    .build()
                    .expect("Failed to build range"),
            )
            .build()
            .expect("Failed to build test shard")
    }

    /// Create a child shard pointing at a parent, starting at a sequence
    pub fn create_child_shard(shard_id: &str, parent: &str, starting_sequence: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .parent_shard_id(parent)
            .sequence_number_range(
                SequenceNumberRange::builder()
                    .starting_sequence_number(starting_sequence)
                    .build()
                    .expect("Failed to build range"),
            )
            .build()
            .expect("Failed to build test shard")
    }

    /// Create an ACTIVE stream description with a fixed creation timestamp
    pub fn create_stream_description(stream_name: &str) -> StreamDescription {
        StreamDescription {
            stream_arn: format!("arn:aws:kinesis:us-east-1:000000000000:stream/{}", stream_name),
            stream_status: "ACTIVE".to_string(),
            stream_created_on: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_record() {
        let record = TestUtils::create_test_record("seq-1", b"test-data");
        assert_eq!(record.sequence_number(), "seq-1");
        assert_eq!(record.data().as_ref(), b"test-data");
        assert_eq!(record.partition_key(), "test-partition-key");
    }

    #[test]
    fn test_create_child_shard() {
        let shard = TestUtils::create_child_shard("shard-1", "shard-0", "101");
        assert_eq!(shard.shard_id(), "shard-1");
        assert_eq!(shard.parent_shard_id(), Some("shard-0"));
        assert_eq!(
            shard
                .sequence_number_range()
                .map(|r| r.starting_sequence_number()),
            Some("101")
        );
    }
}
