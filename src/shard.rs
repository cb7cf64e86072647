//! Shard lineage
//!
//! The lineage graph is ephemeral: it is rebuilt from `ListShards` on every
//! reconcile tick. Each shard points at the shard it was split from or
//! merged out of; a shard whose advertised parent is no longer in the
//! listing is promoted to root, because ancestors beyond the retention
//! horizon are gone for good.

use std::collections::BTreeSet;

use aws_sdk_kinesis::types::Shard;

/// One shard of the lineage forest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub shard_id: String,
    /// Parent within the current listing; `None` for roots
    pub parent: Option<String>,
    pub starting_sequence_number: Option<String>,
}

impl ShardInfo {
    pub fn root(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent: None,
            starting_sequence_number: None,
        }
    }

    pub fn child_of(shard_id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent: Some(parent.into()),
            starting_sequence_number: None,
        }
    }
}

/// Builds the lineage forest from a shard listing, in deterministic
/// shard-id order. Parents absent from the listing are erased.
pub fn build_lineage(shards: &[Shard]) -> Vec<ShardInfo> {
    let known: BTreeSet<&str> = shards.iter().map(|s| s.shard_id()).collect();

    let mut infos: Vec<ShardInfo> = shards
        .iter()
        .map(|shard| {
            let parent = shard
                .parent_shard_id()
                .filter(|p| known.contains(p))
                .map(String::from);
            ShardInfo {
                shard_id: shard.shard_id().to_string(),
                parent,
                starting_sequence_number: shard
                    .sequence_number_range()
                    .map(|r| r.starting_sequence_number().to_string()),
            }
        })
        .collect();

    infos.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_kinesis::types::SequenceNumberRange;

    fn shard(id: &str, parent: Option<&str>, starting: &str) -> Shard {
        let mut builder = Shard::builder().shard_id(id).sequence_number_range(
            SequenceNumberRange::builder()
                .starting_sequence_number(starting)
                .build()
                .expect("valid range"),
        );
        if let Some(parent) = parent {
            builder = builder.parent_shard_id(parent);
        }
        builder
            .hash_key_range(
                aws_sdk_kinesis::types::HashKeyRange::builder()
                    .starting_hash_key("0")
                    .ending_hash_key("1")
                    .build()
                    .expect("valid range"),
            )
            .build()
            .expect("valid shard")
    }

    #[test]
    fn test_lineage_ordering_and_parents() {
        let listing = vec![
            shard("shardId-000000000002", Some("shardId-000000000000"), "201"),
            shard("shardId-000000000000", None, "1"),
            shard("shardId-000000000001", Some("shardId-000000000000"), "101"),
        ];

        let lineage = build_lineage(&listing);
        let ids: Vec<&str> = lineage.iter().map(|s| s.shard_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "shardId-000000000000",
                "shardId-000000000001",
                "shardId-000000000002"
            ]
        );
        assert_eq!(lineage[0].parent, None);
        assert_eq!(
            lineage[1].parent.as_deref(),
            Some("shardId-000000000000")
        );
        assert_eq!(
            lineage[1].starting_sequence_number.as_deref(),
            Some("101")
        );
    }

    #[test]
    fn test_missing_parent_promotes_to_root() {
        // The parent fell off the retention horizon and is not listed
        let listing = vec![shard(
            "shardId-000000000005",
            Some("shardId-000000000001"),
            "501",
        )];

        let lineage = build_lineage(&listing);
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].parent, None);
    }
}
