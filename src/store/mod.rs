//! State store: lease-protocol intent translated into conditional KV writes
//!
//! Every mutation that can be contended carries a `version` precondition, so
//! concurrent writers either commit cleanly or observe
//! [`KvError::PreconditionFailed`] and treat the slot as moved. The store
//! itself is stateless across calls and safe to share behind an `Arc`.

pub mod document;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ConsumerIdentity;
use crate::error::{ConsumerError, KvError, Result};
use crate::kv::{Condition, DocumentKey, KvClient, Path, Update};
use crate::shard::ShardInfo;
use document::{fresh_version, timestamp, ConsumerRecord, ShardRecord, StreamState};

/// Lease and progress snapshot for one owned shard
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedShard {
    pub checkpoint: Option<String>,
    pub lease_expiration: Option<DateTime<Utc>>,
    pub version: String,
}

pub struct StateStore<K> {
    kv: Arc<K>,
    key: DocumentKey,
    identity: ConsumerIdentity,
    standalone: bool,
}

impl<K: KvClient> StateStore<K> {
    /// The assignment mode is fixed at construction and never changes at
    /// runtime: it decides which document paths lease and checkpoint state
    /// live under.
    pub fn new(kv: Arc<K>, key: DocumentKey, identity: ConsumerIdentity, standalone: bool) -> Self {
        Self {
            kv,
            key,
            identity,
            standalone,
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// Root of the mode-scoped shard map holding lease/checkpoint state
    fn shards_root(&self) -> Path {
        if self.standalone {
            Path::new(["consumers", self.identity.consumer_id.as_str(), "shards"])
        } else {
            Path::new(["shards"])
        }
    }

    fn lease_path(&self, shard_id: &str) -> Path {
        self.shards_root().child(shard_id)
    }

    /// Shard lineage is global in both modes so that siblings agree on
    /// parent/depleted state while progress stays private in standalone mode.
    fn lineage_path(shard_id: &str) -> Path {
        Path::new(["shards", shard_id])
    }

    /// Mode-scoped shard map of a fetched document
    pub fn shard_map<'a>(&self, state: &'a StreamState) -> Option<&'a BTreeMap<String, ShardRecord>> {
        if self.standalone {
            state
                .consumers
                .get(&self.identity.consumer_id)
                .and_then(|c| c.shards.as_ref())
        } else {
            Some(&state.shards)
        }
    }

    /// Merged view of one shard: lease/checkpoint from the mode-scoped slot,
    /// lineage flags from the global map.
    pub fn shard_view(&self, state: &StreamState, shard_id: &str) -> Option<ShardRecord> {
        if !self.standalone {
            return state.shards.get(shard_id).cloned();
        }
        let lease = self.shard_map(state)?.get(shard_id)?.clone();
        let lineage = state.shards.get(shard_id);
        Some(ShardRecord {
            parent: lineage.and_then(|l| l.parent.clone()).or(lease.parent),
            depleted: lineage.map(|l| l.depleted).unwrap_or(lease.depleted),
            ..lease
        })
    }

    /// Ensures the coordination table exists, is ACTIVE, and carries the
    /// configured tags. Concurrent creators are benign.
    pub async fn ensure_table_exists(&self, tags: &HashMap<String, String>) -> Result<()> {
        if self.kv.describe_table().await?.is_none() {
            info!("Coordination table missing, creating it");
            self.kv.create_table().await?;
        }
        self.kv.wait_for_table(true).await?;
        self.kv.tag_table(tags).await?;
        Ok(())
    }

    /// Creates the stream-state document if needed. A `streamCreatedOn`
    /// mismatch means the upstream stream was recreated under the same name;
    /// the stale document is removed and replaced.
    #[instrument(skip(self), fields(stream = %self.key.stream_name))]
    pub async fn init_stream_state(&self, stream_created_on: &str) -> Result<()> {
        match self.kv.get(&self.key, true).await? {
            Some(value) => match serde_json::from_value::<StreamState>(value) {
                Ok(state) if state.stream_created_on == stream_created_on => {
                    debug!("Stream state already initialized");
                    return Ok(());
                }
                Ok(state) => {
                    warn!(
                        stored = %state.stream_created_on,
                        current = %stream_created_on,
                        "Stream was recreated, resetting stream state"
                    );
                    self.kv.delete(&self.key, None).await?;
                }
                Err(e) => {
                    warn!(error = %e, "Unreadable stream state, resetting");
                    self.kv.delete(&self.key, None).await?;
                }
            },
            None => debug!("No stream state document yet"),
        }

        let state = StreamState::new(
            self.key.consumer_group.clone(),
            self.key.stream_name.clone(),
            stream_created_on,
        );
        let document = serde_json::to_value(&state)
            .map_err(|e| ConsumerError::Other(e.into()))?;
        match self
            .kv
            .put(&self.key, document, Some(Condition::DocumentAbsent))
            .await
        {
            Ok(()) => {
                info!("Initialized stream state");
                Ok(())
            }
            // Another consumer created it between our read and write
            Err(KvError::PreconditionFailed) => {
                debug!("Stream state created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches the full coordination document with a consistent read
    pub async fn get_stream_state(&self) -> Result<StreamState> {
        let value = self.kv.get(&self.key, true).await?.ok_or_else(|| {
            ConsumerError::Kv(KvError::Corrupt("stream state document is missing".into()))
        })?;
        serde_json::from_value(value)
            .map_err(|e| ConsumerError::Kv(KvError::Corrupt(e.to_string())))
    }

    /// Registers this consumer, or refreshes its heartbeat if it is already
    /// present. The heartbeat-only path is non-fatal: a missed beat is
    /// recovered on the next reconcile tick.
    pub async fn register_consumer(&self) -> Result<()> {
        let me = Path::new(["consumers", self.identity.consumer_id.as_str()]);
        let now = timestamp(Utc::now());

        let heartbeat = Update::new()
            .assign(me.clone().child("heartbeat"), json!(now))
            .when(Condition::PathExists(me.clone()));
        match self.kv.update(&self.key, heartbeat).await {
            Ok(()) => {
                trace!(consumer_id = %self.identity.consumer_id, "Heartbeat refreshed");
                return Ok(());
            }
            Err(KvError::PreconditionFailed) => {} // not registered yet
            Err(e) => {
                warn!(error = %e, "Heartbeat refresh failed, will retry next tick");
                return Ok(());
            }
        }

        let record = ConsumerRecord {
            app_name: self.identity.app_name.clone(),
            host: self.identity.host.clone(),
            pid: self.identity.pid,
            started_on: now.clone(),
            heartbeat: now,
            is_active: true,
            is_standalone: self.standalone,
            shards: self.standalone.then(BTreeMap::new),
        };
        let register = Update::new()
            .assign(
                me.clone(),
                serde_json::to_value(&record).map_err(|e| ConsumerError::Other(e.into()))?,
            )
            .when(Condition::PathAbsent(me));
        match self.kv.update(&self.key, register).await {
            Ok(()) => {
                info!(consumer_id = %self.identity.consumer_id, "Registered consumer");
                Ok(())
            }
            // Lost a race against our own previous registration
            Err(KvError::PreconditionFailed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every consumer whose heartbeat age exceeds the failure
    /// timeout, guarded by the document version so concurrent collectors
    /// don't trample each other.
    pub async fn clear_old_consumers(&self, failure_timeout: Duration) -> Result<Vec<String>> {
        let state = self.get_stream_state().await?;
        let timeout = ChronoDuration::from_std(failure_timeout)
            .map_err(|e| ConsumerError::Config(e.to_string()))?;
        let stale: Vec<String> = state
            .stale_consumer_ids(timeout, Utc::now())
            .into_iter()
            .map(String::from)
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let mut update = Update::new()
            .assign(Path::new(["version"]), json!(fresh_version()))
            .when(Condition::ValueEquals(
                Path::new(["version"]),
                json!(state.version),
            ));
        for id in &stale {
            update = update.remove(Path::new(["consumers", id.as_str()]));
        }

        match self.kv.update(&self.key, update).await {
            Ok(()) => {
                info!(consumers = ?stale, "Cleared dead consumers");
                Ok(stale)
            }
            Err(KvError::PreconditionFailed) => {
                debug!("Another consumer is clearing the roster");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the shard's record(s) if absent: the global lineage slot, and
    /// in standalone mode the consumer-scoped lease slot as well.
    pub async fn ensure_shard_state_exists(&self, shard: &ShardInfo) -> Result<()> {
        let lineage = Self::lineage_path(&shard.shard_id);
        self.ensure_record(lineage, ShardRecord::new(shard.parent.clone()))
            .await?;
        if self.standalone {
            let lease = self.lease_path(&shard.shard_id);
            self.ensure_record(lease, ShardRecord::new(shard.parent.clone()))
                .await?;
        }
        Ok(())
    }

    async fn ensure_record(&self, path: Path, record: ShardRecord) -> Result<()> {
        let update = Update::new()
            .assign(
                path.clone(),
                serde_json::to_value(&record).map_err(|e| ConsumerError::Other(e.into()))?,
            )
            .when(Condition::PathAbsent(path));
        match self.kv.update(&self.key, update).await {
            Ok(()) | Err(KvError::PreconditionFailed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the document and the merged view of one shard, seeding the
    /// shard's record first if it has never been observed.
    pub async fn get_shard_and_stream_state(
        &self,
        shard: &ShardInfo,
    ) -> Result<(StreamState, ShardRecord)> {
        let state = self.get_stream_state().await?;
        if let Some(record) = self.shard_view(&state, &shard.shard_id) {
            return Ok((state, record));
        }

        self.ensure_shard_state_exists(shard).await?;
        let state = self.get_stream_state().await?;
        let record = self.shard_view(&state, &shard.shard_id).ok_or_else(|| {
            ConsumerError::Kv(KvError::Corrupt(format!(
                "shard {} missing after seeding",
                shard.shard_id
            )))
        })?;
        Ok((state, record))
    }

    /// Attempts to take or renew the lease on a shard. Returns `false` when
    /// another consumer moved the slot first.
    #[instrument(skip(self, lease_term), fields(consumer_id = %self.identity.consumer_id))]
    pub async fn lock_shard_lease(
        &self,
        shard_id: &str,
        lease_term: Duration,
        expected_version: &str,
    ) -> Result<bool> {
        let expiration = Utc::now()
            + ChronoDuration::from_std(lease_term)
                .map_err(|e| ConsumerError::Config(e.to_string()))?;
        let path = self.lease_path(shard_id);
        let update = Update::new()
            .assign(
                path.clone().child("leaseOwner"),
                json!(self.identity.consumer_id),
            )
            .assign(
                path.clone().child("leaseExpiration"),
                json!(timestamp(expiration)),
            )
            .assign(path.clone().child("version"), json!(fresh_version()))
            .when(Condition::ValueEquals(
                path.child("version"),
                json!(expected_version),
            ));

        match self.kv.update(&self.key, update).await {
            Ok(()) => {
                debug!(shard_id = %shard_id, "Locked shard lease");
                Ok(true)
            }
            Err(KvError::PreconditionFailed) => {
                debug!(shard_id = %shard_id, "Lost lease race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lease on a shard. Returns the slot's fresh version on
    /// success, `None` when the slot moved under us.
    pub async fn release_shard_lease(
        &self,
        shard_id: &str,
        expected_version: &str,
    ) -> Result<Option<String>> {
        let path = self.lease_path(shard_id);
        let version = fresh_version();
        let update = Update::new()
            .assign(path.clone().child("leaseOwner"), json!(null))
            .assign(path.clone().child("leaseExpiration"), json!(null))
            .assign(path.clone().child("version"), json!(version))
            .when(Condition::ValueEquals(
                path.child("version"),
                json!(expected_version),
            ));

        match self.kv.update(&self.key, update).await {
            Ok(()) => {
                debug!(shard_id = %shard_id, "Released shard lease");
                Ok(Some(version))
            }
            Err(KvError::PreconditionFailed) => {
                debug!(shard_id = %shard_id, "Release lost the race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stores a checkpoint for a shard. Unconditional: the poller holding
    /// the lease is the only writer advancing this slot, and its values are
    /// monotone by construction.
    pub async fn store_shard_checkpoint(&self, shard_id: &str, sequence_number: &str) -> Result<()> {
        let path = self.lease_path(shard_id);
        let update = Update::new()
            .assign(path.clone().child("checkpoint"), json!(sequence_number))
            .assign(path.child("version"), json!(fresh_version()));
        self.kv.update(&self.key, update).await?;
        trace!(shard_id = %shard_id, sequence_number = %sequence_number, "Stored checkpoint");
        Ok(())
    }

    /// Marks a drained parent shard as depleted and seeds each child's
    /// checkpoint with its starting sequence number, all in one atomic
    /// update. Depletion is terminal: nothing ever clears it.
    #[instrument(skip(self, shards), fields(stream = %self.key.stream_name))]
    pub async fn mark_shard_as_depleted(
        &self,
        shards: &[ShardInfo],
        parent_shard_id: &str,
    ) -> Result<()> {
        let state = self.get_stream_state().await?;

        // Depletion is terminal and seeding happens exactly once; a replay
        // must not touch checkpoints the children have advanced since.
        if state.shards.get(parent_shard_id).is_some_and(|p| p.depleted) {
            debug!(shard_id = %parent_shard_id, "Shard already depleted");
            return Ok(());
        }

        let parent_lineage = Self::lineage_path(parent_shard_id);

        let mut update = Update::new()
            .assign(parent_lineage.clone().child("depleted"), json!(true))
            .assign(parent_lineage.clone().child("version"), json!(fresh_version()))
            .when(Condition::PathExists(parent_lineage));

        // Children start exactly where the parent ended. Only a parent that
        // made progress seeds them; an untouched parent leaves children to
        // start from the configured initial position.
        let parent_progressed = self
            .shard_view(&state, parent_shard_id)
            .and_then(|r| r.checkpoint)
            .is_some();
        if parent_progressed {
            for child in shards
                .iter()
                .filter(|s| s.parent.as_deref() == Some(parent_shard_id))
            {
                update = self.seed_child(update, &state, child, parent_shard_id)?;
            }
        }

        self.kv.update(&self.key, update).await?;
        info!(shard_id = %parent_shard_id, "Marked shard as depleted");
        Ok(())
    }

    fn seed_child(
        &self,
        mut update: Update,
        state: &StreamState,
        child: &ShardInfo,
        parent_shard_id: &str,
    ) -> Result<Update> {
        let checkpoint = child.starting_sequence_number.clone();
        let seeded = ShardRecord {
            parent: Some(parent_shard_id.to_string()),
            checkpoint: checkpoint.clone(),
            ..ShardRecord::new(Some(parent_shard_id.to_string()))
        };

        if self.standalone && !state.shards.contains_key(&child.shard_id) {
            // Global lineage slot, progress-free
            let lineage = ShardRecord::new(Some(parent_shard_id.to_string()));
            update = update.assign(
                Self::lineage_path(&child.shard_id),
                serde_json::to_value(&lineage).map_err(|e| ConsumerError::Other(e.into()))?,
            );
        }

        let lease_path = self.lease_path(&child.shard_id);
        match self.shard_map(state).and_then(|m| m.get(&child.shard_id)) {
            // A child that already has a checkpoint keeps it
            Some(existing) if existing.checkpoint.is_some() => {}
            Some(_) => {
                update = update
                    .assign(lease_path.clone().child("checkpoint"), json!(checkpoint))
                    .assign(lease_path.child("version"), json!(fresh_version()));
            }
            None => {
                update = update.assign(
                    lease_path,
                    serde_json::to_value(&seeded).map_err(|e| ConsumerError::Other(e.into()))?,
                );
            }
        }
        Ok(update)
    }

    /// The shards currently leased by this consumer. Depleted shards keep
    /// their lease record but have nothing left to poll, so they are not
    /// reported.
    pub async fn get_owned_shards(&self) -> Result<BTreeMap<String, OwnedShard>> {
        let state = self.get_stream_state().await?;
        let Some(map) = self.shard_map(&state) else {
            return Ok(BTreeMap::new());
        };
        Ok(map
            .iter()
            .filter(|(id, r)| {
                r.lease_owner.as_deref() == Some(self.identity.consumer_id.as_str())
                    && !state.shards.get(*id).is_some_and(|l| l.depleted)
                    && !r.depleted
            })
            .map(|(id, r)| {
                (
                    id.clone(),
                    OwnedShard {
                        checkpoint: r.checkpoint.clone(),
                        lease_expiration: r.lease_expiration_ts(),
                        version: r.version.clone(),
                    },
                )
            })
            .collect())
    }
}
