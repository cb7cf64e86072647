//! Lease manager
//!
//! One instance per consumer process. A single reconciliation loop discovers
//! shards, keeps the consumer roster fresh, and walks the decision table for
//! every shard in deterministic order. The only synchronization primitive in
//! the whole protocol is the state store's conditional update on each slot's
//! version: simultaneous acquirers race, the first writer wins, the loser
//! sees the shard as owned on its next tick.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::client::KinesisClientTrait;
use crate::config::{ConsumerConfig, ConsumerIdentity};
use crate::consumer::{ConsumersManager, DefaultDecoder, RecordDecoder, RecordSink};
use crate::error::{ConsumerError, Result};
use crate::kv::{DocumentKey, KvClient};
use crate::monitoring::{CoordinationEvent, EventSender};
use crate::shard::{build_lineage, ShardInfo};
use crate::store::document::{timestamp, ShardRecord, StreamState};
use crate::store::StateStore;

/// Outcome of one reconciliation tick
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// The stream no longer exists; the manager shuts down
    StreamGone,
}

/// What to do about one shard, first matching decision-table row wins
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ShardDecision {
    Skip(&'static str),
    /// Re-lock our own lease with its current version
    Renew { version: String },
    /// Release another consumer's dead lease, then lock
    Takeover {
        version: String,
        previous_owner: String,
    },
    /// Lock a free shard
    Acquire { version: String },
}

/// Walks the decision table for one shard. Pure: all inputs come from the
/// fetched document and the current lineage, so ties are broken solely by
/// the conditional write that follows.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evaluate_shard(
    record: &ShardRecord,
    shard: &ShardInfo,
    state: &StreamState,
    consumer_id: &str,
    now: DateTime<Utc>,
    renew_threshold: ChronoDuration,
    max_active: Option<usize>,
    owned_count: usize,
) -> ShardDecision {
    if record.depleted {
        return ShardDecision::Skip("depleted, can't be leased");
    }

    if record.lease_owner.as_deref() == Some(consumer_id) {
        let healthy = record
            .lease_expiration_ts()
            .is_some_and(|expiration| expiration - now > renew_threshold);
        if healthy {
            return ShardDecision::Skip("owned by this consumer");
        }
        return ShardDecision::Renew {
            version: record.version.clone(),
        };
    }

    if let Some(owner) = &record.lease_owner {
        let owner_live = state.consumers.contains_key(owner);
        if record.lease_expired(now) && owner_live {
            debug!(owner = %owner, "expired lease");
            return ShardDecision::Takeover {
                version: record.version.clone(),
                previous_owner: owner.clone(),
            };
        }
        if !owner_live {
            debug!(owner = %owner, "owner is gone");
            return ShardDecision::Takeover {
                version: record.version.clone(),
                previous_owner: owner.clone(),
            };
        }
        return ShardDecision::Skip("owned by another consumer");
    }

    if let Some(parent) = &shard.parent {
        let parent_depleted = state.shards.get(parent).map(|p| p.depleted).unwrap_or(false);
        if !parent_depleted {
            return ShardDecision::Skip("parent not depleted");
        }
    }

    if let Some(max) = max_active {
        if owned_count >= max {
            return ShardDecision::Skip("max leases reached");
        }
    }

    ShardDecision::Acquire {
        version: record.version.clone(),
    }
}

pub struct LeaseManager<K, C, S> {
    config: Arc<ConsumerConfig>,
    identity: ConsumerIdentity,
    store: Arc<StateStore<K>>,
    client: Arc<C>,
    consumers: ConsumersManager<K, C, S>,
    events: EventSender,
    stream_arn: Option<String>,
    enhanced_consumer_arn: Option<String>,
}

impl<K, C, S> LeaseManager<K, C, S>
where
    K: KvClient + 'static,
    C: KinesisClientTrait + 'static,
    S: RecordSink + 'static,
{
    /// Creates a manager and, when monitoring is enabled, the receiving end
    /// of its event channel.
    pub fn new(
        config: ConsumerConfig,
        client: C,
        kv: K,
        sink: S,
    ) -> Result<(Self, Option<mpsc::Receiver<CoordinationEvent>>)> {
        config.validate()?;

        let identity = ConsumerIdentity::capture(&config.app_name);
        let (events, events_rx) = EventSender::from_config(&config.monitoring);
        let standalone = !config.use_auto_shard_assignment;

        let store = Arc::new(StateStore::new(
            Arc::new(kv),
            DocumentKey::new(&config.consumer_group, &config.stream_name),
            identity.clone(),
            standalone,
        ));
        let client = Arc::new(client);
        let config = Arc::new(config);
        let decoder: Arc<dyn RecordDecoder> =
            Arc::new(DefaultDecoder::new(config.should_parse_json));
        let consumers = ConsumersManager::new(
            config.clone(),
            store.clone(),
            client.clone(),
            Arc::new(sink),
            decoder,
            events.clone(),
        );

        Ok((
            Self {
                config,
                identity,
                store,
                client,
                consumers,
                events,
                stream_arn: None,
                enhanced_consumer_arn: None,
            },
            events_rx,
        ))
    }

    /// Swap in a custom record decoder (deaggregation codec, large-object
    /// resolution)
    pub fn with_decoder(mut self, decoder: Arc<dyn RecordDecoder>) -> Self {
        self.consumers.set_decoder(decoder);
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.identity.consumer_id
    }

    /// Runs the reconciliation loop until shutdown or until the stream
    /// disappears. Transient errors are logged and the next tick is
    /// scheduled unconditionally; only shutdown and a missing stream
    /// terminate the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            stream = %self.config.stream_name,
            consumer_id = %self.identity.consumer_id,
            "Starting lease manager"
        );
        self.bootstrap().await?;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.reconcile_once().await {
                Ok(Tick::Continue) => {}
                Ok(Tick::StreamGone) => {
                    warn!(stream = %self.config.stream_name, "Stream is gone, shutting down");
                    self.consumers.stop_all().await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Reconcile tick failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconcile_every) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.consumers.stop_all().await;
        info!("Lease manager shutdown complete");
        Ok(())
    }

    /// One-time startup: coordination table, stream resolution, document
    /// initialization, consumer registration.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.store
            .ensure_table_exists(&self.config.kv_tags)
            .await?;

        let description = self
            .client
            .check_if_stream_exists(&self.config.stream_name)
            .await?
            .ok_or_else(|| ConsumerError::StreamNotFound(self.config.stream_name.clone()))?;
        self.stream_arn = Some(description.stream_arn.clone());

        self.store
            .init_stream_state(&timestamp(description.stream_created_on))
            .await?;
        self.store.register_consumer().await?;
        self.events
            .send(CoordinationEvent::consumer_registered())
            .await;
        Ok(())
    }

    /// Stops every poller. Only needed by embedders driving
    /// [`reconcile_once`](Self::reconcile_once) from their own timer;
    /// [`run`](Self::run) does this on its way out.
    pub async fn shutdown(&mut self) {
        self.consumers.stop_all().await;
    }

    /// One reconciliation pass. Public so embedders that own their own timer
    /// can drive ticks directly.
    pub async fn reconcile_once(&mut self) -> Result<Tick> {
        let Some(description) = self
            .client
            .check_if_stream_exists(&self.config.stream_name)
            .await?
        else {
            return Ok(Tick::StreamGone);
        };
        self.stream_arn = Some(description.stream_arn.clone());

        self.store.register_consumer().await?;
        let evicted = self
            .store
            .clear_old_consumers(self.config.heartbeat_failure_timeout)
            .await?;
        if !evicted.is_empty() {
            self.events
                .send(CoordinationEvent::consumers_evicted(evicted))
                .await;
        }

        if self.config.use_enhanced_fan_out && !self.ensure_enhanced_consumer().await? {
            debug!("No enhanced consumer assigned yet, nothing to lease this tick");
            return Ok(Tick::Continue);
        }

        let listing = self.client.list_shards(&self.config.stream_name).await?;
        let lineage = build_lineage(&listing);

        let mut state = self.store.get_stream_state().await?;
        let mut seeded = false;
        for shard in &lineage {
            if self.store.shard_view(&state, &shard.shard_id).is_none() {
                self.store.ensure_shard_state_exists(shard).await?;
                seeded = true;
            }
        }
        if seeded {
            state = self.store.get_stream_state().await?;
        }

        let now = Utc::now();
        let renew_threshold = ChronoDuration::from_std(self.config.renew_threshold())
            .map_err(|e| ConsumerError::Config(e.to_string()))?;
        let max_active = self.max_active(&state, lineage.len(), now);
        let mut owned_count = self.owned_lease_count(&state, now);
        let mut changed = false;

        for shard in &lineage {
            let Some(record) = self.store.shard_view(&state, &shard.shard_id) else {
                continue;
            };
            let decision = evaluate_shard(
                &record,
                shard,
                &state,
                &self.identity.consumer_id,
                now,
                renew_threshold,
                max_active,
                owned_count,
            );

            match decision {
                ShardDecision::Skip(reason) => {
                    debug!(shard_id = %shard.shard_id, reason, "Skipping shard");
                    // A full consumer still asks the downstream to settle so
                    // peers converge on the rebalanced split
                    if reason == "max leases reached" {
                        changed = true;
                    }
                }
                ShardDecision::Renew { version } => {
                    debug!(shard_id = %shard.shard_id, "time to renew");
                    if self
                        .store
                        .lock_shard_lease(&shard.shard_id, self.config.lease_term, &version)
                        .await?
                    {
                        self.events
                            .send(CoordinationEvent::lease_renewed(&shard.shard_id))
                            .await;
                        changed = true;
                    }
                }
                ShardDecision::Takeover {
                    version,
                    previous_owner,
                } => {
                    if let Some(fresh) = self
                        .store
                        .release_shard_lease(&shard.shard_id, &version)
                        .await?
                    {
                        changed = true;
                        if self
                            .store
                            .lock_shard_lease(&shard.shard_id, self.config.lease_term, &fresh)
                            .await?
                        {
                            info!(
                                shard_id = %shard.shard_id,
                                previous_owner = %previous_owner,
                                "Took over lease"
                            );
                            self.events
                                .send(CoordinationEvent::lease_stolen(
                                    &shard.shard_id,
                                    &previous_owner,
                                ))
                                .await;
                            owned_count += 1;
                        } else {
                            // We freed the slot but a peer locked it first
                            self.events
                                .send(CoordinationEvent::lease_released(&shard.shard_id))
                                .await;
                        }
                    } else {
                        debug!(shard_id = %shard.shard_id, "Takeover lost the race");
                    }
                }
                ShardDecision::Acquire { version } => {
                    if self
                        .store
                        .lock_shard_lease(&shard.shard_id, self.config.lease_term, &version)
                        .await?
                    {
                        info!(shard_id = %shard.shard_id, "acquired");
                        self.events
                            .send(CoordinationEvent::lease_acquired(&shard.shard_id))
                            .await;
                        owned_count += 1;
                        changed = true;
                    } else {
                        debug!(shard_id = %shard.shard_id, "Acquisition lost the race");
                    }
                }
            }
        }

        if changed {
            let owned = self.store.get_owned_shards().await?;
            self.consumers.reconcile(&owned).await;
            debug!(pollers = ?self.consumers.active_shards(), "Downstream reconciled");
        }

        Ok(Tick::Continue)
    }

    /// `ceil(|shards| / |active consumers|)`, optionally clamped, in
    /// auto-assignment mode; standalone mode has no cap.
    fn max_active(&self, state: &StreamState, shard_count: usize, now: DateTime<Utc>) -> Option<usize> {
        if self.store.is_standalone() {
            return None;
        }
        let timeout = ChronoDuration::from_std(self.config.heartbeat_failure_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let consumers = state.active_consumer_ids(timeout, now).len().max(1);
        let fair_share = shard_count.div_ceil(consumers);
        Some(match self.config.max_active_leases {
            Some(cap) => fair_share.min(cap),
            None => fair_share,
        })
    }

    fn owned_lease_count(&self, state: &StreamState, now: DateTime<Utc>) -> usize {
        self.store
            .shard_map(state)
            .map(|shards| {
                shards
                    .values()
                    .filter(|r| {
                        r.lease_owner.as_deref() == Some(self.identity.consumer_id.as_str())
                            && !r.lease_expired(now)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Finds or registers this group's enhanced fan-out consumer. Returns
    /// `false` while the assignment is still pending.
    async fn ensure_enhanced_consumer(&mut self) -> Result<bool> {
        if self.enhanced_consumer_arn.is_some() {
            return Ok(true);
        }
        let Some(stream_arn) = self.stream_arn.clone() else {
            return Ok(false);
        };

        let consumers = self.client.list_stream_consumers(&stream_arn).await?;
        if let Some(consumer) = consumers
            .iter()
            .find(|c| c.consumer_name == self.config.consumer_group)
        {
            if consumer.consumer_status == "ACTIVE" {
                info!(arn = %consumer.consumer_arn, "Using enhanced fan-out consumer");
                self.enhanced_consumer_arn = Some(consumer.consumer_arn.clone());
                return Ok(true);
            }
            debug!(status = %consumer.consumer_status, "Enhanced consumer not active yet");
            return Ok(false);
        }

        let arn = self
            .client
            .register_stream_consumer(&stream_arn, &self.config.consumer_group)
            .await?;
        debug!(arn = %arn, "Registered enhanced fan-out consumer, waiting for it to become active");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document::ConsumerRecord;

    fn state_with_consumers(ids: &[&str]) -> StreamState {
        let now = Utc::now();
        let mut state = StreamState::new("group", "stream", timestamp(now));
        for id in ids {
            state.consumers.insert(
                id.to_string(),
                ConsumerRecord {
                    app_name: "app".into(),
                    host: "host".into(),
                    pid: 1,
                    started_on: timestamp(now),
                    heartbeat: timestamp(now),
                    is_active: true,
                    is_standalone: false,
                    shards: None,
                },
            );
        }
        state
    }

    fn record() -> ShardRecord {
        ShardRecord::new(None)
    }

    fn leased(owner: &str, expires_in_secs: i64) -> ShardRecord {
        ShardRecord {
            lease_owner: Some(owner.to_string()),
            lease_expiration: Some(timestamp(Utc::now() + ChronoDuration::seconds(expires_in_secs))),
            ..ShardRecord::new(None)
        }
    }

    fn evaluate(
        record: &ShardRecord,
        shard: &ShardInfo,
        state: &StreamState,
        max_active: Option<usize>,
        owned_count: usize,
    ) -> ShardDecision {
        evaluate_shard(
            record,
            shard,
            state,
            "c-self",
            Utc::now(),
            ChronoDuration::seconds(150),
            max_active,
            owned_count,
        )
    }

    #[test]
    fn test_depleted_shard_is_skipped() {
        let state = state_with_consumers(&["c-self"]);
        let record = ShardRecord {
            depleted: true,
            ..record()
        };
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 0),
            ShardDecision::Skip("depleted, can't be leased")
        );
    }

    #[test]
    fn test_healthy_own_lease_is_skipped() {
        let state = state_with_consumers(&["c-self"]);
        let record = leased("c-self", 280);
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 1),
            ShardDecision::Skip("owned by this consumer")
        );
    }

    #[test]
    fn test_own_lease_near_expiry_is_renewed() {
        let state = state_with_consumers(&["c-self"]);
        let record = leased("c-self", 100);
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 1),
            ShardDecision::Renew {
                version: record.version.clone()
            }
        );
    }

    #[test]
    fn test_expired_lease_of_live_peer_is_stolen() {
        let state = state_with_consumers(&["c-self", "c-peer"]);
        let record = leased("c-peer", -10);
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 0),
            ShardDecision::Takeover {
                version: record.version.clone(),
                previous_owner: "c-peer".into()
            }
        );
    }

    #[test]
    fn test_lease_of_departed_owner_is_reclaimed() {
        // Owner's record was garbage-collected but the lease has not expired
        let state = state_with_consumers(&["c-self"]);
        let record = leased("c-departed", 200);
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 0),
            ShardDecision::Takeover {
                version: record.version.clone(),
                previous_owner: "c-departed".into()
            }
        );
    }

    #[test]
    fn test_live_unexpired_peer_lease_is_skipped() {
        let state = state_with_consumers(&["c-self", "c-peer"]);
        let record = leased("c-peer", 200);
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 0),
            ShardDecision::Skip("owned by another consumer")
        );
    }

    #[test]
    fn test_child_blocked_until_parent_depleted() {
        let mut state = state_with_consumers(&["c-self"]);
        state.shards.insert("s-0".into(), record());
        let child = ShardInfo::child_of("s-1", "s-0");

        assert_eq!(
            evaluate(&record(), &child, &state, None, 0),
            ShardDecision::Skip("parent not depleted")
        );

        state.shards.get_mut("s-0").unwrap().depleted = true;
        let free = record();
        assert_eq!(
            evaluate(&free, &child, &state, None, 0),
            ShardDecision::Acquire {
                version: free.version.clone()
            }
        );
    }

    #[test]
    fn test_child_blocked_when_parent_record_missing() {
        // The listing advertises a parent that has no record yet: it has
        // never been consumed, so the child must wait
        let state = state_with_consumers(&["c-self"]);
        let child = ShardInfo::child_of("s-1", "s-0");
        assert_eq!(
            evaluate(&record(), &child, &state, None, 0),
            ShardDecision::Skip("parent not depleted")
        );
    }

    #[test]
    fn test_max_leases_cap() {
        let state = state_with_consumers(&["c-self", "c-peer"]);
        assert_eq!(
            evaluate(&record(), &ShardInfo::root("s-1"), &state, Some(2), 2),
            ShardDecision::Skip("max leases reached")
        );

        // Below the cap, or with no cap (standalone), the shard is taken
        let free = record();
        assert_eq!(
            evaluate(&free, &ShardInfo::root("s-1"), &state, Some(2), 1),
            ShardDecision::Acquire {
                version: free.version.clone()
            }
        );
        let free = record();
        assert_eq!(
            evaluate(&free, &ShardInfo::root("s-1"), &state, None, 100),
            ShardDecision::Acquire {
                version: free.version.clone()
            }
        );
    }

    #[test]
    fn test_own_lease_without_expiration_is_renewed() {
        let state = state_with_consumers(&["c-self"]);
        let record = ShardRecord {
            lease_owner: Some("c-self".into()),
            lease_expiration: None,
            ..ShardRecord::new(None)
        };
        assert_eq!(
            evaluate(&record, &ShardInfo::root("s-1"), &state, None, 1),
            ShardDecision::Renew {
                version: record.version.clone()
            }
        );
    }
}
