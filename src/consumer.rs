//! Per-shard pollers and the record delivery contract
//!
//! A [`ShardPoller`] drives one shard: it keeps the iterator alive, fetches
//! records, pushes them into the downstream [`RecordSink`], and advances the
//! durable checkpoint according to policy. The [`ConsumersManager`] owns the
//! pollers and reconciles them with the owned-lease set; pollers hold only
//! value-typed handles back (a stop signal, a lease-expiration channel), not
//! a reference to their owner.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, ShardIteratorType};
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client::KinesisClientTrait;
use crate::config::{ConsumerConfig, InitialPosition};
use crate::error::{ConsumerError, Result, StreamClientError};
use crate::kv::KvClient;
use crate::monitoring::{CoordinationEvent, EventSender};
use crate::shard::build_lineage;
use crate::store::{OwnedShard, StateStore};

/// A decoded record as delivered downstream
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Vec<u8>,
    /// Present when the payload was parsed as JSON
    pub json: Option<serde_json::Value>,
    pub approximate_arrival_timestamp: Option<DateTime<Utc>>,
}

/// One delivered batch
#[derive(Debug, Clone)]
pub struct RecordsDelivery {
    pub stream_name: String,
    pub shard_id: String,
    pub records: Vec<StreamRecord>,
    pub millis_behind_latest: i64,
    /// Present only when auto-checkpoints are off: the downstream decides
    /// when progress is durable
    pub checkpointer: Option<Checkpointer>,
    /// Present only in paused-polling mode: the next fetch waits for
    /// [`PollGate::continue_polling`]
    pub poll_gate: Option<PollGate>,
}

/// Hands checkpoint control to the downstream when auto-checkpoints are off.
/// The requested sequence number is written before the poller's next fetch.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    shard_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Checkpointer {
    pub fn set_checkpoint(&self, sequence_number: impl Into<String>) {
        let sequence_number = sequence_number.into();
        trace!(shard_id = %self.shard_id, sequence_number = %sequence_number, "Checkpoint requested");
        let _ = self.tx.send(sequence_number);
    }
}

/// Backpressure valve for paused polling
#[derive(Debug, Clone)]
pub struct PollGate {
    notify: Arc<Notify>,
}

impl PollGate {
    pub fn continue_polling(&self) {
        self.notify.notify_one();
    }
}

/// Downstream push contract: a payload slot and an error slot
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn records(&self, delivery: RecordsDelivery);

    /// Fatal poller errors land here; the poller then stays idle until the
    /// lease is reconciled away or the process restarts.
    async fn fault(&self, error: ConsumerError) {
        error!(error = %error, "Shard poller fault");
    }
}

/// Record decoding contract. Deaggregation, JSON parsing, and large-object
/// resolution live behind this seam.
#[async_trait]
pub trait RecordDecoder: Send + Sync {
    async fn decode(&self, records: Vec<Record>) -> Result<Vec<StreamRecord>>;
}

/// Pass-through decoder with optional JSON parsing
#[derive(Debug, Clone, Default)]
pub struct DefaultDecoder {
    parse_json: Option<bool>,
}

impl DefaultDecoder {
    /// `None` parses opportunistically: payloads that are valid JSON carry
    /// their parsed form, everything else passes through as bytes.
    pub fn new(parse_json: Option<bool>) -> Self {
        Self { parse_json }
    }
}

#[async_trait]
impl RecordDecoder for DefaultDecoder {
    async fn decode(&self, records: Vec<Record>) -> Result<Vec<StreamRecord>> {
        records
            .into_iter()
            .map(|record| {
                let data = record.data().as_ref().to_vec();
                let json = match self.parse_json {
                    Some(false) => None,
                    Some(true) => Some(serde_json::from_slice(&data).map_err(|e| {
                        ConsumerError::Decode(format!(
                            "record {} is not valid JSON: {}",
                            record.sequence_number(),
                            e
                        ))
                    })?),
                    None => serde_json::from_slice(&data).ok(),
                };
                Ok(StreamRecord {
                    sequence_number: record.sequence_number().to_string(),
                    partition_key: record.partition_key().to_string(),
                    data,
                    json,
                    approximate_arrival_timestamp: record
                        .approximate_arrival_timestamp()
                        .and_then(|ts| ts.to_chrono_utc().ok()),
                })
            })
            .collect()
    }
}

/// Pacing outcome of one poll
#[derive(Debug, PartialEq)]
enum PollPacing {
    /// Records were delivered; pace by `poll_delay` (or the poll gate)
    Delivered,
    /// Caught up with nothing to read; pace by `no_records_poll_delay`
    Idle,
    /// Behind, or the iterator was refreshed; poll again immediately
    Immediate,
    /// End of shard or lease expiry; the poller is done
    Finished,
}

pub struct ShardPoller<K, C, S> {
    shard_id: String,
    config: Arc<ConsumerConfig>,
    store: Arc<StateStore<K>>,
    client: Arc<C>,
    sink: Arc<S>,
    decoder: Arc<dyn RecordDecoder>,
    events: EventSender,
    checkpoint: Option<String>,
    iterator: Option<String>,
    lease_expiration: watch::Receiver<Option<DateTime<Utc>>>,
    checkpointer: Checkpointer,
    checkpoint_rx: mpsc::UnboundedReceiver<String>,
    gate: Arc<Notify>,
    /// Sequence stashed for writing before the next fetch (paused-mode
    /// auto-checkpoints and downstream checkpoint requests)
    pending_checkpoint: Option<String>,
}

impl<K, C, S> ShardPoller<K, C, S>
where
    K: KvClient + 'static,
    C: KinesisClientTrait + 'static,
    S: RecordSink + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shard_id: String,
        config: Arc<ConsumerConfig>,
        store: Arc<StateStore<K>>,
        client: Arc<C>,
        sink: Arc<S>,
        decoder: Arc<dyn RecordDecoder>,
        events: EventSender,
        owned: &OwnedShard,
        lease_expiration: watch::Receiver<Option<DateTime<Utc>>>,
    ) -> Self {
        let (tx, checkpoint_rx) = mpsc::unbounded_channel();
        let checkpointer = Checkpointer {
            shard_id: shard_id.clone(),
            tx,
        };
        Self {
            shard_id,
            config,
            store,
            client,
            sink,
            decoder,
            events,
            checkpoint: owned.checkpoint.clone(),
            iterator: None,
            lease_expiration,
            checkpointer,
            checkpoint_rx,
            gate: Arc::new(Notify::new()),
            pending_checkpoint: None,
        }
    }

    /// Drives the shard until end-of-shard, lease expiry, or stop. A stop
    /// signal cancels the next timer only; an in-flight fetch runs to
    /// completion and its result is discarded.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(shard_id = %self.shard_id, "Shard poller starting");
        self.events
            .send(CoordinationEvent::poller_started(&self.shard_id))
            .await;

        loop {
            if *stop.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(PollPacing::Delivered) => {
                    if self.config.use_paused_polling {
                        tokio::select! {
                            _ = self.gate.notified() => {}
                            _ = stop.changed() => {}
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.poll_delay) => {}
                            _ = stop.changed() => {}
                        }
                    }
                }
                Ok(PollPacing::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.no_records_poll_delay) => {}
                        _ = stop.changed() => {}
                    }
                }
                Ok(PollPacing::Immediate) => {}
                Ok(PollPacing::Finished) => break,
                Err(e) if e.is_fatal() => {
                    error!(shard_id = %self.shard_id, error = %e, "Fatal poller error");
                    self.sink.fault(e).await;
                    // Stay idle until reconciliation stops this poller
                    while !*stop.borrow() {
                        if stop.changed().await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                Err(e) => {
                    warn!(shard_id = %self.shard_id, error = %e, "Poll failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_delay) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
        }

        self.events
            .send(CoordinationEvent::poller_stopped(&self.shard_id))
            .await;
        info!(shard_id = %self.shard_id, "Shard poller stopped");
    }

    async fn poll_once(&mut self) -> Result<PollPacing> {
        let expiration = *self.lease_expiration.borrow();
        if expiration.map_or(true, |e| Utc::now() > e) {
            info!(shard_id = %self.shard_id, "Lease expired, stopping poller");
            return Ok(PollPacing::Finished);
        }

        // Downstream checkpoint requests and paused-mode stashes are written
        // before fetching: the previous batch is durable before we advance.
        while let Ok(sequence) = self.checkpoint_rx.try_recv() {
            self.pending_checkpoint = Some(sequence);
        }
        if let Some(sequence) = self.pending_checkpoint.take() {
            if let Err(e) = self.write_checkpoint(&sequence).await {
                self.pending_checkpoint = Some(sequence);
                return Err(e);
            }
        }

        if self.iterator.is_none() {
            self.iterator = Some(self.acquire_iterator().await?);
        }
        let iterator = self.iterator.clone().expect("iterator acquired above");

        let page = match self.client.get_records(&iterator, self.config.limit).await {
            Ok(page) => page,
            Err(StreamClientError::ExpiredIterator) => {
                warn!(shard_id = %self.shard_id, "Iterator expired, reacquiring");
                self.events
                    .send(CoordinationEvent::iterator_expired(&self.shard_id))
                    .await;
                self.iterator = None;
                return Ok(PollPacing::Immediate);
            }
            Err(e) => return Err(e.into()),
        };
        self.iterator = page.next_iterator.clone();

        if page.records.is_empty() {
            if page.next_iterator.is_none() {
                return self.handle_end_of_shard().await;
            }
            return Ok(if page.millis_behind_latest <= 0 {
                PollPacing::Idle
            } else {
                PollPacing::Immediate
            });
        }

        let records = self.decoder.decode(page.records).await?;
        // A decoder may legitimately drain a batch (e.g. filtering
        // aggregates); nothing to deliver or checkpoint then
        let Some(last_sequence) = records.last().map(|r| r.sequence_number.clone()) else {
            return Ok(PollPacing::Delivered);
        };

        let delivery = RecordsDelivery {
            stream_name: self.config.stream_name.clone(),
            shard_id: self.shard_id.clone(),
            records,
            millis_behind_latest: page.millis_behind_latest,
            checkpointer: (!self.config.use_auto_checkpoints)
                .then(|| self.checkpointer.clone()),
            poll_gate: self.config.use_paused_polling.then(|| PollGate {
                notify: self.gate.clone(),
            }),
        };
        self.sink.records(delivery).await;

        if self.config.use_auto_checkpoints {
            if self.config.use_paused_polling {
                // Written before the next fetch, which only happens once the
                // downstream has released the gate
                self.pending_checkpoint = Some(last_sequence);
            } else {
                self.write_checkpoint(&last_sequence).await?;
            }
        }

        Ok(PollPacing::Delivered)
    }

    async fn handle_end_of_shard(&mut self) -> Result<PollPacing> {
        info!(shard_id = %self.shard_id, "End of shard reached");
        let listing = self.client.list_shards(&self.config.stream_name).await?;
        let lineage = build_lineage(&listing);
        self.store
            .mark_shard_as_depleted(&lineage, &self.shard_id)
            .await?;
        self.events
            .send(CoordinationEvent::shard_depleted(&self.shard_id))
            .await;
        Ok(PollPacing::Finished)
    }

    async fn acquire_iterator(&mut self) -> Result<String> {
        if let Some(checkpoint) = self.checkpoint.clone() {
            match self
                .client
                .get_shard_iterator(
                    &self.config.stream_name,
                    &self.shard_id,
                    ShardIteratorType::AfterSequenceNumber,
                    Some(&checkpoint),
                )
                .await
            {
                Ok(iterator) => {
                    self.events
                        .send(CoordinationEvent::iterator_renewed(&self.shard_id))
                        .await;
                    return Ok(iterator);
                }
                Err(StreamClientError::InvalidArgument(msg)) => {
                    warn!(
                        shard_id = %self.shard_id,
                        checkpoint = %checkpoint,
                        error = %msg,
                        "Checkpoint rejected, falling back to initial position"
                    );
                }
                Err(e) => {
                    return Err(ConsumerError::GetIteratorFailed {
                        shard_id: self.shard_id.clone(),
                        message: e.to_string(),
                    })
                }
            }
        }

        let iterator_type = match self.config.initial_position {
            InitialPosition::Latest => ShardIteratorType::Latest,
            InitialPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
        };
        let iterator = self
            .client
            .get_shard_iterator(&self.config.stream_name, &self.shard_id, iterator_type, None)
            .await
            .map_err(|e| ConsumerError::GetIteratorFailed {
                shard_id: self.shard_id.clone(),
                message: e.to_string(),
            })?;
        self.events
            .send(CoordinationEvent::iterator_renewed(&self.shard_id))
            .await;
        Ok(iterator)
    }

    async fn write_checkpoint(&mut self, sequence_number: &str) -> Result<()> {
        match self
            .store
            .store_shard_checkpoint(&self.shard_id, sequence_number)
            .await
        {
            Ok(()) => {
                debug!(
                    shard_id = %self.shard_id,
                    sequence_number = %sequence_number,
                    "Checkpoint stored"
                );
                self.checkpoint = Some(sequence_number.to_string());
                self.events
                    .send(CoordinationEvent::checkpoint_saved(
                        &self.shard_id,
                        sequence_number,
                    ))
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    shard_id = %self.shard_id,
                    sequence_number = %sequence_number,
                    error = %e,
                    "Failed to store checkpoint"
                );
                self.events
                    .send(CoordinationEvent::checkpoint_failed(
                        &self.shard_id,
                        sequence_number,
                        e.to_string(),
                    ))
                    .await;
                Err(e)
            }
        }
    }
}

struct PollerHandle {
    stop: watch::Sender<bool>,
    lease_expiration: watch::Sender<Option<DateTime<Utc>>>,
    join: JoinHandle<()>,
}

/// Owns the shard pollers and keeps them aligned with the owned-lease set
pub struct ConsumersManager<K, C, S> {
    config: Arc<ConsumerConfig>,
    store: Arc<StateStore<K>>,
    client: Arc<C>,
    sink: Arc<S>,
    decoder: Arc<dyn RecordDecoder>,
    events: EventSender,
    pollers: HashMap<String, PollerHandle>,
}

impl<K, C, S> ConsumersManager<K, C, S>
where
    K: KvClient + 'static,
    C: KinesisClientTrait + 'static,
    S: RecordSink + 'static,
{
    pub(crate) fn new(
        config: Arc<ConsumerConfig>,
        store: Arc<StateStore<K>>,
        client: Arc<C>,
        sink: Arc<S>,
        decoder: Arc<dyn RecordDecoder>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            store,
            client,
            sink,
            decoder,
            events,
            pollers: HashMap::new(),
        }
    }

    pub(crate) fn set_decoder(&mut self, decoder: Arc<dyn RecordDecoder>) {
        self.decoder = decoder;
    }

    pub fn active_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.pollers.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// Aligns running pollers with the owned set: retires pollers whose
    /// lease is gone, refreshes lease expirations on survivors, spawns
    /// pollers for new leases.
    pub async fn reconcile(&mut self, owned: &BTreeMap<String, OwnedShard>) {
        let gone: Vec<String> = self
            .pollers
            .keys()
            .filter(|id| !owned.contains_key(*id))
            .cloned()
            .collect();
        for shard_id in gone {
            debug!(shard_id = %shard_id, "Lease gone, retiring poller");
            self.events
                .send(CoordinationEvent::lease_lost(&shard_id))
                .await;
            self.stop_poller(&shard_id).await;
        }

        for (shard_id, shard) in owned {
            match self.pollers.get(shard_id) {
                Some(handle) => {
                    // Renewal pushed into the running poller
                    let _ = handle.lease_expiration.send(shard.lease_expiration);
                }
                None => self.spawn_poller(shard_id, shard),
            }
        }
    }

    fn spawn_poller(&mut self, shard_id: &str, owned: &OwnedShard) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (lease_tx, lease_rx) = watch::channel(owned.lease_expiration);

        let poller = ShardPoller::new(
            shard_id.to_string(),
            self.config.clone(),
            self.store.clone(),
            self.client.clone(),
            self.sink.clone(),
            self.decoder.clone(),
            self.events.clone(),
            owned,
            lease_rx,
        );
        let join = tokio::spawn(poller.run(stop_rx));

        self.pollers.insert(
            shard_id.to_string(),
            PollerHandle {
                stop: stop_tx,
                lease_expiration: lease_tx,
                join,
            },
        );
    }

    async fn stop_poller(&mut self, shard_id: &str) {
        if let Some(handle) = self.pollers.remove(shard_id) {
            let _ = handle.stop.send(true);
            if let Err(e) = handle.join.await {
                warn!(shard_id = %shard_id, error = %e, "Poller task failed");
            }
        }
    }

    pub async fn stop_all(&mut self) {
        let shard_ids: Vec<String> = self.pollers.keys().cloned().collect();
        for shard_id in shard_ids {
            self.stop_poller(&shard_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_smithy_types::Blob;

    fn record(seq: &str, data: &[u8]) -> Record {
        Record::builder()
            .sequence_number(seq)
            .data(Blob::new(data.to_vec()))
            .partition_key("pk")
            .build()
            .expect("valid record")
    }

    #[tokio::test]
    async fn test_default_decoder_passthrough() {
        let decoder = DefaultDecoder::new(Some(false));
        let out = decoder
            .decode(vec![record("seq-1", b"{\"k\":1}")])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, "seq-1");
        assert_eq!(out[0].data, b"{\"k\":1}");
        assert!(out[0].json.is_none());
    }

    #[tokio::test]
    async fn test_default_decoder_opportunistic_json() {
        let decoder = DefaultDecoder::new(None);
        let out = decoder
            .decode(vec![record("seq-1", b"{\"k\":1}"), record("seq-2", b"raw")])
            .await
            .unwrap();
        assert_eq!(out[0].json.as_ref().unwrap()["k"], 1);
        assert!(out[1].json.is_none());
    }

    #[tokio::test]
    async fn test_default_decoder_strict_json() {
        let decoder = DefaultDecoder::new(Some(true));
        let err = decoder
            .decode(vec![record("seq-1", b"not json")])
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Decode(_)));
    }

    #[tokio::test]
    async fn test_poll_gate_releases_waiter() {
        let gate = PollGate {
            notify: Arc::new(Notify::new()),
        };
        let waiter = gate.notify.clone();
        gate.continue_polling();
        // The permit is stored, so a later wait completes immediately
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter.notified())
            .await
            .expect("gate should be open");
    }
}
