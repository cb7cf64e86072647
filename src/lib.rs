//! Kinesis Herd - cooperative shard leasing and polling for AWS Kinesis
//!
//! This library lets N cooperating processes share work over a dynamic set
//! of stream shards, such that every record in every shard is delivered to
//! exactly one active consumer:
//!
//! - Leases with optimistic concurrency over a DynamoDB coordination
//!   document; crashes and partitions are tolerated by lease expiry and
//!   heartbeat garbage collection
//! - Shard lineage awareness: children of a split or merge are not read
//!   until their parent is fully drained
//! - Durable, monotonic checkpoints with automatic or downstream-controlled
//!   placement
//! - Cooperative pause/resume as the backpressure mechanism
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use kinesis_herd::{
//!     ConsumerConfig, LeaseManager, RecordsDelivery, RecordSink,
//! };
//! use async_trait::async_trait;
//!
//! struct PrintSink;
//!
//! #[async_trait]
//! impl RecordSink for PrintSink {
//!     async fn records(&self, delivery: RecordsDelivery) {
//!         for record in &delivery.records {
//!             println!(
//!                 "{} {}: {} bytes",
//!                 delivery.shard_id, record.sequence_number, record.data.len()
//!             );
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> kinesis_herd::Result<()> {
//!     let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//!     let kinesis = aws_sdk_kinesis::Client::new(&aws_config);
//!     let dynamo = aws_sdk_dynamodb::Client::new(&aws_config);
//!
//!     let config = ConsumerConfig {
//!         stream_name: "orders".to_string(),
//!         consumer_group: "billing".to_string(),
//!         app_name: "billing-worker".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let kv = kinesis_herd::kv::DynamoKv::new(dynamo, config.table_name());
//!     let (manager, _events_rx) = LeaseManager::new(config, kinesis, kv, PrintSink)?;
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     manager.run(shutdown_rx).await
//! }
//! ```
//!
//! # Coordination model
//!
//! All shared state lives in one document per (consumer group, stream) pair.
//! Every contended write is a compare-and-set on a per-slot version token;
//! there is no lock service. Losers of a race observe a precondition
//! failure, treat the slot as owned, and re-evaluate on the next reconcile
//! tick.
//!
//! # Checkpoint control
//!
//! With `use_auto_checkpoints` (the default) the last delivered sequence is
//! checkpointed after each batch. With `use_paused_polling` the checkpoint
//! is deferred until the downstream releases the poll gate, so records are
//! never marked done before the consumer acknowledged the batch. Disabling
//! auto-checkpoints hands a [`Checkpointer`] to the downstream instead.

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kv;
pub mod manager;
pub mod monitoring;
pub mod retry;
pub mod shard;
pub mod store;

// Test utilities shared with integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use client::{EnhancedConsumer, KinesisClientTrait, RecordsPage, StreamDescription};
pub use config::{ConsumerConfig, ConsumerIdentity, InitialPosition};
pub use consumer::{
    Checkpointer, DefaultDecoder, PollGate, RecordDecoder, RecordSink, RecordsDelivery,
    StreamRecord,
};
pub use error::{ConsumerError, KvError, Result, StreamClientError};
pub use kv::{DynamoKv, KvClient};
pub use manager::LeaseManager;
pub use monitoring::{CoordinationEvent, CoordinationEventKind, MonitoringConfig};
pub use retry::{RetryConfig, RetryHandle};
pub use store::{document::StreamState, OwnedShard, StateStore};
