//! Consumer configuration
//!
//! Defaults follow the coordination protocol's published knobs: five-minute
//! leases renewed mid-term, twenty-second reconcile ticks, one-minute
//! heartbeat failure timeout.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{ConsumerError, Result};
use crate::monitoring::MonitoringConfig;

/// Service cap on records per `GetRecords` call
pub const MAX_GET_RECORDS_LIMIT: i32 = 10_000;

/// Where to start reading a shard with no checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Start from the newest record
    #[default]
    Latest,
    /// Start from the oldest available record
    TrimHorizon,
}

/// Configuration for a consumer process
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name of the stream to consume
    pub stream_name: String,
    /// Logical set of cooperating consumers sharing one coordination document
    pub consumer_group: String,
    /// Application name, embedded in consumer records for diagnostics
    pub app_name: String,
    /// Cooperative balancing over the global shard set; disable for
    /// standalone mode, where each consumer owns a private shard partition
    pub use_auto_shard_assignment: bool,
    /// Register an enhanced fan-out consumer and gate leasing on it
    pub use_enhanced_fan_out: bool,
    /// How long an acquired lease lasts before it must be renewed
    pub lease_term: Duration,
    /// Interval between reconcile ticks
    pub reconcile_every: Duration,
    /// Heartbeat age beyond which a peer is considered dead
    pub heartbeat_failure_timeout: Duration,
    /// Hard cap on leases held at once (auto-assignment mode only)
    pub max_active_leases: Option<usize>,
    /// Maximum records per fetch
    pub limit: i32,
    /// Delay between fetches that returned records
    pub poll_delay: Duration,
    /// Delay between fetches when caught up with no records
    pub no_records_poll_delay: Duration,
    pub initial_position: InitialPosition,
    /// Checkpoint automatically after each delivered batch
    pub use_auto_checkpoints: bool,
    /// Gate each fetch on an explicit continue-polling call
    pub use_paused_polling: bool,
    /// Run aggregated records through the deaggregation codec; `None` lets
    /// the decoder decide per record
    pub should_deaggregate: Option<bool>,
    /// Parse record payloads as JSON; `None` parses opportunistically
    pub should_parse_json: Option<bool>,
    /// Resolve large-object references through the sidecar store
    pub use_s3_for_large_items: bool,
    /// Coordination table name; defaults to `<app_name>-state`
    pub kv_table_name: Option<String>,
    /// Tags applied to the coordination table on bootstrap
    pub kv_tags: HashMap<String, String>,
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            consumer_group: String::new(),
            app_name: String::new(),
            use_auto_shard_assignment: true,
            use_enhanced_fan_out: false,
            lease_term: Duration::from_secs(300),
            reconcile_every: Duration::from_secs(20),
            heartbeat_failure_timeout: Duration::from_secs(60),
            max_active_leases: None,
            limit: MAX_GET_RECORDS_LIMIT,
            poll_delay: Duration::from_millis(250),
            no_records_poll_delay: Duration::from_millis(1000),
            initial_position: InitialPosition::Latest,
            use_auto_checkpoints: true,
            use_paused_polling: false,
            should_deaggregate: None,
            should_parse_json: None,
            use_s3_for_large_items: false,
            kv_table_name: None,
            kv_tags: HashMap::new(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.is_empty() {
            return Err(ConsumerError::Config("stream_name is required".into()));
        }
        if self.consumer_group.is_empty() {
            return Err(ConsumerError::Config("consumer_group is required".into()));
        }
        if self.app_name.is_empty() {
            return Err(ConsumerError::Config("app_name is required".into()));
        }
        if self.limit < 1 || self.limit > MAX_GET_RECORDS_LIMIT {
            return Err(ConsumerError::Config(format!(
                "limit must be between 1 and {}",
                MAX_GET_RECORDS_LIMIT
            )));
        }
        if self.lease_term < self.reconcile_every {
            return Err(ConsumerError::Config(
                "lease_term must be at least reconcile_every, or leases expire between ticks"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Table the coordination document lives in
    pub fn table_name(&self) -> String {
        self.kv_table_name
            .clone()
            .unwrap_or_else(|| format!("{}-state", self.app_name))
    }

    /// Leases are renewed once less than half the term remains
    pub fn renew_threshold(&self) -> Duration {
        self.lease_term / 2
    }
}

/// Process-wide identity captured at startup. Host and pid are embedded in
/// consumer records for diagnostics only; they participate in no invariant.
#[derive(Debug, Clone)]
pub struct ConsumerIdentity {
    pub consumer_id: String,
    pub app_name: String,
    pub host: String,
    pub pid: u32,
}

impl ConsumerIdentity {
    pub fn capture(app_name: impl Into<String>) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        Self {
            consumer_id: format!("{}:{}:{}", host, pid, Uuid::new_v4()),
            app_name: app_name.into(),
            host,
            pid,
        }
    }
}
