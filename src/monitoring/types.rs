use std::time::SystemTime;

/// Configuration for the monitoring channel
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether events are emitted at all
    pub enabled: bool,
    /// Size of the event channel buffer
    pub channel_size: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
        }
    }
}

/// An event emitted by the coordination engine
#[derive(Debug, Clone)]
pub struct CoordinationEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Shard this event relates to, if any
    pub shard_id: Option<String>,
    pub kind: CoordinationEventKind,
}

#[derive(Debug, Clone)]
pub enum CoordinationEventKind {
    LeaseAcquired,
    LeaseRenewed,
    /// An expired or orphaned lease was taken over from another consumer
    LeaseStolen {
        previous_owner: String,
    },
    LeaseReleased,
    /// This consumer's lease was observed gone at reconcile time
    LeaseLost,
    ShardDepleted,
    CheckpointSaved {
        sequence_number: String,
    },
    CheckpointFailed {
        sequence_number: String,
        error: String,
    },
    IteratorExpired,
    IteratorRenewed,
    ConsumerRegistered,
    /// Dead peers removed from the roster by heartbeat collection
    ConsumersEvicted {
        consumer_ids: Vec<String>,
    },
    PollerStarted,
    PollerStopped,
}

impl CoordinationEvent {
    fn shard(shard_id: impl Into<String>, kind: CoordinationEventKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id: Some(shard_id.into()),
            kind,
        }
    }

    fn global(kind: CoordinationEventKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id: None,
            kind,
        }
    }

    pub fn lease_acquired(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::LeaseAcquired)
    }

    pub fn lease_renewed(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::LeaseRenewed)
    }

    pub fn lease_stolen(shard_id: impl Into<String>, previous_owner: impl Into<String>) -> Self {
        Self::shard(
            shard_id,
            CoordinationEventKind::LeaseStolen {
                previous_owner: previous_owner.into(),
            },
        )
    }

    pub fn lease_released(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::LeaseReleased)
    }

    pub fn lease_lost(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::LeaseLost)
    }

    pub fn shard_depleted(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::ShardDepleted)
    }

    pub fn checkpoint_saved(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
    ) -> Self {
        Self::shard(
            shard_id,
            CoordinationEventKind::CheckpointSaved {
                sequence_number: sequence_number.into(),
            },
        )
    }

    pub fn checkpoint_failed(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::shard(
            shard_id,
            CoordinationEventKind::CheckpointFailed {
                sequence_number: sequence_number.into(),
                error: error.into(),
            },
        )
    }

    pub fn iterator_expired(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::IteratorExpired)
    }

    pub fn iterator_renewed(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::IteratorRenewed)
    }

    pub fn consumer_registered() -> Self {
        Self::global(CoordinationEventKind::ConsumerRegistered)
    }

    pub fn consumers_evicted(consumer_ids: Vec<String>) -> Self {
        Self::global(CoordinationEventKind::ConsumersEvicted { consumer_ids })
    }

    pub fn poller_started(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::PollerStarted)
    }

    pub fn poller_stopped(shard_id: impl Into<String>) -> Self {
        Self::shard(shard_id, CoordinationEventKind::PollerStopped)
    }
}
