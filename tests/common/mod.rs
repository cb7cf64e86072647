#![allow(dead_code)]

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use kinesis_herd::kv::memory::MemoryKv;
use kinesis_herd::kv::DocumentKey;
use kinesis_herd::{ConsumerConfig, InitialPosition, StreamState};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("kinesis_herd=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const STREAM: &str = "test-stream";
pub const GROUP: &str = "test-group";

/// Fast-ticking configuration for tests
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        stream_name: STREAM.to_string(),
        consumer_group: GROUP.to_string(),
        app_name: "test-app".to_string(),
        lease_term: Duration::from_secs(300),
        reconcile_every: Duration::from_millis(50),
        heartbeat_failure_timeout: Duration::from_secs(60),
        limit: 100,
        poll_delay: Duration::from_millis(10),
        no_records_poll_delay: Duration::from_millis(20),
        initial_position: InitialPosition::TrimHorizon,
        ..Default::default()
    }
}

pub fn doc_key() -> DocumentKey {
    DocumentKey::new(GROUP, STREAM)
}

/// Reads the coordination document back as a typed state
pub async fn read_state(kv: &MemoryKv) -> StreamState {
    let value = kv
        .document(&doc_key())
        .await
        .expect("coordination document should exist");
    serde_json::from_value(value).expect("document should deserialize")
}

/// Polls a condition until it holds or the timeout elapses
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    loop {
        if check().await {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
