//! Scripted mock implementations of the external contracts

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_kinesis::types::{Shard, ShardIteratorType};
use tokio::sync::{Mutex, RwLock};

use crate::client::{EnhancedConsumer, KinesisClientTrait, RecordsPage, StreamDescription};
use crate::consumer::{RecordSink, RecordsDelivery};
use crate::error::{ConsumerError, StreamClientError};
use crate::test::TestUtils;

type StreamResult<T> = Result<T, StreamClientError>;

/// One recorded `get_shard_iterator` request
#[derive(Debug, Clone)]
pub struct IteratorRequest {
    pub shard_id: String,
    pub iterator_type: ShardIteratorType,
    pub sequence_number: Option<String>,
}

/// Mock Kinesis client. Responses are scripted per call with `mock_*`;
/// queues falling empty fall back to benign defaults so reconcile loops can
/// keep ticking.
#[derive(Debug, Default, Clone)]
pub struct MockKinesisClient {
    stream_responses: Arc<Mutex<VecDeque<StreamResult<Option<StreamDescription>>>>>,
    #[allow(clippy::type_complexity)]
    list_shards_responses: Arc<Mutex<VecDeque<StreamResult<Vec<Shard>>>>>,
    get_iterator_responses: Arc<Mutex<VecDeque<StreamResult<String>>>>,
    get_records_responses: Arc<Mutex<VecDeque<StreamResult<RecordsPage>>>>,
    default_shards: Arc<RwLock<Vec<Shard>>>,
    default_stream: Arc<RwLock<Option<StreamDescription>>>,
    enhanced_consumers: Arc<RwLock<Vec<EnhancedConsumer>>>,
    iterator_requests: Arc<Mutex<Vec<IteratorRequest>>>,
    iterator_request_count: Arc<AtomicUsize>,
}

impl MockKinesisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose stream probe always answers with an ACTIVE stream
    pub async fn with_stream(stream_name: &str) -> Self {
        let client = Self::default();
        *client.default_stream.write().await =
            Some(TestUtils::create_stream_description(stream_name));
        client
    }

    pub async fn mock_stream_exists(&self, response: StreamResult<Option<StreamDescription>>) {
        self.stream_responses.lock().await.push_back(response);
    }

    pub async fn mock_list_shards(&self, response: StreamResult<Vec<Shard>>) {
        self.list_shards_responses.lock().await.push_back(response);
    }

    /// Shards returned whenever the scripted queue is empty
    pub async fn set_default_shards(&self, shards: Vec<Shard>) {
        *self.default_shards.write().await = shards;
    }

    pub async fn mock_get_iterator(&self, response: StreamResult<String>) {
        self.get_iterator_responses.lock().await.push_back(response);
    }

    pub async fn mock_get_records(&self, response: StreamResult<RecordsPage>) {
        self.get_records_responses.lock().await.push_back(response);
    }

    pub async fn mock_expired_iterator(&self) {
        self.mock_get_records(Err(StreamClientError::ExpiredIterator))
            .await;
    }

    pub async fn mock_enhanced_consumer(&self, consumer: EnhancedConsumer) {
        self.enhanced_consumers.write().await.push(consumer);
    }

    pub async fn get_iterator_request_count(&self) -> usize {
        self.iterator_request_count.load(Ordering::SeqCst)
    }

    pub async fn iterator_requests(&self) -> Vec<IteratorRequest> {
        self.iterator_requests.lock().await.clone()
    }
}

#[async_trait]
impl KinesisClientTrait for MockKinesisClient {
    async fn check_if_stream_exists(
        &self,
        stream_name: &str,
    ) -> StreamResult<Option<StreamDescription>> {
        if let Some(response) = self.stream_responses.lock().await.pop_front() {
            return response;
        }
        match &*self.default_stream.read().await {
            Some(description) => Ok(Some(description.clone())),
            None => Ok(Some(TestUtils::create_stream_description(stream_name))),
        }
    }

    async fn create_stream(&self, _stream_name: &str, _shard_count: i32) -> StreamResult<()> {
        Ok(())
    }

    async fn add_tags_to_stream(
        &self,
        _stream_name: &str,
        _tags: &HashMap<String, String>,
    ) -> StreamResult<()> {
        Ok(())
    }

    async fn list_tags_for_stream(
        &self,
        _stream_name: &str,
    ) -> StreamResult<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn list_shards(&self, _stream_name: &str) -> StreamResult<Vec<Shard>> {
        match self.list_shards_responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(self.default_shards.read().await.clone()),
        }
    }

    async fn list_stream_consumers(
        &self,
        _stream_arn: &str,
    ) -> StreamResult<Vec<EnhancedConsumer>> {
        Ok(self.enhanced_consumers.read().await.clone())
    }

    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> StreamResult<String> {
        let arn = format!("{}/consumer/{}", stream_arn, consumer_name);
        self.enhanced_consumers.write().await.push(EnhancedConsumer {
            consumer_name: consumer_name.to_string(),
            consumer_arn: arn.clone(),
            consumer_status: "ACTIVE".to_string(),
        });
        Ok(arn)
    }

    async fn deregister_stream_consumer(
        &self,
        _stream_arn: &str,
        consumer_name: &str,
    ) -> StreamResult<()> {
        self.enhanced_consumers
            .write()
            .await
            .retain(|c| c.consumer_name != consumer_name);
        Ok(())
    }

    async fn start_stream_encryption(
        &self,
        _stream_name: &str,
        _key_id: &str,
    ) -> StreamResult<()> {
        Ok(())
    }

    async fn get_shard_iterator(
        &self,
        _stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
    ) -> StreamResult<String> {
        self.iterator_request_count.fetch_add(1, Ordering::SeqCst);
        self.iterator_requests.lock().await.push(IteratorRequest {
            shard_id: shard_id.to_string(),
            iterator_type,
            sequence_number: sequence_number.map(String::from),
        });
        self.get_iterator_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok("mock-iterator".to_string()))
    }

    async fn get_records(&self, _iterator: &str, _limit: i32) -> StreamResult<RecordsPage> {
        self.get_records_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| {
                Ok(RecordsPage {
                    records: vec![],
                    next_iterator: Some("mock-iterator".to_string()),
                    millis_behind_latest: 0,
                })
            })
    }

    async fn wait_for_stream(&self, _stream_name: &str, _exists: bool) -> StreamResult<()> {
        Ok(())
    }
}

/// Sink that collects every delivery and fault for assertions
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    deliveries: Arc<Mutex<Vec<RecordsDelivery>>>,
    faults: Arc<Mutex<Vec<String>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<RecordsDelivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn delivered_sequences(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .await
            .iter()
            .flat_map(|d| d.records.iter().map(|r| r.sequence_number.clone()))
            .collect()
    }

    pub async fn faults(&self) -> Vec<String> {
        self.faults.lock().await.clone()
    }

    /// Waits until at least `count` deliveries arrived
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> anyhow::Result<()> {
        let start = std::time::Instant::now();
        loop {
            if self.deliveries.lock().await.len() >= count {
                return Ok(());
            }
            if start.elapsed() > timeout {
                anyhow::bail!(
                    "Expected {} deliveries within {:?}, got {}",
                    count,
                    timeout,
                    self.deliveries.lock().await.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn records(&self, delivery: RecordsDelivery) {
        self.deliveries.lock().await.push(delivery);
    }

    async fn fault(&self, error: ConsumerError) {
        self.faults.lock().await.push(error.to_string());
    }
}
