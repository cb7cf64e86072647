//! Typed wrapper over the Kinesis stream service
//!
//! The trait carries exactly the operations the lease manager and shard
//! pollers consume. The SDK implementation classifies service errors into
//! the crate taxonomy and retries only the retry-eligible ones, with
//! unbounded attempts and a bounded backoff interval.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_kinesis::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kinesis::types::{EncryptionType, Record, Shard, ShardIteratorType};
use aws_sdk_kinesis::Client;
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::error::StreamClientError;
use crate::retry::{RetryConfig, RetryHandle};

/// Summary of an existing stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescription {
    pub stream_arn: String,
    pub stream_status: String,
    pub stream_created_on: DateTime<Utc>,
}

/// One `GetRecords` page
#[derive(Debug, Clone, Default)]
pub struct RecordsPage {
    pub records: Vec<Record>,
    /// `None` signals end-of-shard: the shard is closed and fully read
    pub next_iterator: Option<String>,
    pub millis_behind_latest: i64,
}

/// A registered enhanced fan-out consumer
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedConsumer {
    pub consumer_name: String,
    pub consumer_arn: String,
    pub consumer_status: String,
}

#[async_trait]
pub trait KinesisClientTrait: Send + Sync {
    /// Probe for the stream. `Ok(None)` when it does not exist; the
    /// summary call falls back to the full describe on endpoints that do
    /// not support it.
    async fn check_if_stream_exists(
        &self,
        stream_name: &str,
    ) -> Result<Option<StreamDescription>, StreamClientError>;

    async fn create_stream(
        &self,
        stream_name: &str,
        shard_count: i32,
    ) -> Result<(), StreamClientError>;

    async fn add_tags_to_stream(
        &self,
        stream_name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), StreamClientError>;

    /// Missing tag set maps to an empty map
    async fn list_tags_for_stream(
        &self,
        stream_name: &str,
    ) -> Result<HashMap<String, String>, StreamClientError>;

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, StreamClientError>;

    async fn list_stream_consumers(
        &self,
        stream_arn: &str,
    ) -> Result<Vec<EnhancedConsumer>, StreamClientError>;

    /// Returns the registered consumer's ARN
    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, StreamClientError>;

    async fn deregister_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<(), StreamClientError>;

    async fn start_stream_encryption(
        &self,
        stream_name: &str,
        key_id: &str,
    ) -> Result<(), StreamClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
    ) -> Result<String, StreamClientError>;

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<RecordsPage, StreamClientError>;

    async fn wait_for_stream(
        &self,
        stream_name: &str,
        exists: bool,
    ) -> Result<(), StreamClientError>;
}

fn retry() -> RetryHandle {
    RetryHandle::new(RetryConfig::default())
}

fn stream_err_from_sdk<E, R>(err: SdkError<E, R>) -> StreamClientError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().code().unwrap_or("Unknown");
            let msg = ctx.err().message().unwrap_or_default().to_string();
            StreamClientError::from_code(code, msg)
        }
        SdkError::TimeoutError(_) => StreamClientError::Timeout(format!("{:?}", err)),
        SdkError::DispatchFailure(_) => StreamClientError::Connection(format!("{:?}", err)),
        _ => StreamClientError::Other(format!("{:?}", err)),
    }
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn check_if_stream_exists(
        &self,
        stream_name: &str,
    ) -> Result<Option<StreamDescription>, StreamClientError> {
        let summary = retry()
            .retry(
                || async {
                    self.describe_stream_summary()
                        .stream_name(stream_name)
                        .send()
                        .await
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await;

        match summary {
            Ok(out) => {
                let summary = out.stream_description_summary().ok_or_else(|| {
                    StreamClientError::Other("describe-stream-summary without body".into())
                })?;
                Ok(Some(StreamDescription {
                    stream_arn: summary.stream_arn().to_string(),
                    stream_status: summary.stream_status().as_str().to_string(),
                    stream_created_on: summary
                        .stream_creation_timestamp()
                        .to_chrono_utc()
                        .unwrap_or_default(),
                }))
            }
            Err(StreamClientError::ResourceNotFound(_)) => Ok(None),
            Err(StreamClientError::UnknownOperation(_)) => {
                debug!("describe-stream-summary unsupported, falling back to describe-stream");
                let full = retry()
                    .retry(
                        || async {
                            self.describe_stream()
                                .stream_name(stream_name)
                                .send()
                                .await
                                .map_err(stream_err_from_sdk)
                        },
                        StreamClientError::is_retriable,
                    )
                    .await;
                match full {
                    Ok(out) => {
                        let description = out.stream_description().ok_or_else(|| {
                            StreamClientError::Other("describe-stream without body".into())
                        })?;
                        Ok(Some(StreamDescription {
                            stream_arn: description.stream_arn().to_string(),
                            stream_status: description.stream_status().as_str().to_string(),
                            stream_created_on: description
                                .stream_creation_timestamp()
                                .to_chrono_utc()
                                .unwrap_or_default(),
                        }))
                    }
                    Err(StreamClientError::ResourceNotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn create_stream(
        &self,
        stream_name: &str,
        shard_count: i32,
    ) -> Result<(), StreamClientError> {
        let result = retry()
            .retry(
                || async {
                    self.create_stream()
                        .stream_name(stream_name)
                        .shard_count(shard_count)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            // Concurrent creator or the stream already exists
            Err(StreamClientError::ResourceInUse(_)) => {
                debug!(stream = %stream_name, "Stream already exists or is being created");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_tags_to_stream(
        &self,
        stream_name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), StreamClientError> {
        if tags.is_empty() {
            return Ok(());
        }
        retry()
            .retry(
                || async {
                    self.add_tags_to_stream()
                        .stream_name(stream_name)
                        .set_tags(Some(tags.clone()))
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await
    }

    async fn list_tags_for_stream(
        &self,
        stream_name: &str,
    ) -> Result<HashMap<String, String>, StreamClientError> {
        let result = retry()
            .retry(
                || async {
                    self.list_tags_for_stream()
                        .stream_name(stream_name)
                        .send()
                        .await
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await;
        match result {
            Ok(out) => Ok(out
                .tags()
                .iter()
                .map(|t| {
                    (
                        t.key().to_string(),
                        t.value().unwrap_or_default().to_string(),
                    )
                })
                .collect()),
            Err(StreamClientError::ResourceNotFound(_)) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, StreamClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let token = next_token.clone();
            let out = retry()
                .retry(
                    || async {
                        let mut req = self.list_shards();
                        // Pagination tokens encode the stream; the name may
                        // only be sent on the first page.
                        req = match &token {
                            Some(t) => req.next_token(t),
                            None => req.stream_name(stream_name),
                        };
                        req.send().await.map_err(stream_err_from_sdk)
                    },
                    StreamClientError::is_retriable,
                )
                .await?;

            shards.extend(out.shards().iter().cloned());
            next_token = out.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }

        trace!(stream = %stream_name, count = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn list_stream_consumers(
        &self,
        stream_arn: &str,
    ) -> Result<Vec<EnhancedConsumer>, StreamClientError> {
        let mut consumers = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let token = next_token.clone();
            let out = retry()
                .retry(
                    || async {
                        let mut req = self.list_stream_consumers().stream_arn(stream_arn);
                        if let Some(t) = &token {
                            req = req.next_token(t);
                        }
                        req.send().await.map_err(stream_err_from_sdk)
                    },
                    StreamClientError::is_retriable,
                )
                .await?;

            consumers.extend(out.consumers().iter().map(|c| EnhancedConsumer {
                consumer_name: c.consumer_name().to_string(),
                consumer_arn: c.consumer_arn().to_string(),
                consumer_status: c.consumer_status().as_str().to_string(),
            }));
            next_token = out.next_token().map(String::from);
            if next_token.is_none() {
                break;
            }
        }

        Ok(consumers)
    }

    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, StreamClientError> {
        let out = retry()
            .retry(
                || async {
                    self.register_stream_consumer()
                        .stream_arn(stream_arn)
                        .consumer_name(consumer_name)
                        .send()
                        .await
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await?;
        let arn = out
            .consumer()
            .map(|c| c.consumer_arn().to_string())
            .ok_or_else(|| StreamClientError::Other("register-consumer without body".into()))?;
        debug!(consumer_name = %consumer_name, arn = %arn, "Registered enhanced consumer");
        Ok(arn)
    }

    async fn deregister_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<(), StreamClientError> {
        retry()
            .retry(
                || async {
                    self.deregister_stream_consumer()
                        .stream_arn(stream_arn)
                        .consumer_name(consumer_name)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await
    }

    async fn start_stream_encryption(
        &self,
        stream_name: &str,
        key_id: &str,
    ) -> Result<(), StreamClientError> {
        let result = retry()
            .retry(
                || async {
                    self.start_stream_encryption()
                        .stream_name(stream_name)
                        .encryption_type(EncryptionType::Kms)
                        .key_id(key_id)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            // Encryption already enabled, or another consumer is mid-enable
            Err(StreamClientError::ResourceInUse(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
    ) -> Result<String, StreamClientError> {
        let out = retry()
            .retry(
                || async {
                    let mut req = self
                        .get_shard_iterator()
                        .stream_name(stream_name)
                        .shard_id(shard_id)
                        .shard_iterator_type(iterator_type.clone());
                    if let Some(seq) = sequence_number {
                        req = req.starting_sequence_number(seq);
                    }
                    req.send().await.map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await?;
        out.shard_iterator()
            .map(String::from)
            .ok_or_else(|| StreamClientError::Other("get-shard-iterator without iterator".into()))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<RecordsPage, StreamClientError> {
        let out = retry()
            .retry(
                || async {
                    self.get_records()
                        .shard_iterator(iterator)
                        .limit(limit)
                        .send()
                        .await
                        .map_err(stream_err_from_sdk)
                },
                StreamClientError::is_retriable,
            )
            .await?;

        Ok(RecordsPage {
            records: out.records().to_vec(),
            next_iterator: out.next_shard_iterator().map(String::from),
            millis_behind_latest: out.millis_behind_latest().unwrap_or(0),
        })
    }

    async fn wait_for_stream(
        &self,
        stream_name: &str,
        exists: bool,
    ) -> Result<(), StreamClientError> {
        const POLL_INTERVAL: Duration = Duration::from_secs(1);
        const MAX_POLLS: u32 = 180;

        for _ in 0..MAX_POLLS {
            let description = self.check_if_stream_exists(stream_name).await?;
            let done = if exists {
                description.is_some_and(|d| d.stream_status == "ACTIVE")
            } else {
                description.is_none()
            };
            if done {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        warn!(stream = %stream_name, exists, "Gave up waiting for stream state");
        Err(StreamClientError::WaitTimeout(stream_name.to_string()))
    }
}
