//! Coordination KV client
//!
//! Thin typed wrapper over the coordination store. Conditions and update
//! expressions are structured values rather than raw expression strings:
//! [`DynamoKv`] renders them to DynamoDB expression syntax, while
//! [`MemoryKv`](memory::MemoryKv) interprets them directly against an
//! in-process document. Both give the same answer for the same mutation,
//! which is what makes the lease-protocol tests honest.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, Tag,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::KvError;
use crate::retry::{RetryConfig, RetryHandle};

/// Hash + range key of a coordination document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub consumer_group: String,
    pub stream_name: String,
}

impl DocumentKey {
    pub fn new(consumer_group: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            stream_name: stream_name.into(),
        }
    }
}

pub(crate) const HASH_KEY: &str = "consumerGroup";
pub(crate) const RANGE_KEY: &str = "streamName";

/// Attribute path into the document, one segment per nesting level.
///
/// Segments are literal names (shard ids contain characters that are not
/// valid in a bare DynamoDB expression, so rendering always goes through
/// expression attribute names).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path(Vec<String>);

impl Path {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Write predicate. Failure surfaces as [`KvError::PreconditionFailed`].
#[derive(Debug, Clone)]
pub enum Condition {
    /// The document does not exist at all
    DocumentAbsent,
    /// The attribute at the path is absent
    PathAbsent(Path),
    /// The attribute at the path is present
    PathExists(Path),
    /// The attribute at the path equals the value
    ValueEquals(Path, Value),
}

/// Structured update: assignments applied in order, then removals, all
/// guarded by one optional condition. The whole update commits atomically.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub assignments: Vec<(Path, Value)>,
    pub removals: Vec<Path>,
    pub condition: Option<Condition>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, path: Path, value: Value) -> Self {
        self.assignments.push((path, value));
        self
    }

    pub fn remove(mut self, path: Path) -> Self {
        self.removals.push(path);
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.removals.is_empty()
    }
}

/// Coordination KV contract: strongly-consistent reads, expression-guarded
/// writes, and enough table admin to bootstrap.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &DocumentKey, consistent: bool) -> Result<Option<Value>, KvError>;

    async fn put(
        &self,
        key: &DocumentKey,
        document: Value,
        condition: Option<Condition>,
    ) -> Result<(), KvError>;

    async fn update(&self, key: &DocumentKey, update: Update) -> Result<(), KvError>;

    async fn delete(&self, key: &DocumentKey, condition: Option<Condition>) -> Result<(), KvError>;

    /// Table status if the table exists
    async fn describe_table(&self) -> Result<Option<String>, KvError>;

    async fn create_table(&self) -> Result<(), KvError>;

    async fn tag_table(&self, tags: &HashMap<String, String>) -> Result<(), KvError>;

    async fn list_table_tags(&self) -> Result<HashMap<String, String>, KvError>;

    async fn wait_for_table(&self, exists: bool) -> Result<(), KvError>;
}

/// DynamoDB-backed coordination client
#[derive(Debug, Clone)]
pub struct DynamoKv {
    client: DynamoClient,
    table_name: String,
    retry_config: RetryConfig,
}

impl DynamoKv {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn key_attrs(key: &DocumentKey) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                HASH_KEY.to_string(),
                AttributeValue::S(key.consumer_group.clone()),
            ),
            (
                RANGE_KEY.to_string(),
                AttributeValue::S(key.stream_name.clone()),
            ),
        ])
    }

    async fn table_arn(&self) -> Result<String, KvError> {
        let mut retry = RetryHandle::new(self.retry_config.clone());
        let table_name = self.table_name.clone();
        let out = retry
            .retry(
                || async {
                    self.client
                        .describe_table()
                        .table_name(&table_name)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await?;
        out.table()
            .and_then(|t| t.table_arn())
            .map(String::from)
            .ok_or_else(|| KvError::Corrupt("table description without ARN".into()))
    }
}

#[async_trait]
impl KvClient for DynamoKv {
    async fn get(&self, key: &DocumentKey, consistent: bool) -> Result<Option<Value>, KvError> {
        let mut retry = RetryHandle::new(self.retry_config.clone());
        let key_attrs = Self::key_attrs(key);

        trace!(table = %self.table_name, stream = %key.stream_name, "Getting coordination document");

        let out = retry
            .retry(
                || async {
                    self.client
                        .get_item()
                        .table_name(&self.table_name)
                        .set_key(Some(key_attrs.clone()))
                        .consistent_read(consistent)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await?;

        out.item.map(|item| attrs_to_json(&item)).transpose()
    }

    async fn put(
        &self,
        key: &DocumentKey,
        document: Value,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        let mut item = json_to_attrs(&document)?;
        item.extend(Self::key_attrs(key));

        let mut expr = ExprBuilder::new();
        let condition_expr = condition.as_ref().map(|c| expr.condition(c));

        let mut retry = RetryHandle::new(self.retry_config.clone());
        retry
            .retry(
                || async {
                    self.client
                        .put_item()
                        .table_name(&self.table_name)
                        .set_item(Some(item.clone()))
                        .set_condition_expression(condition_expr.clone())
                        .set_expression_attribute_names(expr.names())
                        .set_expression_attribute_values(expr.values()?)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await?;

        debug!(table = %self.table_name, stream = %key.stream_name, "Stored coordination document");
        Ok(())
    }

    async fn update(&self, key: &DocumentKey, update: Update) -> Result<(), KvError> {
        if update.is_empty() {
            return Err(KvError::Validation("empty update".into()));
        }

        let mut expr = ExprBuilder::new();
        let update_expr = expr.update(&update);
        let condition_expr = update.condition.as_ref().map(|c| expr.condition(c));

        trace!(
            table = %self.table_name,
            stream = %key.stream_name,
            update = %update_expr,
            "Updating coordination document"
        );

        let key_attrs = Self::key_attrs(key);
        let mut retry = RetryHandle::new(self.retry_config.clone());
        retry
            .retry(
                || async {
                    self.client
                        .update_item()
                        .table_name(&self.table_name)
                        .set_key(Some(key_attrs.clone()))
                        .update_expression(&update_expr)
                        .set_condition_expression(condition_expr.clone())
                        .set_expression_attribute_names(expr.names())
                        .set_expression_attribute_values(expr.values()?)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey, condition: Option<Condition>) -> Result<(), KvError> {
        let mut expr = ExprBuilder::new();
        let condition_expr = condition.as_ref().map(|c| expr.condition(c));

        let key_attrs = Self::key_attrs(key);
        let mut retry = RetryHandle::new(self.retry_config.clone());
        retry
            .retry(
                || async {
                    self.client
                        .delete_item()
                        .table_name(&self.table_name)
                        .set_key(Some(key_attrs.clone()))
                        .set_condition_expression(condition_expr.clone())
                        .set_expression_attribute_names(expr.names())
                        .set_expression_attribute_values(expr.values()?)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await?;
        Ok(())
    }

    async fn describe_table(&self) -> Result<Option<String>, KvError> {
        let mut retry = RetryHandle::new(self.retry_config.clone());
        let result = retry
            .retry(
                || async {
                    self.client
                        .describe_table()
                        .table_name(&self.table_name)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await;

        match result {
            Ok(out) => Ok(out
                .table()
                .and_then(|t| t.table_status())
                .map(|s| s.as_str().to_string())),
            Err(KvError::TableNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_table(&self) -> Result<(), KvError> {
        let mut retry = RetryHandle::new(self.retry_config.clone());
        let result = retry
            .retry(
                || async {
                    self.client
                        .create_table()
                        .table_name(&self.table_name)
                        .attribute_definitions(
                            AttributeDefinition::builder()
                                .attribute_name(HASH_KEY)
                                .attribute_type(ScalarAttributeType::S)
                                .build()
                                .map_err(|e| KvError::Validation(e.to_string()))?,
                        )
                        .attribute_definitions(
                            AttributeDefinition::builder()
                                .attribute_name(RANGE_KEY)
                                .attribute_type(ScalarAttributeType::S)
                                .build()
                                .map_err(|e| KvError::Validation(e.to_string()))?,
                        )
                        .key_schema(
                            KeySchemaElement::builder()
                                .attribute_name(HASH_KEY)
                                .key_type(KeyType::Hash)
                                .build()
                                .map_err(|e| KvError::Validation(e.to_string()))?,
                        )
                        .key_schema(
                            KeySchemaElement::builder()
                                .attribute_name(RANGE_KEY)
                                .key_type(KeyType::Range)
                                .build()
                                .map_err(|e| KvError::Validation(e.to_string()))?,
                        )
                        .billing_mode(BillingMode::PayPerRequest)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            // Another consumer is creating the same table
            Err(KvError::ResourceInUse(_)) => {
                debug!(table = %self.table_name, "Table already being created");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn tag_table(&self, tags: &HashMap<String, String>) -> Result<(), KvError> {
        if tags.is_empty() {
            return Ok(());
        }
        let arn = self.table_arn().await?;
        let sdk_tags = tags
            .iter()
            .map(|(k, v)| {
                Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| KvError::Validation(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut retry = RetryHandle::new(self.retry_config.clone());
        retry
            .retry(
                || async {
                    self.client
                        .tag_resource()
                        .resource_arn(&arn)
                        .set_tags(Some(sdk_tags.clone()))
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await
    }

    async fn list_table_tags(&self) -> Result<HashMap<String, String>, KvError> {
        let arn = self.table_arn().await?;
        let mut retry = RetryHandle::new(self.retry_config.clone());
        let result = retry
            .retry(
                || async {
                    self.client
                        .list_tags_of_resource()
                        .resource_arn(&arn)
                        .send()
                        .await
                        .map_err(kv_err_from_sdk)
                },
                KvError::is_retriable,
            )
            .await;

        match result {
            Ok(out) => Ok(out
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect()),
            // Missing tag set maps to empty, not an error
            Err(KvError::TableNotFound(_)) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_table(&self, exists: bool) -> Result<(), KvError> {
        const POLL_INTERVAL: Duration = Duration::from_secs(1);
        const MAX_POLLS: u32 = 180;

        for _ in 0..MAX_POLLS {
            let status = self.describe_table().await?;
            let done = if exists {
                matches!(status.as_deref(), Some("ACTIVE"))
            } else {
                status.is_none()
            };
            if done {
                return Ok(());
            }
            trace!(table = %self.table_name, status = ?status, "Waiting for table state");
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        warn!(table = %self.table_name, exists, "Gave up waiting for table state");
        Err(KvError::WaitTimeout(self.table_name.clone()))
    }
}

/// Accumulates expression attribute names/values while rendering structured
/// conditions and updates into DynamoDB expression strings.
struct ExprBuilder {
    names: HashMap<String, String>,
    values: Vec<(String, Value)>,
}

impl ExprBuilder {
    fn new() -> Self {
        Self {
            names: HashMap::new(),
            values: Vec::new(),
        }
    }

    fn name(&mut self, segment: &str) -> String {
        if let Some((alias, _)) = self.names.iter().find(|(_, s)| s.as_str() == segment) {
            return alias.clone();
        }
        let alias = format!("#n{}", self.names.len());
        self.names.insert(alias.clone(), segment.to_string());
        alias
    }

    fn path(&mut self, path: &Path) -> String {
        path.segments()
            .iter()
            .map(|s| self.name(s))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn value(&mut self, value: &Value) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.push((placeholder.clone(), value.clone()));
        placeholder
    }

    fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::DocumentAbsent => {
                let sk = self.name(RANGE_KEY);
                format!("attribute_not_exists({})", sk)
            }
            Condition::PathAbsent(path) => {
                let p = self.path(path);
                format!("attribute_not_exists({})", p)
            }
            Condition::PathExists(path) => {
                let p = self.path(path);
                format!("attribute_exists({})", p)
            }
            Condition::ValueEquals(path, value) => {
                let p = self.path(path);
                let v = self.value(value);
                format!("{} = {}", p, v)
            }
        }
    }

    fn update(&mut self, update: &Update) -> String {
        let mut parts = Vec::new();
        if !update.assignments.is_empty() {
            let sets = update
                .assignments
                .iter()
                .map(|(path, value)| {
                    let p = self.path(path);
                    let v = self.value(value);
                    format!("{} = {}", p, v)
                })
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("SET {}", sets));
        }
        if !update.removals.is_empty() {
            let removes = update
                .removals
                .iter()
                .map(|path| self.path(path))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("REMOVE {}", removes));
        }
        parts.join(" ")
    }

    fn names(&self) -> Option<HashMap<String, String>> {
        if self.names.is_empty() {
            None
        } else {
            Some(self.names.clone())
        }
    }

    fn values(&self) -> Result<Option<HashMap<String, AttributeValue>>, KvError> {
        if self.values.is_empty() {
            return Ok(None);
        }
        let mut out = HashMap::new();
        for (placeholder, value) in &self.values {
            out.insert(placeholder.clone(), json_to_attr(value)?);
        }
        Ok(Some(out))
    }
}

pub(crate) fn json_to_attr(value: &Value) -> Result<AttributeValue, KvError> {
    Ok(match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(
            items
                .iter()
                .map(json_to_attr)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Object(map) => {
            let mut attrs = HashMap::new();
            for (k, v) in map {
                attrs.insert(k.clone(), json_to_attr(v)?);
            }
            AttributeValue::M(attrs)
        }
    })
}

pub(crate) fn json_to_attrs(value: &Value) -> Result<HashMap<String, AttributeValue>, KvError> {
    match json_to_attr(value)? {
        AttributeValue::M(map) => Ok(map),
        _ => Err(KvError::Validation("document must be an object".into())),
    }
}

pub(crate) fn attr_to_json(attr: &AttributeValue) -> Result<Value, KvError> {
    Ok(match attr {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => {
            let number = n
                .parse::<i64>()
                .map(Into::into)
                .or_else(|_| n.parse::<f64>().map(Value::from))
                .map_err(|_| KvError::Corrupt(format!("unparseable number: {}", n)))?;
            number
        }
        AttributeValue::L(items) => Value::Array(
            items
                .iter()
                .map(attr_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        AttributeValue::M(map) => attrs_to_json(map)?,
        other => {
            return Err(KvError::Corrupt(format!(
                "unsupported attribute kind: {:?}",
                other
            )))
        }
    })
}

pub(crate) fn attrs_to_json(attrs: &HashMap<String, AttributeValue>) -> Result<Value, KvError> {
    let mut map = serde_json::Map::new();
    for (k, v) in attrs {
        map.insert(k.clone(), attr_to_json(v)?);
    }
    Ok(Value::Object(map))
}

fn kv_err_from_sdk<E, R>(err: SdkError<E, R>) -> KvError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().code().unwrap_or("Unknown");
            let msg = ctx.err().message().unwrap_or_default().to_string();
            match code {
                "ConditionalCheckFailedException" => KvError::PreconditionFailed,
                "ResourceNotFoundException" => KvError::TableNotFound(msg),
                "ResourceInUseException" => KvError::ResourceInUse(msg),
                "ValidationException" => KvError::Validation(msg),
                "ProvisionedThroughputExceededException"
                | "ThrottlingException"
                | "RequestLimitExceeded" => KvError::Throttled(msg),
                "InternalServerError" | "ServiceUnavailable" => KvError::Connection(msg),
                _ => KvError::Service(format!("{}: {}", code, msg)),
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            KvError::Connection(format!("{:?}", err))
        }
        _ => KvError::Service(format!("{:?}", err)),
    }
}
