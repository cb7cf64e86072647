//! In-memory coordination store
//!
//! Interprets the same structured conditions and updates as the DynamoDB
//! client against an in-process document map, with the check-and-mutate
//! held under one write lock. Useful as a stand-in during development and
//! as the concurrency harness for the lease-protocol tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::KvError;
use crate::kv::{Condition, DocumentKey, KvClient, Path, Update};

#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    documents: Arc<RwLock<HashMap<DocumentKey, Value>>>,
    tags: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        debug!("Initializing in-memory coordination store");
        Self::default()
    }

    /// Snapshot of a stored document, for assertions
    pub async fn document(&self, key: &DocumentKey) -> Option<Value> {
        self.documents.read().await.get(key).cloned()
    }
}

fn resolve<'a>(document: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn check(document: Option<&Value>, condition: &Condition) -> bool {
    match condition {
        Condition::DocumentAbsent => document.is_none(),
        Condition::PathAbsent(path) => document.map_or(true, |d| resolve(d, path).is_none()),
        Condition::PathExists(path) => document.is_some_and(|d| resolve(d, path).is_some()),
        Condition::ValueEquals(path, expected) => {
            document.is_some_and(|d| resolve(d, path) == Some(expected))
        }
    }
}

fn parent_object<'a>(
    document: &'a mut Value,
    path: &Path,
) -> Result<(&'a mut serde_json::Map<String, Value>, String), KvError> {
    let (last, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| KvError::Validation("empty attribute path".into()))?;

    let mut current = document;
    for segment in parents {
        current = current
            .as_object_mut()
            .and_then(|o| o.get_mut(segment))
            .ok_or_else(|| KvError::Validation(format!("invalid document path: {}", path)))?;
    }
    current
        .as_object_mut()
        .map(|o| (o, last.clone()))
        .ok_or_else(|| KvError::Validation(format!("invalid document path: {}", path)))
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &DocumentKey, _consistent: bool) -> Result<Option<Value>, KvError> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn put(
        &self,
        key: &DocumentKey,
        document: Value,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        if !document.is_object() {
            return Err(KvError::Validation("document must be an object".into()));
        }
        let mut documents = self.documents.write().await;
        if let Some(condition) = &condition {
            if !check(documents.get(key), condition) {
                return Err(KvError::PreconditionFailed);
            }
        }
        trace!(stream = %key.stream_name, "Stored document");
        documents.insert(key.clone(), document);
        Ok(())
    }

    async fn update(&self, key: &DocumentKey, update: Update) -> Result<(), KvError> {
        if update.is_empty() {
            return Err(KvError::Validation("empty update".into()));
        }
        let mut documents = self.documents.write().await;
        let current = documents.get(key);
        if let Some(condition) = &update.condition {
            if !check(current, condition) {
                return Err(KvError::PreconditionFailed);
            }
        }

        // Apply against a scratch copy so a mid-update validation failure
        // leaves the stored document untouched.
        let mut draft = current.cloned().unwrap_or_else(|| Value::Object(Default::default()));
        for (path, value) in &update.assignments {
            let (parent, last) = parent_object(&mut draft, path)?;
            parent.insert(last, value.clone());
        }
        for path in &update.removals {
            let (parent, last) = parent_object(&mut draft, path)?;
            parent.remove(&last);
        }
        documents.insert(key.clone(), draft);
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey, condition: Option<Condition>) -> Result<(), KvError> {
        let mut documents = self.documents.write().await;
        if let Some(condition) = &condition {
            if !check(documents.get(key), condition) {
                return Err(KvError::PreconditionFailed);
            }
        }
        documents.remove(key);
        Ok(())
    }

    async fn describe_table(&self) -> Result<Option<String>, KvError> {
        Ok(Some("ACTIVE".to_string()))
    }

    async fn create_table(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn tag_table(&self, tags: &HashMap<String, String>) -> Result<(), KvError> {
        self.tags.write().await.extend(tags.clone());
        Ok(())
    }

    async fn list_table_tags(&self) -> Result<HashMap<String, String>, KvError> {
        Ok(self.tags.read().await.clone())
    }

    async fn wait_for_table(&self, _exists: bool) -> Result<(), KvError> {
        Ok(())
    }
}
