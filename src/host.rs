//! Host application collaborators
//!
//! The engine never owns content. It asks an [`EntityDirectory`] for the
//! documents of local entities and hands verified inbound activities to
//! [`ActivityHandler`]s registered by activity type.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::federation::LocalEntityRef;

/// Lookup of local entities.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Federation document (JSON) of a local entity, `None` if it does
    /// not exist or is not public.
    async fn document(&self, entity: &LocalEntityRef)
    -> Result<Option<serde_json::Value>, AppError>;

    /// Local actor reference for a WebFinger username.
    async fn actor_by_username(&self, username: &str) -> Result<Option<LocalEntityRef>, AppError>;
}

/// A verified inbound activity handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundActivity {
    pub id: String,
    pub activity_type: String,
    /// Actor whose signature was verified
    pub actor: Option<String>,
    pub payload: serde_json::Value,
}

/// Host-side processing of one activity type.
///
/// An error marks the job retryable; it is attempted again with backoff.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, activity: &InboundActivity) -> Result<(), AppError>;
}

/// Handlers keyed by activity `type`
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
    fallback: Option<Arc<dyn ActivityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, activity_type: &str, handler: Arc<dyn ActivityHandler>) -> Self {
        self.handlers.insert(activity_type.to_string(), handler);
        self
    }

    /// Handler for types without a dedicated registration
    pub fn with_fallback(mut self, handler: Arc<dyn ActivityHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers
            .get(activity_type)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// In-memory directory used by the binary and tests.
#[derive(Default)]
pub struct MemoryDirectory {
    documents: RwLock<HashMap<LocalEntityRef, serde_json::Value>>,
    usernames: RwLock<HashMap<String, LocalEntityRef>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entity: LocalEntityRef, document: serde_json::Value) {
        self.documents.write().await.insert(entity, document);
    }

    /// Insert an actor reachable through WebFinger as `username`.
    pub async fn insert_actor(
        &self,
        username: &str,
        entity: LocalEntityRef,
        document: serde_json::Value,
    ) {
        self.usernames
            .write()
            .await
            .insert(username.to_string(), entity.clone());
        self.insert(entity, document).await;
    }
}

#[async_trait]
impl EntityDirectory for MemoryDirectory {
    async fn document(
        &self,
        entity: &LocalEntityRef,
    ) -> Result<Option<serde_json::Value>, AppError> {
        Ok(self.documents.read().await.get(entity).cloned())
    }

    async fn actor_by_username(&self, username: &str) -> Result<Option<LocalEntityRef>, AppError> {
        Ok(self.usernames.read().await.get(username).cloned())
    }
}

const RECENT_CAPACITY: usize = 256;

/// Logs every activity and keeps the most recent ones in memory.
#[derive(Default)]
pub struct LoggingHandler {
    recent: Mutex<VecDeque<InboundActivity>>,
}

impl LoggingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent activities, oldest first
    pub fn recent(&self) -> Vec<InboundActivity> {
        self.recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActivityHandler for LoggingHandler {
    async fn handle(&self, activity: &InboundActivity) -> Result<(), AppError> {
        tracing::info!(
            id = %activity.id,
            activity_type = %activity.activity_type,
            actor = activity.actor.as_deref().unwrap_or("-"),
            "Received activity"
        );

        let mut recent = self
            .recent
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("Activity log lock poisoned")))?;
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(activity.clone());
        Ok(())
    }
}
