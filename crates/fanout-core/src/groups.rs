use crate::error::CoreError;
use crate::ids::{Jid, Server};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AddressingMode {
    #[default]
    Pn,
    Lid,
}

impl AddressingMode {
    pub fn server(&self) -> Server {
        match self {
            AddressingMode::Pn => Server::User,
            AddressingMode::Lid => Server::Lid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMetadata {
    pub id: Jid,
    pub participants: Vec<Jid>,
    pub addressing_mode: AddressingMode,
}

#[async_trait]
pub trait GroupMetadataProvider: Send + Sync {
    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata, CoreError>;

    /// Cache-first lookup; `None` falls back to `group_metadata`.
    async fn cached_group_metadata(&self, _group: &Jid) -> Option<GroupMetadata> {
        None
    }
}

#[derive(Clone, Default)]
pub struct InMemoryGroupMetadata {
    groups: Arc<Mutex<HashMap<Jid, GroupMetadata>>>,
    cached: Arc<Mutex<HashMap<Jid, GroupMetadata>>>,
    fetches: Arc<Mutex<usize>>,
}

impl InMemoryGroupMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, metadata: GroupMetadata) {
        self.groups
            .lock()
            .await
            .insert(metadata.id.clone(), metadata);
    }

    pub async fn insert_cached(&self, metadata: GroupMetadata) {
        self.cached
            .lock()
            .await
            .insert(metadata.id.clone(), metadata);
    }

    pub async fn fetch_count(&self) -> usize {
        *self.fetches.lock().await
    }
}

#[async_trait]
impl GroupMetadataProvider for InMemoryGroupMetadata {
    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata, CoreError> {
        *self.fetches.lock().await += 1;
        self.groups
            .lock()
            .await
            .get(group)
            .cloned()
            .ok_or(CoreError::NotFound)
    }

    async fn cached_group_metadata(&self, group: &Jid) -> Option<GroupMetadata> {
        self.cached.lock().await.get(group).cloned()
    }
}
