use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{InboxVersion, UserId};
use storage::Storage;
use tokio::sync::Mutex;

#[async_trait]
pub trait InboxVersionStore: Send + Sync {
    async fn inbox_version(&self, uid: UserId) -> Result<Option<InboxVersion>>;
    async fn set_inbox_version(&self, uid: UserId, version: InboxVersion) -> Result<()>;
}

#[async_trait]
impl InboxVersionStore for Storage {
    async fn inbox_version(&self, uid: UserId) -> Result<Option<InboxVersion>> {
        self.load_inbox_version(uid).await
    }

    async fn set_inbox_version(&self, uid: UserId, version: InboxVersion) -> Result<()> {
        self.store_inbox_version(uid, version).await
    }
}

#[derive(Default)]
pub struct MemoryInboxVersionStore {
    versions: Mutex<HashMap<UserId, InboxVersion>>,
}

impl MemoryInboxVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_versions(versions: impl IntoIterator<Item = (UserId, InboxVersion)>) -> Self {
        Self {
            versions: Mutex::new(versions.into_iter().collect()),
        }
    }
}

#[async_trait]
impl InboxVersionStore for MemoryInboxVersionStore {
    async fn inbox_version(&self, uid: UserId) -> Result<Option<InboxVersion>> {
        Ok(self.versions.lock().await.get(&uid).copied())
    }

    async fn set_inbox_version(&self, uid: UserId, version: InboxVersion) -> Result<()> {
        let mut versions = self.versions.lock().await;
        let current = versions.entry(uid).or_default();
        if version > *current {
            *current = version;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct FailingInboxVersionStore;

#[cfg(test)]
#[async_trait]
impl InboxVersionStore for FailingInboxVersionStore {
    async fn inbox_version(&self, _uid: UserId) -> Result<Option<InboxVersion>> {
        Err(anyhow::anyhow!("inbox version store unavailable"))
    }

    async fn set_inbox_version(&self, _uid: UserId, _version: InboxVersion) -> Result<()> {
        Err(anyhow::anyhow!("inbox version store unavailable"))
    }
}
