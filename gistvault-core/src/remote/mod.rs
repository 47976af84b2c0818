//! Untrusted remote object store used as the backup backend.
//!
//! The backend is a dumb container store: objects have an id, an update
//! timestamp, a free-text description and a set of named files. There is no
//! query by filename, so callers list and filter themselves.

mod gist;
mod memory;

pub use gist::GistClient;
pub use memory::{MemoryRemote, RemoteFault};

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One remote container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub description: String,
    /// File name to content. Listings leave content as `None`.
    pub files: BTreeMap<String, Option<String>>,
}

impl RemoteObject {
    pub fn has_file(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn file_content(&self, filename: &str) -> Option<&str> {
        self.files.get(filename).and_then(|c| c.as_deref())
    }
}

/// Operations the sync orchestrator needs from the backend.
///
/// Implementations map "object does not exist" to
/// [`crate::VaultError::RemoteNotFound`], rejected credentials to
/// [`crate::VaultError::RemoteAuth`] and everything else that went wrong on
/// the wire to [`crate::VaultError::Network`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One page (1-based) of the user's objects, without file contents.
    async fn list_objects(&self, page: u32, per_page: u32) -> Result<Vec<RemoteObject>>;

    /// Fetch an object including file contents.
    async fn get_object(&self, id: &str) -> Result<RemoteObject>;

    /// Create a private object holding a single file.
    async fn create_object(
        &self,
        description: &str,
        filename: &str,
        content: &str,
    ) -> Result<RemoteObject>;

    /// Overwrite one file of an existing object.
    async fn update_object(&self, id: &str, filename: &str, content: &str) -> Result<RemoteObject>;
}
