//! In-process remote store with fault injection, for tests and offline runs.

use super::{RemoteObject, RemoteStore};
use crate::{Result, VaultError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Failure injected into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFault {
    NotFound,
    Auth,
    Network,
}

impl RemoteFault {
    fn into_error(self, what: &str) -> VaultError {
        match self {
            RemoteFault::NotFound => VaultError::RemoteNotFound(format!("{} (injected)", what)),
            RemoteFault::Auth => VaultError::RemoteAuth(format!("{} (injected)", what)),
            RemoteFault::Network => VaultError::Network(format!("{} (injected)", what)),
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, RemoteObject>,
    clock: Option<DateTime<Utc>>,
    next_id: u64,
    offline: bool,
    update_faults: VecDeque<RemoteFault>,
    create_faults: VecDeque<RemoteFault>,
    creates: usize,
    updates: usize,
    lists: usize,
    gets: usize,
}

impl State {
    /// Synthetic clock: one second per write, so timestamps always change.
    fn tick(&mut self) -> DateTime<Utc> {
        let next = match self.clock {
            Some(t) => t + Duration::seconds(1),
            None => Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        };
        self.clock = Some(next);
        next
    }

    fn check_online(&self, what: &str) -> Result<()> {
        if self.offline {
            return Err(RemoteFault::Network.into_error(what));
        }
        Ok(())
    }
}

/// A [`RemoteStore`] that keeps objects in memory.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call fail with a network error until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn fail_next_update(&self, fault: RemoteFault) {
        self.lock().update_faults.push_back(fault);
    }

    pub fn fail_next_create(&self, fault: RemoteFault) {
        self.lock().create_faults.push_back(fault);
    }

    /// Delete an object behind the client's back.
    pub fn remove_object(&self, id: &str) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    /// Write a file directly, as another device would. Returns the object id.
    pub fn put_file(&self, id: Option<&str>, filename: &str, content: &str) -> String {
        let mut state = self.lock();
        let now = state.tick();
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                state.next_id += 1;
                format!("mem-{}", state.next_id)
            }
        };
        let object = state.objects.entry(id.clone()).or_insert_with(|| RemoteObject {
            id: id.clone(),
            updated_at: now,
            description: String::new(),
            files: BTreeMap::new(),
        });
        object.updated_at = now;
        object.files.insert(filename.to_string(), Some(content.to_string()));
        id
    }

    pub fn object(&self, id: &str) -> Option<RemoteObject> {
        self.lock().objects.get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn create_calls(&self) -> usize {
        self.lock().creates
    }

    pub fn update_calls(&self) -> usize {
        self.lock().updates
    }

    pub fn list_calls(&self) -> usize {
        self.lock().lists
    }

    pub fn get_calls(&self) -> usize {
        self.lock().gets
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_objects(&self, page: u32, per_page: u32) -> Result<Vec<RemoteObject>> {
        let mut state = self.lock();
        state.check_online("list")?;
        state.lists += 1;

        // Newest first, like the Gist API.
        let mut all: Vec<&RemoteObject> = state.objects.values().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let skip = (page.max(1) as usize - 1) * per_page as usize;
        Ok(all
            .into_iter()
            .skip(skip)
            .take(per_page as usize)
            .map(|o| RemoteObject {
                files: o.files.keys().map(|k| (k.clone(), None)).collect(),
                ..o.clone()
            })
            .collect())
    }

    async fn get_object(&self, id: &str) -> Result<RemoteObject> {
        let mut state = self.lock();
        state.check_online("get")?;
        state.gets += 1;
        state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::RemoteNotFound(id.to_string()))
    }

    async fn create_object(
        &self,
        description: &str,
        filename: &str,
        content: &str,
    ) -> Result<RemoteObject> {
        let mut state = self.lock();
        state.check_online("create")?;
        state.creates += 1;
        if let Some(fault) = state.create_faults.pop_front() {
            return Err(fault.into_error("create"));
        }

        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let object = RemoteObject {
            id: id.clone(),
            updated_at: state.tick(),
            description: description.to_string(),
            files: BTreeMap::from([(filename.to_string(), Some(content.to_string()))]),
        };
        state.objects.insert(id, object.clone());
        Ok(object)
    }

    async fn update_object(&self, id: &str, filename: &str, content: &str) -> Result<RemoteObject> {
        let mut state = self.lock();
        state.check_online("update")?;
        state.updates += 1;
        if let Some(fault) = state.update_faults.pop_front() {
            return Err(fault.into_error("update"));
        }

        let now = state.tick();
        let object = state
            .objects
            .get_mut(id)
            .ok_or_else(|| VaultError::RemoteNotFound(id.to_string()))?;
        object.updated_at = now;
        object
            .files
            .insert(filename.to_string(), Some(content.to_string()));
        Ok(object.clone())
    }
}
