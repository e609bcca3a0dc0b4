//! Job lists and the service-level list registry

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::uws::job::JobHandle;
use crate::uws::UwsError;

/// Named, insertion-ordered collection of jobs
///
/// One writer at a time, many concurrent readers; per-job mutation goes
/// through the phase manager, never through the list.
pub struct JobList {
    name: String,
    inner: RwLock<ListInner>,
}

struct ListInner {
    jobs: HashMap<String, Arc<JobHandle>>,
    order: Vec<String>,
}

impl JobList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(ListInner {
                jobs: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a job; collides ids fail with `DuplicateId`
    pub async fn add(&self, job: Arc<JobHandle>) -> Result<(), UwsError> {
        let mut inner = self.inner.write().await;
        let id = job.id().to_string();
        if inner.jobs.contains_key(&id) {
            return Err(UwsError::DuplicateId(id));
        }
        inner.order.push(id.clone());
        inner.jobs.insert(id, job);
        Ok(())
    }

    /// Fetch a job regardless of ownership
    pub async fn get(&self, id: &str) -> Option<Arc<JobHandle>> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    /// Fetch a job the caller is allowed to see
    ///
    /// Anonymous jobs are visible to everyone; owned jobs only to their
    /// owner.
    pub async fn get_visible(
        &self,
        id: &str,
        caller: Option<&str>,
    ) -> Result<Arc<JobHandle>, UwsError> {
        let handle = self
            .inner
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| UwsError::JobNotFound(id.to_string()))?;

        let owner = handle.read().await.owner.clone();
        match owner {
            None => Ok(handle),
            Some(ref o) if caller == Some(o.as_str()) => Ok(handle),
            Some(_) => Err(UwsError::NotOwner(id.to_string())),
        }
    }

    /// Unlink a job; the caller is responsible for destroying it
    pub async fn remove(&self, id: &str) -> Option<Arc<JobHandle>> {
        let mut inner = self.inner.write().await;
        let handle = inner.jobs.remove(id)?;
        inner.order.retain(|existing| existing != id);
        Some(handle)
    }

    /// Jobs visible to the caller, in insertion order
    pub async fn iterate(&self, caller: Option<&str>) -> Vec<Arc<JobHandle>> {
        let inner = self.inner.read().await;
        let mut visible = Vec::new();
        for id in &inner.order {
            if let Some(handle) = inner.jobs.get(id) {
                let owner = handle.read().await.owner.clone();
                let allowed = match owner {
                    None => true,
                    Some(ref o) => caller == Some(o.as_str()),
                };
                if allowed {
                    visible.push(handle.clone());
                }
            }
        }
        visible
    }

    /// Every job in the list, in insertion order
    pub async fn all(&self) -> Vec<Arc<JobHandle>> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Distinct owners present in the list (None for anonymous)
    pub async fn owners(&self) -> Vec<Option<String>> {
        let inner = self.inner.read().await;
        let mut owners = Vec::new();
        for handle in inner.jobs.values() {
            let owner = handle.read().await.owner.clone();
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        owners
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}

/// Registry of job lists by name
///
/// The service holds exactly one; jobs refer back to their list by name
/// and look collaborators up here instead of holding pointers.
pub struct JobStore {
    lists: DashMap<String, Arc<JobList>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            lists: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<JobList> {
        self.lists
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(JobList::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobList>> {
        self.lists.get(name).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.lists.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}
