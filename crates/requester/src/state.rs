//! In-memory table of tracked jobs.
//!
//! Owned by the result poller task; nothing else holds a reference.

use std::collections::HashMap;

use comfyrun_core::job::JobRecord;
use comfyrun_core::types::JobId;

/// Job id → lifecycle record.
#[derive(Debug, Default)]
pub struct JobState {
    jobs: HashMap<JobId, JobRecord>,
}

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `record`. Returns `false` and keeps the existing record if the
    /// id is already tracked.
    pub fn insert(&mut self, record: JobRecord) -> bool {
        if self.jobs.contains_key(&record.id) {
            return false;
        }
        self.jobs.insert(record.id.clone(), record);
        true
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.jobs.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<JobRecord> {
        self.jobs.remove(id)
    }

    /// Ids of records still waiting on the remote service.
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.ids_where(|r| !r.is_terminal())
    }

    /// Ids of records whose terminal row has not been written yet.
    pub fn terminal_ids(&self) -> Vec<JobId> {
        self.ids_where(JobRecord::is_terminal)
    }

    /// Copy of every record, oldest submission first.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.jobs.values().cloned().collect();
        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn ids_where(&self, pred: impl Fn(&JobRecord) -> bool) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|r| pred(r))
            .map(|r| r.id.clone())
            .collect()
    }
}
