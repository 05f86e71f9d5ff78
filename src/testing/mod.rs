//! Scripted test doubles for the manager boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::{
    EventWatch, InstanceConnector, JobEvent, JobId, JobManager, JobRecord, ListFilter,
    SubmitOptions,
};
use crate::error::{Error, Result};
use crate::jobspec::Jobspec;

enum SubmitOutcome {
    Accept,
    Reject(String),
}

/// An in-process manager with scripted behavior.
///
/// Submissions are accepted with sequential ids starting at 1 unless a
/// rejection has been scripted. Event watches replay the log scripted for
/// `(id, eventlog)` and then end, which is exactly the shape the remote
/// protocol produces.
#[derive(Default)]
pub struct MockManager {
    next_id: AtomicU64,
    outcomes: Mutex<VecDeque<SubmitOutcome>>,
    logs: Mutex<HashMap<(JobId, String), Vec<JobEvent>>>,
    submitted: Mutex<Vec<(Jobspec, SubmitOptions)>>,
    records: Mutex<Vec<JobRecord>>,
    fail_list: Mutex<Option<String>>,
}

impl MockManager {
    pub fn new() -> MockManager {
        MockManager::default()
    }

    /// Script the next submission to be rejected with `message`.
    pub fn script_reject(&self, message: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(SubmitOutcome::Reject(message.to_string()));
    }

    /// Script the next submission to be accepted (the default when no
    /// outcome is queued).
    pub fn script_accept(&self) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(SubmitOutcome::Accept);
    }

    /// Script the event log replayed for a watch on `(id, eventlog)`.
    pub fn script_log(&self, id: JobId, eventlog: &str, events: Vec<JobEvent>) {
        self.logs
            .lock()
            .unwrap()
            .insert((id, eventlog.to_string()), events);
    }

    /// Script the records returned by `list`.
    pub fn set_records(&self, records: Vec<JobRecord>) {
        *self.records.lock().unwrap() = records;
    }

    /// Make every `list` call fail with `message`.
    pub fn fail_lists(&self, message: &str) {
        *self.fail_list.lock().unwrap() = Some(message.to_string());
    }

    /// Everything submitted so far, in acceptance order.
    pub fn submissions(&self) -> Vec<(Jobspec, SubmitOptions)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobManager for MockManager {
    async fn submit(&self, spec: &Jobspec, options: SubmitOptions) -> Result<JobId> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubmitOutcome::Accept);
        match outcome {
            SubmitOutcome::Accept => {
                self.submitted
                    .lock()
                    .unwrap()
                    .push((spec.clone(), options));
                Ok(JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
            }
            SubmitOutcome::Reject(message) => Err(Error::Submission(message)),
        }
    }

    async fn watch(&self, id: JobId, eventlog: &str) -> Result<EventWatch> {
        let events = self
            .logs
            .lock()
            .unwrap()
            .get(&(id, eventlog.to_string()))
            .cloned()
            .unwrap_or_default();
        let (tx, watch) = EventWatch::channel(events.len().max(1));
        for event in events {
            // Capacity covers the whole log, so this cannot fail.
            let _ = tx.try_send(event);
        }
        Ok(watch)
    }

    async fn list(&self, _filter: &ListFilter) -> Result<Vec<JobRecord>> {
        if let Some(message) = self.fail_list.lock().unwrap().clone() {
            return Err(Error::RemoteUnreachable(message));
        }
        Ok(self.records.lock().unwrap().clone())
    }
}

/// Resolves uris to pre-registered mock instances, for recursive listing
/// tests.
#[derive(Default)]
pub struct MockConnector {
    instances: Mutex<HashMap<String, Arc<MockManager>>>,
}

impl MockConnector {
    pub fn new() -> MockConnector {
        MockConnector::default()
    }

    pub fn register(&self, uri: &str, manager: Arc<MockManager>) {
        self.instances
            .lock()
            .unwrap()
            .insert(uri.to_string(), manager);
    }
}

#[async_trait]
impl InstanceConnector for MockConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn JobManager>> {
        let manager = self
            .instances
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::RemoteUnreachable(format!("no instance at {uri}")))?;
        Ok(manager)
    }
}
