//! Resource manager client boundary.
//!
//! The manager itself is an external collaborator: it accepts a serialized
//! jobspec, returns a job id, and exposes an ordered per-job event log for
//! asynchronous watching. Everything the rest of the crate needs from it is
//! behind the [`JobManager`] trait so the submission pipeline can be driven
//! against the real remote implementation or the scripted mock in
//! `crate::testing`.

pub mod remote;

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::bulk::JobOptions;
use crate::error::{Error, Result};
use crate::jobspec::Jobspec;

/// The main per-job event log.
pub const MAIN_EVENTLOG: &str = "eventlog";
/// Execution event log; `shell.init` here means output is safe to watch.
pub const EXEC_EVENTLOG: &str = "guest.exec.eventlog";
/// Output event log carrying `data` events.
pub const OUTPUT_EVENTLOG: &str = "guest.output";

/// Opaque job identifier assigned by the manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One event from a job's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub name: String,
    #[serde(default)]
    pub context: Value,
}

impl JobEvent {
    pub fn new(name: &str, context: Value) -> JobEvent {
        JobEvent {
            name: name.to_string(),
            context,
        }
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn context_i64(&self, key: &str) -> Option<i64> {
        self.context.get(key).and_then(Value::as_i64)
    }
}

/// Submission options carried alongside the jobspec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub urgency: u8,
    pub debug: bool,
    pub waitable: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        SubmitOptions {
            urgency: URGENCY_DEFAULT,
            debug: false,
            waitable: false,
        }
    }
}

pub const URGENCY_HOLD: u8 = 0;
pub const URGENCY_DEFAULT: u8 = 16;
pub const URGENCY_EXPEDITE: u8 = 31;

impl SubmitOptions {
    /// Parse `--urgency` and `--flags` out of resolved job options.
    pub fn from_job_options(options: &JobOptions) -> Result<SubmitOptions> {
        let urgency = match options.urgency.as_str() {
            "default" => URGENCY_DEFAULT,
            "hold" => URGENCY_HOLD,
            "expedite" => URGENCY_EXPEDITE,
            other => {
                let n: u8 = other.parse().map_err(|_| Error::InvalidOption {
                    option: "--urgency".to_string(),
                    value: other.to_string(),
                })?;
                if n > 31 {
                    return Err(Error::InvalidOption {
                        option: "--urgency".to_string(),
                        value: other.to_string(),
                    });
                }
                n
            }
        };

        let mut opts = SubmitOptions {
            urgency,
            ..Default::default()
        };
        for group in &options.flags {
            for flag in group.split(',') {
                match flag {
                    "debug" => opts.debug = true,
                    "waitable" => opts.waitable = true,
                    other => {
                        return Err(Error::InvalidOption {
                            option: "--flags".to_string(),
                            value: other.to_string(),
                        })
                    }
                }
            }
        }
        Ok(opts)
    }
}

/// Cancellation handle for an event watch. Cancel is idempotent: the first
/// call stops the subscription, later calls are no-ops.
#[derive(Clone)]
pub struct WatchHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl WatchHandle {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the watch has been cancelled. Used by producers to stop
    /// forwarding events.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

/// An asynchronous sequence of events for one job's event log.
///
/// The stream ends when the producer closes it (logically at `finish`) or
/// when the watch is cancelled.
pub struct EventWatch {
    rx: mpsc::Receiver<JobEvent>,
    handle: WatchHandle,
}

impl EventWatch {
    /// Create a watch plus the sender side used by a producer task.
    pub fn channel(capacity: usize) -> (mpsc::Sender<JobEvent>, EventWatch) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = WatchHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        };
        (tx, EventWatch { rx, handle })
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }
}

impl Stream for EventWatch {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        if self.handle.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

/// Filter for job listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub states: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub count: usize,
}

/// One job record returned by a listing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub ntasks: u32,
    #[serde(default)]
    pub nnodes: u32,
    #[serde(default)]
    pub runtime: f64,
    #[serde(default)]
    pub userid: u32,
    /// Connection point of a nested instance, when this job is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Client-side view of the resource manager.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Submit a jobspec; rejection surfaces as `Error::Submission`.
    async fn submit(&self, spec: &Jobspec, options: SubmitOptions) -> Result<JobId>;

    /// Subscribe to one job's event log.
    async fn watch(&self, id: JobId, eventlog: &str) -> Result<EventWatch>;

    /// Fetch job records matching `filter`.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<JobRecord>>;
}

/// Opens a connection to a (possibly nested) manager instance by uri.
#[async_trait]
pub trait InstanceConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn JobManager>>;
}
