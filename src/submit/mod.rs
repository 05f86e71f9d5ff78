//! Asynchronous submission pipeline.
//!
//! A [`SubmitSession`] owns every piece of mutable submission state: the
//! in-flight submit requests, the per-job event watches, the aggregate
//! counters, and the process exit code. One `tokio::select!` loop drives all
//! of them, so counter arithmetic never needs a lock and the final exit code
//! is decided exactly once, when the last watch closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamMap;
use tracing::debug;

use crate::bulk::{GeneratedJob, JobOptions};
use crate::client::{
    EventWatch, JobEvent, JobId, JobManager, SubmitOptions, WatchHandle, EXEC_EVENTLOG,
    MAIN_EVENTLOG, OUTPUT_EVENTLOG,
};
use crate::error::{Error, Result};
use crate::idset;
use crate::jobspec;
use crate::progress::{ProgressCounters, ProgressDisplay};

/// Environment variable carrying the replica id for `--cc` copies.
pub const CC_ENV: &str = "MINIJOB_CC";

/// Decode a wait(2)-style status word into a shell exit code: the exit code
/// itself for a normal exit, `127 + signal` for a termination signal.
pub fn decode_wait_status(status: i64) -> i32 {
    if status & 0x7f == 0 {
        ((status >> 8) & 0xff) as i32
    } else {
        127 + (status & 0x7f) as i32
    }
}

/// Replica expansion of one job under `--cc`/`--bcc`.
struct CopyList {
    /// One entry per submission; `Some(id)` names the replica.
    replicas: Vec<Option<u32>>,
    /// Blind copies get no replica id in their environment.
    blind: bool,
}

fn copy_list(options: &JobOptions) -> Result<CopyList> {
    match (options.cc.as_deref(), options.bcc.as_deref()) {
        (Some(_), Some(_)) => Err(Error::Other(
            "--cc and --bcc cannot be used together".to_string(),
        )),
        (Some(set), None) => Ok(CopyList {
            replicas: idset::parse(set)?.into_iter().map(Some).collect(),
            blind: false,
        }),
        (None, Some(set)) => Ok(CopyList {
            replicas: idset::parse(set)?.into_iter().map(Some).collect(),
            blind: true,
        }),
        (None, None) => Ok(CopyList {
            replicas: vec![None],
            blind: false,
        }),
    }
}

/// Number of submissions one generated job expands to.
pub fn copy_count(options: &JobOptions) -> Result<usize> {
    Ok(copy_list(options)?.replicas.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Submitted,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WatchKey {
    Main(JobId),
    Exec(JobId),
    Output(JobId),
}

/// Session-wide behavior switches, resolved once from the options of the
/// first submitted job.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSettings {
    pub wait: bool,
    pub watch: bool,
    pub quiet: bool,
    pub label_io: bool,
    pub progress: bool,
    pub jps: bool,
    pub verbose: u8,
}

impl SessionSettings {
    pub fn from_options(options: &JobOptions) -> SessionSettings {
        SessionSettings {
            wait: options.wait || options.watch,
            watch: options.watch,
            quiet: options.quiet,
            label_io: options.label_io,
            progress: options.progress || options.jps,
            jps: options.jps,
            verbose: options.verbose,
        }
    }
}

enum Step {
    Resolved(String, Result<JobId>),
    Event(WatchKey, JobEvent),
    Tick,
}

pub struct SubmitSession {
    manager: Arc<dyn JobManager>,
    settings: SessionSettings,
    counters: ProgressCounters,
    exit_code: i32,
    display: Option<ProgressDisplay>,
    progress_started: bool,
    total: u64,
    resolved: u64,
    states: HashMap<JobId, JobState>,
    inflight: FuturesUnordered<BoxFuture<'static, (String, Result<JobId>)>>,
    watches: StreamMap<WatchKey, EventWatch>,
    handles: HashMap<WatchKey, WatchHandle>,
}

impl SubmitSession {
    pub fn new(manager: Arc<dyn JobManager>, settings: SessionSettings) -> SubmitSession {
        SubmitSession {
            manager,
            settings,
            counters: ProgressCounters::default(),
            exit_code: 0,
            display: None,
            progress_started: false,
            total: 0,
            resolved: 0,
            states: HashMap::new(),
            inflight: FuturesUnordered::new(),
            watches: StreamMap::new(),
            handles: HashMap::new(),
        }
    }

    pub fn counters(&self) -> ProgressCounters {
        self.counters
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Start the progress display over `total` expected submissions. The
    /// first call wins; later calls are no-ops.
    pub fn start_progress(&mut self, total: u64) {
        if self.progress_started {
            return;
        }
        self.progress_started = true;
        self.total = total;
        if self.settings.progress {
            self.display = ProgressDisplay::start(total, self.settings.wait, self.settings.jps);
        }
    }

    fn raise_exit(&mut self, code: i32) {
        if code > self.exit_code {
            self.exit_code = code;
        }
    }

    /// Queue one generated job, expanded to its `--cc`/`--bcc` replicas.
    pub fn submit(
        &mut self,
        job: &GeneratedJob,
        ambient: &HashMap<String, String>,
    ) -> Result<()> {
        let copies = copy_list(&job.options)?;
        let spec = jobspec::build(&job.options, &job.command, ambient)?;
        let submit_options = SubmitOptions::from_job_options(&job.options)?;

        for replica in copies.replicas {
            let mut spec = spec.clone();
            let label = match replica {
                Some(id) => {
                    if !copies.blind {
                        spec.environment.insert(CC_ENV.to_string(), id.to_string());
                    }
                    format!("cc={id}: ")
                }
                None => String::new(),
            };
            let manager = Arc::clone(&self.manager);
            self.counters.pending += 1;
            self.inflight.push(Box::pin(async move {
                (label, manager.submit(&spec, submit_options).await)
            }));
        }
        Ok(())
    }

    async fn attach_watch(&mut self, key: WatchKey, id: JobId, eventlog: &str) {
        let attached = self.manager.watch(id, eventlog).await;
        match attached {
            Ok(watch) => {
                self.handles.insert(key, watch.handle());
                self.watches.insert(key, watch);
            }
            Err(e) => {
                eprintln!("{id}: {e}");
                self.raise_exit(1);
            }
        }
    }

    fn cancel_watch(&mut self, key: WatchKey) {
        if let Some(handle) = self.handles.remove(&key) {
            handle.cancel();
        }
        self.watches.remove(&key);
    }

    async fn on_resolved(&mut self, label: String, result: Result<JobId>) {
        self.resolved += 1;
        match result {
            Ok(id) => {
                debug!(%id, "submission acknowledged");
                if !self.settings.quiet {
                    println!("{id}");
                }
                if self.settings.wait {
                    self.states.insert(id, JobState::Submitted);
                    self.attach_watch(WatchKey::Main(id), id, MAIN_EVENTLOG).await;
                } else {
                    self.counters.pending -= 1;
                }
            }
            Err(e) => {
                eprintln!("{label}{e}");
                self.counters.pending -= 1;
                self.counters.fail += 1;
                self.raise_exit(1);
            }
        }
    }

    async fn on_event(&mut self, key: WatchKey, event: JobEvent) {
        match key {
            WatchKey::Main(id) => self.on_main_event(id, event).await,
            WatchKey::Exec(id) => {
                if event.name == "shell.init" {
                    self.attach_watch(WatchKey::Output(id), id, OUTPUT_EVENTLOG)
                        .await;
                    self.cancel_watch(WatchKey::Exec(id));
                }
            }
            WatchKey::Output(id) => self.on_output_event(id, &event),
        }
    }

    async fn on_main_event(&mut self, id: JobId, event: JobEvent) {
        match event.name.as_str() {
            "start" => {
                self.states.insert(id, JobState::Running);
                self.counters.pending -= 1;
                self.counters.running += 1;
                if self.settings.watch {
                    self.attach_watch(WatchKey::Exec(id), id, EXEC_EVENTLOG).await;
                }
            }
            "exception" => {
                let kind = event.context_str("type").unwrap_or("unknown");
                let note = event.context_str("note").unwrap_or("");
                let severity = event.context_i64("severity").unwrap_or(0);
                eprintln!("{id}: exception: type={kind} note={note}");
                if severity == 0 && self.states.get(&id) == Some(&JobState::Submitted) {
                    self.states.insert(id, JobState::Failed);
                    self.counters.pending -= 1;
                    self.counters.fail += 1;
                    self.raise_exit(1);
                }
            }
            "finish" => {
                let status = event.context_i64("status").unwrap_or(0);
                let code = decode_wait_status(status);
                match self.states.get(&id).copied() {
                    Some(JobState::Running) => {
                        self.counters.running -= 1;
                        if code == 0 {
                            self.counters.complete += 1;
                        } else {
                            self.counters.fail += 1;
                        }
                    }
                    Some(JobState::Submitted) => {
                        // Finish without a start event; settle the counters
                        // directly from pending.
                        self.counters.pending -= 1;
                        if code == 0 {
                            self.counters.complete += 1;
                        } else {
                            self.counters.fail += 1;
                        }
                    }
                    _ => {}
                }
                self.states.insert(id, JobState::Done);
                self.raise_exit(code);
                if self.settings.verbose > 0 {
                    eprintln!("{id}: complete: status={code}");
                }
                self.cancel_watch(WatchKey::Main(id));
                self.cancel_watch(WatchKey::Exec(id));
            }
            _ => {}
        }
    }

    fn on_output_event(&mut self, id: JobId, event: &JobEvent) {
        if event.name != "data" {
            return;
        }
        let Some(data) = event.context_str("data") else {
            return;
        };
        let label = if self.settings.label_io {
            let rank = event.context_i64("rank").unwrap_or(0);
            format!("{id}: {rank}: ")
        } else {
            String::new()
        };
        match event.context_str("stream") {
            Some("stderr") => eprint!("{label}{data}"),
            _ => print!("{label}{data}"),
        }
    }

    fn refresh_display(&self) {
        let Some(display) = &self.display else {
            return;
        };
        let done = if self.settings.wait {
            self.counters.terminal().max(0) as u64
        } else {
            self.resolved
        };
        display.update(&self.counters, done);
    }

    /// Run the loop to completion and return the final exit code.
    pub async fn drive(&mut self) -> i32 {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !(self.inflight.is_empty() && self.watches.is_empty()) {
            let step = tokio::select! {
                Some((label, result)) = self.inflight.next(), if !self.inflight.is_empty() => {
                    Step::Resolved(label, result)
                }
                Some((key, event)) = self.watches.next(), if !self.watches.is_empty() => {
                    Step::Event(key, event)
                }
                _ = tick.tick() => Step::Tick,
            };
            match step {
                Step::Resolved(label, result) => self.on_resolved(label, result).await,
                Step::Event(key, event) => self.on_event(key, event).await,
                Step::Tick => {
                    if let Some(display) = &self.display {
                        display.tick();
                    }
                }
            }
            self.refresh_display();
        }

        if let Some(display) = &self.display {
            display.finish();
        }
        self.exit_code
    }
}
