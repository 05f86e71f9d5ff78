//! Job listing, including bounded-concurrency recursion into nested
//! instances.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::client::{InstanceConnector, JobManager, JobRecord, ListFilter};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct JobsOptions {
    pub filter: ListFilter,
    pub recursive: bool,
    /// Descend into instances regardless of owner.
    pub recurse_all: bool,
    /// Maximum recursion depth; the top-level instance is depth 0.
    pub level: usize,
    pub threads: Option<usize>,
    pub stats: bool,
    pub suppress_header: bool,
}

impl Default for JobsOptions {
    fn default() -> Self {
        JobsOptions {
            filter: ListFilter::default(),
            recursive: false,
            recurse_all: false,
            level: usize::MAX,
            threads: None,
            stats: false,
            suppress_header: false,
        }
    }
}

/// One instance's worth of output. `jobs` is `None` when the instance could
/// not be reached; listing carries on without it.
#[derive(Debug)]
pub struct Listing {
    /// Job-id path from the root, empty for the root instance itself.
    pub path: String,
    pub jobs: Option<Vec<JobRecord>>,
    pub note: Option<String>,
}

fn pool_size(options: &JobsOptions) -> usize {
    options
        .threads
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(4)
        .max(1)
}

/// A child is worth descending into when it is a running instance exposing a
/// connection point and, unless `owner` is `None`, belongs to that uid.
fn recursable(record: &JobRecord, owner: Option<u32>) -> bool {
    record.uri.is_some()
        && record.state == "running"
        && owner.is_none_or(|uid| record.userid == uid)
}

fn descend(
    connector: Arc<dyn InstanceConnector>,
    uri: String,
    path: String,
    filter: ListFilter,
    owner: Option<u32>,
    depth: usize,
    level: usize,
    pool: Arc<Semaphore>,
) -> BoxFuture<'static, Vec<Listing>> {
    Box::pin(async move {
        let jobs = {
            // Bound concurrent child connections; a closed semaphore cannot
            // happen here, so acquire errors reduce to "no data".
            let _permit = pool.acquire().await;
            let manager = match connector.connect(&uri).await {
                Ok(manager) => manager,
                Err(e) => {
                    debug!(%uri, error = %e, "skipping unreachable instance");
                    return vec![Listing {
                        path,
                        jobs: None,
                        note: Some(e.to_string()),
                    }];
                }
            };
            match manager.list(&filter).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    debug!(%uri, error = %e, "instance returned no data");
                    return vec![Listing {
                        path,
                        jobs: None,
                        note: Some(e.to_string()),
                    }];
                }
            }
        };

        let mut children = Vec::new();
        if depth < level {
            let futures: Vec<_> = jobs
                .iter()
                .filter(|r| recursable(r, owner))
                .map(|r| {
                    descend(
                        Arc::clone(&connector),
                        r.uri.clone().unwrap_or_default(),
                        if path.is_empty() {
                            r.id.to_string()
                        } else {
                            format!("{}/{}", path, r.id)
                        },
                        filter.clone(),
                        owner,
                        depth + 1,
                        level,
                        Arc::clone(&pool),
                    )
                })
                .collect();
            for listings in join_all(futures).await {
                children.extend(listings);
            }
        }

        let mut out = vec![Listing {
            path,
            jobs: Some(jobs),
            note: None,
        }];
        out.extend(children);
        out
    })
}

/// List the root instance and, when requested, every reachable descendant.
/// Root failure is fatal; child failures degrade to "no data" entries.
pub async fn gather(
    manager: Arc<dyn JobManager>,
    connector: Arc<dyn InstanceConnector>,
    options: &JobsOptions,
) -> Result<Vec<Listing>> {
    let jobs = manager.list(&options.filter).await?;

    let mut out = Vec::new();
    if options.recursive && options.level > 0 {
        // Foreign instances are skipped unless --recurse-all; their sockets
        // would refuse us anyway.
        let owner = if options.recurse_all {
            None
        } else {
            Some(nix::unistd::getuid().as_raw())
        };
        let pool = Arc::new(Semaphore::new(pool_size(options)));
        let futures: Vec<_> = jobs
            .iter()
            .filter(|r| recursable(r, owner))
            .map(|r| {
                descend(
                    Arc::clone(&connector),
                    r.uri.clone().unwrap_or_default(),
                    r.id.to_string(),
                    options.filter.clone(),
                    owner,
                    1,
                    options.level,
                    Arc::clone(&pool),
                )
            })
            .collect();
        for listings in join_all(futures).await {
            out.extend(listings);
        }
    }

    let mut listings = vec![Listing {
        path: String::new(),
        jobs: Some(jobs),
        note: None,
    }];
    listings.extend(out);
    Ok(listings)
}

/// Runtime in the `H:MM:SS` shape familiar from batch schedulers, seconds
/// with one decimal under a minute.
pub fn format_runtime(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        let total = secs as u64;
        let h = total / 3600;
        let m = (total % 3600) / 60;
        let s = total % 60;
        format!("{h}:{m:02}:{s:02}")
    }
}

/// Render one instance's records as a plain fixed-width table.
pub fn render_table(jobs: &[JobRecord], suppress_header: bool) -> String {
    let mut out = String::new();
    if !suppress_header {
        out.push_str(&format!(
            "{:>12} {:<16} {:<9} {:>6} {:>6} {:>9}\n",
            "JOBID", "NAME", "STATE", "NTASKS", "NNODES", "RUNTIME"
        ));
    }
    for job in jobs {
        let mut name = job.name.clone();
        if name.len() > 16 {
            name.truncate(15);
            name.push('+');
        }
        out.push_str(&format!(
            "{:>12} {:<16} {:<9} {:>6} {:>6} {:>9}\n",
            job.id,
            name,
            job.state,
            job.ntasks,
            job.nnodes,
            format_runtime(job.runtime),
        ));
    }
    out
}

/// Aggregate state counts across every reachable listing.
pub fn stats_line(listings: &[Listing]) -> String {
    let mut running = 0usize;
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut pending = 0usize;
    for listing in listings {
        let Some(jobs) = &listing.jobs else { continue };
        for job in jobs {
            match job.state.as_str() {
                "running" => running += 1,
                "completed" => completed += 1,
                "failed" => failed += 1,
                "pending" => pending += 1,
                _ => {}
            }
        }
    }
    format!("{running} running, {completed} completed, {failed} failed, {pending} pending")
}
