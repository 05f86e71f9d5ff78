//! Subcommand runners. Each returns the process exit code; fatal setup
//! errors bubble out as `anyhow::Error` and are reported once in `main`.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use rand::seq::SliceRandom;
use tracing::debug;

use crate::bulk::{self, GeneratedJob, JobOptions};
use crate::cli::{AllocArgs, BatchArgs, BulksubmitArgs, JobsArgs, RunArgs, SubmitArgs};
use crate::client::remote::{RemoteConnector, RemoteManager};
use crate::client::{JobId, JobManager, ListFilter, SubmitOptions};
use crate::jobs as listing;
use crate::jobspec::{self, Jobspec};
use crate::submit::{copy_count, SessionSettings, SubmitSession};

fn ambient_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn connect() -> anyhow::Result<Arc<dyn JobManager>> {
    Ok(Arc::new(RemoteManager::from_env()?))
}

fn read_stdin() -> std::io::Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

/// Replace this process with the interactive attach tool for `id`.
fn attach(id: JobId, options: &JobOptions) -> anyhow::Result<i32> {
    use std::os::unix::process::CommandExt;

    let mut cmd = std::process::Command::new("minijob-attach");
    if options.label_io {
        cmd.arg("--label-io");
    }
    for _ in 0..options.verbose {
        cmd.arg("-v");
    }
    cmd.arg(id.to_string());
    let err = cmd.exec();
    Err(anyhow!("failed to exec minijob-attach: {err}"))
}

/// `minijob run`: submit one job and attach to it.
pub async fn run(args: RunArgs, verbose: u8) -> anyhow::Result<i32> {
    let options = args.job_options(verbose);
    let ambient = ambient_env();
    let spec = jobspec::build(&options, &args.command, &ambient)?;
    if options.dry_run {
        println!("{}", spec.dumps()?);
        return Ok(0);
    }

    let manager = connect()?;
    let submit_options = SubmitOptions::from_job_options(&options)?;
    let id = manager.submit(&spec, submit_options).await?;
    debug!(%id, "job submitted, attaching");
    attach(id, &options)
}

/// `minijob submit`: submit one job, or its `--cc`/`--bcc` replicas.
pub async fn submit(args: SubmitArgs, verbose: u8) -> anyhow::Result<i32> {
    let options = args.job_options(verbose);
    let ambient = ambient_env();
    if options.dry_run {
        let spec = jobspec::build(&options, &args.command, &ambient)?;
        println!("{}", spec.dumps()?);
        return Ok(0);
    }

    let job = GeneratedJob {
        options: options.clone(),
        command: args.command.clone(),
        modified: Vec::new(),
    };
    let manager = connect()?;
    let mut session = SubmitSession::new(manager, SessionSettings::from_options(&options));
    session.start_progress(copy_count(&options)? as u64);
    session.submit(&job, &ambient)?;
    Ok(session.drive().await)
}

/// `minijob bulksubmit`: expand input groups into many jobs and submit
/// them all.
pub async fn bulksubmit(args: BulksubmitArgs, verbose: u8) -> anyhow::Result<i32> {
    let options = args.job_options(verbose);
    let sep = bulk::input::decode_separator(&args.sep);
    let mut stdin = read_stdin;
    let mut jobs = bulk::create_commands(
        &options,
        &args.command,
        sep.as_deref(),
        &args.define,
        &mut stdin,
    )?;
    if args.shuffle {
        jobs.shuffle(&mut rand::rng());
    }

    if options.dry_run {
        for job in &jobs {
            println!("minijob: submit {job}");
        }
        return Ok(0);
    }

    let mut total = 0u64;
    for job in &jobs {
        total += copy_count(&job.options)? as u64;
    }

    let ambient = ambient_env();
    let manager = connect()?;
    let mut session = SubmitSession::new(manager, SessionSettings::from_options(&options));
    session.start_progress(total);
    for job in &jobs {
        if verbose > 0 {
            eprintln!("minijob: submit {job}");
        }
        session.submit(job, &ambient)?;
    }
    Ok(session.drive().await)
}

/// `minijob batch`: submit a batch script as a new instance's initial
/// program.
pub async fn batch(args: BatchArgs, verbose: u8) -> anyhow::Result<i32> {
    let mut options = args.job_options(verbose);
    if options.output.is_none() {
        options.output = Some("minijob-{{id}}.out".to_string());
    }

    let (script, script_args) = if args.wrap {
        if args.script.is_empty() {
            bail!("--wrap requires a command to wrap");
        }
        (
            format!("#!/bin/sh\n{}\n", args.script.join(" ")),
            Vec::new(),
        )
    } else {
        let path = args
            .script
            .first()
            .ok_or_else(|| anyhow!("batch requires a script (or --wrap COMMAND)"))?;
        let contents = if path == "-" {
            read_stdin().context("reading batch script from stdin")?
        } else {
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?
        };
        (contents, args.script[1..].to_vec())
    };
    if !script.starts_with("#!") {
        bail!("batch script must start with #!");
    }

    let name = options.job_name.clone().unwrap_or_else(|| {
        args.script
            .first()
            .map(|p| bulk::template::basename(p).to_string())
            .unwrap_or_else(|| "batch".to_string())
    });

    let mut spec = Jobspec::from_batch_command(
        &script,
        &name,
        &script_args,
        args.nslots,
        args.cores_per_slot,
        args.gpus_per_slot,
        args.nodes,
        &args.broker_opts,
    );
    let ambient = ambient_env();
    jobspec::apply_options(&mut spec, &options, &ambient)?;

    if options.dry_run {
        println!("{}", spec.dumps()?);
        return Ok(0);
    }
    let manager = connect()?;
    let submit_options = SubmitOptions::from_job_options(&options)?;
    let id = manager.submit(&spec, submit_options).await?;
    println!("{id}");
    Ok(0)
}

/// `minijob alloc`: allocate an interactive nested instance and attach.
pub async fn alloc(args: AllocArgs, verbose: u8) -> anyhow::Result<i32> {
    let options = args.job_options(verbose);
    let mut spec = Jobspec::from_nest_command(
        &args.command,
        args.nslots,
        args.cores_per_slot,
        args.gpus_per_slot,
        args.nodes,
        &args.broker_opts,
    );
    let ambient = ambient_env();
    jobspec::apply_options(&mut spec, &options, &ambient)?;

    if options.dry_run {
        println!("{}", spec.dumps()?);
        return Ok(0);
    }
    let manager = connect()?;
    let submit_options = SubmitOptions::from_job_options(&options)?;
    let id = manager.submit(&spec, submit_options).await?;
    attach(id, &options)
}

/// `minijob jobs`: list jobs, optionally recursing into nested instances.
pub async fn jobs(args: JobsArgs, _verbose: u8) -> anyhow::Result<i32> {
    let states = if args.all {
        Vec::new()
    } else if !args.filter.is_empty() {
        args.filter.clone()
    } else {
        vec!["pending".to_string(), "running".to_string()]
    };
    let options = listing::JobsOptions {
        filter: ListFilter {
            states,
            user: args.user.clone(),
            count: args.count,
        },
        recursive: args.recursive,
        recurse_all: args.recurse_all,
        level: args.level.unwrap_or(usize::MAX),
        threads: args.threads,
        stats: args.stats,
        suppress_header: args.suppress_header,
    };

    let manager = connect()?;
    let listings = listing::gather(manager, Arc::new(RemoteConnector), &options).await?;

    if options.stats {
        println!("{}", listing::stats_line(&listings));
    }
    for entry in &listings {
        if !entry.path.is_empty() {
            println!();
            println!("{}:", entry.path);
        }
        match &entry.jobs {
            Some(records) => print!("{}", listing::render_table(records, options.suppress_header)),
            None => println!(
                "no data ({})",
                entry.note.as_deref().unwrap_or("unreachable")
            ),
        }
    }
    Ok(0)
}
