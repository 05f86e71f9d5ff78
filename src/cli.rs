//! Command-line definitions for the `minijob` binary.
//!
//! Resource counts stay `String`s here rather than integers: under
//! `bulksubmit` every mutable option is a template (`-n {1}`), so parsing to
//! integers is deferred to jobspec build time, after substitution.

use std::ffi::OsString;

use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::bulk::JobOptions;

#[derive(Parser, Debug)]
#[command(name = "minijob")]
#[command(about = "Bulk job submission client for a distributed resource manager", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit one job and attach to it interactively
    Run(RunArgs),
    /// Submit one job (or replicas of it under --cc/--bcc)
    Submit(SubmitArgs),
    /// Generate and submit many jobs from command templates and input lists
    Bulksubmit(BulksubmitArgs),
    /// Submit a batch script as the initial program of a new instance
    Batch(BatchArgs),
    /// Allocate an interactive nested instance
    Alloc(AllocArgs),
    /// List jobs, optionally recursing into nested instances
    Jobs(JobsArgs),
}

impl Commands {
    fn common_mut(&mut self) -> Option<&mut CommonArgs> {
        match self {
            Commands::Run(args) => Some(&mut args.common),
            Commands::Submit(args) => Some(&mut args.common),
            Commands::Bulksubmit(args) => Some(&mut args.common),
            Commands::Batch(args) => Some(&mut args.common),
            Commands::Alloc(args) => Some(&mut args.common),
            Commands::Jobs(_) => None,
        }
    }
}

/// Options shared by every submitting subcommand.
#[derive(Args, Debug, Default)]
pub struct CommonArgs {
    /// Time limit (e.g. 30s, 5m, 2h)
    #[arg(short = 't', long = "time-limit", value_name = "DURATION")]
    pub time_limit: Option<String>,

    /// Scheduling urgency: 0-31, or default/hold/expedite
    #[arg(long)]
    pub urgency: Option<String>,

    /// Job name (defaults to the command basename)
    #[arg(long = "job-name", value_name = "NAME")]
    pub job_name: Option<String>,

    /// Set a shell option (OPT or OPT=VAL, VAL JSON-decoded when possible)
    #[arg(short = 'o', long = "setopt", value_name = "OPT[=VAL]")]
    pub setopt: Vec<String>,

    /// Set a jobspec attribute (ATTR=VAL, VAL JSON-decoded when possible)
    #[arg(long = "setattr", value_name = "ATTR=VAL")]
    pub setattr: Vec<String>,

    /// Environment rule: VAR=VAL assignment, or a glob//regex/ include
    /// pattern. Applied in command-line order with --env-remove/--env-file.
    #[arg(long, value_name = "RULE")]
    pub env: Vec<String>,

    /// Remove matching variables from the job environment
    #[arg(long = "env-remove", value_name = "PATTERN")]
    pub env_remove: Vec<String>,

    /// Read environment rules from a file, one per line
    #[arg(long = "env-file", value_name = "FILE")]
    pub env_file: Vec<String>,

    /// Redirect job stdin from a file
    #[arg(long, value_name = "PATH")]
    pub input: Option<String>,

    /// Redirect job stdout to a file ("none" to discard)
    #[arg(long, value_name = "PATH")]
    pub output: Option<String>,

    /// Redirect job stderr to a file
    #[arg(long, value_name = "PATH")]
    pub error: Option<String>,

    /// Prefix each output line with job id and task rank
    #[arg(long = "label-io")]
    pub label_io: bool,

    /// Submission flags, comma-separated (debug, waitable)
    #[arg(long, value_name = "FLAGS")]
    pub flags: Vec<String>,

    /// Print the jobspec (or generated commands) without submitting
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Merged, order-preserving rules from --env/--env-remove/--env-file.
    #[arg(skip)]
    pub env_rules: Vec<String>,
}

impl CommonArgs {
    /// Rebuild the ordered rule list from the raw argument indices, since
    /// the three env options are order-sensitive relative to each other.
    fn merge_env_rules(&mut self, matches: &ArgMatches) {
        let mut tagged: Vec<(usize, String)> = Vec::new();
        let mut collect = |id: &str, prefix: &str, tagged: &mut Vec<(usize, String)>| {
            let Some(values) = matches.get_many::<String>(id) else {
                return;
            };
            let Some(indices) = matches.indices_of(id) else {
                return;
            };
            for (index, value) in indices.zip(values) {
                tagged.push((index, format!("{prefix}{value}")));
            }
        };
        collect("env", "", &mut tagged);
        collect("env_remove", "-", &mut tagged);
        collect("env_file", "^", &mut tagged);
        tagged.sort_by_key(|(index, _)| *index);
        self.env_rules = tagged.into_iter().map(|(_, rule)| rule).collect();
    }

    fn apply(&self, options: &mut JobOptions) {
        options.time_limit = self.time_limit.clone();
        if let Some(urgency) = &self.urgency {
            options.urgency = urgency.clone();
        }
        options.job_name = self.job_name.clone();
        options.setopt = self.setopt.clone();
        options.setattr = self.setattr.clone();
        options.env_rules = self.env_rules.clone();
        options.input = self.input.clone();
        options.output = self.output.clone();
        options.error = self.error.clone();
        options.label_io = self.label_io;
        options.flags = self.flags.clone();
        options.dry_run = self.dry_run;
    }
}

/// Per-task resource sizing for the submit family.
#[derive(Args, Debug, Default)]
pub struct TaskArgs {
    /// Number of tasks
    #[arg(short = 'n', long, default_value = "1", value_name = "N")]
    pub ntasks: String,

    /// Cores per task
    #[arg(short = 'c', long = "cores-per-task", default_value = "1", value_name = "N")]
    pub cores_per_task: String,

    /// GPUs per task
    #[arg(short = 'g', long = "gpus-per-task", value_name = "N")]
    pub gpus_per_task: Option<String>,

    /// Number of nodes to distribute tasks across
    #[arg(short = 'N', long, value_name = "N")]
    pub nodes: Option<String>,
}

impl TaskArgs {
    fn apply(&self, options: &mut JobOptions) {
        options.ntasks = self.ntasks.clone();
        options.cores_per_task = self.cores_per_task.clone();
        options.gpus_per_task = self.gpus_per_task.clone();
        options.nodes = self.nodes.clone();
    }
}

/// Bulk submission behavior switches.
#[derive(Args, Debug, Default)]
pub struct BulkOpts {
    /// Do not print job ids as they are assigned
    #[arg(long)]
    pub quiet: bool,

    /// Replicate the job once per id in IDSET, with MINIJOB_CC set
    #[arg(long, value_name = "IDSET")]
    pub cc: Option<String>,

    /// Replicate like --cc but without exposing the replica id
    #[arg(long, value_name = "IDSET")]
    pub bcc: Option<String>,

    /// Wait for all submitted jobs to finish
    #[arg(long)]
    pub wait: bool,

    /// Wait and copy job output to this terminal
    #[arg(long)]
    pub watch: bool,

    /// Show a progress bar
    #[arg(long)]
    pub progress: bool,

    /// Show a progress bar with a jobs/s rate
    #[arg(long)]
    pub jps: bool,
}

impl BulkOpts {
    fn apply(&self, options: &mut JobOptions) {
        options.quiet = self.quiet;
        options.cc = self.cc.clone();
        options.bcc = self.bcc.clone();
        options.wait = self.wait;
        options.watch = self.watch;
        options.progress = self.progress;
        options.jps = self.jps;
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub tasks: TaskArgs,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn job_options(&self, verbose: u8) -> JobOptions {
        let mut options = JobOptions {
            verbose,
            ..Default::default()
        };
        self.common.apply(&mut options);
        self.tasks.apply(&mut options);
        options
    }
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub tasks: TaskArgs,

    #[command(flatten)]
    pub bulk: BulkOpts,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl SubmitArgs {
    pub fn job_options(&self, verbose: u8) -> JobOptions {
        let mut options = JobOptions {
            verbose,
            ..Default::default()
        };
        self.common.apply(&mut options);
        self.tasks.apply(&mut options);
        self.bulk.apply(&mut options);
        options
    }
}

#[derive(Args, Debug)]
pub struct BulksubmitArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub tasks: TaskArgs,

    #[command(flatten)]
    pub bulk: BulkOpts,

    /// Shuffle the generated jobs before submitting
    #[arg(long)]
    pub shuffle: bool,

    /// Separator for file and stdin input lists (escapes decoded, "none"
    /// splits on whitespace)
    #[arg(long, default_value = "\\n", value_name = "SEP")]
    pub sep: String,

    /// Define a named input transform usable as {i.NAME}
    #[arg(long, value_name = "NAME=EXPR")]
    pub define: Vec<String>,

    /// Command template and input groups (::: / :::: / :::+ / ::::+)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl BulksubmitArgs {
    pub fn job_options(&self, verbose: u8) -> JobOptions {
        let mut options = JobOptions {
            verbose,
            ..Default::default()
        };
        self.common.apply(&mut options);
        self.tasks.apply(&mut options);
        self.bulk.apply(&mut options);
        options
    }
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Number of slots to allocate
    #[arg(short = 'n', long, value_name = "N")]
    pub nslots: u32,

    /// Cores per slot
    #[arg(short = 'c', long = "cores-per-slot", default_value_t = 1, value_name = "N")]
    pub cores_per_slot: u32,

    /// GPUs per slot
    #[arg(short = 'g', long = "gpus-per-slot", value_name = "N")]
    pub gpus_per_slot: Option<u32>,

    /// Number of nodes
    #[arg(short = 'N', long, value_name = "N")]
    pub nodes: Option<u32>,

    /// Options passed through to the new instance's broker
    #[arg(long = "broker-opts", value_name = "OPTS")]
    pub broker_opts: Vec<String>,

    /// Wrap the arguments in a #!/bin/sh script instead of reading one
    #[arg(long)]
    pub wrap: bool,

    /// Batch script (or "-" for stdin) and its arguments; the raw command
    /// under --wrap
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub script: Vec<String>,
}

impl BatchArgs {
    pub fn job_options(&self, verbose: u8) -> JobOptions {
        let mut options = JobOptions {
            verbose,
            ..Default::default()
        };
        self.common.apply(&mut options);
        options
    }
}

#[derive(Args, Debug)]
pub struct AllocArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Number of slots to allocate
    #[arg(short = 'n', long, value_name = "N")]
    pub nslots: u32,

    /// Cores per slot
    #[arg(short = 'c', long = "cores-per-slot", default_value_t = 1, value_name = "N")]
    pub cores_per_slot: u32,

    /// GPUs per slot
    #[arg(short = 'g', long = "gpus-per-slot", value_name = "N")]
    pub gpus_per_slot: Option<u32>,

    /// Number of nodes
    #[arg(short = 'N', long, value_name = "N")]
    pub nodes: Option<u32>,

    /// Options passed through to the new instance's broker
    #[arg(long = "broker-opts", value_name = "OPTS")]
    pub broker_opts: Vec<String>,

    /// Initial program of the new instance (defaults to an interactive
    /// shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl AllocArgs {
    pub fn job_options(&self, verbose: u8) -> JobOptions {
        let mut options = JobOptions {
            verbose,
            ..Default::default()
        };
        self.common.apply(&mut options);
        options
    }
}

#[derive(Args, Debug)]
pub struct JobsArgs {
    /// Maximum number of jobs to list per instance
    #[arg(short = 'c', long, default_value_t = 1000, value_name = "N")]
    pub count: usize,

    /// Include jobs in every state, not just active ones
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Limit to jobs of one user
    #[arg(long, value_name = "USER")]
    pub user: Option<String>,

    /// Limit to jobs in the given states (pending, running, completed,
    /// failed)
    #[arg(long, value_name = "STATE")]
    pub filter: Vec<String>,

    /// Descend into running nested instances owned by the current user
    #[arg(short = 'R', long)]
    pub recursive: bool,

    /// With --recursive, descend into other users' instances too
    #[arg(long = "recurse-all", requires = "recursive")]
    pub recurse_all: bool,

    /// Maximum recursion depth
    #[arg(short = 'L', long, value_name = "N")]
    pub level: Option<usize>,

    /// Size of the child-instance connection pool
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Print aggregate state counts
    #[arg(long)]
    pub stats: bool,

    /// Omit the table header
    #[arg(long = "suppress-header")]
    pub suppress_header: bool,
}

/// Parse argv, then restore the relative ordering of the env-rule options
/// from the raw match indices.
pub fn parse_from<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = Cli::command().try_get_matches_from(args)?;
    let mut cli = Cli::from_arg_matches(&matches)?;
    if let Some((_, sub_matches)) = matches.subcommand() {
        if let Some(common) = cli.command.common_mut() {
            common.merge_env_rules(sub_matches);
        }
    }
    Ok(cli)
}

pub fn parse() -> Cli {
    match parse_from(std::env::args()) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_rule_order_is_preserved() {
        let cli = parse_from([
            "minijob",
            "submit",
            "--env-remove",
            "SECRET_*",
            "--env",
            "PATH=/opt/bin:$PATH",
            "--env-file",
            "rules.env",
            "hostname",
        ])
        .unwrap();
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(
            args.common.env_rules,
            vec!["-SECRET_*", "PATH=/opt/bin:$PATH", "^rules.env"]
        );
    }

    #[test]
    fn test_bulksubmit_groups_pass_through() {
        let cli = parse_from([
            "minijob",
            "bulksubmit",
            "echo",
            "{}",
            ":::",
            "a",
            "b",
        ])
        .unwrap();
        let Commands::Bulksubmit(args) = cli.command else {
            panic!("expected bulksubmit");
        };
        assert_eq!(args.command, vec!["echo", "{}", ":::", "a", "b"]);
    }

    #[test]
    fn test_templated_resource_counts_stay_strings() {
        let cli = parse_from([
            "minijob",
            "bulksubmit",
            "-n",
            "{1}",
            "work",
            "{0}",
            ":::",
            "a",
        ])
        .unwrap();
        let Commands::Bulksubmit(args) = cli.command else {
            panic!("expected bulksubmit");
        };
        assert_eq!(args.tasks.ntasks, "{1}");
    }

    #[test]
    fn test_run_requires_a_command() {
        assert!(parse_from(["minijob", "run"]).is_err());
    }

    #[test]
    fn test_job_options_carry_submission_settings() {
        let cli = parse_from([
            "minijob",
            "submit",
            "--wait",
            "--quiet",
            "--cc",
            "0-3",
            "--label-io",
            "sleep",
            "1",
        ])
        .unwrap();
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        let options = args.job_options(1);
        assert!(options.wait);
        assert!(options.quiet);
        assert!(options.label_io);
        assert_eq!(options.cc.as_deref(), Some("0-3"));
        assert_eq!(options.verbose, 1);
    }
}
