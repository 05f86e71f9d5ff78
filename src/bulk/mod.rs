//! Bulk job generation: input expansion and per-job command instantiation.

pub mod input;
pub mod template;
pub mod transform;

use std::fmt;

use crate::error::Result;

use input::SplitInputs;
use transform::TransformSet;

/// Mutable per-job options. One `JobOptions` is copied forward wholesale for
/// each generated job, with templated fields substituted, so downstream code
/// never has to fall back to a separate "original options" object.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub ntasks: String,
    pub nodes: Option<String>,
    pub cores_per_task: String,
    pub gpus_per_task: Option<String>,
    pub time_limit: Option<String>,
    pub urgency: String,
    pub job_name: Option<String>,
    pub setopt: Vec<String>,
    pub setattr: Vec<String>,
    /// Merged, order-preserving environment rules from `--env`,
    /// `--env-remove` (`-` prefixed) and `--env-file` (`^` prefixed).
    pub env_rules: Vec<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,

    // Submission settings, not subject to substitution.
    pub label_io: bool,
    pub flags: Vec<String>,
    pub quiet: bool,
    pub wait: bool,
    pub watch: bool,
    pub progress: bool,
    pub jps: bool,
    pub dry_run: bool,
    pub verbose: u8,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            ntasks: "1".to_string(),
            nodes: None,
            cores_per_task: "1".to_string(),
            gpus_per_task: None,
            time_limit: None,
            urgency: "16".to_string(),
            job_name: None,
            setopt: Vec::new(),
            setattr: Vec::new(),
            env_rules: Vec::new(),
            input: None,
            output: None,
            error: None,
            cc: None,
            bcc: None,
            label_io: false,
            flags: Vec::new(),
            quiet: false,
            wait: false,
            watch: false,
            progress: false,
            jps: false,
            dry_run: false,
            verbose: 0,
        }
    }
}

/// Display prefixes for mutable options, used for verbose/dry-run output.
const OPTION_DISPLAY: &[(&str, &str)] = &[
    ("ntasks", "-n "),
    ("nodes", "-N "),
    ("cores_per_task", "-c "),
    ("gpus_per_task", "-g "),
    ("time_limit", "-t "),
    ("env_rules", "--env="),
    ("urgency", "--urgency="),
    ("setopt", "-o "),
    ("setattr", "--setattr="),
    ("job_name", "--job-name="),
    ("input", "--input="),
    ("output", "--output="),
    ("error", "--error="),
    ("cc", "--cc="),
    ("bcc", "--bcc="),
];

/// One fully instantiated job: the rendered argv plus resolved options,
/// with a record of which options substitution actually changed.
#[derive(Debug, Clone)]
pub struct GeneratedJob {
    pub options: JobOptions,
    pub command: Vec<String>,
    pub modified: Vec<&'static str>,
}

impl GeneratedJob {
    fn option_values(&self, field: &str) -> Vec<String> {
        let o = &self.options;
        let one = |v: &Option<String>| v.iter().cloned().collect::<Vec<_>>();
        match field {
            "ntasks" => vec![o.ntasks.clone()],
            "nodes" => one(&o.nodes),
            "cores_per_task" => vec![o.cores_per_task.clone()],
            "gpus_per_task" => one(&o.gpus_per_task),
            "time_limit" => one(&o.time_limit),
            "env_rules" => o.env_rules.clone(),
            "urgency" => vec![o.urgency.clone()],
            "setopt" => o.setopt.clone(),
            "setattr" => o.setattr.clone(),
            "job_name" => one(&o.job_name),
            "input" => one(&o.input),
            "output" => one(&o.output),
            "error" => one(&o.error),
            "cc" => one(&o.cc),
            "bcc" => one(&o.bcc),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for GeneratedJob {
    /// Render the job the way it could have been typed: modified options
    /// first, then the command.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (field, prefix) in OPTION_DISPLAY {
            if !self.modified.contains(field) {
                continue;
            }
            for value in self.option_values(field) {
                parts.push(format!("{prefix}{value}"));
            }
        }
        parts.extend(self.command.iter().cloned());
        write!(f, "{}", parts.join(" "))
    }
}

/// Instantiate one job from a command template and input tuple.
pub fn instantiate(
    options: &JobOptions,
    command_template: &[String],
    inputs: &[String],
    seq: usize,
    transforms: &TransformSet,
) -> Result<GeneratedJob> {
    let mut command = Vec::with_capacity(command_template.len());
    for arg in command_template {
        command.extend(template::render_args(arg, inputs, seq, transforms)?);
    }

    let mut resolved = options.clone();
    let mut modified: Vec<&'static str> = Vec::new();

    let mut subst_one = |value: &mut String, field: &'static str| -> Result<()> {
        let rendered = template::render_value(value, inputs, seq, transforms)?;
        if rendered != *value {
            *value = rendered;
            if !modified.contains(&field) {
                modified.push(field);
            }
        }
        Ok(())
    };

    subst_one(&mut resolved.ntasks, "ntasks")?;
    subst_one(&mut resolved.cores_per_task, "cores_per_task")?;
    subst_one(&mut resolved.urgency, "urgency")?;

    macro_rules! subst_opt {
        ($field:ident) => {
            if let Some(value) = resolved.$field.as_mut() {
                subst_one(value, stringify!($field))?;
            }
        };
    }
    macro_rules! subst_vec {
        ($field:ident) => {
            for value in resolved.$field.iter_mut() {
                subst_one(value, stringify!($field))?;
            }
        };
    }

    subst_opt!(nodes);
    subst_opt!(gpus_per_task);
    subst_opt!(time_limit);
    subst_opt!(job_name);
    subst_opt!(input);
    subst_opt!(output);
    subst_opt!(error);
    subst_opt!(cc);
    subst_opt!(bcc);
    subst_vec!(setopt);
    subst_vec!(setattr);
    subst_vec!(env_rules);

    Ok(GeneratedJob {
        options: resolved,
        command,
        modified,
    })
}

/// Expand a bulksubmit invocation into its full list of generated jobs.
///
/// `raw_command` is everything after the subcommand options; `read_stdin` is
/// called at most once, for a `:::: -` group or when no input groups were
/// given at all.
pub fn create_commands(
    options: &JobOptions,
    raw_command: &[String],
    sep: Option<&str>,
    defines: &[String],
    read_stdin: &mut dyn FnMut() -> std::io::Result<String>,
) -> Result<Vec<GeneratedJob>> {
    let transforms = TransformSet::compile(defines)?;

    let SplitInputs {
        mut command,
        mut lists,
        links,
    } = input::split_command_inputs(raw_command, sep, ":::", read_stdin)?;

    if command.is_empty() {
        command = vec!["{}".to_string()];
    }
    if lists.is_empty() && links.is_empty() {
        let contents = read_stdin()?;
        lists.push(input::split_input(&contents, sep));
    }

    let mut tuples = input::product(&lists);
    input::interleave_links(&mut tuples, &links);

    tuples
        .iter()
        .enumerate()
        .map(|(seq, tuple)| instantiate(options, &command, tuple, seq, &transforms))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_instantiate_command_only() {
        let job = instantiate(
            &JobOptions::default(),
            &toks(&["echo", "{0}", "{0.%}"]),
            &toks(&["a.txt"]),
            0,
            &TransformSet::default(),
        )
        .unwrap();
        assert_eq!(job.command, toks(&["echo", "a.txt", "a"]));
        assert!(job.modified.is_empty());
    }

    #[test]
    fn test_instantiate_tracks_modified_options() {
        let options = JobOptions {
            ntasks: "{1}".to_string(),
            output: Some("{0}.log".to_string()),
            ..Default::default()
        };
        let job = instantiate(
            &options,
            &toks(&["run", "{0}"]),
            &toks(&["x", "4"]),
            0,
            &TransformSet::default(),
        )
        .unwrap();
        assert_eq!(job.options.ntasks, "4");
        assert_eq!(job.options.output.as_deref(), Some("x.log"));
        assert_eq!(job.modified, vec!["ntasks", "output"]);
        let shown = job.to_string();
        assert!(shown.contains("-n 4"));
        assert!(shown.contains("--output=x.log"));
        assert!(shown.ends_with("run x"));
    }

    #[test]
    fn test_create_commands_product_and_link() {
        let raw = toks(&["echo", "{0}", "{1}", "{2}", ":::", "1", "2", ":::", "a", "b", ":::+", "x", "y", "z"]);
        let mut stdin = || -> std::io::Result<String> { panic!("no stdin expected") };
        let jobs = create_commands(
            &JobOptions::default(),
            &raw,
            Some("\n"),
            &[],
            &mut stdin,
        )
        .unwrap();
        assert_eq!(jobs.len(), 4);
        let rendered: Vec<String> = jobs.iter().map(|j| j.command.join(" ")).collect();
        assert_eq!(rendered[0], "echo 1 a x");
        assert_eq!(rendered[1], "echo 1 b y");
        assert_eq!(rendered[2], "echo 2 a z");
        assert_eq!(rendered[3], "echo 2 b x");
    }

    #[test]
    fn test_create_commands_defaults_to_stdin() {
        let raw = toks(&[]);
        let mut stdin = || -> std::io::Result<String> { Ok("1\n2\n3\n".to_string()) };
        let jobs = create_commands(
            &JobOptions::default(),
            &raw,
            Some("\n"),
            &[],
            &mut stdin,
        )
        .unwrap();
        // Default command template is "{}".
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].command, toks(&["1"]));
        assert_eq!(jobs[2].command, toks(&["3"]));
    }

    #[test]
    fn test_create_commands_empty_group_yields_no_jobs() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let raw = toks(&[
            "echo",
            "{0}",
            "{1}",
            ":::",
            "a",
            "b",
            "::::",
            &file.path().display().to_string(),
        ]);
        let mut stdin = || -> std::io::Result<String> { panic!("no stdin expected") };
        let jobs =
            create_commands(&JobOptions::default(), &raw, Some("\n"), &[], &mut stdin).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_create_commands_seq() {
        let raw = toks(&["echo", "{seq}:{}", ":::", "a", "b"]);
        let mut stdin = || -> std::io::Result<String> { panic!("no stdin expected") };
        let jobs =
            create_commands(&JobOptions::default(), &raw, Some("\n"), &[], &mut stdin).unwrap();
        assert_eq!(jobs[0].command, toks(&["echo", "0:a"]));
        assert_eq!(jobs[1].command, toks(&["echo", "1:b"]));
    }

    #[test]
    fn test_create_commands_bad_define_fails_fast() {
        let raw = toks(&["echo", "{}", ":::", "a"]);
        let mut stdin = || -> std::io::Result<String> { panic!("no stdin expected") };
        let err = create_commands(
            &JobOptions::default(),
            &raw,
            Some("\n"),
            &["t=exec(evil)".to_string()],
            &mut stdin,
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::TemplateSyntax(_)));
    }
}
