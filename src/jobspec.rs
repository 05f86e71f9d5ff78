//! Normalized job specification submitted to the resource manager.
//!
//! A `Jobspec` is the serializable description of one job: command,
//! resources, working directory, environment, attributes, shell options and
//! standard stream redirection. The wire representation is JSON.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bulk::JobOptions;
use crate::env;
use crate::error::{Error, Result};

/// Resource request shape. The submit family sizes jobs in tasks; batch and
/// alloc size them in slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resources {
    Tasks {
        ntasks: u32,
        cores_per_task: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpus_per_task: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nodes: Option<u32>,
    },
    Slots {
        nslots: u32,
        cores_per_slot: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpus_per_slot: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nodes: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jobspec {
    pub version: u32,
    pub command: Vec<String>,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shell_options: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl Jobspec {
    pub fn from_command(
        command: Vec<String>,
        ntasks: u32,
        cores_per_task: u32,
        gpus_per_task: Option<u32>,
        nodes: Option<u32>,
    ) -> Jobspec {
        Jobspec {
            version: 1,
            command,
            resources: Resources::Tasks {
                ntasks,
                cores_per_task,
                gpus_per_task,
                nodes,
            },
            cwd: None,
            duration: None,
            environment: HashMap::new(),
            attributes: BTreeMap::new(),
            shell_options: BTreeMap::new(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Jobspec for a batch script run as the initial program of a new
    /// instance. The script itself travels as an attribute.
    #[allow(clippy::too_many_arguments)]
    pub fn from_batch_command(
        script: &str,
        job_name: &str,
        args: &[String],
        nslots: u32,
        cores_per_slot: u32,
        gpus_per_slot: Option<u32>,
        nodes: Option<u32>,
        broker_opts: &[String],
    ) -> Jobspec {
        let mut command = vec!["minijob-broker".to_string()];
        command.extend(args.iter().cloned());
        let mut spec = Jobspec::from_command(command, 0, 0, None, None);
        spec.resources = Resources::Slots {
            nslots,
            cores_per_slot,
            gpus_per_slot,
            nodes,
        };
        spec.setattr("system.batch.script", Value::String(script.to_string()));
        if !broker_opts.is_empty() {
            spec.setattr(
                "system.batch.broker-opts",
                Value::Array(
                    broker_opts
                        .iter()
                        .map(|o| Value::String(o.clone()))
                        .collect(),
                ),
            );
        }
        spec.setattr("system.job.name", Value::String(job_name.to_string()));
        spec
    }

    /// Jobspec for an interactive nested instance (`alloc`).
    pub fn from_nest_command(
        command: &[String],
        nslots: u32,
        cores_per_slot: u32,
        gpus_per_slot: Option<u32>,
        nodes: Option<u32>,
        broker_opts: &[String],
    ) -> Jobspec {
        let mut argv = vec!["minijob-broker".to_string()];
        argv.extend(command.iter().cloned());
        let mut spec = Jobspec::from_command(argv, 0, 0, None, None);
        spec.resources = Resources::Slots {
            nslots,
            cores_per_slot,
            gpus_per_slot,
            nodes,
        };
        if !broker_opts.is_empty() {
            spec.setattr(
                "system.batch.broker-opts",
                Value::Array(
                    broker_opts
                        .iter()
                        .map(|o| Value::String(o.clone()))
                        .collect(),
                ),
            );
        }
        spec
    }

    pub fn setattr(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn setattr_shell_option(&mut self, key: &str, value: Value) {
        self.shell_options.insert(key.to_string(), value);
    }

    /// Serialize to the JSON form sent to the manager (and printed by
    /// `--dry-run`).
    pub fn dumps(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn parse_count(option: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| Error::InvalidOption {
        option: option.to_string(),
        value: value.to_string(),
    })
}

/// Parse a `KEY=VAL` setting, JSON-decoding the value when possible and
/// falling back to a plain string. A missing value yields `default`.
fn parse_keyval(keyval: &str, default: Option<Value>) -> Result<(String, Value)> {
    match keyval.split_once('=') {
        Some((key, val)) => {
            let value = serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.to_string()));
            Ok((key.to_string(), value))
        }
        None => match default {
            Some(value) => Ok((keyval.to_string(), value)),
            None => Err(Error::InvalidOption {
                option: "--setattr".to_string(),
                value: keyval.to_string(),
            }),
        },
    }
}

/// Apply the non-resource options (environment, duration, name, io
/// redirection, attributes, shell options) to an already-shaped jobspec.
/// Shared by the submit family and the batch/alloc builders.
pub fn apply_options(
    spec: &mut Jobspec,
    options: &JobOptions,
    ambient: &HashMap<String, String>,
) -> Result<()> {
    if let Ok(cwd) = std::env::current_dir() {
        spec.cwd = Some(cwd.display().to_string());
    }
    spec.environment = env::resolve(&options.env_rules, ambient.clone(), ambient)?;
    spec.duration = options.time_limit.clone();

    if let Some(name) = &options.job_name {
        spec.setattr("system.job.name", Value::String(name.clone()));
    }
    if let Some(stdin) = &options.input {
        spec.stdin = Some(stdin.clone());
    }
    if let Some(stdout) = &options.output {
        if stdout != "none" && stdout != "kvs" {
            spec.stdout = Some(stdout.clone());
            if options.label_io {
                spec.setattr_shell_option("output.stdout.label", Value::Bool(true));
            }
        }
    }
    if let Some(stderr) = &options.error {
        spec.stderr = Some(stderr.clone());
        if options.label_io {
            spec.setattr_shell_option("output.stderr.label", Value::Bool(true));
        }
    }

    for keyval in &options.setopt {
        let (key, value) = parse_keyval(keyval, Some(Value::from(1)))?;
        spec.setattr_shell_option(&key, value);
    }
    for keyval in &options.setattr {
        let (key, value) = parse_keyval(keyval, None)?;
        spec.setattr(&key, value);
    }
    Ok(())
}

/// Build a jobspec for the submit family from resolved options.
///
/// `ambient` is the process environment used both as the environment rule
/// base and as the `$VAR` fallback.
pub fn build(
    options: &JobOptions,
    command: &[String],
    ambient: &HashMap<String, String>,
) -> Result<Jobspec> {
    if command.is_empty() {
        return Err(Error::Other(
            "job command and arguments are missing".to_string(),
        ));
    }

    let ntasks = parse_count("--ntasks", &options.ntasks)?;
    let cores_per_task = parse_count("--cores-per-task", &options.cores_per_task)?;
    let gpus_per_task = options
        .gpus_per_task
        .as_deref()
        .map(|v| parse_count("--gpus-per-task", v))
        .transpose()?;
    let nodes = options
        .nodes
        .as_deref()
        .map(|v| parse_count("--nodes", v))
        .transpose()?;

    let mut spec = Jobspec::from_command(
        command.to_vec(),
        ntasks,
        cores_per_task,
        gpus_per_task,
        nodes,
    );
    apply_options(&mut spec, options, ambient)?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_build_minimal() {
        let options = JobOptions::default();
        let spec = build(&options, &toks(&["hostname"]), &HashMap::new()).unwrap();
        assert_eq!(spec.command, toks(&["hostname"]));
        assert_eq!(
            spec.resources,
            Resources::Tasks {
                ntasks: 1,
                cores_per_task: 1,
                gpus_per_task: None,
                nodes: None,
            }
        );
    }

    #[test]
    fn test_build_empty_command() {
        let err = build(&JobOptions::default(), &[], &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_build_invalid_count() {
        let options = JobOptions {
            ntasks: "lots".to_string(),
            ..Default::default()
        };
        let err = build(&options, &toks(&["true"]), &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { .. }));
    }

    #[test]
    fn test_build_setopt_and_setattr() {
        let options = JobOptions {
            setopt: vec!["verbose".to_string(), "cpu-affinity=per-task".to_string()],
            setattr: vec!["system.queue=\"debug\"".to_string(), "depth=2".to_string()],
            ..Default::default()
        };
        let spec = build(&options, &toks(&["true"]), &HashMap::new()).unwrap();
        assert_eq!(spec.shell_options.get("verbose"), Some(&Value::from(1)));
        assert_eq!(
            spec.shell_options.get("cpu-affinity"),
            Some(&Value::String("per-task".to_string()))
        );
        assert_eq!(
            spec.attributes.get("system.queue"),
            Some(&Value::String("debug".to_string()))
        );
        assert_eq!(spec.attributes.get("depth"), Some(&Value::from(2)));
    }

    #[test]
    fn test_build_setattr_missing_value() {
        let options = JobOptions {
            setattr: vec!["bare".to_string()],
            ..Default::default()
        };
        let err = build(&options, &toks(&["true"]), &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { .. }));
    }

    #[test]
    fn test_build_io_redirection() {
        let options = JobOptions {
            input: Some("in.dat".to_string()),
            output: Some("out.log".to_string()),
            error: Some("err.log".to_string()),
            label_io: true,
            ..Default::default()
        };
        let spec = build(&options, &toks(&["true"]), &HashMap::new()).unwrap();
        assert_eq!(spec.stdin.as_deref(), Some("in.dat"));
        assert_eq!(spec.stdout.as_deref(), Some("out.log"));
        assert_eq!(
            spec.shell_options.get("output.stdout.label"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_build_output_none_skipped() {
        let options = JobOptions {
            output: Some("none".to_string()),
            ..Default::default()
        };
        let spec = build(&options, &toks(&["true"]), &HashMap::new()).unwrap();
        assert!(spec.stdout.is_none());
    }

    #[test]
    fn test_build_environment_rules() {
        let ambient: HashMap<String, String> =
            [("KEEP".to_string(), "1".to_string()), ("DROP".to_string(), "2".to_string())]
                .into_iter()
                .collect();
        let options = JobOptions {
            env_rules: vec!["-DROP".to_string(), "EXTRA=$KEEP!".to_string()],
            ..Default::default()
        };
        let spec = build(&options, &toks(&["true"]), &ambient).unwrap();
        assert_eq!(spec.environment.get("KEEP").map(String::as_str), Some("1"));
        assert_eq!(spec.environment.get("EXTRA").map(String::as_str), Some("1!"));
        assert!(!spec.environment.contains_key("DROP"));
    }

    #[test]
    fn test_dumps_round_trip() {
        let spec = Jobspec::from_command(toks(&["echo", "hi"]), 2, 1, None, Some(1));
        let json = spec.dumps().unwrap();
        let parsed: Jobspec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.command, spec.command);
        assert_eq!(parsed.resources, spec.resources);
    }
}
