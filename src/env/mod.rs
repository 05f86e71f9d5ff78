//! Environment rule engine for `--env`, `--env-remove` and `--env-file`.
//!
//! A job's environment is built by folding an ordered list of rules over a
//! base mapping. Each rule either removes matching keys, reads further rules
//! from a file, copies matching keys from the ambient process environment, or
//! assigns a variable from a `$VAR`/`${VAR}` template. Rules are applied
//! strictly in the order given, so `--env=PATH=/bin --env='PATH=$PATH:/foo'`
//! yields `PATH=/bin:/foo`.

use std::collections::HashMap;
use std::path::PathBuf;

use glob::Pattern;
use regex::Regex;

use crate::error::{Error, Result};

/// One parsed environment rule.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvRule {
    /// `-PATTERN`: remove matching keys from the accumulated environment.
    Remove(String),
    /// `^FILE`: read additional newline-separated rules from FILE.
    IncludeFile(PathBuf),
    /// `VAR=TEMPLATE`: assign VAR from a template expanded against the
    /// accumulated environment first, the ambient environment second.
    Assign { var: String, template: String },
    /// `PATTERN`: copy matching ambient keys not already present.
    IncludeMatching(String),
}

impl EnvRule {
    /// Parse one rule string. The leading sigil selects the rule kind;
    /// anything without `=` is an include-matching pattern.
    pub fn parse(rule: &str) -> EnvRule {
        if let Some(pattern) = rule.strip_prefix('-') {
            EnvRule::Remove(pattern.to_string())
        } else if let Some(path) = rule.strip_prefix('^') {
            EnvRule::IncludeFile(expand_user(path))
        } else if let Some((var, template)) = rule.split_once('=') {
            EnvRule::Assign {
                var: var.to_string(),
                template: template.to_string(),
            }
        } else {
            EnvRule::IncludeMatching(rule.to_string())
        }
    }
}

/// Key matcher for remove/include rules. A pattern starting with `/` is a
/// regular expression (leading `/` stripped, at most one trailing `/`
/// stripped) matched from the start of the key; anything else is a shell
/// glob matched against the whole key.
enum KeyPattern {
    Glob(Pattern),
    Regex(Regex),
}

impl KeyPattern {
    fn compile(pattern: &str) -> Result<KeyPattern> {
        if let Some(expr) = pattern.strip_prefix('/') {
            let expr = expr.strip_suffix('/').unwrap_or(expr);
            Ok(KeyPattern::Regex(Regex::new(&format!("^(?:{expr})"))?))
        } else {
            Ok(KeyPattern::Glob(Pattern::new(pattern)?))
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Glob(p) => p.matches(key),
            KeyPattern::Regex(r) => r.is_match(key),
        }
    }
}

fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolve an ordered rule list against a base environment.
///
/// `ambient` stands in for the process environment so resolution is
/// deterministic given identical inputs and file contents. Filesystem reads
/// only happen for `^FILE` rules.
pub fn resolve(
    rules: &[String],
    base: HashMap<String, String>,
    ambient: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut environ = base;
    for rule in rules {
        let rule = rule.trim();
        if rule.is_empty() {
            continue;
        }
        match EnvRule::parse(rule) {
            EnvRule::Remove(pattern) => {
                let matcher = KeyPattern::compile(&pattern)?;
                environ.retain(|key, _| !matcher.matches(key));
            }
            EnvRule::IncludeFile(path) => {
                let contents = std::fs::read_to_string(&path)?;
                let lines: Vec<String> = contents.lines().map(|l| l.trim().to_string()).collect();
                // Recurse so rules in the file see the effects of rules
                // applied so far, not the original base.
                environ = resolve(&lines, environ, ambient)?;
            }
            EnvRule::Assign { var, template } => {
                let value = substitute(&template, &environ, ambient, rule)?;
                environ.insert(var, value);
            }
            EnvRule::IncludeMatching(pattern) => {
                let matcher = KeyPattern::compile(&pattern)?;
                for (key, value) in ambient {
                    if matcher.matches(key) && !environ.contains_key(key) {
                        environ.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
    Ok(environ)
}

/// Expand `$VAR`, `${VAR}` and `$$` in `template`, looking names up in the
/// accumulated environment first and the ambient environment second.
fn substitute(
    template: &str,
    environ: &HashMap<String, String>,
    ambient: &HashMap<String, String>,
    rule: &str,
) -> Result<String> {
    let lookup = |name: &str| -> Option<&String> { environ.get(name).or_else(|| ambient.get(name)) };
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed || !is_identifier(&name) {
                    return Err(Error::TemplateSyntax(format!(
                        "invalid placeholder in '{rule}'"
                    )));
                }
                match lookup(&name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(Error::Substitution {
                            name,
                            rule: rule.to_string(),
                        })
                    }
                }
            }
            _ => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !is_identifier(&name) {
                    return Err(Error::TemplateSyntax(format!(
                        "invalid placeholder in '{rule}'"
                    )));
                }
                match lookup(&name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(Error::Substitution {
                            name,
                            rule: rule.to_string(),
                        })
                    }
                }
            }
        }
    }
    Ok(out)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rules(list: &[&str]) -> Vec<String> {
        list.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_remove_glob() {
        let base = env(&[("FOO_A", "1"), ("FOO_B", "2"), ("BAR", "3")]);
        let result = resolve(&rules(&["-FOO_*"]), base, &env(&[])).unwrap();
        assert_eq!(result, env(&[("BAR", "3")]));
    }

    #[test]
    fn test_remove_regex() {
        let base = env(&[("FOO1", "1"), ("FOO2", "2"), ("OTHER", "3")]);
        let result = resolve(&rules(&["-/FOO[0-9]/"]), base, &env(&[])).unwrap();
        assert_eq!(result, env(&[("OTHER", "3")]));
    }

    #[test]
    fn test_assign_literal() {
        let result = resolve(&rules(&["FOO=bar"]), env(&[]), &env(&[])).unwrap();
        assert_eq!(result, env(&[("FOO", "bar")]));
    }

    #[test]
    fn test_assign_template_prefers_accumulated() {
        // --env=PATH=/bin --env=PATH=$PATH:/foo => PATH=/bin:/foo
        let ambient = env(&[("PATH", "/ambient")]);
        let result = resolve(
            &rules(&["PATH=/bin", "PATH=$PATH:/foo"]),
            env(&[]),
            &ambient,
        )
        .unwrap();
        assert_eq!(result.get("PATH").unwrap(), "/bin:/foo");
    }

    #[test]
    fn test_assign_template_ambient_fallback() {
        let ambient = env(&[("HOME", "/home/u")]);
        let result = resolve(&rules(&["DIR=${HOME}/work"]), env(&[]), &ambient).unwrap();
        assert_eq!(result.get("DIR").unwrap(), "/home/u/work");
    }

    #[test]
    fn test_assign_undefined_variable() {
        let err = resolve(&rules(&["X=$NOPE"]), env(&[]), &env(&[])).unwrap_err();
        assert!(matches!(err, Error::Substitution { .. }));
    }

    #[test]
    fn test_assign_bad_placeholder() {
        let err = resolve(&rules(&["X=${"]), env(&[]), &env(&[])).unwrap_err();
        assert!(matches!(err, Error::TemplateSyntax(_)));
        let err = resolve(&rules(&["X=$%"]), env(&[]), &env(&[])).unwrap_err();
        assert!(matches!(err, Error::TemplateSyntax(_)));
    }

    #[test]
    fn test_dollar_escape() {
        let result = resolve(&rules(&["X=$$HOME"]), env(&[]), &env(&[])).unwrap();
        assert_eq!(result.get("X").unwrap(), "$HOME");
    }

    #[test]
    fn test_include_matching_first_wins() {
        let ambient = env(&[("FOO", "ambient"), ("FOOBAR", "extra")]);
        let base = env(&[("FOO", "kept")]);
        let result = resolve(&rules(&["FOO*"]), base, &ambient).unwrap();
        assert_eq!(result.get("FOO").unwrap(), "kept");
        assert_eq!(result.get("FOOBAR").unwrap(), "extra");
    }

    #[test]
    fn test_include_file_recursion() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "B=$A:suffix").unwrap();
        writeln!(file, "-A").unwrap();
        file.flush().unwrap();

        let rule_list = vec![
            "A=seen".to_string(),
            format!("^{}", file.path().display()),
        ];
        let result = resolve(&rule_list, env(&[]), &env(&[])).unwrap();
        // The file's rules see the effect of the earlier A= rule.
        assert_eq!(result.get("B").unwrap(), "seen:suffix");
        assert!(!result.contains_key("A"));
    }

    #[test]
    fn test_deterministic() {
        let ambient = env(&[("PATH", "/p"), ("TERM", "dumb")]);
        let base = env(&[("KEEP", "1")]);
        let list = rules(&["-KEEP", "PATH=$PATH:/x", "TERM"]);
        let first = resolve(&list, base.clone(), &ambient).unwrap();
        let second = resolve(&list, base, &ambient).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_remove_then_include_round_trip() {
        let ambient = env(&[("FOO", "f"), ("BAR", "b")]);
        let base = env(&[("FOO", "f"), ("BAR", "b")]);
        let result = resolve(&rules(&["-FOO", "FOO"]), base.clone(), &ambient).unwrap();
        assert_eq!(result, base);
    }
}
