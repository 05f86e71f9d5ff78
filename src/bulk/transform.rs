//! User-defined input transforms for `--define NAME=EXPR`.
//!
//! EXPR is a `|`-separated chain of operations from a closed registry,
//! applied left to right to the raw input string, e.g.
//! `--define 'tag=basename|replace(.fastq,)|upper'`. A transform may yield a
//! list (via `split`), in which case each element becomes a separate command
//! argument during instantiation. Definitions are compiled once, before any
//! job is generated, so a bad definition fails the whole invocation up front.

use std::collections::HashMap;

use crate::error::{Error, Result};

use super::template::{basename, dirname, splitext};

/// Result of applying a transform: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformValue {
    Str(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
enum Op {
    Upper,
    Lower,
    Trim,
    Basename,
    Dirname,
    Stem,
    Ext,
    Replace(String, String),
    Prefix(String),
    Suffix(String),
    Split(String),
}

impl Op {
    fn parse(spec: &str) -> Result<Op> {
        let spec = spec.trim();
        let (name, args) = match spec.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix(')').ok_or_else(|| {
                    Error::TemplateSyntax(format!("unterminated arguments in '{spec}'"))
                })?;
                (name.trim(), Some(inner))
            }
            None => (spec, None),
        };

        // Argument text is taken verbatim: `split(,)` splits on a comma and
        // `replace` divides its text at the first comma only, so separators
        // and replacements may themselves contain commas.
        let bare = || -> Result<()> {
            if args.is_none() {
                Ok(())
            } else {
                Err(Error::TemplateSyntax(format!(
                    "operation '{name}' takes no arguments"
                )))
            }
        };
        let one = || -> Result<&str> {
            args.ok_or_else(|| {
                Error::TemplateSyntax(format!("operation '{name}' expects 1 argument"))
            })
        };

        match name {
            "upper" => bare().map(|_| Op::Upper),
            "lower" => bare().map(|_| Op::Lower),
            "trim" => bare().map(|_| Op::Trim),
            "basename" => bare().map(|_| Op::Basename),
            "dirname" => bare().map(|_| Op::Dirname),
            "stem" => bare().map(|_| Op::Stem),
            "ext" => bare().map(|_| Op::Ext),
            "replace" => {
                let (old, new) = one()?.split_once(',').ok_or_else(|| {
                    Error::TemplateSyntax(format!("operation '{name}' expects 2 arguments"))
                })?;
                Ok(Op::Replace(old.to_string(), new.to_string()))
            }
            "prefix" => one().map(|a| Op::Prefix(a.to_string())),
            "suffix" => one().map(|a| Op::Suffix(a.to_string())),
            "split" => one().map(|a| Op::Split(a.to_string())),
            _ => Err(Error::TemplateSyntax(format!(
                "unknown transform operation '{name}'"
            ))),
        }
    }

    fn apply_str(&self, input: &str) -> TransformValue {
        match self {
            Op::Upper => TransformValue::Str(input.to_uppercase()),
            Op::Lower => TransformValue::Str(input.to_lowercase()),
            Op::Trim => TransformValue::Str(input.trim().to_string()),
            Op::Basename => TransformValue::Str(basename(input).to_string()),
            Op::Dirname => TransformValue::Str(dirname(input).to_string()),
            Op::Stem => TransformValue::Str(splitext(input).0.to_string()),
            Op::Ext => TransformValue::Str(splitext(input).1.to_string()),
            Op::Replace(old, new) => TransformValue::Str(input.replace(old.as_str(), new)),
            Op::Prefix(p) => TransformValue::Str(format!("{p}{input}")),
            Op::Suffix(s) => TransformValue::Str(format!("{input}{s}")),
            Op::Split(sep) => TransformValue::List(
                input
                    .split(sep.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        }
    }

    fn apply(&self, value: TransformValue) -> TransformValue {
        match value {
            TransformValue::Str(s) => self.apply_str(&s),
            TransformValue::List(items) => {
                // Applied elementwise; a list-producing op flattens.
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match self.apply_str(&item) {
                        TransformValue::Str(s) => out.push(s),
                        TransformValue::List(mut more) => out.append(&mut more),
                    }
                }
                TransformValue::List(out)
            }
        }
    }
}

/// A compiled `--define` expression.
#[derive(Debug, Clone)]
pub struct Transform {
    ops: Vec<Op>,
}

impl Transform {
    pub fn compile(expr: &str) -> Result<Transform> {
        let ops = expr
            .split('|')
            .map(Op::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Transform { ops })
    }

    pub fn apply(&self, input: &str) -> TransformValue {
        let mut value = TransformValue::Str(input.to_string());
        for op in &self.ops {
            value = op.apply(value);
        }
        value
    }
}

/// The set of named transforms available to `{i.NAME}` fields.
#[derive(Debug, Clone, Default)]
pub struct TransformSet {
    map: HashMap<String, Transform>,
}

impl TransformSet {
    /// Compile `NAME=EXPR` definitions. Malformed definitions fail here,
    /// before any job is generated.
    pub fn compile(defines: &[String]) -> Result<TransformSet> {
        let mut map = HashMap::new();
        for define in defines {
            let (name, expr) = define.split_once('=').ok_or_else(|| {
                Error::TemplateSyntax(format!("--define: expected NAME=EXPR, got '{define}'"))
            })?;
            map.insert(name.to_string(), Transform::compile(expr)?);
        }
        Ok(TransformSet { map })
    }

    pub fn get(&self, name: &str) -> Option<&Transform> {
        self.map.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(expr: &str, input: &str) -> TransformValue {
        Transform::compile(expr).unwrap().apply(input)
    }

    #[test]
    fn test_simple_ops() {
        assert_eq!(apply("upper", "abc"), TransformValue::Str("ABC".into()));
        assert_eq!(apply("stem", "a/b.txt"), TransformValue::Str("a/b".into()));
        assert_eq!(apply("ext", "a/b.txt"), TransformValue::Str(".txt".into()));
        assert_eq!(apply("basename", "a/b.txt"), TransformValue::Str("b.txt".into()));
    }

    #[test]
    fn test_chain() {
        assert_eq!(
            apply("basename|replace(.txt,)|upper", "dir/file.txt"),
            TransformValue::Str("FILE".into())
        );
    }

    #[test]
    fn test_split_yields_list() {
        assert_eq!(
            apply("split(,)", "a,b,c"),
            TransformValue::List(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_op_after_split_maps_elementwise() {
        assert_eq!(
            apply("split(,)|upper", "a,b"),
            TransformValue::List(vec!["A".into(), "B".into()])
        );
    }

    #[test]
    fn test_argument_text_taken_verbatim() {
        // Commas inside the parentheses belong to the argument.
        assert_eq!(
            apply("split(,,)", "a,,b,,c"),
            TransformValue::List(vec!["a".into(), "b".into(), "c".into()])
        );
        // replace divides at the first comma, so the replacement may
        // contain commas too.
        assert_eq!(
            apply("replace(a,b,c)", "xax"),
            TransformValue::Str("xb,cx".into())
        );
        assert_eq!(apply("suffix(,)", "x"), TransformValue::Str("x,".into()));
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(Transform::compile("exec(rm -rf /)").is_err());
        assert!(Transform::compile("nope").is_err());
    }

    #[test]
    fn test_bad_arity_rejected() {
        assert!(Transform::compile("replace(a)").is_err());
        assert!(Transform::compile("upper(x)").is_err());
    }

    #[test]
    fn test_set_compile() {
        let set =
            TransformSet::compile(&["tag=stem|upper".to_string(), "d=dirname".to_string()])
                .unwrap();
        assert!(set.get("tag").is_some());
        assert!(set.get("missing").is_none());
        assert!(TransformSet::compile(&["oops".to_string()]).is_err());
    }
}
