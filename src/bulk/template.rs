//! Command template instantiation.
//!
//! Every command token and mutable option value is a format template whose
//! positional fields are bound to one input tuple:
//!
//! - `{}` / `{0}`..`{N}` — the raw input value
//! - `{0.%}`   — value without filename extension
//! - `{0./}`   — basename
//! - `{0.//}`  — dirname
//! - `{0./%}`  — basename without filename extension
//! - `{0.NAME}` — a `--define`d transform
//! - `{seq}`   — the job sequence index
//!
//! `{{` and `}}` are user-content escapes and pass through verbatim, so e.g.
//! an `--output=app-{{id}}.out` mustache template survives instantiation.

use crate::error::{Error, Result};

use super::transform::{TransformSet, TransformValue};

/// Joiner for list-valued transforms, split back out into separate tokens
/// after formatting. A control character keeps it out of the way of any
/// value a user could plausibly pass on a command line.
const LIST_JOINER: char = '\u{1e}';

const STACHE_OPEN: char = '\u{2}';
const STACHE_CLOSE: char = '\u{3}';

/// Split `s` into (stem, extension) like `os.path.splitext`: the extension
/// starts at the last dot of the final path component, unless that component
/// has nothing but dots before it.
pub(crate) fn splitext(s: &str) -> (&str, &str) {
    let base_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
    if let Some(dot) = s.rfind('.') {
        if dot > base_start && s[base_start..dot].chars().any(|c| c != '.') {
            return (&s[..dot], &s[dot..]);
        }
    }
    (s, "")
}

pub(crate) fn basename(s: &str) -> &str {
    match s.rfind('/') {
        Some(i) => &s[i + 1..],
        None => s,
    }
}

pub(crate) fn dirname(s: &str) -> &str {
    match s.rfind('/') {
        Some(0) => "/",
        Some(i) => &s[..i],
        None => "",
    }
}

/// Render one template into a single string. List-valued transforms are
/// joined with a single space.
pub fn render_value(
    template: &str,
    inputs: &[String],
    seq: usize,
    transforms: &TransformSet,
) -> Result<String> {
    Ok(format_template(template, inputs, seq, transforms)?.replace(LIST_JOINER, " "))
}

/// Render one command token, splitting list-valued transforms into separate
/// argv tokens.
pub fn render_args(
    template: &str,
    inputs: &[String],
    seq: usize,
    transforms: &TransformSet,
) -> Result<Vec<String>> {
    let rendered = format_template(template, inputs, seq, transforms)?;
    Ok(rendered.split(LIST_JOINER).map(str::to_string).collect())
}

fn format_template(
    template: &str,
    inputs: &[String],
    seq: usize,
    transforms: &TransformSet,
) -> Result<String> {
    // Protect user-content escapes so `{{id}}` is never parsed as a field.
    let protected = template
        .replace("{{", &STACHE_OPEN.to_string())
        .replace("}}", &STACHE_CLOSE.to_string());

    let mut out = String::with_capacity(protected.len());
    let mut chars = protected.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    field.push(c);
                }
                if !closed {
                    return Err(Error::TemplateSyntax(format!(
                        "unmatched '{{' in '{template}'"
                    )));
                }
                out.push_str(&resolve_field(&field, template, inputs, seq, transforms)?);
            }
            '}' => {
                return Err(Error::TemplateSyntax(format!(
                    "unmatched '}}' in '{template}'"
                )))
            }
            _ => out.push(ch),
        }
    }

    Ok(out
        .replace(STACHE_OPEN, "{{")
        .replace(STACHE_CLOSE, "}}"))
}

fn resolve_field(
    field: &str,
    template: &str,
    inputs: &[String],
    seq: usize,
    transforms: &TransformSet,
) -> Result<String> {
    if field == "seq" {
        return Ok(seq.to_string());
    }

    let (index_str, accessor) = match field.split_once('.') {
        Some((idx, accessor)) => (idx, Some(accessor)),
        None => (field, None),
    };

    let index: usize = if index_str.is_empty() {
        0
    } else {
        index_str.parse().map_err(|_| {
            Error::TemplateSyntax(format!("unknown field '{field}' in '{template}'"))
        })?
    };

    let value = inputs.get(index).ok_or_else(|| Error::TemplateIndex {
        template: template.to_string(),
    })?;

    let Some(accessor) = accessor else {
        return Ok(value.clone());
    };

    match accessor {
        "%" => Ok(splitext(value).0.to_string()),
        "/" => Ok(basename(value).to_string()),
        "//" => Ok(dirname(value).to_string()),
        "/%" => Ok(basename(splitext(value).0).to_string()),
        name => match transforms.get(name) {
            Some(transform) => Ok(match transform.apply(value) {
                TransformValue::Str(s) => s,
                TransformValue::List(items) => {
                    items.join(&LIST_JOINER.to_string())
                }
            }),
            None => Err(Error::UnknownField(name.to_string())),
        },
    }
}
