//! Input expansion for `bulksubmit`.
//!
//! The trailing arguments of a bulksubmit invocation are split on `:::`
//! delimiter tokens into a command template and a series of input lists.
//! `::::` sources a list from a file (or stdin with `-`), and a `+` suffix
//! (`:::+`, `::::+`) marks a list as "linked": linked lists stay out of the
//! cartesian product and are instead cycled into every generated tuple at
//! their declared position, GNU parallel style.

use crate::error::{Error, Result};

/// A linked input list recorded at its declared group position.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub index: usize,
    pub values: Vec<String>,
}

/// Result of splitting the raw bulksubmit token stream.
#[derive(Debug, Default, PartialEq)]
pub struct SplitInputs {
    /// Command template tokens (everything before the first delimiter).
    pub command: Vec<String>,
    /// Ordinary input lists, in declaration order.
    pub lists: Vec<Vec<String>>,
    /// Linked input lists, in declaration order.
    pub links: Vec<LinkSpec>,
}

/// Decode the `--sep` option: escape sequences are expanded and the literal
/// string `none` selects whitespace splitting (returned as `None`).
pub fn decode_separator(raw: &str) -> Option<String> {
    if raw.eq_ignore_ascii_case("none") {
        return None;
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Some(out)
}

/// Split file or stdin contents into input values, dropping empty entries.
pub fn split_input(contents: &str, sep: Option<&str>) -> Vec<String> {
    match sep {
        Some(sep) => contents
            .split(sep)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => contents.split_whitespace().map(str::to_string).collect(),
    }
}

/// Split the raw token stream on `delim`-prefixed group markers.
///
/// `read_stdin` is only invoked when a file group names `-`.
pub fn split_command_inputs(
    tokens: &[String],
    sep: Option<&str>,
    delim: &str,
    read_stdin: &mut dyn FnMut() -> std::io::Result<String>,
) -> Result<SplitInputs> {
    let file_marker = format!("{delim}:");
    let link_marker = format!("{delim}+");
    let file_link_marker = format!("{delim}:+");

    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    for token in tokens {
        if token.starts_with(delim) {
            groups.push(Vec::new());
        }
        groups.last_mut().expect("at least one group").push(token.clone());
    }

    let mut result = SplitInputs {
        command: groups.remove(0),
        ..Default::default()
    };

    for (index, mut group) in groups.into_iter().enumerate() {
        let marker = group.remove(0);
        let linked = marker == link_marker || marker == file_link_marker;
        let values = if marker == file_marker || marker == file_link_marker {
            if group.len() > 1 {
                return Err(Error::MultipleFileArgs(marker));
            }
            let path = group.first().map(String::as_str).unwrap_or("-");
            let contents = if path == "-" {
                read_stdin()?
            } else {
                std::fs::read_to_string(path)?
            };
            split_input(&contents, sep)
        } else {
            group
        };

        if linked {
            result.links.push(LinkSpec { index, values });
        } else {
            // An empty list stays in place: the cartesian product over it
            // yields zero tuples, and an explicitly empty group must not
            // fall through to the read-stdin default.
            result.lists.push(values);
        }
    }

    Ok(result)
}

/// Cartesian product of the ordinary input lists, row-major in declaration
/// order. The product of zero lists is one empty tuple.
pub fn product(lists: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut tuples: Vec<Vec<String>> = vec![Vec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(tuples.len() * list.len());
        for tuple in &tuples {
            for value in list {
                let mut extended = tuple.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples
}

/// Cycle each linked list into every tuple at its declared index, wrapping
/// around when the linked list is shorter than the tuple count.
pub fn interleave_links(tuples: &mut [Vec<String>], links: &[LinkSpec]) {
    for link in links {
        if link.values.is_empty() {
            continue;
        }
        let mut cycle = link.values.iter().cycle();
        for tuple in tuples.iter_mut() {
            let value = cycle.next().expect("cycle never ends").clone();
            let at = link.index.min(tuple.len());
            tuple.insert(at, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toks(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn no_stdin() -> impl FnMut() -> std::io::Result<String> {
        || panic!("stdin should not be read")
    }

    #[test]
    fn test_split_plain_groups() {
        let tokens = toks(&["echo", "{}", ":::", "a", "b", ":::", "1", "2"]);
        let split = split_command_inputs(&tokens, Some("\n"), ":::", &mut no_stdin()).unwrap();
        assert_eq!(split.command, toks(&["echo", "{}"]));
        assert_eq!(split.lists, vec![toks(&["a", "b"]), toks(&["1", "2"])]);
        assert!(split.links.is_empty());
    }

    #[test]
    fn test_split_linked_group() {
        let tokens = toks(&["echo", ":::", "1", "2", ":::+", "x", "y", "z"]);
        let split = split_command_inputs(&tokens, Some("\n"), ":::", &mut no_stdin()).unwrap();
        assert_eq!(split.lists, vec![toks(&["1", "2"])]);
        assert_eq!(
            split.links,
            vec![LinkSpec {
                index: 1,
                values: toks(&["x", "y", "z"]),
            }]
        );
    }

    #[test]
    fn test_split_file_group() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "one\ntwo\n\nthree\n").unwrap();
        file.flush().unwrap();

        let tokens = toks(&["cat", "::::", &file.path().display().to_string()]);
        let split = split_command_inputs(&tokens, Some("\n"), ":::", &mut no_stdin()).unwrap();
        assert_eq!(split.lists, vec![toks(&["one", "two", "three"])]);
    }

    #[test]
    fn test_split_file_group_stdin() {
        let tokens = toks(&["cat", "::::", "-"]);
        let mut read = || Ok("a b c".to_string());
        let split = split_command_inputs(&tokens, None, ":::", &mut read).unwrap();
        assert_eq!(split.lists, vec![toks(&["a", "b", "c"])]);
    }

    #[test]
    fn test_split_file_group_multiple_args() {
        let tokens = toks(&["cat", "::::", "f1", "f2"]);
        let err = split_command_inputs(&tokens, Some("\n"), ":::", &mut no_stdin()).unwrap_err();
        assert!(matches!(err, Error::MultipleFileArgs(_)));
    }

    #[test]
    fn test_product_row_major() {
        let lists = vec![toks(&["a", "b"]), toks(&["1", "2", "3"])];
        let tuples = product(&lists);
        assert_eq!(tuples.len(), 6);
        assert!(tuples.iter().all(|t| t.len() == 2));
        assert_eq!(tuples[0], toks(&["a", "1"]));
        assert_eq!(tuples[1], toks(&["a", "2"]));
        assert_eq!(tuples[5], toks(&["b", "3"]));
    }

    #[test]
    fn test_product_of_nothing_is_one_empty_tuple() {
        assert_eq!(product(&[]), vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_product_with_empty_list_is_empty() {
        let lists = vec![toks(&["a", "b"]), Vec::new()];
        assert!(product(&lists).is_empty());
    }

    #[test]
    fn test_empty_file_group_is_retained() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let tokens = toks(&["echo", "{0}", ":::", "a", "::::", &file.path().display().to_string()]);
        let split = split_command_inputs(&tokens, Some("\n"), ":::", &mut no_stdin()).unwrap();
        assert_eq!(split.lists, vec![toks(&["a"]), Vec::new()]);
    }

    #[test]
    fn test_links_cycle_with_period() {
        let mut tuples = product(&[toks(&["1", "2"]), toks(&["a", "b"])]);
        let links = vec![LinkSpec {
            index: 2,
            values: toks(&["x", "y", "z"]),
        }];
        interleave_links(&mut tuples, &links);
        let third: Vec<&str> = tuples.iter().map(|t| t[2].as_str()).collect();
        assert_eq!(third, vec!["x", "y", "z", "x"]);
    }

    #[test]
    fn test_link_inserted_at_declared_position() {
        // ::::+ declared first, so its values land at index 0.
        let mut tuples = product(&[toks(&["a", "b"])]);
        let links = vec![LinkSpec {
            index: 0,
            values: toks(&["x"]),
        }];
        interleave_links(&mut tuples, &links);
        assert_eq!(tuples, vec![toks(&["x", "a"]), toks(&["x", "b"])]);
    }

    #[test]
    fn test_decode_separator() {
        assert_eq!(decode_separator("\\n").as_deref(), Some("\n"));
        assert_eq!(decode_separator("\\t").as_deref(), Some("\t"));
        assert_eq!(decode_separator(",").as_deref(), Some(","));
        assert_eq!(decode_separator("none"), None);
    }

    #[test]
    fn test_split_input_whitespace() {
        assert_eq!(split_input("a  b\nc", None), toks(&["a", "b", "c"]));
    }
}
