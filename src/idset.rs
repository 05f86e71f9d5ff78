//! Parser for compact integer id sets as used by `--cc`/`--bcc`.
//!
//! An idset is a comma separated list of non-negative integers and
//! inclusive ranges, e.g. `0-3,7,9-10`. Order and duplicates are
//! normalized: the expanded set is sorted and deduplicated.

use crate::error::{Error, Result};

/// Expand an idset string into a sorted, deduplicated list of ids.
pub fn parse(input: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::InvalidIdset(input.to_string()));
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidIdset(input.to_string()))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidIdset(input.to_string()))?;
                if lo > hi {
                    return Err(Error::InvalidIdset(input.to_string()));
                }
                ids.extend(lo..=hi);
            }
            None => {
                let id: u32 = part
                    .parse()
                    .map_err(|_| Error::InvalidIdset(input.to_string()))?;
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}
