//! Byte pattern search.
//!
//! Exact needles are matched with Knuth-Morris-Pratt; IDA-style patterns
//! with `??` wildcards fall back to a masked scan.

use crate::error::{Error, Result};

/// Return every offset at which `needle` occurs in `haystack`.
///
/// Overlapping occurrences are reported. An empty needle matches nothing.
pub fn kmp(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }

    let failure = failure_table(needle);
    let mut matches = Vec::new();
    let mut k = 0;

    for (i, &byte) in haystack.iter().enumerate() {
        while k > 0 && needle[k] != byte {
            k = failure[k - 1];
        }
        if needle[k] == byte {
            k += 1;
        }
        if k == needle.len() {
            matches.push(i + 1 - needle.len());
            k = failure[k - 1];
        }
    }
    matches
}

/// `failure[i]` is the length of the longest proper prefix of
/// `needle[..=i]` that is also its suffix.
fn failure_table(needle: &[u8]) -> Vec<usize> {
    let mut failure = vec![0; needle.len()];
    let mut k = 0;
    for i in 1..needle.len() {
        while k > 0 && needle[k] != needle[i] {
            k = failure[k - 1];
        }
        if needle[k] == needle[i] {
            k += 1;
        }
        failure[i] = k;
    }
    failure
}

/// Search for a u64 value (little-endian).
pub fn scan_u64(data: &[u8], value: u64) -> Vec<usize> {
    kmp(data, &value.to_le_bytes())
}

/// Parse an IDA-style hex pattern into bytes and mask.
///
/// Pattern format: `"41 5f ?? c3"` where `??` is a wildcard byte.
/// `mask[i] == true` means `bytes[i]` must match.
pub fn parse_hex_pattern(pattern: &str) -> Result<(Vec<u8>, Vec<bool>)> {
    let mut bytes = Vec::new();
    let mut mask = Vec::new();

    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(0);
            mask.push(false);
        } else {
            let b = u8::from_str_radix(token, 16)
                .map_err(|_| Error::Other(format!("invalid hex byte: '{}'", token)))?;
            bytes.push(b);
            mask.push(true);
        }
    }

    if bytes.is_empty() {
        return Err(Error::Other("empty pattern".into()));
    }

    Ok((bytes, mask))
}

/// Scan a buffer for a byte pattern with wildcards.
pub fn scan_pattern(data: &[u8], pattern: &[u8], mask: &[bool]) -> Vec<usize> {
    if pattern.is_empty() || pattern.len() > data.len() {
        return Vec::new();
    }
    if mask.iter().all(|&m| m) {
        return kmp(data, pattern);
    }

    let mut matches = Vec::new();
    'outer: for i in 0..=data.len() - pattern.len() {
        for (j, (&pat_byte, &must_match)) in pattern.iter().zip(mask.iter()).enumerate() {
            if must_match && data[i + j] != pat_byte {
                continue 'outer;
            }
        }
        matches.push(i);
    }
    matches
}
