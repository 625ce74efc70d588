//! Turning symbolic subchains into bytes.

use crate::error::{Error, Result};
use crate::expr::{Expr, ExprRef};
use crate::rop_chain::RopSubchain;

pub fn p64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Every placeholder tag still present, in slot order.
pub fn unresolved_placeholders(subchains: &[RopSubchain]) -> Vec<String> {
    subchains
        .iter()
        .flatten()
        .flat_map(|slot| slot.placeholders())
        .collect()
}

/// Fail with the first leftover placeholder.
pub fn check_resolved(subchains: &[RopSubchain]) -> Result<()> {
    match unresolved_placeholders(subchains).into_iter().next() {
        Some(tag) => Err(Error::UnhandledPlaceholder(tag)),
        None => Ok(()),
    }
}

/// Serialize a slot: byte vectors raw, everything else as a 64-bit
/// little-endian word.
pub fn flatten_slot(slot: &ExprRef, out: &mut Vec<u8>) -> Result<()> {
    match slot.as_ref() {
        Expr::ByteVector(data) => out.extend_from_slice(data),
        _ => out.extend_from_slice(&p64(slot.evaluate()?)),
    }
    Ok(())
}

/// Concatenate subchains into the final payload bytes.
pub fn flatten(subchains: &[RopSubchain]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for slot in subchains.iter().flatten() {
        flatten_slot(slot, &mut out)?;
    }
    Ok(out)
}

/// One line per slot: offset, value (if concrete) and symbolic form.
pub fn format_chain(subchains: &[RopSubchain]) -> String {
    let mut out = String::new();
    let mut offset = 0usize;
    for (i, subchain) in subchains.iter().enumerate() {
        out.push_str(&format!("# subchain {}\n", i));
        for slot in subchain {
            let width = match slot.as_ref() {
                Expr::ByteVector(data) => data.len(),
                _ => 8,
            };
            let value = match slot.evaluate() {
                Ok(v) => format!("{:#018x}", v),
                Err(_) => "?".repeat(18),
            };
            out.push_str(&format!("  +{:#06x}  {}  {}\n", offset, value, slot));
            offset += width;
        }
    }
    out
}
