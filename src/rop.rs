//! ROP gadget discovery.
//!
//! Scans executable segments for short instruction sequences ending in
//! RET, JMP reg, or CALL reg, and indexes them by their normalized
//! assembly text so techniques can ask for `"pop rdi ; ret"` by name.

use std::collections::{BTreeMap, HashMap};

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};

use crate::disasm;
use crate::elf::Segment;

/// Bytes scanned backwards from each gadget end.
const MAX_GADGET_BYTES: usize = 20;

/// A discovered ROP gadget.
#[derive(Debug, Clone)]
pub struct Gadget {
    pub addr: u64,
    /// Instruction text joined by `" ; "` (e.g. `"pop rdi ; ret"`).
    pub instructions: String,
    pub bytes: Vec<u8>,
    pub insn_count: usize,
}

/// Type of gadget ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetType {
    Ret,
    JmpReg,
    CallReg,
}

/// Canonical form of gadget text used as the lookup key.
///
/// Lowercase, whitespace collapsed, no space after operand commas, and
/// instructions separated by `" ; "`.
pub fn normalize_asm(asm: &str) -> String {
    asm.split(';')
        .map(|insn| {
            insn.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .replace(", ", ",")
                .to_lowercase()
        })
        .filter(|insn| !insn.is_empty())
        .collect::<Vec<_>>()
        .join(" ; ")
}

/// All gadgets of a binary, addressable by text.
#[derive(Debug, Default)]
pub struct GadgetIndex {
    gadgets: Vec<Gadget>,
    by_text: HashMap<String, u64>,
}

impl GadgetIndex {
    /// Scan every executable segment.
    pub fn build(segments: &[Segment], max_depth: usize) -> Self {
        let max_depth = if max_depth == 0 { 5 } else { max_depth };
        let mut found: BTreeMap<u64, Gadget> = BTreeMap::new();

        for seg in segments.iter().filter(|s| s.executable) {
            scan_segment(&seg.data, seg.vaddr, max_depth, &mut found);
        }

        let gadgets: Vec<Gadget> = found.into_values().collect();
        let mut by_text = HashMap::new();
        // ascending address order, so the first insert wins
        for g in &gadgets {
            by_text.entry(normalize_asm(&g.instructions)).or_insert(g.addr);
        }
        log::debug!("indexed {} gadgets", gadgets.len());
        GadgetIndex { gadgets, by_text }
    }

    /// Lowest address of a gadget whose text matches `asm`.
    pub fn resolve(&self, asm: &str) -> Option<u64> {
        self.by_text.get(&normalize_asm(asm)).copied()
    }

    pub fn gadgets(&self) -> &[Gadget] {
        &self.gadgets
    }

    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }
}

fn scan_segment(segment: &[u8], vaddr: u64, max_depth: usize, gadgets: &mut BTreeMap<u64, Gadget>) {
    for (i, &byte) in segment.iter().enumerate() {
        if byte == 0xC3 {
            find_gadgets_ending_at(segment, vaddr, i + 1, max_depth, GadgetType::Ret, gadgets);
            continue;
        }
        // FF /4 = JMP r/m, FF /2 = CALL r/m, register-direct only
        if byte == 0xFF && i + 1 < segment.len() {
            let modrm = segment[i + 1];
            let reg_op = (modrm >> 3) & 7;
            if modrm >> 6 == 3 && (reg_op == 4 || reg_op == 2) {
                let kind = if reg_op == 4 { GadgetType::JmpReg } else { GadgetType::CallReg };
                find_gadgets_ending_at(segment, vaddr, i + 2, max_depth, kind, gadgets);
            }
        }
    }
}

/// Backward-scan from a gadget-ending instruction.
fn find_gadgets_ending_at(
    segment: &[u8],
    seg_vaddr: u64,
    end_pos: usize,
    max_depth: usize,
    gadget_type: GadgetType,
    gadgets: &mut BTreeMap<u64, Gadget>,
) {
    for back in 1..=MAX_GADGET_BYTES.min(end_pos) {
        let start = end_pos - back;
        let gadget_vaddr = seg_vaddr + start as u64;
        if let Some(gadget) =
            try_decode_gadget(&segment[start..end_pos], gadget_vaddr, max_depth, gadget_type)
        {
            gadgets.entry(gadget.addr).or_insert(gadget);
        }
    }
}

/// Decode `bytes` as a gadget that ends exactly at the expected transfer.
fn try_decode_gadget(
    bytes: &[u8],
    vaddr: u64,
    max_depth: usize,
    gadget_type: GadgetType,
) -> Option<Gadget> {
    let mut decoder = Decoder::with_ip(64, bytes, vaddr, DecoderOptions::NONE);
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut total_len = 0;

    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            return None;
        }
        total_len += insn.len();
        instructions.push(insn);

        let is_end = match gadget_type {
            GadgetType::Ret => insn.flow_control() == FlowControl::Return,
            GadgetType::JmpReg => insn.flow_control() == FlowControl::IndirectBranch,
            GadgetType::CallReg => insn.flow_control() == FlowControl::IndirectCall,
        };

        if is_end {
            if total_len != bytes.len() || instructions.len() > max_depth {
                return None;
            }
            let mut formatter = disasm::intel_formatter();
            let text: Vec<String> = instructions
                .iter()
                .map(|ins| disasm::format_insn(&mut formatter, ins))
                .collect();
            return Some(Gadget {
                addr: vaddr,
                instructions: text.join(" ; "),
                bytes: bytes.to_vec(),
                insn_count: instructions.len(),
            });
        }

        match insn.flow_control() {
            FlowControl::Return
            | FlowControl::IndirectBranch
            | FlowControl::IndirectCall
            | FlowControl::Call
            | FlowControl::ConditionalBranch
            | FlowControl::UnconditionalBranch => return None,
            _ => {}
        }

        if instructions.len() >= max_depth {
            return None;
        }
    }

    None
}

/// Filter gadgets by a case-insensitive substring.
pub fn filter_gadgets<'a>(gadgets: &'a [Gadget], pattern: &str) -> Vec<&'a Gadget> {
    let pattern_lower = pattern.to_lowercase();
    gadgets
        .iter()
        .filter(|g| g.instructions.to_lowercase().contains(&pattern_lower))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(vaddr: u64, data: &[u8]) -> Segment {
        Segment { vaddr, data: data.to_vec(), executable: true }
    }

    #[test]
    fn normalize_variants_agree() {
        assert_eq!(normalize_asm("pop r15 ; ret"), "pop r15 ; ret");
        assert_eq!(normalize_asm("POP  R15;ret"), "pop r15 ; ret");
        assert_eq!(normalize_asm("mov rdi, rax ; ret"), normalize_asm("mov rdi,rax;ret"));
    }

    #[test]
    fn decode_simple_ret_gadget() {
        let g = try_decode_gadget(&[0x5f, 0xc3], 0x1000, 5, GadgetType::Ret).unwrap();
        assert_eq!(g.addr, 0x1000);
        assert_eq!(g.insn_count, 2);
        assert_eq!(g.instructions, "pop rdi ; ret");
    }

    #[test]
    fn reject_too_deep() {
        // pop rax; pop rbx; pop rcx; pop rdx; pop rsi; pop rdi; ret
        let bytes = &[0x58, 0x5b, 0x59, 0x5a, 0x5e, 0x5f, 0xc3];
        assert!(try_decode_gadget(bytes, 0x4000, 3, GadgetType::Ret).is_none());
    }

    #[test]
    fn index_resolves_csu_tail_gadgets() {
        // pop r12 ; pop r13 ; pop r14 ; pop r15 ; ret
        let code = [0x41, 0x5c, 0x41, 0x5d, 0x41, 0x5e, 0x41, 0x5f, 0xc3];
        let index = GadgetIndex::build(&[segment(0x11b0, &code)], 5);
        assert_eq!(index.resolve("pop r15 ; ret"), Some(0x11b6));
        // 0x41 0x5f decodes as pop r15, 0x5f alone as pop rdi
        assert_eq!(index.resolve("pop rdi ; ret"), Some(0x11b7));
        assert_eq!(index.resolve("pop r14 ; pop r15 ; ret"), Some(0x11b4));
        assert_eq!(index.resolve("pop rax ; ret"), None);
    }

    #[test]
    fn index_prefers_lowest_address() {
        let code = [0x5f, 0xc3, 0x90, 0x5f, 0xc3];
        let index = GadgetIndex::build(&[segment(0x2000, &code)], 5);
        assert_eq!(index.resolve("pop rdi ; ret"), Some(0x2000));
    }

    #[test]
    fn index_skips_non_executable_segments() {
        let seg = Segment { vaddr: 0x3000, data: vec![0x5f, 0xc3], executable: false };
        assert!(GadgetIndex::build(&[seg], 5).is_empty());
    }

    #[test]
    fn filter_gadgets_by_pattern() {
        let index = GadgetIndex::build(&[segment(0x1000, &[0x5f, 0xc3, 0x5e, 0xc3])], 5);
        let filtered = filter_gadgets(index.gadgets(), "POP RSI");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].addr, 0x1002);
        assert_eq!(filter_gadgets(index.gadgets(), "ret").len(), index.len());
    }
}
