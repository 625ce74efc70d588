//! x86_64 disassembly using iced-x86.
//!
//! Everything that turns bytes into instruction text goes through here so
//! gadget text, CSU parsing and listings agree on one format: Intel syntax,
//! `0x`-prefixed lowercase hex (small values in decimal), a space after
//! each operand comma.

use iced_x86::{Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind,
               GasFormatter, Instruction, IntelFormatter, Mnemonic};

use crate::types::VirtAddr;

/// Longest legal x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Disassembly output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasmStyle {
    /// Intel syntax (e.g., `mov rax, [rbx+8]`)
    Intel,
    /// AT&T / GAS syntax (e.g., `movq 8(%rbx), %rax`)
    Gas,
}

/// One decoded instruction with its Intel text split the way analysis
/// code wants it.
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    pub addr: u64,
    pub len: usize,
    pub mnemonic: String,
    pub op_str: String,
    pub insn: Instruction,
}

impl DecodedInsn {
    pub fn text(&self) -> String {
        if self.op_str.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.op_str)
        }
    }

    pub fn next_addr(&self) -> u64 {
        self.addr + self.len as u64
    }

    pub fn is(&self, mnemonic: Mnemonic) -> bool {
        self.insn.mnemonic() == mnemonic
    }
}

/// A single disassembled instruction for listings.
#[derive(Debug, Clone)]
pub struct DisasmInstruction {
    pub addr: VirtAddr,
    pub bytes: Vec<u8>,
    pub text: String,
    pub len: usize,
}

/// The Intel formatter every module shares.
pub fn intel_formatter() -> IntelFormatter {
    let mut formatter = IntelFormatter::new();
    let options = formatter.options_mut();
    options.set_space_after_operand_separator(true);
    options.set_hex_prefix("0x");
    options.set_hex_suffix("");
    options.set_uppercase_hex(false);
    formatter
}

/// Format one instruction in the shared Intel style.
pub fn format_insn(formatter: &mut IntelFormatter, insn: &Instruction) -> String {
    let mut output = TextOutput::default();
    formatter.format(insn, &mut output);
    output.text
}

/// Decode the first instruction of `bytes`, placed at `addr`.
///
/// Returns `None` if the bytes don't start with a valid instruction.
pub fn decode_one(bytes: &[u8], addr: u64) -> Option<DecodedInsn> {
    let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let insn = decoder.decode();
    if insn.is_invalid() {
        return None;
    }
    Some(describe(&mut intel_formatter(), insn))
}

/// Linear sweep over `bytes`, stopping at the first undecodable byte.
pub fn decode_all(bytes: &[u8], addr: u64) -> Vec<DecodedInsn> {
    let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
    let mut formatter = intel_formatter();
    let mut out = Vec::new();
    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            break;
        }
        out.push(describe(&mut formatter, insn));
    }
    out
}

fn describe(formatter: &mut IntelFormatter, insn: Instruction) -> DecodedInsn {
    let mut mnemonic = TextOutput::default();
    formatter.format_mnemonic(&insn, &mut mnemonic);
    let mut operands = TextOutput::default();
    formatter.format_all_operands(&insn, &mut operands);
    DecodedInsn {
        addr: insn.ip(),
        len: insn.len(),
        mnemonic: mnemonic.text,
        op_str: operands.text,
        insn,
    }
}

/// Disassemble up to `count` instructions for display.
pub fn disassemble(
    code: &[u8],
    base_addr: VirtAddr,
    count: usize,
    style: DisasmStyle,
) -> Vec<DisasmInstruction> {
    let mut decoder = Decoder::with_ip(64, code, base_addr.addr(), DecoderOptions::NONE);
    let mut intel = intel_formatter();
    let mut gas = GasFormatter::new();
    let mut results = Vec::new();

    while decoder.can_decode() && results.len() < count {
        let insn = decoder.decode();
        let mut output = TextOutput::default();
        match style {
            DisasmStyle::Intel => intel.format(&insn, &mut output),
            DisasmStyle::Gas => gas.format(&insn, &mut output),
        }

        let start = (insn.ip() - base_addr.addr()) as usize;
        results.push(DisasmInstruction {
            addr: VirtAddr(insn.ip()),
            bytes: code[start..start + insn.len()].to_vec(),
            text: output.text,
            len: insn.len(),
        });
    }

    results
}

/// Format disassembly output as a human-readable string.
pub fn format_disassembly(instructions: &[DisasmInstruction]) -> String {
    let mut out = String::new();
    for insn in instructions {
        let bytes: Vec<String> = insn.bytes.iter().map(|b| format!("{:02x}", b)).collect();
        out.push_str(&format!(
            "  {:016x}  {:<30} {}\n",
            insn.addr.addr(),
            bytes.join(" "),
            insn.text
        ));
    }
    out
}

#[derive(Default)]
struct TextOutput {
    text: String,
}

impl FormatterOutput for TextOutput {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_one_splits_mnemonic_and_operands() {
        // mov rdx, r14
        let insn = decode_one(&[0x4c, 0x89, 0xf2, 0x90], 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.op_str, "rdx, r14");
        assert_eq!(insn.len, 3);
        assert_eq!(insn.next_addr(), 0x1003);
        assert!(insn.is(Mnemonic::Mov));
    }

    #[test]
    fn decode_one_syscall_and_invalid() {
        let insn = decode_one(&[0x0f, 0x05], 0x401000).unwrap();
        assert_eq!(insn.text(), "syscall");
        assert!(decode_one(&[], 0).is_none());
        // lone REX prefix runs out of bytes
        assert!(decode_one(&[0x48], 0).is_none());
    }

    #[test]
    fn decode_all_csu_tail() {
        // add rsp, 8 ; pop rbx ; pop rbp ; ret
        let code = [0x48, 0x83, 0xc4, 0x08, 0x5b, 0x5d, 0xc3];
        let insns = decode_all(&code, 0x11a6);
        let text: Vec<String> = insns.iter().map(|i| i.text()).collect();
        assert_eq!(text, vec!["add rsp, 8", "pop rbx", "pop rbp", "ret"]);
        assert_eq!(insns[1].addr, 0x11aa);
    }

    #[test]
    fn disassemble_count_limit() {
        let code = [0x90; 100];
        let insns = disassemble(&code, VirtAddr(0x0), 5, DisasmStyle::Intel);
        assert_eq!(insns.len(), 5);
        assert_eq!(insns[4].addr, VirtAddr(4));
    }

    #[test]
    fn disassemble_gas_style() {
        let insns = disassemble(&[0x55], VirtAddr(0x0), 1, DisasmStyle::Gas);
        assert!(insns[0].text.contains("%rbp"));
    }

    #[test]
    fn format_disassembly_output() {
        let insns = disassemble(&[0x90, 0xcc], VirtAddr(0x1000), 10, DisasmStyle::Intel);
        let output = format_disassembly(&insns);
        assert!(output.contains("0000000000001000"));
        assert!(output.contains("nop"));
        assert!(output.contains("int3"));
    }
}
