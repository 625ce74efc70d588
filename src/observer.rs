//! Instruction-stream observer.
//!
//! Hooks the host's translation and execution callbacks for the target
//! image: every executed `syscall` is reported with its arguments, and a
//! symbolic program counter ends exploit generation for that state.

use crate::config::Config;
use crate::disasm::{self, MAX_INSN_LEN};
use crate::error::Result;
use crate::host::ExecutionHost;
use crate::search;
use crate::types::X64Reg;

const SYSCALL: [u8; 2] = [0x0f, 0x05];
const RET: [u8; 1] = [0xc3];

/// A `syscall` about to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallEvent {
    pub pc: u64,
    pub number: u64,
    pub args: [u64; 6],
}

pub struct InstructionObserver {
    target_image: String,
    kernel_start: u64,
    hooked: bool,
}

impl InstructionObserver {
    pub fn new(target_image: &str, kernel_start: u64) -> Self {
        InstructionObserver {
            target_image: target_image.to_string(),
            kernel_start,
            hooked: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.target_image, config.kernel_start)
    }

    pub fn is_hooked(&self) -> bool {
        self.hooked
    }

    /// Start observing once the target image is loaded.
    pub fn on_process_load(&mut self, image: &str) {
        if !self.target_image.is_empty() && image.contains(&self.target_image) {
            log::info!("hooking instructions of {}", image);
            self.hooked = true;
        }
    }

    /// Whether the instruction at `pc` should be instrumented.
    pub fn on_translate_instruction(&self, pc: u64) -> bool {
        self.hooked && pc < self.kernel_start
    }

    /// Inspect the instruction at `pc`; returns the syscall it makes, if any.
    pub fn on_instruction(&self, host: &dyn ExecutionHost, pc: u64) -> Result<Option<SyscallEvent>> {
        let mut buf = [0u8; MAX_INSN_LEN];
        let len = fetch(host, pc, &mut buf)?;
        let Some(insn) = disasm::decode_one(&buf[..len], pc) else {
            return Ok(None);
        };
        if insn.mnemonic != "syscall" {
            return Ok(None);
        }

        let mut args = [0u64; 6];
        for (slot, reg) in args.iter_mut().zip(X64Reg::SYSCALL_ARGS) {
            *slot = host.read_register(reg)?;
        }
        let event = SyscallEvent { pc, number: host.read_register(X64Reg::Rax)?, args };
        log::info!(
            "syscall: {:#x} ({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
            event.number, args[0], args[1], args[2], args[3], args[4], args[5]
        );
        Ok(Some(event))
    }

    /// The program counter became symbolic: the overflow took control.
    pub fn on_symbolic_rip(&self, host: &mut dyn ExecutionHost, concrete_pc: u64) {
        log::warn!("state {}: symbolic rip, concrete value {:#x}", host.state_id(), concrete_pc);
        host.terminate_state("End of exploit generation");
    }
}

/// Read as many of the bytes at `pc` as are mapped, up to `buf.len()`.
fn fetch(host: &dyn ExecutionHost, pc: u64, buf: &mut [u8]) -> Result<usize> {
    let mut len = buf.len();
    loop {
        match host.read_memory(pc, &mut buf[..len]) {
            Ok(()) => return Ok(len),
            Err(e) if len == 1 => return Err(e),
            Err(_) => len -= 1,
        }
    }
}

/// Instruction boundaries in `code` where `needle` decodes as `mnemonic`.
fn find_instructions(code: &[u8], base: u64, needle: &[u8], mnemonic: &str) -> Vec<u64> {
    search::kmp(code, needle)
        .into_iter()
        .filter_map(|off| {
            let addr = base + off as u64;
            disasm::decode_one(&code[off..], addr)
                .filter(|insn| insn.mnemonic == mnemonic)
                .map(|_| addr)
        })
        .collect()
}

pub fn find_syscalls(code: &[u8], base: u64) -> Vec<u64> {
    find_instructions(code, base, &SYSCALL, "syscall")
}

pub fn find_rets(code: &[u8], base: u64) -> Vec<u64> {
    find_instructions(code, base, &RET, "ret")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;

    fn observer() -> InstructionObserver {
        let config = Config { target_image: "vuln".into(), ..Config::default() };
        let mut obs = InstructionObserver::from_config(&config);
        obs.on_process_load("/tmp/vuln");
        obs
    }

    #[test]
    fn hooks_only_target_image() {
        let mut obs = InstructionObserver::new("vuln", 0xffff_8000_0000_0000);
        obs.on_process_load("/lib/x86_64-linux-gnu/libc.so.6");
        assert!(!obs.on_translate_instruction(0x401000));
        obs.on_process_load("/tmp/vuln");
        assert!(obs.is_hooked());
        assert!(obs.on_translate_instruction(0x401000));
        assert!(!obs.on_translate_instruction(0xffff_ffff_8100_0000));
    }

    #[test]
    fn reports_syscall_arguments() {
        let mut host = MockHost::default();
        host.map(0x401000, &[0x0f, 0x05]);
        host.map(0x401002, &[0x90; 13]);
        host.registers.insert(X64Reg::Rax, 59);
        host.registers.insert(X64Reg::Rdi, 0x402000);
        host.registers.insert(X64Reg::R9, 6);

        let event = observer().on_instruction(&host, 0x401000).unwrap().unwrap();
        assert_eq!(event.number, 59);
        assert_eq!(event.args, [0x402000, 0, 0, 0, 0, 6]);
    }

    #[test]
    fn syscall_at_end_of_mapping() {
        let mut host = MockHost::default();
        host.map(0x401ffe, &[0x0f, 0x05]);
        host.registers.insert(X64Reg::Rax, 60);
        let event = observer().on_instruction(&host, 0x401ffe).unwrap().unwrap();
        assert_eq!(event.number, 60);
    }

    #[test]
    fn ignores_other_instructions() {
        let mut host = MockHost::default();
        host.map(0x401000, &[0x90; 15]);
        assert_eq!(observer().on_instruction(&host, 0x401000).unwrap(), None);
    }

    #[test]
    fn unreadable_pc_is_an_error() {
        let host = MockHost::default();
        assert!(observer().on_instruction(&host, 0x401000).is_err());
    }

    #[test]
    fn symbolic_rip_terminates() {
        let mut host = MockHost::default();
        observer().on_symbolic_rip(&mut host, 0x4141414141414141);
        assert_eq!(host.terminated.as_deref(), Some("End of exploit generation"));
    }

    #[test]
    fn finds_instruction_boundaries() {
        // mov eax, 0x050f ; syscall ; ret
        let code = [0xb8, 0x0f, 0x05, 0x00, 0x00, 0x0f, 0x05, 0xc3];
        // 0f 05 inside the immediate also decodes on its own
        assert_eq!(find_syscalls(&code, 0x1000), vec![0x1001, 0x1005]);
        assert_eq!(find_rets(&code, 0x1000), vec![0x1007]);
    }
}
