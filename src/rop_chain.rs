//! Constraint-driven ROP chain builder.
//!
//! Classifies gadgets by semantic effect and grows a chain one constraint
//! at a time: "rdi must hold X", "memory at A must hold V", "return to R".
//! Registers are set through a direct pop or a BFS path over register
//! moves. Slots are symbolic [`Expr`]s, so values that depend on a base
//! which is not known yet stay printable as `elf_base + pop_rdi_ret`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use iced_x86::{Code, Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory,
               OpAccess, OpKind, Register};

use crate::elf::{BinaryKind, ElfFile};
use crate::error::{Error, Result};
use crate::exploit::to_var_name;
use crate::expr::{Expr, ExprRef};
use crate::rop::Gadget;
use crate::types::X64Reg;

/// Consecutive stack slots of one chain fragment.
pub type RopSubchain = Vec<ExprRef>;

pub const SYS_EXECVE: u64 = 59;

/// Semantic classification of a gadget's effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GadgetEffect {
    /// `pop REG; [pop ...;] ret`
    PopReg(X64Reg),
    /// `xor REG, REG; ret`
    ZeroReg(X64Reg),
    /// `mov DST, SRC; ret`
    MovRegReg { dst: X64Reg, src: X64Reg },
    /// `syscall; ret` or a bare `syscall`.
    Syscall,
    /// `ret` only.
    Ret,
    /// `mov qword ptr [BASE], VAL; ret`
    WriteMemReg { base: X64Reg, value: X64Reg },
    Unknown,
}

/// A gadget with classified semantic effect.
#[derive(Debug, Clone)]
pub struct ClassifiedGadget {
    pub gadget: Gadget,
    pub effect: GadgetEffect,
    /// Stack slots consumed by pops after the first.
    pub extra_pops: usize,
    /// General purpose registers the gadget overwrites.
    pub writes: BTreeSet<X64Reg>,
}

/// Classify a gadget by decoding its instructions with iced-x86.
pub fn classify_gadget(gadget: &Gadget) -> ClassifiedGadget {
    let mut decoder = Decoder::with_ip(64, &gadget.bytes, gadget.addr, DecoderOptions::NONE);
    let mut insns = Vec::new();

    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            return ClassifiedGadget {
                gadget: gadget.clone(),
                effect: GadgetEffect::Unknown,
                extra_pops: 0,
                writes: BTreeSet::new(),
            };
        }
        insns.push(insn);
    }

    let effect = classify_insns(&insns);
    let extra_pops = match effect {
        GadgetEffect::PopReg(_) => insns.iter().filter(|i| is_pop64(i)).count().saturating_sub(1),
        _ => 0,
    };

    ClassifiedGadget {
        gadget: gadget.clone(),
        effect,
        extra_pops,
        writes: written_registers(&insns),
    }
}

fn written_registers(insns: &[Instruction]) -> BTreeSet<X64Reg> {
    let mut factory = InstructionInfoFactory::new();
    let mut writes = BTreeSet::new();
    for insn in insns {
        for used in factory.info(insn).used_registers() {
            let written = matches!(
                used.access(),
                OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            );
            if let Some(reg) = X64Reg::from_iced(used.register()).filter(|_| written) {
                if reg != X64Reg::Rsp && reg != X64Reg::Rip {
                    writes.insert(reg);
                }
            }
        }
    }
    writes
}

fn classify_insns(insns: &[Instruction]) -> GadgetEffect {
    let Some((last, body)) = insns.split_last() else {
        return GadgetEffect::Unknown;
    };

    if body.is_empty() {
        if is_ret(last) {
            return GadgetEffect::Ret;
        }
        if is_syscall(last) {
            return GadgetEffect::Syscall;
        }
        return GadgetEffect::Unknown;
    }
    if !is_ret(last) {
        return GadgetEffect::Unknown;
    }

    let first = &body[0];

    // pop REG; ret, possibly with more pops before the ret
    if body.iter().all(is_pop64) {
        return match X64Reg::from_iced(first.op0_register()) {
            Some(X64Reg::Rsp) | None => GadgetEffect::Unknown,
            Some(reg) => GadgetEffect::PopReg(reg),
        };
    }

    if body.len() != 1 {
        return GadgetEffect::Unknown;
    }

    if is_xor_self(first) {
        if let Some(reg) = X64Reg::from_iced(first.op0_register()) {
            return GadgetEffect::ZeroReg(reg);
        }
    }

    if is_mov_reg_reg(first) {
        if let (Some(dst), Some(src)) = (
            X64Reg::from_iced(first.op0_register()),
            X64Reg::from_iced(first.op1_register()),
        ) {
            if dst != src && dst != X64Reg::Rsp {
                return GadgetEffect::MovRegReg { dst, src };
            }
        }
    }

    if is_mov_mem_reg(first)
        && first.memory_displacement64() == 0
        && first.memory_index() == Register::None
    {
        if let (Some(base), Some(value)) = (
            X64Reg::from_iced(first.memory_base()),
            X64Reg::from_iced(first.op1_register()),
        ) {
            if base != value {
                return GadgetEffect::WriteMemReg { base, value };
            }
        }
    }

    if is_syscall(first) {
        return GadgetEffect::Syscall;
    }

    GadgetEffect::Unknown
}

fn is_ret(insn: &Instruction) -> bool {
    insn.flow_control() == FlowControl::Return && insn.code() == Code::Retnq
}

fn is_pop64(insn: &Instruction) -> bool {
    matches!(insn.code(), Code::Pop_r64 | Code::Pop_rm64) && insn.op0_kind() == OpKind::Register
}

fn is_xor_self(insn: &Instruction) -> bool {
    matches!(insn.code(),
        Code::Xor_r32_rm32 | Code::Xor_r64_rm64 |
        Code::Xor_rm32_r32 | Code::Xor_rm64_r64
    ) && insn.op0_kind() == OpKind::Register
        && insn.op1_kind() == OpKind::Register
        && insn.op0_register() == insn.op1_register()
}

fn is_mov_reg_reg(insn: &Instruction) -> bool {
    insn.op0_kind() == OpKind::Register
        && insn.op1_kind() == OpKind::Register
        && matches!(insn.code(), Code::Mov_r64_rm64 | Code::Mov_rm64_r64)
}

fn is_mov_mem_reg(insn: &Instruction) -> bool {
    insn.code() == Code::Mov_rm64_r64 && insn.op0_kind() == OpKind::Memory
}

fn is_syscall(insn: &Instruction) -> bool {
    insn.code() == Code::Syscall
}

/// One planned stack slot.
#[derive(Debug, Clone)]
enum Step {
    Gadget(usize),
    Value(ExprRef),
    /// Slot consumed by a pop whose value doesn't matter.
    Filler,
}

/// Saved builder position for [`RopChainBuilder::rollback`].
#[derive(Debug, Clone)]
pub struct Checkpoint {
    len: usize,
    registers: BTreeMap<X64Reg, ExprRef>,
    pinned: BTreeSet<X64Reg>,
}

pub struct RopChainBuilder {
    classified: Vec<ClassifiedGadget>,
    pop_index: HashMap<X64Reg, Vec<usize>>,
    mov_index: BTreeMap<(X64Reg, X64Reg), Vec<usize>>,
    syscall_indices: Vec<usize>,
    write_indices: Vec<usize>,
    ret_index: Option<usize>,
    zero_index: HashMap<X64Reg, Vec<usize>>,
    kind: BinaryKind,
    base: u64,
    base_tag: &'static str,
    chain: RopSubchain,
    /// Values the chain has put into registers so far.
    registers: BTreeMap<X64Reg, ExprRef>,
    /// Registers constrained in the current batch; later gadgets must not
    /// overwrite them.
    pinned: BTreeSet<X64Reg>,
}

impl RopChainBuilder {
    /// Builder over raw gadgets at absolute addresses.
    pub fn new(gadgets: &[Gadget]) -> Self {
        let classified: Vec<ClassifiedGadget> = gadgets.iter().map(classify_gadget).collect();
        let mut pop_index: HashMap<X64Reg, Vec<usize>> = HashMap::new();
        let mut mov_index: BTreeMap<(X64Reg, X64Reg), Vec<usize>> = BTreeMap::new();
        let mut syscall_indices = Vec::new();
        let mut write_indices = Vec::new();
        let mut ret_index = None;
        let mut zero_index: HashMap<X64Reg, Vec<usize>> = HashMap::new();

        for (i, cg) in classified.iter().enumerate() {
            match &cg.effect {
                GadgetEffect::PopReg(reg) => pop_index.entry(*reg).or_default().push(i),
                GadgetEffect::MovRegReg { dst, src } => {
                    mov_index.entry((*dst, *src)).or_default().push(i)
                }
                GadgetEffect::Syscall => syscall_indices.push(i),
                GadgetEffect::WriteMemReg { .. } => write_indices.push(i),
                GadgetEffect::Ret => {
                    ret_index.get_or_insert(i);
                }
                GadgetEffect::ZeroReg(reg) => zero_index.entry(*reg).or_default().push(i),
                GadgetEffect::Unknown => {}
            }
        }

        // fewest extra pops first
        for pops in pop_index.values_mut() {
            pops.sort_by_key(|&i| classified[i].extra_pops);
        }

        Self {
            classified,
            pop_index,
            mov_index,
            syscall_indices,
            write_indices,
            ret_index,
            zero_index,
            kind: BinaryKind::Elf,
            base: 0,
            base_tag: "",
            chain: RopSubchain::new(),
            registers: BTreeMap::new(),
            pinned: BTreeSet::new(),
        }
    }

    /// Builder over a binary's gadget index; gadget slots are relative to
    /// the binary's base.
    pub fn from_elf(elf: &ElfFile) -> Self {
        let mut builder = Self::new(elf.gadgets().gadgets());
        builder.kind = elf.kind();
        builder.base = elf.base();
        builder.base_tag = elf.base_tag();
        builder
    }

    pub fn chain(&self) -> &RopSubchain {
        &self.chain
    }

    /// Value the chain last loaded into `reg`, if still intact.
    pub fn register_value(&self, reg: X64Reg) -> Option<&ExprRef> {
        self.registers.get(&reg)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.chain.len(),
            registers: self.registers.clone(),
            pinned: self.pinned.clone(),
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.chain.truncate(checkpoint.len);
        self.registers = checkpoint.registers;
        self.pinned = checkpoint.pinned;
    }

    /// Start a new group of constraints that must all hold together.
    /// Registers pinned by the previous group become free again.
    pub fn begin_batch(&mut self) {
        self.pinned.clear();
    }

    /// Require `reg` to hold `value` at this point of the chain.
    ///
    /// A constraint on `rip` makes `value` the next return slot. Returns
    /// false (leaving the chain untouched) if no gadget path exists that
    /// keeps every register pinned by the current batch intact.
    pub fn add_register_constraint(&mut self, reg: X64Reg, value: ExprRef) -> bool {
        if value.width().is_none() {
            log::debug!("{} can't hold non-register-sized {}", reg, value);
            return false;
        }
        match reg {
            X64Reg::Rip => {
                self.chain.push(value);
                self.registers.clear();
                self.pinned.clear();
                true
            }
            X64Reg::Rsp => false,
            _ => match self.find_reg_set(reg, &value, &self.pinned_except(reg)) {
                Some(steps) => {
                    self.commit(reg, value, steps);
                    self.pinned.insert(reg);
                    true
                }
                None => {
                    log::debug!("no gadget path to set {} = {}", reg, value);
                    false
                }
            },
        }
    }

    /// Require the 8 bytes at `addr` to hold `value`.
    pub fn add_memory_constraint(&mut self, addr: ExprRef, value: ExprRef) -> bool {
        if addr.width().is_none() || value.width().is_none() {
            return false;
        }
        for idx in self.write_indices.clone() {
            let GadgetEffect::WriteMemReg { base, value: src } = self.classified[idx].effect else {
                continue;
            };
            if !self.classified[idx].writes.is_disjoint(&self.pinned) {
                continue;
            }
            let (Some(base_steps), Some(value_steps)) = (
                self.find_reg_set(base, &addr, &self.pinned_except(base)),
                self.find_reg_set(src, &value, &self.pinned_except(src)),
            ) else {
                continue;
            };

            // the second assignment must not clobber the first
            let ordered = if !self.clobbers(&base_steps).contains(&src) {
                Some([(src, value.clone(), value_steps), (base, addr.clone(), base_steps)])
            } else if !self.clobbers(&value_steps).contains(&base) {
                Some([(base, addr.clone(), base_steps), (src, value.clone(), value_steps)])
            } else {
                None
            };
            let Some(ordered) = ordered else { continue };

            for (reg, val, steps) in ordered {
                self.commit(reg, val, steps);
            }
            self.commit_gadget(idx);
            return true;
        }
        log::debug!("no gadget writes [{}] = {}", addr, value);
        false
    }

    fn pinned_except(&self, reg: X64Reg) -> BTreeSet<X64Reg> {
        self.pinned.iter().copied().filter(|r| *r != reg).collect()
    }

    /// First gadget of `candidates` that writes none of `avoid`.
    fn first_sparing(&self, candidates: Option<&Vec<usize>>, avoid: &BTreeSet<X64Reg>) -> Option<usize> {
        candidates?
            .iter()
            .copied()
            .find(|&idx| self.classified[idx].writes.is_disjoint(avoid))
    }

    /// Plan the slots that load `value` into `target` without writing any
    /// register in `avoid`.
    fn find_reg_set(
        &self,
        target: X64Reg,
        value: &ExprRef,
        avoid: &BTreeSet<X64Reg>,
    ) -> Option<Vec<Step>> {
        let pop_steps = |pop_idx: usize| {
            let mut steps = vec![Step::Gadget(pop_idx), Step::Value(value.clone())];
            steps.extend((0..self.classified[pop_idx].extra_pops).map(|_| Step::Filler));
            steps
        };

        if let Some(idx) = self.first_sparing(self.pop_index.get(&target), avoid) {
            return Some(pop_steps(idx));
        }

        // BFS backwards through the move graph: pop SRC; mov ...; mov TARGET, X
        let is_zero = value.as_constant() == Some(0);
        let mut queue: VecDeque<(X64Reg, Vec<usize>)> = VecDeque::new();
        let mut visited = HashSet::new();
        queue.push_back((target, Vec::new()));
        visited.insert(target);

        while let Some((current, mov_path)) = queue.pop_front() {
            let head = if let Some(pop_idx) = self.first_sparing(self.pop_index.get(&current), avoid) {
                Some(pop_steps(pop_idx))
            } else if is_zero {
                self.first_sparing(self.zero_index.get(&current), avoid)
                    .map(|zero_idx| vec![Step::Gadget(zero_idx)])
            } else {
                None
            };
            if let Some(mut steps) = head {
                steps.extend(mov_path.iter().map(|&m| Step::Gadget(m)));
                if self.clobbers(&steps).is_disjoint(avoid) {
                    return Some(steps);
                }
            }

            for (&(dst, src), indices) in &self.mov_index {
                if dst == current && visited.insert(src) {
                    let mut path = vec![indices[0]];
                    path.extend_from_slice(&mov_path);
                    queue.push_back((src, path));
                }
            }
        }

        None
    }

    fn clobbers(&self, steps: &[Step]) -> BTreeSet<X64Reg> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Gadget(idx) => Some(&self.classified[*idx].writes),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    fn gadget_expr(&self, idx: usize) -> ExprRef {
        let gadget = &self.classified[idx].gadget;
        Expr::base_offset(
            self.base,
            gadget.addr,
            self.base_tag,
            &to_var_name(self.kind, &gadget.instructions),
        )
    }

    fn emit(&self, steps: &[Step], out: &mut RopSubchain) {
        for step in steps {
            out.push(match step {
                Step::Gadget(idx) => self.gadget_expr(*idx),
                Step::Value(value) => value.clone(),
                Step::Filler => Expr::constant(0),
            });
        }
    }

    fn commit(&mut self, reg: X64Reg, value: ExprRef, steps: Vec<Step>) {
        let mut slots = RopSubchain::new();
        self.emit(&steps, &mut slots);
        for clobbered in self.clobbers(&steps) {
            self.registers.remove(&clobbered);
        }
        self.chain.extend(slots);
        self.registers.insert(reg, value);
    }

    fn commit_gadget(&mut self, idx: usize) {
        let expr = self.gadget_expr(idx);
        self.chain.push(expr);
    }

    /// Standalone chain that sets `rax` and the argument registers, then
    /// invokes `syscall`.
    pub fn build_syscall(&self, number: u64, args: &[ExprRef]) -> Result<RopSubchain> {
        let mut out = RopSubchain::new();
        let mut assigned: Vec<X64Reg> = Vec::new();

        let targets = std::iter::once((X64Reg::Rax, Expr::constant(number)))
            .chain(X64Reg::SYSCALL_ARGS.iter().copied().zip(args.iter().cloned()));
        for (reg, value) in targets {
            let steps = self.find_reg_set(reg, &value, &BTreeSet::new()).ok_or_else(|| {
                Error::Gadget(format!("no gadget path to set {} = {}", reg, value))
            })?;
            let clobbers = self.clobbers(&steps);
            if let Some(lost) = assigned.iter().find(|r| **r != reg && clobbers.contains(r)) {
                return Err(Error::Gadget(format!("setting {} clobbers {}", reg, lost)));
            }
            self.emit(&steps, &mut out);
            assigned.push(reg);
        }

        let &syscall_idx = self
            .syscall_indices
            .first()
            .ok_or_else(|| Error::Gadget("no syscall gadget available".into()))?;
        out.push(self.gadget_expr(syscall_idx));
        Ok(out)
    }

    /// `execve(binsh, NULL, NULL)`.
    pub fn build_execve(&self, binsh: ExprRef) -> Result<RopSubchain> {
        self.build_syscall(SYS_EXECVE, &[binsh, Expr::constant(0), Expr::constant(0)])
    }

    /// `count` bare `ret` slots, for stack alignment.
    pub fn build_ret_sled(&self, count: usize) -> Result<RopSubchain> {
        let ret_idx = self
            .ret_index
            .ok_or_else(|| Error::Gadget("no ret gadget available".into()))?;
        Ok((0..count).map(|_| self.gadget_expr(ret_idx)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gadget(addr: u64, bytes: &[u8], instructions: &str) -> Gadget {
        Gadget {
            addr,
            bytes: bytes.to_vec(),
            instructions: instructions.to_string(),
            insn_count: 2,
        }
    }

    fn values(chain: &[ExprRef]) -> Vec<u64> {
        chain.iter().map(|e| e.evaluate().unwrap()).collect()
    }

    fn execve_gadgets() -> Vec<Gadget> {
        vec![
            make_gadget(0x1000, &[0x5f, 0xc3], "pop rdi ; ret"),
            make_gadget(0x2000, &[0x58, 0xc3], "pop rax ; ret"),
            make_gadget(0x3000, &[0x5e, 0xc3], "pop rsi ; ret"),
            make_gadget(0x4000, &[0x5a, 0xc3], "pop rdx ; ret"),
            make_gadget(0x5000, &[0x0f, 0x05, 0xc3], "syscall ; ret"),
        ]
    }

    #[test]
    fn classify_pop_rsi_pop_r15_ret() {
        let g = make_gadget(0x2000, &[0x5e, 0x41, 0x5f, 0xc3], "pop rsi ; pop r15 ; ret");
        let cg = classify_gadget(&g);
        assert_eq!(cg.effect, GadgetEffect::PopReg(X64Reg::Rsi));
        assert_eq!(cg.extra_pops, 1);
        assert!(cg.writes.contains(&X64Reg::R15));
        assert!(!cg.writes.contains(&X64Reg::Rsp));
    }

    #[test]
    fn classify_effects() {
        let cases: [(&[u8], GadgetEffect); 6] = [
            (&[0x5f, 0xc3], GadgetEffect::PopReg(X64Reg::Rdi)),
            (&[0x31, 0xc0, 0xc3], GadgetEffect::ZeroReg(X64Reg::Rax)),
            (&[0x0f, 0x05, 0xc3], GadgetEffect::Syscall),
            (&[0xc3], GadgetEffect::Ret),
            (&[0x48, 0x89, 0xc7, 0xc3], GadgetEffect::MovRegReg { dst: X64Reg::Rdi, src: X64Reg::Rax }),
            (&[0x48, 0x89, 0x37, 0xc3], GadgetEffect::WriteMemReg { base: X64Reg::Rdi, value: X64Reg::Rsi }),
        ];
        for (bytes, effect) in cases {
            assert_eq!(classify_gadget(&make_gadget(0x1000, bytes, "")).effect, effect);
        }
    }

    #[test]
    fn pop_rsp_is_not_a_register_setter() {
        let g = make_gadget(0x1000, &[0x5c, 0xc3], "pop rsp ; ret");
        assert_eq!(classify_gadget(&g).effect, GadgetEffect::Unknown);
    }

    #[test]
    fn build_execve_chain() {
        let builder = RopChainBuilder::new(&execve_gadgets());
        let chain = builder.build_execve(Expr::constant(0x402000)).unwrap();
        assert_eq!(
            values(&chain),
            vec![0x2000, 59, 0x1000, 0x402000, 0x3000, 0, 0x4000, 0, 0x5000]
        );
    }

    #[test]
    fn chain_slots_stay_symbolic() {
        let mut elf = ElfFile::new("/tmp/vuln", BinaryKind::Elf);
        elf.add_segment(0x1000, vec![0x5f, 0xc3], true);
        elf.set_base(0x400000);
        let mut builder = RopChainBuilder::from_elf(&elf);
        assert!(builder.add_register_constraint(X64Reg::Rdi, Expr::placeholder("arg0")));
        assert_eq!(builder.chain()[0].to_string(), "elf_base + pop_rdi_ret");
        assert_eq!(builder.chain()[0].evaluate().unwrap(), 0x401000);
        assert_eq!(builder.chain()[1].tag(), Some("arg0"));
    }

    #[test]
    fn build_with_multi_hop() {
        let gadgets = vec![
            make_gadget(0x1000, &[0x58, 0xc3], "pop rax ; ret"),
            make_gadget(0x2000, &[0x48, 0x89, 0xc7, 0xc3], "mov rdi, rax ; ret"),
        ];
        let mut builder = RopChainBuilder::new(&gadgets);
        assert!(builder.add_register_constraint(X64Reg::Rdi, Expr::constant(0x402000)));
        assert_eq!(values(builder.chain()), vec![0x1000, 0x402000, 0x2000]);
        assert_eq!(builder.register_value(X64Reg::Rdi).unwrap().evaluate().unwrap(), 0x402000);
    }

    #[test]
    fn zero_via_xor_when_no_pop() {
        let gadgets = vec![make_gadget(0x3000, &[0x31, 0xc0, 0xc3], "xor eax, eax ; ret")];
        let mut builder = RopChainBuilder::new(&gadgets);
        assert!(!builder.add_register_constraint(X64Reg::Rax, Expr::constant(1)));
        assert!(builder.add_register_constraint(X64Reg::Rax, Expr::constant(0)));
        assert_eq!(values(builder.chain()), vec![0x3000]);
    }

    #[test]
    fn build_missing_gadget_fails() {
        let gadgets = vec![
            make_gadget(0x1000, &[0x5f, 0xc3], "pop rdi ; ret"),
            make_gadget(0x5000, &[0x0f, 0x05, 0xc3], "syscall ; ret"),
        ];
        let builder = RopChainBuilder::new(&gadgets);
        assert!(matches!(builder.build_execve(Expr::constant(0)), Err(Error::Gadget(_))));
    }

    #[test]
    fn extra_pop_padding() {
        let gadgets = vec![
            make_gadget(0x2000, &[0x5e, 0x41, 0x5f, 0xc3], "pop rsi ; pop r15 ; ret"),
        ];
        let mut builder = RopChainBuilder::new(&gadgets);
        assert!(builder.add_register_constraint(X64Reg::Rsi, Expr::constant(7)));
        assert_eq!(values(builder.chain()), vec![0x2000, 7, 0]);
    }

    #[test]
    fn clobbering_argument_is_rejected() {
        // setting rsi through "pop rsi ; pop rdi" destroys rdi
        let gadgets = vec![
            make_gadget(0x1000, &[0x58, 0xc3], "pop rax ; ret"),
            make_gadget(0x2000, &[0x5f, 0xc3], "pop rdi ; ret"),
            make_gadget(0x3000, &[0x5e, 0x5f, 0xc3], "pop rsi ; pop rdi ; ret"),
            make_gadget(0x5000, &[0x0f, 0x05, 0xc3], "syscall ; ret"),
        ];
        let builder = RopChainBuilder::new(&gadgets);
        let err = builder
            .build_syscall(1, &[Expr::constant(1), Expr::constant(2)])
            .unwrap_err();
        assert!(err.to_string().contains("clobbers rdi"));
    }

    #[test]
    fn rip_constraint_is_next_return_slot() {
        let mut builder = RopChainBuilder::new(&execve_gadgets());
        assert!(builder.add_register_constraint(X64Reg::Rip, Expr::constant(0x401136)));
        assert_eq!(values(builder.chain()), vec![0x401136]);
    }

    #[test]
    fn byte_vectors_are_rejected() {
        let mut builder = RopChainBuilder::new(&execve_gadgets());
        assert!(!builder.add_register_constraint(X64Reg::Rdi, Expr::from_str_bytes("/bin/sh")));
        assert!(builder.chain().is_empty());
    }

    #[test]
    fn memory_constraint_uses_write_gadget() {
        let gadgets = vec![
            make_gadget(0x1000, &[0x5f, 0xc3], "pop rdi ; ret"),
            make_gadget(0x2000, &[0x5e, 0xc3], "pop rsi ; ret"),
            make_gadget(0x3000, &[0x48, 0x89, 0x37, 0xc3], "mov qword ptr [rdi], rsi ; ret"),
        ];
        let mut builder = RopChainBuilder::new(&gadgets);
        assert!(builder.add_memory_constraint(Expr::constant(0x404040), Expr::constant(0x68732f6e69622f)));
        assert_eq!(
            values(builder.chain()),
            vec![0x2000, 0x68732f6e69622f, 0x1000, 0x404040, 0x3000]
        );
        assert!(!builder.add_memory_constraint(Expr::constant(0), Expr::from_str_bytes("x")));
    }

    #[test]
    fn rollback_restores_chain_and_registers() {
        let mut builder = RopChainBuilder::new(&execve_gadgets());
        assert!(builder.add_register_constraint(X64Reg::Rdi, Expr::constant(1)));
        let cp = builder.checkpoint();
        assert!(builder.add_register_constraint(X64Reg::Rsi, Expr::constant(2)));
        assert_eq!(builder.chain().len(), 4);
        builder.rollback(cp);
        assert_eq!(values(builder.chain()), vec![0x1000, 1]);
        assert!(builder.register_value(X64Reg::Rsi).is_none());
    }

    fn clobber_gadgets() -> Vec<Gadget> {
        vec![
            make_gadget(0x1000, &[0x5f, 0xc3], "pop rdi ; ret"),
            make_gadget(0x3000, &[0x5e, 0x5f, 0xc3], "pop rsi ; pop rdi ; ret"),
        ]
    }

    #[test]
    fn constraint_may_not_overwrite_pinned_register() {
        let mut builder = RopChainBuilder::new(&clobber_gadgets());
        assert!(builder.add_register_constraint(X64Reg::Rdi, Expr::constant(0x1111)));
        assert!(!builder.add_register_constraint(X64Reg::Rsi, Expr::constant(0x2222)));
        assert_eq!(values(builder.chain()), vec![0x1000, 0x1111]);
        assert_eq!(builder.register_value(X64Reg::Rdi).unwrap().evaluate().unwrap(), 0x1111);

        // a new batch may reuse rdi
        builder.begin_batch();
        assert!(builder.add_register_constraint(X64Reg::Rsi, Expr::constant(0x2222)));
        assert!(builder.register_value(X64Reg::Rdi).is_none());
    }

    #[test]
    fn sparing_pop_is_preferred() {
        let mut gadgets = clobber_gadgets();
        gadgets.push(make_gadget(0x4000, &[0x5e, 0x41, 0x5f, 0x41, 0x5e, 0xc3], "pop rsi ; pop r15 ; pop r14 ; ret"));
        let mut builder = RopChainBuilder::new(&gadgets);
        assert!(builder.add_register_constraint(X64Reg::Rdi, Expr::constant(0x1111)));
        assert!(builder.add_register_constraint(X64Reg::Rsi, Expr::constant(0x2222)));
        assert_eq!(values(builder.chain()), vec![0x1000, 0x1111, 0x4000, 0x2222, 0, 0]);
    }

    #[test]
    fn ret_sled() {
        let builder = RopChainBuilder::new(&[make_gadget(0x1000, &[0xc3], "ret")]);
        assert_eq!(values(&builder.build_ret_sled(3).unwrap()), vec![0x1000; 3]);
        assert!(RopChainBuilder::new(&[]).build_ret_sled(1).is_err());
    }
}
