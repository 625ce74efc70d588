//! Exploitation techniques.
//!
//! A technique contributes one capability to the final chain, e.g. "call a
//! function with three arguments" (Ret2csu) or "spawn a shell from libc"
//! (OneGadget). Lifecycle per run:
//!
//! 1. construct through [`create`],
//! 2. [`Technique::resolve_required_gadgets`],
//! 3. [`Technique::check_requirements`] must return true,
//! 4. read the payload, as often as needed.

use crate::elf::BinaryKind;
use crate::error::{Error, Result};
use crate::exploit::{to_var_name, Exploit};
use crate::one_gadget::OneGadget;
use crate::ret2csu::Ret2csu;
use crate::rop_chain::RopSubchain;

pub trait Technique {
    fn name(&self) -> &'static str;

    /// Whether every required gadget is resolved and usable.
    fn check_requirements(&self, ctx: &Exploit) -> bool;

    /// Bind required gadgets to addresses and publish their script
    /// variables. Leaves the technique infeasible instead of failing.
    fn resolve_required_gadgets(&mut self, ctx: &mut Exploit);

    /// Script source the technique needs alongside its payload.
    fn auxiliary_functions(&self, ctx: &Exploit) -> String;

    fn symbolic_rop_payload_list(&self, ctx: &Exploit) -> Result<Vec<RopSubchain>>;

    fn extra_payload(&self, _ctx: &Exploit) -> Vec<u64> {
        Vec::new()
    }
}

/// A gadget a technique needs, found by its assembly text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredGadget {
    pub binary: BinaryKind,
    pub asm: String,
    pub addr: Option<u64>,
}

impl RequiredGadget {
    pub fn new(binary: BinaryKind, asm: &str) -> Self {
        RequiredGadget { binary, asm: asm.to_string(), addr: None }
    }

    pub fn var_name(&self) -> String {
        to_var_name(self.binary, &self.asm)
    }
}

/// Resolve every gadget, registering each hit in the symbol table.
/// Returns whether all of them resolved.
pub fn resolve_all(ctx: &mut Exploit, gadgets: &mut [RequiredGadget]) -> bool {
    for gadget in gadgets.iter_mut() {
        gadget.addr = ctx.resolve_gadget(gadget.binary, &gadget.asm);
        match gadget.addr {
            Some(addr) => ctx.register_symbol(&gadget.var_name(), addr),
            None => log::debug!("gadget not found: {}", gadget.asm),
        }
    }
    all_resolved(gadgets)
}

pub fn all_resolved(gadgets: &[RequiredGadget]) -> bool {
    gadgets.iter().all(|g| g.addr.is_some())
}

type Constructor = fn(&Exploit) -> Result<Box<dyn Technique>>;

fn new_ret2csu(ctx: &Exploit) -> Result<Box<dyn Technique>> {
    Ok(Box::new(Ret2csu::new(ctx)))
}

fn new_one_gadget(ctx: &Exploit) -> Result<Box<dyn Technique>> {
    Ok(Box::new(OneGadget::new(ctx)?))
}

static REGISTRY: &[(&str, Constructor)] = &[
    ("Ret2csu", new_ret2csu),
    ("OneGadget", new_one_gadget),
];

/// Construct a technique by name (ASCII case-insensitive).
pub fn create(ctx: &Exploit, name: &str) -> Result<Box<dyn Technique>> {
    let (_, constructor) = REGISTRY
        .iter()
        .find(|(registered, _)| registered.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownTechnique(name.to_string()))?;
    constructor(ctx)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::elf::ElfFile;

    fn exploit() -> Exploit {
        let mut elf = ElfFile::new("/tmp/vuln", BinaryKind::Elf);
        elf.add_segment(0x1000, vec![0x5f, 0xc3, 0x5e, 0xc3], true);
        Exploit::new(Config::default(), elf)
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let ctx = exploit();
        assert_eq!(create(&ctx, "ret2csu").unwrap().name(), "Ret2csu");
        assert_eq!(create(&ctx, "RET2CSU").unwrap().name(), "Ret2csu");
        assert!(names().any(|n| n == "OneGadget"));
    }

    #[test]
    fn unknown_technique() {
        match create(&exploit(), "ret2dlresolve") {
            Err(Error::UnknownTechnique(name)) => assert_eq!(name, "ret2dlresolve"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("ret2dlresolve is not registered"),
        }
    }

    #[test]
    fn resolve_all_registers_found_gadgets() {
        let mut ctx = exploit();
        let mut gadgets = vec![
            RequiredGadget::new(BinaryKind::Elf, "pop rdi ; ret"),
            RequiredGadget::new(BinaryKind::Elf, "pop rsi ; ret"),
        ];
        assert!(resolve_all(&mut ctx, &mut gadgets));
        assert_eq!(gadgets[1].addr, Some(0x1002));
        assert_eq!(ctx.symtab().get("pop_rsi_ret"), Some(&0x1002));

        let mut missing = vec![RequiredGadget::new(BinaryKind::Libc, "pop r15 ; ret")];
        assert!(!resolve_all(&mut ctx, &mut missing));
        assert_eq!(missing[0].var_name(), "libc_pop_r15_ret");
    }
}
