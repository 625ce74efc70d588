//! Synthesis context.
//!
//! One [`Exploit`] holds everything a run of chain synthesis shares: the
//! target binary, the optional C library, the configuration, and the
//! script symbol table where techniques publish the addresses they
//! resolved. It is passed explicitly to every technique.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::elf::{BinaryKind, ElfFile};
use crate::error::{Error, Result};
use crate::rop::normalize_asm;

/// Exploit-script variables (`__libc_csu_init_gadget1`, `libc_pop_r15_ret`).
/// Values are module offsets.
pub type SymbolTable = BTreeMap<String, u64>;

pub struct Exploit {
    config: Config,
    elf: ElfFile,
    libc: Option<ElfFile>,
    symtab: SymbolTable,
}

impl Exploit {
    pub fn new(config: Config, mut elf: ElfFile) -> Self {
        elf.set_gadget_depth(config.gadget_max_depth);
        Exploit { config, elf, libc: None, symtab: SymbolTable::new() }
    }

    pub fn with_libc(mut self, mut libc: ElfFile) -> Self {
        libc.set_gadget_depth(self.config.gadget_max_depth);
        self.libc = Some(libc);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn elf(&self) -> &ElfFile {
        &self.elf
    }

    pub fn elf_mut(&mut self) -> &mut ElfFile {
        &mut self.elf
    }

    pub fn libc(&self) -> Result<&ElfFile> {
        self.libc
            .as_ref()
            .ok_or_else(|| Error::Other("no libc loaded for this exploit".into()))
    }

    pub fn binary(&self, kind: BinaryKind) -> Result<&ElfFile> {
        match kind {
            BinaryKind::Elf => Ok(&self.elf),
            BinaryKind::Libc => self.libc(),
        }
    }

    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    /// Publish a script variable. Re-registering overwrites.
    pub fn register_symbol(&mut self, name: &str, value: u64) {
        log::debug!("symtab: {} = {:#x}", name, value);
        self.symtab.insert(name.to_string(), value);
    }

    /// Find a gadget by text in the given binary.
    pub fn resolve_gadget(&self, kind: BinaryKind, asm: &str) -> Option<u64> {
        self.binary(kind).ok()?.resolve_gadget(asm)
    }
}

/// Script variable name for a gadget: `"pop r15 ; ret"` in libc becomes
/// `libc_pop_r15_ret`.
pub fn to_var_name(kind: BinaryKind, asm: &str) -> String {
    let mut name = String::new();
    if kind == BinaryKind::Libc {
        name.push_str("libc_");
    }
    let mut last_underscore = true;
    for c in normalize_asm(asm).chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
            last_underscore = false;
        } else if !last_underscore {
            name.push('_');
            last_underscore = true;
        }
    }
    while name.ends_with('_') {
        name.pop();
    }
    name
}
