//! Symbolic chain elements.
//!
//! A chain slot is often not known when the chain is built: a libc address
//! needs the leaked base, a register may be filled in by a later technique.
//! [`Expr`] keeps such slots symbolic until they can be reduced.
//!
//! - `BaseOffset` is a runtime base plus a static offset, tagged on both
//!   sides so it can be printed as `elf_base + elf.sym['read']`.
//! - `Placeholder` reserves a slot that some other step overwrites.
//! - `ByteVector` is a raw blob that is not register-sized.
//!
//! All arithmetic wraps modulo 2^64.

use std::fmt;
use std::sync::Arc;

use crate::elf::ElfFile;
use crate::error::{Error, Result};
use crate::exploit::SymbolTable;

pub type ExprRef = Arc<Expr>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Constant(u64),
    Add(ExprRef, ExprRef),
    BaseOffset {
        base: ExprRef,
        offset: ExprRef,
        base_tag: String,
        offset_tag: String,
    },
    Placeholder(String),
    ByteVector(Vec<u8>),
}

/// Coarse classification used by code that only cares whether a node is
/// a value, a sum, or not reducible at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprKind {
    Constant,
    Add,
    Invalid,
}

/// Entry of a binary's metadata an expression can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfEntry<'a> {
    Sym(&'a str),
    Got(&'a str),
    Bss,
}

impl Expr {
    pub fn constant(value: u64) -> ExprRef {
        Arc::new(Expr::Constant(value))
    }

    pub fn add(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Arc::new(Expr::Add(lhs, rhs))
    }

    pub fn placeholder(tag: impl Into<String>) -> ExprRef {
        Arc::new(Expr::Placeholder(tag.into()))
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> ExprRef {
        Arc::new(Expr::ByteVector(data.into()))
    }

    pub fn from_str_bytes(s: &str) -> ExprRef {
        Expr::bytes(s.as_bytes())
    }

    pub fn base_offset(base: u64, offset: u64, base_tag: &str, offset_tag: &str) -> ExprRef {
        Expr::base_offset_expr(Expr::constant(base), Expr::constant(offset), base_tag, offset_tag)
    }

    pub fn base_offset_expr(
        base: ExprRef,
        offset: ExprRef,
        base_tag: &str,
        offset_tag: &str,
    ) -> ExprRef {
        Arc::new(Expr::BaseOffset {
            base,
            offset,
            base_tag: base_tag.to_string(),
            offset_tag: offset_tag.to_string(),
        })
    }

    /// `<base_tag> + <module>.sym['name']` and friends.
    ///
    /// A name absent from the metadata is an error, never a zero offset.
    pub fn from_elf(elf: &ElfFile, entry: ElfEntry<'_>) -> Result<ExprRef> {
        let module = elf.script_name();
        let (offset, tag) = match entry {
            ElfEntry::Sym(name) => {
                let addr = elf.symbols().get(name).ok_or_else(|| Error::MissingSymbol {
                    table: format!("{}.sym", module),
                    name: name.to_string(),
                })?;
                (*addr, format!("{}.sym['{}']", module, name))
            }
            ElfEntry::Got(name) => {
                let addr = elf.got().get(name).ok_or_else(|| Error::MissingSymbol {
                    table: format!("{}.got", module),
                    name: name.to_string(),
                })?;
                (*addr, format!("{}.got['{}']", module, name))
            }
            ElfEntry::Bss => {
                let addr = elf.bss().ok_or_else(|| Error::MissingSymbol {
                    table: module.to_string(),
                    name: ".bss".to_string(),
                })?;
                (addr, format!("{}.bss()", module))
            }
        };
        Ok(Expr::base_offset(elf.base(), offset, elf.base_tag(), &tag))
    }

    /// `<base_tag> + 0x666` for a raw module offset.
    pub fn from_elf_offset(elf: &ElfFile, offset: u64) -> ExprRef {
        Expr::base_offset(elf.base(), offset, elf.base_tag(), &format!("{:#x}", offset))
    }

    /// `<base_tag> + var`, where `var` is an exploit-script variable.
    pub fn from_symtab(elf: &ElfFile, symtab: &SymbolTable, var: &str) -> Result<ExprRef> {
        let value = symtab.get(var).ok_or_else(|| Error::MissingSymbol {
            table: "symtab".to_string(),
            name: var.to_string(),
        })?;
        Ok(Expr::base_offset(elf.base(), *value, elf.base_tag(), var))
    }

    /// A named script variable with no base.
    pub fn script_symbol(name: &str, value: u64) -> ExprRef {
        Expr::base_offset(0, value, "", name)
    }

    pub fn kind(&self) -> ExprKind {
        match self {
            Expr::Constant(_) | Expr::ByteVector(_) => ExprKind::Constant,
            Expr::Add(..) | Expr::BaseOffset { .. } => ExprKind::Add,
            Expr::Placeholder(_) => ExprKind::Invalid,
        }
    }

    /// Width in bits, `None` for byte vectors.
    pub fn width(&self) -> Option<u32> {
        match self {
            Expr::ByteVector(_) => None,
            _ => Some(64),
        }
    }

    /// Placeholder tag, if this is a placeholder.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Expr::Placeholder(tag) => Some(tag),
            _ => None,
        }
    }

    /// Whether this is a placeholder whose tag contains `needle`.
    pub fn has_tag(&self, needle: &str) -> bool {
        self.tag().map_or(false, |tag| tag.contains(needle))
    }

    pub fn as_constant(&self) -> Option<u64> {
        match self {
            Expr::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Reduce a node whose direct children are already constants.
    pub fn to_constant(&self) -> Result<u64> {
        match self {
            Expr::Constant(value) => Ok(*value),
            Expr::Add(lhs, rhs) | Expr::BaseOffset { base: lhs, offset: rhs, .. } => {
                match (lhs.as_constant(), rhs.as_constant()) {
                    (Some(a), Some(b)) => Ok(a.wrapping_add(b)),
                    _ => Err(Error::NotConcrete(self.to_string())),
                }
            }
            Expr::Placeholder(tag) => Err(Error::UnhandledPlaceholder(tag.clone())),
            Expr::ByteVector(_) => Err(Error::NotConcrete(self.to_string())),
        }
    }

    /// Reduce the whole tree to a 64-bit value.
    pub fn evaluate(&self) -> Result<u64> {
        match self {
            Expr::Constant(value) => Ok(*value),
            Expr::Add(lhs, rhs) | Expr::BaseOffset { base: lhs, offset: rhs, .. } => {
                Ok(lhs.evaluate()?.wrapping_add(rhs.evaluate()?))
            }
            Expr::Placeholder(tag) => Err(Error::UnhandledPlaceholder(tag.clone())),
            Expr::ByteVector(_) => Err(Error::NotConcrete(self.to_string())),
        }
    }

    /// Placeholder tags in left-to-right order.
    pub fn placeholders(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_placeholders(&mut out);
        out
    }

    fn collect_placeholders(&self, out: &mut Vec<String>) {
        match self {
            Expr::Placeholder(tag) => out.push(tag.clone()),
            Expr::Add(lhs, rhs) | Expr::BaseOffset { base: lhs, offset: rhs, .. } => {
                lhs.collect_placeholders(out);
                rhs.collect_placeholders(out);
            }
            Expr::Constant(_) | Expr::ByteVector(_) => {}
        }
    }
}

/// Rebuild `expr` with each placeholder replaced by `f(tag)`.
///
/// Placeholders for which `f` returns `None` are kept; subtrees without
/// placeholders are shared, not copied.
pub fn substitute(expr: &ExprRef, f: &mut dyn FnMut(&str) -> Option<ExprRef>) -> ExprRef {
    match expr.as_ref() {
        Expr::Placeholder(tag) => f(tag).unwrap_or_else(|| expr.clone()),
        Expr::Add(lhs, rhs) => {
            let (l, r) = (substitute(lhs, f), substitute(rhs, f));
            if Arc::ptr_eq(&l, lhs) && Arc::ptr_eq(&r, rhs) {
                expr.clone()
            } else {
                Expr::add(l, r)
            }
        }
        Expr::BaseOffset { base, offset, base_tag, offset_tag } => {
            let (b, o) = (substitute(base, f), substitute(offset, f));
            if Arc::ptr_eq(&b, base) && Arc::ptr_eq(&o, offset) {
                expr.clone()
            } else {
                Expr::base_offset_expr(b, o, base_tag, offset_tag)
            }
        }
        Expr::Constant(_) | Expr::ByteVector(_) => expr.clone(),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(value) => write!(f, "{:#x}", value),
            Expr::Add(lhs, rhs) => write!(f, "{} + {}", lhs, rhs),
            Expr::BaseOffset { base, offset, base_tag, offset_tag } => {
                match (base_tag.is_empty(), offset_tag.is_empty()) {
                    (false, false) => write!(f, "{} + {}", base_tag, offset_tag),
                    (false, true) => f.write_str(base_tag),
                    (true, false) => f.write_str(offset_tag),
                    (true, true) => write!(f, "{} + {}", base, offset),
                }
            }
            Expr::Placeholder(tag) => f.write_str(tag),
            Expr::ByteVector(data) => {
                f.write_str("b'")?;
                for byte in data {
                    write!(f, "\\x{:02x}", byte)?;
                }
                f.write_str("'")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::BinaryKind;

    fn elf() -> ElfFile {
        let mut elf = ElfFile::new("/tmp/vuln", BinaryKind::Elf);
        elf.insert_symbol("read", 0x1030);
        elf.insert_got("puts", 0x4018);
        elf.set_bss(0x4040);
        elf.set_base(0x400000);
        elf
    }

    #[test]
    fn sym_read_relative_to_elf_base() {
        let e = Expr::from_elf(&elf(), ElfEntry::Sym("read")).unwrap();
        assert_eq!(e.to_string(), "elf_base + elf.sym['read']");
        assert_eq!(e.to_constant().unwrap(), 0x401030);
        assert_eq!(e.kind(), ExprKind::Add);
    }

    #[test]
    fn got_and_bss_tags() {
        let elf = elf();
        let got = Expr::from_elf(&elf, ElfEntry::Got("puts")).unwrap();
        assert_eq!(got.to_string(), "elf_base + elf.got['puts']");
        let bss = Expr::from_elf(&elf, ElfEntry::Bss).unwrap();
        assert_eq!(bss.to_string(), "elf_base + elf.bss()");
        assert_eq!(bss.evaluate().unwrap(), 0x404040);
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let err = Expr::from_elf(&elf(), ElfEntry::Sym("system")).unwrap_err();
        match err {
            Error::MissingSymbol { table, name } => {
                assert_eq!(table, "elf.sym");
                assert_eq!(name, "system");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(Expr::from_elf(&elf(), ElfEntry::Got("read")).is_err());
    }

    #[test]
    fn raw_offset_and_script_symbols() {
        let e = Expr::from_elf_offset(&elf(), 0x666);
        assert_eq!(e.to_string(), "elf_base + 0x666");
        assert_eq!(e.evaluate().unwrap(), 0x400666);

        let s = Expr::script_symbol("pop_rdi_ret", 0x1234);
        assert_eq!(s.to_string(), "pop_rdi_ret");
        assert_eq!(s.evaluate().unwrap(), 0x1234);
    }

    #[test]
    fn symtab_lookup() {
        let mut symtab = SymbolTable::new();
        symtab.insert("__libc_csu_init_gadget1".into(), 0x11aa);
        let e = Expr::from_symtab(&elf(), &symtab, "__libc_csu_init_gadget1").unwrap();
        assert_eq!(e.to_string(), "elf_base + __libc_csu_init_gadget1");
        assert_eq!(e.evaluate().unwrap(), 0x4011aa);
        assert!(Expr::from_symtab(&elf(), &symtab, "nope").is_err());
    }

    #[test]
    fn base_offset_wraps() {
        let e = Expr::base_offset(u64::MAX, 2, "b", "o");
        assert_eq!(e.to_constant().unwrap(), 1);
    }

    #[test]
    fn to_constant_requires_constant_children() {
        let nested = Expr::base_offset_expr(
            Expr::add(Expr::constant(1), Expr::constant(2)),
            Expr::constant(3),
            "b",
            "o",
        );
        assert!(matches!(nested.to_constant(), Err(Error::NotConcrete(_))));
        assert_eq!(nested.evaluate().unwrap(), 6);
    }

    #[test]
    fn placeholder_fails_with_its_tag() {
        let p = Expr::placeholder("ret2csu_gadget1_rbx");
        assert_eq!(p.kind(), ExprKind::Invalid);
        for _ in 0..2 {
            match p.evaluate() {
                Err(Error::UnhandledPlaceholder(tag)) => assert_eq!(tag, "ret2csu_gadget1_rbx"),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(p.has_tag("gadget1"));
        assert!(!p.has_tag("gadget2"));
        assert!(!Expr::constant(1).has_tag(""));
    }

    #[test]
    fn byte_vector_properties() {
        let b = Expr::from_str_bytes("/bin/sh");
        assert_eq!(b.kind(), ExprKind::Constant);
        assert_eq!(b.width(), None);
        assert!(matches!(b.evaluate(), Err(Error::NotConcrete(_))));
        assert_eq!(Expr::bytes(vec![0x41, 0x00]).to_string(), "b'\\x41\\x00'");
    }

    #[test]
    fn substitute_replaces_known_tags_only() {
        let tree = Expr::add(Expr::placeholder("a"), Expr::placeholder("b"));
        assert_eq!(tree.placeholders(), vec!["a".to_string(), "b".to_string()]);

        let out = substitute(&tree, &mut |tag| (tag == "a").then(|| Expr::constant(5)));
        assert_eq!(out.placeholders(), vec!["b".to_string()]);
        assert_eq!(out.to_string(), "0x5 + b");

        let done = substitute(&out, &mut |_| Some(Expr::constant(1)));
        assert_eq!(done.evaluate().unwrap(), 6);
    }

    #[test]
    fn substitute_shares_untouched_subtrees() {
        let c = Expr::from_elf_offset(&elf(), 0x10);
        let out = substitute(&c, &mut |_| Some(Expr::constant(0)));
        assert!(Arc::ptr_eq(&c, &out));
    }
}
