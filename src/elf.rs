//! Binary metadata service.
//!
//! Memory-maps an ELF image and extracts what chain synthesis needs:
//! symbols, GOT slots, functions, the `.bss` address and the bytes of
//! every loadable segment. Addresses are file addresses; the runtime
//! module base is tracked separately and set once relocation is observed.
//!
//! Hosts that already hold this information can assemble an [`ElfFile`]
//! in memory with the `insert_*` methods instead of loading a file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use goblin::elf::{program_header, reloc, Elf};
use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::rop::GadgetIndex;
use crate::search;

/// Bytes decoded for a function whose symbol carries no size.
const UNSIZED_FUNCTION_WINDOW: usize = 0x100;

pub type SymbolMap = BTreeMap<String, u64>;
pub type FunctionMap = BTreeMap<String, Function>;

/// Which module of the exploit a binary plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    /// The vulnerable program itself.
    Elf,
    /// The C library it links against.
    Libc,
}

impl BinaryKind {
    /// Name of the runtime base variable in textual expressions.
    pub fn base_tag(self) -> &'static str {
        match self {
            BinaryKind::Elf => "elf_base",
            BinaryKind::Libc => "libc_base",
        }
    }

    /// Name of the module object in textual expressions (`elf.sym[...]`).
    pub fn script_name(self) -> &'static str {
        match self {
            BinaryKind::Elf => "elf",
            BinaryKind::Libc => "libc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub addr: u64,
    /// Size in bytes (0 if the symbol doesn't record one).
    pub size: u64,
}

/// A PT_LOAD segment's file-backed bytes.
#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub executable: bool,
}

impl Segment {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr - self.vaddr < self.data.len() as u64
    }
}

pub struct ElfFile {
    path: PathBuf,
    kind: BinaryKind,
    base: u64,
    symbols: SymbolMap,
    got: SymbolMap,
    functions: FunctionMap,
    bss: Option<u64>,
    segments: Vec<Segment>,
    gadget_depth: usize,
    gadgets: OnceLock<GadgetIndex>,
}

impl ElfFile {
    /// Create an empty metadata record.
    pub fn new(path: impl Into<PathBuf>, kind: BinaryKind) -> Self {
        ElfFile {
            path: path.into(),
            kind,
            base: 0,
            symbols: SymbolMap::new(),
            got: SymbolMap::new(),
            functions: FunctionMap::new(),
            bss: None,
            segments: Vec::new(),
            gadget_depth: 5,
            gadgets: OnceLock::new(),
        }
    }

    /// Load an ELF binary from disk via memory mapping.
    pub fn load(path: &Path, kind: BinaryKind) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Elf(format!("open '{}': {}", path.display(), e)))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Elf(format!("mmap '{}': {}", path.display(), e)))?;
        Self::parse(path, kind, &mmap)
    }

    /// Extract metadata from raw ELF bytes.
    pub fn parse(path: &Path, kind: BinaryKind, data: &[u8]) -> Result<Self> {
        let elf = Elf::parse(data)
            .map_err(|e| Error::Elf(format!("parse '{}': {}", path.display(), e)))?;
        let mut out = ElfFile::new(path, kind);

        for sym in elf.syms.iter() {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                out.add_parsed_symbol(name, sym.st_value, sym.st_size, sym.is_function());
            }
        }
        for sym in elf.dynsyms.iter() {
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                out.add_parsed_symbol(name, sym.st_value, sym.st_size, sym.is_function());
            }
        }

        // GOT slots are the targets of JUMP_SLOT / GLOB_DAT relocations
        for rel in elf.pltrelocs.iter().chain(elf.dynrelas.iter()) {
            if rel.r_type != reloc::R_X86_64_JUMP_SLOT && rel.r_type != reloc::R_X86_64_GLOB_DAT {
                continue;
            }
            let name = elf
                .dynsyms
                .get(rel.r_sym)
                .and_then(|sym| elf.dynstrtab.get_at(sym.st_name));
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                out.got.insert(name.to_string(), rel.r_offset);
            }
        }

        out.bss = elf
            .section_headers
            .iter()
            .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(".bss"))
            .map(|sh| sh.sh_addr);

        for ph in &elf.program_headers {
            if ph.p_type != program_header::PT_LOAD {
                continue;
            }
            let offset = ph.p_offset as usize;
            let size = ph.p_filesz as usize;
            if offset.checked_add(size).map_or(true, |end| end > data.len()) {
                continue;
            }
            out.segments.push(Segment {
                vaddr: ph.p_vaddr,
                data: data[offset..offset + size].to_vec(),
                executable: ph.p_flags & program_header::PF_X != 0,
            });
        }

        log::debug!(
            "loaded {}: {} symbols, {} GOT entries, {} segments",
            path.display(),
            out.symbols.len(),
            out.got.len(),
            out.segments.len()
        );
        Ok(out)
    }

    fn add_parsed_symbol(&mut self, name: &str, addr: u64, size: u64, is_function: bool) {
        if name.is_empty() || addr == 0 {
            return;
        }
        if is_function {
            self.insert_function(name, addr, size);
        } else {
            self.insert_symbol(name, addr);
        }
    }

    pub fn insert_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn insert_got(&mut self, name: &str, addr: u64) {
        self.got.insert(name.to_string(), addr);
    }

    /// Record a function; it is also visible as a symbol.
    pub fn insert_function(&mut self, name: &str, addr: u64, size: u64) {
        self.symbols.insert(name.to_string(), addr);
        self.functions.insert(
            name.to_string(),
            Function { name: name.to_string(), addr, size },
        );
    }

    pub fn set_bss(&mut self, addr: u64) {
        self.bss = Some(addr);
    }

    pub fn add_segment(&mut self, vaddr: u64, data: Vec<u8>, executable: bool) {
        self.segments.push(Segment { vaddr, data, executable });
        self.gadgets = OnceLock::new();
    }

    pub fn set_gadget_depth(&mut self, depth: usize) {
        self.gadget_depth = depth;
        self.gadgets = OnceLock::new();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    pub fn base_tag(&self) -> &'static str {
        self.kind.base_tag()
    }

    pub fn script_name(&self) -> &'static str {
        self.kind.script_name()
    }

    /// Runtime load address (0 until relocation is observed).
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    pub fn got(&self) -> &SymbolMap {
        &self.got
    }

    pub fn functions(&self) -> &FunctionMap {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn bss(&self) -> Option<u64> {
        self.bss
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Read up to `len` bytes starting at `addr`, clipped at the end of
    /// the containing segment.
    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let seg = self
            .segments
            .iter()
            .find(|s| s.contains(addr))
            .ok_or_else(|| Error::Elf(format!("address {:#x} is not mapped", addr)))?;
        let start = (addr - seg.vaddr) as usize;
        let end = start.saturating_add(len).min(seg.data.len());
        Ok(&seg.data[start..end])
    }

    /// Look a function up by name and return it with its code bytes.
    ///
    /// Unsized functions get a fixed decoding window.
    pub fn function_bytes(&self, name: &str) -> Result<(&Function, &[u8])> {
        let func = self.function(name).ok_or_else(|| Error::MissingSymbol {
            table: format!("{}.functions", self.script_name()),
            name: name.to_string(),
        })?;
        let len = if func.size > 0 { func.size as usize } else { UNSIZED_FUNCTION_WINDOW };
        Ok((func, self.read(func.addr, len)?))
    }

    /// Find every address whose bytes equal `needle`, in segment order.
    pub fn search(&self, needle: &[u8]) -> Vec<u64> {
        self.segments
            .iter()
            .flat_map(|seg| {
                search::kmp(&seg.data, needle)
                    .into_iter()
                    .map(move |off| seg.vaddr + off as u64)
            })
            .collect()
    }

    /// Addresses holding `value` as a little-endian u64.
    pub fn search_u64(&self, value: u64) -> Vec<u64> {
        self.segments
            .iter()
            .flat_map(|seg| {
                search::scan_u64(&seg.data, value)
                    .into_iter()
                    .map(move |off| seg.vaddr + off as u64)
            })
            .collect()
    }

    /// Match an IDA-style pattern (`"41 5f ?? c3"`) against every segment.
    pub fn search_pattern(&self, pattern: &str) -> Result<Vec<u64>> {
        let (bytes, mask) = search::parse_hex_pattern(pattern)?;
        Ok(self
            .segments
            .iter()
            .flat_map(|seg| {
                search::scan_pattern(&seg.data, &bytes, &mask)
                    .into_iter()
                    .map(move |off| seg.vaddr + off as u64)
            })
            .collect())
    }

    /// Gadget index over the executable segments, built on first use.
    pub fn gadgets(&self) -> &GadgetIndex {
        self.gadgets
            .get_or_init(|| GadgetIndex::build(&self.segments, self.gadget_depth))
    }

    /// Address of the first gadget whose text matches `asm`.
    pub fn resolve_gadget(&self, asm: &str) -> Option<u64> {
        self.gadgets().resolve(asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> ElfFile {
        let mut elf = ElfFile::new("/tmp/vuln", BinaryKind::Elf);
        elf.insert_symbol("read", 0x1030);
        elf.insert_got("read", 0x4018);
        elf.insert_function("main", 0x1126, 0x40);
        elf.set_bss(0x4040);
        elf.add_segment(0x1000, vec![0x90; 0x200], true);
        elf.add_segment(0x3e00, vec![0u8; 0x300], false);
        elf
    }

    #[test]
    fn binary_kind_tags() {
        assert_eq!(BinaryKind::Elf.base_tag(), "elf_base");
        assert_eq!(BinaryKind::Libc.script_name(), "libc");
    }

    #[test]
    fn functions_are_also_symbols() {
        let elf = sample();
        assert_eq!(elf.symbols().get("main"), Some(&0x1126));
        assert_eq!(elf.function("main").map(|f| f.size), Some(0x40));
        assert!(elf.function("read").is_none());
    }

    #[test]
    fn read_clips_to_segment() {
        let elf = sample();
        assert_eq!(elf.read(0x1000, 4).unwrap(), &[0x90; 4]);
        assert_eq!(elf.read(0x11fe, 16).unwrap().len(), 2);
        assert!(elf.read(0x2000, 1).is_err());
    }

    #[test]
    fn search_reports_virtual_addresses() {
        let mut elf = sample();
        let mut data = vec![0u8; 0x20];
        data[0x10..0x18].copy_from_slice(&0x1126u64.to_le_bytes());
        elf.add_segment(0x3d00, data, false);
        assert_eq!(elf.search(&0x1126u64.to_le_bytes()), vec![0x3d10]);
        assert_eq!(elf.search_u64(0x1126), vec![0x3d10]);
    }

    #[test]
    fn search_pattern_with_wildcards() {
        let mut elf = ElfFile::new("/tmp/vuln", BinaryKind::Elf);
        elf.add_segment(0x1000, vec![0x41, 0x5f, 0xc3, 0x90, 0x41, 0x5e, 0xc3], true);
        assert_eq!(elf.search_pattern("41 ?? c3").unwrap(), vec![0x1000, 0x1004]);
        assert_eq!(elf.search_pattern("41 5e").unwrap(), vec![0x1004]);
        assert!(elf.search_pattern("zz").is_err());
    }

    #[test]
    fn function_bytes_missing_is_missing_symbol() {
        let elf = sample();
        let err = elf.function_bytes("__libc_csu_init").unwrap_err();
        assert!(matches!(err, Error::MissingSymbol { .. }));
        let (func, code) = elf.function_bytes("main").unwrap();
        assert_eq!(func.addr, 0x1126);
        assert_eq!(code.len(), 0x40);
    }

    #[test]
    fn base_is_mutable() {
        let mut elf = sample();
        assert_eq!(elf.base(), 0);
        elf.set_base(0x400000);
        assert_eq!(elf.base(), 0x400000);
    }

    #[test]
    fn load_rejects_non_elf() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"definitely not an ELF").unwrap();
        tmp.flush().unwrap();
        assert!(ElfFile::load(tmp.path(), BinaryKind::Elf).is_err());
        assert!(ElfFile::load(Path::new("/nonexistent/vuln"), BinaryKind::Elf).is_err());
    }
}
