//! ropsynth: ROP chain synthesis for x86_64 ELF targets.
//!
//! Builds return-oriented payloads out of composable techniques over a
//! symbolic expression layer, for use inside a symbolic execution host
//! that has found a hijacked return address.
//!
//! # Module overview
//!
//! ## Binary analysis
//!
//! - [`elf`]: ELF metadata (symbols, GOT, functions, `.bss`, segments) via goblin.
//! - [`disasm`]: x86_64 decoding and Intel-syntax formatting using iced-x86.
//! - [`rop`]: Gadget discovery and lookup by assembly text.
//! - [`search`]: KMP byte search and hex pattern scanning.
//!
//! ## Synthesis
//!
//! - [`expr`]: Symbolic values: constants, base+offset, placeholders, byte vectors.
//! - [`exploit`]: The synthesis context and its script symbol table.
//! - [`technique`]: The technique trait and registry.
//! - [`ret2csu`]: Three-argument calls through `__libc_csu_init`.
//! - [`one_gadget`]: libc one-shot `execve` gadgets via the `one_gadget` tool.
//! - [`rop_chain`]: Constraint-driven chain builder (register and memory constraints).
//! - [`strategy`]: Ordered composition of techniques into one payload.
//! - [`payload`]: Flattening subchains into bytes.
//!
//! ## Host integration
//!
//! - [`host`]: The execution host interface.
//! - [`dynamic_rop`]: Per-state queue of constraint batches.
//! - [`observer`]: Syscall observation and symbolic-rip termination.
//!
//! ## Support
//!
//! - [`config`]: JSON configuration.
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Core types: `VirtAddr`, `X64Reg`, `StateId`.

pub mod config;
pub mod disasm;
pub mod dynamic_rop;
pub mod elf;
pub mod error;
pub mod exploit;
pub mod expr;
pub mod host;
pub mod observer;
pub mod one_gadget;
pub mod payload;
pub mod ret2csu;
pub mod rop;
pub mod rop_chain;
pub mod search;
pub mod strategy;
pub mod technique;
pub mod types;
