use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use ropsynth::config::Config;
use ropsynth::disasm::{self, DisasmStyle};
use ropsynth::elf::{BinaryKind, ElfFile};
use ropsynth::exploit::Exploit;
use ropsynth::expr::{ElfEntry, Expr, ExprRef};
use ropsynth::payload;
use ropsynth::ret2csu::{self, Ret2csu};
use ropsynth::strategy::{ExploitPayload, Strategy};
use ropsynth::technique::Technique;
use ropsynth::types::VirtAddr;

#[derive(Parser)]
#[command(name = "ropsynth", about = "ROP chain synthesis for x86_64 ELF binaries")]
struct Cli {
    /// Target binary
    binary: PathBuf,

    /// C library the target links against
    #[arg(long)]
    libc: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load address of the target binary
    #[arg(long, value_parser = parse_address)]
    elf_base: Option<u64>,

    /// Load address of the C library
    #[arg(long, value_parser = parse_address)]
    libc_base: Option<u64>,

    /// Path to the one_gadget executable
    #[arg(long)]
    one_gadget: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the __libc_csu_init gadgets and the fallback call target
    Csu,
    /// Call a function with up to three arguments through __libc_csu_init
    Ret2csu {
        /// Return address after the call (address or symbol)
        #[arg(long)]
        ret: String,
        /// ELF offset of the function pointer gadget 2 calls through
        #[arg(long, value_parser = parse_address)]
        target: Option<u64>,
        /// Arguments for rdi, rsi, rdx (addresses or symbols)
        #[arg(num_args = 0..=3)]
        args: Vec<String>,
    },
    /// Spawn a shell through a libc one-gadget
    OneGadget,
    /// Compose techniques into one payload
    Strategy {
        /// Technique names; defaults to the configured list
        #[arg(short, long = "technique")]
        techniques: Vec<String>,
    },
    /// Disassemble a function of the target binary
    Disasm {
        /// Function name
        function: String,
        #[arg(short = 'n', long, default_value_t = 32)]
        count: usize,
        /// AT&T syntax
        #[arg(long)]
        gas: bool,
    },
    /// Search the target binary for a byte pattern ("41 5f ?? c3")
    Search {
        pattern: String,
    },
    /// List gadgets in the target binary
    Gadgets {
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short = 'n', long, default_value_t = 100)]
        max: usize,
        /// Search the C library instead
        #[arg(long)]
        in_libc: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let mut ctx = load_exploit(&cli)?;

    match cli.command {
        Command::Csu => cmd_csu(&mut ctx),
        Command::Ret2csu { ref ret, target, ref args } => cmd_ret2csu(&mut ctx, ret, target, args),
        Command::OneGadget => cmd_strategy(&mut ctx, &["OneGadget".to_string()]),
        Command::Strategy { ref techniques } => {
            let names = if techniques.is_empty() {
                ctx.config().techniques.clone()
            } else {
                techniques.clone()
            };
            cmd_strategy(&mut ctx, &names)
        }
        Command::Disasm { ref function, count, gas } => {
            let style = if gas { DisasmStyle::Gas } else { DisasmStyle::Intel };
            cmd_disasm(&ctx, function, count, style)
        }
        Command::Search { ref pattern } => cmd_search(&ctx, pattern),
        Command::Gadgets { ref filter, max, in_libc } => {
            let kind = if in_libc { BinaryKind::Libc } else { BinaryKind::Elf };
            cmd_gadgets(&ctx, kind, filter.as_deref(), max)
        }
    }
}

fn load_exploit(cli: &Cli) -> anyhow::Result<Exploit> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(tool) = &cli.one_gadget {
        config.one_gadget_path = tool.clone();
    }

    let mut elf = ElfFile::load(&cli.binary, BinaryKind::Elf)?;
    elf.set_base(cli.elf_base.unwrap_or(0));
    println!(
        "{} loaded {} ({} functions)",
        "ropsynth".bold().cyan(),
        cli.binary.display(),
        elf.functions().len()
    );

    let mut ctx = Exploit::new(config, elf);
    if let Some(path) = &cli.libc {
        let mut libc = ElfFile::load(path, BinaryKind::Libc)?;
        libc.set_base(cli.libc_base.unwrap_or(0));
        println!("  libc: {}", path.display());
        ctx = ctx.with_libc(libc);
    }
    Ok(ctx)
}

fn cmd_csu(ctx: &mut Exploit) -> anyhow::Result<()> {
    let layout = match ret2csu::find_csu(ctx.elf()) {
        Ok(layout) => layout,
        Err(reason) => {
            println!("  {}", reason.yellow());
            return Ok(());
        }
    };
    print!("{}", layout);

    let mut technique = Ret2csu::new(ctx);
    technique.resolve_required_gadgets(ctx);
    match technique.infeasibility() {
        None => println!("  {}", "usable".green()),
        Some(reason) => println!("  {}: {}", "not usable".red(), reason),
    }
    Ok(())
}

fn cmd_ret2csu(
    ctx: &mut Exploit,
    ret: &str,
    target: Option<u64>,
    args: &[String],
) -> anyhow::Result<()> {
    let ret = parse_value(ctx.elf(), ret)?;
    let mut values = [Expr::constant(0), Expr::constant(0), Expr::constant(0)];
    for (slot, arg) in values.iter_mut().zip(args) {
        *slot = parse_value(ctx.elf(), arg)?;
    }
    let [arg1, arg2, arg3] = values;

    let mut technique = Ret2csu::new(ctx);
    if let Some(target) = target {
        technique.set_gadget2_call_target(target);
    }
    technique.set_call(ret, arg1, arg2, arg3);

    let mut strategy = Strategy::new();
    strategy.push(ctx, Box::new(technique))?;
    print_payload(&strategy.payload(ctx)?)
}

fn cmd_strategy(ctx: &mut Exploit, names: &[String]) -> anyhow::Result<()> {
    let strategy = Strategy::from_names(ctx, names)?;
    println!("  techniques: {}", strategy.names().join(", ").cyan());
    print_payload(&strategy.payload(ctx)?)
}

fn cmd_disasm(ctx: &Exploit, function: &str, count: usize, style: DisasmStyle) -> anyhow::Result<()> {
    let elf = ctx.elf();
    let (func, code) = elf.function_bytes(function)?;
    let start = VirtAddr(func.addr).rebase(elf.base());
    println!("  {} @ {}:", function.bold(), start);
    print!("{}", disasm::format_disassembly(&disasm::disassemble(code, start, count, style)));
    Ok(())
}

fn cmd_search(ctx: &Exploit, pattern: &str) -> anyhow::Result<()> {
    let elf = ctx.elf();
    let hits = elf.search_pattern(pattern)?;
    if hits.is_empty() {
        println!("  {}", "no matches".yellow());
        return Ok(());
    }
    println!("  {} match(es):", hits.len());
    for addr in hits {
        println!("  {}", VirtAddr(addr).rebase(elf.base()).to_string().cyan());
    }
    Ok(())
}

fn cmd_gadgets(
    ctx: &Exploit,
    kind: BinaryKind,
    filter: Option<&str>,
    max_results: usize,
) -> anyhow::Result<()> {
    let binary = ctx.binary(kind)?;
    let all = binary.gadgets().gadgets();
    let shown: Vec<_> = match filter {
        Some(pat) => ropsynth::rop::filter_gadgets(all, pat),
        None => all.iter().collect(),
    };

    let total = shown.len();
    if total == 0 {
        println!("  {}", "no gadgets found".yellow());
        return Ok(());
    }

    println!("  {} gadget(s) found (showing up to {}):", total, max_results);
    for g in shown.iter().take(max_results) {
        println!("  {:016x}  {}", binary.base().wrapping_add(g.addr), g.instructions.cyan());
    }
    if total > max_results {
        println!("  ... and {} more (use --max N or --filter <pattern>)", total - max_results);
    }
    Ok(())
}

fn print_payload(out: &ExploitPayload) -> anyhow::Result<()> {
    if !out.auxiliary.is_empty() {
        println!("{}", "# symbols".bold());
        print!("{}", out.auxiliary);
    }
    println!("{}", "# chain".bold());
    print!("{}", payload::format_chain(&out.subchains));

    match payload::flatten(&out.subchains) {
        Ok(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("\\x{:02x}", b)).collect();
            println!("{} ({} bytes)", "# payload".bold(), bytes.len());
            println!("{}", hex.green());
        }
        Err(e) => println!("  {}: {}", "payload incomplete".yellow(), e),
    }
    if !out.extra.is_empty() {
        let extra: Vec<String> = out.extra.iter().map(|v| format!("{:#x}", v)).collect();
        println!("  extra: {}", extra.join(" "));
    }
    Ok(())
}

/// A symbol of the target binary, or a hex address. Symbols win, so
/// names like `add` or `dead` aren't read as numbers.
fn parse_value(elf: &ElfFile, s: &str) -> anyhow::Result<ExprRef> {
    if let Ok(expr) = Expr::from_elf(elf, ElfEntry::Sym(s)) {
        return Ok(expr);
    }
    parse_address(s)
        .map(Expr::constant)
        .map_err(|_| anyhow::anyhow!("'{}' is not a valid address or known symbol", s))
}

fn parse_address(s: &str) -> anyhow::Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("invalid address '{}': {}", s, e))
}
