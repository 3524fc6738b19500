//! The `davit` command: compile a source file to a loadable image.

use anyhow::{bail, Context as _};
use clap::Parser;
use davit_codegen::isa::x64::{emit_image, Alignment};
use davit_codegen::{CompileFlags, CompileOptions, Context};
use std::path::PathBuf;
use std::str::FromStr;
use target_lexicon::Triple;

#[derive(Parser)]
#[command(name = "davit", about = "Compile Davit source to an x86-64 image", version)]
struct Args {
    /// Source file to compile.
    input: PathBuf,

    /// Where to write the image. Defaults to the input with a `.bin`
    /// extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target triple; decides how the page-management ops lower.
    #[arg(long)]
    target: Option<String>,

    /// Page-align the image sections.
    #[arg(long)]
    page_aligned: bool,

    /// Record debug line tables in the image.
    #[arg(short = 'g', long)]
    debug_info: bool,

    /// Generate narration comments in the instruction stream (shown
    /// with --print-lir).
    #[arg(long)]
    comments: bool,

    /// Make every variable volatile; simplifies debugging at the cost
    /// of register caching.
    #[arg(long)]
    all_volatile: bool,

    /// Disable stackframe sharing between functions.
    #[arg(long)]
    no_sharing: bool,

    /// Print the resolved instruction stream instead of writing the
    /// image.
    #[arg(long)]
    print_lir: bool,
}

fn report(msg: &str) {
    eprintln!("error: {msg}");
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let source = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let src_path = args.input.display().to_string();

    let mut opts = CompileOptions::default();
    opts.error = report;
    if args.debug_info {
        opts.flags |= CompileFlags::GENERATE_DEBUG_INFO;
    }
    if args.comments {
        opts.flags |= CompileFlags::COMMENT;
    }
    if args.all_volatile {
        opts.flags |= CompileFlags::ALL_VAR_VOLATILE;
    }
    if args.no_sharing {
        opts.flags |= CompileFlags::NO_STACKFRAME_SHARING;
    }

    let ctx = Context::new(opts);
    let Ok(compilation) = ctx.compile(&source, &src_path) else {
        bail!("compilation of {} failed", args.input.display());
    };

    if args.print_lir {
        for (id, func) in compilation.module.funcs.iter() {
            if func.insts.is_empty() {
                continue;
            }
            let name = if func.name.is_empty() { "<root>" } else { &func.name };
            println!("{id} {name}:");
            for inst in &func.insts {
                println!("    {inst}");
            }
        }
        return Ok(());
    }

    let triple = match &args.target {
        Some(t) => Triple::from_str(t).map_err(|e| anyhow::anyhow!("bad target {t}: {e}"))?,
        None => Triple::host(),
    };
    let align = if args.page_aligned {
        Alignment::PageAligned
    } else {
        Alignment::Compact
    };
    let image = emit_image(&compilation, align, &triple)?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("bin"));
    std::fs::write(&output, &image.execbin)
        .with_context(|| format!("writing {}", output.display()))?;
    if !image.export_info.is_empty() {
        std::fs::write(output.with_extension("exports"), &image.export_info)?;
    }
    if !image.import_info.is_empty() {
        std::fs::write(output.with_extension("imports"), &image.import_info)?;
    }
    if !image.dbg_info.is_empty() {
        std::fs::write(output.with_extension("dbg"), &image.dbg_info)?;
    }

    eprintln!(
        "{}: {} code bytes, {} string bytes, {} global bytes{}",
        output.display(),
        image.executable_instr_sz,
        image.constant_strings_sz,
        image.global_var_region_sz,
        if compilation.global_region_sz != 0 {
            " (reserved at load time)"
        } else {
            ""
        },
    );
    Ok(())
}
