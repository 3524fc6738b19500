//! The compile context: drives the passes, the planner, and the
//! recompile loop, and owns everything a compile allocates.
//!
//! Dropping a `Context` (or an intermediate pass-2 module on recompile)
//! releases every allocation of the corresponding phase; dropping the
//! returned [`Compilation`] releases the rest. Extraction of the result
//! out of the context is a move.

use crate::analyzer;
use crate::error::{CompileError, CompileResult};
use crate::frontend;
use crate::func::Module;
use crate::lir::resolver;
use crate::planner;
use crate::settings::CompileOptions;
use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};

/// The product of a successful compile: resolved LIR plus the data the
/// backend needs to lay out an image.
pub struct Compilation {
    /// The pass-2 module: functions with resolved instruction streams.
    pub module: Module,
    /// The pass-1 module, kept for its planning data (regions,
    /// holder/tenant assignments); useful to inspect and test against.
    pub plan: Module,
    /// Initial contents of the string region.
    pub string_region: Vec<u8>,
    /// Bytes the loader must reserve for global variables.
    pub global_region_sz: u32,
    /// Newline-separated source paths; the last is NUL-terminated.
    pub src_file_paths: String,
    /// GPR size the compile targeted; backends check it against their
    /// hardware.
    pub sizeof_gpr: u32,
}

/// Per-compile state. One context compiles one program.
pub struct Context {
    /// The options this context compiles with.
    pub opts: CompileOptions,
}

impl Context {
    /// A context with the given options.
    pub fn new(opts: CompileOptions) -> Self {
        Self { opts }
    }

    /// Compile `source`. On any failure the diagnostic callback has
    /// already been invoked with a rendered message and the error is
    /// returned; nothing allocated for the failed compile survives.
    pub fn compile(&self, source: &str, src_path: &str) -> CompileResult<Compilation> {
        if let Err(msg) = self.opts.validate() {
            (self.opts.error)(&msg);
            return Err(CompileError::InvalidOptions(msg));
        }
        if source.is_empty() {
            let msg = "source is empty".to_string();
            (self.opts.error)(&msg);
            return Err(CompileError::InvalidOptions(msg));
        }

        let macros: FxHashMap<String, String> = self
            .opts
            .predeclared_macros
            .iter()
            .map(|m| (m.name.clone(), m.content.clone()))
            .collect();
        let program = match frontend::parse_source(source, &macros) {
            Ok(p) => p,
            Err(e) => {
                (self.opts.error)(&e.to_string());
                return Err(e);
            }
        };

        // ast_ids of functions that must hold their own frame. The set
        // only grows, which bounds the recompile loop.
        let mut forced: FxHashSet<u32> = FxHashSet::default();
        loop {
            let mut p1 = analyzer::run_pass1(&program, &self.opts, &forced, src_path, source)?;
            planner::plan(&mut p1, &self.opts)?;
            let (mut p2, strings) =
                analyzer::run_pass2(&program, &self.opts, &mut p1, src_path, source)?;
            match planner::finish_frames(&mut p2, &mut p1, &self.opts)? {
                Some(ast_id) => {
                    // The pass-2 module and string pool drop here; the
                    // next round rebuilds both from pass 1.
                    if !forced.insert(ast_id) {
                        let msg = format!(
                            "{src_path}: shared regions cannot fit even after forcing \
                             every candidate to hold its own stackframe"
                        );
                        (self.opts.error)(&msg);
                        return Err(CompileError::Capacity(msg));
                    }
                    debug!("recompiling with {} forced holder(s)", forced.len());
                    continue;
                }
                None => {
                    resolver::resolve(&mut p2, &p1, self.opts.bitsizeof_gpr());
                    let root = p2.root();
                    let global_region_sz = p2.funcs[root].local_vars_max_size;
                    info!(
                        "compiled {} function(s), {} bytes of strings, {} bytes of globals",
                        p2.funcs.len(),
                        strings.bytes.len(),
                        global_region_sz
                    );
                    return Ok(Compilation {
                        module: p2,
                        plan: p1,
                        string_region: strings.bytes,
                        global_region_sz,
                        src_file_paths: format!("{src_path}\0"),
                        sizeof_gpr: self.opts.sizeof_gpr,
                    });
                }
            }
        }
    }
}
