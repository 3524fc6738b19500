//! End-to-end compiles: source text through planning, emission,
//! resolution, and the x86-64 backend.

use davit_codegen::isa::x64::{emit_image, Alignment, Image};
use davit_codegen::{CompileFlags, CompileOptions, Context};
use std::str::FromStr;
use target_lexicon::Triple;

fn quiet(_: &str) {}

fn opts() -> CompileOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut o = CompileOptions::default();
    o.error = quiet;
    o
}

fn compile(source: &str) -> davit_codegen::Compilation {
    Context::new(opts())
        .compile(source, "test.dv")
        .expect("compile failed")
}

fn compile_with(source: &str, flags: CompileFlags) -> davit_codegen::Compilation {
    let mut o = opts();
    o.flags = flags;
    Context::new(o).compile(source, "test.dv").expect("compile failed")
}

fn image(comp: &davit_codegen::Compilation) -> Image {
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    emit_image(comp, Alignment::Compact, &triple).expect("emit failed")
}

fn find_fn<'a>(
    comp: &'a davit_codegen::Compilation,
    name: &str,
) -> (davit_codegen::lir::FuncId, &'a davit_codegen::func::FuncData) {
    comp.plan
        .funcs
        .iter()
        .find(|(_, f)| f.name == name)
        .unwrap_or_else(|| panic!("no function `{name}` in the plan"))
}

// ---- scenario: empty program body --------------------------------------

#[test]
fn empty_main() {
    let comp = compile("fn main() { }");
    assert_eq!(comp.global_region_sz, 0);
    let img = image(&comp);
    // main is a tenant of the root: its whole body is a bare RET, and
    // the root itself is just a RET. Nothing else is in the image.
    assert_eq!(img.executable_instr_sz, 2);
    assert_eq!(&img.execbin[..2], &[0xC3, 0xC3]);
    assert!(img.export_info.is_empty());
    assert!(img.import_info.is_empty());
    let (_, main) = find_fn(&comp, "main");
    assert!(main.stackframe_holder.is_some(), "main should share the root frame");
}

// ---- scenario: single recursive function -------------------------------

#[test]
fn recursive_fact_is_a_holder() {
    let comp = compile(
        "fn fact(u32 n) u32 {\n\
             if n < 2 { return 1; }\n\
             return n * fact(n - 1);\n\
         }\n\
         fn main() u32 { return fact(6); }",
    );
    let (_, fact) = find_fn(&comp, "fact");
    assert!(fact.recursive);
    assert!(fact.stackframe_holder.is_none(), "recursive functions hold their own frame");
    let img = image(&comp);
    // The self-call lowers to CALL rel32 and never needs widening: the
    // displacement fits comfortably in 32 bits.
    assert!(img.execbin[..img.executable_instr_sz as usize].contains(&0xE8));
}

// ---- scenario: nested function reads a grandparent local ---------------

#[test]
fn grandparent_access_caches_through_the_holder() {
    let comp = compile(
        "fn a() {\n\
             var uint x = 0;\n\
             fn h2() {\n\
                 fn t() { x = 1; }\n\
                 t();\n\
                 h2();\n\
             }\n\
             h2();\n\
             if x { a(); }\n\
         }\n\
         a();",
    );
    let (_, t) = find_fn(&comp, "t");
    let (h2_id, h2) = find_fn(&comp, "h2");
    // t is a tenant of h2; its level-2 read of `x` moved into h2's
    // cache, shifted to level 1.
    assert_eq!(t.stackframe_holder, Some(h2_id));
    assert!(t.cached_stackframes.is_empty());
    assert_eq!(h2.cached_stackframes, vec![1]);
    // And the whole thing still lowers.
    image(&comp);
}

// ---- scenario: shared region overflow forces a recompile ----------------

#[test]
fn shared_region_overflow_recompiles() {
    // H's address is taken, capping its frame budget. Three fat
    // tenants cannot all fit: the planner must iteratively force
    // holders until the layout fits.
    let comp = compile(
        "fn h() {\n\
             fn a() { var u8[900] buf; buf[0] = 1; }\n\
             fn b() { var u8[900] buf; buf[0] = 2; }\n\
             fn c() {\n\
                 var u8[900] buf;\n\
                 buf[0] = 3;\n\
                 a();\n\
                 b();\n\
             }\n\
             c();\n\
             a();\n\
             b();\n\
         }\n\
         var void() keep = h;\n\
         h();",
    );
    let (h_id, _) = find_fn(&comp, "h");
    // At least one of the fat functions was forced out of tenancy.
    let tenants = comp
        .plan
        .funcs
        .values()
        .filter(|f| f.stackframe_holder == Some(h_id))
        .count();
    assert!(tenants < 3, "overflow must evict at least one tenant");
    image(&comp);
}

// ---- scenario: backend branch widening ----------------------------------

#[test]
fn forward_branch_over_140_bytes_widens() {
    // The then-block holds 140 verbatim bytes, so the skip branch
    // cannot use an 8-bit displacement.
    let nops = "\\x90".repeat(140);
    let src = format!(
        "fn main() {{\n\
             var uint c = 0;\n\
             if c {{ asm(\"{nops}\"); }}\n\
         }}"
    );
    let comp = compile(&src);
    let img = image(&comp);
    let code = &img.execbin[..img.executable_instr_sz as usize];
    // The widened conditional is an inverse short branch over a near
    // jump.
    assert!(
        code.windows(2).any(|w| w[0] == 0x05 && w[1] == 0xE9)
            || code.windows(6).any(|w| w[0] == 0xE9),
        "expected a rel32 jump in the widened branch"
    );
    // Relaxation reached a fixpoint: emitting again is byte-identical.
    let img2 = image(&comp);
    assert_eq!(img.execbin, img2.execbin);
    assert_eq!(img.executable_instr_sz, img2.executable_instr_sz);
}

#[test]
fn short_branch_stays_short() {
    let comp = compile(
        "fn main() {\n\
             var uint c = 0;\n\
             if c { c = 1; }\n\
         }",
    );
    let img = image(&comp);
    let code = &img.execbin[..img.executable_instr_sz as usize];
    // A tiny then-block keeps the 8-bit form: JE rel8 appears and no
    // JMP rel32 does.
    assert!(code.windows(1).any(|w| w[0] == 0x74));
}

// ---- scenario: export and import ----------------------------------------

#[test]
fn export_entry_has_signature_and_code_offset() {
    let comp = compile("export fn foo(u32 x) u32 { return x; }");
    let img = image(&comp);
    let nul = img.export_info.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&img.export_info[..nul], b"foo(u32)");
    let off = u64::from_le_bytes(img.export_info[nul + 1..nul + 9].try_into().unwrap());
    assert!(off < img.executable_instr_sz as u64);
    assert!(img.import_info.is_empty());
}

#[test]
fn import_entry_points_into_the_string_region() {
    let comp = compile(
        "fn foo(u32 x) u32;\n\
         fn main() u32 { return foo(1); }",
    );
    let img = image(&comp);
    let nul = img.import_info.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&img.import_info[..nul], b"foo(u32)");
    let slot = u64::from_le_bytes(img.import_info[nul + 1..nul + 9].try_into().unwrap());
    // The slot is a reservation inside the string region where the
    // loader writes the resolved address.
    assert!(slot + 8 <= img.constant_strings_sz as u64);
}

#[test]
fn no_function_import_flag_rejects_undefined() {
    let mut o = opts();
    o.flags = CompileFlags::NO_FUNCTION_IMPORT;
    let r = Context::new(o).compile("fn foo(u32 x) u32;", "test.dv");
    assert!(r.is_err());
}

// ---- language smoke -----------------------------------------------------

#[test]
fn arithmetic_and_locals() {
    let comp = compile(
        "fn main() uint {\n\
             var uint a = 6;\n\
             var uint b = 7;\n\
             var uint c = a * b + (a - b) / 2;\n\
             return c;\n\
         }",
    );
    image(&comp);
}

#[test]
fn globals_live_in_the_global_region() {
    let comp = compile(
        "var uint counter = 0;\n\
         fn bump() { counter = counter + 1; }\n\
         bump();",
    );
    assert!(comp.global_region_sz >= 8);
    image(&comp);
}

#[test]
fn strings_are_pooled_and_deduplicated() {
    let comp = compile(
        "fn main() u8* {\n\
             var u8* a = \"hello\";\n\
             var u8* b = \"hello\";\n\
             var u8* c = \"world\";\n\
             return a;\n\
         }",
    );
    // "hello\0world\0"
    assert_eq!(comp.string_region, b"hello\0world\0");
    let _ = image(&comp);
}

#[test]
fn while_loops_and_goto() {
    let comp = compile(
        "fn main() uint {\n\
             var uint i = 0;\n\
             var uint sum = 0;\n\
             while i < 10 {\n\
                 sum = sum + i;\n\
                 i = i + 1;\n\
             }\n\
             again:\n\
             if sum < 100 { sum = sum + 1; goto again; }\n\
             return sum;\n\
         }",
    );
    image(&comp);
}

#[test]
fn undefined_label_is_an_error() {
    let r = Context::new(opts()).compile("fn main() { goto nowhere; }", "test.dv");
    assert!(r.is_err());
}

#[test]
fn pointers_and_byref_params() {
    let comp = compile(
        "fn store(uint* p, uint v) { *p = v; }\n\
         fn bump(uint& x) { x = x + 1; }\n\
         fn main() uint {\n\
             var uint v = 0;\n\
             store(&v, 41);\n\
             bump(v);\n\
             return v;\n\
         }",
    );
    image(&comp);
}

#[test]
fn structs_and_members() {
    let comp = compile(
        "struct pair { uint first; uint second; }\n\
         fn main() uint {\n\
             var pair p;\n\
             p.first = 1;\n\
             p.second = 2;\n\
             return p.first + p.second;\n\
         }",
    );
    image(&comp);
}

#[test]
fn call_through_function_pointer() {
    let comp = compile(
        "fn double(uint x) uint { return x + x; }\n\
         fn main() uint {\n\
             var uint(uint) f = double;\n\
             return f(21);\n\
         }",
    );
    let (_, double) = find_fn(&comp, "double");
    assert!(double.address_taken);
    assert!(double.stackframe_holder.is_none());
    image(&comp);
}

#[test]
fn page_intrinsics_lower_to_page_ops() {
    let comp = compile(
        "fn main() u8* {\n\
             var u8* p = pagealloc(2);\n\
             pagefree(p, 2);\n\
             return p;\n\
         }",
    );
    let img = image(&comp);
    let code = &img.execbin[..img.executable_instr_sz as usize];
    assert!(code.windows(2).any(|w| w == [0x0F, 0x05]), "expected syscalls");
}

#[test]
fn variadic_functions_reserve_the_full_arg_area() {
    let comp = compile(
        "fn log(u8* fmt, ...) { }\n\
         fn main() { log(\"x\", 1, 2, 3); }",
    );
    image(&comp);
}

#[test]
fn mutual_sibling_recursion_is_detected() {
    let comp = compile(
        "fn even(uint n) uint {\n\
             if n == 0 { return 1; }\n\
             return odd(n - 1);\n\
         }\n\
         fn odd(uint n) uint {\n\
             if n == 0 { return 0; }\n\
             return even(n - 1);\n\
         }\n\
         fn main() uint { return even(10); }",
    );
    let (_, even) = find_fn(&comp, "even");
    let (_, odd) = find_fn(&comp, "odd");
    assert!(even.recursive || odd.recursive);
    image(&comp);
}

#[test]
fn uncalled_nested_functions_are_pruned() {
    let comp = compile(
        "fn main() {\n\
             fn unused_helper() { }\n\
         }",
    );
    let (_, helper) = find_fn(&comp, "unused_helper");
    assert!(helper.pruned);
    let p2_helper = comp
        .module
        .funcs
        .values()
        .find(|f| f.name == "unused_helper")
        .unwrap();
    assert!(p2_helper.insts.is_empty(), "pruned bodies emit nothing");
}

#[test]
fn no_stackframe_sharing_makes_everyone_a_holder() {
    let comp = compile_with(
        "fn leaf() uint { return 3; }\n\
         fn main() uint { return leaf(); }",
        CompileFlags::NO_STACKFRAME_SHARING,
    );
    let (_, leaf) = find_fn(&comp, "leaf");
    assert!(leaf.stackframe_holder.is_none());
    image(&comp);
}

#[test]
fn comments_flag_narrates_frames() {
    let comp = compile_with(
        "fn main() { }",
        CompileFlags::COMMENT,
    );
    let has_comment = comp
        .module
        .funcs
        .values()
        .flat_map(|f| f.insts.iter())
        .any(|i| i.op == davit_codegen::lir::Opcode::Comment);
    assert!(has_comment);
    // Comments carry no bytes, so the image is unchanged by them.
    let plain = compile("fn main() { }");
    assert_eq!(
        image(&comp).executable_instr_sz,
        image(&plain).executable_instr_sz
    );
}

#[test]
fn debug_info_sections_are_well_formed() {
    let comp = compile_with(
        "fn main() uint {\n\
             var uint x = 1;\n\
             return x;\n\
         }",
        CompileFlags::GENERATE_DEBUG_INFO,
    );
    let img = image(&comp);
    assert!(!img.dbg_info.is_empty());
    let s1_len = u64::from_le_bytes(img.dbg_info[..8].try_into().unwrap()) as usize;
    assert_eq!(s1_len % 32, 0, "section 1 is an array of 4-tuples");
    // The sentinel entry sits at the end of section 1 with a zero line
    // at the end-of-code offset.
    let sentinel = &img.dbg_info[8 + s1_len - 32..8 + s1_len];
    let bin_off = u64::from_le_bytes(sentinel[..8].try_into().unwrap());
    let line = u64::from_le_bytes(sentinel[16..24].try_into().unwrap());
    assert_eq!(bin_off, img.executable_instr_sz as u64);
    assert_eq!(line, 0);
    // Section 2 holds the source path.
    let s2 = &img.dbg_info[8 + s1_len + 8..];
    assert!(s2.starts_with(b"test.dv\0"));
}

#[test]
fn capacity_error_when_a_frame_exceeds_the_page() {
    // One local bigger than a stack page can never fit.
    let r = Context::new(opts()).compile(
        "fn huge() { var u8[8000] buf; buf[0] = 1; }\n\
         fn main() { huge(); }",
        "test.dv",
    );
    assert!(matches!(r, Err(davit_codegen::CompileError::Capacity(_))));
}

#[test]
fn semantic_errors_are_reported() {
    let cases = [
        "fn main() { x = 1; }",                       // undeclared
        "fn main() { return 1; }",                    // void returns value
        "fn f(uint a) uint { return a; } fn main() { f(); }", // arity
        "fn main() { var nosuch x; }",                // unknown type
    ];
    for src in cases {
        let r = Context::new(opts()).compile(src, "test.dv");
        assert!(r.is_err(), "expected error for: {src}");
    }
}
