//! The planner: between the two analyzer passes it settles every
//! cross-function layout decision, and after pass 2 it sizes frames and
//! decides whether a recompile is needed.
//!
//! Planning order matters and follows the pipeline contract:
//!
//! 1. resolve propagation entries (function → variable);
//! 2. detect sibling-cycle recursion, then prune uncalled functions;
//! 3. elect stackframe holders and run the holder-propagation fixpoint;
//! 4. assign tenants to non-conflicting shared regions;
//! 5. canonicalize cached-stackframe chains;
//! 6. (after pass 2) size frames and shared regions; an overflowing
//!    holder forces its largest tenant into the persistent must-hold
//!    set and the whole compile restarts from pass 1.

use crate::error::{CompileError, CompileResult};
use crate::func::{Module, Propagation, SharedRegion};
use crate::lir::{FuncId, Inst, Opcode};
use crate::settings::{
    CompileFlags, CompileOptions, MAX_ARG_USAGE, MAX_STACKFRAME_PTR_CACHE_SIZE, MAX_STACK_USAGE,
    PAGE_SIZE,
};
use log::{debug, trace};
use rustc_hash::FxHashSet;

/// Run the planning steps on the pass-1 module.
pub fn plan(module: &mut Module, _opts: &CompileOptions) -> CompileResult<()> {
    resolve_propagations(module);
    detect_recursion(module);
    prune_uncalled(module);
    elect_holders(module);
    assign_tenancy(module);
    canonicalize_caches(module);
    Ok(())
}

/// Is `f` a stackframe holder? The root always holds; so do recursive
/// and address-taken functions, and anything a previous round or the
/// holder fixpoint marked.
fn is_holder(module: &Module, f: FuncId) -> bool {
    if module.is_root(f) {
        return true;
    }
    let fd = &module.funcs[f];
    fd.recursive || fd.address_taken || fd.could_not_get_holder
}

// ---- 1. propagation resolution -----------------------------------------

/// Replace (without deleting) every `Propagation::Function` entry by the
/// variable entries reachable from it. A function whose address is taken
/// additionally publishes its variable entries to the root function, the
/// stand-in callee for calls through pointers.
fn resolve_propagations(module: &mut Module) {
    let funcs: Vec<FuncId> = module.funcs.keys().collect();
    for &f in funcs.iter().skip(1) {
        let mut in_flight = FxHashSet::default();
        resolve_into(module, f, f, &mut in_flight);
        if module.funcs[f].address_taken {
            publish_to_root(module, f);
        }
    }
}

/// Copy every variable entry reachable from `f`'s list into `initial`,
/// skipping entries local to `initial` and duplicates. `in_flight`
/// breaks propagation cycles. Entries appended to `initial`'s own list
/// while it is being walked are variable entries and re-walk harmlessly.
fn resolve_into(
    module: &mut Module,
    f: FuncId,
    initial: FuncId,
    in_flight: &mut FxHashSet<FuncId>,
) {
    if !in_flight.insert(f) {
        return;
    }
    let mut idx = 0;
    while idx < module.funcs[f].propagations.len() {
        let entry = module.funcs[f].propagations[idx].clone();
        idx += 1;
        match entry {
            Propagation::Function(g) => {
                resolve_into(module, g, initial, in_flight);
            }
            Propagation::Variable { owner, .. } => {
                if f != initial && owner != initial {
                    let props = &mut module.funcs[initial].propagations;
                    if !props.contains(&entry) {
                        props.push(entry);
                    }
                }
            }
        }
    }
    in_flight.remove(&f);
}

fn publish_to_root(module: &mut Module, f: FuncId) {
    let root = module.root();
    let entries: Vec<Propagation> = module.funcs[f]
        .propagations
        .iter()
        .filter(|p| matches!(p, Propagation::Variable { .. }))
        .cloned()
        .collect();
    for entry in entries {
        let props = &mut module.funcs[root].propagations;
        if !props.contains(&entry) {
            props.push(entry);
        }
    }
}

// ---- 2. recursion detection and pruning --------------------------------

/// Mark self- and sibling-cycle recursion, removing the self-call
/// counts from `times_called` so pruning is not fooled by a function
/// keeping itself alive.
fn detect_recursion(module: &mut Module) {
    let funcs: Vec<FuncId> = module.funcs.keys().skip(1).collect();
    for &f in &funcs {
        // Direct recursion: a call entry on itself.
        let self_count = module.funcs[f]
            .called_functions
            .iter_mut()
            .find(|c| c.callee == f)
            .map(|c| std::mem::take(&mut c.count))
            .unwrap_or(0);
        if self_count > 0 {
            let fd = &mut module.funcs[f];
            fd.recursive = true;
            fd.times_called = fd.times_called.saturating_sub(self_count);
        }
    }
    for &f in &funcs {
        if module.funcs[f].recursive {
            continue;
        }
        // A sibling cycle: f calls a sibling that calls f back.
        let parent = module.funcs[f].parent;
        let callees: Vec<FuncId> = module.funcs[f]
            .called_functions
            .iter()
            .map(|c| c.callee)
            .collect();
        for sib in callees {
            if module.funcs[sib].parent != parent || sib == f {
                continue;
            }
            let back = module.funcs[sib]
                .called_functions
                .iter_mut()
                .find(|c| c.callee == f)
                .map(|c| std::mem::take(&mut c.count))
                .unwrap_or(0);
            if back > 0 {
                debug!("{f} is recursive through sibling {sib}");
                let fd = &mut module.funcs[f];
                fd.recursive = true;
                fd.times_called = fd.times_called.saturating_sub(back);
                break;
            }
        }
    }
}

/// Is `f` exempt from pruning even when nothing calls it? Root-level
/// functions are externally callable through the image layout, and
/// address-taken functions may be called through any pointer.
fn prune_exempt(module: &Module, f: FuncId) -> bool {
    let fd = &module.funcs[f];
    fd.parent == Some(module.root()) || fd.address_taken || fd.exported
}

/// Drop functions that are never called, cascading: pruning a caller
/// releases its callees' counts, which may zero them in turn.
fn prune_uncalled(module: &mut Module) {
    loop {
        let victim = module
            .funcs
            .keys()
            .skip(1)
            .find(|&f| {
                let fd = &module.funcs[f];
                !fd.pruned && fd.times_called == 0 && !prune_exempt(module, f)
            });
        let Some(f) = victim else { break };
        trace!("pruning uncalled {f}");
        prune_subtree(module, f);
    }
}

fn prune_subtree(module: &mut Module, f: FuncId) {
    if module.funcs[f].pruned {
        return;
    }
    module.funcs[f].pruned = true;
    let children = module.funcs[f].children.clone();
    for c in children {
        prune_subtree(module, c);
    }
    let calls: Vec<(FuncId, u32)> = module.funcs[f]
        .called_functions
        .iter()
        .map(|c| (c.callee, c.count))
        .collect();
    for (callee, count) in calls {
        let cd = &mut module.funcs[callee];
        cd.times_called = cd.times_called.saturating_sub(count);
    }
}

// ---- 3. holder election ------------------------------------------------

/// Holder propagation: when a holder calls a non-holder outside its own
/// subtree, and that callee can reach another holder through its calls,
/// the whole chain must hold its own frames on the next round —
/// otherwise the stack pointer, backtracked into a shared region, would
/// be clobbered by the inner holder's frame.
fn elect_holders(module: &mut Module) {
    loop {
        let mut changed = false;
        let funcs: Vec<FuncId> = module.funcs.keys().collect();
        for &f in &funcs {
            if module.funcs[f].pruned || !is_holder(module, f) {
                continue;
            }
            let callees: Vec<FuncId> = module.funcs[f]
                .called_functions
                .iter()
                .map(|c| c.callee)
                .collect();
            for g in callees {
                if module.funcs[g].pruned
                    || is_holder(module, g)
                    || module.level_to(g, f).is_some()
                {
                    continue;
                }
                let mut visited = FxHashSet::default();
                if chain_reaches_holder(module, g, &mut visited, &mut changed) {
                    if !module.funcs[g].could_not_get_holder {
                        debug!("{g} forced to hold its own frame");
                        module.funcs[g].could_not_get_holder = true;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Does any call chain out of `f` reach a holder? Marks the interior of
/// every such chain `could_not_get_holder` on the way back out.
fn chain_reaches_holder(
    module: &mut Module,
    f: FuncId,
    visited: &mut FxHashSet<FuncId>,
    changed: &mut bool,
) -> bool {
    if !visited.insert(f) {
        return false;
    }
    let callees: Vec<FuncId> = module.funcs[f]
        .called_functions
        .iter()
        .map(|c| c.callee)
        .collect();
    let mut reaches = false;
    for g in callees {
        if module.funcs[g].pruned {
            continue;
        }
        if is_holder(module, g) {
            reaches = true;
        } else if chain_reaches_holder(module, g, visited, changed) {
            if !module.funcs[g].could_not_get_holder {
                module.funcs[g].could_not_get_holder = true;
                *changed = true;
            }
            reaches = true;
        }
    }
    reaches
}

// ---- 4. tenancy assignment ---------------------------------------------

/// Give every non-holder a home: find its nearest holder ancestor,
/// shift its cached-stackframe levels into the holder, and place it in
/// the first shared region whose members it never calls and is never
/// called by.
fn assign_tenancy(module: &mut Module) {
    let funcs: Vec<FuncId> = module.funcs.keys().skip(1).collect();
    for &f in &funcs {
        if module.funcs[f].pruned || is_holder(module, f) {
            continue;
        }
        let mut holder = module.funcs[f].parent.expect("non-root without parent");
        let mut level = 1u32;
        while !is_holder(module, holder) {
            holder = module.funcs[holder].parent.expect("chain ends at root");
            level += 1;
        }
        module.funcs[f].stackframe_holder = Some(holder);

        let cached = std::mem::take(&mut module.funcs[f].cached_stackframes);
        for l in cached {
            if l > level {
                module.funcs[holder].cache_stackframe(l - level);
            }
        }

        // First region with no call path between f and any member, in
        // either direction.
        let regions = module.funcs[holder].shared_regions.clone();
        let mut placed = false;
        for r in regions {
            let members = module.regions[r].members.clone();
            let conflict = members.iter().any(|&m| {
                module.transitively_calls(f, m) || module.transitively_calls(m, f)
            });
            if !conflict {
                module.regions[r].members.push(f);
                module.funcs[f].shared_region_to_use = Some(r);
                placed = true;
                trace!("{f} shares region {r} of {holder}");
                break;
            }
        }
        if !placed {
            let r = module.regions.push(SharedRegion {
                members: vec![f],
                offset: 0,
            });
            module.funcs[holder].shared_regions.push(r);
            module.funcs[f].shared_region_to_use = Some(r);
            trace!("{f} opens region {r} of {holder}");
        }
    }
}

// ---- 5. cache canonicalization -----------------------------------------

/// Rewrite holders' cached-stackframe lists so no entry lands on a
/// tenant: a tenant's frame is found through its holder, so the cache
/// keeps the holder's frame pointer instead, at the adjusted level.
fn canonicalize_caches(module: &mut Module) {
    let funcs: Vec<FuncId> = module.funcs.keys().skip(1).collect();
    for &f in &funcs {
        if module.funcs[f].pruned || !is_holder(module, f) {
            continue;
        }
        let levels = std::mem::take(&mut module.funcs[f].cached_stackframes);
        for l in levels {
            let mut level = l;
            let mut anc = module
                .ancestor_at(f, l)
                .expect("cached level beyond the root");
            // Climb until the ancestor holds its own frame.
            while module.funcs[anc].stackframe_holder.is_some() {
                level += 1;
                anc = module.funcs[anc].parent.expect("tenant without parent");
            }
            module.funcs[f].cache_stackframe(level);
        }
    }
}

// ---- 6. frame sizing and the recompile decision ------------------------

fn align_up(n: u32, to: u32) -> u32 {
    (n + to - 1) & !(to - 1)
}

/// The argument-area bytes of a pass-2 function.
fn arg_area(p2: &Module, f: FuncId) -> u32 {
    let fd = &p2.funcs[f];
    if fd.variadic {
        return MAX_ARG_USAGE;
    }
    fd.args
        .last()
        .map(|&a| {
            let v = &p2.vars[a];
            v.offset + v.size
        })
        .unwrap_or(0)
}

/// Size every frame and shared region. On success returns `None`; when
/// a holder's shared area exceeds its budget, returns the `ast_id` of
/// the largest tenant, which the next round must force into holding its
/// own frame.
pub fn finish_frames(
    p2: &mut Module,
    p1: &mut Module,
    opts: &CompileOptions,
) -> CompileResult<Option<u32>> {
    let g = opts.sizeof_gpr;

    // Local areas align to the GPR size, or the stack pointer drifts
    // off alignment at run time.
    for fd in p2.funcs.values_mut() {
        fd.local_vars_max_size = align_up(fd.local_vars_max_size, g);
    }

    let funcs: Vec<FuncId> = p2.funcs.keys().collect();
    for &f in &funcs {
        let Some(p1f) = p2.funcs[f].firstpass else {
            continue;
        };
        if p1.funcs[p1f].pruned {
            continue;
        }

        let cache_size = p1.funcs[p1f].cached_stackframes.len() as u32 * g;
        if cache_size > MAX_STACKFRAME_PTR_CACHE_SIZE {
            return Err(capacity_error(
                p2,
                opts,
                f,
                "stackframe pointer cache exceeds its limit",
            ));
        }
        p2.funcs[f].stackframe_ptr_cache_size = cache_size;

        // Frame usage assuming the function holds its own frame; the
        // shared area comes on top of this.
        let u = if p2.is_root(f) {
            0
        } else {
            let raw = 7 * g + cache_size + p2.funcs[f].local_vars_max_size + arg_area(p2, f);
            align_up(raw, g)
        };

        let limit = if p1.funcs[p1f].address_taken {
            MAX_STACK_USAGE
        } else {
            PAGE_SIZE - g
        };
        if u > limit {
            let over = u - limit;
            return Err(capacity_error(
                p2,
                opts,
                f,
                &format!("function stack usage exceeds its limit by {over} bytes"),
            ));
        }
        let available = limit - u;

        if p1.funcs[p1f].stackframe_holder.is_none() {
            p2.funcs[f].stack_usage = u;
        }

        // Shared regions: each region is as large as its largest
        // member's tiny frame, and regions stack downward from the
        // holder's frame base.
        let regions = p1.funcs[p1f].shared_regions.clone();
        if regions.is_empty() {
            continue;
        }
        let mut total = 0u32;
        let mut largest: Option<(u32, FuncId)> = None;
        for r in regions {
            let mut region_size = 0u32;
            let members = p1.regions[r].members.clone();
            for m in members {
                let Some(m2) = p1.funcs[m].secondpass else {
                    continue;
                };
                let mut tiny = 2 * g + p2.funcs[m2].local_vars_max_size + arg_area(p2, m2);
                if p2.funcs[m2].returns_value() {
                    tiny += g;
                }
                p2.funcs[m2].stack_usage = tiny;
                region_size = region_size.max(tiny);
                if largest.map(|(s, _)| tiny > s).unwrap_or(true) {
                    largest = Some((tiny, m2));
                }
            }
            let region_size = align_up(region_size, g);
            total += region_size;
            // The stored offset is the distance from the holder's frame
            // base down to the region's base.
            p1.regions[r].offset = total;
        }
        p2.funcs[f].shared_region_size = total;

        if total > available {
            let (_, tenant) = largest.expect("overflowing shared area with no members");
            let ast_id = p2.funcs[tenant].ast_id;
            debug!(
                "shared area of {f} needs {total} bytes but only {available} fit; \
                 forcing {tenant} to hold its own frame"
            );
            return Ok(Some(ast_id));
        }
    }

    if opts.flags.contains(CompileFlags::COMMENT) {
        narrate_frames(p2, p1);
    }
    Ok(None)
}

fn capacity_error(
    p2: &Module,
    opts: &CompileOptions,
    f: FuncId,
    msg: &str,
) -> CompileError {
    let loc = &p2.funcs[f].start_loc;
    let rendered = format!("{loc}: {msg}");
    (opts.error)(&rendered);
    CompileError::Capacity(rendered)
}

/// Append frame narration comments to each function's instruction
/// stream. Appending keeps every existing instruction index stable.
fn narrate_frames(p2: &mut Module, p1: &Module) {
    let funcs: Vec<FuncId> = p2.funcs.keys().collect();
    for &f in &funcs {
        let Some(p1f) = p2.funcs[f].firstpass else {
            continue;
        };
        if p1.funcs[p1f].pruned || p2.funcs[f].insts.is_empty() {
            continue;
        }
        let text = match p1.funcs[p1f].stackframe_holder {
            None => format!(
                "stackframe size: {}+(sharedregion: {})",
                p2.funcs[f].stack_usage, p2.funcs[f].shared_region_size
            ),
            Some(h) => {
                let region = p1.funcs[p1f]
                    .shared_region_to_use
                    .map(|r| p1.regions[r].offset)
                    .unwrap_or(0);
                let holder_sig = p1.funcs[h]
                    .secondpass
                    .map(|h2| p2.funcs[h2].linking_signature.clone())
                    .unwrap_or_default();
                format!(
                    "stackframe size: {}; holder: {holder_sig}; region offset: {region}",
                    p2.funcs[f].stack_usage
                )
            }
        };
        let mut inst = Inst::new(Opcode::Comment);
        inst.text = Some(text.into_boxed_str());
        p2.funcs[f].insts.push(inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::CalledFunction;

    fn add_fn(m: &mut Module, parent: FuncId, name: &str) -> FuncId {
        let f = m.funcs.push(crate::func::FuncData::new(Some(parent), name, 0));
        m.funcs[parent].children.push(f);
        f
    }

    #[test]
    fn root_is_always_a_holder() {
        let m = Module::new();
        assert!(is_holder(&m, m.root()));
    }

    #[test]
    fn recursive_and_address_taken_hold() {
        let mut m = Module::new();
        let root = m.root();
        let a = add_fn(&mut m, root, "a");
        let b = add_fn(&mut m, root, "b");
        let c = add_fn(&mut m, root, "c");
        m.funcs[a].recursive = true;
        m.funcs[b].address_taken = true;
        assert!(is_holder(&m, a));
        assert!(is_holder(&m, b));
        assert!(!is_holder(&m, c));
    }

    #[test]
    fn sibling_cycle_marks_recursive() {
        let mut m = Module::new();
        let root = m.root();
        let a = add_fn(&mut m, root, "a");
        let b = add_fn(&mut m, root, "b");
        m.funcs[a].called_functions.push(CalledFunction { callee: b, count: 1 });
        m.funcs[b].called_functions.push(CalledFunction { callee: a, count: 1 });
        m.funcs[a].times_called = 1;
        m.funcs[b].times_called = 1;
        detect_recursion(&mut m);
        assert!(m.funcs[a].recursive || m.funcs[b].recursive);
    }

    #[test]
    fn pruning_cascades() {
        let mut m = Module::new();
        let root = m.root();
        let outer = add_fn(&mut m, root, "outer");
        // A helper nested inside `outer`, called only by an uncalled
        // nested sibling.
        let caller = add_fn(&mut m, outer, "caller");
        let helper = add_fn(&mut m, outer, "helper");
        m.funcs[outer].times_called = 1;
        m.funcs[caller].times_called = 0;
        m.funcs[helper].times_called = 2;
        m.funcs[caller]
            .called_functions
            .push(CalledFunction { callee: helper, count: 2 });
        prune_uncalled(&mut m);
        assert!(m.funcs[caller].pruned);
        assert!(m.funcs[helper].pruned, "cascade should reach the helper");
        assert!(!m.funcs[outer].pruned);
    }

    #[test]
    fn mutually_calling_tenants_get_distinct_regions() {
        let mut m = Module::new();
        let root = m.root();
        let h = add_fn(&mut m, root, "h");
        m.funcs[h].recursive = true; // holder
        let a = add_fn(&mut m, h, "a");
        let b = add_fn(&mut m, h, "b");
        m.funcs[a].times_called = 1;
        m.funcs[b].times_called = 1;
        m.funcs[h].times_called = 1;
        m.funcs[a].called_functions.push(CalledFunction { callee: b, count: 1 });
        assign_tenancy(&mut m);
        let ra = m.funcs[a].shared_region_to_use.unwrap();
        let rb = m.funcs[b].shared_region_to_use.unwrap();
        assert_ne!(ra, rb, "a calls b; they must not share a region");
        assert_eq!(m.funcs[a].stackframe_holder, Some(h));
        assert_eq!(m.funcs[b].stackframe_holder, Some(h));
    }

    #[test]
    fn independent_tenants_share_a_region() {
        let mut m = Module::new();
        let root = m.root();
        let h = add_fn(&mut m, root, "h");
        m.funcs[h].recursive = true;
        let a = add_fn(&mut m, h, "a");
        let b = add_fn(&mut m, h, "b");
        m.funcs[a].times_called = 1;
        m.funcs[b].times_called = 1;
        m.funcs[h].times_called = 1;
        assign_tenancy(&mut m);
        assert_eq!(
            m.funcs[a].shared_region_to_use,
            m.funcs[b].shared_region_to_use
        );
    }

    #[test]
    fn tenant_cache_levels_shift_to_holder() {
        let mut m = Module::new();
        let root = m.root();
        let top = add_fn(&mut m, root, "top");
        m.funcs[top].recursive = true; // holder
        let mid = add_fn(&mut m, top, "mid");
        let leaf = add_fn(&mut m, mid, "leaf");
        m.funcs[top].times_called = 1;
        m.funcs[mid].times_called = 1;
        m.funcs[leaf].times_called = 1;
        // leaf reads a variable two levels up (in `top`).
        m.funcs[leaf].cache_stackframe(2);
        assign_tenancy(&mut m);
        // leaf's nearest holder is `top` at level 2; level 2 shifted by
        // 2 disappears (the holder itself), leaving no cache entries.
        assert!(m.funcs[leaf].cached_stackframes.is_empty());
        assert!(m.funcs[top].cached_stackframes.is_empty());

        // A deeper read, three levels up from leaf, lands in the
        // holder's cache at level 1.
        let mut m2 = Module::new();
        let root2 = m2.root();
        let outer = add_fn(&mut m2, root2, "outer");
        let top2 = add_fn(&mut m2, outer, "top2");
        m2.funcs[top2].recursive = true;
        let mid2 = add_fn(&mut m2, top2, "mid2");
        let leaf2 = add_fn(&mut m2, mid2, "leaf2");
        for f in [outer, top2, mid2, leaf2] {
            m2.funcs[f].times_called = 1;
        }
        m2.funcs[leaf2].cache_stackframe(3); // reads `outer`
        assign_tenancy(&mut m2);
        assert_eq!(m2.funcs[top2].cached_stackframes, vec![1]);
    }
}
