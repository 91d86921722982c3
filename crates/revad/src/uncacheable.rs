//! The cacheability analyzer: which loads may observe memory that
//! changes between the forward and the reverse pass (`can_modref`), and
//! which pointer arguments of each call site may do so inside the callee
//! (`uncacheable_args`).
//!
//! Both passes classify the underlying object of the pointer first, then
//! scan every instruction that does not dominate the access: dominance
//! is the cheap before-or-after proxy, anything not dominating is
//! treated as possibly executing after the access.

use ahash::AHashMap;
use cranelift_entity::SecondaryMap;
use lir::{DominatorTree, Function, Inst, InstructionData, Opcode};
use tracing::trace;

use crate::alias::{AliasInfo, MemLoc, ObjOrigin};
use crate::{classify_callee, KnownCallee};

/// Per-load: may the loaded memory be written between this load and its
/// reverse-pass use? `true` means the load must be tape-cached.
pub type CanModRef = SecondaryMap<Inst, bool>;

/// Per call site: for each callee formal, is the memory behind the
/// argument uncacheable inside the callee?
pub type UncacheableArgs = AHashMap<Inst, Vec<bool>>;

/// The default cacheability of a pointer by the origin of its underlying
/// object. `uncacheable_args` is the map inherited from the caller.
fn default_uncacheable(
    func: &Function,
    alias: &mut AliasInfo,
    ptr: lir::Value,
    inherited: &[bool],
) -> bool {
    match alias.classify(func, ptr) {
        ObjOrigin::Arg(idx) => inherited.get(idx).copied().unwrap_or(true),
        ObjOrigin::Alloc(_) => false,
        ObjOrigin::OtherCall(_) => true,
        ObjOrigin::LoadedFrom(_) => true,
        ObjOrigin::Global(_) => true,
        ObjOrigin::Opaque => true,
    }
}

/// Is `inst` exempt from the interference scan (allocation/free calls
/// have no caller-visible writes)?
fn exempt(func: &Function, inst: Inst) -> bool {
    if let InstructionData::Call { .. } = func.dfg[inst] {
        let sig = func.dfg.call_signature(inst).unwrap();
        matches!(classify_callee(&sig.name), KnownCallee::Alloc | KnownCallee::Dealloc)
    } else {
        false
    }
}

/// Compute `can_modref` for every load of `func`.
pub fn uncacheable_loads(
    func: &Function,
    domtree: &DominatorTree,
    alias: &mut AliasInfo,
    inherited: &[bool],
) -> CanModRef {
    let mut can_modref: CanModRef = SecondaryMap::new();

    let insts: Vec<Inst> = func
        .layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block).collect::<Vec<_>>())
        .collect();

    for &load in &insts {
        let ptr = match func.dfg[load] {
            InstructionData::UnaryTy { op: Opcode::Load, arg, .. } => arg,
            _ => continue,
        };

        let mut uncacheable = default_uncacheable(func, alias, ptr, inherited);

        if !uncacheable {
            for &other in &insts {
                if other == load || exempt(func, other) {
                    continue;
                }
                // Anything that does not dominate the load may run after
                // it, between the forward and the reverse pass.
                if domtree.inst_dominates(func, other, load) {
                    continue;
                }
                if alias.may_modify(func, other, MemLoc::new(ptr)) {
                    uncacheable = true;
                    break;
                }
            }
        }

        if uncacheable {
            trace!("load {} is uncacheable", func.dfg.display_inst(load));
        }
        can_modref[load] = uncacheable;
    }

    can_modref
}

/// Compute the uncacheable-argument map of every call site of `func`,
/// keyed by the callee's formal parameters.
pub fn uncacheable_call_args(
    func: &Function,
    domtree: &DominatorTree,
    alias: &mut AliasInfo,
    inherited: &[bool],
) -> UncacheableArgs {
    let mut result = UncacheableArgs::new();

    let insts: Vec<Inst> = func
        .layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block).collect::<Vec<_>>())
        .collect();

    for &call in &insts {
        if !matches!(func.dfg[call], InstructionData::Call { .. }) {
            continue;
        }
        let args: Vec<lir::Value> = func.dfg.inst_args(call).to_vec();
        let mut safe: Vec<bool> = Vec::with_capacity(args.len());

        for &arg in &args {
            if !func.dfg.value_ty(arg).is_ptr() {
                safe.push(true);
                continue;
            }
            safe.push(!default_uncacheable(func, alias, arg, inherited));
        }

        for &other in &insts {
            if other == call {
                continue;
            }
            if domtree.inst_dominates(func, other, call) {
                continue;
            }
            let is_store = matches!(
                func.dfg[other],
                InstructionData::Binary { op: Opcode::Store, .. }
                    | InstructionData::Ternary {
                        op: Opcode::Memcpy | Opcode::Memmove | Opcode::Memset,
                        ..
                    }
            );
            let is_writing_call =
                matches!(func.dfg[other], InstructionData::Call { .. }) && !exempt(func, other);
            if !is_store && !is_writing_call {
                continue;
            }
            for (idx, &arg) in args.iter().enumerate() {
                if !safe[idx] || !func.dfg.value_ty(arg).is_ptr() {
                    continue;
                }
                if alias.may_modify(func, other, MemLoc::for_call_arg(func, call, idx)) {
                    safe[idx] = false;
                }
            }
        }

        result.insert(call, safe.iter().map(|s| !s).collect());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use lir::{ControlFlowGraph, DominatorTree, Inst};
    use lir_reader::parse_function;

    fn analyze(src: &str, inherited: &[bool]) -> (lir::Function, CanModRef, UncacheableArgs) {
        let func = parse_function(src).unwrap();
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let mut alias = AliasInfo::analyze(&func);
        let loads = uncacheable_loads(&func, &domtree, &mut alias, inherited);
        let args = uncacheable_call_args(&func, &domtree, &mut alias, inherited);
        (func, loads, args)
    }

    #[test]
    fn later_store_taints_earlier_load() {
        let (_, loads, _) = analyze(
            "function %f(ptr, ptr) -> f64 {\n\
             block0(v0: ptr, v1: ptr):\n\
                 v2 = load.f64 v0\n\
                 store v2, v1\n\
                 v3 = load.f64 v0\n\
                 ret v3\n\
             }\n",
            &[false, false],
        );
        // The store may alias v0 and does not dominate the first load.
        assert!(loads[Inst::from(0usize)]);
        // It dominates the second load, which stays cacheable.
        assert!(!loads[Inst::from(2usize)]);
    }

    #[test]
    fn allocations_are_exempt() {
        let (_, loads, _) = analyze(
            "function %f(ptr) -> f64 {\n\
                 fn0 = %malloc(i64) -> ptr\n\
             block0(v0: ptr):\n\
                 v1 = load.f64 v0\n\
                 v2 = iconst.i64 8\n\
                 v3 = call fn0(v2)\n\
                 ret v1\n\
             }\n",
            &[false],
        );
        assert!(!loads[Inst::from(0usize)]);
    }

    #[test]
    fn inherited_uncacheable_arguments_propagate() {
        let (_, loads, _) = analyze(
            "function %f(ptr) -> f64 {\n\
             block0(v0: ptr):\n\
                 v1 = load.f64 v0\n\
                 ret v1\n\
             }\n",
            &[true],
        );
        assert!(loads[Inst::from(0usize)]);
    }

    #[test]
    fn call_argument_safety() {
        let (func, _, args) = analyze(
            "function %f(ptr, ptr) -> f64 {\n\
                 fn0 = %g(ptr) -> f64\n\
             block0(v0: ptr, v1: ptr):\n\
                 v2 = call fn0(v0)\n\
                 v3 = fconst.f64 1.0\n\
                 store v3, v1\n\
                 ret v2\n\
             }\n",
            &[false, false],
        );
        let call = func
            .layout
            .blocks()
            .flat_map(|b| func.layout.block_insts(b).collect::<Vec<_>>())
            .find(|inst| func.dfg[*inst].opcode() == Opcode::Call)
            .unwrap();
        // The store after the call may alias the argument.
        assert_eq!(args[&call], vec![true]);
    }
}
